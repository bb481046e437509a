use std::{io, mem, os::fd::RawFd, time::Duration};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::warn;

/// One ready descriptor reported by a [`Dispatcher::wait`] call.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
}

/// Readiness multiplexing capability used by the network thread.
///
/// All calls happen on the network thread; implementations are not
/// thread-safe beyond being movable into it. `wait` returns after at most
/// `timeout` even with no events so the caller can run periodic maintenance.
pub trait Dispatcher: Send {
    fn register(&mut self, fd: RawFd) -> io::Result<()>;
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;
    /// Collects ready descriptors into `ready` (cleared first).
    fn wait(&mut self, timeout: Duration, ready: &mut Vec<Readiness>) -> io::Result<()>;
}

/// Which multiplexing primitive to drive the network thread with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatcherKind {
    /// `mio::Poll` (epoll/kqueue underneath).
    #[default]
    Poll,
    /// `select(2)` bitset scan; portable fallback, `FD_SETSIZE`-bound.
    Select,
}

impl DispatcherKind {
    pub fn create(self) -> io::Result<Box<dyn Dispatcher>> {
        match self {
            Self::Poll => Ok(Box::new(PollDispatcher::new()?)),
            Self::Select => Ok(Box::new(SelectDispatcher::new())),
        }
    }
}

/// `mio::Poll`-backed dispatcher. Readiness is edge-style, so receive paths
/// must drain their socket until `WouldBlock`.
pub struct PollDispatcher {
    poll: Poll,
    events: Events,
}

impl PollDispatcher {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(256) })
    }
}

impl Dispatcher for PollDispatcher {
    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE,
        )
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, timeout: Duration, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for ev in &self.events {
            ready.push(Readiness { fd: ev.token().0 as RawFd, readable: ev.is_readable() });
        }
        Ok(())
    }
}

/// `select(2)` dispatcher: a registered-fd list rebuilt into an `fd_set` per
/// wait. Level-triggered, O(max_fd) scan.
#[derive(Default)]
pub struct SelectDispatcher {
    fds: Vec<RawFd>,
}

impl SelectDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for SelectDispatcher {
    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} outside select() range"),
            ));
        }
        if !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|&f| f != fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let mut set = unsafe { mem::zeroed::<libc::fd_set>() };
        let mut max_fd = 0;
        for &fd in &self.fds {
            unsafe { libc::FD_SET(fd, &mut set) };
            max_fd = max_fd.max(fd);
        }
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n > 0 {
            for &fd in &self.fds {
                if unsafe { libc::FD_ISSET(fd, &set) } {
                    ready.push(Readiness { fd, readable: true });
                }
            }
        }
        Ok(())
    }
}

/// Dispatcher that tracks registrations and never reports events. Test use.
#[derive(Default)]
pub struct NullDispatcher {
    pub registered: Vec<RawFd>,
}

impl Dispatcher for NullDispatcher {
    fn register(&mut self, fd: RawFd) -> io::Result<()> {
        self.registered.push(fd);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds_retain(fd);
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();
        Ok(())
    }
}

impl NullDispatcher {
    fn fds_retain(&mut self, fd: RawFd) {
        self.registered.retain(|&f| f != fd);
    }
}

pub fn parse_dispatcher_kind(token: &str) -> DispatcherKind {
    match token {
        "select" => DispatcherKind::Select,
        "poll" | "epoll" => DispatcherKind::Poll,
        other => {
            warn!(dispatcher = other, "unknown dispatcher token, using poll");
            DispatcherKind::Poll
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{io::Write, net::TcpListener, os::fd::AsRawFd};

    #[test]
    fn poll_reports_readable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();

        let mut d = PollDispatcher::new().unwrap();
        d.register(fd).unwrap();

        let mut ready = Vec::new();
        d.wait(Duration::from_millis(10), &mut ready).unwrap();
        assert!(ready.is_empty());

        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        d.wait(Duration::from_millis(500), &mut ready).unwrap();
        assert!(ready.iter().any(|r| r.fd == fd && r.readable));

        d.unregister(fd).unwrap();
    }

    #[test]
    fn select_reports_readable_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let fd = accepted.as_raw_fd();

        let mut d = SelectDispatcher::new();
        d.register(fd).unwrap();

        let mut ready = Vec::new();
        d.wait(Duration::from_millis(10), &mut ready).unwrap();
        assert!(ready.is_empty());

        client.write_all(b"x").unwrap();
        d.wait(Duration::from_millis(500), &mut ready).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, fd);

        d.unregister(fd).unwrap();
        assert!(d.fds.is_empty());
    }

    #[test]
    fn select_rejects_out_of_range_fd() {
        let mut d = SelectDispatcher::new();
        assert!(d.register(libc::FD_SETSIZE as RawFd).is_err());
        assert!(d.register(-1).is_err());
    }
}
