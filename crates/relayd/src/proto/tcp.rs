use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
};

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    client::{ClientEntry, ClientFlags, Conn, SocketInfo, SocketKind, as_v4},
    config::MAX_PACKET_CEILING,
    dispatch::Dispatcher,
    handler::Handler,
    proto::{RecvError, SendError, drain_frames},
    queue::RingQueue,
};

/// Sizing knobs the accept path needs when it allocates a fresh entry.
#[derive(Clone, Copy, Debug)]
pub struct AcceptSizes {
    pub recv_cap: usize,
    pub send_cap: usize,
}

/// Accepts every pending connection on `listener`: build the entry, run the
/// handler's open callback, then register with the dispatcher. A failing open
/// callback tears the connection straight back down.
pub fn accept(
    listener: &mut TcpListener,
    table: &crate::client::ClientTable,
    dispatcher: &mut dyn Dispatcher,
    handler: &Handler,
    sizes: AcceptSizes,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(err = %e, "accept failed");
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(err = %e, "set_nodelay");
        }

        let fd = stream.as_raw_fd();
        let local = stream.local_addr().map(as_v4).unwrap_or_else(|_| as_v4(peer));
        let si = SocketInfo::new(fd, SocketKind::Stream, local, as_v4(peer));
        info!(fd, peer = %peer, "client connected");

        table.add(ClientEntry::new(
            si,
            ClientFlags::VALID | ClientFlags::LISTENER,
            Conn::Tcp(stream),
            listener.as_raw_fd(),
            sizes.recv_cap,
            sizes.send_cap,
        ));

        if !run_open_callback(fd, &si, table, handler) {
            drop(table.remove(fd, dispatcher));
            continue;
        }

        if let Err(e) = dispatcher.register(fd) {
            warn!(fd, err = %e, "dispatcher register failed, dropping client");
            handler.close(&si);
            drop(table.remove(fd, dispatcher));
        }
    }
}

/// Open callback plus delivery of any greeting bytes it produced. Returns
/// false when the connection must be torn down.
fn run_open_callback(
    fd: RawFd,
    si: &SocketInfo,
    table: &crate::client::ClientTable,
    handler: &Handler,
) -> bool {
    let Some(reply) = handler.open(si) else { return true };
    if reply.status < 0 {
        debug!(fd, status = reply.status, "open callback refused connection");
        return false;
    }
    if let Some(greeting) = reply.out {
        let sent = table.with_client(fd, |entry| send(entry, &greeting));
        match sent {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(fd, err = %e, "greeting send failed");
                return false;
            }
            None => return false,
        }
    }
    true
}

/// Drains the socket until `WouldBlock`, appending to the entry's receive
/// buffer and framing as bytes arrive. Every error is terminal for the
/// connection; the caller runs the close sequence.
pub fn receive(
    entry: &mut ClientEntry,
    handler: &Handler,
    recv_queue: &RingQueue,
    max_packet: usize,
) -> Result<(), RecvError> {
    let mut scratch = [0u8; MAX_PACKET_CEILING];
    let take = max_packet.min(MAX_PACKET_CEILING);
    loop {
        let n = {
            let Conn::Tcp(stream) = &mut entry.conn else {
                debug_assert!(false, "tcp receive on non-tcp entry");
                return Ok(());
            };
            match stream.read(&mut scratch[..take]) {
                Ok(0) => return Err(RecvError::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if entry.recv_len + n > entry.recv_buf.len() {
            return Err(RecvError::Overflow {
                have: entry.recv_len,
                add: n,
                cap: entry.recv_buf.len(),
            });
        }
        entry.recv_buf[entry.recv_len..entry.recv_len + n].copy_from_slice(&scratch[..n]);
        entry.recv_len += n;
        entry.socket_info.touch_recv();

        let si = entry.socket_info;
        drain_frames(entry, si, handler, recv_queue)?;
    }
}

/// Queued-output send: appends behind any pending bytes and flushes what the
/// kernel will take now. A short write leaves the unsent tail in
/// `send_buffer`; `WouldBlock` counts as a zero-byte write. An empty `data`
/// flushes only.
pub fn send(entry: &mut ClientEntry, data: &[u8]) -> Result<(), SendError> {
    let ClientEntry { conn, send_buf, send_len, socket_info, .. } = entry;
    let Conn::Tcp(stream) = conn else {
        debug_assert!(false, "tcp send on non-tcp entry");
        return Ok(());
    };

    if *send_len > 0 {
        if !data.is_empty() {
            if *send_len + data.len() > send_buf.len() {
                return Err(SendError::Overflow {
                    have: *send_len,
                    add: data.len(),
                    cap: send_buf.len(),
                });
            }
            send_buf[*send_len..*send_len + data.len()].copy_from_slice(data);
            *send_len += data.len();
        }

        let n = write_some(stream, &send_buf[..*send_len])?;
        if n > 0 {
            send_buf.copy_within(n..*send_len, 0);
            *send_len -= n;
            socket_info.touch_send();
        }
    } else if !data.is_empty() {
        let n = write_some(stream, data)?;
        if n > 0 {
            socket_info.touch_send();
        }
        if n < data.len() {
            let rest = &data[n..];
            if rest.len() > send_buf.len() {
                return Err(SendError::Overflow {
                    have: 0,
                    add: rest.len(),
                    cap: send_buf.len(),
                });
            }
            send_buf[..rest.len()].copy_from_slice(rest);
            *send_len = rest.len();
        }
    }
    Ok(())
}

fn write_some(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    loop {
        match stream.write(data) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        ffi::{c_char, c_int},
        io::Read as _,
        time::Duration,
    };

    use super::*;
    use crate::{
        client::ClientTable,
        handler::{Handler, HandlerVtable},
        queue::{BlockKind, PopError},
    };

    /// 4-byte big-endian total-length prefix framing.
    extern "C" fn frame_prefixed(data: *const c_char, len: c_int, _: *const SocketInfo) -> c_int {
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
        if bytes.len() < 4 {
            return 0;
        }
        let need = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        if bytes.len() >= need { need as c_int } else { 0 }
    }

    extern "C" fn frame_never(_: *const c_char, _: c_int, _: *const SocketInfo) -> c_int {
        0
    }

    extern "C" fn frame_refuse(_: *const c_char, _: c_int, _: *const SocketInfo) -> c_int {
        -7
    }

    extern "C" fn process_noop(
        _: *const c_char,
        _: c_int,
        _: *mut *mut c_char,
        _: *mut c_int,
        _: *const SocketInfo,
    ) -> c_int {
        0
    }

    fn handler(input: crate::handler::InputFn) -> Handler {
        Handler::from_vtable(
            HandlerVtable {
                init: None,
                input,
                process: process_noop,
                open: None,
                close: None,
                timer: None,
                fini: None,
            },
            vec![],
        )
    }

    fn connected_entry(recv_cap: usize, send_cap: usize) -> (ClientEntry, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let fd = accepted.as_raw_fd();
        let si = SocketInfo::new(
            fd,
            SocketKind::Stream,
            as_v4(accepted.local_addr().unwrap()),
            as_v4(peer_addr),
        );
        let entry = ClientEntry::new(
            si,
            ClientFlags::VALID | ClientFlags::LISTENER,
            Conn::Tcp(TcpStream::from_std(accepted)),
            -1,
            recv_cap,
            send_cap,
        );
        (entry, peer)
    }

    fn frame_of(payload: &[u8]) -> Vec<u8> {
        let total = (payload.len() + 4) as u32;
        let mut v = total.to_be_bytes().to_vec();
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn receive_frames_one_complete_record() {
        let (mut entry, mut peer) = connected_entry(256, 256);
        let h = handler(frame_prefixed);
        let q = RingQueue::new(4096);

        peer.write_all(&frame_of(b"hello world")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        receive(&mut entry, &h, &q, 8196).unwrap();

        let mut buf = [0u8; 64];
        let (len, header) = q.wait_and_pop(&mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(&buf[..len], frame_of(b"hello world").as_slice());
        assert_eq!(header.kind, BlockKind::Data);
        assert_eq!(header.socket_info.sock_fd, entry.fd());
        assert_eq!(entry.recv_len, 0);
    }

    #[test]
    fn receive_waits_for_split_frames() {
        let (mut entry, mut peer) = connected_entry(256, 256);
        let h = handler(frame_prefixed);
        let q = RingQueue::new(4096);
        let msg = frame_of(b"abcdef");

        peer.write_all(&msg[..4]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        receive(&mut entry, &h, &q, 8196).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(q.wait_and_pop(&mut buf, Duration::from_millis(10)), Err(PopError::Timeout));
        assert_eq!(entry.recv_len, 4);

        peer.write_all(&msg[4..]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        receive(&mut entry, &h, &q, 8196).unwrap();
        let (len, _) = q.wait_and_pop(&mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(&buf[..len], msg.as_slice());
        assert_eq!(entry.recv_len, 0);
    }

    #[test]
    fn receive_overflow_is_terminal() {
        let (mut entry, mut peer) = connected_entry(16, 256);
        let h = handler(frame_never);
        let q = RingQueue::new(4096);

        peer.write_all(&[0u8; 24]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let err = receive(&mut entry, &h, &q, 8196).unwrap_err();
        assert!(matches!(err, RecvError::Overflow { .. }));
        let mut buf = [0u8; 64];
        assert_eq!(q.wait_and_pop(&mut buf, Duration::from_millis(10)), Err(PopError::Timeout));
    }

    #[test]
    fn negative_framing_is_terminal() {
        let (mut entry, mut peer) = connected_entry(64, 64);
        let h = handler(frame_refuse);
        let q = RingQueue::new(4096);

        peer.write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            receive(&mut entry, &h, &q, 8196),
            Err(RecvError::Framing(-7))
        ));
    }

    #[test]
    fn peer_close_is_reported() {
        let (mut entry, peer) = connected_entry(64, 64);
        let h = handler(frame_prefixed);
        let q = RingQueue::new(4096);

        drop(peer);
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(receive(&mut entry, &h, &q, 8196), Err(RecvError::PeerClosed)));
    }

    #[test]
    fn send_appends_behind_pending_bytes() {
        let (mut entry, mut peer) = connected_entry(64, 64);

        entry.send_buf[..2].copy_from_slice(b"AB");
        entry.send_len = 2;
        send(&mut entry, b"CD").unwrap();
        assert_eq!(entry.send_len, 0);

        let mut got = [0u8; 4];
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ABCD");
    }

    #[test]
    fn send_overflow_with_pending_output() {
        let (mut entry, _peer) = connected_entry(64, 8);
        entry.send_len = 6;
        let err = send(&mut entry, b"toolong").unwrap_err();
        assert!(matches!(err, SendError::Overflow { have: 6, add: 7, cap: 8 }));
    }

    #[test]
    fn empty_send_only_flushes() {
        let (mut entry, mut peer) = connected_entry(64, 64);
        entry.send_buf[..3].copy_from_slice(b"xyz");
        entry.send_len = 3;
        send(&mut entry, &[]).unwrap();
        assert_eq!(entry.send_len, 0);

        let mut got = [0u8; 3];
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"xyz");
    }

    #[test]
    fn accept_registers_and_opens() {
        let mut listener =
            TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let table = ClientTable::new();
        let mut dispatcher = crate::dispatch::NullDispatcher::default();
        let h = handler(frame_prefixed);

        let _peer = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        accept(
            &mut listener,
            &table,
            &mut dispatcher,
            &h,
            AcceptSizes { recv_cap: 64, send_cap: 64 },
        );

        assert_eq!(table.len(), 1);
        assert_eq!(dispatcher.registered.len(), 1);
    }

    #[test]
    fn forward_progress_on_each_complete_frame() {
        let (mut entry, _peer) = connected_entry(256, 64);
        let h = handler(frame_prefixed);
        let q = RingQueue::new(4096);

        let mut bytes = frame_of(b"one");
        bytes.extend_from_slice(&frame_of(b"two"));
        bytes.extend_from_slice(&frame_of(b"three")[..5]);
        entry.recv_buf[..bytes.len()].copy_from_slice(&bytes);
        entry.recv_len = bytes.len();

        let si = entry.socket_info;
        drain_frames(&mut entry, si, &h, &q).unwrap();
        // Two complete frames popped out, the split third stays buffered.
        assert_eq!(entry.recv_len, 5);
        let mut buf = [0u8; 64];
        assert_eq!(q.wait_and_pop(&mut buf, Duration::from_millis(10)).unwrap().0, 7);
        assert_eq!(q.wait_and_pop(&mut buf, Duration::from_millis(10)).unwrap().0, 7);
        assert_eq!(q.wait_and_pop(&mut buf, Duration::from_millis(10)), Err(PopError::Timeout));
    }
}
