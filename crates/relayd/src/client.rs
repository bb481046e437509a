use std::{
    collections::HashMap,
    io::{self, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::fd::RawFd,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use bitflags::bitflags;
use mio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;

/// Socket classification carried across the handler ABI.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Stream = 0,
    Datagram = 1,
}

impl SocketKind {
    pub fn from_raw(raw: i32) -> Self {
        if raw == Self::Datagram as i32 { Self::Datagram } else { Self::Stream }
    }
}

/// Per-socket identity and addressing, copied freely.
///
/// This is the exact struct handed to handler callbacks and embedded in every
/// queue block, so the layout is C and all fields are plain scalars. The
/// descriptor id (`sock_fd`) is the stable identity of a connection.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketInfo {
    pub sock_fd: i32,
    pub kind: SocketKind,
    /// Unix seconds of the last successful receive.
    pub recv_timestamp: i64,
    /// Unix seconds of the last successful send.
    pub send_timestamp: i64,
    pub local_ip: u32,
    pub local_port: u16,
    pub remote_ip: u32,
    pub remote_port: u16,
}

impl SocketInfo {
    pub fn new(fd: RawFd, kind: SocketKind, local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self {
            sock_fd: fd,
            kind,
            recv_timestamp: 0,
            send_timestamp: 0,
            local_ip: u32::from(*local.ip()),
            local_port: local.port(),
            remote_ip: u32::from(*peer.ip()),
            remote_port: peer.port(),
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.remote_ip), self.remote_port)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.local_ip), self.local_port)
    }

    #[inline]
    pub fn set_peer(&mut self, peer: SocketAddrV4) {
        self.remote_ip = u32::from(*peer.ip());
        self.remote_port = peer.port();
    }

    #[inline]
    pub fn touch_recv(&mut self) {
        self.recv_timestamp = unix_now();
    }

    #[inline]
    pub fn touch_send(&mut self) {
        self.send_timestamp = unix_now();
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}

/// Downgrade a socket address to V4; binds are IPv4-only so V6 never shows up
/// outside of misconfiguration.
pub fn as_v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(v6) => {
            warn!(?v6, "ignoring non-IPv4 address");
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v6.port())
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const VALID    = 1 << 0;
        const LISTENER = 1 << 1;
        const PIPE     = 1 << 2;
        const UDP      = 1 << 3;
        const FINALIZE = 1 << 4;
    }
}

/// The OS socket owned by a table entry. Listeners for TCP live outside the
/// table (the network thread accepts on them); UDP listeners are pseudo
/// entries here so their datagrams flow through the normal receive path.
pub enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Per-connection record: addressing, flags, and the two staging buffers.
///
/// Buffers are fixed-capacity regions allocated at `add` time; `recv_len` /
/// `send_len` are the valid prefixes.
pub struct ClientEntry {
    pub socket_info: SocketInfo,
    pub flags: ClientFlags,
    pub recv_buf: Box<[u8]>,
    pub recv_len: usize,
    pub send_buf: Box<[u8]>,
    pub send_len: usize,
    /// Close the descriptor once `send_len` reaches zero.
    pub pending_close: bool,
    /// Listener that produced this connection.
    pub accept_fd: RawFd,
    pub conn: Conn,
}

impl ClientEntry {
    pub fn new(
        socket_info: SocketInfo,
        flags: ClientFlags,
        conn: Conn,
        accept_fd: RawFd,
        recv_cap: usize,
        send_cap: usize,
    ) -> Self {
        Self {
            socket_info,
            flags,
            recv_buf: vec![0; recv_cap].into_boxed_slice(),
            recv_len: 0,
            send_buf: vec![0; send_cap].into_boxed_slice(),
            send_len: 0,
            pending_close: false,
            accept_fd,
            conn,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.socket_info.sock_fd
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.flags.contains(ClientFlags::UDP)
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        !self.is_udp()
    }

    #[inline]
    pub fn is_listener(&self) -> bool {
        self.flags.contains(ClientFlags::LISTENER)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(ClientFlags::VALID)
    }

    #[inline]
    pub fn is_finalizing(&self) -> bool {
        self.flags.contains(ClientFlags::FINALIZE) || self.pending_close
    }

    /// One direct non-blocking write, bypassing the send buffer. Returns the
    /// number of bytes accepted by the kernel; `WouldBlock` counts as zero.
    pub fn write_now(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = match &mut self.conn {
            Conn::Tcp(stream) => match stream.write(data) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            },
            Conn::Udp(sock) => sock.send_to(data, SocketAddr::V4(self.socket_info.peer_addr()))?,
        };
        if n > 0 {
            self.socket_info.touch_send();
        }
        Ok(n)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendDirectError {
    #[error("client {0} not found")]
    UnknownClient(RawFd),
    #[error("client {0} has undrained output pending")]
    Busy(RawFd),
    #[error("payload of {len} bytes exceeds send capacity {cap}")]
    Overflow { len: usize, cap: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Ownership and lookup of all live connections, one mutex over the map.
///
/// The network thread mutates entries during IO while holding the lock; the
/// other threads only reach entries through this synchronized surface.
#[derive(Default)]
pub struct ClientTable {
    clients: Mutex<HashMap<RawFd, ClientEntry>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry. Re-adding a live descriptor id replaces the previous
    /// entry, releasing its buffers and socket.
    pub fn add(&self, entry: ClientEntry) {
        let fd = entry.fd();
        let mut clients = self.lock();
        if clients.insert(fd, entry).is_some() {
            warn!(fd, "replaced stale client entry");
        } else {
            debug!(fd, "client added");
        }
    }

    /// Removes the entry and unregisters its descriptor from the dispatcher.
    /// The entry is handed back so the caller controls when the descriptor
    /// actually closes (it must stay out of the table before that happens).
    pub fn remove(&self, fd: RawFd, dispatcher: &mut dyn Dispatcher) -> Option<ClientEntry> {
        let entry = self.lock().remove(&fd);
        if entry.is_some() {
            if let Err(e) = dispatcher.unregister(fd) {
                debug!(fd, err = %e, "unregister on remove");
            }
            debug!(fd, "client removed");
        } else {
            warn!(fd, "remove of unknown client");
        }
        entry
    }

    /// Runs `f` on the entry for `fd` under the table lock.
    pub fn with_client<R>(&self, fd: RawFd, f: impl FnOnce(&mut ClientEntry) -> R) -> Option<R> {
        self.lock().get_mut(&fd).map(f)
    }

    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.lock().contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Iterates every entry under the lock; used by the network thread for
    /// the flush / pending-close sweep.
    pub fn for_each(&self, mut f: impl FnMut(&mut ClientEntry)) {
        for entry in self.lock().values_mut() {
            f(entry);
        }
    }

    /// Out-of-queue convenience send. Refuses when output is already pending
    /// so queued bytes keep their order; a short write leaves the tail in the
    /// entry's send buffer.
    pub fn send_direct(&self, fd: RawFd, data: &[u8]) -> Result<usize, SendDirectError> {
        let mut clients = self.lock();
        let entry = clients.get_mut(&fd).ok_or(SendDirectError::UnknownClient(fd))?;
        if entry.send_len > 0 {
            return Err(SendDirectError::Busy(fd));
        }
        if data.len() > entry.send_buf.len() {
            return Err(SendDirectError::Overflow { len: data.len(), cap: entry.send_buf.len() });
        }
        let sent = entry.write_now(data)?;
        if sent < data.len() {
            let rest = &data[sent..];
            entry.send_buf[..rest.len()].copy_from_slice(rest);
            entry.send_len = rest.len();
        }
        Ok(sent)
    }

    /// Empties the table, returning the entries so their sockets close on
    /// drop. Teardown only.
    pub fn drain(&self) -> Vec<ClientEntry> {
        self.lock().drain().map(|(_, e)| e).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RawFd, ClientEntry>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::NullDispatcher;

    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), peer)
    }

    fn entry_for(stream: TcpStream, fd: RawFd) -> ClientEntry {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        ClientEntry::new(
            SocketInfo::new(fd, SocketKind::Stream, addr, addr),
            ClientFlags::VALID | ClientFlags::LISTENER,
            Conn::Tcp(stream),
            -1,
            64,
            64,
        )
    }

    #[test]
    fn add_replaces_and_remove_forgets() {
        let table = ClientTable::new();
        let mut dispatcher = NullDispatcher::default();

        let (a, _peer_a) = stream_pair();
        let (b, _peer_b) = stream_pair();
        table.add(entry_for(a, 7));
        table.add(entry_for(b, 7));
        assert_eq!(table.len(), 1);

        assert!(table.remove(7, &mut dispatcher).is_some());
        assert!(table.with_client(7, |_| ()).is_none());
        assert!(table.remove(7, &mut dispatcher).is_none());
    }

    #[test]
    fn send_direct_refuses_with_pending_output() {
        let table = ClientTable::new();
        let (a, _peer) = stream_pair();
        table.add(entry_for(a, 9));

        table.with_client(9, |e| e.send_len = 3).unwrap();
        assert!(matches!(table.send_direct(9, b"hi"), Err(SendDirectError::Busy(9))));

        table.with_client(9, |e| e.send_len = 0).unwrap();
        assert!(table.send_direct(9, b"hi").is_ok());
    }

    #[test]
    fn send_direct_rejects_oversized_payload() {
        let table = ClientTable::new();
        let (a, _peer) = stream_pair();
        table.add(entry_for(a, 11));
        let big = vec![0u8; 65];
        assert!(matches!(
            table.send_direct(11, &big),
            Err(SendDirectError::Overflow { len: 65, cap: 64 })
        ));
    }

    #[test]
    fn flag_predicates() {
        let (a, _peer) = stream_pair();
        let mut e = entry_for(a, 3);
        assert!(e.is_tcp() && !e.is_udp() && e.is_valid());
        e.flags |= ClientFlags::UDP;
        assert!(e.is_udp() && !e.is_tcp());
        assert!(!e.is_finalizing());
        e.pending_close = true;
        assert!(e.is_finalizing());
    }
}
