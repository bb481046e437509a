use std::{io, net::SocketAddr, os::fd::RawFd};

use tracing::{debug, warn};

use crate::{
    client::{ClientEntry, Conn, SocketInfo, as_v4},
    config::MAX_PACKET_CEILING,
    handler::Handler,
    proto::{RecvError, SendError, drain_frames},
    queue::RingQueue,
};

/// UDP has no accept step; datagrams arrive straight on the listener entry.
pub fn accept(listener_fd: RawFd) {
    debug!(fd = listener_fd, "accept on udp listener ignored");
}

/// Drains pending datagrams from the listener pseudo-entry. Each datagram is
/// appended to the shared receive buffer and framed with the datagram's peer
/// address carried in the pushed record's socket info.
///
/// The listener outlives individual peers, so per-datagram trouble (overflow,
/// framing refusal, a full receive queue) drops the buffered bytes and keeps
/// the socket alive rather than tearing the whole bind down.
pub fn receive(
    entry: &mut ClientEntry,
    handler: &Handler,
    recv_queue: &RingQueue,
    max_packet: usize,
) -> Result<(), RecvError> {
    let mut scratch = [0u8; MAX_PACKET_CEILING];
    let take = max_packet.min(MAX_PACKET_CEILING);
    loop {
        let (n, peer) = {
            let Conn::Udp(sock) = &mut entry.conn else {
                debug_assert!(false, "udp receive on non-udp entry");
                return Ok(());
            };
            match sock.recv_from(&mut scratch[..take]) {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(fd = entry.fd(), err = %e, "udp recv error, datagram dropped");
                    return Ok(());
                }
            }
        };

        if entry.recv_len + n > entry.recv_buf.len() {
            warn!(
                fd = entry.fd(),
                buffered = entry.recv_len,
                datagram = n,
                "udp receive buffer overflow, dropping buffered bytes"
            );
            entry.recv_len = 0;
            continue;
        }
        entry.recv_buf[entry.recv_len..entry.recv_len + n].copy_from_slice(&scratch[..n]);
        entry.recv_len += n;
        entry.socket_info.touch_recv();

        let mut record_si = entry.socket_info;
        record_si.set_peer(as_v4(peer));
        if let Err(e) = drain_frames(entry, record_si, handler, recv_queue) {
            warn!(fd = entry.fd(), peer = %peer, err = %e, "udp datagram dropped");
            entry.recv_len = 0;
        }
    }
}

/// One-shot datagram send to the peer carried in the record's socket info.
/// Nothing is retained: `WouldBlock` drops the datagram, a short send is
/// fatal for the entry.
pub fn send(entry: &mut ClientEntry, record_si: &SocketInfo, data: &[u8]) -> Result<(), SendError> {
    if data.is_empty() {
        return Ok(());
    }
    let dest = SocketAddr::V4(record_si.peer_addr());
    let n = {
        let Conn::Udp(sock) = &mut entry.conn else {
            debug_assert!(false, "udp send on non-udp entry");
            return Ok(());
        };
        loop {
            match sock.send_to(data, dest) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    warn!(fd = entry.socket_info.sock_fd, %dest, "udp send would block, datagram dropped");
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    };
    if n < data.len() {
        return Err(SendError::ShortDatagram { sent: n, len: data.len() });
    }
    entry.socket_info.touch_send();
    Ok(())
}
