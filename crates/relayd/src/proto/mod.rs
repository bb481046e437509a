use std::io;

use thiserror::Error;
use tracing::warn;

use crate::{
    client::{ClientEntry, SocketInfo},
    handler::Handler,
    queue::{BlockKind, PushError, RingQueue},
};

pub mod tcp;
pub mod udp;

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("receive buffer overflow: {have} buffered + {add} read exceeds {cap}")]
    Overflow { have: usize, add: usize, cap: usize },
    #[error("framing callback failed with {0}")]
    Framing(i32),
    #[error("receive queue rejected a record: {0}")]
    Queue(#[from] PushError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send buffer overflow: {have} pending + {add} new exceeds {cap}")]
    Overflow { have: usize, add: usize, cap: usize },
    #[error("short datagram send: {sent} of {len} bytes")]
    ShortDatagram { sent: usize, len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Runs the framing callback over the buffered bytes, pushing one DATA record
/// per complete frame and shifting the tail down.
///
/// Forward progress is guaranteed: every positive framing result strictly
/// shrinks `recv_len`, and a result claiming more than is buffered is treated
/// as a framing failure.
pub(crate) fn drain_frames(
    entry: &mut ClientEntry,
    record_si: SocketInfo,
    handler: &Handler,
    recv_queue: &RingQueue,
) -> Result<(), RecvError> {
    while entry.recv_len > 0 {
        let k = handler.frame(&entry.recv_buf[..entry.recv_len], &record_si);
        if k == 0 {
            break;
        }
        if k < 0 {
            return Err(RecvError::Framing(k));
        }
        let k = k as usize;
        if k > entry.recv_len {
            warn!(
                fd = entry.fd(),
                claimed = k,
                buffered = entry.recv_len,
                "framing callback claimed more bytes than buffered"
            );
            return Err(RecvError::Framing(k as i32));
        }

        recv_queue.push(&entry.recv_buf[..k], BlockKind::Data, &record_si, entry.accept_fd)?;
        entry.recv_buf.copy_within(k..entry.recv_len, 0);
        entry.recv_len -= k;
    }
    Ok(())
}
