use std::{
    os::fd::RawFd,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::client::{SocketInfo, SocketKind};

/// Encoded size of a [`BlockHeader`] inside the ring.
pub const BLOCK_HEADER_SIZE: usize = 53;

/// Kind of a queued block.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Data = 0,
    /// Reserved header-only filler; producers currently never emit it and the
    /// pop side skips it.
    Padding = 1,
    /// End of messages for a connection; triggers the graceful close.
    Final = 2,
}

impl BlockKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Padding,
            2 => Self::Final,
            _ => Self::Data,
        }
    }
}

/// Metadata carried alongside every payload in a ring queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Header plus payload bytes.
    pub total_length: u32,
    /// Monotonic id assigned at push; diagnostics only.
    pub block_id: u64,
    pub kind: BlockKind,
    pub socket_info: SocketInfo,
    /// Listener that produced the originating connection.
    pub accept_fd: RawFd,
}

impl BlockHeader {
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.total_length as usize - BLOCK_HEADER_SIZE
    }

    fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut b = [0u8; BLOCK_HEADER_SIZE];
        let si = &self.socket_info;
        b[0..4].copy_from_slice(&self.total_length.to_le_bytes());
        b[4..12].copy_from_slice(&self.block_id.to_le_bytes());
        b[12] = self.kind as u8;
        b[13..17].copy_from_slice(&self.accept_fd.to_le_bytes());
        b[17..21].copy_from_slice(&si.sock_fd.to_le_bytes());
        b[21..25].copy_from_slice(&(si.kind as i32).to_le_bytes());
        b[25..33].copy_from_slice(&si.recv_timestamp.to_le_bytes());
        b[33..41].copy_from_slice(&si.send_timestamp.to_le_bytes());
        b[41..45].copy_from_slice(&si.local_ip.to_le_bytes());
        b[45..47].copy_from_slice(&si.local_port.to_le_bytes());
        b[47..51].copy_from_slice(&si.remote_ip.to_le_bytes());
        b[51..53].copy_from_slice(&si.remote_port.to_le_bytes());
        b
    }

    fn decode(b: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap());
        let i32_at = |o: usize| i32::from_le_bytes(b[o..o + 4].try_into().unwrap());
        let i64_at = |o: usize| i64::from_le_bytes(b[o..o + 8].try_into().unwrap());
        let u16_at = |o: usize| u16::from_le_bytes(b[o..o + 2].try_into().unwrap());
        Self {
            total_length: u32_at(0),
            block_id: u64::from_le_bytes(b[4..12].try_into().unwrap()),
            kind: BlockKind::from_raw(b[12]),
            accept_fd: i32_at(13),
            socket_info: SocketInfo {
                sock_fd: i32_at(17),
                kind: SocketKind::from_raw(i32_at(21)),
                recv_timestamp: i64_at(25),
                send_timestamp: i64_at(33),
                local_ip: u32_at(41),
                local_port: u16_at(45),
                remote_ip: u32_at(47),
                remote_port: u16_at(51),
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("block of {total} bytes can never fit a {capacity}-byte ring")]
    ExceedsCapacity { total: usize, capacity: usize },
    #[error("ring full: need {needed} bytes, {free} free")]
    NoSpace { needed: usize, free: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PopError {
    #[error("timed out waiting for a block")]
    Timeout,
    #[error("caller buffer too small: payload is {0} bytes")]
    BufferTooSmall(usize),
}

struct RingInner {
    buf: Box<[u8]>,
    /// Monotonic byte offsets; reduced modulo the capacity only at access
    /// time, so fill level is always `write - read`.
    write: u64,
    read: u64,
    next_block_id: u64,
}

impl RingInner {
    #[inline]
    fn used(&self) -> usize {
        (self.write - self.read) as usize
    }

    fn copy_in(&mut self, at: u64, src: &[u8]) {
        let cap = self.buf.len();
        let pos = (at % cap as u64) as usize;
        let first = src.len().min(cap - pos);
        self.buf[pos..pos + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            self.buf[..src.len() - first].copy_from_slice(&src[first..]);
        }
    }

    fn copy_out(&self, at: u64, dst: &mut [u8]) {
        let cap = self.buf.len();
        let pos = (at % cap as u64) as usize;
        let first = dst.len().min(cap - pos);
        dst[..first].copy_from_slice(&self.buf[pos..pos + first]);
        if first < dst.len() {
            let remaining = dst.len() - first;
            dst[first..].copy_from_slice(&self.buf[..remaining]);
        }
    }
}

/// Bounded byte ring carrying `[header‖payload]` blocks between the network
/// thread and the worker pool.
///
/// Producers never block: a full ring is a fail-fast [`PushError`] and the
/// caller decides whether to drop or tear the connection down. The only
/// blocking point is [`wait_and_pop`], bounded by the caller's timeout.
/// Records may wrap the end of the buffer; both copy directions split at the
/// boundary.
pub struct RingQueue {
    inner: Mutex<RingInner>,
    avail: Condvar,
    capacity: usize,
}

impl RingQueue {
    /// `capacity` is the total byte size of the ring. It must leave room for
    /// at least one header-only block.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > BLOCK_HEADER_SIZE, "ring capacity {capacity} below header size");
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0; capacity].into_boxed_slice(),
                write: 0,
                read: 0,
                next_block_id: 0,
            }),
            avail: Condvar::new(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently enqueued (headers included).
    pub fn used(&self) -> usize {
        self.lock().used()
    }

    /// Appends one block and wakes one waiter. Returns the assigned block id.
    pub fn push(
        &self,
        payload: &[u8],
        kind: BlockKind,
        socket_info: &SocketInfo,
        accept_fd: RawFd,
    ) -> Result<u64, PushError> {
        let total = BLOCK_HEADER_SIZE + payload.len();
        if total > self.capacity {
            return Err(PushError::ExceedsCapacity { total, capacity: self.capacity });
        }

        let mut inner = self.lock();
        let free = self.capacity - inner.used();
        if free < total {
            return Err(PushError::NoSpace { needed: total, free });
        }

        let block_id = inner.next_block_id;
        inner.next_block_id += 1;
        let header = BlockHeader {
            total_length: total as u32,
            block_id,
            kind,
            socket_info: *socket_info,
            accept_fd,
        };

        let at = inner.write;
        inner.copy_in(at, &header.encode());
        inner.copy_in(at + BLOCK_HEADER_SIZE as u64, payload);
        inner.write = at + total as u64;
        drop(inner);

        self.avail.notify_one();
        Ok(block_id)
    }

    /// Blocks until a block is available or `timeout` elapses, then copies the
    /// payload into `buf` and returns its length with the decoded header.
    ///
    /// A payload larger than `buf` fails with `BufferTooSmall` *without*
    /// consuming, so the caller can grow and retry. Padding blocks are
    /// consumed silently.
    pub fn wait_and_pop(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, BlockHeader), PopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            while inner.read != inner.write {
                let mut hb = [0u8; BLOCK_HEADER_SIZE];
                inner.copy_out(inner.read, &mut hb);
                let header = BlockHeader::decode(&hb);
                let total = header.total_length as u64;
                debug_assert!(
                    total as usize >= BLOCK_HEADER_SIZE && total as usize <= self.capacity,
                    "corrupt block header"
                );

                if header.kind == BlockKind::Padding {
                    inner.read += total;
                    continue;
                }

                let payload_len = header.payload_len();
                if payload_len > buf.len() {
                    return Err(PopError::BufferTooSmall(payload_len));
                }

                let at = inner.read + BLOCK_HEADER_SIZE as u64;
                inner.copy_out(at, &mut buf[..payload_len]);
                inner.read += total;
                return Ok((payload_len, header));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::Timeout);
            }
            let (guard, _) = self
                .avail
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
