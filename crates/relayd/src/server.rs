use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::net::{TcpListener, UdpSocket};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    bind::{BindEntry, BindProto},
    client::{ClientEntry, ClientFlags, ClientTable, Conn, SocketInfo, SocketKind, as_v4},
    config::Config,
    dispatch::{Dispatcher, Readiness},
    handler::{Handler, Role},
    proto::{tcp, udp},
    queue::{BlockHeader, BlockKind, PopError, RingQueue},
};

/// Upper bound on one dispatcher wait; keeps the stop flag observable.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Upper bound on one queue wait, same liveness contract.
const QUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Cap on blocks delivered per network cycle so reads keep being serviced
/// while workers are producing.
const SEND_BATCH_MAX: usize = 64;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create dispatcher: {0}")]
    Dispatcher(#[source] io::Error),
    #[error("failed to bind {proto:?} {addr}: {source}")]
    Bind {
        proto: BindProto,
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("failed to register {addr} with the dispatcher: {source}")]
    Register {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// The running core: one network thread, `worker_num` workers, the two ring
/// queues between them, and the client table. Threads borrow the shared state
/// through `Arc` and are joined by [`shutdown`](Server::shutdown).
pub struct Server {
    stop: Arc<AtomicBool>,
    clients: Arc<ClientTable>,
    bound: Vec<(BindProto, SocketAddrV4)>,
    network: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds every endpoint, wires the components together and starts all
    /// threads. Any failure here is a startup failure; nothing keeps running.
    pub fn start(
        cfg: &Config,
        binds: &[BindEntry],
        handler: Arc<Handler>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, StartupError> {
        let recv_queue = Arc::new(RingQueue::new(cfg.ringqueue_length));
        let send_queue = Arc::new(RingQueue::new(cfg.ringqueue_length));
        let clients = Arc::new(ClientTable::new());
        let mut dispatcher = cfg.dispatcher.create().map_err(StartupError::Dispatcher)?;

        let mut listeners: HashMap<RawFd, TcpListener> = HashMap::new();
        let mut bound = Vec::with_capacity(binds.len());
        for bind in binds {
            match bind.proto {
                BindProto::Tcp => {
                    let listener =
                        TcpListener::bind(SocketAddr::V4(bind.addr())).map_err(|source| {
                            StartupError::Bind { proto: bind.proto, addr: bind.addr(), source }
                        })?;
                    let local = listener.local_addr().map(as_v4).unwrap_or_else(|_| bind.addr());
                    let fd = listener.as_raw_fd();
                    dispatcher
                        .register(fd)
                        .map_err(|source| StartupError::Register { addr: local, source })?;
                    listeners.insert(fd, listener);
                    info!(%local, "tcp listener bound");
                    bound.push((BindProto::Tcp, local));
                }
                BindProto::Udp => {
                    let sock =
                        UdpSocket::bind(SocketAddr::V4(bind.addr())).map_err(|source| {
                            StartupError::Bind { proto: bind.proto, addr: bind.addr(), source }
                        })?;
                    let local = sock.local_addr().map(as_v4).unwrap_or_else(|_| bind.addr());
                    let fd = sock.as_raw_fd();
                    dispatcher
                        .register(fd)
                        .map_err(|source| StartupError::Register { addr: local, source })?;
                    let si = SocketInfo::new(
                        fd,
                        SocketKind::Datagram,
                        local,
                        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
                    );
                    clients.add(ClientEntry::new(
                        si,
                        bind.flags(),
                        Conn::Udp(sock),
                        fd,
                        cfg.recv_buffer,
                        cfg.send_buffer,
                    ));
                    info!(%local, "udp listener bound");
                    bound.push((BindProto::Udp, local));
                }
            }
        }

        let net = NetworkThread {
            dispatcher,
            listeners,
            clients: clients.clone(),
            recv_queue: recv_queue.clone(),
            send_queue: send_queue.clone(),
            handler: handler.clone(),
            stop: stop.clone(),
            sizes: tcp::AcceptSizes { recv_cap: cfg.recv_buffer, send_cap: cfg.send_buffer },
            max_packet: cfg.max_packet_size,
        };
        let network = std::thread::Builder::new()
            .name("relayd-net".into())
            .spawn(move || net.run())
            .map_err(|source| StartupError::Spawn { name: "relayd-net".into(), source })?;

        let mut workers = Vec::with_capacity(cfg.worker_num);
        for id in 0..cfg.worker_num {
            let worker = Worker {
                id,
                recv_queue: recv_queue.clone(),
                send_queue: send_queue.clone(),
                handler: handler.clone(),
                stop: stop.clone(),
                max_packet: cfg.max_packet_size,
            };
            let name = format!("relayd-worker-{id}");
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|source| StartupError::Spawn { name, source })?;
            workers.push(handle);
        }

        info!(workers = cfg.worker_num, binds = bound.len(), "server started");
        Ok(Self { stop, clients, bound, network: Some(network), workers })
    }

    /// Addresses actually bound, in bind-file order. Ephemeral ports (port 0
    /// in the bind file) are resolved here.
    pub fn bound_addrs(&self) -> &[(BindProto, SocketAddrV4)] {
        &self.bound
    }

    pub fn client_table(&self) -> &Arc<ClientTable> {
        &self.clients
    }

    /// Raises the stop flag and joins every thread. Each blocking point is
    /// bounded by a timeout, so this returns within a couple of ticks.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.network.take() {
            if handle.join().is_err() {
                error!("network thread panicked");
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the network thread: the dispatcher, the TCP listener
/// sockets, and borrows of everything shared.
struct NetworkThread {
    dispatcher: Box<dyn Dispatcher>,
    listeners: HashMap<RawFd, TcpListener>,
    clients: Arc<ClientTable>,
    recv_queue: Arc<RingQueue>,
    send_queue: Arc<RingQueue>,
    handler: Arc<Handler>,
    stop: Arc<AtomicBool>,
    sizes: tcp::AcceptSizes,
    max_packet: usize,
}

impl NetworkThread {
    fn run(mut self) {
        let rc = self.handler.init(Role::Conn);
        if rc != 0 {
            warn!(rc, "handle_init(CONN) reported failure");
        }

        let mut ready: Vec<Readiness> = Vec::with_capacity(256);
        let mut popbuf = vec![0u8; self.max_packet];
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.dispatcher.wait(POLL_TIMEOUT, &mut ready) {
                error!(err = %e, "dispatcher wait failed");
                std::thread::sleep(POLL_TIMEOUT);
                continue;
            }
            for r in ready.drain(..) {
                self.handle_ready(r);
            }
            self.pump_send_queue(&mut popbuf);
            self.sweep();
        }

        // Stop path: tear every live connection down, listeners last.
        for entry in self.clients.drain() {
            if entry.is_tcp() {
                self.handler.close(&entry.socket_info);
            }
            drop(entry);
        }
        self.listeners.clear();
        self.handler.fini(Role::Conn);
        debug!("network thread exiting");
    }

    fn handle_ready(&mut self, r: Readiness) {
        if let Some(listener) = self.listeners.get_mut(&r.fd) {
            tcp::accept(
                listener,
                &self.clients,
                self.dispatcher.as_mut(),
                &self.handler,
                self.sizes,
            );
            return;
        }

        if !r.readable {
            return;
        }
        let outcome = self.clients.with_client(r.fd, |entry| {
            if entry.is_udp() {
                udp::receive(entry, &self.handler, &self.recv_queue, self.max_packet)
            } else {
                tcp::receive(entry, &self.handler, &self.recv_queue, self.max_packet)
            }
        });
        match outcome {
            None => debug!(fd = r.fd, "event for unknown descriptor"),
            Some(Ok(())) => {}
            Some(Err(e)) => {
                info!(fd = r.fd, err = %e, "receive failed, closing");
                self.close_connection(r.fd);
            }
        }
    }

    /// Delivers worker output: first block waits up to the queue timeout,
    /// everything already queued behind it drains without blocking.
    fn pump_send_queue(&mut self, buf: &mut Vec<u8>) {
        let mut timeout = QUEUE_TIMEOUT;
        for _ in 0..SEND_BATCH_MAX {
            match self.send_queue.wait_and_pop(buf, timeout) {
                Ok((len, header)) => {
                    timeout = Duration::ZERO;
                    self.deliver(&header, &buf[..len]);
                }
                Err(PopError::Timeout) => break,
                Err(PopError::BufferTooSmall(need)) => {
                    debug!(need, have = buf.len(), "growing pop buffer");
                    buf.resize(need, 0);
                    timeout = Duration::ZERO;
                }
            }
        }
    }

    fn deliver(&mut self, header: &BlockHeader, payload: &[u8]) {
        let fd = header.socket_info.sock_fd;
        match header.kind {
            BlockKind::Data => {
                let outcome = self.clients.with_client(fd, |entry| {
                    if entry.is_finalizing() {
                        // No application data after FINAL.
                        debug!(fd, block = header.block_id, "dropping data for closing client");
                        return Ok(());
                    }
                    if entry.is_udp() {
                        udp::send(entry, &header.socket_info, payload)
                    } else {
                        tcp::send(entry, payload)
                    }
                });
                match outcome {
                    None => debug!(fd, "data for unknown client dropped"),
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        warn!(fd, err = %e, "send failed, closing");
                        self.close_connection(fd);
                    }
                }
            }
            BlockKind::Final => {
                let close_now = self.clients.with_client(fd, |entry| {
                    if entry.send_len == 0 {
                        true
                    } else {
                        entry.pending_close = true;
                        entry.flags |= ClientFlags::FINALIZE;
                        false
                    }
                });
                if close_now == Some(true) {
                    self.close_connection(fd);
                }
            }
            BlockKind::Padding => {}
        }
    }

    /// Flush leftover output and finish any drained graceful closes.
    fn sweep(&mut self) {
        let mut to_close = Vec::new();
        self.clients.for_each(|entry| {
            if entry.send_len > 0 && entry.is_tcp() {
                if let Err(e) = tcp::send(entry, &[]) {
                    warn!(fd = entry.fd(), err = %e, "flush failed");
                    entry.pending_close = true;
                    entry.send_len = 0;
                }
            }
            if entry.pending_close && entry.send_len == 0 {
                to_close.push(entry.fd());
            }
        });
        for fd in to_close {
            self.close_connection(fd);
        }
    }

    /// Close callback, then removal (which unregisters), then the descriptor
    /// closes as the entry drops. Strictly in that order.
    fn close_connection(&mut self, fd: RawFd) {
        let Some(si) = self.clients.with_client(fd, |e| e.socket_info) else {
            return;
        };
        self.handler.close(&si);
        if let Some(entry) = self.clients.remove(fd, self.dispatcher.as_mut()) {
            drop(entry);
            info!(fd, "connection closed");
        }
    }
}

/// One worker: pop a record, run the processing callback, publish the result.
/// Workers never touch sockets or the client table; the send queue is their
/// only channel back to a connection.
struct Worker {
    id: usize,
    recv_queue: Arc<RingQueue>,
    send_queue: Arc<RingQueue>,
    handler: Arc<Handler>,
    stop: Arc<AtomicBool>,
    max_packet: usize,
}

impl Worker {
    fn run(self) {
        let rc = self.handler.init(Role::Work);
        if rc != 0 {
            warn!(worker = self.id, rc, "handle_init(WORK) reported failure");
        }

        let mut buf = vec![0u8; self.max_packet];
        while !self.stop.load(Ordering::Acquire) {
            match self.recv_queue.wait_and_pop(&mut buf, QUEUE_TIMEOUT) {
                Ok((len, header)) => self.process_block(&buf[..len], &header),
                Err(PopError::Timeout) => {}
                Err(PopError::BufferTooSmall(need)) => {
                    debug!(worker = self.id, need, "growing worker buffer");
                    buf.resize(need, 0);
                }
            }
        }
        self.handler.fini(Role::Work);
        debug!(worker = self.id, "worker exiting");
    }

    fn process_block(&self, record: &[u8], header: &BlockHeader) {
        let reply = self.handler.process(record, &header.socket_info);
        if reply.status < 0 {
            debug!(
                worker = self.id,
                fd = header.socket_info.sock_fd,
                status = reply.status,
                "process failed, finalizing connection"
            );
            self.push_final(header);
            return;
        }
        if let Some(out) = reply.out {
            if let Err(e) =
                self.send_queue.push(&out, BlockKind::Data, &header.socket_info, header.accept_fd)
            {
                warn!(
                    worker = self.id,
                    fd = header.socket_info.sock_fd,
                    err = %e,
                    "send queue rejected response, finalizing connection"
                );
                self.push_final(header);
            }
        }
    }

    fn push_final(&self, header: &BlockHeader) {
        if let Err(e) =
            self.send_queue.push(&[], BlockKind::Final, &header.socket_info, header.accept_fd)
        {
            error!(fd = header.socket_info.sock_fd, err = %e, "could not enqueue final block");
        }
    }
}
