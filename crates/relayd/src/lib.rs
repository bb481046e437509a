//! Multi-threaded TCP/UDP application-server core: a readiness-driven
//! network thread, a worker pool, and two framed ring queues in between.
//! Application behavior comes from a handler plugin bound at startup.

pub mod bind;
pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod handler;
pub mod logging;
pub mod proto;
pub mod queue;
pub mod server;

pub use client::{ClientEntry, ClientFlags, ClientTable, SocketInfo, SocketKind};
pub use handler::{Handler, HandlerVtable, Role};
pub use queue::{BlockHeader, BlockKind, RingQueue};
pub use server::{Server, StartupError};
