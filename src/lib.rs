//! Lightweight event-driven socket I/O.
//!
//! usio is a callback-driven networking core: one [`EventLoop`] multiplexes
//! readiness over epoll or kqueue and owns every socket registered with it.
//! Sockets belong to [contexts](EventLoop::create_context) — bundles of
//! shared event callbacks — and all I/O is dispatched into those callbacks
//! on the loop thread. On top of the plain TCP and Unix-domain lifecycle
//! the crate provides a granular two-speed timeout sweep, batched UDP, a
//! multi-candidate outbound connector with a pluggable resolver, and (with
//! the `tls` feature) a TLS overlay with SNI routing.
//!
//! # Examples
//!
//! An echo server:
//!
//! ```no_run
//! use usio::EventLoop;
//!
//! let mut lp = EventLoop::new().unwrap();
//! let ctx = lp.create_context();
//! lp.context_on_data(ctx, |lp, s, data| {
//!     lp.write(s, data, false);
//! });
//! lp.listen(ctx, "127.0.0.1", 4000, 0).unwrap();
//! lp.run().unwrap();
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Length of the shared receive buffer.
pub const RECV_BUFFER_LENGTH: usize = 524_288;
/// Padding on both sides of the receive buffer, available to consumers for
/// prepending or appending framing without a copy.
pub const RECV_BUFFER_PADDING: usize = 32;

/// Close code for an orderly shutdown.
pub const CLOSE_CODE_CLEAN: i32 = 0;
/// Close code for an abortive close; sends RST instead of entering
/// TIME_WAIT.
pub const CLOSE_CODE_CONNECTION_RESET: i32 = 1;

#[macro_use]
mod macros;

mod connect;
mod context;
mod event_loop;
mod interest;
mod poll;
mod socket;
mod sys;
mod udp;
mod util;

cfg_tls! {
    pub mod tls;
}

pub use crate::connect::{ConnectResult, DnsCompletion, Resolver, ThreadResolver};
pub use crate::context::{listen_options, Callbacks};
pub use crate::event_loop::{EventLoop, LoopWaker};
pub use crate::interest::Interest;
pub use crate::poll::{ConnectingId, ContextId, SocketId, TimerId, UdpId};
pub use crate::udp::{UdpDataFn, UdpDatagrams};
