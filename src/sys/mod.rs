//! OS-specific readiness backends.
//!
//! Each backend exposes the same surface: a `Selector` with
//! register/reregister/deregister/select, a cross-thread `Waker`, a
//! `Timer` and the `event` accessor functions used by the dispatch loop.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::*;

#[cfg(not(unix))]
compile_error!("usio only supports unix-like targets (epoll and kqueue)");
