//! Poll entries: the base of sockets, listen sockets, UDP sockets, timers
//! and the wakeup async. Every entry lives in the loop's arena and is
//! registered with the OS backend under its arena index.

use std::any::Any;
use std::os::fd::RawFd;

use crate::util::Handle;
use crate::Interest;

/// Timeout field value meaning "disarmed".
pub(crate) const DISARMED: u8 = 255;

/// Handle to a TCP or Unix-domain stream socket owned by a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) Handle);

/// Handle to a socket context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) Handle);

/// Handle to an in-flight outbound connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectingId(pub(crate) Handle);

/// Handle to a UDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpId(pub(crate) Handle);

/// Handle to a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) Handle);

/// What a socket poll currently is. Semi sockets (listening or still
/// connecting) have not started their data lifecycle and are dispatched
/// specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    Listen,
    Connecting,
    Open,
    ShutDown,
}

impl SocketKind {
    pub(crate) fn is_semi(self) -> bool {
        matches!(self, SocketKind::Listen | SocketKind::Connecting)
    }
}

pub(crate) struct SocketEntry {
    pub(crate) fd: RawFd,
    pub(crate) kind: SocketKind,
    pub(crate) interest: Interest,
    pub(crate) ctx: Handle,
    /// Intrusive links within the owning context's socket (or listen
    /// socket) list, or within the loop's low-priority queue.
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    pub(crate) timeout: u8,
    pub(crate) long_timeout: u8,
    /// 0 = normal, 1 = parked in the low-priority queue, 2 = was parked and
    /// gets one normally-processed iteration.
    pub(crate) low_prio_state: u8,
    pub(crate) allow_half_open: bool,
    pub(crate) is_paused: bool,
    pub(crate) is_ipc: bool,
    pub(crate) closed: bool,
    /// Back-pointer to the connection attempt this socket is a candidate
    /// of, plus the sibling chain of other candidates.
    pub(crate) connect_state: Option<Handle>,
    pub(crate) connect_next: Option<usize>,
    pub(crate) ext: Option<Box<dyn Any>>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<Box<crate::tls::TlsSocket>>,
    /// Hostname to present via SNI once the TLS client handshake starts.
    #[cfg(feature = "tls")]
    pub(crate) sni: Option<Box<str>>,
}

impl SocketEntry {
    pub(crate) fn new(fd: RawFd, kind: SocketKind, ctx: Handle) -> SocketEntry {
        SocketEntry {
            fd,
            kind,
            interest: Interest::NONE,
            ctx,
            prev: None,
            next: None,
            timeout: DISARMED,
            long_timeout: DISARMED,
            low_prio_state: 0,
            allow_half_open: false,
            is_paused: false,
            is_ipc: false,
            closed: false,
            connect_state: None,
            connect_next: None,
            ext: None,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            sni: None,
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.kind == SocketKind::ShutDown
    }
}

pub(crate) struct UdpEntry {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    /// A UDP socket is bound to one port for its whole life, so it is
    /// cached at creation.
    pub(crate) port: u16,
    pub(crate) closed: bool,
    pub(crate) on_data: Option<crate::udp::UdpDataFn>,
    pub(crate) on_drain: Option<fn(&mut crate::EventLoop, UdpId)>,
    pub(crate) on_close: Option<fn(&mut crate::EventLoop, UdpId)>,
    pub(crate) ext: Option<Box<dyn Any>>,
}

pub(crate) enum CallbackKind {
    Timer(crate::sys::Timer),
    Waker,
}

/// Timers and the wakeup async are polls like everything else; the
/// dispatcher drains their backing fd (when there is one) and invokes the
/// stored callback.
pub(crate) struct CallbackEntry {
    pub(crate) kind: CallbackKind,
    pub(crate) cb: Option<fn(&mut crate::EventLoop, TimerId)>,
    pub(crate) fallthrough: bool,
    pub(crate) closed: bool,
}

pub(crate) enum PollEntry {
    Socket(SocketEntry),
    Udp(UdpEntry),
    Callback(CallbackEntry),
}

impl PollEntry {
    pub(crate) fn as_socket(&self) -> Option<&SocketEntry> {
        match self {
            PollEntry::Socket(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_socket_mut(&mut self) -> Option<&mut SocketEntry> {
        match self {
            PollEntry::Socket(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_udp_mut(&mut self) -> Option<&mut UdpEntry> {
        match self {
            PollEntry::Udp(u) => Some(u),
            _ => None,
        }
    }

    pub(crate) fn as_udp(&self) -> Option<&UdpEntry> {
        match self {
            PollEntry::Udp(u) => Some(u),
            _ => None,
        }
    }
}
