//! Socket contexts: shared callbacks plus the intrusive lists of the
//! sockets they own. Unlink keeps the sweep iterator honest so timeout
//! handlers may mutate the lists freely.

use std::any::Any;
use std::io;
use std::net::ToSocketAddrs;

use crate::poll::{ContextId, SocketEntry, SocketId, SocketKind, DISARMED};
use crate::sys;
use crate::util::Handle;
use crate::{EventLoop, Interest};

/// Listen option flags.
pub mod listen_options {
    pub const EXCLUSIVE_PORT: u32 = 1;
    pub const ALLOW_HALF_OPEN: u32 = 2;
    pub const REUSE_PORT: u32 = 4;
    pub const IPV6_ONLY: u32 = 8;
    pub const REUSE_ADDR: u32 = 16;
    pub const DISALLOW_REUSE_PORT_FAILURE: u32 = 32;
}

/// Per-context event callbacks. All of them receive the loop so they can
/// freely write, close, adopt or spawn sockets while running.
#[derive(Clone, Copy, Default)]
pub struct Callbacks {
    pub on_open: Option<fn(&mut EventLoop, SocketId, bool, &[u8])>,
    pub on_data: Option<fn(&mut EventLoop, SocketId, &mut [u8])>,
    pub on_writable: Option<fn(&mut EventLoop, SocketId)>,
    pub on_close: Option<fn(&mut EventLoop, SocketId, i32)>,
    pub on_end: Option<fn(&mut EventLoop, SocketId)>,
    pub on_timeout: Option<fn(&mut EventLoop, SocketId)>,
    pub on_long_timeout: Option<fn(&mut EventLoop, SocketId)>,
    pub on_connect_error: Option<fn(&mut EventLoop, crate::ConnectingId, i32)>,
    pub on_socket_connect_error: Option<fn(&mut EventLoop, SocketId, i32)>,
    pub is_low_prio: Option<fn(&mut EventLoop, SocketId) -> bool>,
}

pub(crate) struct ContextEntry {
    pub(crate) head_sockets: Option<usize>,
    pub(crate) head_listen: Option<usize>,
    /// Connection attempts owned by this context, swept for timeouts.
    pub(crate) connecting: Vec<Handle>,
    /// Next socket the timeout sweep will visit; unlink repairs it.
    pub(crate) iterator: Option<usize>,
    pub(crate) ref_count: u32,
    pub(crate) global_tick: u32,
    pub(crate) timestamp: u8,
    pub(crate) long_timestamp: u8,
    pub(crate) closed: bool,
    pub(crate) callbacks: Callbacks,
    pub(crate) ext: Option<Box<dyn Any>>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<Box<crate::tls::TlsContextExt>>,
}

impl ContextEntry {
    pub(crate) fn new() -> ContextEntry {
        ContextEntry {
            head_sockets: None,
            head_listen: None,
            connecting: Vec::new(),
            iterator: None,
            ref_count: 1,
            global_tick: 0,
            timestamp: 0,
            long_timestamp: 0,
            closed: false,
            callbacks: Callbacks::default(),
            ext: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl EventLoop {
    /// Create a plain (non-TLS) socket context.
    pub fn create_context(&mut self) -> ContextId {
        let handle = self.contexts.insert(ContextEntry::new());
        ContextId(handle)
    }

    /// Create a sibling context sharing nothing but the loop. For TLS
    /// contexts the SSL configuration is shared; see the `tls` module.
    pub fn create_child_context(&mut self, _parent: ContextId) -> ContextId {
        self.create_context()
    }

    /* Callback registration. For a TLS context the user callback lands in
     * the TLS extension; the base slot keeps driving the overlay. */

    pub fn context_on_open(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId, bool, &[u8])) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_open = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_open = Some(cb);
        }
    }

    pub fn context_on_data(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId, &mut [u8])) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_data = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_data = Some(cb);
        }
    }

    pub fn context_on_writable(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId)) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_writable = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_writable = Some(cb);
        }
    }

    pub fn context_on_close(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId, i32)) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_close = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_close = Some(cb);
        }
    }

    pub fn context_on_end(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId)) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_end = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_end = Some(cb);
        }
    }

    pub fn context_on_timeout(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId)) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_timeout = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_timeout = Some(cb);
        }
    }

    pub fn context_on_long_timeout(&mut self, ctx: ContextId, cb: fn(&mut EventLoop, SocketId)) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_long_timeout = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_long_timeout = Some(cb);
        }
    }

    pub fn context_on_connect_error(
        &mut self,
        ctx: ContextId,
        cb: fn(&mut EventLoop, crate::ConnectingId, i32),
    ) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_connect_error = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_connect_error = Some(cb);
        }
    }

    pub fn context_on_socket_connect_error(
        &mut self,
        ctx: ContextId,
        cb: fn(&mut EventLoop, SocketId, i32),
    ) {
        #[cfg(feature = "tls")]
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            if let Some(tls) = c.tls.as_mut() {
                tls.user.on_socket_connect_error = Some(cb);
                return;
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.callbacks.on_socket_connect_error = Some(cb);
        }
    }

    /* Context state */

    pub fn context_ext(&self, ctx: ContextId) -> Option<&(dyn Any + 'static)> {
        self.contexts
            .get(ctx.0)
            .and_then(|c| c.ext.as_deref())
    }

    pub fn context_ext_mut(&mut self, ctx: ContextId) -> Option<&mut (dyn Any + 'static)> {
        match self.contexts.get_mut(ctx.0) {
            Some(c) => c.ext.as_deref_mut(),
            None => None,
        }
    }

    pub fn set_context_ext(&mut self, ctx: ContextId, ext: Box<dyn Any>) {
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.ext = Some(ext);
        }
    }

    pub fn context_timestamp(&self, ctx: ContextId) -> u8 {
        self.contexts.get(ctx.0).map(|c| c.timestamp).unwrap_or(0)
    }

    pub fn context_of(&self, s: SocketId) -> Option<ContextId> {
        self.socket_entry(s).map(|e| ContextId(e.ctx))
    }

    /// Close every socket the context owns: listen sockets first, then the
    /// regular ones. The context itself is freed when its reference count
    /// reaches zero.
    pub fn context_close(&mut self, ctx: ContextId) {
        let mut cursor = self.contexts.get(ctx.0).and_then(|c| c.head_listen);
        while let Some(token) = cursor {
            cursor = self.socket_at(token).and_then(|s| s.next);
            if let Some(id) = self.socket_id_at(token) {
                self.close(id, crate::CLOSE_CODE_CLEAN);
            }
        }

        let mut cursor = self.contexts.get(ctx.0).and_then(|c| c.head_sockets);
        while let Some(token) = cursor {
            cursor = self.socket_at(token).and_then(|s| s.next);
            if let Some(id) = self.socket_id_at(token) {
                self.close(id, crate::CLOSE_CODE_CLEAN);
            }
        }

        let connecting = self
            .contexts
            .get(ctx.0)
            .map(|c| c.connecting.clone())
            .unwrap_or_default();
        for handle in connecting {
            self.connecting_close(crate::ConnectingId(handle));
        }
    }

    /// Drop the caller's reference. The context is reclaimed at the end of
    /// the iteration in which the last reference disappears.
    pub fn context_free(&mut self, ctx: ContextId) {
        self.context_unref(ctx.0);
    }

    /* Listening */

    /// Listen on `host:port`. Returns the listen socket, which lives in
    /// the context's listen list.
    pub fn listen(
        &mut self,
        ctx: ContextId,
        host: &str,
        port: u16,
        options: u32,
    ) -> io::Result<SocketId> {
        if !self.contexts.contains(ctx.0) {
            return Err(io::ErrorKind::NotFound.into());
        }

        let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let fd = sys::net::create_listen_socket(&addrs, options)?;

        let mut entry = SocketEntry::new(fd, SocketKind::Listen, ctx.0);
        entry.allow_half_open = options & listen_options::ALLOW_HALF_OPEN != 0;
        let id = self.add_socket_entry(entry, Interest::READABLE)?;
        self.link_listen_socket(ctx.0, id.0.index());
        Ok(id)
    }

    /// Listen on a Unix-domain path (leading NUL selects the abstract
    /// namespace on Linux).
    pub fn listen_unix(
        &mut self,
        ctx: ContextId,
        path: &[u8],
        options: u32,
    ) -> io::Result<SocketId> {
        if !self.contexts.contains(ctx.0) {
            return Err(io::ErrorKind::NotFound.into());
        }

        let fd = sys::uds::create_listen_socket(path, options)?;

        let mut entry = SocketEntry::new(fd, SocketKind::Listen, ctx.0);
        entry.allow_half_open = options & listen_options::ALLOW_HALF_OPEN != 0;
        let id = self.add_socket_entry(entry, Interest::READABLE)?;
        self.link_listen_socket(ctx.0, id.0.index());
        Ok(id)
    }

    /* Adoption */

    /// Move a socket into another context, disarming its timeouts. A socket
    /// parked in the low-priority queue stays parked; only its ownership
    /// changes.
    pub fn adopt_socket(&mut self, ctx: ContextId, s: SocketId) -> SocketId {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed => e,
            _ => return s,
        };
        let old_ctx = entry.ctx;
        let low_prio = entry.low_prio_state == 1;
        let token = s.0.index();

        if !low_prio {
            // This properly updates the iterator if inside a sweep.
            self.unlink_socket(old_ctx, token);
        } else {
            // The parked ref moves along with the socket.
            self.context_unref(old_ctx);
            self.context_ref(ctx.0);
        }

        if let Some(e) = self.socket_entry_mut(s) {
            e.timeout = DISARMED;
            e.long_timeout = DISARMED;
            e.ctx = ctx.0;
        }

        if !low_prio {
            self.link_socket(ctx.0, token);
        }

        s
    }

    /* Intrusive list plumbing. We always link at the head so no `next` of
     * a live node is ever touched by an insert. */

    pub(crate) fn link_socket(&mut self, ctx: Handle, token: usize) {
        let head = match self.contexts.get(ctx) {
            Some(c) => c.head_sockets,
            None => return,
        };
        if let Some(s) = self.socket_at_mut(token) {
            s.ctx = ctx;
            s.prev = None;
            s.next = head;
        }
        if let Some(old_head) = head {
            if let Some(s) = self.socket_at_mut(old_head) {
                s.prev = Some(token);
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx) {
            c.head_sockets = Some(token);
        }
    }

    pub(crate) fn unlink_socket(&mut self, ctx: Handle, token: usize) {
        let (prev, next) = match self.socket_at(token) {
            Some(s) => (s.prev, s.next),
            None => return,
        };

        if let Some(c) = self.contexts.get_mut(ctx) {
            // Keep the sweep iterator pointing at something real.
            if c.iterator == Some(token) {
                c.iterator = next;
            }
            if c.head_sockets == Some(token) {
                c.head_sockets = next;
            }
        }
        if let Some(p) = prev {
            if let Some(s) = self.socket_at_mut(p) {
                s.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(s) = self.socket_at_mut(n) {
                s.prev = prev;
            }
        }
        if let Some(s) = self.socket_at_mut(token) {
            s.prev = None;
            s.next = None;
        }
    }

    pub(crate) fn link_listen_socket(&mut self, ctx: Handle, token: usize) {
        let head = match self.contexts.get(ctx) {
            Some(c) => c.head_listen,
            None => return,
        };
        if let Some(s) = self.socket_at_mut(token) {
            s.ctx = ctx;
            s.prev = None;
            s.next = head;
        }
        if let Some(old_head) = head {
            if let Some(s) = self.socket_at_mut(old_head) {
                s.prev = Some(token);
            }
        }
        if let Some(c) = self.contexts.get_mut(ctx) {
            c.head_listen = Some(token);
        }
    }

    pub(crate) fn unlink_listen_socket(&mut self, ctx: Handle, token: usize) {
        let (prev, next) = match self.socket_at(token) {
            Some(s) => (s.prev, s.next),
            None => return,
        };

        if let Some(c) = self.contexts.get_mut(ctx) {
            if c.iterator == Some(token) {
                c.iterator = next;
            }
            if c.head_listen == Some(token) {
                c.head_listen = next;
            }
        }
        if let Some(p) = prev {
            if let Some(s) = self.socket_at_mut(p) {
                s.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(s) = self.socket_at_mut(n) {
                s.prev = prev;
            }
        }
        if let Some(s) = self.socket_at_mut(token) {
            s.prev = None;
            s.next = None;
        }
    }
}
