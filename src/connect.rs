//! Outbound connections: the DNS completion handoff and the
//! multi-candidate connecting-socket state machine.
//!
//! A literal IP connects directly (one semi socket polling for writable).
//! A hostname goes through a `ConnectingSocket`: the resolver completes on
//! some thread, pushes onto the loop's DNS-ready list and wakes the loop;
//! the pre-hook then fans out one candidate socket per resolved address.
//! The first candidate whose connect finishes with `SO_ERROR == 0` wins,
//! the siblings are closed without any callback.

use std::any::Any;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::event_loop::LoopShared;
use crate::poll::{ConnectingId, ContextId, SocketEntry, SocketId, SocketKind, DISARMED};
use crate::sys::net;
use crate::util::Handle;
use crate::{EventLoop, Interest};

/// Asynchronous name resolution seam. The loop only consumes completions;
/// what resolves and where is up to the implementation.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, host: &str, port: u16, completion: DnsCompletion);
}

/// One-shot completion handle for a resolution request. Completing from
/// any thread is fine; the loop drains results in its next pre-hook.
pub struct DnsCompletion {
    shared: Arc<LoopShared>,
    id: ConnectingId,
}

impl DnsCompletion {
    pub fn complete(self, result: io::Result<Vec<SocketAddr>>) {
        {
            let mut guard = self.shared.dns_ready.lock().unwrap();
            guard.push(DnsResult { id: self.id, result });
        }
        let _ = self.shared.waker.wake();
    }
}

pub(crate) struct DnsResult {
    pub(crate) id: ConnectingId,
    pub(crate) result: io::Result<Vec<SocketAddr>>,
}

/// Default resolver: the OS resolver on a helper thread.
pub struct ThreadResolver;

impl Resolver for ThreadResolver {
    fn resolve(&self, host: &str, port: u16, completion: DnsCompletion) {
        let host = host.to_owned();
        std::thread::spawn(move || {
            let result = (host.as_str(), port)
                .to_socket_addrs()
                .map(|iter| iter.collect::<Vec<_>>());
            completion.complete(result);
        });
    }
}

pub(crate) struct ConnectingEntry {
    pub(crate) ctx: Handle,
    /// Head of the candidate-socket chain, linked through `connect_next`.
    pub(crate) head: Option<usize>,
    pub(crate) port: u16,
    pub(crate) source: Option<IpAddr>,
    pub(crate) timeout: u8,
    pub(crate) long_timeout: u8,
    pub(crate) closed: bool,
    pub(crate) shutdown: bool,
    pub(crate) shutdown_read: bool,
    /// A resolution is in flight; freeing must wait for it to drain.
    pub(crate) pending_resolve_callback: bool,
    /// Sticky last syscall failure, reported by `on_connect_error`.
    pub(crate) error: i32,
    pub(crate) ext: Option<Box<dyn Any>>,
    #[cfg(feature = "tls")]
    pub(crate) sni: Option<Box<str>>,
}

/// What `connect` produced: an immediate attempt for literal addresses, or
/// a resolving attempt for hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Socket(SocketId),
    Resolving(ConnectingId),
}

impl EventLoop {
    /// Start an outbound TCP connection. `source` optionally pins the
    /// local address.
    pub fn connect(
        &mut self,
        ctx: ContextId,
        host: &str,
        port: u16,
        source: Option<IpAddr>,
    ) -> io::Result<ConnectResult> {
        if !self.contexts.contains(ctx.0) {
            return Err(io::ErrorKind::NotFound.into());
        }

        // A literal IP skips resolution entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, port);
            let fd = net::create_connect_socket(&addr, source)?;
            let entry = SocketEntry::new(fd, SocketKind::Connecting, ctx.0);
            let id = self.add_socket_entry(entry, Interest::WRITABLE)?;
            // Linked into the context so timeouts fire for it.
            self.link_socket(ctx.0, id.0.index());
            return Ok(ConnectResult::Socket(id));
        }

        let handle = self.connecting.insert(ConnectingEntry {
            ctx: ctx.0,
            head: None,
            port,
            source,
            timeout: DISARMED,
            long_timeout: DISARMED,
            closed: false,
            shutdown: false,
            shutdown_read: false,
            pending_resolve_callback: true,
            error: 0,
            ext: None,
            #[cfg(feature = "tls")]
            sni: Some(host.into()),
        });
        if let Some(c) = self.contexts.get_mut(ctx.0) {
            c.connecting.push(handle);
        }

        let id = ConnectingId(handle);
        let completion = DnsCompletion {
            shared: self.shared(),
            id,
        };
        let resolver = Arc::clone(&self.resolver);
        resolver.resolve(host, port, completion);
        Ok(ConnectResult::Resolving(id))
    }

    /// Outbound Unix-domain connection; no resolution involved.
    pub fn connect_unix(&mut self, ctx: ContextId, path: &[u8]) -> io::Result<SocketId> {
        if !self.contexts.contains(ctx.0) {
            return Err(io::ErrorKind::NotFound.into());
        }
        let fd = crate::sys::uds::create_connect_socket(path)?;
        let entry = SocketEntry::new(fd, SocketKind::Connecting, ctx.0);
        let id = self.add_socket_entry(entry, Interest::WRITABLE)?;
        self.link_socket(ctx.0, id.0.index());
        Ok(id)
    }

    /* Connecting-socket surface */

    pub fn connecting_is_closed(&self, c: ConnectingId) -> bool {
        self.connecting.get(c.0).map_or(true, |e| e.closed)
    }

    pub fn connecting_is_shut_down(&self, c: ConnectingId) -> bool {
        self.connecting.get(c.0).map_or(false, |e| e.shutdown)
    }

    /// Record that the eventual socket should start shut down / stop
    /// reading once (if) it opens.
    pub fn connecting_shutdown(&mut self, c: ConnectingId) {
        if let Some(e) = self.connecting.get_mut(c.0) {
            e.shutdown = true;
        }
    }

    pub fn connecting_shutdown_read(&mut self, c: ConnectingId) {
        if let Some(e) = self.connecting.get_mut(c.0) {
            e.shutdown_read = true;
        }
    }

    pub fn connecting_error(&self, c: ConnectingId) -> i32 {
        self.connecting.get(c.0).map_or(0, |e| e.error)
    }

    pub fn connecting_timeout(&mut self, c: ConnectingId, seconds: u32) {
        let timestamp = match self.connecting.get(c.0) {
            Some(e) if !e.closed => self.contexts.get(e.ctx).map(|x| x.timestamp).unwrap_or(0),
            _ => return,
        };
        if let Some(e) = self.connecting.get_mut(c.0) {
            e.timeout = if seconds > 0 {
                ((timestamp as u32 + ((seconds + 3) >> 2)) % 240) as u8
            } else {
                DISARMED
            };
        }
    }

    pub fn connecting_long_timeout(&mut self, c: ConnectingId, minutes: u32) {
        let long_timestamp = match self.connecting.get(c.0) {
            Some(e) if !e.closed => self
                .contexts
                .get(e.ctx)
                .map(|x| x.long_timestamp)
                .unwrap_or(0),
            _ => return,
        };
        if let Some(e) = self.connecting.get_mut(c.0) {
            e.long_timeout = if minutes > 0 {
                ((long_timestamp as u32 + minutes) % 240) as u8
            } else {
                DISARMED
            };
        }
    }

    pub fn connecting_ext(&self, c: ConnectingId) -> Option<&(dyn Any + 'static)> {
        self.connecting.get(c.0).and_then(|e| e.ext.as_deref())
    }

    pub fn set_connecting_ext(&mut self, c: ConnectingId, ext: Box<dyn Any>) {
        if let Some(e) = self.connecting.get_mut(c.0) {
            e.ext = Some(ext);
        }
    }

    /// Abort the attempt. Candidates close silently (they never reached
    /// `on_open`); `on_connect_error` fires with the sticky error, pinned
    /// to ECONNABORTED if nothing failed yet.
    pub fn connecting_close(&mut self, c: ConnectingId) {
        let entry = match self.connecting.get_mut(c.0) {
            Some(e) if !e.closed => e,
            _ => return,
        };
        entry.closed = true;
        if entry.error == 0 {
            // No failure observed: we were aborted.
            entry.error = libc::ECONNABORTED;
        }
        let ctx = entry.ctx;
        let error = entry.error;
        let head = entry.head.take();

        close_candidates(self, head);

        if let Some(cb) = self.callbacks_of(ctx).on_connect_error {
            cb(self, c, error);
        }

        free_connecting(self, c);
    }
}

/// Close every candidate socket without firing on_close.
fn close_candidates(lp: &mut EventLoop, head: Option<usize>) {
    let mut cursor = head;
    while let Some(token) = cursor {
        cursor = lp.socket_at(token).and_then(|s| s.connect_next);
        if let Some(id) = lp.socket_id_at(token) {
            if let Some(e) = lp.socket_entry_mut(id) {
                e.connect_state = None;
                e.connect_next = None;
            }
            // Still a semi socket, so close() skips on_close.
            lp.plain_close(id, crate::CLOSE_CODE_CLEAN);
        }
    }
}

/// Unlink from the context and park on the closed-connecting list. The
/// entry cannot be freed in place: it may still sit in the DNS-ready
/// queue, so the free is deferred past the iteration (or past the pending
/// resolve callback).
fn free_connecting(lp: &mut EventLoop, c: ConnectingId) {
    let pending = lp
        .connecting
        .get(c.0)
        .map_or(false, |e| e.pending_resolve_callback);
    if pending {
        return;
    }
    let ctx = match lp.connecting.get(c.0) {
        Some(e) => e.ctx,
        None => return,
    };
    if let Some(ctx_entry) = lp.contexts.get_mut(ctx) {
        ctx_entry.connecting.retain(|h| *h != c.0);
    }
    lp.closed_connecting.push(c.0);
}

/// Drained from the loop's pre/post hooks once a resolution completed.
pub(crate) fn socket_after_resolve(lp: &mut EventLoop, result: DnsResult) {
    let id = result.id;
    let entry = match lp.connecting.get_mut(id.0) {
        Some(e) => e,
        None => return,
    };
    entry.pending_resolve_callback = false;

    if entry.closed {
        // Closed while the resolver was busy; finish the deferred free.
        free_connecting(lp, id);
        return;
    }

    let ctx = entry.ctx;
    let port = entry.port;
    let source = entry.source;

    let addrs = match result.result {
        Ok(addrs) if !addrs.is_empty() => addrs,
        Ok(_) => {
            fail_connecting(lp, id, libc::ENOENT);
            return;
        }
        Err(err) => {
            fail_connecting(lp, id, err.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
    };

    // Fan out one candidate per address; all of them race. The ones whose
    // socket cannot even be created just record the errno.
    let mut last_error = 0;
    let mut head: Option<usize> = None;
    for addr in &addrs {
        let addr = SocketAddr::new(addr.ip(), port);
        let fd = match net::create_connect_socket(&addr, source) {
            Ok(fd) => fd,
            Err(err) => {
                last_error = err.raw_os_error().unwrap_or(libc::EIO);
                continue;
            }
        };
        let mut entry = SocketEntry::new(fd, SocketKind::Connecting, ctx);
        entry.connect_state = Some(id.0);
        entry.connect_next = head;
        let sid = match lp.add_socket_entry(entry, Interest::WRITABLE) {
            Ok(sid) => sid,
            Err(err) => {
                last_error = err.raw_os_error().unwrap_or(libc::EIO);
                continue;
            }
        };
        lp.link_socket(ctx, sid.0.index());
        head = Some(sid.0.index());
    }

    match lp.connecting.get_mut(id.0) {
        Some(e) => {
            e.head = head;
            if last_error != 0 {
                e.error = last_error;
            }
        }
        None => return,
    }

    if head.is_none() {
        fail_connecting(lp, id, if last_error != 0 { last_error } else { libc::EIO });
    }
}

fn fail_connecting(lp: &mut EventLoop, id: ConnectingId, errno: i32) {
    let entry = match lp.connecting.get_mut(id.0) {
        Some(e) if !e.closed => e,
        _ => return,
    };
    entry.closed = true;
    entry.error = errno;
    let ctx = entry.ctx;
    let head = entry.head.take();

    close_candidates(lp, head);

    if let Some(cb) = lp.callbacks_of(ctx).on_connect_error {
        cb(lp, id, errno);
    }
    free_connecting(lp, id);
}

/// A semi (connecting) socket turned writable: the TCP handshake finished,
/// well or badly.
pub(crate) fn socket_after_open(lp: &mut EventLoop, token: usize, error: i32) {
    let (id, fd, connect_state) = match lp.socket_at(token) {
        Some(s) if !s.closed => (
            match lp.socket_id_at(token) {
                Some(id) => id,
                None => return,
            },
            s.fd,
            s.connect_state,
        ),
        _ => return,
    };

    let errno = if error != 0 {
        error
    } else {
        net::take_so_error(fd)
    };

    match connect_state {
        Some(cid_handle) => candidate_result(lp, token, ConnectingId(cid_handle), errno),
        None => {
            if errno != 0 {
                // Direct connect failed; there is no on_close for a socket
                // that never opened, only the connect-error callback.
                let ctx = match lp.socket_entry(id) {
                    Some(e) => e.ctx,
                    None => return,
                };
                let cb = lp.callbacks_of(ctx).on_socket_connect_error;
                if let Some(cb) = cb {
                    cb(lp, id, errno);
                }
                if !lp.is_closed(id) {
                    lp.plain_close(id, crate::CLOSE_CODE_CLEAN);
                }
            } else {
                open_connected_socket(lp, token, id);
            }
        }
    }
}

/// Promote a freshly-connected semi socket to a real one and fire on_open.
fn open_connected_socket(lp: &mut EventLoop, token: usize, id: SocketId) {
    let (fd, ctx) = match lp.socket_entry_mut(id) {
        Some(e) => {
            e.kind = SocketKind::Open;
            e.connect_state = None;
            e.connect_next = None;
            (e.fd, e.ctx)
        }
        None => return,
    };

    lp.poll_change(token, Interest::READABLE);
    net::nodelay(fd, true);

    if let Some(cb) = lp.callbacks_of(ctx).on_open {
        cb(lp, id, true, &[]);
    }
}

/// One candidate of a multi-address attempt reported its connect result.
pub(crate) fn candidate_result(lp: &mut EventLoop, token: usize, cid: ConnectingId, errno: i32) {
    let alive = match lp.connecting.get(cid.0) {
        Some(e) if !e.closed => true,
        _ => false,
    };
    if !alive {
        // Attempt already concluded; this candidate is a leftover.
        if let Some(id) = lp.socket_id_at(token) {
            lp.plain_close(id, crate::CLOSE_CODE_CLEAN);
        }
        return;
    }

    if errno != 0 {
        // This candidate lost; drop it silently and remember the errno.
        unlink_candidate(lp, cid, token);
        if let Some(e) = lp.connecting.get_mut(cid.0) {
            e.error = errno;
        }
        if let Some(id) = lp.socket_id_at(token) {
            lp.plain_close(id, crate::CLOSE_CODE_CLEAN);
        }

        let exhausted = lp.connecting.get(cid.0).map_or(true, |e| e.head.is_none());
        if exhausted {
            let entry = match lp.connecting.get_mut(cid.0) {
                Some(e) => e,
                None => return,
            };
            entry.closed = true;
            let ctx = entry.ctx;
            let error = entry.error;
            if let Some(cb) = lp.callbacks_of(ctx).on_connect_error {
                cb(lp, cid, error);
            }
            free_connecting(lp, cid);
        }
        return;
    }

    // Winner: detach it from the attempt, close the silent siblings, and
    // only then let user code see the socket.
    unlink_candidate(lp, cid, token);
    let (head, shutdown, shutdown_read) = match lp.connecting.get_mut(cid.0) {
        Some(e) => {
            e.closed = true;
            (e.head.take(), e.shutdown, e.shutdown_read)
        }
        None => (None, false, false),
    };
    close_candidates(lp, head);

    #[cfg(feature = "tls")]
    {
        let sni = lp.connecting.get_mut(cid.0).and_then(|e| e.sni.take());
        if let (Some(sni), Some(id)) = (sni, lp.socket_id_at(token)) {
            let is_tls = lp
                .socket_entry(id)
                .and_then(|e| lp.contexts.get(e.ctx))
                .map_or(false, |c| c.is_tls());
            if is_tls {
                if let Some(e) = lp.socket_entry_mut(id) {
                    e.sni = Some(sni);
                }
            }
        }
    }

    free_connecting(lp, cid);

    let id = match lp.socket_id_at(token) {
        Some(id) => id,
        None => return,
    };
    if let Some(e) = lp.socket_entry_mut(id) {
        e.connect_state = None;
        e.connect_next = None;
    }
    open_connected_socket(lp, token, id);

    if shutdown && !lp.is_closed(id) {
        lp.shutdown(id);
    }
    if shutdown_read && !lp.is_closed(id) {
        lp.shutdown_read(id);
    }
}

fn unlink_candidate(lp: &mut EventLoop, cid: ConnectingId, token: usize) {
    let head = match lp.connecting.get(cid.0) {
        Some(e) => e.head,
        None => return,
    };
    if head == Some(token) {
        let next = lp.socket_at(token).and_then(|s| s.connect_next);
        if let Some(e) = lp.connecting.get_mut(cid.0) {
            e.head = next;
        }
        return;
    }
    let mut cursor = head;
    while let Some(t) = cursor {
        let next = lp.socket_at(t).and_then(|s| s.connect_next);
        if next == Some(token) {
            let skip = lp.socket_at(token).and_then(|s| s.connect_next);
            if let Some(s) = lp.socket_at_mut(t) {
                s.connect_next = skip;
            }
            return;
        }
        cursor = next;
    }
}

/// Sweep the context's connection attempts with the same two counters the
/// sockets use; a fired short deadline aborts the attempt with ETIMEDOUT.
pub(crate) fn sweep_connecting(lp: &mut EventLoop, ctx: Handle, short: u8, long: u8) {
    let attempts = match lp.contexts.get(ctx) {
        Some(c) => c.connecting.clone(),
        None => return,
    };
    for handle in attempts {
        let fired = match lp.connecting.get_mut(handle) {
            Some(e) if !e.closed => {
                if e.timeout == short || e.long_timeout == long {
                    if e.timeout == short {
                        e.timeout = DISARMED;
                    }
                    if e.long_timeout == long {
                        e.long_timeout = DISARMED;
                    }
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if fired {
            if let Some(e) = lp.connecting.get_mut(handle) {
                e.error = libc::ETIMEDOUT;
            }
            lp.connecting_close(ConnectingId(handle));
        }
    }
}
