//! The loop driver: poll multiplexing, dispatch fan-out, the timeout sweep,
//! the low-priority queue and end-of-iteration reclamation.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connect::{ConnectingEntry, DnsResult, Resolver, ThreadResolver};
use crate::context::ContextEntry;
use crate::poll::{
    CallbackEntry, CallbackKind, PollEntry, SocketEntry, SocketId, SocketKind, TimerId, UdpId,
    DISARMED,
};
use crate::sys::{self, event};
use crate::util::{Arena, Handle};
use crate::{Interest, CLOSE_CODE_CLEAN, RECV_BUFFER_LENGTH, RECV_BUFFER_PADDING};

/// Maximum ready events fetched per iteration.
const MAX_READY_POLLS: usize = 1024;

/// Do not drown the loop in CPU-intensive handshakes: at most this many
/// parked sockets get serviced per iteration, the rest keep waiting in
/// kernel buffers.
const MAX_LOW_PRIO_SOCKETS_PER_LOOP_ITERATION: i32 = 5;

/// Seconds per timeout-sweep tick.
pub(crate) const TIMEOUT_GRANULARITY: u64 = 4;

/// One iteration is not allowed to keep re-reading a single socket forever;
/// see `socket_readable`.
const LOOP_ISNT_VERY_BUSY_THRESHOLD: usize = 25;

pub(crate) struct LoopShared {
    pub(crate) waker: sys::Waker,
    pub(crate) dns_ready: Mutex<Vec<DnsResult>>,
}

/// Cross-thread handle that forces the loop out of its wait. The only
/// thread-safe entry point besides the DNS completion handoff.
#[derive(Clone)]
pub struct LoopWaker {
    shared: Arc<LoopShared>,
}

impl LoopWaker {
    pub fn wake(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }
}

/// A single-threaded event loop owning contexts, sockets, timers and the
/// shared receive buffer. All callbacks run to completion on the loop
/// thread; there is no preemption inside a dispatch.
pub struct EventLoop {
    selector: sys::Selector,
    events: sys::Events,
    pub(crate) polls: Arena<PollEntry>,
    pub(crate) contexts: Arena<ContextEntry>,
    pub(crate) connecting: Arena<ConnectingEntry>,

    /// `[32 bytes padding][512 KiB recv area][32 bytes padding]`, shared by
    /// every receive in an iteration. Consumers may scribble framing into
    /// the padding; nothing survives past the callback.
    pub(crate) recv_buf: Vec<u8>,
    #[cfg(feature = "tls")]
    pub(crate) tls_scratch: Vec<u8>,
    pub(crate) udp_batch: Option<Box<sys::udp::UdpBatch>>,

    /// Polls that keep the loop alive; fallthrough polls (sweep timer,
    /// wakeup) are not counted.
    num_polls: usize,
    iteration_nr: u64,
    pub(crate) num_ready_polls: usize,
    pub(crate) last_write_failed: bool,

    /// LIFO queue of parked low-priority sockets; fresher clients first.
    low_prio: Vec<usize>,
    low_prio_budget: i32,

    closed_sockets: Vec<Handle>,
    closed_udps: Vec<Handle>,
    pub(crate) closed_connecting: Vec<Handle>,
    closed_contexts: Vec<Handle>,

    sweep_timer: TimerId,
    integrated: bool,

    shared: Arc<LoopShared>,
    pub(crate) resolver: Arc<dyn Resolver>,

    on_wakeup: Option<fn(&mut EventLoop)>,
    on_pre: Option<fn(&mut EventLoop)>,
    on_post: Option<fn(&mut EventLoop)>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_resolver(Arc::new(ThreadResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> io::Result<EventLoop> {
        let selector = sys::Selector::new()?;
        let mut polls = Arena::new();

        // The wakeup async rides the same dispatch path as every other
        // poll, but does not keep the loop alive.
        let waker_handle = polls.insert(PollEntry::Callback(CallbackEntry {
            kind: CallbackKind::Waker,
            cb: None,
            fallthrough: true,
            closed: false,
        }));
        let waker = sys::Waker::new(&selector, waker_handle.index())?;

        // Same for the sweep timer; it is armed on the first run.
        let timer = sys::Timer::new(0)?;
        let sweep_handle = polls.insert(PollEntry::Callback(CallbackEntry {
            kind: CallbackKind::Timer(timer),
            cb: None,
            fallthrough: true,
            closed: false,
        }));
        if let Some(PollEntry::Callback(cb)) = polls.get_at_mut(sweep_handle.index()) {
            if let CallbackKind::Timer(ref mut t) = cb.kind {
                t.rebind(sweep_handle.index());
            }
        }

        Ok(EventLoop {
            selector,
            events: sys::Events::with_capacity(MAX_READY_POLLS),
            polls,
            contexts: Arena::new(),
            connecting: Arena::new(),
            recv_buf: vec![0; RECV_BUFFER_LENGTH + RECV_BUFFER_PADDING * 2],
            #[cfg(feature = "tls")]
            tls_scratch: vec![0; RECV_BUFFER_LENGTH + RECV_BUFFER_PADDING * 2],
            udp_batch: Some(Box::new(sys::udp::UdpBatch::new())),
            num_polls: 0,
            iteration_nr: 0,
            num_ready_polls: 0,
            last_write_failed: false,
            low_prio: Vec::new(),
            low_prio_budget: 0,
            closed_sockets: Vec::new(),
            closed_udps: Vec::new(),
            closed_connecting: Vec::new(),
            closed_contexts: Vec::new(),
            sweep_timer: TimerId(sweep_handle),
            integrated: false,
            shared: Arc::new(LoopShared {
                waker,
                dns_ready: Mutex::new(Vec::new()),
            }),
            resolver,
            on_wakeup: None,
            on_pre: None,
            on_post: None,
        })
    }

    /// Handle for waking this loop from another thread.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn shared(&self) -> Arc<LoopShared> {
        Arc::clone(&self.shared)
    }

    pub fn iteration_number(&self) -> u64 {
        self.iteration_nr
    }

    /// Called after a cross-thread wakeup has been drained.
    pub fn on_wakeup(&mut self, cb: fn(&mut EventLoop)) {
        self.on_wakeup = Some(cb);
    }

    /// Called at the top of every iteration, before the wait.
    pub fn on_pre(&mut self, cb: fn(&mut EventLoop)) {
        self.on_pre = Some(cb);
    }

    /// Called at the end of every iteration, after closed resources have
    /// been reclaimed.
    pub fn on_post(&mut self, cb: fn(&mut EventLoop)) {
        self.on_post = Some(cb);
    }

    /// Arm the sweep timer. Running the loop does this automatically.
    pub fn integrate(&mut self) -> io::Result<()> {
        if self.integrated {
            return Ok(());
        }
        self.integrated = true;
        self.timer_set(
            self.sweep_timer,
            |lp, _| lp.timer_sweep(),
            TIMEOUT_GRANULARITY * 1000,
            TIMEOUT_GRANULARITY * 1000,
        )
    }

    /// Run until no non-fallthrough polls remain.
    pub fn run(&mut self) -> io::Result<()> {
        self.integrate()?;
        while self.num_polls > 0 {
            self.iterate(None)?;
        }
        Ok(())
    }

    /// Run a single iteration, waiting at most `timeout` (`None` blocks
    /// indefinitely). Unlike [`run`](EventLoop::run) this does not care
    /// whether any polls are live: pending cross-thread work (wakeups, DNS
    /// completions) is still drained.
    pub fn run_tick(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.integrate()?;
        self.iterate(timeout)
    }

    fn iterate(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.pre_iteration();

        let mut events = std::mem::take(&mut self.events);
        if events.capacity() == 0 {
            events.reserve(MAX_READY_POLLS);
        }
        let res = self.selector.select(&mut events, timeout);
        let n = match res {
            Ok(n) => n,
            Err(err) => {
                self.events = events;
                return Err(err);
            }
        };
        self.num_ready_polls = n;

        for i in 0..n {
            let ev = &events[i];
            self.dispatch_ready_poll(
                event::token(ev),
                event::is_error(ev),
                event::is_eof(ev),
                event::is_readable(ev),
                event::is_writable(ev),
            );
        }
        self.events = events;

        self.post_iteration();
        Ok(())
    }

    fn pre_iteration(&mut self) {
        self.iteration_nr += 1;
        self.handle_dns_results();
        self.handle_low_priority_sockets();
        if let Some(cb) = self.on_pre {
            cb(self);
        }
    }

    fn post_iteration(&mut self) {
        self.handle_dns_results();
        self.free_closed();
        if let Some(cb) = self.on_post {
            cb(self);
        }
    }

    fn handle_dns_results(&mut self) {
        let drained: Vec<DnsResult> = {
            let mut guard = self.shared.dns_ready.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for result in drained {
            crate::connect::socket_after_resolve(self, result);
        }
    }

    /// Re-admit up to the per-iteration budget of parked sockets, newest
    /// first, re-enabling their readable subscription.
    fn handle_low_priority_sockets(&mut self) {
        self.low_prio_budget = MAX_LOW_PRIO_SOCKETS_PER_LOOP_ITERATION;

        while self.low_prio_budget > 0 {
            let Some(token) = self.low_prio.pop() else {
                break;
            };
            self.low_prio_budget -= 1;

            let Some(entry) = self.socket_at_mut(token) else {
                continue;
            };
            entry.low_prio_state = 2;
            let ctx = entry.ctx;
            self.link_socket(ctx, token);
            let interest = self
                .socket_at(token)
                .map(|s| s.interest)
                .unwrap_or(Interest::NONE);
            self.poll_change(token, interest | Interest::READABLE);
            self.context_unref(ctx);
        }
    }

    fn free_closed(&mut self) {
        // Strictly after all user callbacks of this iteration.
        for handle in std::mem::take(&mut self.closed_sockets) {
            if self.polls.remove(handle).is_some() {
                self.num_polls -= 1;
            }
        }
        for handle in std::mem::take(&mut self.closed_udps) {
            if self.polls.remove(handle).is_some() {
                self.num_polls -= 1;
            }
        }
        for handle in std::mem::take(&mut self.closed_connecting) {
            self.connecting.remove(handle);
        }
        for handle in std::mem::take(&mut self.closed_contexts) {
            self.contexts.remove(handle);
        }
    }

    /* Entry accessors */

    pub(crate) fn socket_at(&self, token: usize) -> Option<&SocketEntry> {
        self.polls.get_at(token).and_then(PollEntry::as_socket)
    }

    pub(crate) fn socket_at_mut(&mut self, token: usize) -> Option<&mut SocketEntry> {
        self.polls
            .get_at_mut(token)
            .and_then(PollEntry::as_socket_mut)
    }

    pub(crate) fn socket_entry(&self, id: SocketId) -> Option<&SocketEntry> {
        self.polls.get(id.0).and_then(PollEntry::as_socket)
    }

    pub(crate) fn socket_entry_mut(&mut self, id: SocketId) -> Option<&mut SocketEntry> {
        self.polls.get_mut(id.0).and_then(PollEntry::as_socket_mut)
    }

    pub(crate) fn socket_id_at(&self, token: usize) -> Option<SocketId> {
        self.polls.handle_at(token).map(SocketId)
    }

    /// Register a new socket entry with the backend and arena.
    pub(crate) fn add_socket_entry(
        &mut self,
        entry: SocketEntry,
        interest: Interest,
    ) -> io::Result<SocketId> {
        let fd = entry.fd;
        let mut entry = entry;
        entry.interest = interest;
        let handle = self.polls.insert(PollEntry::Socket(entry));
        if let Err(err) = self.selector.register(fd, handle.index(), interest) {
            self.polls.remove(handle);
            return Err(err);
        }
        self.num_polls += 1;
        Ok(SocketId(handle))
    }

    /// Register a non-socket poll (UDP) with the backend.
    pub(crate) fn register_poll(
        &mut self,
        fd: std::os::fd::RawFd,
        token: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.selector.register(fd, token, interest)?;
        self.num_polls += 1;
        Ok(())
    }

    /// Change what a poll is subscribed to; no-op when unchanged.
    pub(crate) fn poll_change(&mut self, token: usize, new: Interest) {
        let (fd, old) = match self.polls.get_at_mut(token) {
            Some(PollEntry::Socket(s)) => {
                let old = s.interest;
                s.interest = new;
                (s.fd, old)
            }
            Some(PollEntry::Udp(u)) => {
                let old = u.interest;
                u.interest = new;
                (u.fd, old)
            }
            _ => return,
        };
        if old != new {
            if let Err(err) = self.selector.reregister(fd, token, old, new) {
                error_log!("reregister of fd {} failed: {}", fd, err);
            }
        }
    }

    pub(crate) fn poll_stop(&mut self, token: usize) {
        let (fd, old) = match self.polls.get_at(token) {
            Some(PollEntry::Socket(s)) => (s.fd, s.interest),
            Some(PollEntry::Udp(u)) => (u.fd, u.interest),
            _ => return,
        };
        // The fd may already be gone (kqueue removes closed fds on its
        // own), so a failure here is expected noise.
        let _ = self.selector.deregister(fd, old);
    }

    pub(crate) fn defer_socket_free(&mut self, handle: Handle) {
        self.closed_sockets.push(handle);
    }

    pub(crate) fn defer_udp_free(&mut self, handle: Handle) {
        self.closed_udps.push(handle);
    }

    /* Context helpers shared with the other modules */

    pub(crate) fn context_ref(&mut self, ctx: Handle) {
        if let Some(c) = self.contexts.get_mut(ctx) {
            c.ref_count += 1;
        }
    }

    pub(crate) fn context_unref(&mut self, ctx: Handle) {
        if let Some(c) = self.contexts.get_mut(ctx) {
            c.ref_count = c.ref_count.saturating_sub(1);
            if c.ref_count == 0 && !c.closed {
                c.closed = true;
                self.closed_contexts.push(ctx);
            }
        }
    }

    /* Low-priority queue */

    pub(crate) fn low_prio_push(&mut self, token: usize) {
        self.low_prio.push(token);
    }

    pub(crate) fn low_prio_remove(&mut self, token: usize) {
        self.low_prio.retain(|t| *t != token);
    }

    /* Timers */

    /// Create a timer. `fallthrough` timers do not keep the loop alive.
    pub fn create_timer(&mut self, fallthrough: bool) -> io::Result<TimerId> {
        let timer = sys::Timer::new(0)?;
        let handle = self.polls.insert(PollEntry::Callback(CallbackEntry {
            kind: CallbackKind::Timer(timer),
            cb: None,
            fallthrough,
            closed: false,
        }));
        if let Some(PollEntry::Callback(cb)) = self.polls.get_at_mut(handle.index()) {
            if let CallbackKind::Timer(ref mut t) = cb.kind {
                t.rebind(handle.index());
            }
        }
        if !fallthrough {
            self.num_polls += 1;
        }
        Ok(TimerId(handle))
    }

    /// Arm `timer` to fire `cb` after `ms`, repeating every `repeat_ms`
    /// when non-zero.
    pub fn timer_set(
        &mut self,
        timer: TimerId,
        cb: fn(&mut EventLoop, TimerId),
        ms: u64,
        repeat_ms: u64,
    ) -> io::Result<()> {
        let EventLoop {
            ref selector,
            ref mut polls,
            ..
        } = *self;
        match polls.get_mut(timer.0) {
            Some(PollEntry::Callback(entry)) => {
                entry.cb = Some(cb);
                if let CallbackKind::Timer(ref mut t) = entry.kind {
                    t.set(selector, ms, repeat_ms)
                } else {
                    Ok(())
                }
            }
            _ => Err(io::ErrorKind::NotFound.into()),
        }
    }

    pub fn timer_close(&mut self, timer: TimerId) {
        let EventLoop {
            ref selector,
            ref mut polls,
            ..
        } = *self;
        let fallthrough = match polls.get_mut(timer.0) {
            Some(PollEntry::Callback(entry)) if !entry.closed => {
                entry.closed = true;
                if let CallbackKind::Timer(ref mut t) = entry.kind {
                    let _ = t.stop(selector);
                }
                entry.fallthrough
            }
            _ => return,
        };
        self.polls.remove(timer.0);
        if !fallthrough {
            self.num_polls -= 1;
        }
    }

    /* Dispatch */

    fn dispatch_ready_poll(
        &mut self,
        token: usize,
        error: bool,
        eof: bool,
        readable: bool,
        writable: bool,
    ) {
        // A poll closed earlier in this iteration (or never ours) is
        // skipped; slot reuse cannot bite because reclamation happens only
        // after dispatch.
        match self.polls.get_at(token) {
            Some(PollEntry::Callback(cb)) if !cb.closed => {
                self.dispatch_callback(token);
            }
            Some(PollEntry::Socket(s)) if !s.closed => {
                let readable = readable && s.interest.is_readable();
                let writable = writable && s.interest.is_writable();
                if !(readable || writable || error || eof) {
                    return;
                }
                if s.kind.is_semi() {
                    self.dispatch_semi_socket(token, error, eof, readable, writable);
                } else {
                    self.dispatch_socket(token, error, eof, readable, writable);
                }
            }
            Some(PollEntry::Udp(u)) if !u.closed => {
                let readable = readable && u.interest.is_readable();
                let writable = writable && u.interest.is_writable();
                crate::udp::dispatch(self, token, error, readable, writable);
            }
            _ => {}
        }
    }

    fn dispatch_callback(&mut self, token: usize) {
        enum Fired {
            Waker,
            Timer(i32, Option<fn(&mut EventLoop, TimerId)>),
        }

        let fired = match self.polls.get_at(token) {
            Some(PollEntry::Callback(entry)) => match entry.kind {
                CallbackKind::Waker => Fired::Waker,
                CallbackKind::Timer(ref timer) => Fired::Timer(timer.raw_fd(), entry.cb),
            },
            _ => return,
        };

        match fired {
            Fired::Waker => {
                self.shared.waker.ack();
                if let Some(cb) = self.on_wakeup {
                    cb(self);
                }
            }
            Fired::Timer(fd, cb) => {
                if fd >= 0 {
                    // timerfd must be read-drained or it stays ready.
                    let mut buf = [0u8; 8];
                    loop {
                        let res =
                            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
                        if res != -1
                            || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted
                        {
                            break;
                        }
                    }
                }
                if let (Some(cb), Some(handle)) = (cb, self.polls.handle_at(token)) {
                    cb(self, TimerId(handle));
                }
            }
        }
    }

    /// A semi socket is either listening (readable: accept) or still
    /// connecting (writable: the TCP handshake finished, well or not).
    fn dispatch_semi_socket(
        &mut self,
        token: usize,
        error: bool,
        eof: bool,
        readable: bool,
        writable: bool,
    ) {
        let kind = match self.socket_at(token) {
            Some(s) => s.kind,
            None => return,
        };

        if kind == SocketKind::Connecting {
            if writable || error || eof {
                let errno = if error || eof {
                    let fd = self.socket_at(token).map(|s| s.fd).unwrap_or(-1);
                    let so = sys::net::take_so_error(fd);
                    if so != 0 {
                        so
                    } else {
                        libc::ECONNREFUSED
                    }
                } else {
                    0
                };
                crate::connect::socket_after_open(self, token, errno);
            }
            return;
        }

        // Listen socket: accept until the well runs dry.
        if !readable {
            return;
        }
        loop {
            let listen_fd = match self.socket_at(token) {
                Some(s) if !s.closed => s.fd,
                _ => break,
            };
            let (client_fd, peer) = match sys::net::accept(listen_fd) {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };

            // We always use nodelay.
            sys::net::nodelay(client_fd, true);

            let (ctx, allow_half_open) = match self.socket_at(token) {
                Some(s) => (s.ctx, s.allow_half_open),
                None => {
                    sys::net::close(client_fd);
                    break;
                }
            };

            let mut entry = SocketEntry::new(client_fd, SocketKind::Open, ctx);
            entry.allow_half_open = allow_half_open;
            let child = match self.add_socket_entry(entry, Interest::READABLE) {
                Ok(id) => id,
                Err(_) => {
                    sys::net::close(client_fd);
                    break;
                }
            };
            self.link_socket(ctx, child.0.index());

            let (ip, ip_len) = sys::net::ip_bytes(&peer);
            let cb = self.callbacks_of(ctx).on_open;
            if let Some(cb) = cb {
                cb(self, child, false, &ip[..ip_len]);
            }

            // Exit the accept loop if the listen socket was closed in the
            // on_open handler.
            match self.socket_at(token) {
                Some(s) if !s.closed => {}
                _ => break,
            }
        }
    }

    fn dispatch_socket(
        &mut self,
        token: usize,
        error: bool,
        eof: bool,
        readable: bool,
        writable: bool,
    ) {
        if writable && !error {
            // Note: if we failed a write as a socket of one loop then got
            // adopted to another loop this would be wrong, but that case
            // is absurd.
            self.last_write_failed = false;

            let id = match self.socket_id_at(token) {
                Some(id) => id,
                None => return,
            };
            let ctx = match self.socket_at(token) {
                Some(s) => s.ctx,
                None => return,
            };
            if let Some(cb) = self.callbacks_of(ctx).on_writable {
                cb(self, id);
            }

            let still_open = matches!(self.socket_at(token), Some(s) if !s.closed);
            if !still_open {
                return;
            }

            // If no write failed (or we are shut down), stop polling for
            // writable.
            let shut_down = self
                .socket_at(token)
                .map(|s| s.is_shut_down())
                .unwrap_or(false);
            if !self.last_write_failed || shut_down {
                let interest = self
                    .socket_at(token)
                    .map(|s| s.interest)
                    .unwrap_or(Interest::NONE);
                self.poll_change(token, interest.remove(Interest::WRITABLE));
            }
        }

        if readable {
            let still_open = matches!(self.socket_at(token), Some(s) if !s.closed);
            if still_open && !self.socket_readable(token, error || eof) {
                return;
            }
        }

        // Such as EPOLLERR.
        if error {
            let still_open = matches!(self.socket_at(token), Some(s) if !s.closed);
            if still_open {
                if let Some(id) = self.socket_id_at(token) {
                    self.close(id, crate::CLOSE_CODE_CONNECTION_RESET);
                }
            }
        }
    }

    /// Returns `false` when the socket went away and dispatch must stop.
    fn socket_readable(&mut self, token: usize, hung_up: bool) -> bool {
        let id = match self.socket_id_at(token) {
            Some(id) => id,
            None => return false,
        };
        let ctx = match self.socket_at(token) {
            Some(s) => s.ctx,
            None => return false,
        };

        // Contexts may prioritize down sockets that are currently readable,
        // e.g. when a TLS handshake has to be done. Handshakes are CPU
        // intensive, so the surplus moves to the low-priority queue.
        if let Some(is_low_prio) = self.callbacks_of(ctx).is_low_prio {
            if is_low_prio(self, id) {
                let state = self
                    .socket_entry(id)
                    .map(|s| s.low_prio_state)
                    .unwrap_or(0);
                if state == 2 {
                    // Was delayed; process incoming data for one iteration.
                    if let Some(s) = self.socket_entry_mut(id) {
                        s.low_prio_state = 0;
                    }
                } else if self.low_prio_budget > 0 {
                    self.low_prio_budget -= 1;
                } else {
                    let interest = self
                        .socket_entry(id)
                        .map(|s| s.interest)
                        .unwrap_or(Interest::NONE);
                    self.poll_change(token, interest.remove(Interest::READABLE));
                    self.context_ref(ctx);
                    self.unlink_socket(ctx, token);
                    self.low_prio_push(token);
                    if let Some(s) = self.socket_entry_mut(id) {
                        s.low_prio_state = 1;
                    }
                    return true;
                }
            }
        }

        let mut repeat_recv_count = 0usize;
        loop {
            let fd = match self.socket_entry(id) {
                Some(s) if !s.closed => s.fd,
                _ => return false,
            };

            let mut buf = std::mem::take(&mut self.recv_buf);
            if buf.is_empty() {
                // Re-entrant dispatch stole the buffer; do not recurse.
                return true;
            }
            let length = sys::net::recv(
                fd,
                &mut buf[RECV_BUFFER_PADDING..RECV_BUFFER_PADDING + RECV_BUFFER_LENGTH],
            );

            if length > 0 {
                let length = length as usize;
                let cb = self.callbacks_of(ctx).on_data;
                if let Some(cb) = cb {
                    cb(
                        self,
                        id,
                        &mut buf[RECV_BUFFER_PADDING..RECV_BUFFER_PADDING + length],
                    );
                }
                self.recv_buf = buf;

                let still_open = matches!(self.socket_entry(id), Some(s) if !s.closed);
                if !still_open {
                    return false;
                }

                // Rare case: we are reading a lot of data and either the
                // socket hung up (no more events coming for it) or the
                // loop is not very busy, so we can read again instead of
                // waiting a full iteration.
                if length >= RECV_BUFFER_LENGTH - 24 * 1024
                    && length <= RECV_BUFFER_LENGTH
                    && (hung_up || self.num_ready_polls < LOOP_ISNT_VERY_BUSY_THRESHOLD)
                {
                    repeat_recv_count += !hung_up as usize;

                    // Read a maximum of 10 times in a row to avoid
                    // starving other sockets.
                    if !(repeat_recv_count > 10 && self.num_ready_polls > 2) {
                        continue;
                    }
                }
                return true;
            } else if length == 0 {
                self.recv_buf = buf;
                let shut_down = self
                    .socket_entry(id)
                    .map(|s| s.is_shut_down())
                    .unwrap_or(false);
                if shut_down {
                    // We got FIN back after sending ours.
                    self.close(id, CLOSE_CODE_CLEAN);
                    return false;
                } else {
                    // We got FIN, so stop polling for readable.
                    let interest = self
                        .socket_entry(id)
                        .map(|s| s.interest)
                        .unwrap_or(Interest::NONE);
                    self.poll_change(token, interest.remove(Interest::READABLE));
                    let cb = self.callbacks_of(ctx).on_end;
                    if let Some(cb) = cb {
                        cb(self, id);
                    }
                    return matches!(self.socket_entry(id), Some(s) if !s.closed);
                }
            } else {
                self.recv_buf = buf;
                if !sys::net::would_block_errno() {
                    self.close(id, CLOSE_CODE_CLEAN);
                    return false;
                }
                return true;
            }
        }
    }

    /* Timeout sweep */

    /// Advance both per-context tick counters and fire matching timeouts.
    /// This function never runs recursively.
    pub(crate) fn timer_sweep(&mut self) {
        let ctx_handles: Vec<Handle> = self.contexts.iter().map(|(h, _)| h).collect();

        for ch in ctx_handles {
            let (short_ticks, long_ticks) = match self.contexts.get_mut(ch) {
                Some(c) if !c.closed => {
                    c.global_tick = c.global_tick.wrapping_add(1);
                    c.timestamp = (c.global_tick % 240) as u8;
                    c.long_timestamp = ((c.global_tick / 15) % 240) as u8;
                    (c.timestamp, c.long_timestamp)
                }
                _ => continue,
            };

            let mut cursor = self.contexts.get(ch).and_then(|c| c.head_sockets);
            while let Some(token) = cursor {
                // Seek until end or a timeout match (tightest loop).
                let entry = match self.socket_at(token) {
                    Some(s) => s,
                    None => break,
                };
                if entry.timeout != short_ticks && entry.long_timeout != long_ticks {
                    cursor = entry.next;
                    continue;
                }

                // A timeout to emit (slow path). Park the iterator so the
                // handler may link and unlink whatever it wants.
                if let Some(c) = self.contexts.get_mut(ch) {
                    c.iterator = Some(token);
                }
                let id = match self.socket_id_at(token) {
                    Some(id) => id,
                    None => break,
                };
                let callbacks = self.callbacks_of(ch);

                if self.socket_at(token).map(|s| s.timeout) == Some(short_ticks) {
                    if let Some(s) = self.socket_at_mut(token) {
                        s.timeout = DISARMED;
                    }
                    if let Some(cb) = callbacks.on_timeout {
                        cb(self, id);
                    }
                }

                let iterator_intact =
                    self.contexts.get(ch).and_then(|c| c.iterator) == Some(token);
                if iterator_intact
                    && self.socket_at(token).map(|s| s.long_timeout) == Some(long_ticks)
                {
                    if let Some(s) = self.socket_at_mut(token) {
                        s.long_timeout = DISARMED;
                    }
                    if let Some(cb) = callbacks.on_long_timeout {
                        cb(self, id);
                    }
                }

                // If the handler did not modify the chain we step one;
                // otherwise resume from wherever the iterator points now.
                let ctx_now = match self.contexts.get(ch) {
                    Some(c) if !c.closed => c,
                    _ => break,
                };
                if ctx_now.iterator == Some(token) {
                    cursor = self.socket_at(token).and_then(|s| s.next);
                } else {
                    cursor = ctx_now.iterator;
                }
            }
            if let Some(c) = self.contexts.get_mut(ch) {
                c.iterator = None;
            }

            crate::connect::sweep_connecting(self, ch, short_ticks, long_ticks);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Close every fd still registered; memory goes with the arenas.
        let fds: Vec<i32> = self
            .polls
            .iter()
            .filter_map(|(_, entry)| match entry {
                PollEntry::Socket(s) if !s.closed => Some(s.fd),
                PollEntry::Udp(u) if !u.closed => Some(u.fd),
                _ => None,
            })
            .collect();
        for fd in fds {
            sys::net::close(fd);
        }
    }
}

/* Accessors used across modules but not part of the public surface */

impl EventLoop {
    pub(crate) fn callbacks_of(&self, ctx: Handle) -> crate::context::Callbacks {
        self.contexts
            .get(ctx)
            .map(|c| c.callbacks)
            .unwrap_or_default()
    }

    pub(crate) fn udp_id_at(&self, token: usize) -> Option<UdpId> {
        self.polls.handle_at(token).map(UdpId)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::EventLoop;
    use crate::poll::DISARMED;

    static SHORT_FIRED: AtomicUsize = AtomicUsize::new(0);
    static LONG_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn pair(lp: &mut EventLoop) -> (crate::SocketId, crate::ContextId) {
        let ctx = lp.create_context();
        let (s, peer) = lp.socket_pair(ctx).expect("socketpair");
        // The far end is not under test.
        crate::sys::net::close(peer);
        (s, ctx)
    }

    #[test]
    fn short_timeout_fires_within_one_tick_window() {
        SHORT_FIRED.store(0, Ordering::SeqCst);

        let mut lp = EventLoop::new().unwrap();
        let (s, ctx) = pair(&mut lp);
        lp.context_on_timeout(ctx, |_, _| {
            SHORT_FIRED.fetch_add(1, Ordering::SeqCst);
        });

        lp.socket_timeout(s, 5);
        // ceil(5 / 4) = 2 ticks.
        lp.timer_sweep();
        assert_eq!(SHORT_FIRED.load(Ordering::SeqCst), 0);
        lp.timer_sweep();
        assert_eq!(SHORT_FIRED.load(Ordering::SeqCst), 1);

        // Fired timeouts disarm; further sweeps stay silent.
        for _ in 0..240 {
            lp.timer_sweep();
        }
        assert_eq!(SHORT_FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleared_timeout_never_fires() {
        SHORT_FIRED.store(0, Ordering::SeqCst);

        let mut lp = EventLoop::new().unwrap();
        let (s, ctx) = pair(&mut lp);
        lp.context_on_timeout(ctx, |_, _| {
            SHORT_FIRED.fetch_add(1, Ordering::SeqCst);
        });

        lp.socket_timeout(s, 5);
        lp.socket_timeout(s, 0);
        assert_eq!(lp.socket_entry(s).unwrap().timeout, DISARMED);

        for _ in 0..240 {
            lp.timer_sweep();
        }
        assert_eq!(SHORT_FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn long_timeout_uses_minute_ticks() {
        LONG_FIRED.store(0, Ordering::SeqCst);

        let mut lp = EventLoop::new().unwrap();
        let (s, ctx) = pair(&mut lp);
        lp.context_on_long_timeout(ctx, |_, _| {
            LONG_FIRED.fetch_add(1, Ordering::SeqCst);
        });

        lp.socket_long_timeout(s, 1);
        // One long tick is 15 sweeps (one minute of 4 s ticks).
        for _ in 0..14 {
            lp.timer_sweep();
        }
        assert_eq!(LONG_FIRED.load(Ordering::SeqCst), 0);
        lp.timer_sweep();
        assert_eq!(LONG_FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_handler_may_close_its_socket() {
        SHORT_FIRED.store(0, Ordering::SeqCst);

        let mut lp = EventLoop::new().unwrap();
        let (a, ctx) = pair(&mut lp);
        let (b, _) = lp.socket_pair(ctx).unwrap();
        lp.context_on_timeout(ctx, |lp, s| {
            SHORT_FIRED.fetch_add(1, Ordering::SeqCst);
            lp.close(s, crate::CLOSE_CODE_CLEAN);
        });

        // Both sockets time out on the same tick; closing the first from
        // its handler must not derail the sweep over the second.
        lp.socket_timeout(a, 1);
        lp.socket_timeout(b, 1);
        lp.timer_sweep();
        assert_eq!(SHORT_FIRED.load(Ordering::SeqCst), 2);
        assert!(lp.is_closed(a));
        assert!(lp.is_closed(b));
    }

    #[test]
    fn adopt_resets_timeouts_and_moves_lists() {
        let mut lp = EventLoop::new().unwrap();
        let (s, ctx_a) = pair(&mut lp);
        let ctx_b = lp.create_context();

        lp.socket_timeout(s, 30);
        lp.socket_long_timeout(s, 3);

        let s = lp.adopt_socket(ctx_b, s);
        assert_eq!(lp.context_of(s), Some(ctx_b));
        assert_eq!(lp.socket_entry(s).unwrap().timeout, DISARMED);
        assert_eq!(lp.socket_entry(s).unwrap().long_timeout, DISARMED);

        // Adopting back restores the original list membership.
        let s = lp.adopt_socket(ctx_a, s);
        assert_eq!(lp.context_of(s), Some(ctx_a));
        assert_eq!(lp.socket_entry(s).unwrap().timeout, DISARMED);
    }

    #[test]
    fn close_is_idempotent() {
        static CLOSED: AtomicUsize = AtomicUsize::new(0);
        CLOSED.store(0, Ordering::SeqCst);

        let mut lp = EventLoop::new().unwrap();
        let (s, ctx) = pair(&mut lp);
        lp.context_on_close(ctx, |_, _, _| {
            CLOSED.fetch_add(1, Ordering::SeqCst);
        });

        lp.close(s, crate::CLOSE_CODE_CLEAN);
        lp.close(s, crate::CLOSE_CODE_CLEAN);
        assert!(lp.is_closed(s));
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_writes() {
        let mut lp = EventLoop::new().unwrap();
        let (s, _ctx) = pair(&mut lp);

        lp.shutdown(s);
        assert!(lp.is_shut_down(s));
        lp.shutdown(s);
        assert!(lp.is_shut_down(s));

        assert_eq!(lp.write(s, b"rejected", false), 0);
        assert!(!lp
            .socket_entry(s)
            .unwrap()
            .interest
            .is_writable());
    }
}
