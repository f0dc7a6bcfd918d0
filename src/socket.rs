//! Socket operations: writes, half-open shutdown, the close protocol,
//! timeouts, pause/resume and fd adoption.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::poll::{ContextId, SocketEntry, SocketId, SocketKind, DISARMED};
use crate::sys::net;
use crate::{EventLoop, Interest, CLOSE_CODE_CONNECTION_RESET};

impl EventLoop {
    /// Write to a TCP or Unix-domain socket. Returns how many bytes the
    /// kernel took; a short write re-arms the writable subscription and
    /// `on_writable` fires once it may proceed.
    pub fn write(&mut self, s: SocketId, data: &[u8], msg_more: bool) -> usize {
        #[cfg(feature = "tls")]
        if self.socket_entry(s).map_or(false, |e| e.tls.is_some()) {
            return crate::tls::socket_write(self, s, data, msg_more);
        }
        self.plain_write(s, data, msg_more)
    }

    /// Write straight to the transport, bypassing any TLS overlay.
    pub fn raw_write(&mut self, s: SocketId, data: &[u8], msg_more: bool) -> usize {
        self.plain_write(s, data, msg_more)
    }

    pub(crate) fn plain_write(&mut self, s: SocketId, data: &[u8], msg_more: bool) -> usize {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed && !e.is_shut_down() => e,
            _ => return 0,
        };
        let fd = entry.fd;
        let token = s.0.index();

        let written = net::send(fd, data, msg_more);
        if written != data.len() as isize {
            self.last_write_failed = true;
            self.poll_change(token, Interest::READABLE | Interest::WRITABLE);
        }

        written.max(0) as usize
    }

    /// Gathered header + payload write, for framing without a copy. Not
    /// available through a TLS overlay.
    pub fn write2(&mut self, s: SocketId, header: &[u8], payload: &[u8]) -> usize {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed && !e.is_shut_down() => e,
            _ => return 0,
        };
        let fd = entry.fd;
        let token = s.0.index();

        let written = net::write2(fd, header, payload);
        if written != (header.len() + payload.len()) as isize {
            self.last_write_failed = true;
            self.poll_change(token, Interest::READABLE | Interest::WRITABLE);
        }

        written.max(0) as usize
    }

    /// Send data together with a duplicated file descriptor over an IPC
    /// (Unix-domain) socket. If fewer bytes than `data.len()` went out the
    /// descriptor was not sent.
    pub fn ipc_write_fd(&mut self, s: SocketId, data: &[u8], fd_to_send: RawFd) -> usize {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed && !e.is_shut_down() => e,
            _ => return 0,
        };
        let fd = entry.fd;
        let token = s.0.index();

        let sent = net::send_with_fd(fd, data, fd_to_send);
        if sent != data.len() as isize {
            self.last_write_failed = true;
            self.poll_change(token, Interest::READABLE | Interest::WRITABLE);
        }

        sent.max(0) as usize
    }

    /// Half-close: send FIN, reject further writes, keep reading. A later
    /// zero-length read is then treated as a clean shutdown.
    pub fn shutdown(&mut self, s: SocketId) {
        #[cfg(feature = "tls")]
        if self.socket_entry(s).map_or(false, |e| e.tls.is_some()) {
            crate::tls::socket_shutdown(self, s);
            return;
        }
        self.plain_shutdown(s);
    }

    pub(crate) fn plain_shutdown(&mut self, s: SocketId) {
        let entry = match self.socket_entry_mut(s) {
            Some(e) if !e.closed && !e.is_shut_down() => e,
            _ => return,
        };
        entry.kind = SocketKind::ShutDown;
        let fd = entry.fd;
        let interest = entry.interest;
        let token = s.0.index();

        self.poll_change(token, interest.remove(Interest::WRITABLE));
        net::shutdown_write(fd);
    }

    /// Stop reading from the peer. Idempotent at the syscall level.
    pub fn shutdown_read(&mut self, s: SocketId) {
        if let Some(e) = self.socket_entry(s) {
            if !e.closed {
                net::shutdown_read(e.fd);
            }
        }
    }

    /// Close the socket. Visible state changes immediately (fd closed,
    /// lists updated, `on_close` fired once); the entry itself is
    /// reclaimed at the end of the iteration. Closing twice is a no-op.
    pub fn close(&mut self, s: SocketId, code: i32) {
        #[cfg(feature = "tls")]
        if self.socket_entry(s).map_or(false, |e| e.tls.is_some()) {
            crate::tls::socket_close(self, s, code);
            return;
        }
        self.plain_close(s, code);
    }

    pub(crate) fn plain_close(&mut self, s: SocketId, code: i32) {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed => e,
            _ => return,
        };
        let ctx = entry.ctx;
        let fd = entry.fd;
        let kind = entry.kind;
        let low_prio = entry.low_prio_state == 1;
        let token = s.0.index();

        // Make sure the context is alive until the callback ends.
        self.context_ref(ctx);

        if low_prio {
            self.low_prio_remove(token);
            if let Some(e) = self.socket_entry_mut(s) {
                e.low_prio_state = 0;
            }
            // Drop the queue's hold on the context.
            self.context_unref(ctx);
        } else if kind == SocketKind::Listen {
            self.unlink_listen_socket(ctx, token);
        } else {
            self.unlink_socket(ctx, token);
        }

        self.poll_stop(token);

        if code == CLOSE_CODE_CONNECTION_RESET {
            // Skip TIME_WAIT when forcefully closing.
            net::linger_reset(fd);
        }
        net::close(fd);

        if let Some(e) = self.socket_entry_mut(s) {
            e.closed = true;
        }
        self.defer_socket_free(s.0);

        // Semi sockets never reached on_open, so they get no on_close.
        if !kind.is_semi() {
            if let Some(cb) = self.callbacks_of(ctx).on_close {
                cb(self, s, code);
            }
        }

        self.context_unref(ctx);
    }

    /// Like close, but without the fd teardown or `on_close`: the caller
    /// takes ownership of the descriptor.
    pub fn detach(&mut self, s: SocketId) -> Option<RawFd> {
        let entry = match self.socket_entry(s) {
            Some(e) if !e.closed => e,
            _ => return None,
        };
        let ctx = entry.ctx;
        let fd = entry.fd;
        let kind = entry.kind;
        let low_prio = entry.low_prio_state == 1;
        let token = s.0.index();

        if low_prio {
            self.low_prio_remove(token);
            if let Some(e) = self.socket_entry_mut(s) {
                e.low_prio_state = 0;
            }
            self.context_unref(ctx);
        } else if kind == SocketKind::Listen {
            self.unlink_listen_socket(ctx, token);
        } else {
            self.unlink_socket(ctx, token);
        }

        self.poll_stop(token);

        if let Some(e) = self.socket_entry_mut(s) {
            e.closed = true;
        }
        self.defer_socket_free(s.0);
        Some(fd)
    }

    /* Timeouts */

    /// Arm the short (seconds-granularity) timeout; 0 disarms. Precision
    /// is one sweep tick (4 s).
    pub fn socket_timeout(&mut self, s: SocketId, seconds: u32) {
        let timestamp = match self.socket_entry(s) {
            Some(e) if !e.closed => self
                .contexts
                .get(e.ctx)
                .map(|c| c.timestamp)
                .unwrap_or(0),
            _ => return,
        };
        if let Some(e) = self.socket_entry_mut(s) {
            e.timeout = if seconds > 0 {
                ((timestamp as u32 + ((seconds + 3) >> 2)) % 240) as u8
            } else {
                DISARMED
            };
        }
    }

    /// Arm the long (minutes-granularity) timeout; 0 disarms.
    pub fn socket_long_timeout(&mut self, s: SocketId, minutes: u32) {
        let long_timestamp = match self.socket_entry(s) {
            Some(e) if !e.closed => self
                .contexts
                .get(e.ctx)
                .map(|c| c.long_timestamp)
                .unwrap_or(0),
            _ => return,
        };
        if let Some(e) = self.socket_entry_mut(s) {
            e.long_timeout = if minutes > 0 {
                ((long_timestamp as u32 + minutes) % 240) as u8
            } else {
                DISARMED
            };
        }
    }

    /* Flow control */

    /// Stop reading without telling the peer; resume with `resume`.
    pub fn pause(&mut self, s: SocketId) {
        let entry = match self.socket_entry_mut(s) {
            Some(e) if !e.closed && !e.is_paused => e,
            _ => return,
        };
        entry.is_paused = true;
        let token = s.0.index();
        self.poll_change(token, Interest::WRITABLE);
    }

    pub fn resume(&mut self, s: SocketId) {
        let entry = match self.socket_entry_mut(s) {
            Some(e) if e.is_paused => e,
            _ => return,
        };
        entry.is_paused = false;
        if entry.closed {
            return;
        }
        let shut_down = entry.is_shut_down();
        let token = s.0.index();
        if shut_down {
            // FIN already sent; we are read-only now.
            self.poll_change(token, Interest::READABLE);
        } else {
            self.poll_change(token, Interest::READABLE | Interest::WRITABLE);
        }
    }

    /* Introspection */

    pub fn is_closed(&self, s: SocketId) -> bool {
        self.socket_entry(s).map_or(true, |e| e.closed)
    }

    pub fn is_shut_down(&self, s: SocketId) -> bool {
        #[cfg(feature = "tls")]
        if let Some(e) = self.socket_entry(s) {
            if e.tls.is_some() {
                return crate::tls::socket_is_shut_down(self, s);
            }
        }
        self.socket_entry(s).map_or(false, |e| e.is_shut_down())
    }

    /// Everything that is not a semi socket is established.
    pub fn is_established(&self, s: SocketId) -> bool {
        self.socket_entry(s).map_or(false, |e| !e.kind.is_semi())
    }

    pub fn local_addr(&self, s: SocketId) -> io::Result<SocketAddr> {
        match self.socket_entry(s) {
            Some(e) if !e.closed => net::local_addr(e.fd),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn remote_addr(&self, s: SocketId) -> io::Result<SocketAddr> {
        match self.socket_entry(s) {
            Some(e) if !e.closed => net::remote_addr(e.fd),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn local_port(&self, s: SocketId) -> Option<u16> {
        self.local_addr(s).ok().map(|a| a.port())
    }

    pub fn remote_port(&self, s: SocketId) -> Option<u16> {
        self.remote_addr(s).ok().map(|a| a.port())
    }

    /// Flush anything held back by corking.
    pub fn flush(&mut self, s: SocketId) {
        if let Some(e) = self.socket_entry(s) {
            if !e.closed && !e.is_shut_down() {
                net::flush(e.fd);
            }
        }
    }

    pub fn nodelay(&mut self, s: SocketId, enabled: bool) {
        if let Some(e) = self.socket_entry(s) {
            if !e.closed && !e.is_shut_down() {
                net::nodelay(e.fd, enabled);
            }
        }
    }

    pub fn keepalive(&mut self, s: SocketId, enabled: bool, delay_secs: u32) -> io::Result<()> {
        match self.socket_entry(s) {
            Some(e) if !e.closed && !e.is_shut_down() => net::keepalive(e.fd, enabled, delay_secs),
            _ => Ok(()),
        }
    }

    /// Whether this socket tolerates a half-open peer (inherited from the
    /// listen options for accepted sockets). Purely advisory state for the
    /// layer above; a peer RST is an abortive close either way.
    pub fn allow_half_open(&self, s: SocketId) -> bool {
        self.socket_entry(s).map_or(false, |e| e.allow_half_open)
    }

    /// Whether the socket was adopted as an IPC (fd-passing) channel.
    pub fn is_ipc(&self, s: SocketId) -> bool {
        self.socket_entry(s).map_or(false, |e| e.is_ipc)
    }

    /* Per-socket user state */

    pub fn socket_ext(&self, s: SocketId) -> Option<&(dyn Any + 'static)> {
        self.socket_entry(s).and_then(|e| e.ext.as_deref())
    }

    pub fn socket_ext_mut(&mut self, s: SocketId) -> Option<&mut (dyn Any + 'static)> {
        match self.socket_entry_mut(s) {
            Some(e) => e.ext.as_deref_mut(),
            None => None,
        }
    }

    pub fn set_socket_ext(&mut self, s: SocketId, ext: Box<dyn Any>) {
        if let Some(e) = self.socket_entry_mut(s) {
            e.ext = Some(ext);
        }
    }

    /* Raw-fd adoption */

    /// Adopt an already-connected descriptor as a socket of `ctx`. The fd
    /// is made non-blocking and nodelay like every other socket here.
    pub fn socket_from_fd(&mut self, ctx: ContextId, fd: RawFd, ipc: bool) -> io::Result<SocketId> {
        if !self.contexts.contains(ctx.0) {
            return Err(io::ErrorKind::NotFound.into());
        }

        net::nodelay(fd, true);
        net::apple_no_sigpipe(fd)?;
        net::set_nonblocking(fd)?;

        let mut entry = SocketEntry::new(fd, SocketKind::Open, ctx.0);
        entry.is_ipc = ipc;
        let id = self.add_socket_entry(entry, Interest::READABLE | Interest::WRITABLE)?;
        self.link_socket(ctx.0, id.0.index());
        Ok(id)
    }

    /// Create a connected Unix-domain pair; the first half is adopted into
    /// `ctx`, the second is returned raw for handing to a child process or
    /// another loop.
    pub fn socket_pair(&mut self, ctx: ContextId) -> io::Result<(SocketId, RawFd)> {
        let (a, b) = net::socket_pair()?;
        match self.socket_from_fd(ctx, a, false) {
            Ok(id) => Ok((id, b)),
            Err(err) => {
                net::close(a);
                net::close(b);
                Err(err)
            }
        }
    }
}
