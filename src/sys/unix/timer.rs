use std::io;
use std::os::fd::RawFd;

use crate::sys::Selector;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod timerfd {
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    use crate::sys::Selector;
    use crate::Interest;

    /// Periodic timer backed by `timerfd`. The fd is registered like any
    /// other readable poll and read-drained when it fires.
    #[derive(Debug)]
    pub(crate) struct Timer {
        fd: File,
    }

    impl Timer {
        pub(crate) fn new() -> io::Result<Timer> {
            let fd = syscall!(timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
            ))?;
            Ok(Timer {
                fd: unsafe { File::from_raw_fd(fd) },
            })
        }

        pub(crate) fn set(
            &self,
            selector: &Selector,
            token: usize,
            registered: bool,
            ms: u64,
            repeat_ms: u64,
        ) -> io::Result<()> {
            let spec = libc::itimerspec {
                it_interval: libc::timespec {
                    tv_sec: (repeat_ms / 1000) as libc::time_t,
                    tv_nsec: ((repeat_ms % 1000) * 1_000_000) as libc::c_long,
                },
                it_value: libc::timespec {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
                },
            };
            syscall!(timerfd_settime(
                self.fd.as_raw_fd(),
                0,
                &spec,
                std::ptr::null_mut()
            ))?;

            if !registered {
                selector.register(self.fd.as_raw_fd(), token, Interest::READABLE)?;
            }
            Ok(())
        }

        pub(crate) fn stop(
            &self,
            selector: &Selector,
            _token: usize,
            registered: bool,
        ) -> io::Result<()> {
            if registered {
                selector.deregister(self.fd.as_raw_fd(), Interest::READABLE)?;
            }
            Ok(())
        }

        pub(crate) fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::timerfd::Timer as SysTimer;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue {
    use std::io;
    use std::os::fd::RawFd;

    use crate::sys::Selector;

    /// Periodic timer backed by `EVFILT_TIMER`, keyed by the poll token.
    /// There is no fd and nothing to drain.
    #[derive(Debug)]
    pub(crate) struct Timer {
        armed: std::cell::Cell<bool>,
    }

    impl Timer {
        pub(crate) fn new() -> io::Result<Timer> {
            Ok(Timer {
                armed: std::cell::Cell::new(false),
            })
        }

        pub(crate) fn set(
            &self,
            selector: &Selector,
            token: usize,
            _registered: bool,
            ms: u64,
            repeat_ms: u64,
        ) -> io::Result<()> {
            // kqueue timers fire once after `data` ms, or periodically with
            // the same period; an initial delay differing from the repeat
            // interval is approximated by the repeat interval.
            let period = if repeat_ms != 0 { repeat_ms } else { ms };
            selector.set_timer(token, period, repeat_ms != 0)?;
            self.armed.set(true);
            Ok(())
        }

        pub(crate) fn stop(
            &self,
            selector: &Selector,
            token: usize,
            _registered: bool,
        ) -> io::Result<()> {
            if self.armed.replace(false) {
                selector.delete_timer(token)?;
            }
            Ok(())
        }

        pub(crate) fn raw_fd(&self) -> RawFd {
            -1
        }
    }
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use self::kqueue::Timer as SysTimer;

/// Backend-neutral periodic timer bound to a poll token.
#[derive(Debug)]
pub(crate) struct Timer {
    inner: SysTimer,
    token: usize,
    registered: bool,
}

impl Timer {
    pub(crate) fn new(token: usize) -> io::Result<Timer> {
        Ok(Timer {
            inner: SysTimer::new()?,
            token,
            registered: false,
        })
    }

    /// Bind to the final poll token. Only valid before the first `set`.
    pub(crate) fn rebind(&mut self, token: usize) {
        debug_assert!(!self.registered);
        self.token = token;
    }

    pub(crate) fn set(&mut self, selector: &Selector, ms: u64, repeat_ms: u64) -> io::Result<()> {
        self.inner
            .set(selector, self.token, self.registered, ms, repeat_ms)?;
        self.registered = true;
        Ok(())
    }

    pub(crate) fn stop(&mut self, selector: &Selector) -> io::Result<()> {
        let was = self.registered;
        self.registered = false;
        self.inner.stop(selector, self.token, was)
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }
}
