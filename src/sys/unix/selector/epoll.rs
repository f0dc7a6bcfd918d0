use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
#[cfg(target_os = "linux")]
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::Interest;

/// Whether `epoll_pwait2(2)` is usable on this kernel. Checked once, on the
/// first wait that actually needs a precise timeout.
#[cfg(target_os = "linux")]
static HAS_EPOLL_PWAIT2: AtomicBool = AtomicBool::new(true);

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();

        let n_events = match timeout {
            Some(to) => self.wait_timespec(events, to)?,
            None => loop {
                match syscall!(epoll_wait(
                    self.ep.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.capacity() as i32,
                    -1,
                )) {
                    Ok(n) => break n,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            },
        };

        // This is safe because `epoll_wait` ensures that `n_events` are
        // assigned.
        unsafe { events.set_len(n_events as usize) };
        Ok(n_events as usize)
    }

    /// Wait with nanosecond precision via `epoll_pwait2`, falling back to a
    /// millisecond `epoll_wait` on kernels that lack the syscall.
    fn wait_timespec(&self, events: &mut Events, timeout: Duration) -> io::Result<libc::c_int> {
        // Bionic does not expose `epoll_pwait2`.
        #[cfg(target_os = "linux")]
        if HAS_EPOLL_PWAIT2.load(Ordering::Relaxed) {
            let ts = libc::timespec {
                tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
            };
            loop {
                match syscall!(epoll_pwait2(
                    self.ep.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.capacity() as i32,
                    &ts,
                    ptr::null(),
                )) {
                    Ok(n) => return Ok(n),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => {
                        HAS_EPOLL_PWAIT2.store(false, Ordering::Relaxed);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Round up so that a sub-millisecond timeout does not turn into a
        // busy-looping zero timeout.
        let millis = timeout
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(timeout)
            .as_millis() as libc::c_int;
        loop {
            match syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as i32,
                millis,
            )) {
                Ok(n) => return Ok(n),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: usize,
        _old: Interest,
        interest: Interest,
    ) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd, _old: Interest) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // Level-triggered on purpose: the dispatch loop toggles the writable
    // subscription around failed writes and expects a still-pending
    // condition to re-arm on the next wait.
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_empty() {
        // Neither reading nor writing: still observe peer close.
        kind |= EPOLLRDHUP | EPOLLHUP | EPOLLERR;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use crate::sys::Event;

    pub(crate) fn token(event: &Event) -> usize {
        event.u64 as usize
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLIN) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLERR) != 0
    }

    pub(crate) fn is_eof(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLHUP) != 0
    }
}
