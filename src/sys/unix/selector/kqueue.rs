use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, ptr, slice};

use crate::Interest;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        Ok(Selector {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
        })
    }

    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        events.clear();
        let n_events = loop {
            match syscall!(kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.capacity() as Count,
                timeout,
            )) {
                Ok(n) => break n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };

        // This is safe because `kevent` ensures that `n_events` are assigned.
        unsafe { events.set_len(n_events as usize) };
        Ok(n_events as usize)
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, (false, false), filter_state(interest))
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: usize,
        old: Interest,
        interest: Interest,
    ) -> io::Result<()> {
        self.apply(fd, token, filter_state(old), filter_state(interest))
    }

    pub(crate) fn deregister(&self, fd: RawFd, old: Interest) -> io::Result<()> {
        self.apply(fd, 0, filter_state(old), (false, false))
    }

    /// Diff the armed filter set and submit only the changes, mirroring how
    /// the subscription toggles are expected to behave on epoll.
    fn apply(
        &self,
        fd: RawFd,
        token: usize,
        old: (bool, bool),
        new: (bool, bool),
    ) -> io::Result<()> {
        let mut changes: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let mut n_changes = 0;

        if new.0 != old.0 {
            let flags = if new.0 { libc::EV_ADD } else { libc::EV_DELETE };
            changes[n_changes] =
                MaybeUninit::new(kevent!(fd, libc::EVFILT_READ, flags | libc::EV_RECEIPT, token));
            n_changes += 1;
        }

        if new.1 != old.1 {
            let flags = if new.1 { libc::EV_ADD } else { libc::EV_DELETE };
            changes[n_changes] =
                MaybeUninit::new(kevent!(fd, libc::EVFILT_WRITE, flags | libc::EV_RECEIPT, token));
            n_changes += 1;
        }

        if n_changes == 0 {
            return Ok(());
        }

        let changes = unsafe {
            // This is safe because we ensure that at least `n_changes` are in
            // the array.
            slice::from_raw_parts_mut(changes[0].as_mut_ptr(), n_changes)
        };
        // ENOENT: deleting a filter that was never armed; EPIPE: ancient
        // macOS quirk when registering a pipe whose other end is gone
        // (events are still delivered afterwards).
        kevent_register(
            self.kq.as_raw_fd(),
            changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }

    /// Arm the user-event filter used by `Waker`.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn setup_waker(&self, token: usize) -> io::Result<()> {
        let mut kevent = kevent!(
            token,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            token
        );

        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }

    /// Trigger the user-event filter. An already-pending event is the same
    /// wakeup signal, so coalescing is fine.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn wake(&self, token: usize) -> io::Result<()> {
        let mut kevent = kevent!(
            token,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            token
        );
        kevent.fflags = libc::NOTE_TRIGGER;

        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }

    /// Arm (or re-arm) a periodic timer keyed by `token`.
    pub(crate) fn set_timer(&self, token: usize, ms: u64, repeat: bool) -> io::Result<()> {
        let mut kevent = kevent!(
            token,
            libc::EVFILT_TIMER,
            libc::EV_ADD | libc::EV_RECEIPT | if repeat { 0 } else { libc::EV_ONESHOT },
            token
        );
        kevent.data = ms as Data;

        syscall!(kevent(
            self.kq.as_raw_fd(),
            &kevent,
            1,
            &mut kevent,
            1,
            ptr::null()
        ))
        .and_then(|_| {
            if (kevent.flags & libc::EV_ERROR) != 0 && kevent.data != 0 {
                Err(io::Error::from_raw_os_error(kevent.data as i32))
            } else {
                Ok(())
            }
        })
    }

    pub(crate) fn delete_timer(&self, token: usize) -> io::Result<()> {
        let mut changes = [kevent!(
            token,
            libc::EVFILT_TIMER,
            libc::EV_DELETE | libc::EV_RECEIPT,
            token
        )];
        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::ENOENT as Data])
    }

    // Used by `Waker`.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn try_clone(&self) -> io::Result<Selector> {
        self.kq.try_clone().map(|kq| Selector { kq })
    }
}

/// Register `changes` with the kqueue.
fn kevent_register(
    kq: RawFd,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        // According to the manual page of FreeBSD: "When kevent() call fails
        // with EINTR error, all changes in the changelist have been applied",
        // so we can safely ignore it.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored_errors))
}

/// Check all events for possible errors, it returns the first error found.
fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the ignored
        // errors), so we need copy the data out before use.
        let data = event.data;
        // Check for the error flag, the actual error will be in the `data`
        // field.
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

/// Which of (EVFILT_READ, EVFILT_WRITE) an interest set keeps armed. A fully
/// empty set still arms the write filter: a peer FIN then surfaces as an
/// EV_EOF on that filter instead of going unnoticed.
fn filter_state(interest: Interest) -> (bool, bool) {
    (
        interest.is_readable(),
        interest.is_writable() || interest.is_empty(),
    )
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use crate::sys::Event;

    pub(crate) fn token(event: &Event) -> usize {
        event.udata as usize
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        // Timer and user events drive callback polls, which subscribe to
        // "readable" in the logical event model.
        event.filter == libc::EVFILT_READ || event.filter == libc::EVFILT_TIMER || {
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos"
            ))]
            {
                event.filter == libc::EVFILT_USER
            }
            #[cfg(not(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos"
            )))]
            {
                false
            }
        }
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.flags & libc::EV_ERROR) != 0
            // When the read end of the socket is closed, EV_EOF is set on
            // flags, and fflags contains the error if there is one.
            || (event.flags & libc::EV_EOF) != 0 && event.fflags != 0
    }

    pub(crate) fn is_eof(event: &Event) -> bool {
        (event.flags & libc::EV_EOF) != 0
    }
}
