#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    use crate::sys::Selector;
    use crate::Interest;

    /// Waker backed by `eventfd`.
    ///
    /// `eventfd` is effectively an 64 bit counter. All writes must be of 8
    /// bytes (64 bits) and are converted (native endian) into an 64 bit
    /// unsigned integer and added to the count. Reads must also be 8 bytes
    /// and reset the count to 0, returning the count.
    #[derive(Debug)]
    pub(crate) struct Waker {
        fd: File,
    }

    impl Waker {
        pub(crate) fn new(selector: &Selector, token: usize) -> io::Result<Waker> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            let file = unsafe { File::from_raw_fd(fd) };

            selector.register(fd, token, Interest::READABLE)?;
            Ok(Waker { fd: file })
        }

        #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
        pub(crate) fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter is going to
                    // overflow. So we'll reset the counter to 0 and wake it
                    // again.
                    self.reset()?;
                    self.wake()
                }
                Err(err) => Err(err),
            }
        }

        /// Reset the eventfd object, only need to call this if `wake` fails.
        #[allow(clippy::unused_io_amount)] // Don't care about partial reads.
        fn reset(&self) -> io::Result<()> {
            let mut buf: [u8; 8] = 0u64.to_ne_bytes();
            match (&self.fd).read(&mut buf) {
                Ok(_) => Ok(()),
                // If the `Waker` hasn't been awoken yet this will return a
                // `WouldBlock` error which we can safely ignore.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }

        /// Drain the pending wakeups once the loop has observed them.
        pub(crate) fn ack(&self) {
            let _ = self.reset();
        }

        /// The fd the dispatcher drains when the waker fires.
        #[allow(dead_code)]
        pub(crate) fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::eventfd::Waker;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
mod kqueue {
    use std::io;
    use std::os::fd::RawFd;

    use crate::sys::Selector;

    /// Waker backed by kqueue user-space notifications (`EVFILT_USER`).
    ///
    /// Triggering an already-pending user event coalesces into the one
    /// existing wakeup, which is exactly the semantics we want.
    #[derive(Debug)]
    pub(crate) struct Waker {
        selector: Selector,
        token: usize,
    }

    impl Waker {
        pub(crate) fn new(selector: &Selector, token: usize) -> io::Result<Waker> {
            let selector = selector.try_clone()?;
            selector.setup_waker(token)?;
            Ok(Waker { selector, token })
        }

        pub(crate) fn wake(&self) -> io::Result<()> {
            self.selector.wake(self.token)
        }

        /// `EV_CLEAR` resets the user event on delivery; nothing to drain.
        pub(crate) fn ack(&self) {}

        /// User events carry no fd to drain.
        #[allow(dead_code)]
        pub(crate) fn raw_fd(&self) -> RawFd {
            -1
        }
    }
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
pub(crate) use self::kqueue::Waker;

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
mod pipe {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{FromRawFd, RawFd};

    use crate::sys::Selector;
    use crate::Interest;

    /// Waker backed by a unix pipe, for the kqueue platforms without
    /// user-space event filters.
    #[derive(Debug)]
    pub(crate) struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub(crate) fn new(selector: &Selector, token: usize) -> io::Result<Waker> {
            let mut fds: [RawFd; 2] = [-1, -1];
            syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
            let receiver = unsafe { File::from_raw_fd(fds[0]) };
            let sender = unsafe { File::from_raw_fd(fds[1]) };

            selector.register(fds[0], token, Interest::READABLE)?;
            Ok(Waker { sender, receiver })
        }

        pub(crate) fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                // The reading end is backed up; it is still going to wake.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }

        /// Empty the pipe so the next wakeup registers as fresh readiness.
        pub(crate) fn ack(&self) {
            let mut buf = [0u8; 128];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    _ => break,
                }
            }
        }

        #[allow(dead_code)]
        pub(crate) fn raw_fd(&self) -> RawFd {
            use std::os::fd::AsRawFd;
            self.receiver.as_raw_fd()
        }
    }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
pub(crate) use self::pipe::Waker;
