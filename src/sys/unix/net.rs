//! Thin wrappers over the BSD socket syscalls.
//!
//! Everything here is non-blocking and close-on-exec; macOS additionally
//! gets `SO_NOSIGPIPE` since it lacks `MSG_NOSIGNAL`.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use crate::context::listen_options;

pub(crate) const LISTEN_BACKLOG: libc::c_int = 512;

/// A `sockaddr_in` or `sockaddr_in6` ready to be passed to the kernel.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Convert a `SocketAddr` into its C representation.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };

            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                sin_len: 0,
            };

            (
                SocketAddrCRepr { v4: sockaddr_in },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                sin6_len: 0,
            };

            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Convert a kernel-filled `sockaddr_storage` back into a `SocketAddr`.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

pub(crate) fn apple_no_sigpipe(fd: RawFd) -> io::Result<()> {
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        let no_sigpipe: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &no_sigpipe as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
    }
    let _ = fd;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

/// Create a non-blocking close-on-exec socket.
pub(crate) fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    let fd = syscall!(socket(
        domain,
        socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))?;

    // `SOCK_NONBLOCK`/`SOCK_CLOEXEC` don't exist on Darwin.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let fd = {
        let fd = syscall!(socket(domain, socket_type, 0))?;
        if let Err(err) = syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
            .and_then(|_| set_nonblocking(fd).map(|()| 0))
            .and_then(|_| apple_no_sigpipe(fd).map(|()| 0))
        {
            let _ = syscall!(close(fd));
            return Err(err);
        }
        fd
    };

    Ok(fd)
}

pub(crate) fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

pub(crate) fn nodelay(fd: RawFd, enabled: bool) {
    let enabled: libc::c_int = enabled as libc::c_int;
    let _ = syscall!(setsockopt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        &enabled as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ));
}

/// Flush anything held back by `MSG_MORE` style corking.
pub(crate) fn flush(fd: RawFd) {
    // Linux TCP_CORK has the same underlying corking mechanism as MSG_MORE.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let enabled: libc::c_int = 0;
        let _ = syscall!(setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &enabled as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ));
    }
    let _ = fd;
}

pub(crate) fn keepalive(fd: RawFd, enabled: bool, delay_secs: u32) -> io::Result<()> {
    let on: libc::c_int = enabled as libc::c_int;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_KEEPALIVE,
        &on as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    if enabled && delay_secs > 0 {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let secs = delay_secs as libc::c_int;
            syscall!(setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                &secs as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ))?;
        }
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        {
            let secs = delay_secs as libc::c_int;
            syscall!(setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPALIVE,
                &secs as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ))?;
        }
    }
    Ok(())
}

/// SO_LINGER {1, 0}: closing now sends RST instead of entering TIME_WAIT.
pub(crate) fn linger_reset(fd: RawFd) {
    let l = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let _ = syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_LINGER,
        &l as *const _ as *const libc::c_void,
        mem::size_of::<libc::linger>() as libc::socklen_t,
    ));
}

pub(crate) fn take_so_error(fd: RawFd) -> i32 {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    match syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut _ as *mut libc::c_void,
        &mut len,
    )) {
        Ok(_) => error,
        Err(err) => err.raw_os_error().unwrap_or(libc::EIO),
    }
}

pub(crate) fn shutdown_write(fd: RawFd) {
    let _ = syscall!(shutdown(fd, libc::SHUT_WR));
}

pub(crate) fn shutdown_read(fd: RawFd) {
    let _ = syscall!(shutdown(fd, libc::SHUT_RD));
}

pub(crate) fn would_block_errno() -> bool {
    let errno = io::Error::last_os_error().raw_os_error();
    errno == Some(libc::EWOULDBLOCK) || errno == Some(libc::EAGAIN)
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> isize {
    unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT | msg_nosignal(),
        )
    }
}

#[cfg(any(target_os = "ios", target_os = "macos"))]
const fn msg_nosignal() -> libc::c_int {
    // Darwin uses SO_NOSIGPIPE at socket level instead.
    0
}

#[cfg(not(any(target_os = "ios", target_os = "macos")))]
const fn msg_nosignal() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

pub(crate) fn send(fd: RawFd, buf: &[u8], msg_more: bool) -> isize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let more = if msg_more { libc::MSG_MORE } else { 0 };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let more = {
        let _ = msg_more;
        0
    };

    unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            more | libc::MSG_DONTWAIT | msg_nosignal(),
        )
    }
}

/// Gathered two-part write, used for header + payload without a copy.
pub(crate) fn write2(fd: RawFd, header: &[u8], payload: &[u8]) -> isize {
    let chunks = [
        libc::iovec {
            iov_base: header.as_ptr() as *mut libc::c_void,
            iov_len: header.len(),
        },
        libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];
    unsafe { libc::writev(fd, chunks.as_ptr(), 2) }
}

/// Send `buf` together with a duplicated file descriptor (`SCM_RIGHTS`).
pub(crate) fn send_with_fd(fd: RawFd, buf: &[u8], fd_to_send: RawFd) -> isize {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // Room for one CMSG_SPACE(sizeof(int)) control message.
    let mut cmsg_buf = [0u8; 32];
    let controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = controllen as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            &fd_to_send as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );

        libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT | msg_nosignal())
    }
}

/// Accept one connection; non-blocking + cloexec on the child.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    let accepted = syscall!(accept4(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    ))?;

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let accepted = {
        let accepted = syscall!(accept(
            fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        ))?;
        if let Err(err) = syscall!(fcntl(accepted, libc::F_SETFD, libc::FD_CLOEXEC))
            .and_then(|_| set_nonblocking(accepted).map(|()| 0))
            .and_then(|_| apple_no_sigpipe(accepted).map(|()| 0))
        {
            let _ = syscall!(close(accepted));
            return Err(err);
        }
        accepted
    };

    let addr = unsafe { to_socket_addr(storage.as_ptr()) }
        .unwrap_or_else(|_| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    Ok((accepted, addr))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub(crate) fn remote_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

/// Raw IP bytes of an address: 4 for IPv4, 16 for IPv6.
pub(crate) fn ip_bytes(addr: &SocketAddr) -> ([u8; 16], usize) {
    let mut buf = [0u8; 16];
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf[..4].copy_from_slice(&ip.octets());
            (buf, 4)
        }
        IpAddr::V6(ip) => {
            buf.copy_from_slice(&ip.octets());
            (buf, 16)
        }
    }
}

fn set_reuse(fd: RawFd, port: u16, options: u32) -> io::Result<()> {
    if port != 0 {
        // Always enable SO_REUSEPORT and SO_REUSEADDR unless told otherwise.
        if options & listen_options::EXCLUSIVE_PORT == 0 {
            let on: libc::c_int = 1;
            let res = syscall!(setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ));
            if let Err(err) = res {
                if options & listen_options::DISALLOW_REUSE_PORT_FAILURE != 0 {
                    return Err(err);
                }
            }
        }
        let on: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
    }
    Ok(())
}

fn set_v6only(fd: RawFd, addr: &SocketAddr, options: u32) {
    if addr.is_ipv6() {
        let v6only: libc::c_int = (options & listen_options::IPV6_ONLY != 0) as libc::c_int;
        let _ = syscall!(setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &v6only as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ));
    }
}

fn bind_listen_fd(fd: RawFd, addr: &SocketAddr, options: u32) -> io::Result<()> {
    set_reuse(fd, addr.port(), options)?;
    set_v6only(fd, addr, options);

    let (raw_addr, raw_addr_length) = socket_addr(addr);
    syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length))?;
    syscall!(listen(fd, LISTEN_BACKLOG))?;
    Ok(())
}

/// Create a bound + listening TCP socket, IPv6 candidates before IPv4.
pub(crate) fn create_listen_socket(addrs: &[SocketAddr], options: u32) -> io::Result<RawFd> {
    let mut last_err = io::Error::from(io::ErrorKind::AddrNotAvailable);

    let ordered = addrs
        .iter()
        .filter(|a| a.is_ipv6())
        .chain(addrs.iter().filter(|a| a.is_ipv4()));

    for addr in ordered {
        let domain = if addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = match new_socket(domain, libc::SOCK_STREAM) {
            Ok(fd) => fd,
            Err(err) => {
                last_err = err;
                continue;
            }
        };
        match bind_listen_fd(fd, addr, options) {
            Ok(()) => return Ok(fd),
            Err(err) => {
                last_err = err;
                close(fd);
            }
        }
    }

    Err(last_err)
}

/// Start a non-blocking connect; `EINPROGRESS` is success.
pub(crate) fn create_connect_socket(
    addr: &SocketAddr,
    source: Option<IpAddr>,
) -> io::Result<RawFd> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };
    let fd = new_socket(domain, libc::SOCK_STREAM)?;

    if let Some(ip) = source {
        let bind_addr = SocketAddr::new(ip, 0);
        let (raw_addr, raw_addr_length) = socket_addr(&bind_addr);
        if let Err(err) = syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length)) {
            close(fd);
            return Err(err);
        }
    }

    let (raw_addr, raw_addr_length) = socket_addr(addr);
    let res = loop {
        match syscall!(connect(fd, raw_addr.as_ptr(), raw_addr_length)) {
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    match res {
        Ok(_) => Ok(fd),
        // Connect hasn't finished, but that is fine.
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(err) => {
            close(fd);
            Err(err)
        }
    }
}

pub(crate) fn socket_pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_STREAM,
        0,
        fds.as_mut_ptr()
    ))?;
    for fd in fds {
        set_nonblocking(fd)?;
        apple_no_sigpipe(fd)?;
    }
    Ok((fds[0], fds[1]))
}
