//! Unix-domain socket plumbing: address construction (including the Linux
//! long-path workaround and abstract names), listen and connect.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use crate::sys::net::{self, LISTEN_BACKLOG};

/// A prepared `sockaddr_un` plus its exact length. `_dir_fd` keeps the
/// parent-directory fd (Linux long-path workaround) alive until after the
/// bind/connect that uses the address.
pub(crate) struct UnixAddr {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
    _dir_fd: Option<DirFd>,
}

impl std::fmt::Debug for UnixAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixAddr").field("len", &self.len).finish()
    }
}

struct DirFd(RawFd);

impl Drop for DirFd {
    fn drop(&mut self) {
        let _ = syscall!(close(self.0));
    }
}

fn sun_path_capacity() -> usize {
    let addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_path.len()
}

fn sun_path_offset() -> libc::socklen_t {
    let addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &addr as *const _ as usize;
    let path = addr.sun_path.as_ptr() as usize;
    (path - base) as libc::socklen_t
}

/// Build a `sockaddr_un` for `path`.
///
/// - Abstract names (leading NUL) use the exact `offsetof(sun_path) + len`
///   address length.
/// - On Linux, filesystem paths longer than `sun_path` are reached through
///   `/proc/self/fd/<dirfd>/<basename>` with an `O_PATH` fd on the parent
///   directory.
pub(crate) fn unix_addr(path: &[u8]) -> io::Result<UnixAddr> {
    if path.is_empty() {
        return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let capacity = sun_path_capacity();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if path.len() >= capacity && path[0] != 0 {
        return long_path_addr(path, addr, capacity);
    }

    if path.len() >= capacity {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }

    for (dst, src) in addr.sun_path.iter_mut().zip(path.iter()) {
        *dst = *src as libc::c_char;
    }

    let len = if path[0] == 0 {
        // Abstract socket: the name is length-delimited, not NUL-terminated.
        sun_path_offset() + path.len() as libc::socklen_t
    } else {
        mem::size_of::<libc::sockaddr_un>() as libc::socklen_t
    };

    Ok(UnixAddr {
        addr,
        len,
        _dir_fd: None,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn long_path_addr(
    path: &[u8],
    mut addr: libc::sockaddr_un,
    capacity: usize,
) -> io::Result<UnixAddr> {
    // Split into dirname and basename; the basename must still fit once
    // prefixed with /proc/self/fd/<fd>/.
    let mut dirname_len = path.len();
    while dirname_len > 1 && path[dirname_len - 1] != b'/' {
        dirname_len -= 1;
    }
    if dirname_len < 2 || path.len() - dirname_len + 1 >= capacity {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }

    let mut dirname = path[..dirname_len].to_vec();
    dirname.push(0);

    let dir_fd = syscall!(open(
        dirname.as_ptr() as *const libc::c_char,
        libc::O_CLOEXEC | libc::O_PATH | libc::O_DIRECTORY,
    ))
    .map_err(|_| io::Error::from_raw_os_error(libc::ENAMETOOLONG))?;
    let dir_fd = DirFd(dir_fd);

    let basename = &path[dirname_len..];
    let prefix = format!("/proc/self/fd/{}/", dir_fd.0);
    if prefix.len() + basename.len() >= capacity {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }

    let mut sun_path = Vec::with_capacity(prefix.len() + basename.len());
    sun_path.extend_from_slice(prefix.as_bytes());
    sun_path.extend_from_slice(basename);
    for (dst, src) in addr.sun_path.iter_mut().zip(sun_path.iter()) {
        *dst = *src as libc::c_char;
    }

    Ok(UnixAddr {
        addr,
        len: mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        _dir_fd: Some(dir_fd),
    })
}

fn unlink_path(path: &[u8]) {
    // Abstract names have no filesystem presence.
    if path[0] == 0 {
        return;
    }
    let mut c_path = path.to_vec();
    c_path.push(0);
    // ENOENT is the normal case.
    let _ = syscall!(unlink(c_path.as_ptr() as *const libc::c_char));
}

pub(crate) fn create_listen_socket(path: &[u8], _options: u32) -> io::Result<RawFd> {
    let addr = unix_addr(path)?;

    let fd = net::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;

    // 700 permission by default.
    let _ = syscall!(fchmod(fd, libc::S_IRWXU));

    unlink_path(path);

    let res = syscall!(bind(
        fd,
        &addr.addr as *const _ as *const libc::sockaddr,
        addr.len
    ))
    .and_then(|_| syscall!(listen(fd, LISTEN_BACKLOG)));

    match res {
        Ok(_) => Ok(fd),
        Err(err) => {
            net::close(fd);
            Err(err)
        }
    }
}

pub(crate) fn create_connect_socket(path: &[u8]) -> io::Result<RawFd> {
    let addr = unix_addr(path)?;

    let fd = net::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;

    let res = loop {
        match syscall!(connect(
            fd,
            &addr.addr as *const _ as *const libc::sockaddr,
            addr.len
        )) {
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    match res {
        Ok(_) => Ok(fd),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(err) => {
            net::close(fd);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{sun_path_offset, unix_addr};

    #[test]
    fn abstract_name_uses_exact_length() {
        let addr = unix_addr(b"\0usio-test").unwrap();
        assert_eq!(addr.len, sun_path_offset() + 10);
    }

    #[test]
    fn empty_path_is_enoent() {
        let err = unix_addr(b"").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn oversized_relative_path_is_enametoolong() {
        // No directory separator, so the /proc/self/fd rewrite cannot help.
        let path = vec![b'x'; 200];
        let err = unix_addr(&path).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
    }
}
