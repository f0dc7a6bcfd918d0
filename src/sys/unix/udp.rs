//! Batched UDP receive/send.
//!
//! Linux uses `recvmmsg`/`sendmmsg`; the other platforms emulate the same
//! interface with one `recvmsg`/`sendto` per call. Every received message
//! carries control data for the destination IP (packet info) and the
//! TOS/TCLASS byte (ECN).

use std::io;
use std::mem;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::sys::net::{self, socket_addr, to_socket_addr};
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::RECV_BUFFER_LENGTH;

/// Each datagram gets a 64 KiB stride of the shared receive buffer; larger
/// packets are truncated by the kernel and dropped by the caller.
pub(crate) const UDP_RECV_STRIDE: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const UDP_RECV_COUNT: usize = RECV_BUFFER_LENGTH / UDP_RECV_STRIDE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const UDP_RECV_COUNT: usize = 1;

const CMSG_LEN: usize = 128;

/// Per-batch kernel-filled metadata. The payload bytes live in the loop's
/// shared receive buffer; this struct only holds names and control data.
pub(crate) struct UdpBatch {
    names: Box<[libc::sockaddr_storage]>,
    controls: Box<[[u8; CMSG_LEN]]>,
    control_lens: Box<[usize]>,
    payload_lens: Box<[usize]>,
}

impl UdpBatch {
    pub(crate) fn new() -> UdpBatch {
        UdpBatch {
            names: vec![unsafe { mem::zeroed() }; UDP_RECV_COUNT].into_boxed_slice(),
            controls: vec![[0u8; CMSG_LEN]; UDP_RECV_COUNT].into_boxed_slice(),
            control_lens: vec![0; UDP_RECV_COUNT].into_boxed_slice(),
            payload_lens: vec![0; UDP_RECV_COUNT].into_boxed_slice(),
        }
    }

    pub(crate) fn payload_len(&self, index: usize) -> usize {
        self.payload_lens[index]
    }

    pub(crate) fn peer_addr(&self, index: usize) -> io::Result<SocketAddr> {
        unsafe { to_socket_addr(&self.names[index]) }
    }

    /// Destination IP of the packet, from IP_PKTINFO / IPV6_PKTINFO.
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "ios",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    pub(crate) fn local_ip(&self, index: usize) -> Option<([u8; 16], usize)> {
        let mut out = None;
        self.walk_cmsgs(index, |level, ty, data| {
            if level == libc::IPPROTO_IP && ty == libc::IP_PKTINFO {
                if data.len() >= mem::size_of::<libc::in_pktinfo>() {
                    let info = unsafe { &*(data.as_ptr() as *const libc::in_pktinfo) };
                    let mut ip = [0u8; 16];
                    ip[..4].copy_from_slice(&info.ipi_addr.s_addr.to_ne_bytes());
                    out = Some((ip, 4));
                }
            } else if level == libc::IPPROTO_IPV6 && ty == libc::IPV6_PKTINFO {
                if data.len() >= mem::size_of::<libc::in6_pktinfo>() {
                    let info = unsafe { &*(data.as_ptr() as *const libc::in6_pktinfo) };
                    let mut ip = [0u8; 16];
                    ip.copy_from_slice(&info.ipi6_addr.s6_addr);
                    out = Some((ip, 16));
                }
            }
        });
        out
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "ios",
        target_os = "macos",
        target_os = "freebsd"
    )))]
    pub(crate) fn local_ip(&self, _index: usize) -> Option<([u8; 16], usize)> {
        None
    }

    /// ECN bits of the packet, from IP_TOS / IPV6_TCLASS.
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "ios",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    pub(crate) fn ecn(&self, index: usize) -> Option<u8> {
        let mut out = None;
        self.walk_cmsgs(index, |level, ty, data| {
            let is_tos = level == libc::IPPROTO_IP && ty == libc::IP_TOS;
            let is_tclass = level == libc::IPPROTO_IPV6 && ty == libc::IPV6_TCLASS;
            if (is_tos || is_tclass) && !data.is_empty() {
                // TOS arrives as a single byte, TCLASS as an int.
                let value = if data.len() >= mem::size_of::<libc::c_int>() {
                    unsafe { *(data.as_ptr() as *const libc::c_int) as u8 }
                } else {
                    data[0]
                };
                out = Some(value & 0b11);
            }
        });
        out
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "ios",
        target_os = "macos",
        target_os = "freebsd"
    )))]
    pub(crate) fn ecn(&self, _index: usize) -> Option<u8> {
        None
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "ios",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    fn walk_cmsgs(&self, index: usize, mut f: impl FnMut(libc::c_int, libc::c_int, &[u8])) {
        let control = &self.controls[index];
        let control_len = self.control_lens[index];
        if control_len == 0 {
            return;
        }

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_ptr() as *mut libc::c_void;
        msg.msg_controllen = control_len as _;

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let data_ptr = libc::CMSG_DATA(cmsg);
                let total = (*cmsg).cmsg_len as usize;
                let header = data_ptr as usize - cmsg as usize;
                let data_len = total.saturating_sub(header);
                let data = std::slice::from_raw_parts(data_ptr, data_len);
                f((*cmsg).cmsg_level, (*cmsg).cmsg_type, data);
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
    }
}

/// Receive up to `UDP_RECV_COUNT` datagrams into 64 KiB strides of
/// `recv_area`. Returns the number of datagrams received.
pub(crate) fn recvmmsg(fd: RawFd, recv_area: &mut [u8], batch: &mut UdpBatch) -> io::Result<usize> {
    debug_assert!(recv_area.len() >= UDP_RECV_COUNT * UDP_RECV_STRIDE);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut iovecs: [MaybeUninit<libc::iovec>; UDP_RECV_COUNT] =
            [MaybeUninit::uninit(); UDP_RECV_COUNT];
        let mut hdrs: [MaybeUninit<libc::mmsghdr>; UDP_RECV_COUNT] =
            [MaybeUninit::uninit(); UDP_RECV_COUNT];

        for i in 0..UDP_RECV_COUNT {
            let stride = &mut recv_area[i * UDP_RECV_STRIDE..(i + 1) * UDP_RECV_STRIDE];
            iovecs[i] = MaybeUninit::new(libc::iovec {
                iov_base: stride.as_mut_ptr() as *mut libc::c_void,
                iov_len: stride.len(),
            });

            let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
            hdr.msg_hdr.msg_name = &mut batch.names[i] as *mut _ as *mut libc::c_void;
            hdr.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_hdr.msg_iov = iovecs[i].as_mut_ptr();
            hdr.msg_hdr.msg_iovlen = 1;
            hdr.msg_hdr.msg_control = batch.controls[i].as_mut_ptr() as *mut libc::c_void;
            hdr.msg_hdr.msg_controllen = CMSG_LEN as _;
            hdrs[i] = MaybeUninit::new(hdr);
        }

        let n = loop {
            let res = unsafe {
                libc::recvmmsg(
                    fd,
                    hdrs[0].as_mut_ptr(),
                    UDP_RECV_COUNT as libc::c_uint,
                    libc::MSG_DONTWAIT,
                    std::ptr::null_mut(),
                )
            };
            if res == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break res as usize;
        };

        for i in 0..n {
            let hdr = unsafe { hdrs[i].assume_init_ref() };
            batch.payload_lens[i] = hdr.msg_len as usize;
            batch.control_lens[i] = hdr.msg_hdr.msg_controllen as usize;
        }
        Ok(n)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let stride = &mut recv_area[..UDP_RECV_STRIDE];
        let mut iov = libc::iovec {
            iov_base: stride.as_mut_ptr() as *mut libc::c_void,
            iov_len: stride.len(),
        };

        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_name = &mut batch.names[0] as *mut _ as *mut libc::c_void;
        hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = batch.controls[0].as_mut_ptr() as *mut libc::c_void;
        hdr.msg_controllen = CMSG_LEN as _;

        let n = loop {
            let res = unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_DONTWAIT) };
            if res == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break res as usize;
        };

        batch.payload_lens[0] = n;
        batch.control_lens[0] = hdr.msg_controllen as usize;
        Ok(1)
    }
}

/// Send a batch of datagrams. Returns how many were fully handed to the
/// kernel; a short count means the socket ran out of buffer space.
pub(crate) fn sendmmsg(fd: RawFd, packets: &[(&[u8], Option<SocketAddr>)]) -> io::Result<usize> {
    if packets.is_empty() {
        return Ok(0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut addrs = Vec::with_capacity(packets.len());
        let mut iovecs = Vec::with_capacity(packets.len());
        let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(packets.len());

        for (payload, addr) in packets {
            let raw = addr.as_ref().map(socket_addr);
            addrs.push(raw);
            iovecs.push(libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            });
        }
        for i in 0..packets.len() {
            let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
            if let Some((raw, len)) = &addrs[i] {
                hdr.msg_hdr.msg_name = raw.as_ptr() as *mut libc::c_void;
                hdr.msg_hdr.msg_namelen = *len;
            }
            hdr.msg_hdr.msg_iov = &mut iovecs[i];
            hdr.msg_hdr.msg_iovlen = 1;
            hdrs.push(hdr);
        }

        loop {
            let res = unsafe {
                libc::sendmmsg(
                    fd,
                    hdrs.as_mut_ptr(),
                    hdrs.len() as libc::c_uint,
                    libc::MSG_DONTWAIT,
                )
            };
            if res == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(0);
                }
                return Err(err);
            }
            return Ok(res as usize);
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let mut sent = 0;
        for (payload, addr) in packets {
            let res = match addr {
                Some(addr) => {
                    let (raw, len) = socket_addr(addr);
                    unsafe {
                        libc::sendto(
                            fd,
                            payload.as_ptr() as *const libc::c_void,
                            payload.len(),
                            libc::MSG_DONTWAIT,
                            raw.as_ptr(),
                            len,
                        )
                    }
                }
                None => unsafe {
                    libc::send(
                        fd,
                        payload.as_ptr() as *const libc::c_void,
                        payload.len(),
                        libc::MSG_DONTWAIT,
                    )
                },
            };
            if res == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if sent == 0 {
                    return Err(err);
                }
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}

/// Create a bound UDP socket with packet-info and ECN reporting enabled.
pub(crate) fn create_udp_socket(addrs: &[SocketAddr], port: u16) -> io::Result<RawFd> {
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
        let fd = match net::new_socket(domain, libc::SOCK_DGRAM) {
            Ok(fd) => fd,
            Err(err) => {
                last_err = err;
                continue;
            }
        };

        if port != 0 {
            let on: libc::c_int = 1;
            let _ = syscall!(setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ));
        }

        if addr.is_ipv6() {
            let off: libc::c_int = 0;
            let _ = syscall!(setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &off as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ));
        }

        set_pktinfo(fd, addr.is_ipv6());
        set_ecn(fd, addr.is_ipv6());

        let (raw_addr, raw_addr_length) = socket_addr(addr);
        match syscall!(bind(fd, raw_addr.as_ptr(), raw_addr_length)) {
            Ok(_) => return Ok(fd),
            Err(err) => {
                last_err = err;
                net::close(fd);
            }
        }
    }

    Err(last_err)
}

/// We need the destination address for received packets, in both families.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "ios",
    target_os = "macos",
    target_os = "freebsd"
))]
fn set_pktinfo(fd: RawFd, ipv6: bool) {
    let on: libc::c_int = 1;
    let res = if ipv6 {
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
    } else {
        Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT))
    };
    if res.is_err() {
        let _ = syscall!(setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ));
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "ios",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn set_pktinfo(_fd: RawFd, _ipv6: bool) {}

/// These are used for getting the ECN.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "ios",
    target_os = "macos",
    target_os = "freebsd"
))]
fn set_ecn(fd: RawFd, ipv6: bool) {
    let on: libc::c_int = 1;
    let res = if ipv6 {
        syscall!(setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVTCLASS,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
    } else {
        Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT))
    };
    if res.is_err() {
        let _ = syscall!(setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_RECVTOS,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ));
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "ios",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn set_ecn(_fd: RawFd, _ipv6: bool) {}
