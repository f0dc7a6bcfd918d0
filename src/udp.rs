//! UDP sockets: one poll bound to one port, batched receive, and a single
//! drain notification per backpressure episode.

use std::any::Any;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::poll::{PollEntry, UdpEntry, UdpId};
use crate::sys::net;
use crate::sys::udp::{self as sys_udp, UdpBatch, UDP_RECV_STRIDE};
use crate::{EventLoop, Interest, RECV_BUFFER_PADDING};

/// Callback invoked with each received batch of datagrams.
pub type UdpDataFn = fn(&mut EventLoop, UdpId, &UdpDatagrams<'_>);

/// A batch of received datagrams. Payloads point into the loop's shared
/// receive buffer and are only valid for the duration of the callback.
pub struct UdpDatagrams<'a> {
    batch: &'a UdpBatch,
    recv_area: &'a [u8],
    count: usize,
}

impl<'a> UdpDatagrams<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn payload(&self, index: usize) -> &[u8] {
        assert!(index < self.count);
        let offset = index * UDP_RECV_STRIDE;
        &self.recv_area[offset..offset + self.batch.payload_len(index)]
    }

    pub fn peer_addr(&self, index: usize) -> io::Result<SocketAddr> {
        assert!(index < self.count);
        self.batch.peer_addr(index)
    }

    /// IP the packet was sent to (from the packet-info control message).
    pub fn local_ip(&self, index: usize) -> Option<([u8; 16], usize)> {
        assert!(index < self.count);
        self.batch.local_ip(index)
    }

    /// ECN bits of the packet.
    pub fn ecn(&self, index: usize) -> Option<u8> {
        assert!(index < self.count);
        self.batch.ecn(index)
    }
}

impl EventLoop {
    /// Create a UDP socket bound to `host:port` (port 0 picks one).
    pub fn create_udp_socket(
        &mut self,
        host: &str,
        port: u16,
        on_data: Option<UdpDataFn>,
        on_drain: Option<fn(&mut EventLoop, UdpId)>,
        on_close: Option<fn(&mut EventLoop, UdpId)>,
    ) -> io::Result<UdpId> {
        let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let fd = sys_udp::create_udp_socket(&addrs, port)?;

        // The socket keeps one port for its whole life; cache it.
        let bound_port = net::local_addr(fd).map(|a| a.port()).unwrap_or(port);

        let handle = self.polls.insert(PollEntry::Udp(UdpEntry {
            fd,
            interest: Interest::READABLE,
            port: bound_port,
            closed: false,
            on_data,
            on_drain,
            on_close,
            ext: None,
        }));
        if let Err(err) = self.register_poll(fd, handle.index(), Interest::READABLE) {
            self.polls.remove(handle);
            net::close(fd);
            return Err(err);
        }
        Ok(UdpId(handle))
    }

    pub fn udp_bound_port(&self, u: UdpId) -> Option<u16> {
        self.polls
            .get(u.0)
            .and_then(PollEntry::as_udp)
            .map(|e| e.port)
    }

    pub fn udp_local_addr(&self, u: UdpId) -> io::Result<SocketAddr> {
        match self.polls.get(u.0).and_then(PollEntry::as_udp) {
            Some(e) if !e.closed => net::local_addr(e.fd),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn udp_ext(&self, u: UdpId) -> Option<&(dyn Any + 'static)> {
        self.polls
            .get(u.0)
            .and_then(PollEntry::as_udp)
            .and_then(|e| e.ext.as_deref())
    }

    pub fn set_udp_ext(&mut self, u: UdpId, ext: Box<dyn Any>) {
        if let Some(e) = self.polls.get_mut(u.0).and_then(PollEntry::as_udp_mut) {
            e.ext = Some(ext);
        }
    }

    /// Send a batch of datagrams. Returns how many were handed to the
    /// kernel; when short, the socket subscribes to writable and `on_drain`
    /// fires exactly once when sending may resume.
    pub fn udp_send(&mut self, u: UdpId, packets: &[(&[u8], Option<SocketAddr>)]) -> usize {
        let (fd, interest) = match self.polls.get(u.0).and_then(PollEntry::as_udp) {
            Some(e) if !e.closed => (e.fd, e.interest),
            _ => return 0,
        };

        let sent = match sys_udp::sendmmsg(fd, packets) {
            Ok(sent) => sent,
            Err(_) => return 0,
        };
        if sent < packets.len() {
            self.poll_change(u.0.index(), interest | Interest::WRITABLE);
        }
        sent
    }

    /// Close the UDP socket. The entry is reclaimed at the end of the
    /// iteration, which keeps a receive loop over it well-defined.
    pub fn udp_close(&mut self, u: UdpId) {
        let (fd, on_close) = match self.polls.get_mut(u.0).and_then(PollEntry::as_udp_mut) {
            Some(e) if !e.closed => {
                e.closed = true;
                (e.fd, e.on_close)
            }
            _ => return,
        };

        self.poll_stop(u.0.index());
        net::close(fd);
        self.defer_udp_free(u.0);

        if let Some(cb) = on_close {
            cb(self, u);
        }
    }
}

/// Ready-event fan-out for UDP polls.
pub(crate) fn dispatch(lp: &mut EventLoop, token: usize, error: bool, readable: bool, writable: bool) {
    let id = match lp.udp_id_at(token) {
        Some(id) => id,
        None => return,
    };

    let mut saw_error = error;

    if readable {
        loop {
            let closed = lp
                .polls
                .get_at(token)
                .and_then(PollEntry::as_udp)
                .map_or(true, |e| e.closed);
            if closed {
                break;
            }
            let fd = match lp.polls.get_at(token).and_then(PollEntry::as_udp) {
                Some(e) => e.fd,
                None => break,
            };

            let mut buf = std::mem::take(&mut lp.recv_buf);
            let mut batch = match lp.udp_batch.take() {
                Some(b) => b,
                None => {
                    lp.recv_buf = buf;
                    break;
                }
            };
            if buf.is_empty() {
                lp.udp_batch = Some(batch);
                break;
            }

            let recv_area = &mut buf[RECV_BUFFER_PADDING..];
            let res = sys_udp::recvmmsg(fd, recv_area, &mut batch);

            match res {
                Ok(npackets) if npackets > 0 => {
                    let on_data = lp
                        .polls
                        .get_at(token)
                        .and_then(PollEntry::as_udp)
                        .and_then(|e| e.on_data);
                    if let Some(cb) = on_data {
                        let datagrams = UdpDatagrams {
                            batch: &batch,
                            recv_area: &buf[RECV_BUFFER_PADDING..],
                            count: npackets,
                        };
                        cb(lp, id, &datagrams);
                    }
                    lp.recv_buf = buf;
                    lp.udp_batch = Some(batch);
                }
                Ok(_) => {
                    // Zero messages: nothing left to read.
                    lp.recv_buf = buf;
                    lp.udp_batch = Some(batch);
                    break;
                }
                Err(err) => {
                    lp.recv_buf = buf;
                    lp.udp_batch = Some(batch);
                    if err.kind() != io::ErrorKind::WouldBlock {
                        saw_error = true;
                    }
                    break;
                }
            }
        }
    }

    let closed = lp
        .polls
        .get_at(token)
        .and_then(PollEntry::as_udp)
        .map_or(true, |e| e.closed);

    if writable && !saw_error && !closed {
        let on_drain = lp
            .polls
            .get_at(token)
            .and_then(PollEntry::as_udp)
            .and_then(|e| e.on_drain);
        if let Some(cb) = on_drain {
            cb(lp, id);
        }
        let closed_now = lp
            .polls
            .get_at(token)
            .and_then(PollEntry::as_udp)
            .map_or(true, |e| e.closed);
        if !closed_now {
            // We only poll for writable after a failed send, and we only
            // send one drain notification per episode.
            lp.poll_change(token, Interest::READABLE);
        }
        return;
    }

    if saw_error && !closed {
        lp.udp_close(id);
    }
}
