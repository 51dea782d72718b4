//! UDP socket hosting.
//!
//! The loop can host UDP sockets for higher layers: each socket keeps a
//! single-shot recvmsg SQE in flight (re-armed after every datagram) and
//! delivers received datagrams to a callback on the loop thread. Sends are
//! non-blocking sendmsg calls; a full socket buffer drops the datagram
//! rather than stalling the loop — datagram consumers are expected to
//! tolerate loss.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::Error;
use crate::metrics;
use crate::ring::Reactor;

/// Opaque identifier for a UDP socket hosted on a [`Loop`](crate::Loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpToken(pub(crate) u32);

pub(crate) type UdpRecvFn = dyn FnMut(&[u8], SocketAddr) + Send;

/// Per-socket receive state. The recv buffers and msghdr are boxed so their
/// addresses stay stable while a recvmsg SQE is in flight.
pub(crate) struct UdpEntry {
    fd: OwnedFd,
    recv_buf: Box<[u8]>,
    recv_addr: Box<libc::sockaddr_storage>,
    #[allow(dead_code)] // referenced by recv_msghdr
    recv_iov: Box<libc::iovec>,
    recv_msghdr: Box<libc::msghdr>,
    pub(crate) callback: Option<Box<UdpRecvFn>>,
    pub(crate) closing: bool,
}

impl UdpEntry {
    fn new(fd: OwnedFd, buffer_size: usize, callback: Box<UdpRecvFn>) -> Self {
        let recv_buf = vec![0u8; buffer_size].into_boxed_slice();
        let mut recv_addr: Box<libc::sockaddr_storage> = Box::new(unsafe { std::mem::zeroed() });
        let mut recv_iov = Box::new(libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        });
        let mut recv_msghdr: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });

        // Wire up pointers; stable because everything is boxed.
        recv_iov.iov_base = recv_buf.as_ptr() as *mut libc::c_void;
        recv_iov.iov_len = recv_buf.len();
        recv_msghdr.msg_name = &mut *recv_addr as *mut _ as *mut libc::c_void;
        recv_msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        recv_msghdr.msg_iov = &mut *recv_iov as *mut libc::iovec;
        recv_msghdr.msg_iovlen = 1;

        UdpEntry {
            fd,
            recv_buf,
            recv_addr,
            recv_iov,
            recv_msghdr,
            callback: Some(callback),
            closing: false,
        }
    }

    fn reset_recv_namelen(&mut self) {
        self.recv_msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
    }
}

/// Loop-confined table of hosted UDP sockets.
pub(crate) struct UdpTable {
    entries: HashMap<u32, UdpEntry>,
    buffer_size: usize,
}

impl UdpTable {
    pub(crate) fn new(buffer_size: usize) -> Self {
        UdpTable {
            entries: HashMap::new(),
            buffer_size,
        }
    }

    /// Install a socket and arm its first recvmsg.
    pub(crate) fn install(
        &mut self,
        reactor: &mut Reactor,
        token: u32,
        fd: OwnedFd,
        local: SocketAddr,
        callback: Box<UdpRecvFn>,
    ) {
        let entry = UdpEntry::new(fd, self.buffer_size, callback);
        let raw = entry.fd.as_raw_fd();
        let msghdr = &*entry.recv_msghdr as *const libc::msghdr as *mut libc::msghdr;
        self.entries.insert(token, entry);
        if let Err(e) = reactor.submit_udp_recv(raw, msghdr, token) {
            tracing::warn!(token, error = %e, "failed to arm UDP recv");
            self.entries.remove(&token);
            return;
        }
        tracing::debug!(%local, token, "UDP socket installed");
    }

    /// Begin removal: the entry is dropped when its in-flight recvmsg
    /// completes (cancelled or with a final datagram).
    pub(crate) fn begin_remove(&mut self, reactor: &mut Reactor, token: u32) {
        if let Some(entry) = self.entries.get_mut(&token) {
            entry.closing = true;
            entry.callback = None;
            let _ = reactor.cancel_udp_recv(token);
        }
    }

    /// Handle a recvmsg CQE for `token`. Returns a received datagram to
    /// deliver, if any.
    pub(crate) fn on_recv_cqe(
        &mut self,
        reactor: &mut Reactor,
        token: u32,
        result: i32,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        let entry = self.entries.get_mut(&token)?;

        if entry.closing {
            self.entries.remove(&token);
            return None;
        }

        if result <= 0 {
            // Transient receive errors (including spurious cancels) just
            // re-arm; the socket stays usable.
            Self::resubmit(reactor, token, entry);
            return None;
        }

        let len = result as usize;
        let data = entry.recv_buf[..len].to_vec();
        let peer = sockaddr_to_socket_addr(&entry.recv_addr, entry.recv_msghdr.msg_namelen);
        Self::resubmit(reactor, token, entry);

        let peer = peer?;
        metrics::UDP_DATAGRAMS_RECEIVED.increment();
        Some((data, peer))
    }

    fn resubmit(reactor: &mut Reactor, token: u32, entry: &mut UdpEntry) {
        entry.reset_recv_namelen();
        let raw = entry.fd.as_raw_fd();
        let msghdr = &mut *entry.recv_msghdr as *mut libc::msghdr;
        let _ = reactor.submit_udp_recv(raw, msghdr, token);
    }

    /// Send a datagram. A full socket buffer drops the datagram silently.
    pub(crate) fn send(&mut self, token: u32, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        let entry = self.entries.get(&token).ok_or(Error::InvalidUdpSocket)?;

        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(peer, &mut addr);
        let iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
        msg.msg_namelen = addr_len;
        msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
        msg.msg_iovlen = 1;

        let ret = unsafe { libc::sendmsg(entry.fd.as_raw_fd(), &msg, libc::MSG_DONTWAIT) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) => {
                    metrics::UDP_SEND_DROPPED.increment();
                    Ok(())
                }
                _ => Err(Error::Io(err)),
            };
        }
        metrics::UDP_DATAGRAMS_SENT.increment();
        Ok(())
    }

    /// Take a socket's callback out for a delivery, so user code runs with no
    /// table borrow outstanding.
    pub(crate) fn take_callback(&mut self, token: u32) -> Option<Box<UdpRecvFn>> {
        self.entries.get_mut(&token)?.callback.take()
    }

    /// Put a callback back after a delivery. Dropped if the socket was
    /// removed in the meantime.
    pub(crate) fn restore_callback(&mut self, token: u32, callback: Box<UdpRecvFn>) {
        if let Some(entry) = self.entries.get_mut(&token)
            && !entry.closing
        {
            entry.callback = Some(callback);
        }
    }

    /// Cancel every in-flight recvmsg. Returns how many sockets still have
    /// one outstanding; the shutdown path drains until they complete.
    pub(crate) fn cancel_all(&mut self, reactor: &mut Reactor) -> usize {
        let mut pending = 0;
        for (&token, entry) in self.entries.iter_mut() {
            entry.closing = true;
            entry.callback = None;
            let _ = reactor.cancel_udp_recv(token);
            pending += 1;
        }
        pending
    }
}

pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

pub(crate) fn sockaddr_to_socket_addr(
    storage: &libc::sockaddr_storage,
    len: u32,
) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from(u32::from_be((*sin).sin_addr.s_addr)),
                    u16::from_be((*sin).sin_port),
                )
            };
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6;
            let (ip, port, flowinfo, scope) = unsafe {
                (
                    Ipv6Addr::from((*sin6).sin6_addr.s6_addr),
                    u16::from_be((*sin6).sin6_port),
                    (*sin6).sin6_flowinfo,
                    (*sin6).sin6_scope_id,
                )
            };
            Some(SocketAddr::V6(SocketAddrV6::new(ip, port, flowinfo, scope)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_v4_round_trip() {
        let addr: SocketAddr = "192.168.1.7:4433".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn sockaddr_v6_round_trip() {
        let addr: SocketAddr = "[2001:db8::42]:9000".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn truncated_sockaddr_rejected() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(sockaddr_to_socket_addr(&storage, 2), None);
    }

    #[test]
    fn unspecified_family_rejected() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert_eq!(
            sockaddr_to_socket_addr(&storage, std::mem::size_of::<libc::sockaddr_in>() as u32),
            None
        );
    }
}
