//! Address resolution and raw socket helpers
//!
//! Turns `"host:port"` strings (IPv4 dotted-quad, bracketed IPv6 or DNS
//! names) into `sockaddr_storage` values and sets up listening sockets
//! with the options the completion loop expects.

use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;

/// Resolved socket address ready to hand to the kernel.
pub(crate) struct ResolvedAddr {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
    /// `AF_INET` or `AF_INET6`
    pub domain: i32,
}

/// Resolve `"host:port"` to a raw sockaddr. DNS resolution is permitted;
/// the first resolved address wins.
pub(crate) fn resolve(addr: &str) -> io::Result<ResolvedAddr> {
    let sock_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))?;
    Ok(to_raw(sock_addr))
}

fn to_raw(addr: SocketAddr) -> ResolvedAddr {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            ResolvedAddr {
                storage,
                len: mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                domain: libc::AF_INET,
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            ResolvedAddr {
                storage,
                len: mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                domain: libc::AF_INET6,
            }
        }
    }
}

fn sockopt(fd: RawFd, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create, configure, bind and listen a stream socket for `addr`.
///
/// `SO_REUSEADDR` and `SO_REUSEPORT` are enabled, the socket stays in
/// blocking mode (I/O is completion driven) and the backlog is 128.
/// Returns the listening fd and the bound port, which differs from the
/// requested one when binding port 0.
pub(crate) fn listen(addr: &ResolvedAddr) -> io::Result<(RawFd, u16)> {
    let fd = unsafe { libc::socket(addr.domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        sockopt(fd, libc::SO_REUSEADDR, 1)?;
        sockopt(fd, libc::SO_REUSEPORT, 1)?;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr.storage as *const _ as *const libc::sockaddr,
                addr.len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, 128) } < 0 {
            return Err(io::Error::last_os_error());
        }
        bound_port(fd)
    })();

    match result {
        Ok(port) => Ok((fd, port)),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

fn bound_port(fd: RawFd) -> io::Result<u16> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let port = match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            u16::from_be(sin.sin_port)
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            u16::from_be(sin6.sin6_port)
        }
        _ => 0,
    };
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_v4() {
        let cases = [("127.0.0.1:8080", 8080u16), ("4.4.4.4:0", 0)];
        for (addr, port) in cases {
            let r = resolve(addr).unwrap();
            assert_eq!(r.domain, libc::AF_INET);
            let sin = unsafe { &*(&r.storage as *const _ as *const libc::sockaddr_in) };
            assert_eq!(u16::from_be(sin.sin_port), port);
        }
    }

    #[test]
    fn resolve_v6() {
        let r = resolve("[2001:0000:130F:0000:0000:09C0:876A:130B]:1234").unwrap();
        assert_eq!(r.domain, libc::AF_INET6);
        let sin6 = unsafe { &*(&r.storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(u16::from_be(sin6.sin6_port), 1234);
        assert_eq!(
            sin6.sin6_addr.s6_addr,
            [32, 1, 0, 0, 19, 15, 0, 0, 0, 0, 9, 192, 135, 106, 19, 11]
        );
    }

    #[test]
    fn resolve_rejects_garbage() {
        assert!(resolve("not an address").is_err());
    }
}
