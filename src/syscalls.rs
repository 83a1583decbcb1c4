// src/syscalls.rs
//
// Thin non-blocking wrappers over libc. Linux only: the engine relies on
// epoll and TCP_CORK.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::WebResult;

/// Outcome of one non-blocking read/write on a descriptor.
///
/// The engine must tell "peer closed" from "try again later", so the two are
/// never folded into one value. EINTR is normalized to `WouldBlock`: the
/// event loop re-arms and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ready(usize),
    WouldBlock,
    Eof,
}

pub fn read_fd(fd: c_int, buf: &mut [u8]) -> io::Result<IoStatus> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    Ok(IoStatus::WouldBlock)
                }
                _ => Err(err),
            }
        } else if res == 0 {
            Ok(IoStatus::Eof)
        } else {
            Ok(IoStatus::Ready(res as usize))
        }
    }
}

pub fn write_fd(fd: c_int, buf: &[u8]) -> io::Result<IoStatus> {
    if buf.is_empty() {
        return Ok(IoStatus::Ready(0));
    }
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    Ok(IoStatus::WouldBlock)
                }
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => Ok(IoStatus::Eof),
                _ => Err(err),
            }
        } else {
            Ok(IoStatus::Ready(res as usize))
        }
    }
}

/// Plain write(2) for descriptors that are not sockets (file producers use
/// read_fd; this exists for symmetry in tests and tools).
pub fn write_plain_fd(fd: c_int, buf: &[u8]) -> io::Result<IoStatus> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    Ok(IoStatus::WouldBlock)
                }
                _ => Err(err),
            }
        } else {
            Ok(IoStatus::Ready(res as usize))
        }
    }
}

/// Kernel cork: hold small segments until a full packet is ready.
/// Failures are reported so the caller can log them; they are never fatal.
pub fn set_cork(fd: c_int, on: bool) -> io::Result<()> {
    let val: c_int = if on { 1 } else { 0 };
    unsafe {
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &val as *const _ as *const c_void,
            mem::size_of_val(&val) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Open outcome for static files; busy files turn into a 307 upstream.
pub enum OpenStatus {
    Opened(c_int),
    Busy,
    NotFound,
    Denied,
}

/// Open a file for the FILECOPY producer. Non-blocking so a slow or locked
/// file can never stall the event loop.
pub fn open_nonblocking(path: &Path) -> io::Result<OpenStatus> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
    unsafe {
        let fd = libc::open(
            cpath.as_ptr(),
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EBUSY) | Some(libc::EAGAIN) => Ok(OpenStatus::Busy),
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => Ok(OpenStatus::NotFound),
                Some(libc::EACCES) => Ok(OpenStatus::Denied),
                _ => Err(err),
            };
        }
        Ok(OpenStatus::Opened(fd))
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

// ---- Listener ----

/// Non-blocking TCP listener with SO_REUSEPORT so every worker binds the
/// same port and the kernel spreads accepts across them. TCP_NODELAY is set
/// on the listener and inherited by accepted sockets.
pub fn create_listen_socket_reuseport(host: &str, port: u16) -> WebResult<c_int> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, 4096) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> WebResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection, non-blocking, and report the peer address.
/// `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> WebResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                Some(libc::ECONNABORTED) => Ok(None),
                _ => Err(err.into()),
            };
        }

        let peer = sockaddr_to_addr(&storage);
        Ok(Some((fd, peer)))
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    unsafe {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())),
                    u16::from_be(sin.sin_port),
                )
            }
            libc::AF_INET6 => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                    u16::from_be(sin6.sin6_port),
                )
            }
            // Unix-domain peers have no meaningful address.
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

// ---- Epoll ----

pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};

/// Level-triggered epoll. Interest is recomputed from each slot's wait
/// flags after every transition, so edge semantics would only add missed-
/// wakeup hazards here.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> WebResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> WebResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> WebResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> WebResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> WebResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_missing_file_is_not_found() {
        match open_nonblocking(Path::new("/nonexistent/vigil-test-file")).unwrap() {
            OpenStatus::NotFound => {}
            _ => panic!("expected NotFound"),
        }
    }

    #[test]
    fn read_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let fd = match open_nonblocking(tmp.path()).unwrap() {
            OpenStatus::Opened(fd) => fd,
            _ => panic!("open failed"),
        };
        let mut buf = [0u8; 32];
        assert_eq!(read_fd(fd, &mut buf).unwrap(), IoStatus::Ready(10));
        assert_eq!(&buf[..10], b"0123456789");
        assert_eq!(read_fd(fd, &mut buf).unwrap(), IoStatus::Eof);
        close_fd(fd);
    }

    #[test]
    fn pipe_would_block_then_ready() {
        let mut fds = [0 as c_int; 2];
        unsafe {
            assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK), 0);
        }
        let mut buf = [0u8; 8];
        assert_eq!(read_fd(fds[0], &mut buf).unwrap(), IoStatus::WouldBlock);
        assert_eq!(write_plain_fd(fds[1], b"ab").unwrap(), IoStatus::Ready(2));
        assert_eq!(read_fd(fds[0], &mut buf).unwrap(), IoStatus::Ready(2));
        close_fd(fds[0]);
        close_fd(fds[1]);
    }
}
