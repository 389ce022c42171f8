// src/syscalls.rs
//
// Thin libc layer for everything the reactor touches directly: the listen
// socket, epoll, non-blocking I/O, the signal self-pipe, and the interval
// alarm. Linux only.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void, socklen_t};

use crate::config::TriggerMode;
use crate::error::{RavelError, RavelResult};

/// Socket send/recv buffer size applied to the listener and every accepted
/// connection; large uploads stream through without shrinking the window.
pub const SOCKET_BUFFER_SIZE: c_int = 16 * 1024 * 1024;

const LISTEN_BACKLOG: c_int = 65535;

// ---- Socket setup ----

pub fn set_nonblocking(fd: c_int) -> RavelResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Best effort; the connection still works with default buffer sizes.
pub fn set_io_buffer_sizes(fd: c_int) {
    unsafe {
        let size = SOCKET_BUFFER_SIZE;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const c_void,
            mem::size_of_val(&size) as socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const c_void,
            mem::size_of_val(&size) as socklen_t,
        );
    }
}

/// Create the listen socket: SO_REUSEADDR, SO_LINGER per config, 16 MiB I/O
/// buffers, bound to 0.0.0.0:port, backlog 65535.
pub fn create_listen_socket(port: u16, linger_on: bool) -> RavelResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let linger = libc::linger {
            l_onoff: if linger_on { 1 } else { 0 },
            l_linger: 1,
        };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        );

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        set_io_buffer_sizes(fd);

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(RavelError::Startup(format!("bind port {}: {}", port, err)));
        }
        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(RavelError::Startup(format!("listen port {}: {}", port, err)));
        }
        Ok(fd)
    }
}

/// Non-blocking accept. `Ok(None)` when the accept would block.
pub fn accept_connection(listen_fd: c_int) -> RavelResult<Option<(c_int, Ipv4Addr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(Some((fd, ip)))
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

// ---- Epoll ----

pub struct Epoll {
    fd: c_int,
}

/// Compose an event mask for a registration: EPOLLRDHUP always rides along,
/// edge mode adds EPOLLET, and one-shot adds EPOLLONESHOT.
pub fn interest(base: u32, trigger: TriggerMode, one_shot: bool) -> u32 {
    let mut events = base | libc::EPOLLRDHUP as u32;
    if trigger == TriggerMode::Edge {
        events |= libc::EPOLLET as u32;
    }
    if one_shot {
        events |= libc::EPOLLONESHOT as u32;
    }
    events
}

impl Epoll {
    pub fn new() -> RavelResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(RavelError::Startup(format!(
                    "epoll_create1: {}",
                    io::Error::last_os_error()
                )));
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, events: u32) -> RavelResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> RavelResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: c_int) -> RavelResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // Already gone is fine; the close path can race a HUP event.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, events: u32) -> RavelResult<()> {
        let mut event = libc::epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Wait for readiness; EINTR surfaces as an empty ready set.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> RavelResult<usize> {
        unsafe {
            let n = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(n as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

// ---- Non-blocking I/O ----

pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// One recv into `buf`, retrying EINTR internally.
pub fn read_socket(fd: c_int, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(ReadOutcome::WouldBlock);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        return Ok(ReadOutcome::Data(n as usize));
    }
}

pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

/// Scatter write of header + body slices in one syscall, retrying EINTR.
pub fn writev_socket(fd: c_int, head: &[u8], body: &[u8]) -> io::Result<WriteOutcome> {
    let iov = [
        libc::iovec {
            iov_base: head.as_ptr() as *mut c_void,
            iov_len: head.len(),
        },
        libc::iovec {
            iov_base: body.as_ptr() as *mut c_void,
            iov_len: body.len(),
        },
    ];
    loop {
        let n = unsafe { libc::writev(fd, iov.as_ptr(), 2) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(WriteOutcome::WouldBlock);
            }
            return Err(err);
        }
        return Ok(WriteOutcome::Wrote(n as usize));
    }
}

/// Short out-of-band sends (100-continue preamble, "server busy" notice).
/// Failures are the peer's problem; nothing to recover here.
pub fn send_best_effort(fd: c_int, bytes: &[u8]) {
    let mut sent = 0;
    while sent < bytes.len() {
        let n = unsafe {
            libc::send(
                fd,
                bytes[sent..].as_ptr() as *const c_void,
                bytes.len() - sent,
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        sent += n as usize;
    }
}

// ---- Signal self-pipe ----

static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn pipe_signal_handler(sig: c_int) {
    // Async-signal-safe: one send, errno preserved.
    unsafe {
        let saved_errno = *libc::__errno_location();
        let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const c_void, 1, 0);
        }
        *libc::__errno_location() = saved_errno;
    }
}

/// Bidirectional pair for the signal self-pipe; the write end is made
/// non-blocking so a burst of signals cannot wedge a handler.
pub fn socket_pair() -> RavelResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(RavelError::Startup(format!(
                "socketpair: {}",
                io::Error::last_os_error()
            )));
        }
    }
    set_nonblocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

fn install_handler(sig: c_int, handler: libc::sighandler_t) -> RavelResult<()> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Ignore SIGPIPE; route SIGALRM and SIGTERM through the self-pipe.
pub fn install_signal_handlers(pipe_write_fd: c_int) -> RavelResult<()> {
    SIGNAL_PIPE_WRITE.store(pipe_write_fd, Ordering::SeqCst);
    install_handler(libc::SIGPIPE, libc::SIG_IGN)?;
    install_handler(libc::SIGALRM, pipe_signal_handler as libc::sighandler_t)?;
    install_handler(libc::SIGTERM, pipe_signal_handler as libc::sighandler_t)?;
    Ok(())
}

pub fn arm_alarm(seconds: u32) {
    unsafe {
        libc::alarm(seconds);
    }
}
