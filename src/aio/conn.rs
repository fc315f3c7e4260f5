//! Per-fd TCP connection state
//!
//! A [`TcpConn`] is created by a listener accept or a dial. The upstream
//! handler is attached with [`TcpConn::bind`], which starts the
//! multishot receive on the first call; later calls only swap the
//! handler, which is how a handshake upstream hands the connection over
//! to a WebSocket upstream without restarting I/O.
//!
//! At most one send may be in flight per connection: issue the next
//! [`TcpConn::send`] only after the previous one reported
//! [`Upstream::sent`] (or the connection closed).

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use super::{Errno, LoopInner};
use crate::error::Error;

/// The single reason a connection terminated, latched on the first
/// shutdown and surfaced exactly once through [`Upstream::closed`].
#[derive(Debug)]
pub enum ShutdownCause {
    /// Peer closed the stream (normal termination)
    EndOfStream,
    /// The owning listener was closed
    ListenerClosed,
    /// This side asked for the close
    UpstreamClosed,
    /// Kernel reported an errno on receive or send
    Errno(Errno),
    /// A protocol layer above gave up on the stream
    Codec(Error),
}

impl ShutdownCause {
    /// True for peer-initiated normal close.
    pub fn is_normal(&self) -> bool {
        matches!(self, ShutdownCause::EndOfStream)
    }
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownCause::EndOfStream => write!(f, "end of stream"),
            ShutdownCause::ListenerClosed => write!(f, "listener closed connection"),
            ShutdownCause::UpstreamClosed => write!(f, "upstream closed connection"),
            ShutdownCause::Errno(e) => write!(f, "{}", e),
            ShutdownCause::Codec(e) => write!(f, "{}", e),
        }
    }
}

/// Upper layer's event handler.
///
/// All three callbacks run on the loop thread and must not block.
pub trait Upstream {
    /// Bytes arrived. The slice borrows a kernel-provided buffer and is
    /// valid only for the duration of the call; copy whatever outlives
    /// it.
    fn received(&mut self, data: &[u8]);
    /// The most recent send or send_buffers fully drained.
    fn sent(&mut self);
    /// The fd is gone. Fires exactly once, with the latched cause.
    fn closed(&mut self, cause: ShutdownCause);
}

pub(crate) type RemovalHook = Box<dyn FnOnce()>;

struct ConnState {
    upstream: Option<Box<dyn Upstream>>,
    /// Whether bind() already started the receive loop.
    bound: bool,
    /// Write-once terminal cause; later shutdown calls are no-ops.
    shutdown_cause: Option<ShutdownCause>,
    /// Unregisters this connection from whichever parent owns it.
    removal: Option<RemovalHook>,
}

pub struct TcpConn {
    lp: Weak<LoopInner>,
    fd: RawFd,
    state: RefCell<ConnState>,
}

impl TcpConn {
    pub(crate) fn new(lp: Weak<LoopInner>, fd: RawFd, removal: RemovalHook) -> TcpConn {
        TcpConn {
            lp,
            fd,
            state: RefCell::new(ConnState {
                upstream: None,
                bound: false,
                shutdown_cause: None,
                removal: Some(removal),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Attach (or replace) the upstream handler. The first bind starts
    /// the receive loop; a rebind only swaps the handler pointer.
    pub fn bind(self: &Rc<Self>, upstream: Box<dyn Upstream>) {
        let start_recv = {
            let mut state = self.state.borrow_mut();
            let first = !state.bound;
            state.bound = true;
            state.upstream = Some(upstream);
            first
        };
        if start_recv {
            if let Some(lp) = self.lp.upgrade() {
                self.start_recv(&lp);
            }
        }
    }

    /// Send `data`, resuming automatically on partial completions.
    /// Exactly one `sent()` follows, unless the connection closes first.
    pub fn send(self: &Rc<Self>, data: Vec<u8>) {
        if let Some(lp) = self.lp.upgrade() {
            submit_send(&lp, self.clone(), data, 0);
        }
    }

    /// Vectored send of a buffer list, consuming slices from the front
    /// as partial writes complete.
    pub fn send_buffers(self: &Rc<Self>, buffers: Vec<Bytes>) {
        if let Some(lp) = self.lp.upgrade() {
            submit_writev(&lp, self.clone(), buffers);
        }
    }

    /// Ask for an orderly close; the upstream sees `closed` once the
    /// shutdown/close chain finishes.
    pub fn close(self: &Rc<Self>) {
        self.shutdown_with(ShutdownCause::UpstreamClosed);
    }

    pub(crate) fn shutdown_with(self: &Rc<Self>, cause: ShutdownCause) {
        if let Some(lp) = self.lp.upgrade() {
            self.shutdown(&lp, cause);
        }
    }

    fn start_recv(self: &Rc<Self>, lp: &Rc<LoopInner>) {
        let conn = self.clone();
        lp.prepare_recv(
            self.fd,
            Box::new(move |lp, res, flags, err| {
                if let Some(err) = err {
                    if err.is_temporary() {
                        debug!(fd = conn.fd, %err, "recv temporary error");
                        // re-arm unless the kernel kept the multishot alive
                        if !io_uring::cqueue::more(flags) {
                            conn.start_recv(lp);
                        }
                        return;
                    }
                    if !err.is_connection_reset() {
                        warn!(fd = conn.fd, %err, "recv error");
                    }
                    conn.shutdown(lp, ShutdownCause::Errno(err));
                    return;
                }
                if res == 0 {
                    conn.shutdown(lp, ShutdownCause::EndOfStream);
                    return;
                }
                let (ptr, len, buffer_id) = lp.buffers.borrow().get(res, flags);
                // Valid until released: the kernel will not reuse the
                // buffer before it is re-advertised.
                let data = unsafe { std::slice::from_raw_parts(ptr, len) };
                conn.with_upstream(|up| up.received(data));
                lp.buffers.borrow_mut().release(buffer_id);
                if !io_uring::cqueue::more(flags) {
                    // io_uring can terminate a multishot recv when the
                    // completion queue fills; restart it.
                    debug!(fd = conn.fd, flags, "multishot recv terminated, re-arming");
                    conn.start_recv(lp);
                }
            }),
        );
    }

    /// Shutdown both directions, then close the fd. Idempotent: only the
    /// first cause is latched and surfaced.
    pub(crate) fn shutdown(self: &Rc<Self>, lp: &Rc<LoopInner>, cause: ShutdownCause) {
        {
            let mut state = self.state.borrow_mut();
            if state.shutdown_cause.is_some() {
                return;
            }
            state.shutdown_cause = Some(cause);
        }
        let conn = self.clone();
        lp.prepare_shutdown(
            self.fd,
            Box::new(move |lp, res, flags, err| {
                // ENOTCONN and friends are benign here; the close still
                // has to run so the fd is returned.
                if let Some(err) = err {
                    if !err.is_connection_reset() {
                        debug!(fd = conn.fd, %err, res, flags, "shutdown");
                    }
                }
                let inner = conn.clone();
                lp.prepare_close(
                    conn.fd,
                    Box::new(move |_lp, _res, _flags, err| {
                        if let Some(err) = err {
                            debug!(fd = inner.fd, %err, "close");
                        }
                        inner.finish_close();
                    }),
                );
            }),
        );
    }

    /// Close completed: unregister from the parent, deliver the latched
    /// cause, and drop the upstream.
    fn finish_close(self: &Rc<Self>) {
        let (removal, cause) = {
            let mut state = self.state.borrow_mut();
            (
                state.removal.take(),
                state.shutdown_cause.take().unwrap_or(ShutdownCause::EndOfStream),
            )
        };
        if let Some(removal) = removal {
            removal();
        }
        let upstream = self.state.borrow_mut().upstream.take();
        if let Some(mut upstream) = upstream {
            upstream.closed(cause);
        }
    }

    /// Run `f` with the upstream checked out of the state cell, so the
    /// handler may re-enter the connection (send, rebind) without
    /// tripping the borrow.
    fn with_upstream(&self, f: impl FnOnce(&mut dyn Upstream)) {
        let upstream = self.state.borrow_mut().upstream.take();
        if let Some(mut upstream) = upstream {
            f(&mut *upstream);
            let mut state = self.state.borrow_mut();
            // a rebind during the call wins over the checked-out handler
            if state.upstream.is_none() {
                state.upstream = Some(upstream);
            }
        }
    }

    fn notify_sent(&self) {
        self.with_upstream(|up| up.sent());
    }
}

fn submit_send(lp: &Rc<LoopInner>, conn: Rc<TcpConn>, data: Vec<u8>, sent_so_far: usize) {
    let fd = conn.fd;
    // The callback owns `data`; its heap block stays put while the
    // kernel reads from it.
    let ptr = unsafe { data.as_ptr().add(sent_so_far) };
    let len = (data.len() - sent_so_far) as u32;
    lp.prepare_send(
        fd,
        ptr,
        len,
        Box::new(move |lp, res, _flags, err| {
            if let Some(err) = err {
                conn.shutdown(lp, ShutdownCause::Errno(err));
                return;
            }
            let sent_so_far = sent_so_far + res as usize;
            if sent_so_far >= data.len() {
                conn.notify_sent();
                return;
            }
            // partial send: re-issue for the remaining suffix
            submit_send(lp, conn, data, sent_so_far);
        }),
    );
}

fn submit_writev(lp: &Rc<LoopInner>, conn: Rc<TcpConn>, buffers: Vec<Bytes>) {
    let fd = conn.fd;
    let iovecs = build_iovecs(&buffers);
    let ptr = iovecs.as_ptr();
    let count = iovecs.len() as u32;
    lp.prepare_writev(
        fd,
        ptr,
        count,
        Box::new(move |lp, res, _flags, err| {
            // keep the iovec array alive for the submission's lifetime
            let _pinned = &iovecs;
            if let Some(err) = err {
                conn.shutdown(lp, ShutdownCause::Errno(err));
                return;
            }
            let mut buffers = buffers;
            consume_buffers(&mut buffers, res as usize);
            if buffers.is_empty() {
                conn.notify_sent();
                return;
            }
            submit_writev(lp, conn, buffers);
        }),
    );
}

fn build_iovecs(buffers: &[Bytes]) -> Box<[libc::iovec]> {
    buffers
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect()
}

/// Drop `n` written bytes from the front of the buffer list, advancing
/// into the first slice and removing fully consumed ones.
fn consume_buffers(buffers: &mut Vec<Bytes>, mut n: usize) {
    while let Some(first) = buffers.first_mut() {
        if first.len() > n {
            first.advance(n);
            return;
        }
        n -= first.len();
        buffers.remove(0);
    }
}
