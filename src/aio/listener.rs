//! TCP listener: multishot accept and child-connection ownership

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::conn::{ShutdownCause, TcpConn};
use super::LoopInner;

/// Called for every accepted connection so the application can attach an
/// upstream handler to the new [`TcpConn`].
pub(crate) type Binder = Box<dyn FnMut(RawFd, &Rc<TcpConn>)>;

/// A listening socket driven by a multishot accept.
///
/// The listener owns its accepted connections; each child holds a
/// removal hook (a weak back-reference) so it can unregister itself when
/// its close completes.
pub struct TcpListener {
    lp: Weak<LoopInner>,
    fd: RawFd,
    port: u16,
    binder: RefCell<Binder>,
    connections: RefCell<HashMap<RawFd, Rc<TcpConn>>>,
}

impl TcpListener {
    pub(crate) fn new(lp: Weak<LoopInner>, fd: RawFd, port: u16, binder: Binder) -> TcpListener {
        TcpListener {
            lp,
            fd,
            port,
            binder: RefCell::new(binder),
            connections: RefCell::new(HashMap::new()),
        }
    }

    /// Bound port; useful after listening on port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn conn_count(&self) -> usize {
        self.connections.borrow().len()
    }

    pub(crate) fn start_accept(self: &Rc<Self>, lp: &Rc<LoopInner>) {
        let ln = self.clone();
        lp.prepare_multishot_accept(
            self.fd,
            Box::new(move |lp, res, flags, err| {
                match err {
                    None => {
                        let fd = res as RawFd;
                        let ln_weak = Rc::downgrade(&ln);
                        let conn = Rc::new(TcpConn::new(
                            Rc::downgrade(lp),
                            fd,
                            Box::new(move || {
                                if let Some(ln) = ln_weak.upgrade() {
                                    ln.connections.borrow_mut().remove(&fd);
                                }
                            }),
                        ));
                        // The binder decides when to bind an upstream;
                        // receiving starts on that bind, not here.
                        (&mut *ln.binder.borrow_mut())(fd, &conn);
                        ln.connections.borrow_mut().insert(fd, conn);
                        if !io_uring::cqueue::more(flags) {
                            // multishot accept terminated by the kernel
                            // (full completion queue); restart it
                            debug!(fd = ln.fd, flags, "multishot accept terminated, re-arming");
                            ln.start_accept(lp);
                        }
                    }
                    Some(err) if err.is_temporary() => {
                        // the kernel may have terminated the multishot on
                        // a full completion queue; restart is required
                        debug!(fd = ln.fd, %err, "accept temporary error");
                        if !io_uring::cqueue::more(flags) {
                            ln.start_accept(lp);
                        }
                    }
                    Some(err) if err.is_canceled() => {
                        // listener is closing
                    }
                    Some(err) => {
                        debug!(fd = ln.fd, %err, res, flags, "accept");
                    }
                }
            }),
        );
    }

    /// Stop accepting. When `shutdown_connections` is set, every
    /// accepted child is shut down with the listener-closed cause once
    /// the cancel completes.
    pub fn close(self: &Rc<Self>, shutdown_connections: bool) {
        if let Some(lp) = self.lp.upgrade() {
            self.close_on(&lp, shutdown_connections);
        }
    }

    pub(crate) fn close_on(self: &Rc<Self>, lp: &Rc<LoopInner>, shutdown_connections: bool) {
        let ln = self.clone();
        lp.prepare_cancel_fd(
            self.fd,
            Box::new(move |lp, res, flags, err| {
                if let Some(err) = err {
                    debug!(fd = ln.fd, %err, res, flags, "listener cancel");
                }
                if shutdown_connections {
                    let children: Vec<_> = ln.connections.borrow().values().cloned().collect();
                    for child in children {
                        child.shutdown(lp, ShutdownCause::ListenerClosed);
                    }
                }
                lp.listeners.borrow_mut().remove(&ln.fd);
                unsafe { libc::close(ln.fd) };
            }),
        );
    }
}
