//! Completion-driven I/O loop over io_uring
//!
//! The [`Loop`] owns a submission/completion queue pair, a registry of
//! per-operation callbacks keyed by `user_data`, and a provided-buffer
//! ring for multishot receives. All exposed operations are
//! fire-and-callback: preparing never blocks (a full submission queue
//! parks the entry in a pending list) and the only suspension point is
//! the submit-and-wait syscall.
//!
//! The loop is single threaded: every callback runs on the loop thread,
//! serialized, so neither the loop nor the connections take locks.
//! Callbacks must not block; follow-on work is scheduled with another
//! `prepare_*` call.

mod addr;
mod buffers;
mod conn;
mod listener;

pub use conn::{ShutdownCause, TcpConn, Upstream};
pub use listener::TcpListener;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use tracing::debug;

use buffers::{ProvidedBuffers, BUFFERS_GROUP_ID};

const COMPLETION_BATCH: usize = 128;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(333);

/// Errno carried by a completion, classified the way the loop's retry
/// and shutdown logic needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Synthesize an errno from a completion result. Results in
    /// `[-4095, -1]` are negated errnos; everything else is success.
    fn from_cqe_res(res: i32) -> Option<Errno> {
        if (-4095..0).contains(&res) {
            Some(Errno(-res))
        } else {
            None
        }
    }

    /// Retryable without surfacing to the caller.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.0,
            libc::EINTR | libc::EMFILE | libc::ENFILE | libc::ENOBUFS
        ) || self.is_timeout()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.0,
            libc::EAGAIN | libc::EWOULDBLOCK | libc::ETIMEDOUT | libc::ETIME
        )
    }

    pub fn is_canceled(&self) -> bool {
        self.0 == libc::ECANCELED
    }

    pub fn is_connection_reset(&self) -> bool {
        matches!(self.0, libc::ECONNRESET | libc::ENOTCONN)
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

fn temporary_io_error(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(raw) => Errno(raw).is_temporary(),
        None => matches!(
            e.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ),
    }
}

/// Cooperative cancellation handle polled by [`Loop::run`].
///
/// Clones share one flag, so a copy can be handed to a signal handler or
/// another thread while the loop polls the original.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Loop configuration.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Submission queue depth
    pub ring_entries: u32,
    /// Number of provided receive buffers (power of two)
    pub recv_buffers_count: u32,
    /// Size of each provided receive buffer in bytes
    pub recv_buffer_len: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ring_entries: 1024,
            recv_buffers_count: 256,
            recv_buffer_len: 4 * 1024,
        }
    }
}

pub(crate) type OnceCb = Box<dyn FnOnce(&Rc<LoopInner>, i32, u32, Option<Errno>)>;
pub(crate) type MultiCb = Box<dyn FnMut(&Rc<LoopInner>, i32, u32, Option<Errno>)>;

pub(crate) enum Callback {
    /// Removed from the registry on first completion.
    Once(OnceCb),
    /// Kept registered while completions carry the MORE flag.
    Multi(MultiCb),
}

/// `user_data → callback` registry. Keys below 65 536 are reserved for
/// system use; the counter starts right above them.
struct Callbacks {
    map: HashMap<u64, Callback>,
    next: u64,
}

impl Callbacks {
    fn new() -> Self {
        Callbacks {
            map: HashMap::new(),
            next: u64::from(u16::MAX),
        }
    }

    fn register(&mut self, cb: Callback) -> u64 {
        self.next += 1;
        self.map.insert(self.next, cb);
        self.next
    }

    fn take(&mut self, key: u64) -> Option<Callback> {
        self.map.remove(&key)
    }

    fn restore(&mut self, key: u64, cb: Callback) {
        self.map.insert(key, cb);
    }

    fn count(&self) -> usize {
        self.map.len()
    }
}

pub(crate) struct LoopInner {
    ring: RefCell<IoUring>,
    callbacks: RefCell<Callbacks>,
    pub(crate) buffers: RefCell<ProvidedBuffers>,
    /// Prepared submissions that did not fit into the submission queue,
    /// re-attempted in FIFO order before every wait.
    pending: RefCell<VecDeque<squeue::Entry>>,
    pub(crate) listeners: RefCell<HashMap<RawFd, Rc<TcpListener>>>,
    /// Directly dialed connections; a listener owns its accepted children.
    pub(crate) connections: RefCell<HashMap<RawFd, Rc<TcpConn>>>,
}

/// The event loop. See the module docs for the execution model.
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl Loop {
    pub fn new(options: Options) -> io::Result<Loop> {
        let ring = IoUring::new(options.ring_entries)?;
        let buffers =
            ProvidedBuffers::new(options.recv_buffers_count, options.recv_buffer_len)?;
        unsafe {
            ring.submitter().register_buf_ring_with_flags(
                buffers.ring_addr(),
                buffers.ring_entries(),
                BUFFERS_GROUP_ID,
                0,
            )?;
        }
        Ok(Loop {
            inner: Rc::new(LoopInner {
                ring: RefCell::new(ring),
                callbacks: RefCell::new(Callbacks::new()),
                buffers: RefCell::new(buffers),
                pending: RefCell::new(VecDeque::new()),
                listeners: RefCell::new(HashMap::new()),
                connections: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Start a listener on `addr` (`"127.0.0.1:8080"`, `"[::1]:80"`).
    ///
    /// `binder` runs for every accepted connection; it connects the new
    /// [`TcpConn`] with an upstream handler by calling
    /// [`TcpConn::bind`], immediately or later.
    pub fn listen(
        &self,
        addr: &str,
        binder: impl FnMut(RawFd, &Rc<TcpConn>) + 'static,
    ) -> io::Result<Rc<TcpListener>> {
        let resolved = addr::resolve(addr)?;
        let (fd, port) = addr::listen(&resolved)?;
        let ln = Rc::new(TcpListener::new(
            Rc::downgrade(&self.inner),
            fd,
            port,
            Box::new(binder),
        ));
        self.inner.listeners.borrow_mut().insert(fd, ln.clone());
        ln.start_accept(&self.inner);
        Ok(ln)
    }

    /// Dial a TCP connection. `dialed` fires once the socket-create and
    /// connect chain completes; on success the caller binds an upstream
    /// to the returned connection.
    pub fn dial(
        &self,
        addr: &str,
        dialed: impl FnOnce(Result<Rc<TcpConn>, Errno>) + 'static,
    ) -> io::Result<()> {
        let resolved = addr::resolve(addr)?;
        // Box keeps the sockaddr at a stable address until the connect
        // submission completes.
        let storage = Box::new(resolved.storage);
        let addr_len = resolved.len;

        self.inner.prepare_stream_socket(
            resolved.domain,
            Box::new(move |lp, res, _flags, err| {
                if let Some(e) = err {
                    dialed(Err(e));
                    return;
                }
                let fd = res as RawFd;
                let addr_ptr = (&*storage) as *const libc::sockaddr_storage as *const libc::sockaddr;
                let lp_weak = Rc::downgrade(lp);
                lp.prepare_connect(
                    fd,
                    addr_ptr,
                    addr_len,
                    Box::new(move |lp, _res, _flags, err| {
                        let _pinned = &storage;
                        if let Some(e) = err {
                            dialed(Err(e));
                            return;
                        }
                        let removal_weak = lp_weak.clone();
                        let conn = Rc::new(TcpConn::new(
                            lp_weak,
                            fd,
                            Box::new(move || {
                                if let Some(lp) = removal_weak.upgrade() {
                                    lp.connections.borrow_mut().remove(&fd);
                                }
                            }),
                        ));
                        lp.connections.borrow_mut().insert(fd, conn.clone());
                        dialed(Ok(conn));
                    }),
                );
            }),
        );
        Ok(())
    }

    /// Submit prepared operations and wait for at least one completion,
    /// then drain everything that is ready.
    pub fn run_once(&self) -> io::Result<()> {
        self.inner.submit_and_wait(1)?;
        self.inner.flush_completions();
        Ok(())
    }

    /// Run until every registered operation has completed.
    ///
    /// Panics if the callback registry drains while listeners or
    /// connections still exist; that is a programming error in the
    /// shutdown sequence.
    pub fn run_until_done(&self) -> io::Result<()> {
        loop {
            if self.inner.callbacks.borrow().count() == 0 {
                if !self.inner.connections.borrow().is_empty()
                    || !self.inner.listeners.borrow().is_empty()
                {
                    panic!("unclean shutdown");
                }
                return Ok(());
            }
            self.run_once()?;
        }
    }

    /// Run until `token` is cancelled, checking it every `poll_interval`.
    pub fn run_with_cancellation(
        &self,
        token: &CancelToken,
        poll_interval: Duration,
    ) -> io::Result<()> {
        let ts = types::Timespec::new()
            .sec(poll_interval.as_secs())
            .nsec(poll_interval.subsec_nanos());
        loop {
            self.inner.submit()?;
            {
                let ring = self.inner.ring.borrow_mut();
                let args = types::SubmitArgs::new().timespec(&ts);
                match ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => {}
                    Err(e) if temporary_io_error(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            self.inner.flush_completions();
            if token.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// Run until `token` is cancelled, then perform a clean shutdown:
    /// close remaining listeners (shutting down their accepted
    /// connections) and directly dialed connections, and drain the loop
    /// until every operation has finished.
    pub fn run(&self, token: &CancelToken) -> io::Result<()> {
        self.run_with_cancellation(token, CANCEL_POLL_INTERVAL)?;
        self.inner.close_pending_connections();
        self.run_until_done()
    }
}

impl LoopInner {
    /// Register the callback and queue the submission. If no slot is
    /// free, submit accumulated entries and retry; if the queue is still
    /// full, park the entry in `pending`.
    fn prepare(self: &Rc<Self>, entry: squeue::Entry, cb: Callback) {
        let key = self.callbacks.borrow_mut().register(cb);
        let entry = entry.user_data(key);
        if self.try_push(&entry) {
            return;
        }
        let _ = self.submit();
        if self.try_push(&entry) {
            return;
        }
        self.pending.borrow_mut().push_back(entry);
    }

    fn try_push(&self, entry: &squeue::Entry) -> bool {
        let mut ring = self.ring.borrow_mut();
        let result = unsafe { ring.submission().push(entry).is_ok() };
        result
    }

    fn submit(&self) -> io::Result<()> {
        self.submit_and_wait(0)
    }

    /// Submit and wait, retrying temporary errors unconditionally.
    /// Anything else is fatal and bubbles to the caller.
    fn submit_and_wait(&self, want: u32) -> io::Result<()> {
        loop {
            if !self.pending.borrow().is_empty() {
                let submitted = self.ring.borrow_mut().submit();
                if submitted.is_ok() {
                    self.drain_pending();
                }
            }
            let res = self.ring.borrow_mut().submit_and_wait(want as usize);
            match res {
                Ok(_) => return Ok(()),
                Err(e) if temporary_io_error(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn drain_pending(&self) {
        let mut pending = self.pending.borrow_mut();
        let mut ring = self.ring.borrow_mut();
        let mut sq = ring.submission();
        while let Some(entry) = pending.front() {
            if unsafe { sq.push(entry) }.is_err() {
                return;
            }
            pending.pop_front();
        }
    }

    /// Drain ready completions in batches and dispatch their callbacks.
    fn flush_completions(self: &Rc<Self>) -> u32 {
        let mut completed = 0u32;
        let mut batch: Vec<(u64, i32, u32)> = Vec::with_capacity(COMPLETION_BATCH);
        loop {
            batch.clear();
            {
                let mut ring = self.ring.borrow_mut();
                let mut cq = ring.completion();
                while batch.len() < COMPLETION_BATCH {
                    match cq.next() {
                        Some(cqe) => {
                            batch.push((cqe.user_data(), cqe.result(), cqe.flags()))
                        }
                        None => break,
                    }
                }
            }
            for &(user_data, res, flags) in batch.iter() {
                self.complete(user_data, res, flags);
            }
            completed += batch.len() as u32;
            if batch.len() < COMPLETION_BATCH {
                return completed;
            }
        }
    }

    fn complete(self: &Rc<Self>, user_data: u64, res: i32, flags: u32) {
        let err = Errno::from_cqe_res(res);
        if user_data == 0 {
            debug!(res, flags, "completion without user data");
            return;
        }
        // bind before matching so the registry borrow ends before the
        // callback runs (callbacks prepare follow-up operations)
        let cb = self.callbacks.borrow_mut().take(user_data);
        match cb {
            None => debug!(user_data, res, flags, "completion without callback"),
            Some(Callback::Once(cb)) => cb(self, res, flags, err),
            Some(Callback::Multi(mut cb)) => {
                cb(self, res, flags, err);
                if cqueue::more(flags) {
                    self.callbacks
                        .borrow_mut()
                        .restore(user_data, Callback::Multi(cb));
                }
            }
        }
    }

    fn close_pending_connections(self: &Rc<Self>) {
        let listeners: Vec<_> = self.listeners.borrow().values().cloned().collect();
        for ln in listeners {
            ln.close_on(self, true);
        }
        let connections: Vec<_> = self.connections.borrow().values().cloned().collect();
        for conn in connections {
            conn.shutdown(self, ShutdownCause::UpstreamClosed);
        }
    }

    // One preparer per exposed kernel operation. Buffers referenced by
    // an entry are owned by the registered callback, which keeps their
    // memory stable until the completion fires.

    pub(crate) fn prepare_multishot_accept(self: &Rc<Self>, fd: RawFd, cb: MultiCb) {
        let entry = opcode::AcceptMulti::new(types::Fd(fd)).build();
        self.prepare(entry, Callback::Multi(cb));
    }

    pub(crate) fn prepare_cancel_fd(self: &Rc<Self>, fd: RawFd, cb: OnceCb) {
        let entry =
            opcode::AsyncCancel2::new(types::CancelBuilder::fd(types::Fd(fd)).all()).build();
        self.prepare(entry, Callback::Once(cb));
    }

    pub(crate) fn prepare_shutdown(self: &Rc<Self>, fd: RawFd, cb: OnceCb) {
        let entry = opcode::Shutdown::new(types::Fd(fd), libc::SHUT_RDWR).build();
        self.prepare(entry, Callback::Once(cb));
    }

    pub(crate) fn prepare_close(self: &Rc<Self>, fd: RawFd, cb: OnceCb) {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        self.prepare(entry, Callback::Once(cb));
    }

    pub(crate) fn prepare_send(self: &Rc<Self>, fd: RawFd, ptr: *const u8, len: u32, cb: OnceCb) {
        let entry = opcode::Send::new(types::Fd(fd), ptr, len).build();
        self.prepare(entry, Callback::Once(cb));
    }

    pub(crate) fn prepare_writev(
        self: &Rc<Self>,
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
        cb: OnceCb,
    ) {
        let entry = opcode::Writev::new(types::Fd(fd), iovecs, count).build();
        self.prepare(entry, Callback::Once(cb));
    }

    /// Multishot receive selecting from provided-buffer group 0.
    pub(crate) fn prepare_recv(self: &Rc<Self>, fd: RawFd, cb: MultiCb) {
        let entry = opcode::RecvMulti::new(types::Fd(fd), BUFFERS_GROUP_ID).build();
        self.prepare(entry, Callback::Multi(cb));
    }

    pub(crate) fn prepare_connect(
        self: &Rc<Self>,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
        cb: OnceCb,
    ) {
        let entry = opcode::Connect::new(types::Fd(fd), addr, addr_len).build();
        self.prepare(entry, Callback::Once(cb));
    }

    pub(crate) fn prepare_stream_socket(self: &Rc<Self>, domain: i32, cb: OnceCb) {
        let entry = opcode::Socket::new(domain, libc::SOCK_STREAM, 0).build();
        self.prepare(entry, Callback::Once(cb));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert!(Errno(libc::EINTR).is_temporary());
        assert!(Errno(libc::EMFILE).is_temporary());
        assert!(Errno(libc::ENFILE).is_temporary());
        assert!(Errno(libc::ENOBUFS).is_temporary());
        assert!(Errno(libc::EAGAIN).is_temporary());
        assert!(Errno(libc::ETIME).is_timeout());
        assert!(Errno(libc::ETIMEDOUT).is_timeout());
        assert!(!Errno(libc::ECONNREFUSED).is_temporary());

        assert!(Errno(libc::ECANCELED).is_canceled());
        assert!(Errno(libc::ECONNRESET).is_connection_reset());
        assert!(Errno(libc::ENOTCONN).is_connection_reset());
    }

    #[test]
    fn cqe_res_to_errno() {
        assert_eq!(Errno::from_cqe_res(-libc::EAGAIN), Some(Errno(libc::EAGAIN)));
        assert_eq!(Errno::from_cqe_res(0), None);
        assert_eq!(Errno::from_cqe_res(17), None);
        assert_eq!(Errno::from_cqe_res(-4096), None);
    }

    #[test]
    fn callback_keys_reserved_above_u16() {
        let mut callbacks = Callbacks::new();
        let key = callbacks.register(Callback::Once(Box::new(|_, _, _, _| {})));
        assert!(key > u64::from(u16::MAX));
        assert_eq!(callbacks.count(), 1);
        assert!(callbacks.take(key).is_some());
        assert_eq!(callbacks.count(), 0);
    }

    #[test]
    fn cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
