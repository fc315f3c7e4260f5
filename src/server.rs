//! WebSocket server wiring over the completion loop
//!
//! [`serve`] starts a TCP listener whose accepted connections are first
//! bound to a small handshake upstream. Once the upgrade response has
//! been flushed, that upstream rebinds the connection to an
//! [`AsyncConn`] wrapping the application's session handler, without
//! restarting any I/O.

use std::io;
use std::rc::Rc;

use tracing::debug;

use crate::aio::{Loop, ShutdownCause, TcpConn, TcpListener, Upstream};
use crate::async_conn::AsyncConn;
use crate::error::Error;
use crate::handshake::Handshake;

/// Listen on `addr` and run a WebSocket session per connection.
///
/// `session_factory` is called with each accepted connection and returns
/// the handler that will observe the session's messages and lifecycle;
/// keep a clone of the connection in the handler to write back through
/// it.
pub fn serve<H, F>(lp: &Loop, addr: &str, mut session_factory: F) -> io::Result<Rc<TcpListener>>
where
    H: Upstream + 'static,
    F: FnMut(&Rc<TcpConn>) -> H + 'static,
{
    lp.listen(addr, move |_fd, conn| {
        let session = session_factory(conn);
        conn.bind(upgrade_upstream(conn.clone(), session));
    })
}

/// Build the upstream that performs the upgrade handshake on `conn` and
/// then rebinds it to a WebSocket connection driving `session`. Useful
/// with [`Loop::listen`] directly when [`serve`] is too rigid.
pub fn upgrade_upstream<H: Upstream + 'static>(conn: Rc<TcpConn>, session: H) -> Box<dyn Upstream> {
    Box::new(HandshakeUpstream {
        conn,
        request: Vec::new(),
        leftover: Vec::new(),
        handshake: None,
        session: Some(session),
    })
}

/// First upstream of an accepted connection: accumulates the upgrade
/// request, replies, and hands the connection over to the WebSocket
/// layer when the reply has drained. Frame bytes the peer pipelines
/// behind the request head are kept and replayed into the WebSocket
/// layer after the rebind.
struct HandshakeUpstream<H: Upstream> {
    conn: Rc<TcpConn>,
    request: Vec<u8>,
    /// Bytes past the request head, delivered to the WebSocket layer on
    /// rebind: pipelined frames from the same read, or data arriving
    /// before the upgrade response has drained.
    leftover: Vec<u8>,
    handshake: Option<Handshake>,
    session: Option<H>,
}

impl<H: Upstream + 'static> Upstream for HandshakeUpstream<H> {
    fn received(&mut self, data: &[u8]) {
        if self.handshake.is_some() {
            // frames raced ahead of the upgrade response
            self.leftover.extend_from_slice(data);
            return;
        }
        self.request.extend_from_slice(data);
        match Handshake::parse(&self.request) {
            Ok((handshake, consumed)) => {
                self.leftover = self.request.split_off(consumed);
                let response = handshake.response();
                self.handshake = Some(handshake);
                self.conn.send(response.into_bytes());
            }
            Err(Error::NeedMore(_)) => {} // request head still incomplete
            Err(e) => {
                debug!(fd = self.conn.fd(), %e, "handshake failed");
                self.conn.close();
            }
        }
    }

    fn sent(&mut self) {
        // upgrade response flushed: swap this layer for the websocket one
        let (Some(handshake), Some(session)) = (self.handshake.take(), self.session.take())
        else {
            return;
        };
        let mut ws = AsyncConn::new(
            self.conn.clone(),
            session,
            handshake.extension.permessage_deflate,
        );
        let leftover = std::mem::take(&mut self.leftover);
        if !leftover.is_empty() {
            ws.received(&leftover);
        }
        self.conn.bind(Box::new(ws));
    }

    fn closed(&mut self, cause: ShutdownCause) {
        // connection died before the upgrade finished; the session still
        // gets its exactly-once terminal callback
        if let Some(mut session) = self.session.take() {
            session.closed(cause);
        }
    }
}
