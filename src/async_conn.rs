//! Push-driven WebSocket connection
//!
//! [`AsyncConn`] sits between a byte transport (usually a
//! [`TcpConn`](crate::aio::TcpConn)) and a message handler. The
//! transport pushes raw chunks into [`Upstream::received`]; the
//! connection parses as many frames as the bytes allow, keeps partial
//! frame and partial message state across calls, answers control frames,
//! and emits fully defragmented messages upstream. Outbound frames flow
//! back down as `[header, payload]` buffer lists for vectored sends.

use std::rc::Rc;

use bytes::Bytes;

use crate::aio::{ShutdownCause, TcpConn, Upstream};
use crate::conn::encode_message_frame;
use crate::deflate;
use crate::error::{Error, Result};
use crate::frame::{
    parse_frame, verify_frame, verify_message, Fragment, Frame, OpCode, SliceSource,
};

/// Downstream transport the connection writes to.
///
/// Implemented by [`TcpConn`]; tests substitute an in-memory sink.
pub trait FrameSink {
    /// Queue an encoded frame, delivered as a buffer list so a vectored
    /// write can send it without concatenation.
    fn send(&mut self, buffers: Vec<Bytes>);
    /// Give up on the transport because of `cause`.
    fn close(&mut self, cause: Error);
}

impl FrameSink for Rc<TcpConn> {
    fn send(&mut self, buffers: Vec<Bytes>) {
        TcpConn::send_buffers(self, buffers);
    }

    fn close(&mut self, cause: Error) {
        self.shutdown_with(ShutdownCause::Codec(cause));
    }
}

/// Partial-frame parsing state carried between `received` calls.
#[derive(Default)]
struct FrameState {
    /// Bytes of an incomplete frame, from its first header byte on.
    pending: Vec<u8>,
    /// How many more bytes parsing needs before trying again.
    recv_more: usize,
}

/// Fragmented-message reassembly state.
struct MessageState {
    payload: Vec<u8>,
    opcode: OpCode,
    compressed: bool,
    prev_fragment: Fragment,
}

impl Default for MessageState {
    fn default() -> Self {
        MessageState {
            payload: Vec::new(),
            opcode: OpCode::None,
            compressed: false,
            prev_fragment: Fragment::Single,
        }
    }
}

/// Buffer-driven WebSocket connection: bind it as the upstream of a
/// `TcpConn` (or feed it chunks directly in tests).
pub struct AsyncConn<S: FrameSink, H: Upstream> {
    sink: S,
    handler: H,
    permessage_deflate: bool,
    fs: FrameState,
    ms: MessageState,
}

impl<S: FrameSink, H: Upstream> AsyncConn<S, H> {
    pub fn new(sink: S, handler: H, permessage_deflate: bool) -> Self {
        AsyncConn {
            sink,
            handler,
            permessage_deflate,
            fs: FrameState::default(),
            ms: MessageState::default(),
        }
    }

    /// Send one message to the peer, compressing when negotiated.
    pub fn write(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let frame = encode_message_frame(opcode, payload, self.permessage_deflate)?;
        self.sink.send(frame.encode().to_vec());
        Ok(())
    }

    fn read_frames(&mut self, buf: &[u8]) -> Result<()> {
        let mut src = SliceSource::new(buf);
        loop {
            let frame = match parse_frame(&mut src) {
                Ok(frame) => frame,
                // everything in the buffer consumed cleanly
                Err(Error::Eof) => return Ok(()),
                Err(Error::NeedMore(n)) => {
                    // carry the unparsed tail over to the next delivery
                    self.fs.pending = src.pending().to_vec();
                    self.fs.recv_more = n;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.fs.recv_more = 0;

            if frame.is_control() {
                self.handle_control(&frame);
                continue;
            }
            verify_frame(&frame, self.ms.prev_fragment, self.permessage_deflate)?;

            if frame.is_message_start() {
                self.ms.compressed = frame.deflated;
                self.ms.opcode = frame.opcode;
                self.ms.payload = frame.payload.to_vec();
            } else {
                self.ms.payload.extend_from_slice(&frame.payload);
            }

            if frame.fin {
                let mut payload = std::mem::take(&mut self.ms.payload);
                if self.ms.compressed {
                    payload = deflate::decompress(&payload)?;
                }
                verify_message(self.ms.opcode, &payload)?;
                self.handler.received(&payload);
                self.ms = MessageState::default();
                continue;
            }
            self.ms.prev_fragment = frame.fragment();
        }
    }

    fn handle_control(&mut self, frame: &Frame) {
        match frame.opcode {
            // the ping payload was copied out of the provided buffer at
            // parse time, so echoing it back is safe
            OpCode::Ping => self.send_control(OpCode::Pong, frame.payload.clone()),
            OpCode::Pong => {}
            _ => self.send_control(OpCode::Close, frame.payload.clone()),
        }
    }

    fn send_control(&mut self, opcode: OpCode, payload: Bytes) {
        let frame = Frame::new(opcode, payload);
        self.sink.send(frame.encode().to_vec());
    }
}

impl<S: FrameSink, H: Upstream> Upstream for AsyncConn<S, H> {
    fn received(&mut self, buf: &[u8]) {
        // not even enough for the known shortfall: stash and wait
        if buf.len() < self.fs.recv_more {
            self.fs.pending.extend_from_slice(buf);
            self.fs.recv_more -= buf.len();
            return;
        }

        let result = if self.fs.pending.is_empty() {
            self.read_frames(buf)
        } else {
            let mut combined = std::mem::take(&mut self.fs.pending);
            self.fs.recv_more = 0;
            combined.extend_from_slice(buf);
            self.read_frames(&combined)
        };
        if let Err(e) = result {
            self.sink.close(e);
        }
    }

    fn sent(&mut self) {
        self.handler.sent();
    }

    fn closed(&mut self, cause: ShutdownCause) {
        self.handler.closed(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frames::*;

    #[derive(Default)]
    struct TestHandler {
        received: Vec<Vec<u8>>,
        sent_count: usize,
        closed: Vec<ShutdownCause>,
    }

    impl Upstream for TestHandler {
        fn received(&mut self, data: &[u8]) {
            self.received.push(data.to_vec());
        }

        fn sent(&mut self) {
            self.sent_count += 1;
        }

        fn closed(&mut self, cause: ShutdownCause) {
            self.closed.push(cause);
        }
    }

    #[derive(Default)]
    struct TestSink {
        sent: Vec<Vec<u8>>,
        close_causes: Vec<Error>,
    }

    impl FrameSink for TestSink {
        fn send(&mut self, buffers: Vec<Bytes>) {
            self.sent.push(buffers.concat());
        }

        fn close(&mut self, cause: Error) {
            self.close_causes.push(cause);
        }
    }

    fn conn() -> AsyncConn<TestSink, TestHandler> {
        AsyncConn::new(TestSink::default(), TestHandler::default(), false)
    }

    #[test]
    fn parse_message_across_deliveries() {
        let mut c = conn();

        c.received(HELLO);
        assert_eq!(c.handler.received.len(), 1);
        assert_eq!(c.handler.received[0], b"Hello");

        // part of the masked frame: nothing emitted, state latched
        c.received(&MASKED_HELLO[..7]);
        assert_eq!(c.handler.received.len(), 1);
        assert!(c.sink.close_causes.is_empty());
        assert!(c.ms.payload.is_empty());
        assert_eq!(c.ms.opcode, OpCode::None);
        assert_eq!(c.fs.pending.len(), 7);
        assert_eq!(c.fs.recv_more, 4);

        // two more bytes, still short
        c.received(&MASKED_HELLO[7..9]);
        assert_eq!(c.fs.pending.len(), 9);
        assert_eq!(c.fs.recv_more, 2);

        // the rest completes the frame
        c.received(&MASKED_HELLO[9..]);
        assert_eq!(c.handler.received.len(), 2);
        assert_eq!(c.handler.received[1], b"Hello");
    }

    #[test]
    fn parse_fragmented_message() {
        let mut c = conn();

        c.received(&FRAGMENT_1[..2]);
        assert_eq!(c.fs.pending.len(), 2);
        c.received(&FRAGMENT_1[2..]);
        assert_eq!(c.ms.payload.len(), 1);
        assert_eq!(c.ms.opcode, OpCode::Text);
        assert_eq!(c.ms.prev_fragment, Fragment::First);

        c.received(&PING[..1]);
        assert_eq!(c.fs.pending.len(), 1);
        c.received(&PING[1..]);

        c.received(&FRAGMENT_2[..3]);
        assert_eq!(c.fs.pending.len(), 3);
        c.received(&FRAGMENT_2[3..]);
        assert_eq!(c.ms.payload.len(), 4);

        c.received(&PONG[..1]);
        assert_eq!(c.fs.pending.len(), 1);
        c.received(&PONG[1..]);

        c.received(&FRAGMENT_3[..1]);
        assert_eq!(c.fs.pending.len(), 1);
        c.received(&FRAGMENT_3[1..]);

        assert_eq!(c.handler.received.len(), 1);
        assert_eq!(c.handler.received[0], b"Hello!");

        // exactly one pong went out in response to the ping
        assert_eq!(c.sink.sent.len(), 1);
        assert_eq!(c.sink.sent[0], PONG);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut c = conn();
        for i in 0..MASKED_HELLO.len() {
            c.received(&MASKED_HELLO[i..i + 1]);
            let expected = usize::from(i == MASKED_HELLO.len() - 1);
            assert_eq!(c.handler.received.len(), expected);
        }
        assert_eq!(c.handler.received[0], b"Hello");
    }

    #[test]
    fn any_split_yields_same_messages() {
        let mut wire = fragmented_message();
        wire.extend_from_slice(MASKED_HELLO);

        for k in 0..=wire.len() {
            let mut c = conn();
            c.received(&wire[..k]);
            c.received(&wire[k..]);
            assert_eq!(c.handler.received.len(), 2, "split at {}", k);
            assert_eq!(c.handler.received[0], b"Hello!");
            assert_eq!(c.handler.received[1], b"Hello");
            assert!(c.sink.close_causes.is_empty());
        }
    }

    #[test]
    fn close_frame_is_echoed() {
        let mut c = conn();
        c.received(CLOSE_1001);
        assert_eq!(c.sink.sent.len(), 1);
        assert_eq!(c.sink.sent[0], CLOSE_1001);
    }

    #[test]
    fn invalid_fragmentation_closes_transport() {
        let mut c = conn();
        c.received(FRAGMENT_2); // continuation with no message started
        assert_eq!(c.sink.close_causes.len(), 1);
        assert!(matches!(
            c.sink.close_causes[0],
            Error::InvalidFragmentation
        ));
        assert!(c.handler.received.is_empty());
    }

    #[test]
    fn invalid_utf8_message_closes_transport() {
        let mut c = conn();
        c.received(&[0x81, 0x02, 0xc3, 0x28]);
        assert_eq!(c.sink.close_causes.len(), 1);
        assert!(matches!(
            c.sink.close_causes[0],
            Error::InvalidUtf8Payload
        ));
    }

    #[test]
    fn compressed_message_is_inflated() {
        let mut c = AsyncConn::new(TestSink::default(), TestHandler::default(), true);
        // FIN + RSV1 + Text with the RFC 7692 sample payload
        c.received(&[0xc1, 0x07, 0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00]);
        assert_eq!(c.handler.received.len(), 1);
        assert_eq!(c.handler.received[0], b"Hello");
    }

    #[test]
    fn write_encodes_frame() {
        let mut c = conn();
        c.write(OpCode::Text, b"Hello").unwrap();
        assert_eq!(c.sink.sent.len(), 1);
        assert_eq!(c.sink.sent[0], HELLO);
    }

    #[test]
    fn lifecycle_events_forwarded() {
        let mut c = conn();
        c.sent();
        assert_eq!(c.handler.sent_count, 1);
        c.closed(ShutdownCause::EndOfStream);
        assert_eq!(c.handler.closed.len(), 1);
        assert!(c.handler.closed[0].is_normal());
    }
}
