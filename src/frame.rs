//! WebSocket frame parsing and serialization
//!
//! Implements RFC 6455 framing:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Frames are decoded through a [`FrameSource`], which comes in two
//! flavors: a blocking source over a byte stream (used by the synchronous
//! connection) and a cursor over a finite slice that reports
//! [`Error::NeedMore`] when the next frame is only partially buffered
//! (used by the push-driven connection).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const FIN_MASK: u8 = 0b1000_0000;
const RSV1_MASK: u8 = 0b0100_0000;
const RSV2_MASK: u8 = 0b0010_0000;
const RSV3_MASK: u8 = 0b0001_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const MASK_MASK: u8 = 0b1000_0000;
const LEN_MASK: u8 = 0b0111_1111;

const DEFAULT_CLOSE_CODE: u16 = 1000;

/// WebSocket frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
    /// Sentinel for "no message started yet"
    None = 0xFF,
}

impl OpCode {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::ReservedOpcode),
        }
    }

    /// Close, Ping and Pong are control opcodes.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Position of a frame within a (possibly fragmented) message.
///
/// Derived purely from the FIN bit and whether the opcode is
/// `Continuation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    /// FIN set, non-continuation: a whole message in one frame
    Single,
    /// FIN clear, non-continuation: first fragment
    First,
    /// FIN clear, continuation: middle fragment
    Middle,
    /// FIN set, continuation: last fragment
    Last,
}

impl Fragment {
    /// Valid successor table for non-control frames.
    fn is_valid_continuation(self, prev: Fragment) -> bool {
        match prev {
            Fragment::Single | Fragment::Last => {
                matches!(self, Fragment::Single | Fragment::First)
            }
            Fragment::First | Fragment::Middle => {
                matches!(self, Fragment::Middle | Fragment::Last)
            }
        }
    }
}

/// A single decoded WebSocket frame, payload already unmasked.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1: payload is deflated (permessage-deflate)
    pub deflated: bool,
    /// Raw RSV2/RSV3 bits, kept for verification
    rsv23: u8,
    /// Frame opcode
    pub opcode: OpCode,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Build an outbound data or control frame (single fragment).
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            deflated: false,
            rsv23: 0,
            opcode,
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Whether this frame opens a message (it is not a continuation).
    #[inline]
    pub(crate) fn is_message_start(&self) -> bool {
        self.opcode != OpCode::Continuation
    }

    /// Fragment position derived from `(fin, opcode == Continuation)`.
    pub(crate) fn fragment(&self) -> Fragment {
        match (self.fin, self.opcode == OpCode::Continuation) {
            (true, false) => Fragment::Single,
            (true, true) => Fragment::Last,
            (false, false) => Fragment::First,
            (false, true) => Fragment::Middle,
        }
    }

    /// Close code carried in the first two payload bytes.
    ///
    /// Absent payload means the default 1000; a single stray byte is
    /// invalid and reported as 0 so that verification rejects it.
    pub fn close_code(&self) -> u16 {
        if self.opcode != OpCode::Close {
            return 0;
        }
        match self.payload.len() {
            0 => DEFAULT_CLOSE_CODE,
            1 => 0,
            _ => u16::from_be_bytes([self.payload[0], self.payload[1]]),
        }
    }

    fn close_reason(&self) -> &[u8] {
        if self.payload.len() > 2 {
            &self.payload[2..]
        } else {
            &[]
        }
    }

    /// Structural verification run after decode, before the frame is
    /// returned to any driver.
    fn verify(&self) -> Result<()> {
        if self.rsv23 != 0 {
            return Err(Error::ReservedRsv);
        }
        if !self.is_control() {
            return Ok(());
        }
        if self.payload.len() > 125 {
            return Err(Error::TooBigPayloadForControlFrame);
        }
        if !self.fin {
            return Err(Error::FragmentedControlFrame);
        }
        if self.opcode == OpCode::Close {
            self.verify_close()?;
        }
        Ok(())
    }

    fn verify_close(&self) -> Result<()> {
        if simdutf8::basic::from_utf8(self.close_reason()).is_err() {
            return Err(Error::InvalidUtf8Payload);
        }
        self.verify_close_code()
    }

    fn verify_close_code(&self) -> Result<()> {
        match self.close_code() {
            1000..=1003 | 1007..=1011 | 3000..=4999 => Ok(()),
            _ => Err(Error::InvalidCloseCode),
        }
    }

    /// RSV-bit check against the negotiated extensions.
    pub(crate) fn verify_rsv(&self, deflate_supported: bool) -> Result<()> {
        if self.deflated && !deflate_supported {
            return Err(Error::DeflateNotSupported);
        }
        if self.rsv23 != 0 {
            return Err(Error::ReservedRsv);
        }
        Ok(())
    }

    /// Encode into a `[header, payload]` pair so a vectored write can
    /// submit the frame without concatenation. Server frames are never
    /// masked.
    pub fn encode(&self) -> [Bytes; 2] {
        let len = self.payload.len();
        let ext = payload_len_bytes(len);
        let mut header = BytesMut::with_capacity(2 + ext);

        let mut first = self.opcode as u8;
        if self.fin {
            first |= FIN_MASK;
        }
        if self.deflated {
            first |= RSV1_MASK;
        }
        header.put_u8(first);

        match ext {
            0 => header.put_u8(len as u8),
            2 => {
                header.put_u8(126);
                header.put_u16(len as u16);
            }
            _ => {
                header.put_u8(127);
                header.put_u64(len as u64);
            }
        }
        [header.freeze(), self.payload.clone()]
    }
}

fn payload_len_bytes(len: usize) -> usize {
    if len < 126 {
        0
    } else if len < 65536 {
        2
    } else {
        8
    }
}

/// Cross-frame verification: continuation ordering and RSV bits.
pub(crate) fn verify_frame(
    frame: &Frame,
    prev_fragment: Fragment,
    deflate_supported: bool,
) -> Result<()> {
    if !frame.is_control() && !frame.fragment().is_valid_continuation(prev_fragment) {
        return Err(Error::InvalidFragmentation);
    }
    frame.verify_rsv(deflate_supported)
}

/// Message-level verification after reassembly: text must be valid UTF-8.
pub(crate) fn verify_message(opcode: OpCode, payload: &[u8]) -> Result<()> {
    if opcode == OpCode::Text && simdutf8::basic::from_utf8(payload).is_err() {
        return Err(Error::InvalidUtf8Payload);
    }
    Ok(())
}

/// Byte source the frame decoder pulls from.
///
/// `begin_frame` marks the start of a frame; a source that runs dry at
/// that mark reports a clean [`Error::Eof`], while running dry mid-frame
/// reports [`Error::UnexpectedEof`] (blocking source) or
/// [`Error::NeedMore`] (slice source).
pub(crate) trait FrameSource {
    fn begin_frame(&mut self);
    fn read_byte(&mut self) -> Result<u8>;
    fn read_exact(&mut self, out: &mut [u8]) -> Result<()>;
}

/// Cursor over a finite byte slice.
///
/// `pending()` exposes every byte from the start of the current frame to
/// the end of the slice, so a push-driven caller can carry a partial
/// frame over to the next delivery.
pub(crate) struct SliceSource<'a> {
    buf: &'a [u8],
    pos: usize,
    frame_start: usize,
}

impl<'a> SliceSource<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        SliceSource {
            buf,
            pos: 0,
            frame_start: 0,
        }
    }

    /// Unconsumed tail of the current partial frame.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf[self.frame_start..]
    }
}

impl FrameSource for SliceSource<'_> {
    fn begin_frame(&mut self) {
        self.frame_start = self.pos;
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            self.pos += 1;
            return Ok(b);
        }
        if self.pos == self.frame_start {
            Err(Error::Eof)
        } else {
            Err(Error::NeedMore(1))
        }
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let available = self.buf.len() - self.pos;
        if available < out.len() {
            return Err(Error::NeedMore(out.len() - available));
        }
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        Ok(())
    }
}

/// Decode one frame from the source.
///
/// Returns [`Error::Eof`] when the source is exhausted at a frame
/// boundary, [`Error::UnexpectedEof`] / [`Error::NeedMore`] when it runs
/// dry mid-frame, or any verification error.
pub(crate) fn parse_frame(src: &mut impl FrameSource) -> Result<Frame> {
    src.begin_frame();
    let first = src.read_byte()?;
    let second = src.read_byte()?;

    let fin = first & FIN_MASK != 0;
    let deflated = first & RSV1_MASK != 0;
    let rsv23 = first & (RSV2_MASK | RSV3_MASK);
    let opcode = OpCode::from_u8(first & OPCODE_MASK)?;
    let masked = second & MASK_MASK != 0;

    let mut payload_len = u64::from(second & LEN_MASK);
    match payload_len {
        126 => {
            let mut buf = [0u8; 2];
            src.read_exact(&mut buf)?;
            payload_len = u64::from(u16::from_be_bytes(buf));
        }
        127 => {
            let mut buf = [0u8; 8];
            src.read_exact(&mut buf)?;
            payload_len = u64::from_be_bytes(buf);
        }
        _ => {}
    }

    let mut mask = [0u8; 4];
    if masked {
        src.read_exact(&mut mask)?;
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        src.read_exact(&mut payload)?;
        if masked {
            unmask(&mut payload, mask);
        }
    }

    let frame = Frame {
        fin,
        deflated,
        rsv23,
        opcode,
        payload: Bytes::from(payload),
    };
    frame.verify()?;
    Ok(frame)
}

fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Incremental frame reader over a byte buffer.
///
/// [`FrameReader::read`] yields frames until the buffer runs out:
/// [`Error::Eof`] at a clean boundary, [`Error::NeedMore`] with the
/// exact shortfall when the buffer ends mid-frame.
pub struct FrameReader<'a> {
    src: SliceSource<'a>,
}

impl<'a> FrameReader<'a> {
    pub fn from_buffer(buf: &'a [u8]) -> Self {
        FrameReader {
            src: SliceSource::new(buf),
        }
    }

    pub fn read(&mut self) -> Result<Frame> {
        parse_frame(&mut self.src)
    }

    /// Bytes of the current partial frame, for carrying over to a retry.
    pub fn pending(&self) -> &[u8] {
        self.src.pending()
    }
}

/// Decode a single frame from a complete buffer.
pub fn frame_from_buffer(buf: &[u8]) -> Result<Frame> {
    let mut src = SliceSource::new(buf);
    parse_frame(&mut src)
}

#[cfg(test)]
pub(crate) mod test_frames {
    pub const HELLO: &[u8] = &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
    pub const MASKED_HELLO: &[u8] = &[
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];
    pub const PING: &[u8] = &[0x89, 0x00];
    pub const PONG: &[u8] = &[0x8a, 0x00];
    pub const CLOSE_1001: &[u8] = &[0x88, 0x02, 0x03, 0xe9];

    pub const FRAGMENT_1: &[u8] = &[0x01, 0x1, 0x48]; // first text frame "H"
    pub const FRAGMENT_2: &[u8] = &[0x00, 0x3, 0x65, 0x6c, 0x6c]; // middle "ell"
    pub const FRAGMENT_3: &[u8] = &[0x80, 0x2, 0x6f, 0x21]; // last "o!"

    pub fn fragmented_message() -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(FRAGMENT_1);
        msg.extend_from_slice(PING);
        msg.extend_from_slice(FRAGMENT_2);
        msg.extend_from_slice(PONG);
        msg.extend_from_slice(FRAGMENT_3);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    #[test]
    fn parse_text_frame() {
        let f = frame_from_buffer(HELLO).unwrap();
        assert!(f.fin);
        assert!(!f.deflated);
        assert_eq!(f.opcode, OpCode::Text);
        assert_eq!(f.payload.as_ref(), b"Hello");
        assert_eq!(f.close_code(), 0);
    }

    #[test]
    fn parse_masked_text_frame() {
        let f = frame_from_buffer(MASKED_HELLO).unwrap();
        assert!(f.fin);
        assert_eq!(f.opcode, OpCode::Text);
        assert_eq!(f.payload.as_ref(), b"Hello");
    }

    #[test]
    fn parse_control_frames() {
        let f = frame_from_buffer(PING).unwrap();
        assert_eq!(f.opcode, OpCode::Ping);
        assert!(f.fin);

        let f = frame_from_buffer(PONG).unwrap();
        assert_eq!(f.opcode, OpCode::Pong);

        let f = frame_from_buffer(CLOSE_1001).unwrap();
        assert_eq!(f.opcode, OpCode::Close);
        assert_eq!(f.payload.as_ref(), &[0x03, 0xe9]);
        assert_eq!(f.close_code(), 1001);
        assert!(f.verify_close_code().is_ok());
    }

    #[test]
    fn parse_medium_length() {
        let mut buf = vec![0x82, 126];
        buf.extend_from_slice(&200u16.to_be_bytes());
        buf.extend_from_slice(&[0x42; 200]);

        let f = frame_from_buffer(&buf).unwrap();
        assert_eq!(f.opcode, OpCode::Binary);
        assert_eq!(f.payload.len(), 200);
    }

    #[test]
    fn parse_fragmented_sequence() {
        let msg = fragmented_message();
        let mut rdr = FrameReader::from_buffer(&msg);

        let expected = [
            (OpCode::Text, false),
            (OpCode::Ping, true),
            (OpCode::Continuation, false),
            (OpCode::Pong, true),
            (OpCode::Continuation, true),
        ];

        let mut payload = Vec::new();
        for (opcode, fin) in expected {
            let f = rdr.read().unwrap();
            assert_eq!(f.opcode, opcode);
            assert_eq!(f.fin, fin);
            if !f.is_control() {
                payload.extend_from_slice(&f.payload);
            }
        }
        assert_eq!(payload, b"Hello!");

        assert!(matches!(rdr.read(), Err(Error::Eof)));
        assert!(matches!(rdr.read(), Err(Error::Eof)));
    }

    #[test]
    fn need_more() {
        // two header bytes present, four mask bytes missing
        let err = frame_from_buffer(&MASKED_HELLO[..2]).unwrap_err();
        assert!(matches!(err, Error::NeedMore(4)));

        // fragment1 + ping + 2 bytes of fragment2: third frame needs
        // three more payload bytes
        let msg = fragmented_message();
        let mut rdr = FrameReader::from_buffer(&msg[..7]);
        rdr.read().unwrap();
        rdr.read().unwrap();
        assert!(matches!(rdr.read(), Err(Error::NeedMore(3))));
    }

    #[test]
    fn fragmented_control_frame() {
        // Ping without FIN
        let err = frame_from_buffer(&[0x09, 0x00]).unwrap_err();
        assert!(matches!(err, Error::FragmentedControlFrame));
    }

    #[test]
    fn oversized_control_frame() {
        let mut buf = vec![0x89, 126];
        buf.extend_from_slice(&126u16.to_be_bytes());
        buf.extend_from_slice(&[0u8; 126]);
        let err = frame_from_buffer(&buf).unwrap_err();
        assert!(matches!(err, Error::TooBigPayloadForControlFrame));
    }

    #[test]
    fn reserved_bits_and_opcodes() {
        let err = frame_from_buffer(&[0xa1, 0x00]).unwrap_err(); // rsv2
        assert!(matches!(err, Error::ReservedRsv));
        let err = frame_from_buffer(&[0x83, 0x00]).unwrap_err(); // opcode 3
        assert!(matches!(err, Error::ReservedOpcode));
    }

    #[test]
    fn invalid_close_codes() {
        let err = frame_from_buffer(&[0x88, 0x02, 0x03, 0xed]).unwrap_err(); // 1005
        assert!(matches!(err, Error::InvalidCloseCode));
        let err = frame_from_buffer(&[0x88, 0x01, 0x03]).unwrap_err(); // one byte payload
        assert!(matches!(err, Error::InvalidCloseCode));
        // empty close payload defaults to 1000
        assert!(frame_from_buffer(&[0x88, 0x00]).is_ok());
    }

    #[test]
    fn close_reason_must_be_utf8() {
        let err = frame_from_buffer(&[0x88, 0x04, 0x03, 0xe8, 0xc3, 0x28]).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8Payload));
    }

    #[test]
    fn fragment_transitions() {
        let single = frame_from_buffer(HELLO).unwrap();
        let first = frame_from_buffer(FRAGMENT_1).unwrap();
        let middle = frame_from_buffer(FRAGMENT_2).unwrap();
        let last = frame_from_buffer(FRAGMENT_3).unwrap();

        assert_eq!(single.fragment(), Fragment::Single);
        assert_eq!(first.fragment(), Fragment::First);
        assert_eq!(middle.fragment(), Fragment::Middle);
        assert_eq!(last.fragment(), Fragment::Last);

        assert!(verify_frame(&single, Fragment::Single, false).is_ok());
        assert!(verify_frame(&first, Fragment::Last, false).is_ok());
        assert!(verify_frame(&middle, Fragment::First, false).is_ok());
        assert!(verify_frame(&last, Fragment::Middle, false).is_ok());

        // continuation with no message in progress
        assert!(matches!(
            verify_frame(&middle, Fragment::Single, false),
            Err(Error::InvalidFragmentation)
        ));
        // new message while another is in progress
        assert!(matches!(
            verify_frame(&single, Fragment::First, false),
            Err(Error::InvalidFragmentation)
        ));
        // control frames never advance fragmentation state
        let ping = frame_from_buffer(PING).unwrap();
        assert!(verify_frame(&ping, Fragment::First, false).is_ok());
    }

    #[test]
    fn rsv1_requires_deflate() {
        let compressed = Frame {
            fin: true,
            deflated: true,
            rsv23: 0,
            opcode: OpCode::Text,
            payload: Bytes::new(),
        };
        assert!(matches!(
            compressed.verify_rsv(false),
            Err(Error::DeflateNotSupported)
        ));
        assert!(compressed.verify_rsv(true).is_ok());
    }

    #[test]
    fn message_utf8() {
        assert!(verify_message(OpCode::Text, b"Hello").is_ok());
        assert!(matches!(
            verify_message(OpCode::Text, &[0xc3, 0x28]),
            Err(Error::InvalidUtf8Payload)
        ));
        assert!(verify_message(OpCode::Binary, &[0xc3, 0x28]).is_ok());
    }

    #[test]
    fn encode_round_trip() {
        for payload_len in [0usize, 5, 125, 126, 65535, 65536] {
            let frame = Frame::new(OpCode::Binary, vec![0x5a; payload_len]);
            let [header, payload] = frame.encode();
            let mut wire = header.to_vec();
            wire.extend_from_slice(&payload);

            let parsed = frame_from_buffer(&wire).unwrap();
            assert!(parsed.fin);
            assert_eq!(parsed.opcode, OpCode::Binary);
            assert_eq!(parsed.payload.len(), payload_len);
        }
    }

    #[test]
    fn encode_hello() {
        let frame = Frame::new(OpCode::Text, Bytes::from_static(b"Hello"));
        let [header, payload] = frame.encode();
        assert_eq!(header.as_ref(), &[0x81, 0x05]);
        assert_eq!(payload.as_ref(), b"Hello");
    }

    #[test]
    fn encode_deflated_sets_rsv1() {
        let mut frame = Frame::new(OpCode::Text, Bytes::from_static(b"x"));
        frame.deflated = true;
        let [header, _] = frame.encode();
        assert_eq!(header[0], 0x81 | 0x40);
    }
}
