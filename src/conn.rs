//! Synchronous WebSocket connection over a blocking byte stream
//!
//! [`Conn`] drives one connection with blocking reads and writes:
//! control frames are answered inline, fragmented messages are
//! reassembled, compressed messages are inflated, and an idle read
//! deadline triggers a Ping instead of giving up. Any I/O or protocol
//! error closes the underlying stream and surfaces to the caller.

use std::io::{self, IoSlice, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::Bytes;

use crate::deflate;
use crate::error::{Error, Result};
use crate::frame::{
    parse_frame, verify_frame, verify_message, Fragment, Frame, FrameSource, OpCode,
};
use crate::handshake::Handshake;

/// Renewed before every stream-level read.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Renewed before every write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const READ_BUFFER_LEN: usize = 4096;

/// Blocking byte stream with deadline control, as [`Conn`] needs it.
/// Implemented for [`TcpStream`]; test doubles can no-op the deadline
/// and shutdown calls.
pub trait NetStream: Read + Write {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
    /// Tear the transport down; errors are not interesting at this point.
    fn shutdown(&mut self);
}

impl NetStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

/// Read-side buffer for the blocking frame source.
#[derive(Debug)]
struct ReadBuffer {
    data: Vec<u8>,
    pos: usize,
    filled: usize,
    /// Set once the current frame consumed its first byte; decides
    /// between a clean EOF and an unexpected one, and whether an idle
    /// deadline may be answered with a Ping.
    frame_started: bool,
}

impl ReadBuffer {
    fn new(leftover: &[u8]) -> ReadBuffer {
        let mut data = vec![0u8; READ_BUFFER_LEN.max(leftover.len())];
        data[..leftover.len()].copy_from_slice(leftover);
        ReadBuffer {
            data,
            pos: 0,
            filled: leftover.len(),
            frame_started: false,
        }
    }
}

struct StreamSource<'a, S: NetStream> {
    stream: &'a mut S,
    buf: &'a mut ReadBuffer,
}

impl<S: NetStream> StreamSource<'_, S> {
    /// Refill the buffer, renewing the read deadline first.
    fn refill(&mut self) -> Result<()> {
        self.stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(Error::Io)?;
        let n = self.stream.read(&mut self.buf.data).map_err(Error::Io)?;
        if n == 0 {
            return if self.buf.frame_started {
                Err(Error::UnexpectedEof)
            } else {
                Err(Error::Eof)
            };
        }
        self.buf.pos = 0;
        self.buf.filled = n;
        Ok(())
    }
}

impl<S: NetStream> FrameSource for StreamSource<'_, S> {
    fn begin_frame(&mut self) {
        self.buf.frame_started = false;
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.buf.pos == self.buf.filled {
            self.refill()?;
        }
        let byte = self.buf.data[self.buf.pos];
        self.buf.pos += 1;
        self.buf.frame_started = true;
        Ok(byte)
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut copied = 0;
        while copied < out.len() {
            if self.buf.pos == self.buf.filled {
                self.refill()?;
            }
            let n = (out.len() - copied).min(self.buf.filled - self.buf.pos);
            out[copied..copied + n]
                .copy_from_slice(&self.buf.data[self.buf.pos..self.buf.pos + n]);
            self.buf.pos += n;
            copied += n;
        }
        Ok(())
    }
}

/// Build a single-fragment message frame, compressing Text and Binary
/// payloads when permessage-deflate was negotiated.
pub(crate) fn encode_message_frame(
    opcode: OpCode,
    payload: &[u8],
    permessage_deflate: bool,
) -> Result<Frame> {
    let mut frame = Frame::new(opcode, Bytes::copy_from_slice(payload));
    if permessage_deflate && matches!(opcode, OpCode::Text | OpCode::Binary) {
        frame.payload = Bytes::from(deflate::compress(payload)?);
        frame.deflated = true;
    }
    Ok(frame)
}

/// Blocking WebSocket connection.
#[derive(Debug)]
pub struct Conn<S: NetStream> {
    stream: S,
    rbuf: ReadBuffer,
    permessage_deflate: bool,
}

/// Perform the server side of the upgrade handshake on a fresh stream
/// and return the established connection.
pub fn accept<S: NetStream>(mut stream: S) -> Result<Conn<S>> {
    let mut request = Vec::with_capacity(1024);
    let (handshake, leftover) = loop {
        let mut chunk = [0u8; 1024];
        stream.set_read_timeout(Some(READ_TIMEOUT)).map_err(Error::Io)?;
        let n = stream.read(&mut chunk).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::UnexpectedEof);
        }
        request.extend_from_slice(&chunk[..n]);
        match Handshake::parse(&request) {
            Ok((hs, consumed)) => break (hs, request.split_off(consumed)),
            Err(Error::NeedMore(_)) => continue,
            Err(e) => return Err(e),
        }
    };
    stream
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .map_err(Error::Io)?;
    stream
        .write_all(handshake.response().as_bytes())
        .map_err(Error::Io)?;
    Ok(Conn::with_leftover(
        stream,
        handshake.extension.permessage_deflate,
        &leftover,
    ))
}

/// Client side of the upgrade, as far as this library takes it: send the
/// request, check `Sec-WebSocket-Accept`, hand back a connection.
/// Extensions are not negotiated and outbound frames are not masked, so
/// use it against servers you control (tests, local tools).
pub fn connect<S: NetStream>(mut stream: S, host: &str, path: &str) -> Result<Conn<S>> {
    let key = crate::handshake::sec_key()?;
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    );
    stream
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .map_err(Error::Io)?;
    stream.write_all(request.as_bytes()).map_err(Error::Io)?;

    let mut response = Vec::with_capacity(1024);
    let leftover = loop {
        let mut chunk = [0u8; 1024];
        stream.set_read_timeout(Some(READ_TIMEOUT)).map_err(Error::Io)?;
        let n = stream.read(&mut chunk).map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::UnexpectedEof);
        }
        response.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&response) {
            Ok(httparse::Status::Complete(consumed)) => {
                if parsed.code != Some(101) {
                    return Err(Error::Handshake("expected 101 Switching Protocols"));
                }
                let accept = parsed
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .ok_or(Error::Handshake("missing Sec-WebSocket-Accept"))?;
                if accept != crate::handshake::sec_accept(&key) {
                    return Err(Error::Handshake("wrong accept key"));
                }
                break response.split_off(consumed);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(Error::InvalidHttp("malformed response head")),
        }
    };
    Ok(Conn::with_leftover(stream, false, &leftover))
}

impl<S: NetStream> Conn<S> {
    pub fn new(stream: S, permessage_deflate: bool) -> Conn<S> {
        Conn::with_leftover(stream, permessage_deflate, &[])
    }

    /// Wrap a stream that already delivered `leftover` bytes past the
    /// handshake (pipelined frames).
    pub fn with_leftover(stream: S, permessage_deflate: bool, leftover: &[u8]) -> Conn<S> {
        Conn {
            stream,
            rbuf: ReadBuffer::new(leftover),
            permessage_deflate,
        }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the peer ended the connection (close handshake
    /// or EOF); the stream is already torn down. For a Text opcode the
    /// payload is guaranteed to be valid UTF-8.
    pub fn read(&mut self) -> Result<Option<(OpCode, Vec<u8>)>> {
        match self.read_message() {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.stream.shutdown();
                Ok(None)
            }
            Err(e) => {
                self.stream.shutdown();
                Err(e)
            }
        }
    }

    fn read_message(&mut self) -> Result<Option<(OpCode, Vec<u8>)>> {
        let mut payload = Vec::new();
        let mut opcode = OpCode::None;
        let mut prev_fragment = Fragment::Single;
        let mut compressed = false;

        loop {
            let frame = match self.read_frame() {
                Ok(frame) => frame,
                Err(Error::Eof) => return Ok(None),
                Err(e) => return Err(e),
            };

            if frame.is_control() {
                match frame.opcode {
                    OpCode::Ping => {
                        self.write_frame(Frame::new(OpCode::Pong, frame.payload.clone()))?
                    }
                    OpCode::Pong => {}
                    _ => {
                        // echo the close, then report end of stream
                        let _ =
                            self.write_frame(Frame::new(OpCode::Close, frame.payload.clone()));
                        return Ok(None);
                    }
                }
                continue;
            }

            verify_frame(&frame, prev_fragment, self.permessage_deflate)?;
            if frame.is_message_start() {
                compressed = frame.deflated;
                opcode = frame.opcode;
                payload = frame.payload.to_vec();
            } else {
                payload.extend_from_slice(&frame.payload);
            }

            if frame.fin {
                if compressed {
                    payload = deflate::decompress(&payload)?;
                }
                verify_message(opcode, &payload)?;
                return Ok(Some((opcode, payload)));
            }
            prev_fragment = frame.fragment();
        }
    }

    /// Read one frame, answering an idle read deadline with a Ping.
    /// A deadline that fires mid-frame is a real error.
    fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let mut src = StreamSource {
                stream: &mut self.stream,
                buf: &mut self.rbuf,
            };
            match parse_frame(&mut src) {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_deadline() && !self.rbuf.frame_started => {
                    self.write_frame(Frame::new(OpCode::Ping, Bytes::new()))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one message, compressing the payload when negotiated.
    pub fn write(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let frame = encode_message_frame(opcode, payload, self.permessage_deflate)?;
        self.write_frame(frame)
    }

    pub fn write_text(&mut self, payload: &[u8]) -> Result<()> {
        self.write(OpCode::Text, payload)
    }

    pub fn write_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.write(OpCode::Binary, payload)
    }

    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let buffers = frame.encode();
        self.stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(Error::Io)?;
        if let Err(e) = write_all_vectored(&mut self.stream, &buffers) {
            self.stream.shutdown();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.stream.shutdown();
    }
}

/// Write a `[header, payload]` pair with vectored writes, resuming after
/// short writes.
fn write_all_vectored<S: Write>(stream: &mut S, buffers: &[Bytes; 2]) -> io::Result<()> {
    let mut slices: Vec<&[u8]> = buffers
        .iter()
        .map(|b| b.as_ref())
        .filter(|b| !b.is_empty())
        .collect();
    while !slices.is_empty() {
        let iov: Vec<IoSlice<'_>> = slices.iter().map(|s| IoSlice::new(s)).collect();
        let mut n = stream.write_vectored(&iov)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        while n > 0 && !slices.is_empty() {
            if slices[0].len() <= n {
                n -= slices[0].len();
                slices.remove(0);
            } else {
                slices[0] = &slices[0][n..];
                n = 0;
            }
        }
    }
    Ok(())
}
