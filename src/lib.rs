//! # wsring: io_uring-native TCP + WebSocket networking core
//!
//! A single-threaded, completion-driven networking stack for Linux:
//!
//! - **[`aio`]**: the event loop over an io_uring submission/completion
//!   pair: multishot accept and receive with a provided-buffer ring,
//!   partial-send resumption, vectored writes, cancellation-aware run
//!   modes and an orderly shutdown-then-close connection lifecycle.
//! - **[`frame`]**: an RFC 6455 frame codec with both a blocking byte
//!   source and an incremental one that reports exactly how many bytes
//!   the next frame still needs.
//! - **[`conn`]**: a blocking WebSocket connection with read deadlines,
//!   ping-on-idle and the close handshake.
//! - **[`async_conn`]**: a push-driven WebSocket connection fed by the
//!   loop's receive buffers, reassembling fragmented messages.
//! - **[`handshake`]**: the HTTP upgrade request parser and response
//!   builder, including `permessage-deflate` negotiation.
//! - **[`deflate`]**: a pooled raw-deflate compressor/decompressor with
//!   the RFC 7692 trailing-block convention.
//! - **[`server`]**: glue binding accepted connections to a handshake
//!   upstream and then rebinding them to the WebSocket layer.
//!
//! ## Example
//!
//! ```no_run
//! use wsring::{serve, CancelToken, Loop, Options, ShutdownCause, Upstream};
//!
//! struct Echo;
//!
//! impl Upstream for Echo {
//!     fn received(&mut self, data: &[u8]) {
//!         println!("message: {} bytes", data.len());
//!     }
//!     fn sent(&mut self) {}
//!     fn closed(&mut self, cause: ShutdownCause) {
//!         println!("closed: {}", cause);
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let lp = Loop::new(Options::default())?;
//!     let token = CancelToken::new();
//!     serve(&lp, "127.0.0.1:9001", |_conn| Echo)?;
//!     lp.run(&token)
//! }
//! ```

pub mod aio;
pub mod async_conn;
pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod server;

pub use aio::{CancelToken, Errno, Loop, Options, ShutdownCause, TcpConn, TcpListener, Upstream};
pub use async_conn::{AsyncConn, FrameSink};
pub use conn::{accept, connect, Conn, NetStream};
pub use error::{Error, Result};
pub use frame::{frame_from_buffer, Frame, FrameReader, OpCode};
pub use handshake::{sec_accept, Handshake, WS_GUID};
pub use server::{serve, upgrade_upstream};
