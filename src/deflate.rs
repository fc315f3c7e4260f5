//! permessage-deflate side-car (RFC 7692)
//!
//! Message payloads are compressed with a raw deflate stream whose
//! trailing empty block is stripped on the wire and restored before
//! inflating. Encoders and decoders are pooled process-wide; state is
//! reset on every lease, so the pool carries no per-connection context
//! (equivalent to negotiating `no_context_takeover` on both sides).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Sync-flush tail every deflate block ends with; stripped after
/// compression and restored, with a final empty stored block, before
/// decompression.
const LAST_BLOCK: [u8; 9] = [0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

const COMPRESSION_LEVEL: u32 = 7;

fn compressors() -> &'static Mutex<Vec<Compressor>> {
    static POOL: OnceLock<Mutex<Vec<Compressor>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

fn decompressors() -> &'static Mutex<Vec<Decompressor>> {
    static POOL: OnceLock<Mutex<Vec<Decompressor>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// Compress a message payload, dropping the `00 00 FF FF` tail.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut c = compressors()
        .lock()
        .pop()
        .unwrap_or_else(Compressor::new);
    let out = c.compress(payload);
    compressors().lock().push(c);
    out
}

/// Inflate a message payload produced by [`compress`] (or a peer
/// following the same convention).
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut d = decompressors()
        .lock()
        .pop()
        .unwrap_or_else(Decompressor::new);
    let out = d.decompress(payload);
    decompressors().lock().push(d);
    out
}

struct Compressor {
    raw: Compress,
}

impl Compressor {
    fn new() -> Self {
        Compressor {
            // raw deflate, no zlib wrapper
            raw: Compress::new(Compression::new(COMPRESSION_LEVEL), false),
        }
    }

    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.raw.reset();
        let mut out = Vec::with_capacity(payload.len() + 64);

        loop {
            let before_in = self.raw.total_in() as usize;
            self.raw
                .compress_vec(&payload[before_in..], &mut out, FlushCompress::Sync)
                .map_err(|_| Error::Compression("deflate stream error"))?;
            let consumed_all = self.raw.total_in() as usize == payload.len();
            // Sync flush is complete once all input is consumed and the
            // last call left spare output capacity.
            if consumed_all && out.len() < out.capacity() {
                break;
            }
            out.reserve(512);
        }

        // drop the empty-block tail: 00 00 FF FF
        out.truncate(out.len().saturating_sub(4));
        Ok(out)
    }
}

struct Decompressor {
    raw: Decompress,
}

impl Decompressor {
    fn new() -> Self {
        Decompressor {
            raw: Decompress::new(false),
        }
    }

    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.raw.reset(false);
        let mut input = Vec::with_capacity(payload.len() + LAST_BLOCK.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&LAST_BLOCK);

        let mut out = Vec::with_capacity(payload.len() * 2 + 64);
        loop {
            let before_in = self.raw.total_in() as usize;
            let status = self
                .raw
                .decompress_vec(&input[before_in..], &mut out, FlushDecompress::Finish)
                .map_err(|_| Error::Compression("inflate stream error"))?;
            match status {
                Status::StreamEnd => return Ok(out),
                Status::Ok | Status::BufError => {
                    if self.raw.total_in() as usize == input.len()
                        && out.len() < out.capacity()
                    {
                        // all input consumed, output space left, still no
                        // stream end: truncated deflate data
                        return Err(Error::Compression("truncated deflate stream"));
                    }
                    out.reserve(512);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Example from RFC 7692 section 7.2.3.1
    #[test]
    fn compress_decompress_hello() {
        let plain = b"Hello";
        let data = compress(plain).unwrap();
        assert_eq!(data, [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00]);

        let round = decompress(&data).unwrap();
        assert_eq!(round, plain);
    }

    #[test]
    fn empty_payload() {
        let data = compress(b"").unwrap();
        let round = decompress(&data).unwrap();
        assert!(round.is_empty());
    }

    #[test]
    fn large_payload_round_trip() {
        let plain: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let data = compress(&plain).unwrap();
        assert!(data.len() < plain.len());
        let round = decompress(&data).unwrap();
        assert_eq!(round, plain);
    }

    #[test]
    fn pool_reuse_keeps_streams_independent() {
        let a = compress(b"Hello").unwrap();
        let b = compress(b"Hello").unwrap();
        // context reset on every lease: identical input, identical output
        assert_eq!(a, b);
    }
}
