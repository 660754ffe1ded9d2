//! Streaming decompressors for transport-level compression.
//!
//! One instance lives for exactly one socket; the compression context spans
//! every frame the socket delivers.

use crate::error::TransportError;
use flate2::{Decompress, FlushDecompress, Status};

/// Trailing bytes of a zlib sync flush; a frame ending with them completes a message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const CHUNK_SIZE: usize = 32 * 1024;

/// Continuous zlib stream fed one frame at a time.
pub struct ZlibStream {
    inflater: Decompress,
    input: Vec<u8>,
}

impl ZlibStream {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            input: Vec::with_capacity(CHUNK_SIZE * 2),
        }
    }

    /// Feed one frame.
    ///
    /// Returns `Ok(None)` while the accumulated input does not end with
    /// [`ZLIB_SUFFIX`]; the bytes are kept for the next frame.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if frame.is_empty() {
            return Ok(None);
        }
        self.input.extend_from_slice(frame);
        if !self.input.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(CHUNK_SIZE);
        let mut consumed = 0usize;
        loop {
            if out.capacity() - out.len() < CHUNK_SIZE {
                out.reserve(CHUNK_SIZE);
            }
            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();

            let status = self
                .inflater
                .decompress_vec(&self.input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| {
                    self.input.clear();
                    TransportError::Decompress(e.to_string())
                })?;

            let read = (self.inflater.total_in() - in_before) as usize;
            let written = self.inflater.total_out() - out_before;
            consumed += read;

            if status == Status::StreamEnd {
                break;
            }
            let input_done = consumed >= self.input.len();
            let output_room = out.len() < out.capacity();
            if (input_done && output_room) || (read == 0 && written == 0 && output_room) {
                break;
            }
        }

        self.input.clear();
        Ok(Some(out))
    }

    /// Bytes waiting for a sync-flush marker.
    pub fn pending(&self) -> usize {
        self.input.len()
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuous zstd stream; every frame flushes a complete message.
pub struct ZstdStream {
    decoder: zstd::stream::raw::Decoder<'static>,
}

impl ZstdStream {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            decoder: zstd::stream::raw::Decoder::new()?,
        })
    }

    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

        if frame.is_empty() {
            return Ok(None);
        }

        let mut input = InBuffer::around(frame);
        let mut out = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let written = {
                let mut output = OutBuffer::around(&mut chunk[..]);
                self.decoder
                    .run(&mut input, &mut output)
                    .map_err(|e| TransportError::Decompress(e.to_string()))?;
                output.pos()
            };
            out.extend_from_slice(&chunk[..written]);

            // A full output buffer may hide more buffered data even once input is drained.
            if input.pos() >= frame.len() && written < chunk.len() {
                break;
            }
            if written == 0 && input.pos() >= frame.len() {
                break;
            }
        }

        Ok(Some(out))
    }
}

/// The decompressor selected for a connection
pub enum Decompressor {
    None,
    Zlib(ZlibStream),
    Zstd(ZstdStream),
}

impl Decompressor {
    /// Feed one binary frame; `None` means the message is not complete yet.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        match self {
            Decompressor::None => Ok(Some(frame.to_vec())),
            Decompressor::Zlib(stream) => stream.push(frame),
            Decompressor::Zstd(stream) => stream.push(frame),
        }
    }
}
