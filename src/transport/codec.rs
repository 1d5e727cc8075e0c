//! Newline-delimited JSON framing for stream transports.
//!
//! Each frame is one compact JSON document followed by `\n`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Default frame limit (16 MB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Newline-delimited JSON codec with a frame size limit.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
    /// Bytes already scanned for a newline in the current partial frame.
    scanned: usize,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
            scanned: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(offset) = newline else {
                if src.len() > self.max_length {
                    return Err(invalid(format!("Frame too large: {} > {}", src.len(), self.max_length)));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.max_length {
                return Err(invalid(format!("Frame too large: {} > {}", end, self.max_length)));
            }

            let line = src.split_to(end);
            src.advance(1);

            // Blank lines are keep-alives.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return serde_json::from_slice(&line)
                .map(Some)
                .map_err(|e| invalid(format!("JSON error: {}", e)));
        }
    }
}

impl<T: Serialize> Encoder<T> for NdJsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| invalid(format!("JSON error: {}", e)))?;
        if json.len() > self.max_length {
            return Err(invalid(format!("Frame too large: {} > {}", json.len(), self.max_length)));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
