// SPDX-License-Identifier: MIT OR Apache-2.0

//! Newline-delimited JSON framing.
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::SyncError;

/// Default upper bound of a single encoded message in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Encodes every message as one line of JSON.
#[derive(Clone, Debug)]
pub struct JsonLinesCodec<T> {
    max_line_length: usize,

    /// Number of buffered bytes already checked for a line break.
    next_index: usize,
    _phantom: PhantomData<T>,
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Encoder<T> for JsonLinesCodec<T>
where
    T: Serialize,
{
    type Error = SyncError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // JSON encoding escapes line breaks inside strings, a raw one can only end the frame.
        let bytes = serde_json::to_vec(&item).map_err(|err| SyncError::Codec(err.to_string()))?;
        if bytes.len() > self.max_line_length {
            return Err(SyncError::Codec(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_line_length
            )));
        }
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl<T> Decoder for JsonLinesCodec<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|byte| *byte == b'\n')
            else {
                if src.len() > self.max_line_length {
                    return Err(SyncError::Codec(format!(
                        "line exceeds limit of {} bytes",
                        self.max_line_length
                    )));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let item =
                serde_json::from_slice(line).map_err(|err| SyncError::Codec(err.to_string()))?;
            return Ok(Some(item));
        }
    }
}
