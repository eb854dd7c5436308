// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use futures::future::{BoxFuture, FutureExt};
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};

use crate::conn::{BoxedConn, Conn};

/// Largest plaintext carried by a single frame; larger writes are split
pub const MAX_CHUNK: usize = 64 * 1024;
/// Bound on a buffered frame, above LZ4's worst case for a full chunk
pub const MAX_FRAME_LENGTH: usize = 2 * MAX_CHUNK;

const LZ4_MAGIC: u32 = 0x184D_2204;
const FLAG_BLOCK_CHECKSUMS: u8 = 0x10;
const FLAG_CONTENT_SIZE: u8 = 0x08;
const FLAG_CONTENT_CHECKSUM: u8 = 0x04;
const FLAG_DICTIONARY_ID: u8 = 0x01;
const UNCOMPRESSED_BLOCK: u32 = 0x8000_0000;
const READ_CAPACITY: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DecompressError {
  #[error("Stream does not start an LZ4 frame (magic {0:#010x})")]
  BadMagic(u32),
  #[error("LZ4 frame of at least {length} bytes exceeds the {limit} byte limit")]
  TooLarge { length: usize, limit: usize },
  #[error("Corrupt LZ4 frame: {0}")]
  Corrupt(#[source] io::Error),
}

impl From<DecompressError> for io::Error {
  fn from(e: DecompressError) -> Self {
    io::Error::new(io::ErrorKind::InvalidData, e)
  }
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
  let word = bytes.get(at..at + 4)?;
  Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

/// Length of the complete LZ4 frame at the start of `wire`, once all of it has arrived
fn frame_length(wire: &[u8]) -> Result<Option<usize>, DecompressError> {
  let magic = match le_u32(wire, 0) {
    Some(magic) => magic,
    None => return Ok(None),
  };
  if magic != LZ4_MAGIC {
    return Err(DecompressError::BadMagic(magic));
  }
  let flags = match wire.get(4) {
    Some(&flags) => flags,
    None => return Ok(None),
  };
  let optional = |flag: u8, len: usize| if flags & flag != 0 { len } else { 0 };
  // Magic, FLG, BD, optional fields, header checksum
  let mut length = 4 + 2 + optional(FLAG_CONTENT_SIZE, 8) + optional(FLAG_DICTIONARY_ID, 4) + 1;
  loop {
    if length > MAX_FRAME_LENGTH {
      return Err(DecompressError::TooLarge {
        length,
        limit: MAX_FRAME_LENGTH,
      });
    }
    let block = match le_u32(wire, length) {
      Some(block) => block,
      None => return Ok(None),
    };
    length += 4;
    if block == 0 {
      length += optional(FLAG_CONTENT_CHECKSUM, 4);
      break;
    }
    length += (block & !UNCOMPRESSED_BLOCK) as usize + optional(FLAG_BLOCK_CHECKSUMS, 4);
  }
  Ok((wire.len() >= length).then(|| length))
}

fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, DecompressError> {
  let mut decoded = Vec::new();
  FrameDecoder::new(frame)
    .take(MAX_CHUNK as u64 + 1)
    .read_to_end(&mut decoded)
    .map_err(DecompressError::Corrupt)?;
  if decoded.len() > MAX_CHUNK {
    return Err(DecompressError::TooLarge {
      length: decoded.len(),
      limit: MAX_CHUNK,
    });
  }
  Ok(decoded)
}

fn encode_frame(chunk: &[u8], wire: &mut Vec<u8>) -> io::Result<()> {
  let info = FrameInfo::new()
    .block_size(BlockSize::Max64KB)
    .block_mode(BlockMode::Independent);
  let mut encoder = FrameEncoder::with_frame_info(info, wire);
  encoder.write_all(chunk)?;
  encoder
    .finish()
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
  Ok(())
}

/// Compresses each write into complete LZ4 frames, flushed immediately
///
/// The stream is a plain concatenation of standard LZ4 frames, one per
/// chunk of at most [MAX_CHUNK] bytes. Reads buffer until a whole frame
/// has arrived, so an abandoned read keeps what it already received.
pub struct CompressedConn {
  inner: BoxedConn,
  wire: Vec<u8>,
  scratch: Vec<u8>,
  decoded: Vec<u8>,
  decoded_pos: usize,
}

impl CompressedConn {
  pub fn new(inner: BoxedConn) -> Self {
    Self {
      inner,
      wire: Vec::new(),
      scratch: vec![0u8; READ_CAPACITY],
      decoded: Vec::new(),
      decoded_pos: 0,
    }
  }
}

impl Conn for CompressedConn {
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      if buf.is_empty() {
        return Ok(0);
      }
      loop {
        let available = &self.decoded[self.decoded_pos..];
        if !available.is_empty() {
          let n = available.len().min(buf.len());
          buf[..n].copy_from_slice(&available[..n]);
          self.decoded_pos += n;
          return Ok(n);
        }
        if let Some(length) = frame_length(&self.wire)? {
          self.decoded = decode_frame(&self.wire[..length])?;
          self.decoded_pos = 0;
          self.wire.drain(..length);
          continue;
        }
        let n = self.inner.read(&mut self.scratch).await?;
        if n == 0 {
          if self.wire.is_empty() {
            return Ok(0);
          }
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Compressed stream ended inside a frame",
          ));
        }
        self.wire.extend_from_slice(&self.scratch[..n]);
      }
    }
    .boxed()
  }

  fn write<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      if buf.is_empty() {
        return Ok(0);
      }
      let mut wire = Vec::new();
      for chunk in buf.chunks(MAX_CHUNK) {
        encode_frame(chunk, &mut wire)?;
      }
      self.inner.write(&mut wire).await?;
      tracing::trace!(plaintext = buf.len(), compressed = wire.len(), "compressed write flushed");
      Ok(buf.len())
    }
    .boxed()
  }

  fn close(self: Box<Self>) -> BoxFuture<'static, io::Result<()>> {
    self.inner.close()
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    self.inner.local_addr()
  }

  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.inner.remote_addr()
  }
}
