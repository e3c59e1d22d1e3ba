use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::ops::Range;

/// One contiguous slice of the artifact, uploaded as one multipart unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 1-based, as multipart protocols number parts.
    pub number: i32,
    pub offset: u64,
    pub data: Bytes,
}

impl Part {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.data.len() as u64
    }
}

/// Cuts an incoming byte stream into fixed-size parts while hashing it.
pub struct PartChunker {
    part_size: usize,
    buffer: BytesMut,
    next_number: i32,
    offset: u64,
    bytes_read: u64,
    hasher: Sha256,
}

impl PartChunker {
    /// A zero `part_size` is treated as one byte.
    pub fn new(part_size: usize) -> Self {
        let part_size = part_size.max(1);
        Self {
            part_size,
            buffer: BytesMut::with_capacity(part_size),
            next_number: 1,
            offset: 0,
            bytes_read: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Buffers `data` and returns every part that became full.
    pub fn push(&mut self, data: &[u8]) -> Vec<Part> {
        self.hasher.update(data);
        self.bytes_read += data.len() as u64;
        self.buffer.extend_from_slice(data);

        let mut parts = Vec::new();
        while self.buffer.len() >= self.part_size {
            let chunk = self.buffer.split_to(self.part_size).freeze();
            parts.push(self.emit(chunk));
        }
        parts
    }

    /// Flushes the trailing partial part. A stream that produced no bytes at
    /// all still yields one empty part so the upload can be completed.
    pub fn finish(mut self) -> (Option<Part>, String) {
        let last = if !self.buffer.is_empty() || self.next_number == 1 {
            let chunk = self.buffer.split().freeze();
            Some(self.emit(chunk))
        } else {
            None
        };
        (last, format!("{:x}", self.hasher.finalize()))
    }

    fn emit(&mut self, data: Bytes) -> Part {
        let part = Part {
            number: self.next_number,
            offset: self.offset,
            data,
        };
        self.next_number += 1;
        self.offset += part.len() as u64;
        part
    }
}
