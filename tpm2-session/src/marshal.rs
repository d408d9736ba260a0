// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Big-endian TPM wire encoding
//!
//! Every multi-octet integer is big-endian and every variable-length field is
//! a TPM2B: a u16 length followed by that many octets.

use crate::error::{Error, Result};

/// Growable buffer used to assemble commands and responses
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    ///
    /// Callers check lengths against their own limits first; anything longer
    /// than `u16::MAX` is a programming error and is truncated in the prefix.
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Patch a previously written u32 (size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        if let Some(slot) = self.data.get_mut(pos..pos + 4) {
            slot.copy_from_slice(&v.to_be_bytes());
        }
    }
}

/// Cursor over a received buffer
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::protocol(format!(
                "buffer underflow reading {what} ({len} bytes, {} remaining)",
                self.remaining()
            )));
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len, "bytes")?.to_vec())
    }

    /// Borrow the next `len` octets without copying
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len, "skipped field").map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::protocol(format!(
                "buffer underflow peeking {len} bytes"
            )));
        }
        Ok(&self.data[self.pos..self.pos + len])
    }

    /// Fail if anything is left over
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::protocol(format!(
                "{} trailing bytes after structure",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(*self);
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(*self);
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(*self);
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}
