//! Typed binary buffer used by every message body.
//!
//! All integers are big-endian. Strings are a `u32` byte length followed by
//! UTF-8 bytes, booleans are a single 0/1 byte, timestamps are `i64` epoch
//! milliseconds and lists are a `u32` count followed by their items.
//! The write cursor is the end of the buffer; the read cursor is tracked
//! separately so a buffer can be filled and then drained.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer underflow: need {needed} bytes at offset {offset}, {available} available")]
    Underflow {
        needed: usize,
        offset: usize,
        available: usize,
    },
    #[error("{0} trailing bytes after message body")]
    Trailing(usize),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
    #[error("invalid {kind} value {value}")]
    InvalidEnum { kind: &'static str, value: u8 },
    #[error("declared length {0} exceeds remaining bytes")]
    LengthOverrun(usize),
}

/// Enumerations written as a single tag byte.
pub trait WireEnum: Sized {
    const KIND: &'static str;
    fn to_wire(&self) -> u8;
    fn from_wire(v: u8) -> Option<Self>;
}

#[derive(Debug, Default, Clone)]
pub struct WireBuffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            read_pos: 0,
        }
    }

    /// Wrap received bytes for reading from the start.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, read_pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Fail closed if any bytes were left unread.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::Trailing(n)),
        }
    }

    // ---- write side ----

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.data.push(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.data.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn put_time(&mut self, t: &DateTime<Utc>) {
        self.put_i64(t.timestamp_millis());
    }

    pub fn put_uuid(&mut self, id: &Uuid) {
        self.data.extend_from_slice(id.as_bytes());
    }

    pub fn put_enum<E: WireEnum>(&mut self, v: &E) {
        self.data.push(v.to_wire());
    }

    pub fn put_strings(&mut self, items: &[String]) {
        self.put_u32(items.len() as u32);
        for s in items {
            self.put_str(s);
        }
    }

    // ---- read side ----

    fn take(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Underflow {
                needed: n,
                offset: self.read_pos,
                available: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_raw<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.take_array()
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthOverrun(len));
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn get_time(&mut self) -> Result<DateTime<Utc>, CodecError> {
        let ms = self.get_i64()?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or(CodecError::InvalidTimestamp(ms))
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, CodecError> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    pub fn get_enum<E: WireEnum>(&mut self) -> Result<E, CodecError> {
        let v = self.get_u8()?;
        E::from_wire(v).ok_or(CodecError::InvalidEnum { kind: E::KIND, value: v })
    }

    pub fn get_strings(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.get_u32()? as usize;
        // Every string needs at least its 4-byte length
        if count.saturating_mul(4) > self.remaining() {
            return Err(CodecError::LengthOverrun(count));
        }
        (0..count).map(|_| self.get_str()).collect()
    }
}
