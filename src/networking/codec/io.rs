//! Bounds-checked readers and writers for message bodies.
//!
//! All multi-byte integers are big-endian on the wire. Floats travel as
//! the big-endian byte order of their IEEE-754 bit pattern. Vectors are
//! three consecutive floats, quaternions four (x, y, z, w).

use super::CodecError;
use bytes::{BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};
use uuid::Uuid;

/// Cursor over a message body with typed, bounds-checked reads.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a float. NaN is tolerated; use [`read_f32_finite`](Self::read_f32_finite)
    /// for slots where NaN is forbidden by the protocol.
    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f32_finite(&mut self) -> Result<f32, CodecError> {
        let value = self.read_f32()?;
        if value.is_nan() {
            return Err(CodecError::BadFloat);
        }
        Ok(value)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, CodecError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, CodecError> {
        Ok(Vec3::new(
            self.read_f32_finite()?,
            self.read_f32_finite()?,
            self.read_f32_finite()?,
        ))
    }

    pub fn read_quat(&mut self) -> Result<Quat, CodecError> {
        let x = self.read_f32_finite()?;
        let y = self.read_f32_finite()?;
        let z = self.read_f32_finite()?;
        let w = self.read_f32_finite()?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }

    /// Name-length string: 1-byte length prefix, UTF-8 payload.
    pub fn read_str8(&mut self) -> Result<String, CodecError> {
        let len = self.read_u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadUtf8)
    }

    /// Body-length string: 2-byte length prefix, UTF-8 payload.
    pub fn read_str16(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadUtf8)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(n)?.to_vec())
    }
}

/// Append-only writer producing a message body.
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buf.put_u32(value.to_bits());
    }

    pub fn put_uuid(&mut self, value: Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_vec3(&mut self, value: Vec3) {
        self.put_f32(value.x);
        self.put_f32(value.y);
        self.put_f32(value.z);
    }

    pub fn put_quat(&mut self, value: Quat) {
        self.put_f32(value.x);
        self.put_f32(value.y);
        self.put_f32(value.z);
        self.put_f32(value.w);
    }

    /// Name-length string; truncated at 255 bytes on a char boundary.
    pub fn put_str8(&mut self, value: &str) {
        let bytes = truncate_utf8(value, u8::MAX as usize);
        self.buf.put_u8(bytes.len() as u8);
        self.buf.put_slice(bytes);
    }

    /// Body-length string; truncated at 65535 bytes on a char boundary.
    pub fn put_str16(&mut self, value: &str) {
        let bytes = truncate_utf8(value, u16::MAX as usize);
        self.buf.put_u16(bytes.len() as u16);
        self.buf.put_slice(bytes);
    }

    pub fn put_slice(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_utf8(value: &str, max: usize) -> &[u8] {
    if value.len() <= max {
        return value.as_bytes();
    }
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_scalars() {
        let mut w = ByteWriter::new();
        w.put_u8(7);
        w.put_u16(0xBEEF);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(0x0123_4567_89AB_CDEF);
        w.put_i32(-42);
        w.put_f32(1.5);
        let body = w.freeze();

        let mut r = ByteReader::new(&body);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert!(r.is_empty());
    }

    #[test]
    fn test_big_endian_on_wire() {
        let mut w = ByteWriter::new();
        w.put_u32(0x01020304);
        assert_eq!(&w.freeze()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_strings() {
        let mut w = ByteWriter::new();
        w.put_str8("Bob");
        w.put_str16("hello world");
        let body = w.freeze();

        let mut r = ByteReader::new(&body);
        assert_eq!(r.read_str8().unwrap(), "Bob");
        assert_eq!(r.read_str16().unwrap(), "hello world");
    }

    #[test]
    fn test_bad_utf8() {
        let raw = [2u8, 0xFF, 0xFE];
        let mut r = ByteReader::new(&raw);
        assert!(matches!(r.read_str8(), Err(CodecError::BadUtf8)));
    }

    #[test]
    fn test_truncated_read() {
        let raw = [0u8, 1];
        let mut r = ByteReader::new(&raw);
        assert!(matches!(r.read_u32(), Err(CodecError::Truncated)));
    }

    #[test]
    fn test_nan_rejected_in_finite_slot() {
        let mut w = ByteWriter::new();
        w.put_f32(f32::NAN);
        let body = w.freeze();
        let mut r = ByteReader::new(&body);
        assert!(matches!(r.read_f32_finite(), Err(CodecError::BadFloat)));
    }

    #[test]
    fn test_vec_and_quat_round_trip() {
        let v = Vec3::new(128.0, 25.0, 128.0);
        let q = Quat::from_xyzw(0.0, 0.0, 0.7071, 0.7071);
        let mut w = ByteWriter::new();
        w.put_vec3(v);
        w.put_quat(q);
        let body = w.freeze();

        let mut r = ByteReader::new(&body);
        assert_eq!(r.read_vec3().unwrap(), v);
        assert_eq!(r.read_quat().unwrap(), q);
    }
}
