//! Astro camera configuration protocol
//!
//! GATT identifiers, host-to-device write payloads and the decoder for
//! device-to-host configuration notifications.
//!
//! The two directions use different formats. Writes are flat UTF-8 text;
//! notifications carry a structured record with choices and a read-only flag.

use crate::domain::models::ConfigRecord;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Astro configuration service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6C7028E2_DC4A_11EF_9134_75E88A34574D);

/// Config read characteristic. Accepts a bare config id and notifies the record.
pub const CONFIG_READ_CHAR_UUID: Uuid = Uuid::from_u128(0x87BDECC4_DC4A_11EF_AB7F_B7E88A34574D);

/// Config write characteristic. Accepts `id=value`.
pub const CONFIG_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x994E9452_DC4A_11EF_B90E_F0E88A34574D);

/// Capture image characteristic. Any write triggers the shutter.
pub const CAPTURE_IMAGE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x114FC821_6A6E_4E81_BD05_1DD5AB7A679B);

/// Payload written to the capture characteristic.
pub const CAPTURE_TRIGGER: &[u8] = b"v";

/// Largest uncompressed record accepted from a device.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Largest choice list accepted from a device.
pub const MAX_CHOICES: u64 = 1024;

const RECORD_KIND_CAMERA_CONFIG: u32 = 0;
const SIZE_PREFIX_LEN: usize = 4;
const LENGTH_FIELD_LEN: usize = 8;

/// Read request payload: the bare config id.
pub fn encode_read_request(id: &str) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Config write payload: `{id}={value}`.
pub fn encode_write(id: &str, value: &str) -> Vec<u8> {
    format!("{id}={value}").into_bytes()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("notification payload is empty")]
    Empty,
    #[error("truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("declared record size {0} exceeds the {max} byte limit", max = MAX_RECORD_LEN)]
    Oversized(u64),
    #[error("corrupt compressed frame: {0}")]
    Compression(String),
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
    #[error("record identifier is empty")]
    EmptyIdentifier,
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("declared {declared} choices but the payload holds fewer")]
    ChoiceCount { declared: u64 },
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Decode one configuration notification.
///
/// # Notification Schema (v1)
///
/// ```text
/// Frame:
/// [0-3]   : Uncompressed record size (u32 little-endian, <= MAX_RECORD_LEN)
/// [4..]   : LZ4 block holding the record
///
/// Record (all integers little-endian):
/// u32     : Record kind (0 = camera config)
/// u64 + n : Identifier, byte length then UTF-8 bytes (non-empty)
/// u64 + n : Value, byte length then UTF-8 bytes
/// u64     : Choice count (<= MAX_CHOICES)
///   u64 + n : Each choice, byte length then UTF-8 bytes
/// u8      : Read-only flag (0 or 1)
/// ```
///
/// Every length is checked against the remaining buffer before it is used and
/// the record must consume the whole decompressed buffer.
pub fn decode(payload: &[u8]) -> Result<ConfigRecord, DecodeError> {
    let record = decompress_frame(payload)?;
    trace!("Decompressed record: {} bytes", record.len());
    decode_record(&record)
}

fn decompress_frame(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut cursor = Cursor::new(payload);
    let declared = cursor.read_u32()? as u64;
    if declared > MAX_RECORD_LEN as u64 {
        return Err(DecodeError::Oversized(declared));
    }

    let block = &payload[SIZE_PREFIX_LEN..];
    let record = lz4_flex::block::decompress(block, declared as usize)
        .map_err(|e| DecodeError::Compression(e.to_string()))?;
    if record.len() != declared as usize {
        return Err(DecodeError::Compression(format!(
            "expected {} bytes, got {}",
            declared,
            record.len()
        )));
    }
    Ok(record)
}

/// Decode an uncompressed record body.
pub(crate) fn decode_record(bytes: &[u8]) -> Result<ConfigRecord, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let kind = cursor.read_u32()?;
    if kind != RECORD_KIND_CAMERA_CONFIG {
        return Err(DecodeError::UnknownKind(kind));
    }

    let id = cursor.read_string("identifier")?;
    if id.is_empty() {
        return Err(DecodeError::EmptyIdentifier);
    }
    let value = cursor.read_string("value")?;

    let declared = cursor.read_u64()?;
    // Each choice needs at least its length field.
    let fits = (cursor.remaining() / LENGTH_FIELD_LEN) as u64;
    if declared > MAX_CHOICES || declared > fits {
        return Err(DecodeError::ChoiceCount { declared });
    }
    let mut choices = Vec::with_capacity(declared as usize);
    for _ in 0..declared {
        let choice = cursor.read_string("choice").map_err(|e| match e {
            DecodeError::Truncated { .. } => DecodeError::ChoiceCount { declared },
            other => other,
        })?;
        choices.push(choice);
    }

    let is_read_only = match cursor.read_u8()? {
        0 => false,
        1 => true,
        other => return Err(DecodeError::InvalidBool(other)),
    };

    if cursor.remaining() > 0 {
        return Err(DecodeError::TrailingBytes(cursor.remaining()));
    }

    Ok(ConfigRecord {
        id,
        value,
        choices,
        is_read_only,
    })
}

/// Bounds-checked reader over a byte slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let offset = self.offset;
        let len = self.read_u64()?;
        let available = self.remaining();
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= available)
            .ok_or(DecodeError::Truncated {
                offset,
                needed: usize::try_from(len).unwrap_or(usize::MAX),
                available,
            })?;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }
}
