//! Typed key/value dictionary carried by every header frame.
//!
//! On-disk layout (little-endian):
//!
//! | Type     | Name    | Description |
//! | -------: | ------- | ----------- |
//! | u16      | count   | Number of entries that follow |
//! | u8       | type    | Value type tag, per entry |
//! | u16      | key     | Entry key, per entry |
//! | u16      | length  | Value length in bytes, per entry |
//! | [u8; N]  | value   | Value bytes, per entry |
//! | u32      | crc32   | CRC32 of every byte above |
//!
//! A short read is reported as an I/O error.  Everything else that can go
//! wrong while decoding (checksum, too many entries, a value whose length does
//! not match its type) is reported as [`DicoError`] so callers can treat the
//! header as corrupt while still trusting the stream position.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use thiserror::Error;

/// Upper bound on entries accepted while decoding.
pub const MAX_DICO_ENTRIES: u16 = 1024;

const TYPE_U8: u8 = 1;
const TYPE_U16: u8 = 2;
const TYPE_U32: u8 = 3;
const TYPE_U64: u8 = 4;
const TYPE_BYTES: u8 = 5;
const TYPE_STR: u8 = 6;

#[derive(Error, Debug)]
pub enum DicoError {
    #[error("missing key {0:#06x}")]
    MissingKey(u16),
    #[error("key {key:#06x} is not a {expected}")]
    TypeMismatch { key: u16, expected: &'static str },
    #[error("dictionary checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    Checksum { stored: u32, computed: u32 },
    #[error("dictionary declares {0} entries")]
    TooManyEntries(u16),
    #[error("malformed entry for key {key:#06x}: type {typ} with {len} bytes")]
    MalformedEntry { key: u16, typ: u8, len: u16 },
    #[error("value for key {key:#06x} is {len} bytes, over the u16 limit")]
    ValueTooLong { key: u16, len: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DicoError {
    /// True when the failure came from the underlying stream rather than the
    /// dictionary content.
    pub fn is_io(&self) -> bool {
        matches!(self, DicoError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DicoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
    Str(String),
}

impl DicoValue {
    fn type_tag(&self) -> u8 {
        match self {
            DicoValue::U8(_) => TYPE_U8,
            DicoValue::U16(_) => TYPE_U16,
            DicoValue::U32(_) => TYPE_U32,
            DicoValue::U64(_) => TYPE_U64,
            DicoValue::Bytes(_) => TYPE_BYTES,
            DicoValue::Str(_) => TYPE_STR,
        }
    }

    fn encoded(&self) -> Vec<u8> {
        match self {
            DicoValue::U8(v) => vec![*v],
            DicoValue::U16(v) => v.to_le_bytes().to_vec(),
            DicoValue::U32(v) => v.to_le_bytes().to_vec(),
            DicoValue::U64(v) => v.to_le_bytes().to_vec(),
            DicoValue::Bytes(v) => v.clone(),
            DicoValue::Str(v) => v.as_bytes().to_vec(),
        }
    }

    fn decode(key: u16, typ: u8, raw: Vec<u8>) -> Result<Self, DicoError> {
        let len = raw.len() as u16;
        let value = match (typ, raw.len()) {
            (TYPE_U8, 1) => DicoValue::U8(raw[0]),
            (TYPE_U16, 2) => DicoValue::U16(u16::from_le_bytes([raw[0], raw[1]])),
            (TYPE_U32, 4) => DicoValue::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            (TYPE_U64, 8) => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&raw);
                DicoValue::U64(u64::from_le_bytes(b))
            }
            (TYPE_BYTES, _) => DicoValue::Bytes(raw),
            (TYPE_STR, _) => match String::from_utf8(raw) {
                Ok(s) => DicoValue::Str(s),
                Err(_) => return Err(DicoError::MalformedEntry { key, typ, len }),
            },
            _ => return Err(DicoError::MalformedEntry { key, typ, len }),
        };
        Ok(value)
    }
}

/// Ordered key/value dictionary.  Keys are unique; later puts replace
/// earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dico {
    entries: BTreeMap<u16, DicoValue>,
}

impl Dico {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: u16) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn put(&mut self, key: u16, value: DicoValue) {
        self.entries.insert(key, value);
    }

    pub fn put_u8(&mut self, key: u16, v: u8) {
        self.put(key, DicoValue::U8(v));
    }

    pub fn put_u16(&mut self, key: u16, v: u16) {
        self.put(key, DicoValue::U16(v));
    }

    pub fn put_u32(&mut self, key: u16, v: u32) {
        self.put(key, DicoValue::U32(v));
    }

    pub fn put_u64(&mut self, key: u16, v: u64) {
        self.put(key, DicoValue::U64(v));
    }

    pub fn put_bool(&mut self, key: u16, v: bool) {
        self.put(key, DicoValue::U8(v as u8));
    }

    pub fn put_bytes(&mut self, key: u16, v: &[u8]) {
        self.put(key, DicoValue::Bytes(v.to_vec()));
    }

    pub fn put_str(&mut self, key: u16, v: &str) {
        self.put(key, DicoValue::Str(v.to_owned()));
    }

    pub fn get(&self, key: u16) -> Result<&DicoValue, DicoError> {
        self.entries.get(&key).ok_or(DicoError::MissingKey(key))
    }

    pub fn get_u8(&self, key: u16) -> Result<u8, DicoError> {
        match self.get(key)? {
            DicoValue::U8(v) => Ok(*v),
            _ => Err(DicoError::TypeMismatch { key, expected: "u8" }),
        }
    }

    pub fn get_u16(&self, key: u16) -> Result<u16, DicoError> {
        match self.get(key)? {
            DicoValue::U16(v) => Ok(*v),
            _ => Err(DicoError::TypeMismatch { key, expected: "u16" }),
        }
    }

    pub fn get_u32(&self, key: u16) -> Result<u32, DicoError> {
        match self.get(key)? {
            DicoValue::U32(v) => Ok(*v),
            _ => Err(DicoError::TypeMismatch { key, expected: "u32" }),
        }
    }

    pub fn get_u64(&self, key: u16) -> Result<u64, DicoError> {
        match self.get(key)? {
            DicoValue::U64(v) => Ok(*v),
            _ => Err(DicoError::TypeMismatch { key, expected: "u64" }),
        }
    }

    pub fn get_bool(&self, key: u16) -> Result<bool, DicoError> {
        self.get_u8(key).map(|v| v != 0)
    }

    pub fn get_bytes(&self, key: u16) -> Result<&[u8], DicoError> {
        match self.get(key)? {
            DicoValue::Bytes(v) => Ok(v),
            _ => Err(DicoError::TypeMismatch { key, expected: "byte string" }),
        }
    }

    pub fn get_str(&self, key: u16) -> Result<&str, DicoError> {
        match self.get(key)? {
            DicoValue::Str(v) => Ok(v),
            _ => Err(DicoError::TypeMismatch { key, expected: "string" }),
        }
    }

    /// Serialized size in bytes, checksum included.
    pub fn encoded_len(&self) -> usize {
        2 + self.entries.values().map(|v| 5 + v.encoded().len()).sum::<usize>() + 4
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), DicoError> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.encoded_len());
        buf.write_u16::<LittleEndian>(self.entries.len() as u16)?;
        for (&key, value) in &self.entries {
            let raw = value.encoded();
            if raw.len() > u16::MAX as usize {
                return Err(DicoError::ValueTooLong { key, len: raw.len() });
            }
            buf.write_u8(value.type_tag())?;
            buf.write_u16::<LittleEndian>(key)?;
            buf.write_u16::<LittleEndian>(raw.len() as u16)?;
            buf.extend_from_slice(&raw);
        }
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;
        writer.write_all(&buf)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, DicoError> {
        let mut hasher = Hasher::new();

        let count = reader.read_u16::<LittleEndian>()?;
        if count > MAX_DICO_ENTRIES {
            return Err(DicoError::TooManyEntries(count));
        }
        hasher.update(&count.to_le_bytes());

        let mut raw_entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let typ = reader.read_u8()?;
            let key = reader.read_u16::<LittleEndian>()?;
            let len = reader.read_u16::<LittleEndian>()?;
            let mut raw = vec![0u8; len as usize];
            reader.read_exact(&mut raw)?;

            hasher.update(&[typ]);
            hasher.update(&key.to_le_bytes());
            hasher.update(&len.to_le_bytes());
            hasher.update(&raw);
            raw_entries.push((typ, key, raw));
        }

        let stored = reader.read_u32::<LittleEndian>()?;
        let computed = hasher.finalize();
        if stored != computed {
            return Err(DicoError::Checksum { stored, computed });
        }

        // Values are only interpreted once the checksum holds.
        let mut dico = Dico::new();
        for (typ, key, raw) in raw_entries {
            dico.put(key, DicoValue::decode(key, typ, raw)?);
        }
        Ok(dico)
    }
}
