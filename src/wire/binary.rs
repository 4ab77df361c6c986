//! BinaryTags payload format
//!
//! Length-prefixed binary encoding used by binary data transfer
//! messages. Every frame starts with a big-endian 2-byte format
//! version:
//!
//! - **Compact (1)**: fixed field order. `vendorId` and `messageId`
//!   each carry a 2-byte length prefix (length 0 means absent),
//!   `data` carries a 4-byte length prefix.
//! - **Extensible (2)**: tag/length/value entries in any order, each a
//!   2-byte tag (`VendorId=1`, `MessageId=2`, `Data=3`) followed by a
//!   4-byte length. Unknown tags are skipped, which is what lets the
//!   format grow.
//!
//! All integers are big-endian. On the JSON wire the encoded bytes ride
//! base64 in the payload slot.

use thiserror::Error;

const FORMAT_COMPACT: u16 = 1;
const FORMAT_EXTENSIBLE: u16 = 2;

const TAG_VENDOR_ID: u16 = 1;
const TAG_MESSAGE_ID: u16 = 2;
const TAG_DATA: u16 = 3;

// ── BinaryFormat ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryFormat {
    #[default]
    Compact,
    Extensible,
}

impl BinaryFormat {
    fn version(&self) -> u16 {
        match self {
            BinaryFormat::Compact => FORMAT_COMPACT,
            BinaryFormat::Extensible => FORMAT_EXTENSIBLE,
        }
    }
}

// ── BinaryTags ─────────────────────────────────────────────────

/// Decoded form of a BinaryTags frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryTags {
    pub format: BinaryFormat,
    pub vendor_id: String,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

impl BinaryTags {
    pub fn compact(vendor_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            format: BinaryFormat::Compact,
            vendor_id: vendor_id.into(),
            message_id: None,
            data,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    // ── Encoding ───────────────────────────────────────────

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + self.vendor_id.len()
                + self.message_id.as_ref().map(String::len).unwrap_or(0)
                + self.data.len()
                + 16,
        );
        out.extend_from_slice(&self.format.version().to_be_bytes());

        match self.format {
            BinaryFormat::Compact => {
                put_short_field(&mut out, self.vendor_id.as_bytes());
                put_short_field(
                    &mut out,
                    self.message_id.as_deref().unwrap_or("").as_bytes(),
                );
                out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
                out.extend_from_slice(&self.data);
            }
            BinaryFormat::Extensible => {
                put_tagged(&mut out, TAG_VENDOR_ID, self.vendor_id.as_bytes());
                if let Some(message_id) = &self.message_id {
                    put_tagged(&mut out, TAG_MESSAGE_ID, message_id.as_bytes());
                }
                put_tagged(&mut out, TAG_DATA, &self.data);
            }
        }
        out
    }

    // ── Decoding ───────────────────────────────────────────

    pub fn decode(bytes: &[u8]) -> Result<Self, BinaryError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u16()?;
        match version {
            FORMAT_COMPACT => Self::decode_compact(&mut reader),
            FORMAT_EXTENSIBLE => Self::decode_extensible(&mut reader),
            other => Err(BinaryError::UnknownFormat(other)),
        }
    }

    fn decode_compact(reader: &mut Reader<'_>) -> Result<Self, BinaryError> {
        let vendor_id = read_short_string(reader, "vendorId")?;
        let message_id = read_short_string(reader, "messageId")?;
        let data_len = reader.u32()? as usize;
        let data = reader.take(data_len)?.to_vec();

        if reader.remaining() != 0 {
            return Err(BinaryError::TrailingBytes(reader.remaining()));
        }
        if vendor_id.is_empty() {
            return Err(BinaryError::MissingVendorId);
        }

        Ok(Self {
            format: BinaryFormat::Compact,
            vendor_id,
            message_id: if message_id.is_empty() { None } else { Some(message_id) },
            data,
        })
    }

    fn decode_extensible(reader: &mut Reader<'_>) -> Result<Self, BinaryError> {
        let mut vendor_id = None;
        let mut message_id = None;
        let mut data = Vec::new();

        while reader.remaining() > 0 {
            let tag = reader.u16()?;
            let len = reader.u32()? as usize;
            let value = reader.take(len)?;

            match tag {
                TAG_VENDOR_ID => vendor_id = Some(utf8(value, "vendorId")?),
                TAG_MESSAGE_ID => message_id = Some(utf8(value, "messageId")?),
                TAG_DATA => data = value.to_vec(),
                // forward compatibility: unknown tags are skipped
                _ => {}
            }
        }

        Ok(Self {
            format: BinaryFormat::Extensible,
            vendor_id: vendor_id.ok_or(BinaryError::MissingVendorId)?,
            message_id,
            data,
        })
    }
}

// ── Write helpers ──────────────────────────────────────────────

fn put_short_field(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn put_tagged(out: &mut Vec<u8>, tag: u16, value: &[u8]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

// ── Read helpers ───────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BinaryError> {
        if self.remaining() < n {
            return Err(BinaryError::Truncated {
                expected: n,
                got: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, BinaryError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, BinaryError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn read_short_string(reader: &mut Reader<'_>, field: &'static str) -> Result<String, BinaryError> {
    let n = reader.u16()? as usize;
    utf8(reader.take(n)?, field)
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, BinaryError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BinaryError::BadUtf8(field))
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BinaryError {
    #[error("unknown binary format version {0}")]
    UnknownFormat(u16),

    #[error("truncated frame: needed {expected} more bytes, had {got}")]
    Truncated { expected: usize, got: usize },

    #[error("{0} is not valid UTF-8")]
    BadUtf8(&'static str),

    #[error("vendorId is required")]
    MissingVendorId,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        let tags = BinaryTags::compact("acme", vec![1, 2, 3, 4]).with_message_id("fw-chunk");
        let decoded = BinaryTags::decode(&tags.encode()).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn compact_without_message_id() {
        let tags = BinaryTags::compact("acme", vec![0xFF]);
        let decoded = BinaryTags::decode(&tags.encode()).unwrap();
        assert_eq!(decoded.message_id, None);
        assert_eq!(decoded.data, vec![0xFF]);
    }

    #[test]
    fn extensible_roundtrip() {
        let tags = BinaryTags {
            format: BinaryFormat::Extensible,
            vendor_id: "acme".into(),
            message_id: Some("m1".into()),
            data: vec![9, 8, 7],
        };
        let decoded = BinaryTags::decode(&tags.encode()).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn extensible_skips_unknown_tags() {
        let tags = BinaryTags {
            format: BinaryFormat::Extensible,
            vendor_id: "acme".into(),
            message_id: None,
            data: vec![1],
        };
        let mut bytes = tags.encode();
        // append a tag from the future
        bytes.extend_from_slice(&99u16.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        let decoded = BinaryTags::decode(&bytes).unwrap();
        assert_eq!(decoded.vendor_id, "acme");
        assert_eq!(decoded.data, vec![1]);
    }

    #[test]
    fn wire_layout_is_big_endian() {
        let tags = BinaryTags::compact("ab", vec![0x01]);
        let bytes = tags.encode();
        // version 1, vendor len 2, "ab", message len 0, data len 1, 0x01
        assert_eq!(
            bytes,
            vec![0, 1, 0, 2, b'a', b'b', 0, 0, 0, 0, 0, 1, 0x01]
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let tags = BinaryTags::compact("acme", vec![1, 2, 3]);
        let bytes = tags.encode();
        let err = BinaryTags::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, BinaryError::Truncated { .. }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = BinaryTags::decode(&[0, 7, 0, 0]).unwrap_err();
        assert_eq!(err, BinaryError::UnknownFormat(7));
    }

    #[test]
    fn missing_vendor_id_is_rejected() {
        let bytes = [
            0u8, 2, // Extensible
            0, 3, 0, 0, 0, 1, 0x01, // Data only
        ];
        assert_eq!(
            BinaryTags::decode(&bytes).unwrap_err(),
            BinaryError::MissingVendorId
        );
    }
}
