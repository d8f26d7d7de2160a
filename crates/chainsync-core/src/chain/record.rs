//! Chain record wire format.
//!
//! Every record travels (and persists) as:
//!
//! ```text
//! inv_u64(header) | payload | inv_u64(header) | crc32 (4 bytes LE)
//! ```
//!
//! where `header = definition_id << 3 | kind`. The header appears on both
//! sides so a scanner can walk the chain in either direction; the CRC covers
//! everything before it. Payload fields are themselves invertible values.

use crate::codec::{
    read_inv_bytes, read_inv_bytes_back, read_inv_str, read_inv_str_back, read_inv_u64,
    read_inv_u64_back, write_inv_bytes, write_inv_str, write_inv_u64,
};
use crate::error::{ChainError, Result};

const KIND_CREATE: u64 = 1;
const KIND_DEFINE_FIELD: u64 = 2;
const KIND_SET_FIELDS: u64 = 3;

/// Upper bound on fields in one record; larger counts mean corruption, not
/// data.
const MAX_FIELDS_PER_RECORD: u64 = 4096;
/// Upper bound on a single name.
const MAX_NAME_BYTES: usize = 64 * 1024;

/// On-chain data type tag for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FieldType {
    U64,
    I64,
    Str,
    Bytes,
    Bool,
    Timestamp,
}

impl FieldType {
    pub fn tag(self) -> u64 {
        match self {
            FieldType::U64 => 1,
            FieldType::I64 => 2,
            FieldType::Str => 3,
            FieldType::Bytes => 4,
            FieldType::Bool => 5,
            FieldType::Timestamp => 6,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self> {
        Ok(match tag {
            1 => FieldType::U64,
            2 => FieldType::I64,
            3 => FieldType::Str,
            4 => FieldType::Bytes,
            5 => FieldType::Bool,
            6 => FieldType::Timestamp,
            other => {
                return Err(ChainError::InvalidEncoding(format!(
                    "unknown field type tag {other}"
                )))
            }
        })
    }
}

/// One value written to a field of a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWrite {
    pub field_id: u64,
    pub value: Vec<u8>,
}

/// The atomic unit of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRecord {
    /// Appends a new definition; its ordinal must equal its 1-based position
    /// among all definitions ever appended.
    CreateDefinition {
        definition_id: u64,
        inherited_id: u64,
        timestamp_ms: u64,
        name: String,
    },
    /// Registers a field under an existing definition.
    DefineField {
        definition_id: u64,
        name: String,
        data_type: FieldType,
        unsigned: bool,
        private: bool,
    },
    /// Writes values to fields of an existing definition.
    SetFields {
        definition_id: u64,
        fields: Vec<FieldWrite>,
    },
}

impl ChainRecord {
    pub fn definition_id(&self) -> u64 {
        match self {
            ChainRecord::CreateDefinition { definition_id, .. }
            | ChainRecord::DefineField { definition_id, .. }
            | ChainRecord::SetFields { definition_id, .. } => *definition_id,
        }
    }

    fn kind(&self) -> u64 {
        match self {
            ChainRecord::CreateDefinition { .. } => KIND_CREATE,
            ChainRecord::DefineField { .. } => KIND_DEFINE_FIELD,
            ChainRecord::SetFields { .. } => KIND_SET_FIELDS,
        }
    }

    fn header(&self) -> u64 {
        self.definition_id() << 3 | self.kind()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        write_inv_u64(self.header(), out);
        match self {
            ChainRecord::CreateDefinition {
                inherited_id,
                timestamp_ms,
                name,
                ..
            } => {
                write_inv_u64(*inherited_id, out);
                write_inv_u64(*timestamp_ms, out);
                write_inv_str(name, out);
            }
            ChainRecord::DefineField {
                name,
                data_type,
                unsigned,
                private,
                ..
            } => {
                write_inv_str(name, out);
                write_inv_u64(data_type.tag(), out);
                let flags = u64::from(*unsigned) | u64::from(*private) << 1;
                write_inv_u64(flags, out);
            }
            ChainRecord::SetFields { fields, .. } => {
                // Count brackets the field list on both sides so a backward
                // scan knows how many pairs to pull without guessing.
                write_inv_u64(fields.len() as u64, out);
                for f in fields {
                    write_inv_u64(f.field_id, out);
                    write_inv_bytes(&f.value, out);
                }
                write_inv_u64(fields.len() as u64, out);
            }
        }
        write_inv_u64(self.header(), out);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[start..]);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }

    /// Decode one record from the front of `input`. Returns the record and
    /// the number of bytes consumed. `Truncated` means the input simply ends
    /// too early; any other error means the bytes are damaged.
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        let mut idx = 0usize;
        let header = read_inv_u64(input, &mut idx)?;
        let definition_id = header >> 3;
        let record = match header & 0x7 {
            KIND_CREATE => {
                let inherited_id = read_inv_u64(input, &mut idx)?;
                let timestamp_ms = read_inv_u64(input, &mut idx)?;
                let name = read_name(input, &mut idx)?;
                ChainRecord::CreateDefinition {
                    definition_id,
                    inherited_id,
                    timestamp_ms,
                    name,
                }
            }
            KIND_DEFINE_FIELD => {
                let name = read_name(input, &mut idx)?;
                let data_type = FieldType::from_tag(read_inv_u64(input, &mut idx)?)?;
                let flags = read_inv_u64(input, &mut idx)?;
                if flags & !0x3 != 0 {
                    return Err(ChainError::InvalidEncoding(format!(
                        "unknown field flags {flags:#x}"
                    )));
                }
                ChainRecord::DefineField {
                    definition_id,
                    name,
                    data_type,
                    unsigned: flags & 1 != 0,
                    private: flags & 2 != 0,
                }
            }
            KIND_SET_FIELDS => {
                let count = read_inv_u64(input, &mut idx)?;
                if count > MAX_FIELDS_PER_RECORD {
                    return Err(ChainError::InvalidEncoding(format!(
                        "field count {count} exceeds limit"
                    )));
                }
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let field_id = read_inv_u64(input, &mut idx)?;
                    let value = read_inv_bytes(input, &mut idx)?;
                    fields.push(FieldWrite { field_id, value });
                }
                let trailing_count = read_inv_u64(input, &mut idx)?;
                if trailing_count != count {
                    return Err(ChainError::InvalidEncoding(format!(
                        "field count brackets disagree: {count} vs {trailing_count}"
                    )));
                }
                ChainRecord::SetFields {
                    definition_id,
                    fields,
                }
            }
            kind => {
                return Err(ChainError::InvalidEncoding(format!(
                    "unknown record kind {kind}"
                )))
            }
        };
        let trailing = read_inv_u64(input, &mut idx)?;
        if trailing != header {
            return Err(ChainError::InvalidEncoding(format!(
                "header brackets disagree: {header:#x} vs {trailing:#x}"
            )));
        }
        if input.len() - idx < 4 {
            return Err(ChainError::Truncated);
        }
        let stored = u32::from_le_bytes(input[idx..idx + 4].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&input[..idx]);
        if hasher.finalize() != stored {
            return Err(ChainError::InvalidEncoding("crc mismatch".into()));
        }
        idx += 4;
        Ok((record, idx))
    }

    /// Decode the record whose encoding ends at `input.len()`, walking the
    /// bytes right-to-left. Used to verify a chain tail without knowing where
    /// the record starts.
    pub fn decode_back(input: &[u8]) -> Result<Self> {
        if input.len() < 4 {
            return Err(ChainError::Truncated);
        }
        let crc_pos = input.len() - 4;
        let stored = u32::from_le_bytes(input[crc_pos..].try_into().unwrap());
        let mut end = crc_pos;
        let header = read_inv_u64_back(input, &mut end)?;
        let definition_id = header >> 3;
        let record = match header & 0x7 {
            KIND_CREATE => {
                let name = read_inv_str_back(input, &mut end)?;
                let timestamp_ms = read_inv_u64_back(input, &mut end)?;
                let inherited_id = read_inv_u64_back(input, &mut end)?;
                ChainRecord::CreateDefinition {
                    definition_id,
                    inherited_id,
                    timestamp_ms,
                    name,
                }
            }
            KIND_DEFINE_FIELD => {
                let flags = read_inv_u64_back(input, &mut end)?;
                let data_type = FieldType::from_tag(read_inv_u64_back(input, &mut end)?)?;
                let name = read_inv_str_back(input, &mut end)?;
                ChainRecord::DefineField {
                    definition_id,
                    name,
                    data_type,
                    unsigned: flags & 1 != 0,
                    private: flags & 2 != 0,
                }
            }
            KIND_SET_FIELDS => {
                let count = read_inv_u64_back(input, &mut end)?;
                if count > MAX_FIELDS_PER_RECORD {
                    return Err(ChainError::InvalidEncoding(format!(
                        "field count {count} exceeds limit"
                    )));
                }
                let mut rev = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let value = read_inv_bytes_back(input, &mut end)?;
                    let field_id = read_inv_u64_back(input, &mut end)?;
                    rev.push(FieldWrite { field_id, value });
                }
                let leading_count = read_inv_u64_back(input, &mut end)?;
                if leading_count != count {
                    return Err(ChainError::InvalidEncoding(format!(
                        "field count brackets disagree: {leading_count} vs {count}"
                    )));
                }
                rev.reverse();
                ChainRecord::SetFields {
                    definition_id,
                    fields: rev,
                }
            }
            kind => {
                return Err(ChainError::InvalidEncoding(format!(
                    "unknown record kind {kind}"
                )))
            }
        };
        let leading = read_inv_u64_back(input, &mut end)?;
        if leading != header {
            return Err(ChainError::InvalidEncoding(format!(
                "header brackets disagree: {leading:#x} vs {header:#x}"
            )));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&input[end..crc_pos]);
        if hasher.finalize() != stored {
            return Err(ChainError::InvalidEncoding("crc mismatch".into()));
        }
        Ok(record)
    }

    /// Copy of this record with private fields removed, for replication to
    /// external peers. `is_private` reports whether a field id is private.
    pub fn retain_public(&self, is_private: impl Fn(u64) -> bool) -> ChainRecord {
        match self {
            ChainRecord::SetFields {
                definition_id,
                fields,
            } => ChainRecord::SetFields {
                definition_id: *definition_id,
                fields: fields
                    .iter()
                    .filter(|f| !is_private(f.field_id))
                    .cloned()
                    .collect(),
            },
            other => other.clone(),
        }
    }
}

fn read_name(input: &[u8], idx: &mut usize) -> Result<String> {
    let name = read_inv_str(input, idx)?;
    if name.len() > MAX_NAME_BYTES {
        return Err(ChainError::InvalidEncoding(format!(
            "name of {} bytes exceeds limit",
            name.len()
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<ChainRecord> {
        vec![
            ChainRecord::CreateDefinition {
                definition_id: 1,
                inherited_id: 0,
                timestamp_ms: 1_700_000_000_000,
                name: "User".to_string(),
            },
            ChainRecord::DefineField {
                definition_id: 1,
                name: "email".to_string(),
                data_type: FieldType::Str,
                unsigned: false,
                private: true,
            },
            ChainRecord::SetFields {
                definition_id: 1,
                fields: vec![
                    FieldWrite {
                        field_id: 1,
                        value: b"alice@example.com".to_vec(),
                    },
                    FieldWrite {
                        field_id: 2,
                        value: vec![0, 1, 2, 255],
                    },
                ],
            },
            ChainRecord::SetFields {
                definition_id: 2,
                fields: vec![],
            },
        ]
    }

    #[test]
    fn roundtrip_forward() {
        for rec in sample_records() {
            let bytes = rec.to_bytes();
            let (decoded, used) = ChainRecord::decode(&bytes).unwrap();
            assert_eq!(decoded, rec);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn roundtrip_backward() {
        for rec in sample_records() {
            let bytes = rec.to_bytes();
            assert_eq!(ChainRecord::decode_back(&bytes).unwrap(), rec);
        }
    }

    #[test]
    fn backward_decode_with_junk_prefix() {
        // decode_back only needs the end position, so a preceding record
        // must not confuse it.
        let recs = sample_records();
        let mut buf = recs[0].to_bytes();
        buf.extend_from_slice(&recs[2].to_bytes());
        assert_eq!(ChainRecord::decode_back(&buf).unwrap(), recs[2]);
    }

    #[test]
    fn truncation_reports_truncated_at_every_cut() {
        for rec in sample_records() {
            let bytes = rec.to_bytes();
            for cut in 0..bytes.len() {
                match ChainRecord::decode(&bytes[..cut]) {
                    Err(e) if e.is_truncated() => {}
                    other => panic!("cut {cut}: expected Truncated, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let rec = &sample_records()[0];
        let mut bytes = rec.to_bytes();
        // Flip a payload byte; the headers still bracket correctly but the
        // CRC must catch it.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(ChainRecord::decode(&bytes).is_err());
    }

    #[test]
    fn header_bracket_mismatch_rejected() {
        let a = ChainRecord::SetFields {
            definition_id: 3,
            fields: vec![FieldWrite {
                field_id: 7,
                value: b"x".to_vec(),
            }],
        };
        let mut bytes = a.to_bytes();
        // Rewrite the trailing header varint (just before the CRC) and fix
        // nothing else; bracket check fires before the CRC check.
        let n = bytes.len();
        bytes[n - 6] ^= 0x08;
        let err = ChainRecord::decode(&bytes).unwrap_err();
        assert!(!err.is_truncated());
    }

    #[test]
    fn retain_public_strips_private_fields() {
        let rec = ChainRecord::SetFields {
            definition_id: 1,
            fields: vec![
                FieldWrite {
                    field_id: 1,
                    value: b"secret".to_vec(),
                },
                FieldWrite {
                    field_id: 2,
                    value: b"public".to_vec(),
                },
            ],
        };
        let public = rec.retain_public(|id| id == 1);
        match public {
            ChainRecord::SetFields { fields, .. } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field_id, 2);
            }
            _ => unreachable!(),
        }
    }
}
