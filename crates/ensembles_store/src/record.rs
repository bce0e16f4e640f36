//! Event log record framing.
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload | checksum (4) |
//! ```
//!
//! The payload is CBOR. The checksum is the first four bytes of the SHA-256
//! of type, length and payload. Integers are little-endian.

use crate::error::{StoreError, StoreResult};
use crate::identifiers::ObjectId;
use ensembles_model::{GlobalIdentifier, ModelError, StoreModificationEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Record magic bytes.
pub const RECORD_MAGIC: [u8; 4] = *b"ENSL";

/// Record format version.
pub const RECORD_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 1 + 4;
const CHECKSUM_LEN: usize = 4;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A committed event was added.
    PutEvent,
    /// An event was removed.
    RemoveEvent,
    /// A local object was mapped to a global identifier.
    MapIdentifier,
}

impl RecordType {
    /// Converts to the on-disk byte.
    pub fn as_byte(&self) -> u8 {
        match self {
            RecordType::PutEvent => 1,
            RecordType::RemoveEvent => 2,
            RecordType::MapIdentifier => 3,
        }
    }

    /// Converts from the on-disk byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordType::PutEvent),
            2 => Some(RecordType::RemoveEvent),
            3 => Some(RecordType::MapIdentifier),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IdentifierMapping {
    object_id: ObjectId,
    identifier: GlobalIdentifier,
}

/// A record in the event log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A committed event.
    PutEvent(StoreModificationEvent),
    /// Removal of an event by unique identifier.
    RemoveEvent(String),
    /// Mapping of a local object to its global identifier.
    MapIdentifier {
        /// Local object handle.
        object_id: ObjectId,
        /// Global identifier.
        identifier: GlobalIdentifier,
    },
}

impl LogRecord {
    /// Record type.
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::PutEvent(_) => RecordType::PutEvent,
            LogRecord::RemoveEvent(_) => RecordType::RemoveEvent,
            LogRecord::MapIdentifier { .. } => RecordType::MapIdentifier,
        }
    }

    /// Encodes the record with its frame.
    ///
    /// # Errors
    ///
    /// Fails if CBOR encoding fails.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        let written = match self {
            LogRecord::PutEvent(event) => ciborium::into_writer(event, &mut payload),
            LogRecord::RemoveEvent(id) => ciborium::into_writer(id, &mut payload),
            LogRecord::MapIdentifier {
                object_id,
                identifier,
            } => ciborium::into_writer(
                &IdentifierMapping {
                    object_id: *object_id,
                    identifier: identifier.clone(),
                },
                &mut payload,
            ),
        };
        written.map_err(ModelError::codec)?;

        let record_type = self.record_type().as_byte();
        let len = payload.len() as u32;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.push(record_type);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&checksum(record_type, len, &payload));
        Ok(buf)
    }
}

fn checksum(record_type: u8, len: u32, payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([record_type]);
    hasher.update(len.to_le_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Result of scanning a log.
#[derive(Debug)]
pub struct ScanOutcome {
    /// Records decoded in order.
    pub records: Vec<LogRecord>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Whether bytes after `valid_len` were discarded as a torn write.
    pub torn_tail: bool,
}

/// Decodes every record of a log.
///
/// An incomplete or checksum-failing record at the very end is treated as
/// a torn write and reported through [`ScanOutcome::torn_tail`].
///
/// # Errors
///
/// Returns [`StoreError::Corrupted`] for damage before the tail.
pub fn scan_records(data: &[u8]) -> StoreResult<ScanOutcome> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < HEADER_LEN {
            return Ok(torn(records, pos));
        }
        if remaining[0..4] != RECORD_MAGIC {
            return Err(StoreError::corrupted(format!(
                "bad record magic at offset {pos}"
            )));
        }
        let version = u16::from_le_bytes([remaining[4], remaining[5]]);
        if version > RECORD_VERSION {
            return Err(StoreError::corrupted(format!(
                "unsupported record version {version} at offset {pos}"
            )));
        }
        let type_byte = remaining[6];
        let len = u32::from_le_bytes([remaining[7], remaining[8], remaining[9], remaining[10]]);
        let total = HEADER_LEN + len as usize + CHECKSUM_LEN;
        if remaining.len() < total {
            return Ok(torn(records, pos));
        }

        let payload = &remaining[HEADER_LEN..HEADER_LEN + len as usize];
        let stored = &remaining[HEADER_LEN + len as usize..total];
        if stored != checksum(type_byte, len, payload) {
            if pos + total == data.len() {
                return Ok(torn(records, pos));
            }
            return Err(StoreError::corrupted(format!(
                "checksum mismatch at offset {pos}"
            )));
        }

        let record_type = RecordType::from_byte(type_byte).ok_or_else(|| {
            StoreError::corrupted(format!("unknown record type {type_byte} at offset {pos}"))
        })?;
        records.push(decode_payload(record_type, payload)?);
        pos += total;
    }

    Ok(ScanOutcome {
        records,
        valid_len: pos as u64,
        torn_tail: false,
    })
}

fn torn(records: Vec<LogRecord>, pos: usize) -> ScanOutcome {
    ScanOutcome {
        records,
        valid_len: pos as u64,
        torn_tail: true,
    }
}

fn decode_payload(record_type: RecordType, payload: &[u8]) -> StoreResult<LogRecord> {
    let corrupt = |e: ciborium::de::Error<std::io::Error>| {
        StoreError::corrupted(format!("undecodable {record_type:?} record: {e}"))
    };
    Ok(match record_type {
        RecordType::PutEvent => {
            LogRecord::PutEvent(ciborium::from_reader(payload).map_err(corrupt)?)
        }
        RecordType::RemoveEvent => {
            LogRecord::RemoveEvent(ciborium::from_reader(payload).map_err(corrupt)?)
        }
        RecordType::MapIdentifier => {
            let mapping: IdentifierMapping = ciborium::from_reader(payload).map_err(corrupt)?;
            LogRecord::MapIdentifier {
                object_id: mapping.object_id,
                identifier: mapping.identifier,
            }
        }
    })
}
