//! Transaction log records and their on-disk envelope.
//!
//! ```text
//! magic "DBLG" | version u16 | type u8 | payload len u32 | payload | crc32
//! ```
//!
//! All integers are little-endian. The CRC covers every byte before it.

use crate::engine::log::Lsn;
use crate::error::{DbError, DbResult};

/// Magic bytes opening every record.
pub const LOG_MAGIC: [u8; 4] = *b"DBLG";

/// Current record format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A committed top-level transaction with its after-images.
    Commit = 1,
    /// A checkpoint marker.
    Checkpoint = 2,
    /// A database file was removed.
    DbRemove = 3,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Commit),
            2 => Some(Self::Checkpoint),
            3 => Some(Self::DbRemove),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The final state of one key after a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOp {
    /// Database name relative to its data directory.
    pub db: String,
    /// The key.
    pub key: Vec<u8>,
    /// All data items of the key, or `None` when the key was removed.
    pub after: Option<Vec<Vec<u8>>>,
}

/// A transaction log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A top-level transaction committed.
    Commit {
        /// Transaction id.
        txn: u32,
        /// Commit time, seconds since the epoch.
        timestamp: u64,
        /// Redo images of every key the transaction touched.
        ops: Vec<LogOp>,
    },
    /// A checkpoint completed.
    Checkpoint {
        /// Every commit before this position is in the data files.
        ckp_lsn: Lsn,
        /// Begin position of the oldest transaction active at the time.
        oldest_active: Option<Lsn>,
        /// Checkpoint time, seconds since the epoch.
        timestamp: u64,
    },
    /// A database file was removed.
    DbRemove {
        /// Database name relative to its data directory.
        db: String,
    },
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Commit { .. } => LogRecordType::Commit,
            Self::Checkpoint { .. } => LogRecordType::Checkpoint,
            Self::DbRemove { .. } => LogRecordType::DbRemove,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a key, item or name exceeds `u32::MAX` bytes.
    pub fn encode_payload(&self) -> DbResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Commit {
                txn,
                timestamp,
                ops,
            } => {
                buf.extend_from_slice(&txn.to_le_bytes());
                buf.extend_from_slice(&timestamp.to_le_bytes());
                put_len(&mut buf, ops.len())?;
                for op in ops {
                    put_bytes(&mut buf, op.db.as_bytes())?;
                    put_bytes(&mut buf, &op.key)?;
                    match &op.after {
                        None => buf.push(0),
                        Some(items) => {
                            buf.push(1);
                            put_len(&mut buf, items.len())?;
                            for item in items {
                                put_bytes(&mut buf, item)?;
                            }
                        }
                    }
                }
            }
            Self::Checkpoint {
                ckp_lsn,
                oldest_active,
                timestamp,
            } => {
                put_lsn(&mut buf, *ckp_lsn);
                match oldest_active {
                    None => buf.push(0),
                    Some(lsn) => {
                        buf.push(1);
                        put_lsn(&mut buf, *lsn);
                    }
                }
                buf.extend_from_slice(&timestamp.to_le_bytes());
            }
            Self::DbRemove { db } => put_bytes(&mut buf, db.as_bytes())?,
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error on truncated or trailing bytes.
    pub fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> DbResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let record = match record_type {
            LogRecordType::Commit => {
                let txn = reader.u32()?;
                let timestamp = reader.u64()?;
                let count = reader.u32()?;
                let mut ops = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let db = reader.string()?;
                    let key = reader.bytes()?.to_vec();
                    let after = match reader.u8()? {
                        0 => None,
                        1 => {
                            let n = reader.u32()?;
                            let mut items = Vec::with_capacity(n.min(1024) as usize);
                            for _ in 0..n {
                                items.push(reader.bytes()?.to_vec());
                            }
                            Some(items)
                        }
                        other => {
                            return Err(DbError::corrupted(format!(
                                "invalid image flag {other} in commit record"
                            )))
                        }
                    };
                    ops.push(LogOp { db, key, after });
                }
                Self::Commit {
                    txn,
                    timestamp,
                    ops,
                }
            }
            LogRecordType::Checkpoint => {
                let ckp_lsn = reader.lsn()?;
                let oldest_active = match reader.u8()? {
                    0 => None,
                    _ => Some(reader.lsn()?),
                };
                let timestamp = reader.u64()?;
                Self::Checkpoint {
                    ckp_lsn,
                    oldest_active,
                    timestamp,
                }
            }
            LogRecordType::DbRemove => Self::DbRemove {
                db: reader.string()?,
            },
        };
        reader.finish(record_type)?;
        Ok(record)
    }

    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| DbError::invalid_operation("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Outcome of decoding the envelope at some position.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A valid record and its encoded length.
    Record(LogRecord, usize),
    /// The bytes end before the record does, or fail validation: the end of
    /// the valid log.
    Torn,
}

/// Decodes one enveloped record from the start of `data`.
pub(crate) fn decode_envelope(data: &[u8]) -> Decoded {
    if data.len() < HEADER_SIZE + CRC_SIZE || data[..4] != LOG_MAGIC {
        return Decoded::Torn;
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    let Some(record_type) = LogRecordType::from_byte(data[6]) else {
        return Decoded::Torn;
    };
    let len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;
    let total = HEADER_SIZE + len + CRC_SIZE;
    if version != LOG_VERSION || data.len() < total {
        return Decoded::Torn;
    }
    let body = &data[..HEADER_SIZE + len];
    let stored = &data[HEADER_SIZE + len..total];
    let crc = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    if crc32fast::hash(body) != crc {
        return Decoded::Torn;
    }
    match LogRecord::decode_payload(record_type, &body[HEADER_SIZE..]) {
        Ok(record) => Decoded::Record(record, total),
        Err(_) => Decoded::Torn,
    }
}

pub(crate) fn put_len(buf: &mut Vec<u8>, len: usize) -> DbResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| DbError::invalid_operation("log record field too large"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> DbResult<()> {
    put_len(buf, bytes.len())?;
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_lsn(buf: &mut Vec<u8>, lsn: Lsn) {
    buf.extend_from_slice(&lsn.file.to_le_bytes());
    buf.extend_from_slice(&lsn.offset.to_le_bytes());
}

pub(crate) struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> DbResult<&'a [u8]> {
        if self.cursor + n > self.payload.len() {
            return Err(DbError::corrupted("unexpected end of log record payload"));
        }
        let slice = &self.payload[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> DbResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> DbResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn lsn(&mut self) -> DbResult<Lsn> {
        Ok(Lsn::new(self.u32()?, self.u32()?))
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.cursor == self.payload.len()
    }

    pub(crate) fn bytes(&mut self) -> DbResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> DbResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DbError::corrupted("database name in log record is not UTF-8"))
    }

    fn finish(&self, record_type: LogRecordType) -> DbResult<()> {
        if self.cursor != self.payload.len() {
            return Err(DbError::corrupted(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                self.cursor,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commit() -> LogRecord {
        LogRecord::Commit {
            txn: 7,
            timestamp: 1_700_000_000,
            ops: vec![
                LogOp {
                    db: "userRoot/id2entry.db".into(),
                    key: 1u32.to_be_bytes().to_vec(),
                    after: Some(vec![b"dn: cn=one".to_vec()]),
                },
                LogOp {
                    db: "userRoot/cn.db".into(),
                    key: b"=one\0".to_vec(),
                    after: None,
                },
            ],
        }
    }

    #[test]
    fn commit_envelope_decodes() {
        let record = sample_commit();
        let bytes = record.encode().unwrap();
        match decode_envelope(&bytes) {
            Decoded::Record(decoded, len) => {
                assert_eq!(decoded, record);
                assert_eq!(len, bytes.len());
            }
            Decoded::Torn => panic!("valid record reported torn"),
        }
    }

    #[test]
    fn checkpoint_payload_decodes() {
        let record = LogRecord::Checkpoint {
            ckp_lsn: Lsn::new(3, 4096),
            oldest_active: Some(Lsn::new(2, 12)),
            timestamp: 42,
        };
        let payload = record.encode_payload().unwrap();
        let decoded = LogRecord::decode_payload(LogRecordType::Checkpoint, &payload).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn truncated_record_is_torn() {
        let bytes = sample_commit().encode().unwrap();
        assert!(matches!(
            decode_envelope(&bytes[..bytes.len() - 1]),
            Decoded::Torn
        ));
    }

    #[test]
    fn flipped_bit_is_torn() {
        let mut bytes = LogRecord::DbRemove { db: "a.db".into() }.encode().unwrap();
        bytes[HEADER_SIZE + 5] ^= 0x40;
        assert!(matches!(decode_envelope(&bytes), Decoded::Torn));
    }

    #[test]
    fn trailing_payload_bytes_are_rejected() {
        let mut payload = LogRecord::DbRemove { db: "a.db".into() }
            .encode_payload()
            .unwrap();
        payload.push(0);
        assert!(LogRecord::decode_payload(LogRecordType::DbRemove, &payload).is_err());
    }
}
