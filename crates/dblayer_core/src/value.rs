//! Keys and records crossing the database boundary.
//!
//! A [`DbValue`] tracks who owns its bytes. Caller memory is either
//! borrowed read-only ([`DbValue::borrowed`]) or lent as a fixed-size output
//! buffer ([`DbValue::user_mem`]); the engine never grows or frees either.
//! Owned values are plain vectors that may be regrown.
//!
//! A value filled by a bulk cursor read holds a block of several items and
//! is walked with [`DbValue::start_bulk`] plus [`DbValue::next_data`] or
//! [`DbValue::next_record`].

use crate::error::{DbError, DbResult};

/// Largest number of parts [`DbValue::concat`] joins.
pub const MAX_CONCAT_PARTS: usize = 3;

/// End-of-block marker in a bulk block.
const BULK_END: u32 = u32::MAX;

/// Storage behind a value.
#[derive(Debug, Default)]
enum ValueData<'a> {
    #[default]
    Empty,
    Borrowed(&'a [u8]),
    UserMem {
        buf: &'a mut [u8],
        len: usize,
    },
    Owned(Vec<u8>),
}

/// Layout of a bulk block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    /// Data items only (all duplicates of one key).
    Data,
    /// Key and data pairs.
    KeyData,
}

#[derive(Debug, Clone, Copy)]
struct BulkState {
    kind: BulkKind,
    pos: usize,
}

/// A key or record buffer.
#[derive(Debug, Default)]
pub struct DbValue<'a> {
    data: ValueData<'a>,
    bulk: Option<BulkState>,
}

impl<'a> DbValue<'a> {
    /// An empty value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps caller-owned bytes; never freed or modified.
    #[must_use]
    pub fn borrowed(bytes: &'a [u8]) -> Self {
        Self {
            data: ValueData::Borrowed(bytes),
            bulk: None,
        }
    }

    /// Lends a fixed-capacity output buffer.
    ///
    /// Results that do not fit fail with [`DbError::BufferTooSmall`].
    #[must_use]
    pub fn user_mem(buf: &'a mut [u8]) -> Self {
        Self {
            data: ValueData::UserMem { buf, len: 0 },
            bulk: None,
        }
    }

    /// Takes ownership of `bytes`.
    #[must_use]
    pub fn owned(bytes: Vec<u8>) -> Self {
        Self {
            data: ValueData::Owned(bytes),
            bulk: None,
        }
    }

    /// Points the value at caller-owned bytes, releasing any owned memory.
    pub fn set_borrowed(&mut self, bytes: &'a [u8]) {
        self.data = ValueData::Borrowed(bytes);
        self.bulk = None;
    }

    /// Gives the value ownership of `bytes`.
    pub fn set_owned(&mut self, bytes: Vec<u8>) {
        self.data = ValueData::Owned(bytes);
        self.bulk = None;
    }

    /// Stores a result.
    ///
    /// A user buffer receives a copy when it fits; borrowed or empty values
    /// become owned; an owned value reuses its allocation.
    ///
    /// # Errors
    ///
    /// [`DbError::BufferTooSmall`] when a user buffer cannot hold `bytes`.
    pub fn set_buffer(&mut self, bytes: &[u8]) -> DbResult<()> {
        self.bulk = None;
        match &mut self.data {
            ValueData::UserMem { buf, len } => {
                if bytes.len() > buf.len() {
                    return Err(DbError::BufferTooSmall {
                        needed: bytes.len(),
                    });
                }
                buf[..bytes.len()].copy_from_slice(bytes);
                *len = bytes.len();
            }
            ValueData::Owned(vec) => {
                vec.clear();
                vec.extend_from_slice(bytes);
            }
            ValueData::Empty | ValueData::Borrowed(_) => {
                self.data = ValueData::Owned(bytes.to_vec());
            }
        }
        Ok(())
    }

    /// Releases owned memory and resets the length.
    ///
    /// Borrowed memory is only forgotten and a user buffer is kept for
    /// reuse, so calling this twice is harmless.
    pub fn free(&mut self) {
        self.bulk = None;
        match &mut self.data {
            ValueData::UserMem { len, .. } => *len = 0,
            _ => self.data = ValueData::Empty,
        }
    }

    /// Builds a NUL-terminated composite key from up to three parts.
    ///
    /// The key is assembled in `scratch` when it fits, otherwise in a new
    /// allocation. A terminator is appended unless the last non-empty part
    /// already ends with one.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] for more than [`MAX_CONCAT_PARTS`] parts.
    pub fn concat(&mut self, scratch: &'a mut [u8], parts: &[&[u8]]) -> DbResult<()> {
        if parts.len() > MAX_CONCAT_PARTS {
            return Err(DbError::invalid_operation(format!(
                "cannot concatenate {} parts",
                parts.len()
            )));
        }
        let terminated = parts
            .iter()
            .rev()
            .find(|part| !part.is_empty())
            .is_some_and(|part| part.last() == Some(&0));
        let body: usize = parts.iter().map(|part| part.len()).sum();
        let total = body + usize::from(!terminated);

        self.bulk = None;
        if total <= scratch.len() {
            let mut pos = 0;
            for part in parts {
                scratch[pos..pos + part.len()].copy_from_slice(part);
                pos += part.len();
            }
            if !terminated {
                scratch[pos] = 0;
            }
            self.data = ValueData::UserMem {
                buf: scratch,
                len: total,
            };
        } else {
            let mut key = Vec::with_capacity(total);
            for part in parts {
                key.extend_from_slice(part);
            }
            if !terminated {
                key.push(0);
            }
            self.data = ValueData::Owned(key);
        }
        Ok(())
    }

    /// The bytes currently held.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            ValueData::Empty => &[],
            ValueData::Borrowed(bytes) => bytes,
            ValueData::UserMem { buf, len } => &buf[..*len],
            ValueData::Owned(vec) => vec,
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True when no bytes are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many bytes the value can hold without reallocating.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.data {
            ValueData::Empty => 0,
            ValueData::Borrowed(bytes) => bytes.len(),
            ValueData::UserMem { buf, .. } => buf.len(),
            ValueData::Owned(vec) => vec.capacity(),
        }
    }

    /// True when the value owns (and will free) its bytes.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self.data, ValueData::Owned(_))
    }

    /// True when the capacity cannot grow.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        matches!(self.data, ValueData::Borrowed(_) | ValueData::UserMem { .. })
    }

    /// Copies or moves the bytes out.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        match self.data {
            ValueData::Owned(vec) => vec,
            other => DbValue {
                data: other,
                bulk: None,
            }
            .as_slice()
            .to_vec(),
        }
    }

    /// Fills the value with a bulk block of `kind`.
    pub(crate) fn set_bulk(&mut self, kind: BulkKind, block: Vec<u8>) {
        self.data = ValueData::Owned(block);
        self.bulk = Some(BulkState { kind, pos: 0 });
    }

    /// The layout of the block held, if this is a bulk value.
    #[must_use]
    pub fn bulk_kind(&self) -> Option<BulkKind> {
        self.bulk.map(|state| state.kind)
    }

    /// Rewinds bulk iteration to the first item.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] if the value holds no bulk block.
    pub fn start_bulk(&mut self) -> DbResult<()> {
        let state = self
            .bulk
            .as_mut()
            .ok_or_else(|| DbError::invalid_operation("value does not hold a bulk block"))?;
        state.pos = 0;
        Ok(())
    }

    /// Next item of a data-only block, `None` at the end.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] if the block holds key/data pairs or
    /// is malformed.
    pub fn next_data(&mut self) -> DbResult<Option<&[u8]>> {
        let mut pos = self.bulk_position(BulkKind::Data)?;
        let item = read_item(self.as_slice(), &mut pos)?;
        if let Some(state) = self.bulk.as_mut() {
            state.pos = pos;
        }
        Ok(item.map(|range| &self.as_slice()[range]))
    }

    /// Next pair of a key/data block, `None` at the end.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidOperation`] if the block holds data-only items or
    /// is malformed.
    pub fn next_record(&mut self) -> DbResult<Option<(&[u8], &[u8])>> {
        let mut pos = self.bulk_position(BulkKind::KeyData)?;
        let block = self.as_slice();
        let Some(key) = read_item(block, &mut pos)? else {
            return Ok(None);
        };
        let data = read_item(block, &mut pos)?
            .ok_or_else(|| DbError::invalid_operation("bulk block ends between key and data"))?;
        if let Some(state) = self.bulk.as_mut() {
            state.pos = pos;
        }
        let block = self.as_slice();
        Ok(Some((&block[key], &block[data])))
    }

    fn bulk_position(&self, expected: BulkKind) -> DbResult<usize> {
        match self.bulk {
            Some(state) if state.kind == expected => Ok(state.pos),
            Some(state) => Err(DbError::invalid_operation(format!(
                "bulk block holds {:?} items, not {expected:?}",
                state.kind
            ))),
            None => Err(DbError::invalid_operation("value does not hold a bulk block")),
        }
    }
}

/// Reads one length-prefixed item, returning its byte range.
fn read_item(block: &[u8], pos: &mut usize) -> DbResult<Option<std::ops::Range<usize>>> {
    let header = block
        .get(*pos..*pos + 4)
        .ok_or_else(|| DbError::invalid_operation("bulk block is truncated"))?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len == BULK_END {
        return Ok(None);
    }
    let start = *pos + 4;
    let end = start + len as usize;
    if end > block.len() {
        return Err(DbError::invalid_operation("bulk item overruns its block"));
    }
    *pos = end;
    Ok(Some(start..end))
}

/// Accumulates items into a bulk block no larger than a byte budget.
#[derive(Debug)]
pub(crate) struct BulkWriter {
    kind: BulkKind,
    block: Vec<u8>,
    budget: usize,
    items: usize,
}

impl BulkWriter {
    pub(crate) fn new(kind: BulkKind, budget: usize) -> Self {
        Self {
            kind,
            block: Vec::new(),
            budget,
            items: 0,
        }
    }

    /// Adds a data item; false when the budget is exhausted.
    pub(crate) fn push_data(&mut self, data: &[u8]) -> bool {
        debug_assert_eq!(self.kind, BulkKind::Data);
        self.push_parts(&[data])
    }

    /// Adds a key/data pair; false when the budget is exhausted.
    pub(crate) fn push_record(&mut self, key: &[u8], data: &[u8]) -> bool {
        debug_assert_eq!(self.kind, BulkKind::KeyData);
        self.push_parts(&[key, data])
    }

    fn push_parts(&mut self, parts: &[&[u8]]) -> bool {
        let needed: usize = parts.iter().map(|part| 4 + part.len()).sum();
        // Always accept one item so a large record still makes progress.
        if self.items > 0 && self.block.len() + needed + 4 > self.budget {
            return false;
        }
        for part in parts {
            self.block
                .extend_from_slice(&(part.len() as u32).to_le_bytes());
            self.block.extend_from_slice(part);
        }
        self.items += 1;
        true
    }

    pub(crate) fn items(&self) -> usize {
        self.items
    }

    /// Terminates the block and stores it in `value`.
    pub(crate) fn finish(mut self, value: &mut DbValue<'_>) {
        self.block.extend_from_slice(&BULK_END.to_le_bytes());
        value.set_bulk(self.kind, self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_value_is_fixed_and_never_owned() {
        let bytes = b"cn=admin".to_vec();
        let mut value = DbValue::borrowed(&bytes);
        assert!(value.is_fixed());
        assert!(!value.is_owned());
        value.free();
        value.free();
        assert!(value.is_empty());
        assert_eq!(bytes, b"cn=admin");
    }

    #[test]
    fn user_mem_reports_small_buffer() {
        let mut buf = [0u8; 4];
        let mut value = DbValue::user_mem(&mut buf);
        value.set_buffer(b"abc").unwrap();
        assert_eq!(value.as_slice(), b"abc");

        let err = value.set_buffer(b"too long").unwrap_err();
        assert!(matches!(err, DbError::BufferTooSmall { needed: 8 }));
        assert_eq!(value.as_slice(), b"abc");
    }

    #[test]
    fn set_buffer_turns_borrowed_into_owned() {
        let mut value = DbValue::borrowed(b"key");
        value.set_buffer(b"result").unwrap();
        assert!(value.is_owned());
        assert_eq!(value.into_vec(), b"result");
    }

    #[test]
    fn concat_uses_scratch_when_it_fits() {
        let mut scratch = [0u8; 16];
        let mut key = DbValue::new();
        key.concat(&mut scratch, &[b"=", b"cn", b"bob"]).unwrap();
        assert_eq!(key.as_slice(), b"=cnbob\0");
        assert!(!key.is_owned());
    }

    #[test]
    fn concat_allocates_when_scratch_is_small() {
        let mut scratch = [0u8; 4];
        let mut key = DbValue::new();
        key.concat(&mut scratch, &[b"=uid", b"someone"]).unwrap();
        assert!(key.is_owned());
        assert_eq!(key.as_slice(), b"=uidsomeone\0");
    }

    #[test]
    fn concat_skips_terminator_when_present() {
        let mut scratch = [0u8; 16];
        let mut key = DbValue::new();
        key.concat(&mut scratch, &[b"+", b"abc\0", b""]).unwrap();
        assert_eq!(key.as_slice(), b"+abc\0");

        let mut scratch = [0u8; 16];
        let mut empty = DbValue::new();
        empty.concat(&mut scratch, &[b"", b""]).unwrap();
        assert_eq!(empty.as_slice(), b"\0");
    }

    #[test]
    fn concat_rejects_four_parts() {
        let mut scratch = [0u8; 16];
        let mut key = DbValue::new();
        assert!(key.concat(&mut scratch, &[b"a", b"b", b"c", b"d"]).is_err());
    }

    #[test]
    fn bulk_data_iteration() {
        let mut writer = BulkWriter::new(BulkKind::Data, 1024);
        assert!(writer.push_data(b"1"));
        assert!(writer.push_data(b"22"));
        let mut value = DbValue::new();
        writer.finish(&mut value);

        value.start_bulk().unwrap();
        assert_eq!(value.next_data().unwrap(), Some(&b"1"[..]));
        assert_eq!(value.next_data().unwrap(), Some(&b"22"[..]));
        assert_eq!(value.next_data().unwrap(), None);

        value.start_bulk().unwrap();
        assert_eq!(value.next_data().unwrap(), Some(&b"1"[..]));
    }

    #[test]
    fn bulk_kind_mismatch_is_rejected() {
        let mut writer = BulkWriter::new(BulkKind::KeyData, 1024);
        writer.push_record(b"k", b"v");
        let mut value = DbValue::new();
        writer.finish(&mut value);

        assert!(value.next_data().is_err());
        assert_eq!(value.next_record().unwrap(), Some((&b"k"[..], &b"v"[..])));
        assert_eq!(value.next_record().unwrap(), None);
        assert!(DbValue::owned(vec![1]).start_bulk().is_err());
    }

    #[test]
    fn bulk_writer_respects_budget() {
        let mut writer = BulkWriter::new(BulkKind::Data, 16);
        assert!(writer.push_data(&[7u8; 32]));
        assert!(!writer.push_data(b"x"));
        assert_eq!(writer.items(), 1);
    }
}
