//! Sequential reads over log segments.

use crate::engine::log::record::{decode_envelope, Decoded, LogRecord};
use crate::error::DbResult;
use dblayer_storage::StorageBackend;

/// Walks the records of one segment in order.
///
/// The segment is read into memory once; segments are bounded by the
/// configured maximum log file size. Iteration stops at the first record
/// that is incomplete or fails its checksum, and [`SegmentReader::valid_end`]
/// then reports where the intact prefix ends.
pub(crate) struct SegmentReader {
    data: Vec<u8>,
    pos: usize,
    torn: bool,
}

impl SegmentReader {
    /// Reads `segment` starting at byte `start`.
    pub(crate) fn new(segment: &dyn StorageBackend, start: u32) -> DbResult<Self> {
        let data = segment.read_all()?;
        let pos = (start as usize).min(data.len());
        Ok(Self {
            data,
            pos,
            torn: false,
        })
    }

    /// Offset just past the last intact record read so far.
    pub(crate) fn valid_end(&self) -> u32 {
        self.pos as u32
    }

    /// True when iteration stopped on a damaged record rather than at the
    /// end of the segment.
    pub(crate) fn is_torn(&self) -> bool {
        self.torn
    }

    /// Total bytes in the segment.
    pub(crate) fn len(&self) -> u32 {
        self.data.len() as u32
    }
}

impl Iterator for SegmentReader {
    type Item = (u32, LogRecord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.torn || self.pos >= self.data.len() {
            return None;
        }
        match decode_envelope(&self.data[self.pos..]) {
            Decoded::Record(record, len) => {
                let offset = self.pos as u32;
                self.pos += len;
                Some((offset, record))
            }
            Decoded::Torn => {
                self.torn = true;
                None
            }
        }
    }
}
