//! Database handles behind a pluggable implementation.
//!
//! The storage layer never talks to the engine's [`Database`] or
//! [`Cursor`] types directly. It asks a [`DbImplementation`] for a
//! [`DbHandle`] and drives every record and cursor operation through the
//! operation enums below, so another engine can be slotted in without the
//! callers changing.
//!
//! Every operation returns a [`DbResult`]; a missing key is
//! [`DbError::NotFound`], which callers must tell apart from real failures
//! with [`DbError::is_not_found`]. An implementation that lacks a
//! capability answers [`DbError::Unsupported`].
//!
//! [`Database`]: crate::engine::Database
//! [`Cursor`]: crate::engine::Cursor

pub mod native;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::engine::{DbOpenFlags, DupCompare, Environment, PutMode, Txn};
use crate::error::{DbError, DbResult};
use crate::value::{BulkKind, DbValue};

pub use native::NativeImplementation;

/// Default byte budget of one bulk block.
pub const DEFAULT_BULK_BUDGET: usize = 64 * 1024;

bitflags! {
    /// Optional features of an implementation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Bulk cursor reads.
        const BULK = 0x0001;
        /// Positioning by record number.
        const RECNUM = 0x0002;
        /// Custom ordering of duplicate data items.
        const DUP_COMPARE = 0x0004;
        /// Writes through a cursor.
        const CURSOR_WRITE = 0x0008;
    }
}

/// Single-record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
    /// Fetch the first data item of the key into `data`.
    Get,
    /// Succeed only if the exact pair is stored.
    GetBoth,
    /// Store, replacing the data of a non-duplicate key.
    Put,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store only if the exact pair is absent.
    AddDup,
    /// Remove the key with all its data.
    Del,
    /// Remove one pair.
    DelPair,
}

/// Cursor movements.
///
/// Inputs are read from the key and data values the caller passes (the
/// record number of [`CursorOp::SetRecno`] as a native-endian `u32` in the
/// key); results are written back into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// First pair.
    First,
    /// Last pair.
    Last,
    /// Next pair.
    Next,
    /// Previous pair.
    Prev,
    /// Next data item of the current key.
    NextDup,
    /// Previous data item of the current key.
    PrevDup,
    /// First pair of the next key.
    NextNoDup,
    /// Last pair of the previous key.
    PrevNoDup,
    /// First pair of the key.
    Set,
    /// First pair at or after the key.
    SetRange,
    /// The exact pair.
    GetBoth,
    /// First pair of the key with data at or after the given data.
    GetBothRange,
    /// Pair at a 1-based record number.
    SetRecno,
    /// Pair under the cursor.
    Current,
    /// Record number of the pair under the cursor, written to `data`.
    GetRecno,
}

/// Bulk cursor reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Every data item of one key: the key passed in, or the current key
    /// when the key is empty.
    Dups,
    /// Pairs following the cursor position.
    Records,
}

impl BulkOp {
    /// Block layout the operation produces.
    #[must_use]
    pub const fn kind(self) -> BulkKind {
        match self {
            Self::Dups => BulkKind::Data,
            Self::Records => BulkKind::KeyData,
        }
    }
}

/// Transforms data values on their way into and out of storage, e.g.
/// attribute encryption.
pub trait ValueCodec: Send + Sync + fmt::Debug {
    /// Applied before a value is stored.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn encode(&self, plain: &[u8]) -> DbResult<Vec<u8>>;

    /// Applied after a value is read.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn decode(&self, stored: &[u8]) -> DbResult<Vec<u8>>;
}

/// A storage engine able to open database handles.
pub trait DbImplementation: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Features the handles of this implementation provide.
    fn capabilities(&self) -> Capabilities;

    /// Opens (or creates, with [`DbOpenFlags::CREATE`]) the database `name`.
    ///
    /// # Errors
    ///
    /// [`DbError::DatabaseNotFound`] when the file is missing and creation
    /// was not requested, or any engine failure.
    fn open(&self, env: &Environment, name: &str, flags: DbOpenFlags)
        -> DbResult<Box<dyn DbHandle>>;

    /// Deletes the database `name`.
    ///
    /// # Errors
    ///
    /// [`DbError::DatabaseNotFound`] when there is no such database.
    fn remove(&self, env: &Environment, name: &str) -> DbResult<()>;
}

/// An open database.
pub trait DbHandle: Send + Sync + fmt::Debug {
    /// Database name.
    fn name(&self) -> &str;

    /// Runs a single-record operation.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`], [`DbError::KeyExists`], lock conflicts, or
    /// engine failures.
    fn record(&self, op: DbOp, txn: Option<&Txn>, key: &[u8], data: &mut DbValue<'_>)
        -> DbResult<()>;

    /// Opens a cursor, inside `txn` when given.
    ///
    /// # Errors
    ///
    /// Fails when the transaction or environment is no longer usable.
    fn cursor(&self, txn: Option<&Txn>) -> DbResult<Box<dyn DbCursor>>;

    /// Number of stored pairs.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn count(&self) -> DbResult<u64>;

    /// Sets the order of duplicate data items.
    ///
    /// # Errors
    ///
    /// [`DbError::Unsupported`] without [`Capabilities::DUP_COMPARE`].
    fn set_dup_compare(&self, compare: DupCompare) -> DbResult<()>;

    /// Routes data values through `codec` from now on.
    fn set_value_codec(&mut self, codec: Arc<dyn ValueCodec>);

    /// Releases the handle. Further use is an error.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn close(&self) -> DbResult<()>;
}

/// A position in an open database.
pub trait DbCursor: Send + fmt::Debug {
    /// Moves the cursor and reports the pair found.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`] when the move has no target.
    fn move_to(&mut self, op: CursorOp, key: &mut DbValue<'_>, data: &mut DbValue<'_>)
        -> DbResult<()>;

    /// Stores a pair and moves onto it.
    ///
    /// # Errors
    ///
    /// As [`DbHandle::record`].
    fn put(&mut self, key: &[u8], data: &[u8], mode: PutMode) -> DbResult<()>;

    /// Deletes the pair under the cursor.
    ///
    /// # Errors
    ///
    /// Fails when the cursor is not positioned.
    fn del(&mut self) -> DbResult<()>;

    /// Number of data items under the current key.
    ///
    /// # Errors
    ///
    /// Fails when the cursor is not positioned.
    fn dup_count(&self) -> DbResult<usize>;

    /// Fills `block` with as many items as fit in `budget` bytes and
    /// returns how many were read.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`] when nothing was read.
    fn bulk(
        &mut self,
        op: BulkOp,
        key: &mut DbValue<'_>,
        block: &mut DbValue<'_>,
        budget: usize,
    ) -> DbResult<usize>;
}

impl dyn DbHandle {
    /// First data item stored under `key`.
    ///
    /// # Errors
    ///
    /// See [`DbHandle::record`].
    pub fn get(&self, txn: Option<&Txn>, key: &[u8], data: &mut DbValue<'_>) -> DbResult<()> {
        self.record(DbOp::Get, txn, key, data)
    }

    /// Stores a pair.
    ///
    /// # Errors
    ///
    /// See [`DbHandle::record`].
    pub fn put(&self, txn: Option<&Txn>, key: &[u8], data: &[u8]) -> DbResult<()> {
        self.record(DbOp::Put, txn, key, &mut DbValue::borrowed(data))
    }

    /// Stores a pair only if the key is absent.
    ///
    /// # Errors
    ///
    /// [`DbError::KeyExists`] if it is present.
    pub fn add(&self, txn: Option<&Txn>, key: &[u8], data: &[u8]) -> DbResult<()> {
        self.record(DbOp::Add, txn, key, &mut DbValue::borrowed(data))
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`] if it is absent.
    pub fn del(&self, txn: Option<&Txn>, key: &[u8]) -> DbResult<()> {
        self.record(DbOp::Del, txn, key, &mut DbValue::new())
    }
}

/// Error for an operation the handle cannot perform.
///
/// [`DbOp`] and [`CursorOp`] are matched exhaustively by every
/// implementation, so an unwired operation code does not compile. What
/// reaches this point is a capability the opened table lacks (record
/// numbers without `RECNUM`, a comparator without `DUPSORT`), which depends
/// on how the table was created and is reported in every build.
pub(crate) fn unsupported(implementation: &str, what: impl fmt::Display) -> DbError {
    tracing::error!(implementation, operation = %what, "operation not supported by this table");
    DbError::unsupported(format!("{what} on {implementation}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EnvBuilder, EnvConfig, EnvFlags};
    use tempfile::tempdir;

    #[derive(Debug)]
    struct Reverse;

    impl ValueCodec for Reverse {
        fn encode(&self, plain: &[u8]) -> DbResult<Vec<u8>> {
            Ok(plain.iter().rev().copied().collect())
        }

        fn decode(&self, stored: &[u8]) -> DbResult<Vec<u8>> {
            self.encode(stored)
        }
    }

    fn env(dir: &std::path::Path) -> Environment {
        EnvBuilder::new(EnvConfig::default())
            .open(dir, EnvFlags::transactional())
            .unwrap()
    }

    #[test]
    fn callers_go_through_the_trait() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let implementation: Arc<dyn DbImplementation> = Arc::new(NativeImplementation);
        let handle = implementation
            .open(&env, "cn.db", DbOpenFlags::CREATE)
            .unwrap();
        handle.put(None, b"=cn=admin", b"1").unwrap();
        assert!(matches!(
            handle.add(None, b"=cn=admin", b"2"),
            Err(DbError::KeyExists)
        ));
        let mut out = DbValue::new();
        handle.get(None, b"=cn=admin", &mut out).unwrap();
        assert_eq!(out.as_slice(), b"1");
        handle.del(None, b"=cn=admin").unwrap();
        assert!(handle.get(None, b"=cn=admin", &mut out).unwrap_err().is_not_found());
        handle.close().unwrap();
        env.close().unwrap();
    }

    #[test]
    fn codec_sees_every_value() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let mut handle = NativeImplementation
            .open(&env, "secret.db", DbOpenFlags::CREATE)
            .unwrap();
        handle.set_value_codec(Arc::new(Reverse));
        handle.put(None, b"k", b"abc").unwrap();

        let raw = env.db_open("secret.db", DbOpenFlags::empty()).unwrap();
        assert_eq!(raw.get(None, b"k").unwrap(), b"cba");

        let mut out = DbValue::new();
        handle.get(None, b"k", &mut out).unwrap();
        assert_eq!(out.as_slice(), b"abc");

        let mut cursor = handle.cursor(None).unwrap();
        let (mut key, mut data) = (DbValue::new(), DbValue::new());
        cursor.move_to(CursorOp::First, &mut key, &mut data).unwrap();
        assert_eq!(data.as_slice(), b"abc");
        env.close().unwrap();
    }
}
