//! Handles backed by the embedded engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::{Cursor, Database, DbOpenFlags, DupCompare, Environment, PutMode, Txn};
use crate::error::{DbError, DbResult};
use crate::handle::{
    unsupported, BulkOp, Capabilities, CursorOp, DbCursor, DbHandle, DbImplementation, DbOp,
    ValueCodec,
};
use crate::value::{BulkWriter, DbValue};

const NAME: &str = "native";

/// The embedded engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeImplementation;

impl DbImplementation for NativeImplementation {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn open(
        &self,
        env: &Environment,
        name: &str,
        flags: DbOpenFlags,
    ) -> DbResult<Box<dyn DbHandle>> {
        let db = env.db_open(name, flags)?;
        Ok(Box::new(NativeHandle {
            db,
            codec: None,
            closed: AtomicBool::new(false),
        }))
    }

    fn remove(&self, env: &Environment, name: &str) -> DbResult<()> {
        env.db_remove(name)
    }
}

struct NativeHandle {
    db: Database,
    codec: Option<Arc<dyn ValueCodec>>,
    closed: AtomicBool,
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("db", &self.db.name())
            .field("codec", &self.codec.is_some())
            .finish_non_exhaustive()
    }
}

impl NativeHandle {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::invalid_operation(format!(
                "handle for {} is closed",
                self.db.name()
            )));
        }
        Ok(())
    }
}

fn encode(codec: Option<&Arc<dyn ValueCodec>>, data: &[u8]) -> DbResult<Vec<u8>> {
    match codec {
        Some(codec) => codec.encode(data),
        None => Ok(data.to_vec()),
    }
}

fn decode(codec: Option<&Arc<dyn ValueCodec>>, data: Vec<u8>) -> DbResult<Vec<u8>> {
    match codec {
        Some(codec) => codec.decode(&data),
        None => Ok(data),
    }
}

impl DbHandle for NativeHandle {
    fn name(&self) -> &str {
        self.db.name()
    }

    fn record(
        &self,
        op: DbOp,
        txn: Option<&Txn>,
        key: &[u8],
        data: &mut DbValue<'_>,
    ) -> DbResult<()> {
        self.ensure_open()?;
        let codec = self.codec.as_ref();
        match op {
            DbOp::Get => {
                let found = decode(codec, self.db.get(txn, key)?)?;
                data.set_buffer(&found)
            }
            DbOp::GetBoth => self.db.get_both(txn, key, &encode(codec, data.as_slice())?),
            DbOp::Put | DbOp::Add | DbOp::Replace | DbOp::AddDup => {
                let mode = match op {
                    DbOp::Add => PutMode::NoOverwrite,
                    DbOp::Replace => PutMode::Replace,
                    DbOp::AddDup => PutMode::NoDupData,
                    _ => PutMode::Overwrite,
                };
                self.db
                    .put_with(txn, key, &encode(codec, data.as_slice())?, mode)
            }
            DbOp::Del => self.db.del(txn, key),
            DbOp::DelPair => self.db.del_pair(txn, key, &encode(codec, data.as_slice())?),
        }
    }

    fn cursor(&self, txn: Option<&Txn>) -> DbResult<Box<dyn DbCursor>> {
        self.ensure_open()?;
        Ok(Box::new(NativeCursor {
            cursor: self.db.cursor(txn)?,
            codec: self.codec.clone(),
        }))
    }

    fn count(&self) -> DbResult<u64> {
        self.ensure_open()?;
        Ok(self.db.count())
    }

    fn set_dup_compare(&self, compare: DupCompare) -> DbResult<()> {
        self.ensure_open()?;
        if !self.db.flags().contains(DbOpenFlags::DUPSORT) {
            return Err(unsupported(NAME, "duplicate comparator without DUPSORT"));
        }
        self.db.set_dup_compare(compare);
        Ok(())
    }

    fn set_value_codec(&mut self, codec: Arc<dyn ValueCodec>) {
        self.codec = Some(codec);
    }

    fn close(&self) -> DbResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct NativeCursor {
    cursor: Cursor,
    codec: Option<Arc<dyn ValueCodec>>,
}

impl fmt::Debug for NativeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCursor")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl NativeCursor {
    fn recno_input(key: &DbValue<'_>) -> DbResult<u32> {
        let bytes: [u8; 4] = key.as_slice().try_into().map_err(|_| {
            DbError::invalid_operation(format!(
                "record number key must be 4 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(u32::from_ne_bytes(bytes))
    }
}

impl DbCursor for NativeCursor {
    fn move_to(
        &mut self,
        op: CursorOp,
        key: &mut DbValue<'_>,
        data: &mut DbValue<'_>,
    ) -> DbResult<()> {
        let codec = self.codec.as_ref();
        let (found_key, found_data) = match op {
            CursorOp::First => self.cursor.first()?,
            CursorOp::Last => self.cursor.last()?,
            CursorOp::Next => self.cursor.next()?,
            CursorOp::Prev => self.cursor.prev()?,
            CursorOp::NextDup => self.cursor.next_dup()?,
            CursorOp::PrevDup => self.cursor.prev_dup()?,
            CursorOp::NextNoDup => self.cursor.next_nodup()?,
            CursorOp::PrevNoDup => self.cursor.prev_nodup()?,
            CursorOp::Set => self.cursor.set(key.as_slice())?,
            CursorOp::SetRange => self.cursor.set_range(key.as_slice())?,
            CursorOp::GetBoth => {
                let stored = encode(codec, data.as_slice())?;
                self.cursor.get_both(key.as_slice(), &stored)?
            }
            CursorOp::GetBothRange => {
                let stored = encode(codec, data.as_slice())?;
                self.cursor.get_both_range(key.as_slice(), &stored)?
            }
            CursorOp::SetRecno => {
                let recno = Self::recno_input(key)?;
                self.cursor.set_recno(recno)?
            }
            CursorOp::Current => self.cursor.current()?,
            CursorOp::GetRecno => {
                let recno = self.cursor.recno()?;
                return data.set_buffer(&recno.to_ne_bytes());
            }
        };
        key.set_buffer(&found_key)?;
        data.set_buffer(&decode(codec, found_data)?)
    }

    fn put(&mut self, key: &[u8], data: &[u8], mode: PutMode) -> DbResult<()> {
        let stored = encode(self.codec.as_ref(), data)?;
        self.cursor.put(key, &stored, mode)
    }

    fn del(&mut self) -> DbResult<()> {
        self.cursor.del()
    }

    fn dup_count(&self) -> DbResult<usize> {
        self.cursor.count()
    }

    fn bulk(
        &mut self,
        op: BulkOp,
        key: &mut DbValue<'_>,
        block: &mut DbValue<'_>,
        budget: usize,
    ) -> DbResult<usize> {
        let codec = self.codec.clone();
        let mut writer = BulkWriter::new(op.kind(), budget);
        match op {
            BulkOp::Dups => {
                let (first_key, first) = if key.is_empty() {
                    self.cursor.current()?
                } else {
                    self.cursor.set(key.as_slice())?
                };
                writer.push_data(&decode(codec.as_ref(), first)?);
                loop {
                    match self.cursor.next_dup() {
                        Ok((_, data)) => {
                            if !writer.push_data(&decode(codec.as_ref(), data)?) {
                                self.cursor.prev_dup()?;
                                break;
                            }
                        }
                        Err(err) if err.is_not_found() => break,
                        Err(err) => return Err(err),
                    }
                }
                key.set_buffer(&first_key)?;
            }
            BulkOp::Records => loop {
                match self.cursor.next() {
                    Ok((k, data)) => {
                        if !writer.push_record(&k, &decode(codec.as_ref(), data)?) {
                            self.cursor.prev()?;
                            break;
                        }
                    }
                    Err(err) if err.is_not_found() => break,
                    Err(err) => return Err(err),
                }
            },
        }
        let items = writer.items();
        if items == 0 {
            return Err(DbError::NotFound);
        }
        writer.finish(block);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EnvBuilder, EnvConfig, EnvFlags};
    use tempfile::tempdir;

    fn env(dir: &std::path::Path) -> Environment {
        EnvBuilder::new(EnvConfig::default())
            .open(dir, EnvFlags::transactional())
            .unwrap()
    }

    #[test]
    fn bulk_records_resume_where_the_block_stopped() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let handle = NativeImplementation
            .open(&env, "id2entry.db", DbOpenFlags::CREATE)
            .unwrap();
        for id in 0u32..10 {
            handle.put(None, &id.to_be_bytes(), &[b'e'; 20]).unwrap();
        }
        let mut cursor = handle.cursor(None).unwrap();
        let mut seen = 0;
        loop {
            let (mut key, mut block) = (DbValue::new(), DbValue::new());
            match cursor.bulk(BulkOp::Records, &mut key, &mut block, 100) {
                Ok(items) => {
                    assert!(items >= 1);
                    block.start_bulk().unwrap();
                    while let Some((_, data)) = block.next_record().unwrap() {
                        assert_eq!(data.len(), 20);
                        seen += 1;
                    }
                }
                Err(err) if err.is_not_found() => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(seen, 10);
        env.close().unwrap();
    }

    #[test]
    fn bulk_dups_of_one_key() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let handle = NativeImplementation
            .open(&env, "objectclass.db", DbOpenFlags::CREATE | DbOpenFlags::DUPSORT)
            .unwrap();
        for id in [b"3", b"1", b"2"] {
            handle.put(None, b"=person", id).unwrap();
        }
        handle.put(None, b"=top", b"9").unwrap();
        let mut cursor = handle.cursor(None).unwrap();
        let mut key = DbValue::borrowed(b"=person");
        let mut block = DbValue::new();
        assert_eq!(
            cursor
                .bulk(BulkOp::Dups, &mut key, &mut block, DEFAULT_BULK)
                .unwrap(),
            3
        );
        block.start_bulk().unwrap();
        let mut ids = Vec::new();
        while let Some(id) = block.next_data().unwrap() {
            ids.push(id.to_vec());
        }
        assert_eq!(ids, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert!(block.next_record().is_err());
        env.close().unwrap();
    }

    const DEFAULT_BULK: usize = crate::handle::DEFAULT_BULK_BUDGET;

    #[test]
    fn capability_gaps_are_unsupported() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let handle = NativeImplementation
            .open(&env, "plain.db", DbOpenFlags::CREATE)
            .unwrap();
        handle.put(None, b"a", b"1").unwrap();
        assert!(matches!(
            handle.set_dup_compare(Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))),
            Err(DbError::Unsupported { .. })
        ));
        let mut cursor = handle.cursor(None).unwrap();
        let mut key = DbValue::owned(1u32.to_ne_bytes().to_vec());
        let mut data = DbValue::new();
        assert!(matches!(
            cursor.move_to(CursorOp::SetRecno, &mut key, &mut data),
            Err(DbError::Unsupported { .. })
        ));
        env.close().unwrap();
    }

    #[test]
    fn record_numbers_round_trip() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let handle = NativeImplementation
            .open(&env, "vlv.db", DbOpenFlags::CREATE | DbOpenFlags::RECNUM)
            .unwrap();
        for k in [b"a", b"b", b"c"] {
            handle.put(None, k, b"x").unwrap();
        }
        let mut cursor = handle.cursor(None).unwrap();
        let mut key = DbValue::owned(2u32.to_ne_bytes().to_vec());
        let mut data = DbValue::new();
        cursor.move_to(CursorOp::SetRecno, &mut key, &mut data).unwrap();
        assert_eq!(key.as_slice(), b"b");
        cursor.move_to(CursorOp::GetRecno, &mut key, &mut data).unwrap();
        assert_eq!(data.as_slice(), 2u32.to_ne_bytes());
        env.close().unwrap();
    }

    #[test]
    fn closed_handle_refuses_work() {
        let dir = tempdir().unwrap();
        let env = env(dir.path());
        let handle = NativeImplementation
            .open(&env, "t.db", DbOpenFlags::CREATE)
            .unwrap();
        handle.close().unwrap();
        assert!(handle.put(None, b"k", b"v").is_err());
        env.close().unwrap();
    }
}
