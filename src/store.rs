//! Ledger store: sled keyspace, exclusive row locks, and atomic commit.
//!
//! Every row lives in the default tree under `"<prefix>/<id>"` and is encoded
//! with minicbor. A [`Txn`] takes exclusive locks on the rows it means to
//! mutate (held until it is committed or dropped), stages its writes in
//! memory, and applies them as a single `sled::Batch` on commit. Dropping a
//! `Txn` without committing discards its writes.
//!
//! Rows may also file themselves under secondary index keys. Index entries
//! live at `"index/<prefix>/<key>/<id>"` and are staged in the same batch as
//! the row itself, so a lookup by index never sees a row half written.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sled::Batch;
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::types::EntityKind;
use crate::witness::Witness;

const WITNESS_PREFIX: &str = "witness";
const INDEX_PREFIX: &str = "index";

/// Upper bound on any single lock wait, whatever the configured timeout.
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(60 * 60);

/// A persisted entity addressable by id.
pub trait Row: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const PREFIX: &'static str;
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Secondary index keys this row is filed under. They must not change
    /// over the row's lifetime.
    fn index_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

pub(crate) fn row_key(prefix: &str, id: &str) -> String {
    format!("{prefix}/{id}")
}

fn index_prefix(prefix: &str, index_key: &str) -> String {
    format!("{INDEX_PREFIX}/{prefix}/{index_key}/")
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| LedgerError::Encoding(e.to_string()))
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T> {
    Ok(minicbor::decode(bytes)?)
}

/// Exclusive, in-process row locks with a bounded wait.
#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    fn acquire(&self, key: &str, timeout: Duration) -> Result<()> {
        let timeout = timeout.min(MAX_LOCK_WAIT);
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(Instant::now);
        let mut held = self.held.lock();

        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                warn!(key, ?timeout, "row lock wait timed out");
                return Err(LedgerError::LockTimeout {
                    key: key.to_string(),
                });
            }
        }
        held.insert(key.to_string());

        Ok(())
    }

    fn release(&self, keys: impl IntoIterator<Item = String>) {
        let mut held = self.held.lock();
        for key in keys {
            held.remove(&key);
        }
        drop(held);
        self.released.notify_all();
    }
}

#[derive(Clone)]
pub struct Store {
    db: Arc<sled::Db>,
    locks: Arc<LockTable>,
    lock_timeout: Duration,
}

impl Store {
    pub fn new(db: Arc<sled::Db>, lock_timeout: Duration) -> Self {
        Self {
            db,
            locks: Arc::new(LockTable::default()),
            lock_timeout,
        }
    }

    pub fn begin(&self) -> Txn<'_> {
        Txn {
            store: self,
            held: Vec::new(),
            staged: BTreeMap::new(),
        }
    }

    /// Unlocked point read of the last committed version.
    pub fn get<T: Row>(&self, id: &str) -> Result<Option<T>> {
        match self.db.get(row_key(T::PREFIX, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unlocked read of every committed row of one kind.
    pub fn scan<T: Row>(&self) -> Result<Vec<T>> {
        self.begin().scan()
    }

    /// Witnesses recorded against `entity_id`, oldest first.
    pub fn history(&self, entity_id: &str) -> Result<Vec<Witness>> {
        let prefix = format!("{WITNESS_PREFIX}/{entity_id}/");
        self.db
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// A unit of work over the store. See the module docs for the locking rules.
pub struct Txn<'s> {
    store: &'s Store,
    held: Vec<String>,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'s> Txn<'s> {
    /// Take the exclusive lock named `key`. Re-entrant within this `Txn`.
    pub fn lock_key(&mut self, key: &str) -> Result<()> {
        if self.held.iter().any(|held| held == key) {
            return Ok(());
        }
        self.store.locks.acquire(key, self.store.lock_timeout)?;
        debug!(key, "lock acquired");
        self.held.push(key.to_string());

        Ok(())
    }

    /// Lock a row by id without reading it.
    pub fn lock_row<T: Row>(&mut self, id: &str) -> Result<()> {
        self.lock_key(&row_key(T::PREFIX, id))
    }

    /// Locked fetch: lock the row, then read it.
    pub fn lock<T: Row>(&mut self, id: &str) -> Result<T> {
        self.lock_row::<T>(id)?;
        self.read(id)?
            .ok_or_else(|| LedgerError::not_found(T::KIND, id))
    }

    /// Locked fetch of several rows, always in ascending id order.
    pub fn lock_all<T: Row>(&mut self, ids: &[String]) -> Result<Vec<T>> {
        let mut ordered: Vec<&String> = ids.iter().collect();
        ordered.sort();
        ordered.dedup();

        ordered.into_iter().map(|id| self.lock(id)).collect()
    }

    /// Read through staged writes, falling back to the committed row.
    pub fn read<T: Row>(&self, id: &str) -> Result<Option<T>> {
        match self.staged.get(&row_key(T::PREFIX, id)) {
            Some(Some(bytes)) => Ok(Some(decode(bytes)?)),
            Some(None) => Ok(None),
            None => self.store.get(id),
        }
    }

    /// Committed entries under `prefix` with staged writes laid over them.
    fn merged(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for entry in self.store.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            entries.insert(String::from_utf8_lossy(&key).into_owned(), value.to_vec());
        }
        for (key, value) in self.staged.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(bytes) => entries.insert(key.clone(), bytes.clone()),
                None => entries.remove(key),
            };
        }

        Ok(entries)
    }

    pub fn scan<T: Row>(&self) -> Result<Vec<T>> {
        let prefix = format!("{}/", T::PREFIX);
        self.merged(&prefix)?
            .values()
            .map(|bytes| decode(bytes))
            .collect()
    }

    /// Rows filed under `index_key`, in id order.
    pub fn lookup<T: Row>(&self, index_key: &str) -> Result<Vec<T>> {
        let prefix = index_prefix(T::PREFIX, index_key);
        let mut rows = Vec::new();
        for key in self.merged(&prefix)?.into_keys() {
            if let Some(row) = self.read::<T>(&key[prefix.len()..])? {
                rows.push(row);
            }
        }

        Ok(rows)
    }

    pub fn put<T: Row>(&mut self, row: &T) -> Result<()> {
        self.staged
            .insert(row_key(T::PREFIX, row.id()), Some(encode(row)?));
        for index_key in row.index_keys() {
            let key = format!("{}{}", index_prefix(T::PREFIX, &index_key), row.id());
            self.staged.insert(key, Some(Vec::new()));
        }
        Ok(())
    }

    pub fn remove<T: Row>(&mut self, row: &T) {
        self.staged.insert(row_key(T::PREFIX, row.id()), None);
        for index_key in row.index_keys() {
            let key = format!("{}{}", index_prefix(T::PREFIX, &index_key), row.id());
            self.staged.insert(key, None);
        }
    }

    /// Stage an audit record; it commits or rolls back with everything else.
    ///
    /// Keys sort by timestamp, then by a database-wide monotonic id, so the
    /// history of one entity reads back in the order it was written.
    pub fn witness(&mut self, witness: Witness) -> Result<()> {
        let (hash, cbor) = witness.build()?;
        let nanos = witness
            .timestamp
            .to_datetime_utc()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let seq = self.store.db.generate_id()?;
        let key = format!(
            "{WITNESS_PREFIX}/{}/{nanos:020}-{seq:020}-{hash}",
            witness.entity_id
        );
        self.staged.insert(key, Some(cbor));

        Ok(())
    }

    /// Apply every staged write atomically, then release the locks.
    pub fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let writes = staged.len();

        let mut batch = Batch::default();
        for (key, value) in staged {
            match value {
                Some(bytes) => batch.insert(key.as_bytes(), bytes),
                None => batch.remove(key.as_bytes()),
            }
        }
        self.store.db.apply_batch(batch)?;
        debug!(writes, "transaction committed");

        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.store.locks.release(self.held.drain(..));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceItem;

    fn store(timeout: Duration) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("store.db")).unwrap();
        (dir, Store::new(Arc::new(db), timeout))
    }

    fn item(id: &str) -> ResourceItem {
        ResourceItem::new(id.into(), "req".into(), "rice".into(), 10)
    }

    #[test]
    fn dropped_txn_writes_nothing() {
        let (_dir, store) = store(Duration::from_millis(50));

        let mut txn = store.begin();
        txn.put(&item("a")).unwrap();
        assert!(txn.read::<ResourceItem>("a").unwrap().is_some());
        drop(txn);

        assert!(store.get::<ResourceItem>("a").unwrap().is_none());
    }

    #[test]
    fn scan_overlays_staged_writes() {
        let (_dir, store) = store(Duration::from_millis(50));

        let mut txn = store.begin();
        txn.put(&item("a")).unwrap();
        txn.put(&item("b")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin();
        txn.remove(&item("a"));
        txn.put(&item("c")).unwrap();
        let ids: Vec<String> = txn
            .scan::<ResourceItem>()
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn contended_lock_times_out_then_frees_on_drop() {
        let (_dir, store) = store(Duration::from_millis(20));

        let mut first = store.begin();
        first.lock_key("item/a").unwrap();
        // re-entrant for the holder
        first.lock_key("item/a").unwrap();

        let mut second = store.begin();
        let err = second.lock_key("item/a").unwrap_err();
        assert!(err.is_retryable());

        drop(first);
        second.lock_key("item/a").unwrap();
    }

    #[test]
    fn history_reads_back_in_write_order() {
        use crate::witness::WitnessAction;

        let (_dir, store) = store(Duration::from_millis(20));
        let at = crate::types::TimeStamp::new_with(2025, 5, 1, 9, 0, 0).unwrap();
        let actions = [
            WitnessAction::Reserved { quantity: 3 },
            WitnessAction::PickedUp,
            WitnessAction::InTransit,
            WitnessAction::Delivered,
        ];
        // same instant, separate transactions
        for action in actions.iter().cloned() {
            let mut txn = store.begin();
            txn.witness(Witness::new("d1", "c1", at.clone(), action)).unwrap();
            txn.commit().unwrap();
        }
        let mut txn = store.begin();
        txn.witness(Witness::new("d2", "c1", at.clone(), WitnessAction::PickedUp))
            .unwrap();
        drop(txn);

        let history: Vec<WitnessAction> = store
            .history("d1")
            .unwrap()
            .into_iter()
            .map(|w| w.action)
            .collect();
        assert_eq!(history, actions.to_vec());
        assert!(store.history("d2").unwrap().is_empty());
    }

    #[test]
    fn oversized_lock_timeout_is_capped() {
        let (_dir, store) = store(Duration::MAX);
        let mut txn = store.begin();
        txn.lock_key("item/a").unwrap();
        txn.lock_key("item/b").unwrap();
    }

    #[derive(Debug, PartialEq, minicbor::Encode, minicbor::Decode)]
    struct Parcel {
        #[n(0)]
        id: String,
        #[n(1)]
        depot: String,
    }

    impl Row for Parcel {
        const PREFIX: &'static str = "parcel";
        const KIND: EntityKind = EntityKind::Delivery;

        fn id(&self) -> &str {
            &self.id
        }

        fn index_keys(&self) -> Vec<String> {
            vec![format!("depot/{}", self.depot)]
        }
    }

    fn parcel(id: &str, depot: &str) -> Parcel {
        Parcel {
            id: id.into(),
            depot: depot.into(),
        }
    }

    fn ids(rows: Vec<Parcel>) -> Vec<String> {
        rows.into_iter().map(|p| p.id).collect()
    }

    #[test]
    fn lookup_follows_staged_index_entries() {
        let (_dir, store) = store(Duration::from_millis(20));

        let mut txn = store.begin();
        txn.put(&parcel("p1", "north")).unwrap();
        txn.put(&parcel("p2", "north")).unwrap();
        txn.put(&parcel("p3", "northeast")).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin();
        assert_eq!(ids(txn.lookup("depot/north").unwrap()), vec!["p1", "p2"]);

        txn.remove(&parcel("p1", "north"));
        txn.put(&parcel("p4", "north")).unwrap();
        assert_eq!(ids(txn.lookup("depot/north").unwrap()), vec!["p2", "p4"]);
        drop(txn);

        // rolled back with the rows
        let txn = store.begin();
        assert_eq!(ids(txn.lookup("depot/north").unwrap()), vec!["p1", "p2"]);
        assert_eq!(ids(txn.lookup("depot/northeast").unwrap()), vec!["p3"]);
        assert!(txn.lookup::<Parcel>("depot/south").unwrap().is_empty());
    }

    #[test]
    fn locked_fetch_of_missing_row_is_not_found() {
        let (_dir, store) = store(Duration::from_millis(20));
        let mut txn = store.begin();
        let err = txn.lock::<ResourceItem>("missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
