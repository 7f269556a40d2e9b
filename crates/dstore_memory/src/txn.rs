//! Snapshot transactions.

use crate::version::Version;
use dstore_model::{Key, PropertyMap};
use dstore_raw::{StoreError, StoreResult, TransactionOptions};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maximum entity groups a cross-group transaction may touch.
pub const MAX_CROSS_GROUP_ENTITY_GROUPS: usize = 25;

/// A buffered write. `None` deletes.
pub type Write = (Key, Option<Arc<PropertyMap>>);

#[derive(Default)]
struct TxnState {
    writes: BTreeMap<Key, Option<Arc<PropertyMap>>>,
    groups: BTreeSet<Key>,
    done: bool,
}

/// An open transaction of a [`MemStore`](crate::MemStore).
///
/// Reads see only the snapshot taken at begin; writes are buffered until
/// commit. Every entity group read or written is recorded so that commit
/// can detect conflicting commits made since the snapshot.
pub struct MemTxn {
    /// Id of the store that began this transaction.
    store_id: u64,
    /// Version the transaction reads from.
    snapshot: Arc<Version>,
    opts: TransactionOptions,
    state: Mutex<TxnState>,
}

impl MemTxn {
    pub(crate) fn new(store_id: u64, snapshot: Arc<Version>, opts: TransactionOptions) -> Self {
        Self {
            store_id,
            snapshot,
            opts,
            state: Mutex::new(TxnState::default()),
        }
    }

    pub(crate) fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Returns the snapshot this transaction reads from.
    #[must_use]
    pub fn snapshot(&self) -> &Arc<Version> {
        &self.snapshot
    }

    /// Records the entity groups of `keys` as touched.
    pub(crate) fn touch<'k>(&self, keys: impl IntoIterator<Item = &'k Key>) -> StoreResult<()> {
        let mut state = self.state.lock();
        Self::touch_locked(&mut state, &self.opts, keys)
    }

    fn touch_locked<'k>(
        state: &mut TxnState,
        opts: &TransactionOptions,
        keys: impl IntoIterator<Item = &'k Key>,
    ) -> StoreResult<()> {
        if state.done {
            return Err(StoreError::TransactionDone);
        }
        let mut groups = state.groups.clone();
        groups.extend(keys.into_iter().map(Key::root));
        let limit = if opts.cross_group {
            MAX_CROSS_GROUP_ENTITY_GROUPS
        } else {
            1
        };
        if groups.len() > limit {
            return Err(StoreError::invalid_transaction(if opts.cross_group {
                format!("transaction touches more than {limit} entity groups")
            } else {
                "operating on multiple entity groups needs a cross-group transaction".to_string()
            }));
        }
        state.groups = groups;
        Ok(())
    }

    /// Buffers writes after checking the transaction may make them.
    pub(crate) fn buffer(&self, writes: Vec<Write>) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.done {
            return Err(StoreError::TransactionDone);
        }
        if self.opts.read_only {
            return Err(StoreError::invalid_transaction(
                "cannot write in a read-only transaction",
            ));
        }
        Self::touch_locked(&mut state, &self.opts, writes.iter().map(|(k, _)| k))?;
        state.writes.extend(writes);
        Ok(())
    }

    /// Closes the transaction, returning the touched groups and writes.
    pub(crate) fn finish(&self) -> StoreResult<(BTreeSet<Key>, Vec<Write>)> {
        let mut state = self.state.lock();
        if state.done {
            return Err(StoreError::TransactionDone);
        }
        state.done = true;
        let writes = std::mem::take(&mut state.writes).into_iter().collect();
        Ok((std::mem::take(&mut state.groups), writes))
    }

    /// Closes the transaction, discarding buffered writes.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        state.done = true;
        state.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_model::KeyContext;

    fn root(id: i64) -> Key {
        KeyContext::default().key("G", id)
    }

    fn txn(opts: TransactionOptions) -> MemTxn {
        MemTxn::new(1, Arc::new(Version::default()), opts)
    }

    #[test]
    fn single_group_limit() {
        let t = txn(TransactionOptions::default());
        t.touch([&root(1), &root(1).child("C", 2)]).unwrap();
        let err = t.touch([&root(2)]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransaction(_)));
    }

    #[test]
    fn cross_group_limit() {
        let t = txn(TransactionOptions::default().cross_group(true));
        let keys: Vec<Key> = (1..=25).map(root).collect();
        t.touch(&keys).unwrap();
        assert!(t.touch([&root(26)]).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let t = txn(TransactionOptions::default().read_only(true));
        let err = t.buffer(vec![(root(1), None)]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransaction(_)));
    }

    #[test]
    fn finished_transactions_reject_use() {
        let t = txn(TransactionOptions::default());
        t.buffer(vec![(root(1), None)]).unwrap();
        let (groups, writes) = t.finish().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(writes.len(), 1);
        assert_eq!(t.touch([&root(1)]).unwrap_err(), StoreError::TransactionDone);
        assert_eq!(t.finish().unwrap_err(), StoreError::TransactionDone);
    }
}
