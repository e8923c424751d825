//! # Cell Store
//!
//! In-memory cache of planning cells keyed by `(collection, version)`.
//!
//! The store is what the grid renders from. Two producers write into it: the
//! optimistic writeback engine (predictions, reconciliation, rollback) and the
//! realtime listener (remote merges). Everything else only reads, or asks for
//! an invalidation or a refetch.

pub mod fetch;
pub mod speculation;

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use planner_core::{CacheKey, CacheKind, Cell, CellId, VersionId};

pub use fetch::{CellFetcher, FetchToken};
pub use speculation::CacheSnapshot;
use fetch::FetchState;
use speculation::Speculations;

/// A cached collection
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub cells: Vec<Cell>,
    /// Marked by `invalidate`, cleared by the next completed fetch
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(cells: Vec<Cell>) -> Self {
        Self { cells, stale: false, updated_at: Utc::now() }
    }
}

/// Store events
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Entry contents changed
    Updated(CacheKey),
    /// Entry marked stale; readers should refetch
    Invalidated(CacheKey),
    /// Speculative rows rolled back
    Restored(CacheKey),
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<CacheKey, CacheEntry>,
    fetches: HashMap<CacheKey, FetchState>,
    speculations: Speculations,
}

/// Keyed cell cache
pub struct CellStore {
    state: RwLock<StoreState>,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl CellStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(StoreState::default()),
            event_tx,
        }
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    /// Cached cells for a key
    pub fn get(&self, key: &CacheKey) -> Option<Vec<Cell>> {
        self.state.read().entries.get(key).map(|e| e.cells.clone())
    }

    /// Full entry for a key, including its stale flag
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.read().entries.get(key).cloned()
    }

    /// Single cached cell
    pub fn cell(&self, key: &CacheKey, id: &CellId) -> Option<Cell> {
        self.state
            .read()
            .entries
            .get(key)
            .and_then(|e| e.cells.iter().find(|c| &c.id == id).cloned())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.read().entries.contains_key(key)
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.state.read().entries.get(key).is_some_and(|e| e.stale)
    }

    /// Replace a key's contents
    pub fn set(&self, key: &CacheKey, cells: Vec<Cell>) {
        self.state.write().entries.insert(key.clone(), CacheEntry::new(cells));
        let _ = self.event_tx.send(StoreEvent::Updated(key.clone()));
    }

    /// Apply a mutation to a key's cells in one write.
    ///
    /// Returns `None` without calling `f` when nothing is cached for the key.
    pub fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut Vec<Cell>) -> R) -> Option<R> {
        let result = {
            let mut state = self.state.write();
            let entry = state.entries.get_mut(key)?;
            let result = f(&mut entry.cells);
            entry.updated_at = Utc::now();
            result
        };
        let _ = self.event_tx.send(StoreEvent::Updated(key.clone()));
        Some(result)
    }

    /// Apply a speculative write to the rows `f` accepts, in one write.
    ///
    /// `f` mutates a row and returns `true` to claim it. The returned
    /// snapshot is empty when nothing is cached for the key.
    pub fn speculate(&self, key: &CacheKey, mut f: impl FnMut(&mut Cell) -> bool) -> CacheSnapshot {
        let mut rows = Vec::new();
        {
            let mut state = self.state.write();
            let StoreState { entries, speculations, .. } = &mut *state;
            if let Some(entry) = entries.get_mut(key) {
                for cell in entry.cells.iter_mut() {
                    let before = cell.clone();
                    if f(cell) {
                        speculation::begin(speculations, key, before);
                        rows.push(cell.clone());
                    }
                }
                if !rows.is_empty() {
                    entry.updated_at = Utc::now();
                }
            }
        }
        if !rows.is_empty() {
            let _ = self.event_tx.send(StoreEvent::Updated(key.clone()));
        }
        CacheSnapshot { key: key.clone(), rows }
    }

    /// Settle a speculative write as accepted.
    ///
    /// `f` turns each predicted row into its confirmed form. Rows that still
    /// hold the prediction (or the confirmed state before it) are replaced
    /// with it; rows changed since by a remote merge, a refetch or a later
    /// write are left alone.
    pub fn commit(&self, snapshot: CacheSnapshot, mut f: impl FnMut(&mut Cell)) {
        let CacheSnapshot { key, rows } = snapshot;
        if rows.is_empty() {
            return;
        }
        {
            let mut state = self.state.write();
            let StoreState { entries, speculations, .. } = &mut *state;
            for predicted in rows {
                let mut confirmed = predicted.clone();
                f(&mut confirmed);
                let prior = speculations
                    .get(&key)
                    .and_then(|rows| rows.get(&predicted.id))
                    .map(|s| s.confirmed.clone());
                if let Some(cell) = entries
                    .get_mut(&key)
                    .and_then(|e| e.cells.iter_mut().find(|c| c.id == predicted.id))
                {
                    // a later write rolled back onto the prior confirmed row counts as untouched
                    if *cell == predicted || prior.as_ref() == Some(&*cell) {
                        *cell = confirmed.clone();
                    }
                }
                speculation::finish(speculations, &key, &predicted.id, Some(confirmed));
            }
        }
        let _ = self.event_tx.send(StoreEvent::Updated(key));
    }

    /// Roll back a speculative write.
    ///
    /// Each row still holding this write's prediction goes back to its last
    /// confirmed state, which is older than any write still in flight on it.
    /// Rows changed since are left alone. Returns how many rows were put back.
    pub fn restore(&self, snapshot: CacheSnapshot) -> usize {
        let CacheSnapshot { key, rows } = snapshot;
        if rows.is_empty() {
            return 0;
        }
        let restored = {
            let mut state = self.state.write();
            let StoreState { entries, speculations, .. } = &mut *state;
            let mut restored = 0;
            for predicted in rows {
                let Some(confirmed) = speculation::finish(speculations, &key, &predicted.id, None) else {
                    continue;
                };
                if let Some(cell) = entries
                    .get_mut(&key)
                    .and_then(|e| e.cells.iter_mut().find(|c| c.id == predicted.id))
                {
                    if *cell == predicted {
                        *cell = confirmed;
                        restored += 1;
                    }
                }
            }
            restored
        };
        tracing::debug!(%key, restored, "Rolled back speculative rows");
        let _ = self.event_tx.send(StoreEvent::Restored(key));
        restored
    }

    /// Mark a key stale and tell readers to refetch.
    ///
    /// An unloaded change history gets an empty stale marker. An unloaded
    /// cell collection stays absent so nothing can be merged into a partial one.
    pub fn invalidate(&self, key: &CacheKey) {
        {
            let mut state = self.state.write();
            match state.entries.get_mut(key) {
                Some(entry) => entry.stale = true,
                None if key.kind == CacheKind::CellChanges => {
                    let mut entry = CacheEntry::new(Vec::new());
                    entry.stale = true;
                    state.entries.insert(key.clone(), entry);
                }
                None => {}
            }
        }
        tracing::trace!(%key, "Cache invalidated");
        let _ = self.event_tx.send(StoreEvent::Invalidated(key.clone()));
    }

    /// Register an outstanding fetch for a key
    pub fn begin_fetch(&self, key: &CacheKey) -> FetchToken {
        let mut state = self.state.write();
        let fetch = state.fetches.entry(key.clone()).or_default();
        fetch.in_flight += 1;
        FetchToken {
            key: key.clone(),
            generation: fetch.generation,
        }
    }

    /// Write a fetch result, unless the fetch was cancelled meanwhile.
    ///
    /// Returns whether the result was applied.
    pub fn complete_fetch(&self, token: FetchToken, cells: Vec<Cell>) -> bool {
        let applied = {
            let mut state = self.state.write();
            let fetch = state.fetches.entry(token.key.clone()).or_default();
            if fetch.generation != token.generation {
                false
            } else {
                fetch.in_flight = fetch.in_flight.saturating_sub(1);
                state.entries.insert(token.key.clone(), CacheEntry::new(cells));
                true
            }
        };

        if applied {
            let _ = self.event_tx.send(StoreEvent::Updated(token.key));
        } else {
            tracing::debug!(key = %token.key, "Discarded result of cancelled fetch");
        }
        applied
    }

    /// Drop a fetch without a result (the read failed)
    pub fn abandon_fetch(&self, token: FetchToken) {
        let mut state = self.state.write();
        if let Some(fetch) = state.fetches.get_mut(&token.key) {
            if fetch.generation == token.generation {
                fetch.in_flight = fetch.in_flight.saturating_sub(1);
            }
        }
    }

    /// Cancel every outstanding fetch for a key. Returns how many were pending.
    pub fn cancel_fetches(&self, key: &CacheKey) -> usize {
        let mut state = self.state.write();
        let fetch = state.fetches.entry(key.clone()).or_default();
        let pending = fetch.in_flight;
        fetch.generation += 1;
        fetch.in_flight = 0;
        if pending > 0 {
            tracing::debug!(%key, pending, "Cancelled in-flight fetches");
        }
        pending
    }

    /// Number of fetches still pending for a key
    pub fn in_flight(&self, key: &CacheKey) -> usize {
        self.state.read().fetches.get(key).map_or(0, |f| f.in_flight)
    }

    /// Reload a version's cells from the source of truth.
    ///
    /// Returns whether the fetched rows were applied; `false` means a newer
    /// optimistic write cancelled this fetch while it was in flight.
    pub async fn refetch_cells<F>(&self, version_id: &VersionId, fetcher: &F) -> Result<bool, F::Error>
    where
        F: CellFetcher + ?Sized,
    {
        let key = CacheKey::cells(version_id.clone());
        let token = self.begin_fetch(&key);
        match fetcher.fetch_cells(version_id).await {
            Ok(cells) => Ok(self.complete_fetch(token, cells)),
            Err(e) => {
                self.abandon_fetch(token);
                Err(e)
            }
        }
    }

    /// Drop every entry belonging to a version
    pub fn clear_version(&self, version_id: &VersionId) {
        let mut state = self.state.write();
        state.entries.retain(|k, _| &k.version_id != version_id);
        state.speculations.retain(|k, _| &k.version_id != version_id);
        for (key, fetch) in state.fetches.iter_mut() {
            if &key.version_id == version_id {
                fetch.generation += 1;
                fetch.in_flight = 0;
            }
        }
    }
}

impl Default for CellStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn cell(id: &str, value: f64, version: i64) -> Cell {
        Cell::new(id, "v1", "revenue", "fees", "tuition")
            .with_value(value)
            .with_version(version)
    }

    struct StaticFetcher(Vec<Cell>);

    #[async_trait]
    impl CellFetcher for StaticFetcher {
        type Error = String;

        async fn fetch_cells(&self, _version_id: &VersionId) -> Result<Vec<Cell>, String> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl CellFetcher for FailingFetcher {
        type Error = String;

        async fn fetch_cells(&self, _version_id: &VersionId) -> Result<Vec<Cell>, String> {
            Err("offline".into())
        }
    }

    fn bump(cell: &mut Cell, value: f64) {
        cell.set_value(value.into());
        cell.version += 1;
    }

    #[test]
    fn test_restore_puts_back_only_predicted_rows() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 100.0, 1), cell("c2", 5.0, 3)]);
        let before = store.get(&key).unwrap();

        let snapshot = store.speculate(&key, |c| {
            if c.id.as_str() != "c1" {
                return false;
            }
            bump(c, 200.0);
            true
        });
        assert_eq!(snapshot.cells().len(), 1);
        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 2);

        assert_eq!(store.restore(snapshot), 1);
        assert_eq!(store.get(&key).unwrap(), before);
    }

    #[test]
    fn test_restore_keeps_rows_changed_meanwhile() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 100.0, 1), cell("c2", 5.0, 1)]);

        let snapshot = store.speculate(&key, |c| c.id.as_str() == "c1" && {
            bump(c, 200.0);
            true
        });
        // remote merges land while the write is pending
        store.update(&key, |cells| {
            for c in cells.iter_mut() {
                match c.id.as_str() {
                    "c1" => *c = cell("c1", 150.0, 3),
                    _ => *c = cell("c2", 9.0, 2),
                }
            }
        });

        assert_eq!(store.restore(snapshot), 0);
        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 3);
        assert_eq!(store.cell(&key, &"c2".into()).unwrap().value_numeric, Some(9.0));
    }

    #[test]
    fn test_interleaved_failures_on_one_row_return_to_confirmed_state() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 100.0, 1)]);
        let before = store.get(&key).unwrap();

        let first = store.speculate(&key, |c| {
            bump(c, 200.0);
            true
        });
        let second = store.speculate(&key, |c| {
            bump(c, 300.0);
            true
        });
        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 3);

        assert_eq!(store.restore(first), 0);
        assert_eq!(store.restore(second), 1);
        assert_eq!(store.get(&key).unwrap(), before);
    }

    #[test]
    fn test_commit_survives_rollback_of_a_later_write() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 100.0, 1)]);

        let first = store.speculate(&key, |c| {
            bump(c, 200.0);
            true
        });
        let second = store.speculate(&key, |c| {
            bump(c, 300.0);
            true
        });
        store.restore(second);
        store.commit(first, |c| c.modified_by = Some("server".into()));

        let c1 = store.cell(&key, &"c1".into()).unwrap();
        assert_eq!(c1.version, 2);
        assert_eq!(c1.value_numeric, Some(200.0));
        assert_eq!(c1.modified_by.as_ref().map(|u| u.as_str()), Some("server"));
    }

    #[test]
    fn test_split_snapshot_settles_halves_independently() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 1.0, 1), cell("c2", 2.0, 1)]);

        let mut accepted = store.speculate(&key, |c| {
            bump(c, 10.0);
            true
        });
        let rejected = accepted.split_off(|c| c.id.as_str() == "c2");
        store.commit(accepted, |_| {});
        store.restore(rejected);

        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 2);
        assert_eq!(store.cell(&key, &"c2".into()).unwrap().version, 1);
        assert!(store.state.read().speculations.is_empty());
    }

    #[test]
    fn test_speculate_without_entry_claims_nothing() {
        let store = CellStore::new();
        let snapshot = store.speculate(&CacheKey::cells("v1"), |_| true);
        assert!(snapshot.is_empty());
        assert_eq!(store.restore(snapshot), 0);
        assert!(!store.contains(&CacheKey::cells("v1")));
    }

    #[test]
    fn test_update_without_entry_is_noop() {
        let store = CellStore::new();
        let called = store.update(&CacheKey::cells("v1"), |_| ());
        assert!(called.is_none());
    }

    #[test]
    fn test_cancelled_fetch_is_discarded() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 200.0, 2)]);

        let token = store.begin_fetch(&key);
        assert_eq!(store.in_flight(&key), 1);
        assert_eq!(store.cancel_fetches(&key), 1);

        assert!(!store.complete_fetch(token, vec![cell("c1", 100.0, 1)]));
        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 2);
        assert_eq!(store.in_flight(&key), 0);
    }

    #[test]
    fn test_fetch_after_cancel_applies() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.cancel_fetches(&key);

        let token = store.begin_fetch(&key);
        assert!(store.complete_fetch(token, vec![cell("c1", 1.0, 4)]));
        assert_eq!(store.get(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_invalidate_marks_stale_and_notifies() {
        let store = CellStore::new();
        let mut events = store.subscribe();
        let key = CacheKey::cell_changes("v1");

        store.invalidate(&key);
        assert!(store.is_stale(&key));
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Invalidated(key.clone()));

        let token = store.begin_fetch(&key);
        store.complete_fetch(token, Vec::new());
        assert!(!store.is_stale(&key));
    }

    #[test]
    fn test_invalidating_unloaded_cells_creates_nothing() {
        let store = CellStore::new();
        let mut events = store.subscribe();
        let key = CacheKey::cells("v1");

        store.invalidate(&key);
        assert!(!store.contains(&key));
        assert!(store.update(&key, |cells| cells.push(cell("c1", 1.0, 1))).is_none());
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Invalidated(key));
    }

    #[tokio::test]
    async fn test_refetch_cells_replaces_entry() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 1.0, 1)]);
        store.invalidate(&key);

        let fetcher = StaticFetcher(vec![cell("c1", 9.0, 5), cell("c2", 2.0, 1)]);
        let applied = store.refetch_cells(&VersionId::new("v1"), &fetcher).await.unwrap();

        assert!(applied);
        assert!(!store.is_stale(&key));
        assert_eq!(store.get(&key).unwrap().len(), 2);
        assert_eq!(store.cell(&key, &"c1".into()).unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_cache() {
        let store = CellStore::new();
        let key = CacheKey::cells("v1");
        store.set(&key, vec![cell("c1", 1.0, 1)]);

        let err = store.refetch_cells(&VersionId::new("v1"), &FailingFetcher).await.unwrap_err();
        assert_eq!(err, "offline");
        assert_eq!(store.in_flight(&key), 0);
        assert_eq!(store.get(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_clear_version_leaves_other_versions() {
        let store = CellStore::new();
        store.set(&CacheKey::cells("v1"), vec![cell("c1", 1.0, 1)]);
        store.set(&CacheKey::cells("v2"), vec![cell("c9", 1.0, 1)]);

        store.clear_version(&VersionId::new("v1"));
        assert!(!store.contains(&CacheKey::cells("v1")));
        assert!(store.contains(&CacheKey::cells("v2")));
    }
}
