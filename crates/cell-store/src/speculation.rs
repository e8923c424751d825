//! Speculative row writes and their rollback bookkeeping

use std::collections::HashMap;
use planner_core::{CacheKey, Cell, CellId};

/// Rows one speculative write touched, as that write left them.
///
/// Hand it back to `CellStore::commit` or `CellStore::restore` once the
/// write settles.
#[derive(Debug, Clone)]
#[must_use = "a speculative write must be committed or restored"]
pub struct CacheSnapshot {
    pub(crate) key: CacheKey,
    pub(crate) rows: Vec<Cell>,
}

impl CacheSnapshot {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Predicted rows
    pub fn cells(&self) -> &[Cell] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Move the rows matching `f` into a snapshot of their own
    pub fn split_off(&mut self, mut f: impl FnMut(&Cell) -> bool) -> CacheSnapshot {
        let (taken, kept): (Vec<Cell>, Vec<Cell>) = std::mem::take(&mut self.rows).into_iter().partition(|c| f(c));
        self.rows = kept;
        CacheSnapshot { key: self.key.clone(), rows: taken }
    }
}

/// Last confirmed state of a row that has speculative writes outstanding
#[derive(Debug)]
pub(crate) struct Speculation {
    pub confirmed: Cell,
    pub writers: usize,
}

pub(crate) type Speculations = HashMap<CacheKey, HashMap<CellId, Speculation>>;

/// Register one more writer on a row; the first writer records its confirmed state
pub(crate) fn begin(speculations: &mut Speculations, key: &CacheKey, before: Cell) {
    speculations
        .entry(key.clone())
        .or_default()
        .entry(before.id.clone())
        .and_modify(|s| s.writers += 1)
        .or_insert(Speculation { confirmed: before, writers: 1 });
}

/// Release one writer, optionally recording a newly confirmed state.
///
/// Returns the row's confirmed state as of this call.
pub(crate) fn finish(
    speculations: &mut Speculations,
    key: &CacheKey,
    id: &CellId,
    confirmed: Option<Cell>,
) -> Option<Cell> {
    let rows = speculations.get_mut(key)?;
    let speculation = rows.get_mut(id)?;
    if let Some(cell) = confirmed {
        speculation.confirmed = cell;
    }
    speculation.writers = speculation.writers.saturating_sub(1);

    let result = if speculation.writers == 0 {
        rows.remove(id).map(|s| s.confirmed)
    } else {
        Some(speculation.confirmed.clone())
    };
    if rows.is_empty() {
        speculations.remove(key);
    }
    result
}
