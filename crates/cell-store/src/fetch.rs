//! Authoritative reads and in-flight fetch tokens

use async_trait::async_trait;
use planner_core::{CacheKey, Cell, VersionId};

/// Source of truth for a version's cells
#[async_trait]
pub trait CellFetcher: Send + Sync {
    type Error: Send;

    async fn fetch_cells(&self, version_id: &VersionId) -> Result<Vec<Cell>, Self::Error>;
}

/// Ticket for one outstanding fetch of a cache key.
///
/// A completed fetch is only written into the store while its generation
/// is still current; `CellStore::cancel_fetches` bumps the generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchToken {
    pub(crate) key: CacheKey,
    pub(crate) generation: u64,
}

impl FetchToken {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FetchState {
    pub generation: u64,
    pub in_flight: usize,
}
