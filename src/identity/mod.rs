//! Enrolled identities and their face embeddings.
//!
//! The matcher never reads the identity store directly. A snapshot is built from
//! the store once at startup (and again on an explicit reload), then published
//! through `SnapshotHandle`, which swaps the whole snapshot atomically. Readers
//! always see either the old or the new snapshot, never a mix.

mod matcher;
mod store;

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

pub use matcher::{
    match_against, IdentityMatcher, MatchOutcome, MatcherThresholds, DEFAULT_MARGIN,
    DEFAULT_TOLERANCE,
};
pub use store::{IdentityRecord, IdentityStore, MemoryIdentityStore, SqliteIdentityStore};

/// Length of every face embedding.
pub const EMBEDDING_DIM: usize = 128;

/// One enrolled identity as seen by the matcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

/// Immutable view of every enrolled embedding.
///
/// Samples are stored as one flat row-major matrix with precomputed squared
/// norms, so a match is a single pass over contiguous memory.
#[derive(Clone, Debug, Default)]
pub struct IdentitySnapshot {
    identities: Vec<Identity>,
    /// `samples.len() == owners.len() * EMBEDDING_DIM`
    samples: Vec<f32>,
    norms_sq: Vec<f32>,
    /// Index into `identities` for each sample row.
    owners: Vec<usize>,
}

impl IdentitySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from the active identities in `store`.
    ///
    /// Embeddings with the wrong length are skipped with a warning; identities
    /// without any usable embedding are left out.
    pub fn load(store: &dyn IdentityStore) -> Result<Self> {
        let mut builder = SnapshotBuilder::default();
        for record in store.all_identities()? {
            if !record.active {
                continue;
            }
            let embeddings = store.embeddings(&record.id)?;
            builder.add_identity(&record.id, &record.name, embeddings);
        }
        let snapshot = builder.build();
        log::info!(
            "loaded {} face embeddings from {} identities",
            snapshot.sample_count(),
            snapshot.identity_count()
        );
        Ok(snapshot)
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn sample_count(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub(crate) fn sample(&self, row: usize) -> &[f32] {
        &self.samples[row * EMBEDDING_DIM..(row + 1) * EMBEDDING_DIM]
    }

    pub(crate) fn sample_norm_sq(&self, row: usize) -> f32 {
        self.norms_sq[row]
    }

    pub(crate) fn sample_owner(&self, row: usize) -> usize {
        self.owners[row]
    }
}

/// Incremental constructor for `IdentitySnapshot`.
#[derive(Default)]
pub struct SnapshotBuilder {
    snapshot: IdentitySnapshot,
}

impl SnapshotBuilder {
    /// Add an identity and its embeddings. Returns the number of samples kept.
    pub fn add_identity(&mut self, id: &str, name: &str, embeddings: Vec<Vec<f32>>) -> usize {
        let owner = self.snapshot.identities.len();
        let mut kept = 0;
        for (i, embedding) in embeddings.into_iter().enumerate() {
            if embedding.len() != EMBEDDING_DIM {
                log::warn!(
                    "invalid embedding length {} for identity {}, sample {}",
                    embedding.len(),
                    id,
                    i + 1
                );
                continue;
            }
            let norm_sq = embedding.iter().map(|v| v * v).sum();
            self.snapshot.samples.extend_from_slice(&embedding);
            self.snapshot.norms_sq.push(norm_sq);
            self.snapshot.owners.push(owner);
            kept += 1;
        }
        if kept > 0 {
            self.snapshot.identities.push(Identity {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        kept
    }

    pub fn build(self) -> IdentitySnapshot {
        self.snapshot
    }
}

/// Shared, atomically swappable reference to the current snapshot.
#[derive(Clone)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<IdentitySnapshot>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: IdentitySnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    /// Current snapshot. Lock-free; the returned `Arc` stays valid across swaps.
    pub fn load(&self) -> Arc<IdentitySnapshot> {
        self.current.load_full()
    }

    pub fn replace(&self, snapshot: IdentitySnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Rebuild from `store` and swap in the result.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn reload(&self, store: &dyn IdentityStore) -> Result<()> {
        let snapshot = IdentitySnapshot::load(store)?;
        self.replace(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(fill: f32) -> Vec<f32> {
        vec![fill; EMBEDDING_DIM]
    }

    #[test]
    fn builder_skips_wrong_length_embeddings() {
        let mut builder = SnapshotBuilder::default();
        assert_eq!(
            builder.add_identity("u1", "Alice", vec![embedding(0.1), vec![0.0; 64]]),
            1
        );
        assert_eq!(builder.add_identity("u2", "Bob", vec![vec![0.0; 3]]), 0);

        let snapshot = builder.build();
        assert_eq!(snapshot.identity_count(), 1);
        assert_eq!(snapshot.sample_count(), 1);
        assert!((snapshot.sample_norm_sq(0) - 0.01 * EMBEDDING_DIM as f32).abs() < 1e-4);
    }

    #[test]
    fn load_ignores_inactive_identities() {
        let store = MemoryIdentityStore::default()
            .with_identity("u1", "Alice", true, vec![embedding(0.0)])
            .with_identity("u2", "Bob", false, vec![embedding(1.0)]);
        let snapshot = IdentitySnapshot::load(&store).unwrap();
        let expected = [Identity {
            id: "u1".to_string(),
            name: "Alice".to_string(),
        }];
        assert_eq!(snapshot.identities(), &expected);
    }

    #[test]
    fn handle_swaps_whole_snapshot() {
        let handle = SnapshotHandle::new(IdentitySnapshot::empty());
        let before = handle.load();

        let store =
            MemoryIdentityStore::default().with_identity("u1", "Alice", true, vec![embedding(0.0)]);
        handle.reload(&store).unwrap();

        assert!(before.is_empty());
        assert_eq!(handle.load().identity_count(), 1);
    }
}
