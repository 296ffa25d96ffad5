//! Archive: one repository's journal, backend and claims, wired together.
//!
//! Push and pull are methods on [`Archive`] (see `push` and `pull`).
//! Read-only operations such as listing and index rebuilds only need a
//! [`ManifestStore`] and do not require a resolvable backend.

use std::fmt;

use tracing::warn;

use crate::backend::{self, BlobBackend};
use crate::claims::{self, ClaimRegistry};
use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::index::{self, IndexReport};
use crate::store::ManifestStore;

pub struct Archive {
    config: ArchiveConfig,
    store: ManifestStore,
    backend: Box<dyn BlobBackend>,
    claims: Box<dyn ClaimRegistry>,
}

impl Archive {
    /// Open the archive described by `config`.
    ///
    /// Fails with a configuration error if the backend identity cannot be
    /// resolved or the settings are unusable.
    pub fn open(config: ArchiveConfig) -> Result<Self> {
        let backend = backend::from_config(&config.backend)?;
        let claims = claims::from_config(&config);
        Self::with_parts(config, backend, claims)
    }

    /// Open with an explicit backend and claim registry.
    pub fn with_parts(
        config: ArchiveConfig,
        backend: Box<dyn BlobBackend>,
        claims: Box<dyn ClaimRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ManifestStore::open(config.manifest_path())?;
        Ok(Self {
            config,
            store,
            backend,
            claims,
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn backend(&self) -> &dyn BlobBackend {
        self.backend.as_ref()
    }

    pub fn claims(&self) -> &dyn ClaimRegistry {
        self.claims.as_ref()
    }

    /// Rebuild the derived index from the journal.
    pub fn rebuild_index(&self) -> Result<IndexReport> {
        let index_dir = self.config.index_dir();
        self.claims.ensure_unclaimed(&index_dir)?;
        index::refresh(&self.store, self.config.latest_n, &index_dir)
    }

    /// Index refresh after a push. The journal is already written, so a
    /// failure here is reported and dropped.
    pub(crate) fn refresh_index_best_effort(&self) {
        if !self.config.refresh_index {
            return;
        }
        if let Err(e) = self.rebuild_index() {
            warn!(error = %e, "index refresh failed; run build-index to retry");
        }
    }
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("root", &self.config.root)
            .field("collection_id", &self.backend.collection_id())
            .finish_non_exhaustive()
    }
}
