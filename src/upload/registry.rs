//! Identifier → upload map owned by one manager

use super::session::Upload;
use crate::metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    uploads: RwLock<HashMap<String, Arc<Upload>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, identifier: &str) -> Option<Arc<Upload>> {
        self.uploads.read().get(identifier).cloned()
    }

    pub(crate) fn contains(&self, identifier: &str) -> bool {
        self.uploads.read().contains_key(identifier)
    }

    pub(crate) fn len(&self) -> usize {
        self.uploads.read().len()
    }

    /// Register `upload`, returning the entry it displaced
    pub(crate) fn insert(&self, upload: Arc<Upload>) -> Option<Arc<Upload>> {
        let mut uploads = self.uploads.write();
        let previous = uploads.insert(upload.identifier().to_string(), upload.clone());
        metrics::set_incomplete_uploads(uploads.len());
        previous.filter(|previous| !Arc::ptr_eq(previous, &upload))
    }

    /// Remove `upload` if it is still the registered entry for its identifier
    pub(crate) fn remove(&self, upload: &Arc<Upload>) -> bool {
        let mut uploads = self.uploads.write();
        let registered = uploads
            .get(upload.identifier())
            .is_some_and(|current| Arc::ptr_eq(current, upload));
        if registered {
            uploads.remove(upload.identifier());
            metrics::set_incomplete_uploads(uploads.len());
        }
        registered
    }

    /// Remove and return every upload whose expiry is at or before `now`.
    ///
    /// Removal happens under the write lock, so each expired upload is handed
    /// to exactly one caller.
    pub(crate) fn remove_expired(&self, now: Instant) -> Vec<Arc<Upload>> {
        let mut uploads = self.uploads.write();
        let expired: Vec<String> = uploads
            .iter()
            .filter(|(_, upload)| upload.is_expired(now))
            .map(|(identifier, _)| identifier.clone())
            .collect();

        let removed = expired
            .iter()
            .filter_map(|identifier| uploads.remove(identifier))
            .collect();
        metrics::set_incomplete_uploads(uploads.len());
        removed
    }
}
