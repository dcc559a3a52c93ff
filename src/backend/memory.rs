//! In-process backend
//!
//! Assembles parts in memory and publishes the finished object into a shared
//! [`MemoryStore`]. Useful for tests, benchmarks and embedding.

use super::{BackendError, ChunkBackend, UploadDescriptor};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;

/// Completed objects keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a completed object
    pub fn get(&self, identifier: &str) -> Option<Bytes> {
        self.objects.get(identifier).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.objects.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn publish(&self, identifier: String, data: Bytes) {
        self.objects.insert(identifier, data);
    }
}

/// Backend that buffers parts until `complete`
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: MemoryStore,
    identifier: Option<String>,
    buffer: BytesMut,
    parts: u32,
}

impl MemoryBackend {
    /// Create a backend publishing into `store`
    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Default::default()
        }
    }

    /// Bytes received so far
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[async_trait]
impl ChunkBackend for MemoryBackend {
    fn is_initialized(&self) -> bool {
        self.identifier.is_some()
    }

    async fn initialize(&mut self, upload: &UploadDescriptor) -> Result<(), BackendError> {
        if let Some(total) = upload.total_size {
            self.buffer.reserve(total as usize);
        }
        self.identifier = Some(upload.identifier.clone());
        Ok(())
    }

    async fn upload_part(&mut self, part_number: u32, part: Bytes) -> Result<(), BackendError> {
        if self.identifier.is_none() {
            return Err(BackendError::NotInitialized);
        }
        if part_number != self.parts + 1 {
            return Err(BackendError::OutOfOrder {
                expected: self.parts + 1,
                actual: part_number,
            });
        }
        self.buffer.extend_from_slice(&part);
        self.parts = part_number;
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), BackendError> {
        let identifier = self
            .identifier
            .clone()
            .ok_or(BackendError::NotInitialized)?;
        let data = std::mem::take(&mut self.buffer).freeze();
        self.store.publish(identifier, data);
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.buffer.clear();
        self.identifier = None;
        self.parts = 0;
    }
}
