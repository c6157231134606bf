/*
 * cache/mod.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Compiled-template caching.
//!
//! A [`CacheStorage`] maps cache keys (template path plus suffix) to shared
//! [`Artifact`]s. The in-memory storage never touches disk; the file
//! storage keeps the same in-memory map and additionally persists each
//! entry through an [`ArtifactCodec`].
//!
//! Storages only hold artifacts. Deciding whether a cached artifact is still
//! current is the engine's job.

mod codec;
mod file;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::CacheResult;

pub use codec::{ArtifactCodec, BytecodeCodec, PortableCodec, TextCodec};
pub use file::FileCacheStorage;

/// File storage using the runtime-bound Lua bytecode codec.
pub type BytecodeCacheStorage = FileCacheStorage<BytecodeCodec>;
/// File storage using the portable CBOR codec.
pub type PortableCacheStorage = FileCacheStorage<PortableCodec>;
/// File storage using the human-readable JSON codec.
pub type TextCacheStorage = FileCacheStorage<TextCodec>;

/// Storage for compiled templates.
pub trait CacheStorage: Send + Sync {
    /// Look up `key`. A decode failure is an error; a missing entry is
    /// `Ok(None)`.
    fn get(&self, key: &str) -> CacheResult<Option<Arc<Artifact>>>;

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> CacheResult<()>;

    /// Remove `key`. Removing a missing entry is not an error.
    fn unset(&self, key: &str) -> CacheResult<()>;

    /// Remove every entry this storage knows about.
    fn clear(&self) -> CacheResult<()>;
}

/// Cache storage selection for [`crate::EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Compile on every lookup.
    None,
    Memory,
    Bytecode,
    Portable,
    #[default]
    Text,
}

impl CacheKind {
    pub fn build(self) -> Option<Arc<dyn CacheStorage>> {
        match self {
            CacheKind::None => None,
            CacheKind::Memory => Some(Arc::new(MemoryCacheStorage::new())),
            CacheKind::Bytecode => Some(Arc::new(FileCacheStorage::new(BytecodeCodec))),
            CacheKind::Portable => Some(Arc::new(FileCacheStorage::new(PortableCodec))),
            CacheKind::Text => Some(Arc::new(FileCacheStorage::new(TextCodec))),
        }
    }
}

/// Process-local storage; nothing is written to disk.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    items: RwLock<HashMap<String, Arc<Artifact>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn get(&self, key: &str) -> CacheResult<Option<Arc<Artifact>>> {
        Ok(self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> CacheResult<()> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), artifact);
        Ok(())
    }

    fn unset(&self, key: &str) -> CacheResult<()> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Instruction;

    fn artifact(text: &str) -> Arc<Artifact> {
        Arc::new(Artifact::new(
            vec![Instruction::Text(text.to_string())],
            None,
            Some("a.lhtml".to_string()),
        ))
    }

    #[test]
    fn test_memory_storage_shares_artifacts() {
        let storage = MemoryCacheStorage::new();
        assert!(storage.get("a.lhtml.cache").unwrap().is_none());

        let a = artifact("A");
        storage.set("a.lhtml.cache", a.clone()).unwrap();
        let hit = storage.get("a.lhtml.cache").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &hit));

        storage.unset("a.lhtml.cache").unwrap();
        storage.unset("a.lhtml.cache").unwrap();
        assert!(storage.get("a.lhtml.cache").unwrap().is_none());

        storage.set("x", artifact("X")).unwrap();
        storage.set("y", artifact("Y")).unwrap();
        assert_eq!(storage.len(), 2);
        storage.clear().unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_cache_kind_names() {
        let kind: CacheKind = serde_json::from_str("\"bytecode\"").unwrap();
        assert_eq!(kind, CacheKind::Bytecode);
        assert_eq!(CacheKind::default(), CacheKind::Text);
        assert!(CacheKind::None.build().is_none());
        assert!(CacheKind::Memory.build().is_some());
    }
}
