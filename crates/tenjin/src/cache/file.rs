/*
 * cache/file.rs
 * Copyright (c) 2025 Posit, PBC
 */

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::{ArtifactCodec, CacheStorage};
use crate::artifact::Artifact;
use crate::error::CacheResult;

/// Storage that keeps artifacts in memory and persists them as files.
///
/// The cache key is the file path. Reads check memory first and fall back to
/// decoding the file. Writes go to a temporary file in the same directory
/// that is renamed into place, so a concurrent reader sees either the old
/// entry or the new one and never a partial write.
///
/// Artifacts without a source timestamp (templates added in memory) are
/// kept in memory only.
#[derive(Debug)]
pub struct FileCacheStorage<C> {
    codec: C,
    items: RwLock<HashMap<String, Arc<Artifact>>>,
}

impl<C: ArtifactCodec> FileCacheStorage<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn remember(&self, key: &str, artifact: Arc<Artifact>) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), artifact);
    }
}

impl<C: ArtifactCodec> CacheStorage for FileCacheStorage<C> {
    fn get(&self, key: &str) -> CacheResult<Option<Arc<Artifact>>> {
        let cached = self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let bytes = match fs::read(key) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let artifact = Arc::new(self.codec.decode(&bytes)?);
        debug!(key, "loaded cache file");
        self.remember(key, artifact.clone());
        Ok(Some(artifact))
    }

    fn set(&self, key: &str, artifact: Arc<Artifact>) -> CacheResult<()> {
        self.remember(key, artifact.clone());
        if artifact.source_timestamp().is_none() {
            return Ok(());
        }
        let bytes = self.codec.encode(&artifact)?;
        write_atomic(Path::new(key), &bytes)
    }

    fn unset(&self, key: &str) -> CacheResult<()> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        remove_if_exists(Path::new(key))
    }

    fn clear(&self) -> CacheResult<()> {
        let keys: Vec<String> = self
            .items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            remove_if_exists(Path::new(&key))?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
