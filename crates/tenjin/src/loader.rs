/*
 * loader.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template source loading.
//!
//! This module provides the trait the engine uses to find template files on
//! a search path and read them along with their modification time, plus
//! filesystem and in-memory implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use crate::error::TemplateResult;

/// Trait for locating and reading template sources.
pub trait Loader: Send + Sync {
    /// Find `filename` in the first directory of `dirs` that contains it.
    /// With no directories, `filename` is looked up as given.
    fn find(&self, filename: &str, dirs: &[PathBuf]) -> Option<PathBuf>;

    /// Absolute form of a path returned by [`Loader::find`]; used for cache
    /// keys.
    fn abspath(&self, path: &Path) -> PathBuf;

    /// Current modification time, or `None` if the source is gone.
    fn timestamp(&self, path: &Path) -> TemplateResult<Option<SystemTime>>;

    /// Read the source text and its modification time.
    fn load(&self, path: &Path) -> TemplateResult<Option<(String, SystemTime)>>;
}

fn candidates<'a>(
    filename: &'a str,
    dirs: &'a [PathBuf],
) -> Box<dyn Iterator<Item = PathBuf> + 'a> {
    if dirs.is_empty() || Path::new(filename).is_absolute() {
        Box::new(std::iter::once(PathBuf::from(filename)))
    } else {
        Box::new(dirs.iter().map(move |dir| dir.join(filename)))
    }
}

/// Loader that reads templates from the filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileSystemLoader;

impl Loader for FileSystemLoader {
    fn find(&self, filename: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
        candidates(filename, dirs).find(|path| path.is_file())
    }

    fn abspath(&self, path: &Path) -> PathBuf {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn timestamp(&self, path: &Path) -> TemplateResult<Option<SystemTime>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self, path: &Path) -> TemplateResult<Option<(String, SystemTime)>> {
        let Some(mtime) = self.timestamp(path)? else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)?;
        Ok(Some((text, mtime)))
    }
}

/// Loader that serves templates from an in-memory map.
///
/// Useful for testing and for templates bundled into the application.
/// Modification times are set explicitly, and calls to
/// [`Loader::timestamp`] are counted so tests can observe how often the
/// engine checks freshness.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    sources: RwLock<HashMap<PathBuf, (String, SystemTime)>>,
    timestamp_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl MemoryLoader {
    /// Create a new empty memory loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template, stamped with the current time.
    pub fn add(&self, path: impl Into<PathBuf>, text: impl Into<String>) -> &Self {
        self.add_with_timestamp(path, text, SystemTime::now())
    }

    pub fn add_with_timestamp(
        &self,
        path: impl Into<PathBuf>,
        text: impl Into<String>,
        mtime: SystemTime,
    ) -> &Self {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), (text.into(), mtime));
        self
    }

    /// Change the modification time of an existing template.
    pub fn set_timestamp(&self, path: impl AsRef<Path>, mtime: SystemTime) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sources.get_mut(path.as_ref()) {
            entry.1 = mtime;
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path.as_ref());
    }

    /// Number of `timestamp` calls so far.
    pub fn timestamp_calls(&self) -> usize {
        self.timestamp_calls.load(Ordering::SeqCst)
    }

    /// Number of `load` calls so far.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    fn contains(&self, path: &Path) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }
}

impl Loader for MemoryLoader {
    fn find(&self, filename: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
        candidates(filename, dirs).find(|path| self.contains(path))
    }

    fn abspath(&self, path: &Path) -> PathBuf {
        Path::new("/").join(path)
    }

    fn timestamp(&self, path: &Path) -> TemplateResult<Option<SystemTime>> {
        self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|(_, mtime)| *mtime))
    }

    fn load(&self, path: &Path) -> TemplateResult<Option<(String, SystemTime)>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned())
    }
}
