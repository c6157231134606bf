/*
 * artifact.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Compiled templates.
//!
//! An [`Artifact`] is the output of the compiler: an ordered instruction
//! sequence plus the declared argument list. It is immutable once built,
//! except for the time it was last validated against its source file, which
//! only moves forward. Artifacts are shared behind `Arc` between the engine,
//! cache storages and concurrent renders.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::script;

/// One step of a compiled template, executed in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    /// Append literal text.
    Text(String),
    /// Evaluate an expression and append it HTML-escaped.
    Escaped(String),
    /// Evaluate an expression and append it as-is.
    Raw(String),
    /// Run embedded code verbatim.
    Statement(String),
}

#[derive(Debug)]
pub struct Artifact {
    filename: Option<String>,
    instructions: Vec<Instruction>,
    /// `None` means arguments were not declared and names resolve
    /// dynamically against the context.
    arguments: Option<Vec<String>>,
    source_timestamp: Option<SystemTime>,
    /// Milliseconds since the epoch; 0 until the first validation.
    last_checked_at: AtomicU64,
    script: OnceLock<String>,
    bytecode: OnceLock<Vec<u8>>,
}

impl Artifact {
    pub fn new(
        instructions: Vec<Instruction>,
        arguments: Option<Vec<String>>,
        filename: Option<String>,
    ) -> Self {
        Self {
            filename,
            instructions,
            arguments,
            source_timestamp: None,
            last_checked_at: AtomicU64::new(0),
            script: OnceLock::new(),
            bytecode: OnceLock::new(),
        }
    }

    /// Record the modification time of the file this artifact came from.
    pub fn with_timestamp(mut self, timestamp: Option<SystemTime>) -> Self {
        self.source_timestamp = timestamp;
        self
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn arguments(&self) -> Option<&[String]> {
        self.arguments.as_deref()
    }

    pub fn source_timestamp(&self) -> Option<SystemTime> {
        self.source_timestamp
    }

    pub fn last_checked_at(&self) -> Option<SystemTime> {
        match self.last_checked_at.load(Ordering::Acquire) {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
        }
    }

    /// Record a successful validation. Earlier times than the current value
    /// are ignored.
    pub fn mark_checked(&self, now: SystemTime) {
        let millis = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        self.last_checked_at.fetch_max(millis, Ordering::AcqRel);
    }

    /// The Lua chunk this artifact lowers to.
    pub fn script(&self) -> &str {
        self.script
            .get_or_init(|| script::lower(&self.instructions, self.arguments.as_deref()))
    }

    /// Compiled Lua bytecode, once a render has produced it.
    pub fn bytecode(&self) -> Option<&[u8]> {
        self.bytecode.get().map(Vec::as_slice)
    }

    pub(crate) fn set_bytecode(&self, bytecode: Vec<u8>) {
        let _ = self.bytecode.set(bytecode);
    }

    /// Label used for chunk names and error messages.
    pub(crate) fn label(&self) -> &str {
        self.filename.as_deref().unwrap_or("<string>")
    }

    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry {
            filename: self.filename.clone(),
            instructions: self.instructions.clone(),
            arguments: self.arguments.clone(),
            source_timestamp: self.source_timestamp,
        }
    }

    pub fn from_entry(entry: CacheEntry) -> Self {
        Artifact::new(entry.instructions, entry.arguments, entry.filename)
            .with_timestamp(entry.source_timestamp)
    }
}

/// The persisted form of an [`Artifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub filename: Option<String>,
    pub instructions: Vec<Instruction>,
    pub arguments: Option<Vec<String>>,
    pub source_timestamp: Option<SystemTime>,
}
