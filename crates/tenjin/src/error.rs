/*
 * error.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Error types for template compilation, rendering and caching.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during template operations.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Structural error found while compiling or preprocessing a template.
    #[error("{message} (file: {filename}, line: {line})")]
    Syntax {
        message: String,
        filename: String,
        line: usize,
    },

    /// Template name did not resolve against any search path entry.
    #[error("{name}: filename not found (path={})", SearchPath(.path))]
    NotFound { name: String, path: Vec<PathBuf> },

    /// A declared-argument template referenced a name the context lacks.
    #[error("unresolved reference '{name}' in {filename}")]
    UnresolvedReference { name: String, filename: String },

    /// Failure raised by the embedded language while executing a template.
    #[error("{filename}: {message}")]
    Execution { filename: String, message: String },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error (e.g., reading a template file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TemplateError {
    pub(crate) fn syntax(
        message: impl Into<String>,
        filename: Option<&str>,
        line: usize,
    ) -> Self {
        TemplateError::Syntax {
            message: message.into(),
            filename: filename.unwrap_or("<string>").to_string(),
            line,
        }
    }

    /// Lossy copy, used when an error has to cross the Lua boundary twice.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            TemplateError::Syntax {
                message,
                filename,
                line,
            } => TemplateError::Syntax {
                message: message.clone(),
                filename: filename.clone(),
                line: *line,
            },
            TemplateError::NotFound { name, path } => TemplateError::NotFound {
                name: name.clone(),
                path: path.clone(),
            },
            TemplateError::UnresolvedReference { name, filename } => {
                TemplateError::UnresolvedReference {
                    name: name.clone(),
                    filename: filename.clone(),
                }
            }
            TemplateError::Execution { filename, message } => TemplateError::Execution {
                filename: filename.clone(),
                message: message.clone(),
            },
            TemplateError::Config(message) => TemplateError::Config(message.clone()),
            TemplateError::Io(err) => {
                TemplateError::Io(std::io::Error::new(err.kind(), err.to_string()))
            }
        }
    }
}

/// Renders a search path the way it is reported in `NotFound` messages:
/// `['views/blog', 'views']`.
struct SearchPath<'a>(&'a [PathBuf]);

impl fmt::Display for SearchPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dir) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{}'", dir.display())?;
        }
        write!(f, "]")
    }
}

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors raised by cache storages and codecs.
///
/// These never reach the caller of a render: the engine turns read failures
/// into cache misses and logs write failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cache entry: {0}")]
    Encode(String),

    #[error("failed to decode cache entry: {0}")]
    Decode(String),

    /// The entry was written by a different runtime build or format version.
    #[error("incompatible cache entry: {0}")]
    Incompatible(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
