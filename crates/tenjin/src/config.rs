/*
 * config.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Engine configuration.
//!
//! Every field has a default, so a configuration file only names what it
//! changes:
//!
//! ```toml
//! postfix = ".lhtml"
//! layout = ":layout"
//! path = ["views/blog", "views"]
//! cache = "bytecode"
//! trim = "leading"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheKind;
use crate::compiler::Flavor;
use crate::error::{TemplateError, TemplateResult};
use crate::preprocess::TrimMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Prepended to `:name` short names.
    pub prefix: String,
    /// Appended to `:name` short names.
    pub postfix: String,
    /// Default layout template.
    pub layout: Option<String>,
    /// Directories searched in order; empty means names are used as given.
    pub path: Vec<PathBuf>,
    pub cache: CacheKind,
    pub cache_suffix: String,
    /// Seconds during which a cached template is trusted without checking
    /// its source file. `0` checks on every lookup.
    pub timestamp_interval: f64,
    /// Run the template preprocessor before compiling.
    pub preprocess: bool,
    pub flavor: Flavor,
    pub preprocessor_flavor: Flavor,
    pub trim: Option<TrimMode>,
    pub line_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            postfix: String::new(),
            layout: None,
            path: Vec::new(),
            cache: CacheKind::default(),
            cache_suffix: ".cache".to_string(),
            timestamp_interval: 1.0,
            preprocess: false,
            flavor: Flavor::Standard,
            preprocessor_flavor: Flavor::Standard,
            trim: None,
            line_prefix: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> TemplateResult<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| TemplateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> TemplateResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Configuration for escape-by-default templates.
    pub fn safe() -> Self {
        Self {
            flavor: Flavor::Safe,
            preprocessor_flavor: Flavor::Safe,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> TemplateResult<()> {
        if !self.timestamp_interval.is_finite() || self.timestamp_interval < 0.0 {
            return Err(TemplateError::Config(format!(
                "timestamp_interval must be a non-negative number of seconds, got {}",
                self.timestamp_interval
            )));
        }
        if self.cache_suffix.is_empty() && self.cache != CacheKind::None {
            return Err(TemplateError::Config(
                "cache_suffix must not be empty; cache files would overwrite templates"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn timestamp_interval(&self) -> Duration {
        Duration::from_secs_f64(self.timestamp_interval)
    }
}
