/*
 * preprocess/trim.rs
 * Copyright (c) 2025 Posit, PBC
 */

use serde::{Deserialize, Serialize};

use super::{FilterScope, TextFilter};
use crate::error::TemplateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimMode {
    /// Remove indentation before a `<` that starts a line.
    Leading,
    /// Remove all indentation.
    Aggressive,
}

/// Strips indentation to shrink the generated HTML.
#[derive(Debug, Clone)]
pub struct TrimPreprocessor {
    mode: TrimMode,
}

impl TrimPreprocessor {
    pub fn new(mode: TrimMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> TrimMode {
        self.mode
    }

    pub fn trim(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for line in input.split_inclusive('\n') {
            let stripped = line.trim_start_matches([' ', '\t']);
            let keep = match self.mode {
                TrimMode::Aggressive => stripped,
                TrimMode::Leading if stripped.starts_with('<') => stripped,
                TrimMode::Leading => line,
            };
            out.push_str(keep);
        }
        out
    }
}

impl TextFilter for TrimPreprocessor {
    fn apply(&self, input: &str, _scope: &FilterScope<'_>) -> TemplateResult<String> {
        Ok(self.trim(input))
    }
}
