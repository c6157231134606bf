/*
 * preprocess/prefixed.rs
 * Copyright (c) 2025 Posit, PBC
 */

use super::{FilterScope, TextFilter};
use crate::error::TemplateResult;
use crate::syntax;

const DEFAULT_PREFIX: &str = "::";

/// Turns prefixed lines into statement blocks:
///
/// ```text
/// :: for _, item in ipairs(items) do      <?lua for _, item in ipairs(items) do ?>
///   <li>${item}</li>                  =>    <li>${item}</li>
/// :: end                                  <?lua end ?>
/// ```
///
/// The prefix must be followed by whitespace or the end of the line. Lines
/// inside an existing multi-line `<?lua ... ?>` block are left alone.
#[derive(Debug, Clone)]
pub struct PrefixedLinePreprocessor {
    prefix: String,
}

impl Default for PrefixedLinePreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl PrefixedLinePreprocessor {
    /// Trailing whitespace in `prefix` is ignored, so `":: "` and `"::"`
    /// are the same prefix.
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end();
        Self {
            prefix: if prefix.is_empty() {
                DEFAULT_PREFIX.to_string()
            } else {
                prefix.to_string()
            },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn convert(&self, input: &str) -> String {
        let marker = syntax::RENDER.statement;
        let mut out = String::with_capacity(input.len() + input.len() / 8);
        let mut in_block = false;

        for line in input.split_inclusive('\n') {
            if !in_block && let Some(converted) = self.convert_line(line, marker) {
                out.push_str(&converted);
                continue;
            }
            out.push_str(line);
            in_block = block_state_after(line, marker, in_block);
        }
        out
    }

    fn convert_line(&self, line: &str, marker: &str) -> Option<String> {
        let body = line.trim_start_matches([' ', '\t']);
        let indent = &line[..line.len() - body.len()];
        let rest = body.strip_prefix(self.prefix.as_str())?;

        let content_len = rest.trim_end_matches(['\n', '\r']).len();
        let (code, ending) = rest.split_at(content_len);
        if !(code.is_empty() || code.starts_with([' ', '\t'])) {
            return None;
        }
        Some(format!("{indent}{marker}{code} ?>{ending}"))
    }
}

/// Whether a statement block is still open at the end of `line`.
fn block_state_after(line: &str, marker: &str, mut open: bool) -> bool {
    let mut rest = line;
    loop {
        if open {
            match rest.find("?>") {
                Some(i) => {
                    open = false;
                    rest = &rest[i + 2..];
                }
                None => return true,
            }
        } else {
            match rest.find(marker) {
                Some(i) => {
                    open = true;
                    rest = &rest[i + marker.len()..];
                }
                None => return false,
            }
        }
    }
}

impl TextFilter for PrefixedLinePreprocessor {
    fn apply(&self, input: &str, _scope: &FilterScope<'_>) -> TemplateResult<String> {
        Ok(self.convert(input))
    }
}
