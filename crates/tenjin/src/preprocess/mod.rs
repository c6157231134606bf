/*
 * preprocess/mod.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Text filters applied to template source before compilation.
//!
//! Filters run in order, each receiving the previous filter's output. The
//! engine runs them once per compilation, so their cost is paid only when a
//! template is (re)compiled, never on a cached render.

mod js;
mod prefixed;
mod template;
mod trim;

use std::fmt::Debug;

use crate::error::TemplateResult;
use crate::runtime::Session;

pub use js::{JS_FUNC, JsTemplatePreprocessor};
pub use prefixed::PrefixedLinePreprocessor;
pub use template::TemplatePreprocessor;
pub use trim::{TrimMode, TrimPreprocessor};

/// A text-to-text transformation run before compilation.
pub trait TextFilter: Send + Sync + Debug {
    fn apply(&self, input: &str, scope: &FilterScope<'_>) -> TemplateResult<String>;
}

/// What a filter knows about the template it is transforming.
#[derive(Clone, Copy, Default)]
pub struct FilterScope<'a> {
    filename: Option<&'a str>,
    session: Option<&'a Session>,
}

impl<'a> FilterScope<'a> {
    pub fn new(filename: Option<&'a str>) -> Self {
        Self {
            filename,
            session: None,
        }
    }

    /// Scope bound to the render that triggered compilation.
    pub(crate) fn with_session(filename: Option<&'a str>, session: Option<&'a Session>) -> Self {
        Self { filename, session }
    }

    pub fn filename(&self) -> Option<&'a str> {
        self.filename
    }

    pub(crate) fn session(&self) -> Option<&'a Session> {
        self.session
    }
}

/// Run `filters` in order over `input`.
pub fn apply_filters(
    filters: &[Box<dyn TextFilter>],
    input: &str,
    scope: &FilterScope<'_>,
) -> TemplateResult<String> {
    let mut text = input.to_string();
    for filter in filters {
        text = filter.apply(&text, scope)?;
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filters_run_in_order() {
        let filters: Vec<Box<dyn TextFilter>> = vec![
            Box::new(PrefixedLinePreprocessor::default()),
            Box::new(TrimPreprocessor::new(TrimMode::Leading)),
        ];
        let input = "<ul>\n  :: for _, x in ipairs(xs) do\n  <li>${x}</li>\n  :: end\n</ul>\n";
        let output = apply_filters(&filters, input, &FilterScope::new(None)).unwrap();
        assert_eq!(
            output,
            "<ul>\n<?lua for _, x in ipairs(xs) do ?>\n<li>${x}</li>\n<?lua end ?>\n</ul>\n"
        );
    }

    #[test]
    fn test_no_filters_is_identity() {
        let output = apply_filters(&[], "a ${b}", &FilterScope::new(Some("x.lhtml"))).unwrap();
        assert_eq!(output, "a ${b}");
    }
}
