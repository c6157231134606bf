/*
 * preprocess/template.rs
 * Copyright (c) 2025 Posit, PBC
 */

use super::{FilterScope, TextFilter};
use crate::compiler::{Compiler, Flavor};
use crate::error::TemplateResult;
use crate::runtime::Session;
use crate::value::TemplateContext;

/// Evaluates preprocess-scope markers (`<?LUA ?>`, `${{}}`, `#{{}}`) and
/// leaves ordinary markers in place for the real compile.
///
/// Inside an engine render the preprocessing code runs in the render's own
/// session, so it sees (and may change) the context of the render that
/// triggered compilation.
#[derive(Debug, Clone, Default)]
pub struct TemplatePreprocessor {
    flavor: Flavor,
}

impl TemplatePreprocessor {
    pub fn new(flavor: Flavor) -> Self {
        Self { flavor }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Preprocess `input` against `context`. Changes the preprocessing code
    /// makes to the context are written back.
    pub fn preprocess(
        &self,
        input: &str,
        filename: Option<&str>,
        context: &mut TemplateContext,
    ) -> TemplateResult<String> {
        let artifact = Compiler::preprocessor(self.flavor).compile(input, filename)?;
        let session = Session::open(context)?;
        let output = session.execute(&artifact, None)?;
        session.store_context(context)?;
        Ok(output)
    }
}

impl TextFilter for TemplatePreprocessor {
    fn apply(&self, input: &str, scope: &FilterScope<'_>) -> TemplateResult<String> {
        let artifact = Compiler::preprocessor(self.flavor).compile(input, scope.filename())?;
        match scope.session() {
            Some(session) => session.execute(&artifact, None),
            None => Session::open(&TemplateContext::new())?.execute(&artifact, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateError;
    use pretty_assertions::assert_eq;

    const INPUT: &str = "\
<div>
  <?LUA for _, item in ipairs(items) do ?>
  <?lua for _, item in ipairs(items) do ?>
    <i>#{item}</i>
    <i>${item}</i>
    <b>#{{item}}</b>
    <b>${{item}}</b>
  <?lua end ?>
  <?LUA end ?>
</div>
";

    const EXPECTED: &str = "\
<div>
  <?lua for _, item in ipairs(items) do ?>
    <i>#{item}</i>
    <i>${item}</i>
    <b><AAA></b>
    <b>&lt;AAA&gt;</b>
  <?lua end ?>
  <?lua for _, item in ipairs(items) do ?>
    <i>#{item}</i>
    <i>${item}</i>
    <b>B&B</b>
    <b>B&amp;B</b>
  <?lua end ?>
</div>
";

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.insert("items", vec!["<AAA>", "B&B"]);
        ctx
    }

    #[test]
    fn test_expands_preprocess_markers_only() {
        let pp = TemplatePreprocessor::default();
        let output = pp
            .preprocess(INPUT, Some("items.lhtml"), &mut context())
            .unwrap();
        assert_eq!(output, EXPECTED);
    }

    #[test]
    fn test_safe_flavor_rejects_raw_preprocess_marker() {
        let pp = TemplatePreprocessor::new(Flavor::Safe);
        let err = pp
            .preprocess(INPUT, Some("items.lhtml"), &mut context())
            .unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
        assert!(err.to_string().starts_with("#{{item}}: '#{{}}' is not allowed"));

        let output = pp
            .preprocess("<b>{#=x=#}</b><b>{#==x==#}</b>", None, &mut {
                let mut ctx = TemplateContext::new();
                ctx.insert("x", "<&>");
                ctx
            })
            .unwrap();
        assert_eq!(output, "<b>&lt;&amp;&gt;</b><b><&></b>");
    }

    #[test]
    fn test_nested_markers_expand_inside_ordinary_ones() {
        let input = "\
<?LUA WEEKDAYS = {'Sun', 'Mon'} ?>
<?LUA for i, day in ipairs(WEEKDAYS) do ?>
<option value=\"#{{i}}\"#{selected(curr == #{{i}})}>${{day}}</option>
<?LUA end ?>
";
        let output = TemplatePreprocessor::default()
            .preprocess(input, None, &mut TemplateContext::new())
            .unwrap();
        assert_eq!(
            output,
            "<option value=\"1\"#{selected(curr == 1)}>Sun</option>\n\
             <option value=\"2\"#{selected(curr == 2)}>Mon</option>\n"
        );
    }

    #[test]
    fn test_filter_without_session_uses_empty_context() {
        let pp = TemplatePreprocessor::default();
        let output = pp
            .apply("[${{missing}}]${kept}", &FilterScope::new(None))
            .unwrap();
        assert_eq!(output, "[]${kept}");
    }
}
