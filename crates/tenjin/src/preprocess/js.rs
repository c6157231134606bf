/*
 * preprocess/js.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Client-side template extraction.
//!
//! A block delimited by `<!-- #JS: name(args) -->` and `<!-- #/JS -->` is
//! replaced by a `<script>` element defining a JavaScript function that
//! renders the block in the browser. Inside the block, `<?js ... ?>` holds
//! JavaScript statements, `${}` and `{= =}` escaped expressions, and `#{}`
//! and `{== ==}` raw expressions. The generated code calls the `_E` and `_S`
//! helpers from [`JS_FUNC`].

use once_cell::sync::Lazy;
use regex::Regex;

use super::{FilterScope, TextFilter};
use crate::error::{TemplateError, TemplateResult};
use crate::syntax::{self, Token};

/// JavaScript helpers needed by generated functions: `_S` converts to
/// string and `_E` converts and HTML-escapes.
pub const JS_FUNC: &str = "\
function _S(x){return x==null?'':x;}
function _E(x){return x==null?'':typeof(x)!=='string'?x:x.replace(/[&<>\"']/g,_EF);}
var _ET={'&':\"&amp;\",'<':\"&lt;\",'>':\"&gt;\",'\"':\"&quot;\",\"'\":\"&#039;\"};
function _EF(c){return _ET[c];};";

const END_MARKER: &str = "<!-- #/JS -->";

static MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^([ \t]*)<!-- #(?:JS: (.*?)(\(.*?\))|(/JS)) -->([ \t]*\r?\n)?")
        .expect("marker pattern is valid")
});

struct OpenBlock<'a> {
    name: &'a str,
    args: &'a str,
    body_start: usize,
    line: usize,
}

enum Piece<'a> {
    Text(&'a str),
    Expr(String),
}

#[derive(Debug, Clone, Default)]
pub struct JsTemplatePreprocessor {
    script_type: Option<String>,
}

impl JsTemplatePreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `<script type="...">` instead of a bare `<script>`.
    pub fn with_type(mut self, script_type: impl Into<String>) -> Self {
        self.script_type = Some(script_type.into());
        self
    }

    pub fn convert(&self, input: &str, filename: Option<&str>) -> TemplateResult<String> {
        let mut out = String::with_capacity(input.len() + input.len() / 4);
        let mut open: Option<OpenBlock<'_>> = None;
        let mut pos = 0;

        for caps in MARKER.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            let indent = caps.get(1).map_or("", |m| m.as_str());
            let newline = caps.get(5).is_some();
            let line = syntax::line_of(input, whole.start());

            if caps.get(4).is_some() {
                let Some(block) = open.take() else {
                    return Err(TemplateError::syntax(
                        format!("unexpected '{END_MARKER}'."),
                        filename,
                        line,
                    ));
                };
                self.convert_body(&input[block.body_start..whole.start()], filename, &mut out)?;
                out.push_str(indent);
                out.push_str("return _buf;};</script>");
            } else {
                let name = caps.get(2).map_or("", |m| m.as_str());
                let args = caps.get(3).map_or("", |m| m.as_str());
                if let Some(outer) = &open {
                    return Err(TemplateError::syntax(
                        format!("{name}{args} is nested in {}{}.", outer.name, outer.args),
                        filename,
                        line,
                    ));
                }
                out.push_str(&input[pos..whole.start()]);
                out.push_str(indent);
                match &self.script_type {
                    Some(script_type) => {
                        out.push_str("<script type=\"");
                        out.push_str(script_type);
                        out.push_str("\">");
                    }
                    None => out.push_str("<script>"),
                }
                if is_plain_name(name) {
                    out.push_str(&format!("function {name}{args}{{var _buf='';"));
                } else {
                    out.push_str(&format!("{name}=function{args}{{var _buf='';"));
                }
                open = Some(OpenBlock {
                    name,
                    args,
                    body_start: whole.end(),
                    line,
                });
            }
            if newline {
                out.push('\n');
            }
            pos = whole.end();
        }

        if let Some(block) = open {
            return Err(TemplateError::syntax(
                format!(
                    "{}{} is not closed by '{END_MARKER}'.",
                    block.name, block.args
                ),
                filename,
                block.line,
            ));
        }
        out.push_str(&input[pos..]);
        Ok(out)
    }

    fn convert_body(
        &self,
        body: &str,
        filename: Option<&str>,
        out: &mut String,
    ) -> TemplateResult<()> {
        let mut run = Vec::new();
        for token in syntax::SCRIPT.tokenize(body, filename)? {
            match token {
                Token::Text(text) => run.push(Piece::Text(text)),
                Token::Escaped(expr) => run.push(Piece::Expr(format!("_E({expr})"))),
                Token::Raw(expr) => run.push(Piece::Expr(format!("_S({expr})"))),
                Token::Statement(stmt) => {
                    flush_run(&mut run, out);
                    out.push_str(stmt.lspace.unwrap_or(""));
                    out.push_str(stmt.mspace);
                    out.push_str(stmt.code);
                    if stmt.newline {
                        out.push('\n');
                    }
                }
            }
        }
        flush_run(&mut run, out);
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '_' || c.is_alphanumeric())
}

/// Emit one `_buf+=...;` statement for a run of text and expressions.
fn flush_run(run: &mut Vec<Piece<'_>>, out: &mut String) {
    if run.is_empty() {
        return;
    }
    let ends_with_newline = matches!(run.last(), Some(Piece::Text(text)) if text.ends_with('\n'));

    out.push_str("_buf+=");
    if matches!(run.first(), Some(Piece::Expr(_))) {
        out.push_str("''+");
    }
    let last = run.len() - 1;
    for (i, piece) in run.iter().enumerate() {
        if i > 0 {
            out.push('+');
        }
        match piece {
            Piece::Text(text) => {
                out.push('\'');
                push_js_text(text, i == last, out);
                out.push('\'');
            }
            Piece::Expr(expr) => out.push_str(expr),
        }
    }
    out.push(';');
    if ends_with_newline {
        out.push('\n');
    }
    run.clear();
}

/// Quote `text` for a single-quoted JavaScript string. Line breaks inside
/// the run continue the literal onto the next source line so the generated
/// code keeps the template's line structure.
fn push_js_text(text: &str, last: bool, out: &mut String) {
    let final_newline = if last && text.ends_with('\n') {
        Some(text.len() - 1)
    } else {
        None
    };
    for (i, c) in text.char_indices() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\r' => out.push_str("\\r"),
            '\n' if Some(i) == final_newline => out.push_str("\\n"),
            '\n' => out.push_str("\\n\\\n"),
            c => out.push(c),
        }
    }
}

impl TextFilter for JsTemplatePreprocessor {
    fn apply(&self, input: &str, scope: &FilterScope<'_>) -> TemplateResult<String> {
        self.convert(input, scope.filename())
    }
}
