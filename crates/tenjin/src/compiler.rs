/*
 * compiler.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template compiler: template text to [`Artifact`].
//!
//! Compilation never fails on malformed embedded code; the Lua parser sees
//! the code only when the artifact is first executed. The only compile-time
//! errors are safe-mode violations.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifact::{Artifact, Instruction};
use crate::error::TemplateResult;
use crate::syntax::{self, Syntax, Token};

/// Compiler rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// `${}` escapes, `#{}` writes raw.
    #[default]
    Standard,
    /// Escape by default: `${}` and `{= =}` escape, `{== ==}` writes raw,
    /// and `#{}` is rejected.
    Safe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Render,
    Preprocess,
}

#[derive(Debug, Clone, Copy)]
pub struct Compiler {
    flavor: Flavor,
    phase: Phase,
}

impl Compiler {
    /// Compiler for ordinary templates (`<?lua ?>`, `${}`, `#{}`).
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            phase: Phase::Render,
        }
    }

    /// Compiler for the preprocessing pass (`<?LUA ?>`, `${{}}`, `#{{}}`).
    pub fn preprocessor(flavor: Flavor) -> Self {
        Self {
            flavor,
            phase: Phase::Preprocess,
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn syntax(&self) -> Syntax {
        match (self.phase, self.flavor) {
            (Phase::Render, Flavor::Standard) => syntax::RENDER,
            (Phase::Render, Flavor::Safe) => syntax::RENDER_SAFE,
            (Phase::Preprocess, Flavor::Standard) => syntax::PREPROCESS,
            (Phase::Preprocess, Flavor::Safe) => syntax::PREPROCESS_SAFE,
        }
    }

    pub fn compile(&self, text: &str, filename: Option<&str>) -> TemplateResult<Artifact> {
        let tokens = self.syntax().tokenize(text, filename)?;

        let mut instructions = Vec::new();
        let mut arguments = None;
        let mut first_statement = true;

        for token in tokens {
            match token {
                Token::Text(text) => {
                    instructions.extend(
                        text.split_inclusive('\n')
                            .map(|line| Instruction::Text(line.to_string())),
                    );
                }
                Token::Escaped(expr) => instructions.push(Instruction::Escaped(expr.to_string())),
                Token::Raw(expr) => instructions.push(Instruction::Raw(expr.to_string())),
                Token::Statement(stmt) => {
                    let mut code = stmt.code;
                    if first_statement {
                        first_statement = false;
                        if let Some((names, rest)) = parse_args_directive(code, filename) {
                            arguments = Some(names);
                            code = rest;
                        }
                    }
                    if code.trim().is_empty() {
                        continue;
                    }
                    let lspace = stmt.lspace.unwrap_or("");
                    instructions.push(Instruction::Statement(format!("{lspace}{code}")));
                }
            }
        }

        Ok(Artifact::new(
            instructions,
            arguments,
            filename.map(str::to_string),
        ))
    }
}

/// Recognize `#@ARGS a, b` on the first non-blank line of a statement block.
/// Returns the declared names and the remaining code.
fn parse_args_directive<'a>(
    code: &'a str,
    filename: Option<&str>,
) -> Option<(Vec<String>, &'a str)> {
    let leading = code.len() - code.trim_start().len();
    let body = &code[leading..];
    let rest = body.strip_prefix("#@ARGS")?;
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    let (line, remainder) = match rest.find('\n') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };

    let mut names = Vec::new();
    for name in line.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if is_identifier(name) {
            names.push(name.to_string());
        } else {
            warn!(
                name,
                filename = filename.unwrap_or("<string>"),
                "ignoring invalid #@ARGS name"
            );
        }
    }
    Some((names, remainder))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(text: &str) -> Artifact {
        Compiler::new(Flavor::Standard).compile(text, None).unwrap()
    }

    #[test]
    fn test_literal_lines_are_split() {
        let artifact = compile("<p>\n  ${title}\n</p>");
        assert_eq!(
            artifact.instructions(),
            &[
                Instruction::Text("<p>\n".to_string()),
                Instruction::Text("  ".to_string()),
                Instruction::Escaped("title".to_string()),
                Instruction::Text("\n".to_string()),
                Instruction::Text("</p>".to_string()),
            ]
        );
        assert_eq!(artifact.arguments(), None);
    }

    #[test]
    fn test_statements_keep_indentation() {
        let artifact = compile("<?lua for _, x in ipairs(xs) do ?>\n  <?lua if x then ?>\n");
        assert_eq!(
            artifact.instructions(),
            &[
                Instruction::Statement("for _, x in ipairs(xs) do".to_string()),
                Instruction::Statement("  if x then".to_string()),
            ]
        );
    }

    #[test]
    fn test_args_directive() {
        let artifact = compile("<?lua #@ARGS val, other ?>\nval=#{val}");
        assert_eq!(
            artifact.arguments(),
            Some(&["val".to_string(), "other".to_string()][..])
        );
        assert_eq!(
            artifact.instructions(),
            &[
                Instruction::Text("val=".to_string()),
                Instruction::Raw("val".to_string()),
            ]
        );
    }

    #[test]
    fn test_args_directive_with_code_below() {
        let artifact = compile("<?lua\n#@ARGS items\nlocal n = #items ?>\n");
        assert_eq!(artifact.arguments(), Some(&["items".to_string()][..]));
        assert_eq!(
            artifact.instructions(),
            &[Instruction::Statement("local n = #items".to_string())]
        );
    }

    #[test]
    fn test_empty_args_declaration() {
        let artifact = compile("<?lua #@ARGS ?>\nhi");
        assert_eq!(artifact.arguments(), Some(&[][..]));
    }

    #[test]
    fn test_args_only_in_first_statement() {
        let artifact = compile("<?lua x = 1 ?>\n<?lua #@ARGS val ?>\n");
        assert_eq!(artifact.arguments(), None);
        assert_eq!(artifact.instructions().len(), 2);
    }

    #[test]
    fn test_invalid_arg_names_are_dropped() {
        let artifact = compile("<?lua #@ARGS ok, 9bad, also_ok ?>\n");
        assert_eq!(
            artifact.arguments(),
            Some(&["ok".to_string(), "also_ok".to_string()][..])
        );
    }

    #[test]
    fn test_malformed_code_compiles() {
        // errors in embedded code surface at execution time
        let artifact = compile("<?lua if then ?>\n${)}");
        assert_eq!(
            artifact.instructions(),
            &[
                Instruction::Statement("if then".to_string()),
                Instruction::Text("${)}".to_string()),
            ]
        );
    }

    #[test]
    fn test_safe_flavor_rejects_raw() {
        let err = Compiler::new(Flavor::Safe)
            .compile("<p>#{x}</p>", Some("page.lhtml"))
            .unwrap_err();
        assert!(err.to_string().contains("#{x}"));

        let artifact = Compiler::new(Flavor::Safe)
            .compile("{=x=}{==y==}", None)
            .unwrap();
        assert_eq!(
            artifact.instructions(),
            &[
                Instruction::Escaped("x".to_string()),
                Instruction::Raw("y".to_string()),
            ]
        );
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let text = "<?lua for i = 1, n do ?>\n<li>${i}</li>\n<?lua end ?>\n";
        assert_eq!(compile(text).instructions(), compile(text).instructions());
        assert_eq!(compile(text).script(), compile(text).script());
    }
}
