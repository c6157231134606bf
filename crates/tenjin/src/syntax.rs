/*
 * syntax.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Lexical scanning of template text.
//!
//! The scanner splits template text into literal runs, placeholders and
//! statement blocks. It knows nothing about the embedded language: statement
//! bodies are matched purely by their markers and placeholder bodies by
//! bracket depth, so malformed embedded code never fails here.
//!
//! A [`Syntax`] is a rule set: the statement marker (`<?lua`, `<?LUA`, ...)
//! and a table of placeholder delimiters. Several openers can start at the
//! same position (`${` and `${{`); the table lists longer openers first.

use crate::error::{TemplateError, TemplateResult};

/// What to do with a placeholder once its delimiters are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Evaluate and HTML-escape.
    Escape,
    /// Evaluate and emit as-is.
    Raw,
    /// Not ours: keep the whole placeholder as literal text.
    Literal,
    /// Forbidden in this rule set.
    Reject(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Delimiter {
    pub open: &'static str,
    pub close: &'static str,
    pub action: Action,
}

const fn delim(open: &'static str, close: &'static str, action: Action) -> Delimiter {
    Delimiter {
        open,
        close,
        action,
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Syntax {
    pub statement: &'static str,
    pub delimiters: &'static [Delimiter],
}

pub(crate) const RENDER: Syntax = Syntax {
    statement: "<?lua",
    delimiters: &[
        delim("${{", "}}", Action::Literal),
        delim("#{{", "}}", Action::Literal),
        delim("${", "}", Action::Escape),
        delim("#{", "}", Action::Raw),
    ],
};

pub(crate) const RENDER_SAFE: Syntax = Syntax {
    statement: "<?lua",
    delimiters: &[
        delim("${{", "}}", Action::Literal),
        delim("#{{", "}}", Action::Literal),
        delim("{#==", "==#}", Action::Literal),
        delim("{#=", "=#}", Action::Literal),
        delim("{==", "==}", Action::Raw),
        delim("{=", "=}", Action::Escape),
        delim("${", "}", Action::Escape),
        delim("#{", "}", Action::Reject("'#{}' is not allowed in safe templates.")),
    ],
};

pub(crate) const PREPROCESS: Syntax = Syntax {
    statement: "<?LUA",
    delimiters: &[
        delim("${{", "}}", Action::Escape),
        delim("#{{", "}}", Action::Raw),
    ],
};

pub(crate) const PREPROCESS_SAFE: Syntax = Syntax {
    statement: "<?LUA",
    delimiters: &[
        delim("{#==", "==#}", Action::Raw),
        delim("{#=", "=#}", Action::Escape),
        delim("${{", "}}", Action::Escape),
        delim(
            "#{{",
            "}}",
            Action::Reject("'#{{}}' is not allowed in safe preprocessing."),
        ),
    ],
};

/// Client-side script templates inside `<!-- #JS: ... -->` blocks.
pub(crate) const SCRIPT: Syntax = Syntax {
    statement: "<?js",
    delimiters: &[
        delim("{==", "==}", Action::Raw),
        delim("{=", "=}", Action::Escape),
        delim("${", "}", Action::Escape),
        delim("#{", "}", Action::Raw),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Text(&'a str),
    Escaped(&'a str),
    Raw(&'a str),
    Statement(Statement<'a>),
}

/// A statement block and the whitespace around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Statement<'a> {
    /// Indentation before the marker, when the marker starts its line.
    pub lspace: Option<&'a str>,
    /// The single whitespace character (or line break) after the marker.
    pub mspace: &'a str,
    pub code: &'a str,
    /// A line break after `?>` was consumed.
    pub newline: bool,
    /// Line of the opening marker, 1-based.
    pub line: usize,
}

impl Syntax {
    /// Scan `text` into tokens, in document order.
    pub(crate) fn tokenize<'a>(
        &self,
        text: &'a str,
        filename: Option<&str>,
    ) -> TemplateResult<Vec<Token<'a>>> {
        let mut tokens = Vec::new();
        let mut is_bol = true;
        let mut pos = 0;

        while let Some(found) = self.find_statement(text, pos) {
            let mut before = &text[pos..found.start];
            let mut lspace = None;
            if before.is_empty() {
                if is_bol {
                    lspace = Some("");
                }
            } else if before.ends_with('\n') {
                lspace = Some("");
            } else {
                match before.rfind('\n') {
                    None => {
                        if is_bol && is_blank(before) {
                            lspace = Some(before);
                            before = "";
                        }
                    }
                    Some(i) => {
                        let tail = &before[i + 1..];
                        if is_blank(tail) {
                            lspace = Some(tail);
                            before = &before[..=i];
                        }
                    }
                }
            }

            self.scan_placeholders(before, pos, text, filename, &mut tokens)?;
            tokens.push(Token::Statement(Statement {
                lspace,
                mspace: &text[found.mspace.0..found.mspace.1],
                code: &text[found.code.0..found.code.1],
                newline: found.newline,
                line: line_of(text, found.start),
            }));
            is_bol = found.newline;
            pos = found.end;
        }

        self.scan_placeholders(&text[pos..], pos, text, filename, &mut tokens)?;
        Ok(tokens)
    }

    fn find_statement(&self, text: &str, from: usize) -> Option<StatementMatch> {
        let marker = self.statement;
        let mut search = from;
        while let Some(offset) = text[search..].find(marker) {
            let start = search + offset;
            let after = start + marker.len();
            let rest = &text[after..];
            let mspace_len = if rest.starts_with("\r\n") {
                2
            } else if rest.starts_with([' ', '\t', '\n']) {
                1
            } else {
                search = after;
                continue;
            };
            let code_start = after + mspace_len;
            let Some(close) = text[code_start..].find("?>") else {
                return None;
            };
            let mut code_end = code_start + close;
            if code_end > code_start && text.as_bytes()[code_end - 1] == b' ' {
                code_end -= 1;
            }
            let mut end = code_start + close + 2;
            let trailing = &text[end..];
            let spaces = trailing.len() - trailing.trim_start_matches([' ', '\t']).len();
            let after_spaces = &trailing[spaces..];
            let newline = if after_spaces.starts_with("\r\n") {
                end += spaces + 2;
                true
            } else if after_spaces.starts_with('\n') {
                end += spaces + 1;
                true
            } else {
                false
            };
            return Some(StatementMatch {
                start,
                mspace: (after, code_start),
                code: (code_start, code_end),
                end,
                newline,
            });
        }
        None
    }

    /// Scan a literal run for placeholders. `base` is the offset of `run`
    /// within `full`, used for line numbers in errors.
    fn scan_placeholders<'a>(
        &self,
        run: &'a str,
        base: usize,
        full: &str,
        filename: Option<&str>,
        tokens: &mut Vec<Token<'a>>,
    ) -> TemplateResult<()> {
        let bytes = run.as_bytes();
        let mut text_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let Some(delimiter) = self
                .delimiters
                .iter()
                .find(|d| bytes[i..].starts_with(d.open.as_bytes()))
            else {
                i += 1;
                continue;
            };

            let body_start = i + delimiter.open.len();
            let Some(body_len) = find_close(&run[body_start..], delimiter.close) else {
                // unterminated: the opener is plain text
                i = body_start;
                continue;
            };
            let end = body_start + body_len + delimiter.close.len();
            let body = run[body_start..body_start + body_len].trim();

            match delimiter.action {
                Action::Literal => {}
                Action::Escape | Action::Raw => {
                    if text_start < i {
                        tokens.push(Token::Text(&run[text_start..i]));
                    }
                    tokens.push(if delimiter.action == Action::Escape {
                        Token::Escaped(body)
                    } else {
                        Token::Raw(body)
                    });
                    text_start = end;
                }
                Action::Reject(message) => {
                    return Err(TemplateError::syntax(
                        format!("{}: {}", &run[i..end], message),
                        filename,
                        line_of(full, base + i),
                    ));
                }
            }
            i = end;
        }

        if text_start < run.len() {
            tokens.push(Token::Text(&run[text_start..]));
        }
        Ok(())
    }
}

struct StatementMatch {
    start: usize,
    mspace: (usize, usize),
    code: (usize, usize),
    end: usize,
    newline: bool,
}

fn is_blank(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b == b' ' || b == b'\t')
}

/// 1-based line number of byte offset `pos`.
pub(crate) fn line_of(text: &str, pos: usize) -> usize {
    text.as_bytes()[..pos].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Find where `close` ends a placeholder body, skipping over nested
/// brackets and quoted strings. Returns the byte length of the body, or
/// `None` if a stray closing bracket or the end of input comes first.
fn find_close(body: &str, close: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let close = close.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        if depth == 0 && bytes[i..].starts_with(close) {
            return Some(i);
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
            }
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}
