/*
 * script.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Lowering of instruction sequences into Lua chunks.
//!
//! Every chunk has the same calling convention: it receives its environment
//! table and the output buffer (a Lua sequence of strings) as varargs.
//! Declaring `_ENV` as a local makes every free name in the template resolve
//! through that environment, which is how undeclared templates see the
//! context and declared templates get strict lookups.
//!
//! ```text
//! local _ENV, _buf = ...
//! local title = _context.title
//! _buf[#_buf + 1] = "<h1>"
//! _buf[#_buf + 1] = _escape(title)
//! _buf[#_buf + 1] = "</h1>\n"
//! ```

use std::fmt::Write;

use crate::artifact::Instruction;

const PROLOGUE: &str = "local _ENV, _buf = ...\n";

pub(crate) fn lower(instructions: &[Instruction], arguments: Option<&[String]>) -> String {
    let mut out = String::from(PROLOGUE);

    if let Some(names) = arguments.filter(|names| !names.is_empty()) {
        let _ = writeln!(
            out,
            "local {} = {}",
            names.join(", "),
            names
                .iter()
                .map(|n| format!("_context.{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut pending = String::new();
    for instruction in instructions {
        if let Instruction::Text(text) = instruction {
            pending.push_str(text);
            continue;
        }
        flush_text(&mut out, &mut pending);
        match instruction {
            Instruction::Escaped(expr) => {
                let _ = writeln!(out, "_buf[#_buf + 1] = _escape({expr})");
            }
            Instruction::Raw(expr) => {
                let _ = writeln!(out, "_buf[#_buf + 1] = _to_str({expr})");
            }
            Instruction::Statement(code) => {
                out.push_str(code.trim_end());
                out.push('\n');
            }
            Instruction::Text(_) => {}
        }
    }
    flush_text(&mut out, &mut pending);
    out
}

fn flush_text(out: &mut String, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    out.push_str("_buf[#_buf + 1] = ");
    out.push_str(&lua_string(pending));
    out.push('\n');
    pending.clear();
}

/// Quote `s` as a Lua string literal.
pub(crate) fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                let _ = write!(out, "\\{:03}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lower_coalesces_text() {
        let instructions = vec![
            Instruction::Text("<ul>\n".to_string()),
            Instruction::Statement("for _, item in ipairs(items) do\n".to_string()),
            Instruction::Text("  <li>".to_string()),
            Instruction::Escaped("item".to_string()),
            Instruction::Text("</li>\n".to_string()),
            Instruction::Statement("end".to_string()),
            Instruction::Text("</ul>\n".to_string()),
            Instruction::Text("<p>done</p>\n".to_string()),
        ];
        let expected = r#"local _ENV, _buf = ...
_buf[#_buf + 1] = "<ul>\n"
for _, item in ipairs(items) do
_buf[#_buf + 1] = "  <li>"
_buf[#_buf + 1] = _escape(item)
_buf[#_buf + 1] = "</li>\n"
end
_buf[#_buf + 1] = "</ul>\n<p>done</p>\n"
"#;
        assert_eq!(lower(&instructions, None), expected);
    }

    #[test]
    fn test_lower_declared_arguments() {
        let instructions = vec![
            Instruction::Text("val=".to_string()),
            Instruction::Raw("val".to_string()),
        ];
        let args = vec!["val".to_string(), "other".to_string()];
        let expected = r#"local _ENV, _buf = ...
local val, other = _context.val, _context.other
_buf[#_buf + 1] = "val="
_buf[#_buf + 1] = _to_str(val)
"#;
        assert_eq!(lower(&instructions, Some(&args)), expected);
        // an empty declaration binds nothing
        assert_eq!(
            lower(&instructions, Some(&[])),
            lower(&instructions, None)
        );
    }

    #[test]
    fn test_lua_string() {
        assert_eq!(lua_string("a\"b\\c\n"), r#""a\"b\\c\n""#);
        assert_eq!(lua_string("\u{1}"), r#""\001""#);
        assert_eq!(lua_string("héllo"), "\"héllo\"");
    }
}
