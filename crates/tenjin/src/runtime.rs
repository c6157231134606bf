/*
 * runtime.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Lua execution of compiled templates.
//!
//! A [`Session`] is one Lua state plus the live context table of a render.
//! Every template executed during that render (the main template, its
//! includes, its layouts, and any preprocessing they trigger) runs in the
//! same session, so assignments to `_context` are shared between them.
//!
//! Sessions are short-lived and never cross threads; the engine opens a new
//! one per top-level render and stays `Send + Sync` itself.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;

use mlua::{ChunkMode, Function, Lua, LuaOptions, StdLib, Table, Value};
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::error::{TemplateError, TemplateResult};
use crate::escape::escape_html;
use crate::preprocess::JS_FUNC;
use crate::value::{TemplateContext, TemplateValue};

const PRELUDE: &str = include_str!("prelude.lua");

/// Nesting limit when copying Lua tables back into [`TemplateValue`]s.
const MAX_DEPTH: usize = 64;

/// Upper bound on the values produced by one copy back into Rust. Tables
/// shared between several places are reused, and this keeps a deeply
/// shared structure from multiplying out.
const MAX_VALUES: usize = 1 << 20;

/// Context keys owned by the engine and removed before the context is
/// handed back to the caller.
pub(crate) const RESERVED_KEYS: [&str; 2] = ["_layout", "_content"];

pub(crate) struct Session {
    lua: Lua,
    context: Table,
    base: Table,
    new_env: Function,
    as_escaped: Function,
    escaped_mt: Table,
    flush: Function,
    /// Keys the caller passed as `Null`. Lua cannot store nil in a table,
    /// so these are remembered to count as bound for `#@ARGS`.
    null_keys: HashSet<String>,
}

impl Session {
    pub(crate) fn open(context: &TemplateContext) -> TemplateResult<Self> {
        // SAFETY: the unsafe constructor only lifts the ban on binary chunks.
        // Binary chunks come from `Function::dump` in this process or from
        // bytecode cache files that carry the Lua version that wrote them.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) };

        let escape = lua.create_function(|_, s: String| Ok(escape_html(&s)))?;
        let unresolved = lua.create_function(|_, (name, filename): (String, String)| {
            Err::<(), _>(mlua::Error::external(TemplateError::UnresolvedReference {
                name,
                filename,
            }))
        })?;
        let prelude: Table = lua
            .load(PRELUDE)
            .set_name("=tenjin.prelude")
            .call((escape, unresolved))?;

        let session = Session {
            context: lua.create_table()?,
            base: prelude.get("base")?,
            new_env: prelude.get("new_env")?,
            as_escaped: prelude.get("as_escaped")?,
            escaped_mt: prelude.get("escaped_mt")?,
            flush: prelude.get("flush")?,
            null_keys: context
                .iter()
                .filter(|(_, value)| matches!(value, TemplateValue::Null))
                .map(|(key, _)| key.clone())
                .collect(),
            lua,
        };
        session.set_escaped_helper("JS_FUNC", JS_FUNC)?;
        for (key, value) in context.iter() {
            session.context.raw_set(key.as_str(), session.to_lua(value)?)?;
        }
        Ok(session)
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Bind a helper into the base scope every environment falls back to.
    pub(crate) fn set_helper(&self, name: &str, value: impl mlua::IntoLua) -> TemplateResult<()> {
        self.base.raw_set(name, value)?;
        Ok(())
    }

    pub(crate) fn set_escaped_helper(&self, name: &str, text: &str) -> TemplateResult<()> {
        let value: Value = self.as_escaped.call(text)?;
        self.set_helper(name, value)
    }

    /// Run `artifact` against the session context.
    ///
    /// With `buf`, output is appended to that buffer and an empty string is
    /// returned; otherwise the output is returned.
    pub(crate) fn execute(&self, artifact: &Artifact, buf: Option<Table>) -> TemplateResult<String> {
        self.execute_in(artifact, buf, self.context.clone())
    }

    /// Like [`Session::execute`], against `context` instead of the session
    /// context. Includes with extra variables run against a copy.
    pub(crate) fn execute_in(
        &self,
        artifact: &Artifact,
        buf: Option<Table>,
        context: Table,
    ) -> TemplateResult<String> {
        let label = artifact.label();

        if let Some(names) = artifact.arguments() {
            for name in names {
                let value: Value = context.raw_get(name.as_str())?;
                if value.is_nil() && !self.null_keys.contains(name) {
                    return Err(TemplateError::UnresolvedReference {
                        name: name.clone(),
                        filename: label.to_string(),
                    });
                }
            }
        }

        let function = self.load(artifact)?;
        let owned = buf.is_none();
        let buf = match buf {
            Some(buf) => buf,
            None => self.lua.create_table()?,
        };
        let env: Table = self.new_env.call((
            context,
            buf.clone(),
            artifact.arguments().is_some(),
            label,
        ))?;

        function
            .call::<()>((env, buf.clone()))
            .map_err(|err| lua_error(err, label))?;

        if owned {
            Ok(self.flush.call::<String>(buf)?)
        } else {
            Ok(String::new())
        }
    }

    fn load(&self, artifact: &Artifact) -> TemplateResult<Function> {
        let label = artifact.label();
        let name = format!("={label}");

        if let Some(bytecode) = artifact.bytecode() {
            match self
                .lua
                .load(bytecode)
                .set_name(name.as_str())
                .set_mode(ChunkMode::Binary)
                .into_function()
            {
                Ok(function) => return Ok(function),
                Err(err) => warn!(filename = label, %err, "discarding unloadable bytecode"),
            }
        }

        debug!(filename = label, "loading template chunk");
        let function = self
            .lua
            .load(artifact.script())
            .set_name(name.as_str())
            .set_mode(ChunkMode::Text)
            .into_function()
            .map_err(|err| lua_error(err, label))?;
        artifact.set_bytecode(function.dump(false));
        Ok(function)
    }

    /// Remove `key` from the context, returning its previous value.
    pub(crate) fn take(&self, key: &str) -> TemplateResult<TemplateValue> {
        let value: Value = self.context.raw_get(key)?;
        self.context.raw_set(key, Value::Nil)?;
        Ok(Writeback::new(&self.escaped_mt)
            .convert(value, 0)?
            .unwrap_or_default())
    }

    pub(crate) fn set(&self, key: &str, value: &TemplateValue) -> TemplateResult<()> {
        self.context.raw_set(key, self.to_lua(value)?)?;
        Ok(())
    }

    /// Copy the context table back into `context`, dropping engine keys and
    /// values with no Rust counterpart (functions, userdata).
    pub(crate) fn store_context(&self, context: &mut TemplateContext) -> TemplateResult<()> {
        let mut writeback = Writeback::new(&self.escaped_mt);
        let mut variables = HashMap::new();
        for pair in self.context.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let Value::String(key) = key else {
                continue;
            };
            let key = key.to_str()?.to_string();
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = writeback.convert(value, 0)? {
                variables.insert(key, value);
            }
        }
        for key in &self.null_keys {
            if !variables.contains_key(key) {
                variables.insert(key.clone(), TemplateValue::Null);
            }
        }
        context.replace_all(variables);
        Ok(())
    }

    fn to_lua(&self, value: &TemplateValue) -> mlua::Result<Value> {
        Ok(match value {
            TemplateValue::Null => Value::Nil,
            TemplateValue::Bool(b) => Value::Boolean(*b),
            TemplateValue::Integer(n) => Value::Integer(*n),
            TemplateValue::Number(n) => Value::Number(*n),
            TemplateValue::String(s) => Value::String(self.lua.create_string(s)?),
            TemplateValue::Escaped(s) => self.as_escaped.call::<Value>(s.as_str())?,
            TemplateValue::List(items) => {
                let table = self.lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, self.to_lua(item)?)?;
                }
                Value::Table(table)
            }
            TemplateValue::Map(map) => {
                let table = self.lua.create_table_with_capacity(0, map.len())?;
                for (key, item) in map {
                    table.raw_set(key.as_str(), self.to_lua(item)?)?;
                }
                Value::Table(table)
            }
        })
    }
}

/// Copies Lua values back into [`TemplateValue`]s.
///
/// Each table is converted once. A table met again while it is still being
/// converted is a cycle and becomes `Null`; one met after its conversion
/// finished is reused. Values without a Rust counterpart (functions,
/// userdata) are dropped.
struct Writeback<'a> {
    escaped_mt: &'a Table,
    /// `None` while the table is being converted, then the value and the
    /// number of values it holds.
    seen: HashMap<*const c_void, Option<(TemplateValue, usize)>>,
    budget: usize,
}

impl<'a> Writeback<'a> {
    fn new(escaped_mt: &'a Table) -> Self {
        Self {
            escaped_mt,
            seen: HashMap::new(),
            budget: MAX_VALUES,
        }
    }

    fn convert(&mut self, value: Value, depth: usize) -> mlua::Result<Option<TemplateValue>> {
        Ok(self.convert_counted(value, depth)?.map(|(value, _)| value))
    }

    fn convert_counted(
        &mut self,
        value: Value,
        depth: usize,
    ) -> mlua::Result<Option<(TemplateValue, usize)>> {
        let scalar = match value {
            Value::Nil => TemplateValue::Null,
            Value::Boolean(b) => TemplateValue::Bool(b),
            Value::Integer(n) => TemplateValue::Integer(n),
            Value::Number(n) => TemplateValue::Number(n),
            Value::String(s) => TemplateValue::String(s.to_str()?.to_string()),
            Value::Table(table) => return self.convert_table(&table, depth).map(Some),
            _ => return Ok(None),
        };
        self.budget = self.budget.saturating_sub(1);
        Ok(Some((scalar, 1)))
    }

    fn convert_table(
        &mut self,
        table: &Table,
        depth: usize,
    ) -> mlua::Result<(TemplateValue, usize)> {
        let escaped = table
            .metatable()
            .is_some_and(|mt| mt.to_pointer() == self.escaped_mt.to_pointer());
        if escaped {
            self.budget = self.budget.saturating_sub(1);
            return Ok((TemplateValue::Escaped(table.raw_get::<String>("text")?), 1));
        }

        let key = table.to_pointer();
        match self.seen.get(&key) {
            Some(Some((value, size))) if *size <= self.budget => {
                self.budget -= size;
                return Ok((value.clone(), *size));
            }
            Some(_) => return Ok((TemplateValue::Null, 1)),
            None => {}
        }
        if depth >= MAX_DEPTH || self.budget == 0 {
            return Ok((TemplateValue::Null, 1));
        }

        self.seen.insert(key, None);
        let converted = self.table_entries(table, depth + 1)?;
        self.seen.insert(key, Some(converted.clone()));
        Ok(converted)
    }

    fn table_entries(
        &mut self,
        table: &Table,
        depth: usize,
    ) -> mlua::Result<(TemplateValue, usize)> {
        let mut entries = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            entries.push(pair?);
        }
        self.budget = self.budget.saturating_sub(1);
        let mut size = 1;

        let len = table.raw_len();
        if len == entries.len() {
            let mut items = Vec::with_capacity(len);
            for i in 1..=len {
                let item: Value = table.raw_get(i)?;
                let (item, n) = self.convert_counted(item, depth)?.unwrap_or_default();
                size += n;
                items.push(item);
            }
            return Ok((TemplateValue::List(items), size));
        }

        let mut map = HashMap::new();
        for (key, item) in entries {
            let key = match key {
                Value::String(s) => s.to_str()?.to_string(),
                Value::Integer(n) => n.to_string(),
                _ => continue,
            };
            if let Some((item, n)) = self.convert_counted(item, depth)? {
                size += n;
                map.insert(key, item);
            }
        }
        Ok((TemplateValue::Map(map), size))
    }
}

impl From<mlua::Error> for TemplateError {
    fn from(err: mlua::Error) -> Self {
        lua_error(err, "<runtime>")
    }
}

/// Map a Lua failure back to a [`TemplateError`].
///
/// Errors raised by Rust callbacks (includes, unresolved references) come
/// back wrapped by every Lua frame they crossed; they are unwrapped to the
/// original error. Anything else is an embedded-language failure and is
/// reported with its message unmodified.
pub(crate) fn lua_error(err: mlua::Error, filename: &str) -> TemplateError {
    if let Some(original) = find_template_error(&err) {
        return original.duplicate();
    }
    TemplateError::Execution {
        filename: filename.to_string(),
        message: root_message(&err),
    }
}

/// Identifies the Lua build that produced a bytecode dump. Dumps from a
/// different build are rejected before they reach `lua_load`.
pub(crate) fn runtime_tag() -> String {
    let endian = if cfg!(target_endian = "little") { "le" } else { "be" };
    format!("lua54/mlua-0.11/{}bit/{endian}", usize::BITS)
}

/// Bytecode for `artifact`, compiled in a scratch state if no render has
/// produced it yet.
pub(crate) fn compile_bytecode(artifact: &Artifact) -> TemplateResult<Vec<u8>> {
    if let Some(bytecode) = artifact.bytecode() {
        return Ok(bytecode.to_vec());
    }
    let label = artifact.label();
    let lua = Lua::new();
    let function = lua
        .load(artifact.script())
        .set_name(format!("={label}"))
        .set_mode(ChunkMode::Text)
        .into_function()
        .map_err(|err| lua_error(err, label))?;
    let bytecode = function.dump(false);
    artifact.set_bytecode(bytecode.clone());
    Ok(bytecode)
}

fn find_template_error(err: &mlua::Error) -> Option<&TemplateError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => find_template_error(cause),
        mlua::Error::WithContext { cause, .. } => find_template_error(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<TemplateError>(),
        _ => None,
    }
}

fn root_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_message(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, Flavor};
    use pretty_assertions::assert_eq;

    fn run(text: &str, context: &mut TemplateContext) -> TemplateResult<String> {
        let artifact = Compiler::new(Flavor::Standard).compile(text, Some("test.lhtml"))?;
        let session = Session::open(context)?;
        let output = session.execute(&artifact, None)?;
        session.store_context(context)?;
        Ok(output)
    }

    #[test]
    fn test_escaped_and_raw_placeholders() {
        let mut ctx = TemplateContext::new();
        ctx.insert("x", "<b>");
        let output = run("${x}|#{x}", &mut ctx).unwrap();
        assert_eq!(output, "&lt;b&gt;|<b>");
    }

    #[test]
    fn test_loop_over_list() {
        let mut ctx = TemplateContext::new();
        ctx.insert("items", vec!["a&b", "c"]);
        let text = "<ul>\n<?lua for _, item in ipairs(items) do ?>\n  <li>${item}</li>\n<?lua end ?>\n</ul>\n";
        let output = run(text, &mut ctx).unwrap();
        assert_eq!(output, "<ul>\n  <li>a&amp;b</li>\n  <li>c</li>\n</ul>\n");
    }

    #[test]
    fn test_missing_names_render_empty() {
        let output = run("[${nothing}][#{nothing}]", &mut TemplateContext::new()).unwrap();
        assert_eq!(output, "[][]");
    }

    #[test]
    fn test_values_render_like_to_str() {
        let mut ctx = TemplateContext::new();
        ctx.insert("n", 42i64);
        ctx.insert("f", 0.5);
        ctx.insert("b", false);
        let output = run("#{n} #{f} #{b}", &mut ctx).unwrap();
        assert_eq!(output, "42 0.5 false");
    }

    #[test]
    fn test_shared_and_cyclic_tables_are_copied_back_once() {
        let mut ctx = TemplateContext::new();
        let text = "<?lua local t = { name = 'n' }; t.a = t; t.b = t; _context.t = t ?>\n\
                    <?lua local leaf = { 'x' }; _context.pair = { leaf, leaf } ?>\n";
        run(text, &mut ctx).unwrap();

        let Some(TemplateValue::Map(t)) = ctx.get("t") else {
            panic!("expected a map, got {:?}", ctx.get("t"));
        };
        assert_eq!(t.get("name"), Some(&TemplateValue::from("n")));
        assert_eq!(t.get("a"), Some(&TemplateValue::Null));
        assert_eq!(t.get("b"), Some(&TemplateValue::Null));

        let leaf = TemplateValue::List(vec![TemplateValue::from("x")]);
        assert_eq!(
            ctx.get("pair"),
            Some(&TemplateValue::List(vec![leaf.clone(), leaf]))
        );
    }

    #[test]
    fn test_deeply_shared_tables_finish() {
        let mut ctx = TemplateContext::new();
        let text = "<?lua local t = {}\n\
                    for _ = 1, 60 do t = { a = t, b = t } end\n\
                    _context.t = t ?>\n";
        run(text, &mut ctx).unwrap();
        assert!(matches!(ctx.get("t"), Some(TemplateValue::Map(_))));
    }

    #[test]
    fn test_null_argument_counts_as_bound() {
        let mut ctx = TemplateContext::new();
        ctx.insert("val", TemplateValue::Null);
        let output = run("<?lua #@ARGS val ?>\nval=[${val}]", &mut ctx).unwrap();
        assert_eq!(output, "val=[]");
        assert_eq!(ctx.get("val"), Some(&TemplateValue::Null));
    }

    #[test]
    fn test_escaped_values_pass_through() {
        let mut ctx = TemplateContext::new();
        ctx.insert("html", TemplateValue::escaped("<i>ok</i>"));
        let output = run("${html} ${as_escaped('<b>')} ${to_escaped('<u>')}", &mut ctx).unwrap();
        assert_eq!(output, "<i>ok</i> <b> &lt;u&gt;");
    }

    #[test]
    fn test_context_mutations_are_returned() {
        let mut ctx = TemplateContext::new();
        ctx.insert("keep", "yes");
        run(
            "<?lua _context.title = 'Hi'; _context.tags = {'a', 'b'}; _context.fn = print ?>\n",
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.get("title"), Some(&TemplateValue::from("Hi")));
        assert_eq!(ctx.get("tags"), Some(&TemplateValue::from(vec!["a", "b"])));
        assert_eq!(ctx.get("keep"), Some(&TemplateValue::from("yes")));
        assert!(!ctx.contains_key("fn"));
    }

    #[test]
    fn test_map_and_escaped_roundtrip() {
        let mut ctx = TemplateContext::new();
        let mut user = HashMap::new();
        user.insert("name".to_string(), TemplateValue::from("ada"));
        ctx.insert("user", TemplateValue::Map(user.clone()));
        ctx.insert("safe", TemplateValue::escaped("&amp;"));
        run("${user.name}", &mut ctx).unwrap();
        assert_eq!(ctx.get("user"), Some(&TemplateValue::Map(user)));
        assert_eq!(ctx.get("safe"), Some(&TemplateValue::escaped("&amp;")));
    }

    #[test]
    fn test_declared_arguments() {
        let text = "<?lua #@ARGS val ?>\nval=#{val}";
        let mut ctx = TemplateContext::new();
        ctx.insert("val", "ABC");
        assert_eq!(run(text, &mut ctx).unwrap(), "val=ABC");

        let err = run(text, &mut TemplateContext::new()).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnresolvedReference { ref name, .. } if name == "val"
        ));
    }

    #[test]
    fn test_declared_mode_rejects_free_names() {
        let text = "<?lua #@ARGS val ?>\n#{val}#{other}";
        let mut ctx = TemplateContext::new();
        ctx.insert("val", "v");
        ctx.insert("other", "in context but not declared");
        let err = run(text, &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnresolvedReference { ref name, ref filename }
                if name == "other" && filename == "test.lhtml"
        ));
    }

    #[test]
    fn test_declared_mode_allows_builtins_and_helpers() {
        let text = "<?lua #@ARGS items ?>\n#{#items} ${string.upper(items[1])}";
        let mut ctx = TemplateContext::new();
        ctx.insert("items", vec!["a", "b"]);
        assert_eq!(run(text, &mut ctx).unwrap(), "2 A");
    }

    #[test]
    fn test_embedded_errors_surface_at_execution() {
        let err = run("<?lua if then ?>\n", &mut TemplateContext::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Execution { ref filename, .. } if filename == "test.lhtml"));

        let err = run("<?lua error('boom') ?>\n", &mut TemplateContext::new()).unwrap_err();
        match err {
            TemplateError::Execution { message, .. } => assert!(message.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_capture_helpers() {
        let text = "\
<?lua start_capture('head') ?>
<title>${title}</title>
<?lua stop_capture() ?>
<?lua capture_as('foot', function() ?>
<footer/>
<?lua end) ?>
[<?lua if not captured_as('missing') then echo('none') end ?>]
";
        let mut ctx = TemplateContext::new();
        ctx.insert("title", "T");
        let output = run(text, &mut ctx).unwrap();
        assert_eq!(output, "[none]\n");
        assert_eq!(ctx.get("head"), Some(&TemplateValue::from("<title>T</title>\n")));
        assert_eq!(ctx.get("foot"), Some(&TemplateValue::from("<footer/>\n")));
    }

    #[test]
    fn test_bytecode_is_memoized_and_reused() {
        let artifact = Compiler::new(Flavor::Standard)
            .compile("<p>${x}</p>", None)
            .unwrap();
        assert!(artifact.bytecode().is_none());

        let mut ctx = TemplateContext::new();
        ctx.insert("x", "1");
        let first = Session::open(&ctx).unwrap().execute(&artifact, None).unwrap();
        assert!(artifact.bytecode().is_some());
        let second = Session::open(&ctx).unwrap().execute(&artifact, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(second, "<p>1</p>");
    }

    #[test]
    fn test_include_needs_engine() {
        let err = run("#{include('x')}", &mut TemplateContext::new()).unwrap_err();
        match err {
            TemplateError::Execution { message, .. } => {
                assert!(message.contains("only available when rendering through an engine"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_compile_bytecode_outside_a_render() {
        let artifact = Compiler::new(Flavor::Standard)
            .compile("<p>${x}</p>", None)
            .unwrap();
        let bytecode = compile_bytecode(&artifact).unwrap();
        assert_eq!(artifact.bytecode(), Some(&bytecode[..]));

        let mut ctx = TemplateContext::new();
        ctx.insert("x", "<");
        let output = Session::open(&ctx).unwrap().execute(&artifact, None).unwrap();
        assert_eq!(output, "<p>&lt;</p>");

        let broken = Compiler::new(Flavor::Standard)
            .compile("<?lua if then ?>\n", None)
            .unwrap();
        assert!(compile_bytecode(&broken).is_err());
    }

    #[test]
    fn test_js_helpers_are_available() {
        let output = run("#{JS_FUNC}|${JS_FUNC}", &mut TemplateContext::new()).unwrap();
        let (raw, escaped) = output.split_once('|').unwrap();
        assert_eq!(raw, JS_FUNC);
        assert_eq!(escaped, JS_FUNC);
    }
}
