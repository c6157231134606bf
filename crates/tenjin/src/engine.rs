/*
 * engine.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The template engine: name resolution, caching, layouts and includes.
//!
//! The engine is shared between threads. Each call to [`Engine::render`]
//! opens its own Lua session; compiled artifacts, resolved paths and the
//! cache storage are shared.
//!
//! A cached artifact is reused while its recorded source modification time
//! matches the file's current one. To keep lookups cheap, the file is only
//! checked again once `timestamp_interval` has passed since the last
//! successful check.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use mlua::Table;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::cache::CacheStorage;
use crate::compiler::{Compiler, Flavor};
use crate::config::EngineConfig;
use crate::error::{TemplateError, TemplateResult};
use crate::loader::{FileSystemLoader, Loader};
use crate::preprocess::{
    FilterScope, PrefixedLinePreprocessor, TemplatePreprocessor, TextFilter, TrimPreprocessor,
    apply_filters,
};
use crate::runtime::Session;
use crate::value::{TemplateContext, TemplateValue};

/// Layout selection for [`Engine::render`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Layout {
    /// The engine's configured layout, if any.
    #[default]
    Default,
    /// No layout.
    Off,
    /// The named template.
    Named(String),
}

impl From<&str> for Layout {
    fn from(name: &str) -> Self {
        Layout::Named(name.to_string())
    }
}

impl From<bool> for Layout {
    fn from(enabled: bool) -> Self {
        if enabled { Layout::Default } else { Layout::Off }
    }
}

pub struct Engine {
    prefix: String,
    postfix: String,
    layout: Option<String>,
    path: Vec<PathBuf>,
    cache_suffix: String,
    timestamp_interval: Duration,
    loader: Arc<dyn Loader>,
    cache: Option<Arc<dyn CacheStorage>>,
    compiler: Compiler,
    filters: Vec<Box<dyn TextFilter>>,
    /// Templates registered with [`Engine::add_template`], by filename.
    templates: RwLock<HashMap<String, Arc<Artifact>>>,
    /// Filename to `(filepath, fullpath)`.
    resolved: RwLock<HashMap<String, (PathBuf, PathBuf)>>,
}

impl Engine {
    /// Create an engine with the cache storage selected by `config.cache`.
    pub fn new(config: EngineConfig) -> TemplateResult<Self> {
        config.validate()?;
        let cache = config.cache.build();
        Self::with_cache(config, cache)
    }

    /// Create an engine using `cache` regardless of `config.cache`. Pass the
    /// same storage to several engines to share compiled templates.
    pub fn with_cache(
        config: EngineConfig,
        cache: Option<Arc<dyn CacheStorage>>,
    ) -> TemplateResult<Self> {
        config.validate()?;

        let mut filters: Vec<Box<dyn TextFilter>> = Vec::new();
        if config.preprocess {
            filters.push(Box::new(TemplatePreprocessor::new(
                config.preprocessor_flavor,
            )));
        }
        if let Some(mode) = config.trim {
            filters.push(Box::new(TrimPreprocessor::new(mode)));
        }
        if let Some(prefix) = &config.line_prefix {
            filters.push(Box::new(PrefixedLinePreprocessor::new(prefix)));
        }

        Ok(Self {
            timestamp_interval: config.timestamp_interval(),
            prefix: config.prefix,
            postfix: config.postfix,
            layout: config.layout,
            path: config.path,
            cache_suffix: config.cache_suffix,
            loader: Arc::new(FileSystemLoader),
            cache,
            compiler: Compiler::new(config.flavor),
            filters,
            templates: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the source loader.
    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    /// Append a text filter, run after the configured ones.
    pub fn add_filter(&mut self, filter: Box<dyn TextFilter>) {
        self.filters.push(filter);
    }

    pub fn flavor(&self) -> Flavor {
        self.compiler.flavor()
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStorage>> {
        self.cache.as_ref()
    }

    /// Expand `:name` to prefix + name + postfix. Other names are returned
    /// unchanged.
    pub fn to_filename(&self, name: &str) -> String {
        match name.strip_prefix(':') {
            Some(short) => format!("{}{short}{}", self.prefix, self.postfix),
            None => name.to_string(),
        }
    }

    /// Cache storage key for a template's absolute path.
    pub fn cache_key(&self, fullpath: &Path) -> String {
        format!("{}{}", fullpath.to_string_lossy(), self.cache_suffix)
    }

    /// Register a compiled template under its filename. It takes precedence
    /// over files with the same name and is never cached.
    pub fn add_template(&self, artifact: Artifact) -> TemplateResult<Arc<Artifact>> {
        let Some(filename) = artifact.filename().map(str::to_string) else {
            return Err(TemplateError::Config(
                "templates added to an engine need a filename".to_string(),
            ));
        };
        let artifact = Arc::new(artifact);
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename, artifact.clone());
        Ok(artifact)
    }

    /// Find, load and compile a template, consulting the cache.
    ///
    /// Preprocessing triggered from here runs against an empty context; use
    /// [`Engine::render`] to preprocess with the render's context.
    pub fn get_template(&self, name: &str) -> TemplateResult<Arc<Artifact>> {
        self.get_template_in(name, None)
    }

    /// Render `name` with `context`, wrapping the output in layouts.
    ///
    /// Changes the templates make to the context are written back to
    /// `context`, except the engine's own `_layout` and `_content` keys.
    pub fn render(
        &self,
        name: &str,
        context: &mut TemplateContext,
        layout: Layout,
    ) -> TemplateResult<String> {
        let session = Session::open(context)?;
        let output = session.lua().scope(|scope| {
            let include = scope.create_function(
                |_, (included, buf, context): (String, Option<Table>, Table)| {
                    self.include(&session, &included, buf, context)
                        .map_err(mlua::Error::external)
                },
            )?;
            session
                .set_helper("_include", include)
                .map_err(mlua::Error::external)?;
            Ok(self.render_chain(&session, name, layout))
        })?;
        let output = output?;
        session.store_context(context)?;
        Ok(output)
    }

    fn render_chain(
        &self,
        session: &Session,
        name: &str,
        mut layout: Layout,
    ) -> TemplateResult<String> {
        let mut name = name.to_string();
        loop {
            let artifact = self.get_template_in(&name, Some(session))?;
            let output = session.execute(&artifact, None)?;

            layout = match session.take("_layout")? {
                TemplateValue::Null => layout,
                TemplateValue::Bool(true) => Layout::Default,
                TemplateValue::Bool(false) => Layout::Off,
                TemplateValue::String(next) | TemplateValue::Escaped(next) => Layout::Named(next),
                other => {
                    return Err(TemplateError::Execution {
                        filename: artifact.label().to_string(),
                        message: format!(
                            "_layout must be a template name or a boolean, got {}",
                            other.render()
                        ),
                    });
                }
            };
            let next = match layout {
                Layout::Default => self.layout.clone(),
                Layout::Off => None,
                Layout::Named(next) => Some(next),
            };

            match next.filter(|next| !next.is_empty()) {
                Some(next) => {
                    session.set("_content", &TemplateValue::Escaped(output))?;
                    name = next;
                    layout = Layout::Off;
                }
                None => {
                    session.take("_content")?;
                    return Ok(output);
                }
            }
        }
    }

    fn include(
        &self,
        session: &Session,
        name: &str,
        buf: Option<Table>,
        context: Table,
    ) -> TemplateResult<String> {
        let artifact = self.get_template_in(name, Some(session))?;
        session.execute_in(&artifact, buf, context)
    }

    fn get_template_in(
        &self,
        name: &str,
        session: Option<&Session>,
    ) -> TemplateResult<Arc<Artifact>> {
        let filename = self.to_filename(name);
        if let Some(artifact) = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&filename)
        {
            return Ok(artifact.clone());
        }

        let (filepath, fullpath) = self.resolve(&filename)?;
        let key = self.cache_key(&fullpath);

        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Ok(Some(artifact)) => {
                    if self.is_fresh(&artifact, &filepath)? {
                        debug!(key, "template cache hit");
                        return Ok(artifact);
                    }
                    info!(filepath = %filepath.display(), "cache expired");
                    if let Err(err) = cache.unset(&key) {
                        warn!(key, %err, "failed to remove expired cache entry");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(key, %err, "ignoring unreadable cache entry"),
            }
        }

        let artifact = Arc::new(self.create_template(&filename, &filepath, session)?);
        if let Some(cache) = &self.cache
            && let Err(err) = cache.set(&key, artifact.clone())
        {
            warn!(key, %err, "failed to write cache entry");
        }
        Ok(artifact)
    }

    fn resolve(&self, filename: &str) -> TemplateResult<(PathBuf, PathBuf)> {
        if let Some(paths) = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(filename)
        {
            return Ok(paths.clone());
        }

        let filepath = self
            .loader
            .find(filename, &self.path)
            .ok_or_else(|| self.not_found(filename))?;
        let fullpath = self.loader.abspath(&filepath);
        self.resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filename.to_string(), (filepath.clone(), fullpath.clone()));
        Ok((filepath, fullpath))
    }

    fn not_found(&self, filename: &str) -> TemplateError {
        TemplateError::NotFound {
            name: filename.to_string(),
            path: self.path.clone(),
        }
    }

    /// Whether `artifact` still matches its source file. The file is only
    /// consulted once the skip window since the last check has passed.
    fn is_fresh(&self, artifact: &Artifact, filepath: &Path) -> TemplateResult<bool> {
        let Some(recorded) = artifact.source_timestamp() else {
            return Ok(true);
        };
        let now = SystemTime::now();
        if let Some(last) = artifact.last_checked_at()
            && now
                .duration_since(last)
                .is_ok_and(|elapsed| elapsed < self.timestamp_interval)
        {
            debug!(filepath = %filepath.display(), "skipping timestamp check");
            return Ok(true);
        }

        if self.loader.timestamp(filepath)? == Some(recorded) {
            artifact.mark_checked(now);
            return Ok(true);
        }
        Ok(false)
    }

    fn create_template(
        &self,
        filename: &str,
        filepath: &Path,
        session: Option<&Session>,
    ) -> TemplateResult<Artifact> {
        let Some((source, mtime)) = self.loader.load(filepath)? else {
            return Err(self.not_found(filename));
        };
        let label = filepath.to_string_lossy();

        let source = if self.filters.is_empty() {
            source
        } else {
            let scope = FilterScope::with_session(Some(&label), session);
            apply_filters(&self.filters, &source, &scope)?
        };

        debug!(filepath = %label, "compiling template");
        let artifact = self
            .compiler
            .compile(&source, Some(&label))?
            .with_timestamp(Some(mtime));
        artifact.mark_checked(SystemTime::now());
        Ok(artifact)
    }
}

/// An engine whose templates and preprocessing escape by default.
pub struct SafeEngine(Engine);

impl SafeEngine {
    pub fn new(config: EngineConfig) -> TemplateResult<Self> {
        Engine::new(Self::safe_config(config)).map(SafeEngine)
    }

    pub fn with_cache(
        config: EngineConfig,
        cache: Option<Arc<dyn CacheStorage>>,
    ) -> TemplateResult<Self> {
        Engine::with_cache(Self::safe_config(config), cache).map(SafeEngine)
    }

    pub fn with_loader(self, loader: Arc<dyn Loader>) -> Self {
        SafeEngine(self.0.with_loader(loader))
    }

    pub fn into_inner(self) -> Engine {
        self.0
    }

    fn safe_config(config: EngineConfig) -> EngineConfig {
        EngineConfig {
            flavor: Flavor::Safe,
            preprocessor_flavor: Flavor::Safe,
            ..config
        }
    }
}

impl Deref for SafeEngine {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.0
    }
}
