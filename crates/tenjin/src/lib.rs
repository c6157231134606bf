/*
 * lib.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Fast HTML template engine with embedded Lua.
//!
//! Templates are plain text with Lua embedded in it:
//!
//! - Statements: `<?lua for _, item in ipairs(items) do ?>` ... `<?lua end ?>`
//! - Escaped expressions: `${item.name}`
//! - Raw expressions: `#{item.html}`
//! - Preprocess-time code and expressions: `<?LUA ?>`, `${{x}}`, `#{{x}}`
//! - Declared arguments: `<?lua #@ARGS title, items ?>`
//!
//! # Architecture
//!
//! A template is compiled once into an [`Artifact`], an instruction sequence
//! lowered to a Lua chunk. The [`Engine`] finds templates on a search path,
//! keeps compiled artifacts in a [`CacheStorage`] (in memory or on disk),
//! recompiles a template when its file changes, and wraps output in layout
//! templates. Text filters ([`TextFilter`]) can rewrite template source
//! before compilation.
//!
//! # Example
//!
//! ```ignore
//! use tenjin::{Engine, EngineConfig, Layout, TemplateContext};
//!
//! let engine = Engine::new(EngineConfig {
//!     postfix: ".lhtml".to_string(),
//!     layout: Some(":layout".to_string()),
//!     path: vec!["views".into()],
//!     ..EngineConfig::default()
//! })?;
//!
//! let mut ctx = TemplateContext::new();
//! ctx.insert("title", "Hello");
//! let html = engine.render(":page", &mut ctx, Layout::Default)?;
//! ```

pub mod artifact;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod loader;
pub mod preprocess;
mod runtime;
mod script;
mod syntax;
pub mod template;
pub mod value;

// Re-export main types at crate root
pub use artifact::{Artifact, CacheEntry, Instruction};
pub use cache::{
    ArtifactCodec, BytecodeCacheStorage, BytecodeCodec, CacheKind, CacheStorage,
    FileCacheStorage, MemoryCacheStorage, PortableCacheStorage, PortableCodec, TextCacheStorage,
    TextCodec,
};
pub use compiler::{Compiler, Flavor};
pub use config::EngineConfig;
pub use engine::{Engine, Layout, SafeEngine};
pub use error::{CacheError, CacheResult, TemplateError, TemplateResult};
pub use escape::escape_html;
pub use loader::{FileSystemLoader, Loader, MemoryLoader};
pub use preprocess::{
    FilterScope, JS_FUNC, JsTemplatePreprocessor, PrefixedLinePreprocessor, TemplatePreprocessor,
    TextFilter, TrimMode, TrimPreprocessor,
};
pub use template::Template;
pub use value::{TemplateContext, TemplateValue};
