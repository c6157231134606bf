/*
 * render.rs
 * Copyright (c) 2025 Posit, PBC
 *
 * Render command implementation
 */

//! Render command implementation.
//!
//! Renders one template with a JSON context through an [`Engine`] built
//! from an optional TOML configuration file and the command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use tenjin::{CacheKind, Engine, EngineConfig, Flavor, Layout, TemplateContext};

/// Arguments for the render command
#[derive(Debug)]
pub struct RenderArgs {
    pub template: String,
    pub context: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub layout: Option<String>,
    pub no_cache: bool,
    pub safe: bool,
    pub preprocess: bool,
}

/// Execute the render command
pub fn execute(args: RenderArgs) -> Result<()> {
    let config = engine_config(&args)?;
    debug!(?config, "engine configuration");
    let engine = Engine::new(config).context("Failed to create template engine")?;

    let mut context = match &args.context {
        Some(path) => load_context(path)?,
        None => TemplateContext::new(),
    };
    let layout = match &args.layout {
        Some(name) => Layout::Named(name.clone()),
        None => Layout::Default,
    };

    let html = engine
        .render(&args.template, &mut context, layout)
        .with_context(|| format!("Failed to render {}", args.template))?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, html)
                .with_context(|| format!("Failed to write output file {}", path.display()))?;
            info!("Output: {}", path.display());
        }
        None => print!("{html}"),
    }
    Ok(())
}

/// Merge the configuration file with the command-line overrides.
fn engine_config(args: &RenderArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.no_cache {
        config.cache = CacheKind::Memory;
    }
    if args.safe {
        config.flavor = Flavor::Safe;
        config.preprocessor_flavor = Flavor::Safe;
    }
    if args.preprocess {
        config.preprocess = true;
    }
    Ok(config)
}

fn load_context(path: &Path) -> Result<TemplateContext> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse context file {}", path.display()))?;
    TemplateContext::from_json(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Context file {} must hold a JSON object",
            path.display()
        )
    })
}
