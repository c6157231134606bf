/*
 * main.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! tenjin CLI - Main entry point

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "tenjin")]
#[command(version)]
#[command(about = "Render embedded-Lua HTML templates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template to HTML
    Render {
        /// Template file, or `:name` when the engine config sets a path
        template: String,

        /// JSON file holding the template context (an object)
        #[arg(short = 'c', long)]
        context: Option<PathBuf>,

        /// Write output to FILE instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Engine configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Layout template, overriding the configured one
        #[arg(long)]
        layout: Option<String>,

        /// Keep compiled templates in memory only
        #[arg(long)]
        no_cache: bool,

        /// Escape by default; reject `#{}`
        #[arg(long)]
        safe: bool,

        /// Expand preprocess markers before compiling
        #[arg(long)]
        preprocess: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenjin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            template,
            context,
            output,
            config,
            layout,
            no_cache,
            safe,
            preprocess,
        } => commands::render::execute(commands::render::RenderArgs {
            template,
            context,
            output,
            config,
            layout,
            no_cache,
            safe,
            preprocess,
        }),
    }
}
