/*
 * mod.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Command implementations for the tenjin CLI.
//!
//! Each command module handles the CLI interface and delegates to the
//! tenjin library for the actual work.

pub mod render;
