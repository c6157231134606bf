/*
 * template.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Standalone templates, compiled and rendered without an engine.

use std::path::Path;

use crate::artifact::Artifact;
use crate::compiler::{Compiler, Flavor};
use crate::error::TemplateResult;
use crate::runtime::Session;
use crate::value::TemplateContext;

/// A compiled template that is not managed by an [`crate::Engine`].
///
/// Such templates have no search path, layouts or cache; `include()` is not
/// available to them.
#[derive(Debug)]
pub struct Template {
    artifact: Artifact,
}

impl Template {
    /// Compile a template from source text.
    pub fn compile(source: &str) -> TemplateResult<Self> {
        Self::compile_with(source, None, Flavor::Standard)
    }

    /// Compile with the escape-by-default rules.
    pub fn compile_safe(source: &str) -> TemplateResult<Self> {
        Self::compile_with(source, None, Flavor::Safe)
    }

    /// Compile a template with a filename for error reporting.
    pub fn compile_with_filename(source: &str, filename: &str) -> TemplateResult<Self> {
        Self::compile_with(source, Some(filename), Flavor::Standard)
    }

    pub fn compile_with(
        source: &str,
        filename: Option<&str>,
        flavor: Flavor,
    ) -> TemplateResult<Self> {
        let artifact = Compiler::new(flavor).compile(source, filename)?;
        Ok(Self { artifact })
    }

    pub fn compile_from_file(path: &Path) -> TemplateResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::compile_with_filename(&source, &path.to_string_lossy())
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    /// The generated Lua chunk. Line numbers in execution errors refer to
    /// this text.
    pub fn script(&self) -> &str {
        self.artifact.script()
    }

    /// Render with `context`. The context is not modified.
    pub fn render(&self, context: &TemplateContext) -> TemplateResult<String> {
        Session::open(context)?.execute(&self.artifact, None)
    }

    /// Render with `context` and write back the changes the template made
    /// to it.
    pub fn render_mut(&self, context: &mut TemplateContext) -> TemplateResult<String> {
        let session = Session::open(context)?;
        let output = session.execute(&self.artifact, None)?;
        session.store_context(context)?;
        Ok(output)
    }
}

impl From<Artifact> for Template {
    fn from(artifact: Artifact) -> Self {
        Self { artifact }
    }
}
