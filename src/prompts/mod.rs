//! Prompt templates for each kind of session.
//!
//! Defaults are compiled in. A project can override any of them by placing a
//! file with the same name under `.autoforge/prompts/`.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::STATE_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Initializer,
    Coding,
    /// Coding without tool-permission checks.
    CodingYolo,
    BuildValidation,
}

impl PromptKind {
    pub const ALL: [PromptKind; 4] = [
        PromptKind::Initializer,
        PromptKind::Coding,
        PromptKind::CodingYolo,
        PromptKind::BuildValidation,
    ];

    /// Template file stem, also used for override lookup.
    pub fn file_name(&self) -> &'static str {
        match self {
            PromptKind::Initializer => "initializer.md",
            PromptKind::Coding => "coding.md",
            PromptKind::CodingYolo => "coding_yolo.md",
            PromptKind::BuildValidation => "build_validation.md",
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            PromptKind::Initializer => include_str!("templates/initializer.md"),
            PromptKind::Coding => include_str!("templates/coding.md"),
            PromptKind::CodingYolo => include_str!("templates/coding_yolo.md"),
            PromptKind::BuildValidation => include_str!("templates/build_validation.md"),
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".md"))
    }
}

pub trait PromptSource: Send + Sync {
    fn prompt(&self, kind: PromptKind, project_dir: &Path) -> Result<String>;
}

/// Built-in templates with per-project overrides.
#[derive(Debug, Clone)]
pub struct TemplatePrompts {
    validation_category: String,
}

impl TemplatePrompts {
    pub fn new(validation_category: impl Into<String>) -> Self {
        Self {
            validation_category: validation_category.into(),
        }
    }

    /// Write the built-in templates into `.autoforge/prompts/` for editing.
    /// Existing files are left alone. Returns the files written.
    pub fn export_defaults(project_dir: &Path) -> Result<Vec<String>> {
        let dir = project_dir.join(STATE_DIR).join("prompts");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut written = Vec::new();
        for kind in PromptKind::ALL {
            let path = dir.join(kind.file_name());
            if path.exists() {
                continue;
            }
            std::fs::write(&path, kind.default_template())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written.push(kind.file_name().to_string());
        }
        Ok(written)
    }

    fn render(&self, template: &str, project_dir: &Path) -> String {
        template
            .replace("{{project_dir}}", &project_dir.display().to_string())
            .replace("{{validation_category}}", &self.validation_category)
    }
}

impl Default for TemplatePrompts {
    fn default() -> Self {
        Self::new("build")
    }
}

impl PromptSource for TemplatePrompts {
    fn prompt(&self, kind: PromptKind, project_dir: &Path) -> Result<String> {
        let override_path = project_dir
            .join(STATE_DIR)
            .join("prompts")
            .join(kind.file_name());
        let template = if override_path.exists() {
            tracing::debug!(path = %override_path.display(), "Using prompt override");
            std::fs::read_to_string(&override_path)
                .with_context(|| format!("Failed to read {}", override_path.display()))?
        } else {
            kind.default_template().to_string()
        };
        Ok(self.render(&template, project_dir))
    }
}
