//! System prompt files
//!
//! Prompts live one per file in `<config dir>/prompts/<name>`. A missing or
//! blank file means the request carries no system turn.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

use crate::config::Config;

/// Directory holding prompt files
pub fn prompts_dir() -> PathBuf {
    Config::config_dir().join("prompts")
}

/// Load the prompt called `name` from the default directory
pub fn load_prompt(name: &str) -> anyhow::Result<Option<String>> {
    load_prompt_from(&prompts_dir(), name)
}

/// Load the prompt called `name` from `dir`
pub fn load_prompt_from(dir: &Path, name: &str) -> anyhow::Result<Option<String>> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        bail!("invalid prompt name: {:?}", name);
    }

    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(content.trim_end().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("No prompt file at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("reading prompt {}", path.display())),
    }
}
