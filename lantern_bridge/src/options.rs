use std::{fs, path::Path};

use anyhow::{Context, Result};
use mlua::StdLib;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_NAME: &str = "eval";

/// Which Lua standard libraries the interpreter context opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryProfile {
    /// Every library mlua considers safe (no `debug`, no C modules).
    #[default]
    Safe,
    /// Only `string`, `table` and `math` on top of the base library.
    Core,
}

impl LibraryProfile {
    pub(crate) fn std_lib(self) -> StdLib {
        match self {
            LibraryProfile::Safe => StdLib::ALL_SAFE,
            LibraryProfile::Core => StdLib::STRING | StdLib::TABLE | StdLib::MATH,
        }
    }
}

/// Construction-time settings for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    /// Name attached to evaluated source; shows up in diagnostics.
    pub chunk_name: String,
    /// Interpreter heap limit in bytes. Exceeding it raises a fatal error.
    pub memory_limit: Option<usize>,
    pub libraries: LibraryProfile,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
            memory_limit: None,
            libraries: LibraryProfile::default(),
        }
    }
}

impl BridgeOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bridge options: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse bridge options: {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let options: BridgeOptions =
            serde_json::from_str(raw).context("decoding bridge options JSON")?;
        Ok(options)
    }

    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }
}
