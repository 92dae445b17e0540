//! Translates WebAssembly modules produced by the Go toolchain into C# source.

pub mod error;
pub mod wasm;
pub mod parser;
pub mod ir;
pub mod mapper;
pub mod translator;
#[macro_use]
pub mod emitter;
pub mod shim;
pub mod coordinator;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use fxhash::FxHashMap;

pub use crate::emitter::{Unit, UnitKind};
pub use crate::error::{kind_of, TranslateError};

/// Parameters of one translation run.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub out_dir: PathBuf,
    /// Defined functions per function-body unit.
    pub group_size: usize,
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Also emit `Mem.cs` and `Import.cs`.
    pub runtime_support: bool,
    /// C# method bodies keyed by qualified import name.
    pub overrides: FxHashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "Wasm".to_string(),
            out_dir: PathBuf::from("."),
            group_size: 64,
            threads: None,
            runtime_support: true,
            overrides: FxHashMap::default(),
        }
    }
}

impl Config {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn out_dir(mut self, out_dir: impl AsRef<Path>) -> Self {
        self.out_dir = out_dir.as_ref().to_path_buf();
        self
    }

    pub fn group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn runtime_support(mut self, enabled: bool) -> Self {
        self.runtime_support = enabled;
        self
    }

    pub fn override_import(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), body.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            bail!("group size must be at least 1");
        }
        if self.threads == Some(0) {
            bail!("thread count must be at least 1");
        }
        let valid_part = |part: &str| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !emitter::KEYWORDS.contains(&part)
        };
        if !self.namespace.split('.').all(valid_part) {
            bail!("invalid namespace {:?}", self.namespace);
        }
        Ok(())
    }
}

/// Translates `wasm` and writes the C# units into `config.out_dir`.
pub fn translate(wasm: &[u8], config: &Config) -> Result<Vec<PathBuf>> {
    config.validate()?;
    let module = parser::parse(wasm)?;
    coordinator::write_units(&module, config)
}

/// Translates `wasm` into in-memory units, in emission order.
pub fn render(wasm: &[u8], config: &Config) -> Result<Vec<Unit>> {
    config.validate()?;
    let module = parser::parse(wasm)?;
    coordinator::render_units(&module, config)
}
