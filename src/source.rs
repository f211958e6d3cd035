// source.rs — kernel source lookup by resource name.
//
// Steps name their kernel source (e.g. "pre_fast_gray.wgsl") and resolve it
// through a `SourceLoader` at compile time. The bundled kernels ship inside
// the binary; a directory loader lets applications override or add sources
// without rebuilding.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Resolves a resource name to kernel source text.
pub trait SourceLoader {
    /// Missing or unreadable sources are `Error::ResourceNotFound`.
    fn load(&self, name: &str) -> Result<String>;
}

/// In-memory sources, pre-filled with the kernels bundled with the crate.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSources {
    sources: HashMap<String, String>,
}

impl EmbeddedSources {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The kernels shipped with the crate.
    pub fn bundled() -> Self {
        Self::new().with(
            "pre_fast_gray.wgsl",
            include_str!("kernels/pre_fast_gray.wgsl"),
        )
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(name.into(), source.into());
    }

    pub fn with(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }
}

impl SourceLoader for EmbeddedSources {
    fn load(&self, name: &str) -> Result<String> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound { name: name.to_string() })
    }
}

/// Sources read from files under a root directory.
#[derive(Debug, Clone)]
pub struct DirSources {
    root: PathBuf,
}

impl DirSources {
    pub fn new(root: impl AsRef<Path>) -> Self {
        DirSources { root: root.as_ref().to_path_buf() }
    }
}

impl SourceLoader for DirSources {
    fn load(&self, name: &str) -> Result<String> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).map_err(|e| {
            debug!("loading {}: {e}", path.display());
            Error::ResourceNotFound { name: name.to_string() }
        })
    }
}

impl<L: SourceLoader + ?Sized> SourceLoader for &L {
    fn load(&self, name: &str) -> Result<String> {
        (**self).load(name)
    }
}
