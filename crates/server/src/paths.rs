//! Path resolution for specstream data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SPECSTREAM_DATA_DIR` env > `~/.specstream`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// `explicit` wins (clap has already folded the env var into it), then
    /// `SPECSTREAM_DATA_DIR`, then `~/.specstream`.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os("SPECSTREAM_DATA_DIR") {
                Some(value) if !value.is_empty() => PathBuf::from(value),
                _ => dirs::home_dir()
                    .context("home directory not found; pass --data-dir")?
                    .join(".specstream"),
            },
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("specstream.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
