//! Import tool invocation.
//!
//! Staged diffs are merged into the store by an external import tool
//! (osm2pgsql-compatible command line) running in append mode.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::LoopParameters;
use crate::error::{Error, Result};

/// Number of stderr lines kept in an import error
const STDERR_TAIL_LINES: usize = 20;

/// Applies staged change files to the store.
#[async_trait]
pub trait Importer: Send + Sync {
    /// Apply `files` in the given order.
    async fn import(&self, files: &[PathBuf], params: &LoopParameters) -> Result<()>;
}

/// Runs the configured import tool as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandImporter;

impl CommandImporter {
    pub fn new() -> Self {
        Self
    }

    /// Command line arguments for the import tool.
    pub fn build_args(files: &[PathBuf], params: &LoopParameters) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--append".into(),
            "--slim".into(),
            "--cache".into(),
            params.import_cache_mb.to_string().into(),
            "--number-processes".into(),
            params.threads.max(1).to_string().into(),
        ];

        if let Some(style) = &params.import_style {
            args.push("--style".into());
            args.push(style.into());
        }

        if let Some(flatnodes) = &params.flatnode_file {
            args.push("--flat-nodes".into());
            args.push(flatnodes.into());
        }

        args.push("-d".into());
        args.push(params.dsn.clone().into());

        args.extend(files.iter().map(|f| f.clone().into_os_string()));
        args
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl Importer for CommandImporter {
    async fn import(&self, files: &[PathBuf], params: &LoopParameters) -> Result<()> {
        let args = Self::build_args(files, params);
        log::info!(
            "Running {} on {} change file(s)",
            params.import_tool.display(),
            files.len()
        );
        log::debug!("Import arguments: {:?}", args);

        let output = Command::new(&params.import_tool)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Import(format!("failed to start {}: {}", params.import_tool.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Import(format!(
                "{} failed with exit code {:?}: {}",
                params.import_tool.display(),
                output.status.code(),
                stderr_tail(&output.stderr)
            )));
        }

        Ok(())
    }
}
