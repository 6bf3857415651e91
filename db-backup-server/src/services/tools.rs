//! External tools: xtrabackup creates backups, rclone moves them to and from
//! remote storage. Both are opaque subprocesses; exit status and combined
//! output are the whole contract.

use crate::config::AppConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} failed ({status}), output: {output}")]
    Failed {
        program: String,
        status: String,
        output: String,
    },
}

/// Creates a backup in `target`; incrementals are taken against `base`.
#[async_trait]
pub trait BackupTool: Send + Sync {
    async fn create(&self, target: &Path, base: Option<&Path>) -> Result<(), ToolError>;
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Copy a local backup directory to the same path on `remote`.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ToolError>;

    /// Copy `remote_path` on `remote` into the local `dest`.
    async fn download(&self, remote: &str, remote_path: &Path, dest: &Path) -> Result<(), ToolError>;
}

/// Runs `program` to completion and returns its stdout followed by stderr.
pub async fn run_subprocess(program: &str, args: &[String]) -> Result<String, ToolError> {
    tracing::debug!(program, "Running subprocess");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(ToolError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            output: combined,
        })
    }
}

// ── xtrabackup ──

pub struct Xtrabackup {
    program: String,
    datadir: PathBuf,
    user: String,
    password: String,
    host: String,
    port: u16,
    parallel: u32,
}

impl Xtrabackup {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: "xtrabackup".into(),
            datadir: config.mysql_datadir.clone(),
            user: config.mysql_user.clone(),
            password: config.mysql_password.clone(),
            host: config.mysql_host.clone(),
            port: config.mysql_port,
            parallel: config.parallel,
        }
    }

    fn args(&self, target: &Path, base: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--backup".to_string(),
            format!("--datadir={}", self.datadir.display()),
            format!("--user={}", self.user),
            format!("--password={}", self.password),
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--target-dir={}", target.display()),
        ];
        if let Some(base) = base {
            args.push(format!("--incremental-basedir={}", base.display()));
        }
        args.push(format!("--parallel={}", self.parallel));
        args.push("--compress=zstd".to_string());
        args.push(format!("--compress-threads={}", self.parallel));
        args
    }
}

#[async_trait]
impl BackupTool for Xtrabackup {
    async fn create(&self, target: &Path, base: Option<&Path>) -> Result<(), ToolError> {
        run_subprocess(&self.program, &self.args(target, base)).await?;
        Ok(())
    }
}

// ── rclone ──

pub struct Rclone {
    program: String,
    config_file: PathBuf,
}

impl Rclone {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: "rclone".into(),
            config_file: config.rclone_config.clone(),
        }
    }

    fn copy_args(&self, source: String, dest: String) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_file.display().to_string(),
            "copy".to_string(),
            source,
            dest,
        ]
    }
}

/// `onedrive:` + `/backup/db_x` -> `onedrive:/backup/db_x`
pub fn remote_location(remote: &str, path: &Path) -> String {
    format!("{remote}{}", path.display())
}

#[async_trait]
impl RemoteStorage for Rclone {
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), ToolError> {
        let args = self.copy_args(local.display().to_string(), remote_location(remote, local));
        run_subprocess(&self.program, &args).await?;
        Ok(())
    }

    async fn download(&self, remote: &str, remote_path: &Path, dest: &Path) -> Result<(), ToolError> {
        let args = self.copy_args(remote_location(remote, remote_path), dest.display().to_string());
        run_subprocess(&self.program, &args).await?;
        Ok(())
    }
}
