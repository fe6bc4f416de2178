//! Staged install transactions.
//!
//! Parts are staged as files in a spool directory; committing runs the
//! configured committer command with the staged part paths appended. The
//! command's exit is adapted into the pipeline's completion channel at this
//! boundary, so the pipeline never sees process plumbing.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use tether_common::AgentError;

use crate::config::{CommandSpec, InstallConfig};
use crate::services::{InstallEvent, InstallResult, InstallSession, PackageInstaller};

pub struct StagedInstaller {
    spool_dir: PathBuf,
    committer: Option<CommandSpec>,
}

impl StagedInstaller {
    pub fn new(cfg: &InstallConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&cfg.spool_dir)
            .with_context(|| format!("failed to create spool dir {}", cfg.spool_dir.display()))?;
        Ok(Self {
            spool_dir: cfg.spool_dir.clone(),
            committer: cfg.committer.clone(),
        })
    }
}

#[async_trait]
impl PackageInstaller for StagedInstaller {
    fn can_request_installs(&self) -> bool {
        self.committer.is_some()
    }

    fn available_bytes(&self) -> Option<u64> {
        fs2::available_space(&self.spool_dir).ok()
    }

    async fn create_session(&self) -> Result<Box<dyn InstallSession>, AgentError> {
        let id = format!("txn-{}", Uuid::new_v4());
        let dir = self.spool_dir.join(&id);
        fs::create_dir_all(&dir).await.map_err(|err| {
            AgentError::platform(format!("Failed to create install session: {err}"))
        })?;
        info!(session = %id, "opened install session");
        Ok(Box::new(StagedSession {
            id,
            dir,
            committer: self.committer.clone(),
            parts: Vec::new(),
            current: None,
        }))
    }

    async fn launch_confirmation(&self, _session_id: &str) -> Result<(), AgentError> {
        // The committer command runs non-interactively on this host; there
        // is no prompt to surface.
        Ok(())
    }
}

struct OpenPart {
    path: PathBuf,
    file: File,
    written: u64,
}

struct StagedSession {
    id: String,
    dir: PathBuf,
    committer: Option<CommandSpec>,
    parts: Vec<PathBuf>,
    current: Option<OpenPart>,
}

#[async_trait]
impl InstallSession for StagedSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open_part(&mut self, name: &str, _declared_len: Option<u64>) -> io::Result<()> {
        let path = self.dir.join(sanitize_part_name(name));
        let file = File::create(&path).await?;
        self.current = Some(OpenPart {
            path,
            file,
            written: 0,
        });
        Ok(())
    }

    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(part) = self.current.as_mut() else {
            return Err(io::Error::other("no open part"));
        };
        part.file.write_all(data).await?;
        part.written += data.len() as u64;
        Ok(())
    }

    async fn finish_part(&mut self) -> io::Result<u64> {
        let Some(mut part) = self.current.take() else {
            return Err(io::Error::other("no open part"));
        };
        part.file.flush().await?;
        part.file.sync_all().await?;
        self.parts.push(part.path);
        Ok(part.written)
    }

    async fn abandon(self: Box<Self>) {
        if let Err(err) = fs::remove_dir_all(&self.dir).await {
            warn!(session = %self.id, error = %err, "failed to clean abandoned session");
        }
    }

    async fn commit(self: Box<Self>) -> Result<mpsc::Receiver<InstallEvent>, AgentError> {
        let Some(committer) = self.committer.clone() else {
            return Err(AgentError::permission("No installer command configured"));
        };
        let (tx, rx) = mpsc::channel(4);
        let session = *self;
        tokio::spawn(async move {
            run_committer(session, committer, tx).await;
        });
        Ok(rx)
    }
}

async fn run_committer(
    session: StagedSession,
    committer: CommandSpec,
    tx: mpsc::Sender<InstallEvent>,
) {
    let mut command = TokioCommand::new(&committer.binary);
    command.args(&committer.args);
    for part in &session.parts {
        command.arg(part);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = match command.output().await {
        Err(err) => InstallResult {
            success: false,
            message: format!("Failed to run installer command: {err}"),
            package: None,
            status_code: None,
        },
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            // The committer may report the installed identifier as JSON.
            let package = serde_json::from_str::<Value>(stdout.trim())
                .ok()
                .and_then(|v| v.get("package").and_then(Value::as_str).map(str::to_owned));
            if output.status.success() {
                InstallResult {
                    success: true,
                    message: "installed".to_string(),
                    package,
                    status_code: output.status.code().map(i64::from),
                }
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                InstallResult {
                    success: false,
                    message: if stderr.is_empty() {
                        "installer command failed".to_string()
                    } else {
                        stderr.to_string()
                    },
                    package,
                    status_code: output.status.code().map(i64::from),
                }
            }
        }
    };

    if let Err(err) = fs::remove_dir_all(&session.dir).await {
        warn!(session = %session.id, error = %err, "failed to clean committed session");
    }
    let _ = tx.send(InstallEvent::Finished(result)).await;
}

fn sanitize_part_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "part".to_string()
    } else {
        cleaned
    }
}
