//! Package-install pipeline.
//!
//! Moves package bytes from a caller-supplied stream or a set of remote URLs
//! into a platform install transaction, coordinates user confirmation and
//! completion signaling, enforces size/storage budgets, and serializes
//! concurrent attempts behind one process-wide lock.
//!
//! Two entry modes with deliberately different failure isolation: a single
//! URL is an independent attempt with its own transaction; several URLs form
//! one atomic multi-part package in one shared transaction (split packages
//! must land together), abandoned wholesale on the first part failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use tether_common::AgentError;

use crate::services::{DeviceUi, InstallEvent, InstallResult, InstallSession, PackageInstaller};

/// Hard cap per package part; a lying source is cut off at this point.
pub const MAX_PACKAGE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Safety margin kept free on top of the declared download size.
pub const FREE_SPACE_MARGIN_BYTES: u64 = 200 * 1024 * 1024;
const COPY_CHUNK_BYTES: usize = 64 * 1024;
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(60);
const COMMIT_WAIT: Duration = Duration::from_secs(180);
const PRE_COMMIT_SETTLE: Duration = Duration::from_secs(1);
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// Counting guard for one part: aborts the moment the running total passes
/// the cap, regardless of what the source declared.
#[derive(Debug)]
struct ByteBudget {
    written: u64,
    cap: u64,
}

impl ByteBudget {
    fn new(cap: u64) -> Self {
        Self { written: 0, cap }
    }

    fn add(&mut self, count: u64) -> Result<(), AgentError> {
        self.written += count;
        if self.written > self.cap {
            Err(AgentError::resource(format!(
                "Package exceeds max allowed size ({} bytes)",
                self.cap
            )))
        } else {
            Ok(())
        }
    }
}

enum CommitOutcome {
    Finished(InstallResult),
    TimedOut,
}

pub struct InstallPipeline {
    installer: Arc<dyn PackageInstaller>,
    ui: Arc<dyn DeviceUi>,
    http: reqwest::Client,
    /// Serializes whole install flows (download + commit + wait).
    flow_lock: Mutex<()>,
}

impl InstallPipeline {
    pub fn new(
        installer: Arc<dyn PackageInstaller>,
        ui: Arc<dyn DeviceUi>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .read_timeout(HTTP_READ_TIMEOUT)
            .build()?;
        Ok(Self {
            installer,
            ui,
            http,
            flow_lock: Mutex::new(()),
        })
    }

    /// Install from one or more URLs. Returns the batch summary object
    /// `{overallSuccess, successCount, failureCount, results[]}`.
    pub async fn install_from_urls(
        &self,
        urls: Vec<String>,
        hide_overlay: bool,
    ) -> Result<Value, AgentError> {
        if urls.is_empty() {
            return Err(AgentError::protocol("No package URLs provided"));
        }

        if !self.installer.can_request_installs() {
            warn!("install permission not granted");
            self.ui.show_install_permission_help().await;
            return Err(AgentError::permission(
                "Install permission denied. Enable installs from unknown sources for this agent in system settings.",
            ));
        }

        let unique: Vec<String> = {
            let mut seen = Vec::new();
            for url in urls {
                let url = url.trim().to_string();
                if !url.is_empty() && !seen.contains(&url) {
                    seen.push(url);
                }
            }
            seen
        };
        if unique.is_empty() {
            return Err(AgentError::protocol("No package URLs provided"));
        }

        let _flow = self.flow_lock.lock().await;

        let mut results = Vec::with_capacity(unique.len());
        let mut success_count = 0usize;

        if unique.len() > 1 {
            // Atomic multi-part install: every URL reports the shared outcome.
            match self.install_split_from_urls(&unique, hide_overlay).await {
                Ok(message) => {
                    for url in &unique {
                        success_count += 1;
                        results.push(json!({"url": url, "success": true, "message": message}));
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    for url in &unique {
                        results.push(json!({"url": url, "success": false, "error": message}));
                    }
                }
            }
        } else {
            for url in &unique {
                match self.install_single_from_url(url, hide_overlay).await {
                    Ok(message) => {
                        success_count += 1;
                        results.push(json!({"url": url, "success": true, "message": message}));
                    }
                    Err(err) => {
                        warn!(url = %url, error = %err, "install from URL failed");
                        results.push(json!({"url": url, "success": false, "error": err.to_string()}));
                    }
                }
            }
        }

        Ok(json!({
            "overallSuccess": success_count == unique.len(),
            "successCount": success_count,
            "failureCount": unique.len() - success_count,
            "results": results,
        }))
    }

    /// Direct stream install: caller supplies the byte source and an
    /// optional declared size.
    pub async fn install_stream<R>(
        &self,
        source: &mut R,
        declared_len: Option<u64>,
        hide_overlay: bool,
    ) -> Result<String, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.installer.can_request_installs() {
            self.ui.show_install_permission_help().await;
            return Err(AgentError::permission(
                "Install permission denied. Enable installs from unknown sources for this agent in system settings.",
            ));
        }
        let _flow = self.flow_lock.lock().await;
        self.install_stream_locked(source, declared_len, hide_overlay)
            .await
    }

    async fn install_stream_locked<R>(
        &self,
        source: &mut R,
        declared_len: Option<u64>,
        hide_overlay: bool,
    ) -> Result<String, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if let Some(declared) = declared_len {
            if declared > MAX_PACKAGE_BYTES {
                return Err(AgentError::resource(format!(
                    "Package too large: {declared} bytes (max {MAX_PACKAGE_BYTES} bytes)"
                )));
            }
            self.check_free_space(Some(declared))?;
        }

        let mut session = self.installer.create_session().await?;
        let written = match self.copy_reader(session.as_mut(), "base_pkg", declared_len, source).await {
            Ok(written) => written,
            Err(err) => {
                session.abandon().await;
                return Err(err);
            }
        };
        info!(bytes = written, "wrote package stream to install session");
        self.commit_session(session, hide_overlay).await
    }

    /// One URL, one independent transaction.
    async fn install_single_from_url(
        &self,
        url: &str,
        hide_overlay: bool,
    ) -> Result<String, AgentError> {
        check_scheme(url)?;
        let response = self.fetch(url).await?;
        let declared = response.content_length();

        if let Some(declared) = declared {
            if declared > MAX_PACKAGE_BYTES {
                return Err(AgentError::resource(format!(
                    "Package too large: {declared} bytes (max {MAX_PACKAGE_BYTES} bytes)"
                )));
            }
        }
        self.check_free_space(declared)?;

        let mut session = self.installer.create_session().await?;
        let written = match self
            .copy_response(session.as_mut(), "base_pkg", declared, response)
            .await
        {
            Ok(written) => written,
            Err(err) => {
                session.abandon().await;
                return Err(err);
            }
        };
        info!(url = %url, bytes = written, "wrote package to install session");
        self.commit_session(session, hide_overlay).await
    }

    /// Several URLs, one shared transaction: the first failing part abandons
    /// the whole thing.
    async fn install_split_from_urls(
        &self,
        urls: &[String],
        hide_overlay: bool,
    ) -> Result<String, AgentError> {
        // Validate every scheme before any I/O.
        for url in urls {
            check_scheme(url)?;
        }

        let mut session = self.installer.create_session().await?;
        let mut total = 0u64;
        for (index, url) in urls.iter().enumerate() {
            let part = format!("part_{index}");
            match self.download_part(session.as_mut(), &part, url).await {
                Ok(written) => total += written,
                Err(err) => {
                    session.abandon().await;
                    return Err(err);
                }
            }
        }
        info!(parts = urls.len(), bytes = total, "wrote split package to install session");
        self.commit_session(session, hide_overlay).await
    }

    async fn download_part(
        &self,
        session: &mut dyn InstallSession,
        part: &str,
        url: &str,
    ) -> Result<u64, AgentError> {
        let response = self.fetch(url).await?;
        let declared = response.content_length();
        if let Some(declared) = declared {
            if declared > MAX_PACKAGE_BYTES {
                return Err(AgentError::resource(format!(
                    "Package too large: {declared} bytes (max {MAX_PACKAGE_BYTES} bytes)"
                )));
            }
        }
        self.check_free_space(declared)?;
        self.copy_response(session, part, declared, response).await
    }

    /// GET with bounded connect/read timeouts; non-2xx becomes a download
    /// error carrying a truncated response body.
    async fn fetch(&self, url: &str) -> Result<reqwest::Response, AgentError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/octet-stream, */*")
            .send()
            .await
            .map_err(|err| AgentError::network(format!("Download failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = format!("Download failed: HTTP {}", status.as_u16());
            if let Some(reason) = status.canonical_reason() {
                message.push(' ');
                message.push_str(reason);
            }
            let body = response.text().await.unwrap_or_default();
            let body = body.trim();
            if !body.is_empty() {
                let mut end = MAX_ERROR_BODY_BYTES.min(body.len());
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                message.push_str(": ");
                message.push_str(&body[..end]);
            }
            return Err(AgentError::network(message));
        }
        Ok(response)
    }

    fn check_free_space(&self, declared_len: Option<u64>) -> Result<(), AgentError> {
        let Some(available) = self.installer.available_bytes() else {
            return Ok(()); // probe failed; proceed rather than refuse
        };
        let required = match declared_len {
            Some(len) if len > 0 => len + FREE_SPACE_MARGIN_BYTES,
            _ => FREE_SPACE_MARGIN_BYTES,
        };
        if available < required {
            return Err(AgentError::resource(format!(
                "Insufficient storage: need ~{required} bytes, have {available} bytes"
            )));
        }
        Ok(())
    }

    async fn copy_response(
        &self,
        session: &mut dyn InstallSession,
        part: &str,
        declared_len: Option<u64>,
        mut response: reqwest::Response,
    ) -> Result<u64, AgentError> {
        session
            .open_part(part, declared_len)
            .await
            .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))?;
        let mut budget = ByteBudget::new(MAX_PACKAGE_BYTES);
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|err| AgentError::network(format!("Download failed: {err}")))?;
            let Some(chunk) = chunk else { break };
            budget.add(chunk.len() as u64)?;
            session
                .write_chunk(&chunk)
                .await
                .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))?;
        }
        session
            .finish_part()
            .await
            .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))
    }

    async fn copy_reader<R>(
        &self,
        session: &mut dyn InstallSession,
        part: &str,
        declared_len: Option<u64>,
        source: &mut R,
    ) -> Result<u64, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        session
            .open_part(part, declared_len)
            .await
            .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))?;
        let mut budget = ByteBudget::new(MAX_PACKAGE_BYTES);
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let count = source
                .read(&mut buf)
                .await
                .map_err(|err| AgentError::network(format!("Package stream read failed: {err}")))?;
            if count == 0 {
                break;
            }
            budget.add(count as u64)?;
            session
                .write_chunk(&buf[..count])
                .await
                .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))?;
        }
        session
            .finish_part()
            .await
            .map_err(|err| AgentError::platform(format!("Install session write failed: {err}")))
    }

    /// Shared commit step: borrow the overlay, foreground the app, settle,
    /// commit, wait bounded for completion, then restore and report on every
    /// exit path.
    async fn commit_session(
        &self,
        session: Box<dyn InstallSession>,
        hide_overlay: bool,
    ) -> Result<String, AgentError> {
        let session_id = session.id().to_string();

        let was_visible = self.ui.overlay_visible().await;
        let hide = hide_overlay && was_visible;
        if hide {
            info!(session = %session_id, "hiding overlay during install confirmation");
            self.ui.set_overlay_visible(false).await;
        }

        let outcome = self.commit_and_wait(session, &session_id).await;

        if hide {
            self.ui.set_overlay_visible(was_visible).await;
        }

        let (reply, result) = match outcome {
            Ok(CommitOutcome::Finished(result)) if result.success => {
                (Ok("Package installed successfully".to_string()), result)
            }
            Ok(CommitOutcome::Finished(result)) => {
                let mut message = format!("Install failed: {}", result.message);
                if let Some(code) = result.status_code {
                    message.push_str(&format!(" (status {code})"));
                }
                (Err(AgentError::platform(message)), result)
            }
            Ok(CommitOutcome::TimedOut) => {
                let message = "Timed out waiting for install result".to_string();
                let result = InstallResult {
                    success: false,
                    message: message.clone(),
                    package: None,
                    status_code: None,
                };
                (Err(AgentError::timeout(message)), result)
            }
            Err(err) => {
                let result = InstallResult {
                    success: false,
                    message: err.to_string(),
                    package: None,
                    status_code: None,
                };
                (Err(err), result)
            }
        };

        self.report(&result).await;
        reply
    }

    async fn commit_and_wait(
        &self,
        session: Box<dyn InstallSession>,
        session_id: &str,
    ) -> Result<CommitOutcome, AgentError> {
        // The platform only shows its confirmation UI while we are frontmost.
        self.ui.bring_app_foreground().await;
        sleep(PRE_COMMIT_SETTLE).await;

        info!(session = %session_id, "committing install session");
        let mut events = session.commit().await?;

        let deadline = Instant::now() + COMMIT_WAIT;
        let mut confirmation_launched = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, events.recv()).await {
                Err(_) => return Ok(CommitOutcome::TimedOut),
                Ok(None) => {
                    return Err(AgentError::platform(
                        "Install completion channel closed without a result",
                    ));
                }
                Ok(Some(InstallEvent::AwaitingConfirmation)) => {
                    // Duplicate notifications must not relaunch the prompt.
                    if !confirmation_launched {
                        confirmation_launched = true;
                        if let Err(err) = self.installer.launch_confirmation(session_id).await {
                            return Err(AgentError::platform(format!(
                                "Failed to launch install confirmation: {err}"
                            )));
                        }
                    }
                }
                Ok(Some(InstallEvent::Finished(result))) => {
                    return Ok(CommitOutcome::Finished(result));
                }
            }
        }
    }

    /// Out-of-band reporting: structured broadcast always, notification only
    /// when the controlling app is backgrounded.
    async fn report(&self, result: &InstallResult) {
        let suffix = result
            .package
            .as_deref()
            .map(|p| format!(" ({p})"))
            .unwrap_or_default();
        let message = if result.success {
            format!("Package installed successfully{suffix}")
        } else {
            format!("Install failed{suffix}: {}", result.message)
        };
        let broadcast = InstallResult {
            message,
            ..result.clone()
        };
        self.ui.broadcast_install_result(&broadcast).await;
        if !self.ui.is_app_foreground().await {
            self.ui
                .show_notification("Package install", &broadcast.message)
                .await;
        }
    }
}

fn check_scheme(url: &str) -> Result<(), AgentError> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("http") | Some("https") => Ok(()),
        Some(other) => Err(AgentError::resource(format!(
            "Unsupported URL scheme: {other}"
        ))),
        None => Err(AgentError::resource("Unsupported URL scheme: none")),
    }
}
