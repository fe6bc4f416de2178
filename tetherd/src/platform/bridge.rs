//! Automation bridge.
//!
//! Fulfils the UI-state, gesture, text-input, device-UI, and streaming
//! traits by invoking a configured helper binary once per operation:
//! `<binary> <args...> <op> <json-params>`. The helper prints a JSON value
//! on stdout; a non-zero exit or a timeout becomes a platform error. With
//! no binary configured every operation fails with a clear message, which
//! the dispatcher converts into Error envelopes.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

use tether_common::AgentError;

use crate::config::BridgeConfig;
use crate::services::{
    DeviceUi, Gestures, InstallResult, OutboundSender, StreamStartRequest, StreamingControl,
    TextInput, UiState,
};

const STDERR_SNIPPET_LIMIT: usize = 512;

pub struct CommandBridge {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
    /// Held while the reverse link is up; the helper can request pushes
    /// through a future invocation, so this is informational for now.
    transport: StdMutex<Option<OutboundSender>>,
}

impl CommandBridge {
    pub fn new(cfg: &BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            binary: cfg.binary.clone(),
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            transport: StdMutex::new(None),
        })
    }

    async fn invoke(&self, op: &str, params: Value) -> Result<Value, AgentError> {
        if self.binary.trim().is_empty() {
            return Err(AgentError::platform(
                "Automation bridge not configured; cannot execute device operations",
            ));
        }
        debug!(op, "invoking automation bridge");
        let mut command = TokioCommand::new(&self.binary);
        command
            .args(&self.args)
            .arg(op)
            .arg(params.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| AgentError::timeout(format!("Bridge operation {op} timed out")))?
            .map_err(|err| {
                AgentError::platform(format!("Failed to run automation bridge: {err}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                output.status.to_string()
            } else {
                let mut end = STDERR_SNIPPET_LIMIT.min(stderr.len());
                while !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr[..end].to_string()
            };
            return Err(AgentError::platform(format!(
                "Bridge operation {op} failed: {detail}"
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(trimmed).map_err(|err| {
            AgentError::platform(format!("Bridge returned invalid JSON for {op}: {err}"))
        })
    }

    /// Boolean operations: `{"ok": false}` or any failure means false.
    async fn invoke_flag(&self, op: &str, params: Value) -> bool {
        match self.invoke(op, params).await {
            Ok(value) => value.get("ok").and_then(Value::as_bool).unwrap_or(true),
            Err(err) => {
                warn!(op, error = %err, "bridge operation failed");
                false
            }
        }
    }

    /// Fire-and-forget operations: failures are logged, never surfaced.
    async fn invoke_quiet(&self, op: &str, params: Value) {
        if let Err(err) = self.invoke(op, params).await {
            debug!(op, error = %err, "bridge operation failed");
        }
    }

    fn message_or(value: &Value, fallback: &str) -> String {
        value
            .as_str()
            .or_else(|| value.get("message").and_then(Value::as_str))
            .unwrap_or(fallback)
            .to_string()
    }
}

#[async_trait]
impl UiState for CommandBridge {
    async fn visible_elements(&self) -> Result<Value, AgentError> {
        self.invoke("ui.elements", json!({})).await
    }

    async fn full_tree(&self, filter: bool) -> Result<Option<Value>, AgentError> {
        let tree = self.invoke("ui.tree", json!({ "filter": filter })).await?;
        Ok(if tree.is_null() { None } else { Some(tree) })
    }

    async fn phone_state(&self) -> Result<Value, AgentError> {
        self.invoke("ui.phone_state", json!({})).await
    }

    async fn device_context(&self) -> Result<Value, AgentError> {
        self.invoke("ui.device_context", json!({})).await
    }

    async fn list_packages(&self) -> Result<Value, AgentError> {
        self.invoke("ui.packages", json!({})).await
    }

    async fn screenshot(&self, hide_overlay: bool) -> Result<String, AgentError> {
        let value = self
            .invoke("ui.screenshot", json!({ "hideOverlay": hide_overlay }))
            .await?;
        value
            .as_str()
            .map(str::to_owned)
            .or_else(|| {
                value
                    .get("data")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .ok_or_else(|| AgentError::platform("Bridge returned no screenshot data"))
    }
}

#[async_trait]
impl Gestures for CommandBridge {
    async fn tap(&self, x: i64, y: i64) -> bool {
        self.invoke_flag("gesture.tap", json!({ "x": x, "y": y })).await
    }

    async fn swipe(
        &self,
        start_x: i64,
        start_y: i64,
        end_x: i64,
        end_y: i64,
        duration_ms: i64,
    ) -> bool {
        self.invoke_flag(
            "gesture.swipe",
            json!({
                "startX": start_x,
                "startY": start_y,
                "endX": end_x,
                "endY": end_y,
                "duration": duration_ms,
            }),
        )
        .await
    }

    async fn global_action(&self, action: i64) -> bool {
        self.invoke_flag("gesture.global", json!({ "action": action }))
            .await
    }
}

#[async_trait]
impl TextInput for CommandBridge {
    async fn is_available(&self) -> bool {
        match self.invoke("input.available", json!({})).await {
            Ok(value) => value.get("ok").and_then(Value::as_bool).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn input_text(&self, text: &str, clear: bool) -> bool {
        self.invoke_flag("input.text", json!({ "text": text, "clear": clear }))
            .await
    }

    async fn clear_text(&self) -> bool {
        self.invoke_flag("input.clear", json!({})).await
    }

    async fn send_key(&self, key_code: i64) -> bool {
        self.invoke_flag("input.key", json!({ "key_code": key_code }))
            .await
    }
}

#[async_trait]
impl StreamingControl for CommandBridge {
    async fn start(&self, request: StreamStartRequest) -> Result<String, AgentError> {
        let value = self
            .invoke(
                "stream.start",
                json!({
                    "width": request.width,
                    "height": request.height,
                    "fps": request.fps,
                    "sessionId": request.session_id,
                    "waitForOffer": request.wait_for_offer,
                    "iceServers": request.ice_servers,
                }),
            )
            .await?;
        Ok(Self::message_or(&value, "stream_starting"))
    }

    async fn stop(&self, graceful: bool) -> Result<String, AgentError> {
        let value = self
            .invoke("stream.stop", json!({ "graceful": graceful }))
            .await?;
        Ok(Self::message_or(&value, "stream_stopping"))
    }

    async fn is_active(&self) -> bool {
        match self.invoke("stream.status", json!({})).await {
            Ok(value) => value.get("active").and_then(Value::as_bool).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn handle_offer(&self, sdp: &str, session_id: &str) -> Result<(), AgentError> {
        self.invoke("webrtc.offer", json!({ "sdp": sdp, "sessionId": session_id }))
            .await
            .map(|_| ())
    }

    async fn handle_answer(&self, sdp: &str) -> Result<(), AgentError> {
        self.invoke("webrtc.answer", json!({ "sdp": sdp })).await.map(|_| ())
    }

    async fn handle_ice(
        &self,
        candidate: &str,
        sdp_mid: &str,
        sdp_mline_index: i64,
    ) -> Result<(), AgentError> {
        self.invoke(
            "webrtc.ice",
            json!({
                "candidate": candidate,
                "sdpMid": sdp_mid,
                "sdpMLineIndex": sdp_mline_index,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn transport_available(&self, outbound: OutboundSender) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(outbound);
        }
        self.invoke_quiet("transport.open", json!({})).await;
    }

    async fn transport_lost(&self, reason: &str) {
        if let Ok(mut slot) = self.transport.lock() {
            slot.take();
        }
        self.invoke_quiet("transport.lost", json!({ "reason": reason }))
            .await;
    }
}

#[async_trait]
impl DeviceUi for CommandBridge {
    async fn overlay_visible(&self) -> bool {
        match self.invoke("overlay.get", json!({})).await {
            Ok(value) => value
                .get("visible")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn set_overlay_visible(&self, visible: bool) -> bool {
        self.invoke_flag("overlay.set", json!({ "visible": visible }))
            .await
    }

    async fn set_overlay_offset(&self, offset: i64) -> bool {
        self.invoke_flag("overlay.offset", json!({ "offset": offset }))
            .await
    }

    async fn is_app_foreground(&self) -> bool {
        match self.invoke("app.is_foreground", json!({})).await {
            Ok(value) => value
                .get("foreground")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            // Unknown visibility must not trigger spurious notifications.
            Err(_) => true,
        }
    }

    async fn bring_app_foreground(&self) {
        self.invoke_quiet("app.foreground", json!({})).await;
    }

    async fn show_toast(&self, text: &str) {
        self.invoke_quiet("ui.toast", json!({ "text": text })).await;
    }

    async fn show_notification(&self, title: &str, text: &str) {
        self.invoke_quiet("ui.notify", json!({ "title": title, "text": text }))
            .await;
    }

    async fn show_install_permission_help(&self) {
        self.invoke_quiet("install.permission_help", json!({})).await;
    }

    async fn start_app(&self, package: &str, activity: Option<&str>) -> Result<String, AgentError> {
        self.invoke("app.start", json!({ "package": package, "activity": activity }))
            .await?;
        Ok(format!("Started app {package}"))
    }

    async fn wake_screen(&self) -> Result<String, AgentError> {
        let value = self.invoke("screen.wake", json!({})).await?;
        Ok(Self::message_or(&value, "Screen woken up"))
    }

    async fn broadcast_install_result(&self, result: &InstallResult) {
        self.invoke_quiet(
            "install.result",
            json!({
                "success": result.success,
                "message": result.message,
                "package": result.package,
                "statusCode": result.status_code,
            }),
        )
        .await;
    }
}
