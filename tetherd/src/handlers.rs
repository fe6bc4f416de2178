//! Capability handlers.
//!
//! One method per catalog entry, each a thin translation between wire params
//! and a collaborator trait call. Handlers return `Ok(Outcome)` or a typed
//! `AgentError`; the dispatcher turns either into an envelope.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::timeout;

use tether_common::{AgentError, Outcome};

use crate::install::InstallPipeline;
use crate::services::{DeviceUi, Gestures, StreamStartRequest, StreamingControl, TextInput, UiState};

const DEFAULT_SWIPE_DURATION_MS: i64 = 300;
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(5);

pub type Params = Map<String, Value>;

pub struct Handlers {
    ui_state: Arc<dyn UiState>,
    gestures: Arc<dyn Gestures>,
    text_input: Arc<dyn TextInput>,
    streaming: Arc<dyn StreamingControl>,
    device_ui: Arc<dyn DeviceUi>,
    install: Arc<InstallPipeline>,
    version: String,
    /// Local-channel rebind requests flow through here.
    local_port: watch::Sender<u16>,
}

impl Handlers {
    pub fn new(
        ui_state: Arc<dyn UiState>,
        gestures: Arc<dyn Gestures>,
        text_input: Arc<dyn TextInput>,
        streaming: Arc<dyn StreamingControl>,
        device_ui: Arc<dyn DeviceUi>,
        install: Arc<InstallPipeline>,
        version: impl Into<String>,
        local_port: watch::Sender<u16>,
    ) -> Self {
        Self {
            ui_state,
            gestures,
            text_input,
            streaming,
            device_ui,
            install,
            version: version.into(),
            local_port,
        }
    }

    pub async fn ping(&self) -> Result<Outcome, AgentError> {
        Ok(Outcome::Success(json!("pong")))
    }

    pub async fn tap(&self, params: &Params) -> Result<Outcome, AgentError> {
        let x = opt_i64(params, "x", 0);
        let y = opt_i64(params, "y", 0);
        if self.gestures.tap(x, y).await {
            Ok(Outcome::Success(json!(format!(
                "Tap performed at ({x}, {y})"
            ))))
        } else {
            Err(AgentError::platform(format!(
                "Failed to perform tap at ({x}, {y})"
            )))
        }
    }

    pub async fn swipe(&self, params: &Params) -> Result<Outcome, AgentError> {
        let start_x = opt_i64(params, "startX", 0);
        let start_y = opt_i64(params, "startY", 0);
        let end_x = opt_i64(params, "endX", 0);
        let end_y = opt_i64(params, "endY", 0);
        let duration = opt_i64(params, "duration", DEFAULT_SWIPE_DURATION_MS);
        if self
            .gestures
            .swipe(start_x, start_y, end_x, end_y, duration)
            .await
        {
            Ok(Outcome::Success(json!("Swipe performed")))
        } else {
            Err(AgentError::platform("Failed to perform swipe"))
        }
    }

    pub async fn global_action(&self, params: &Params) -> Result<Outcome, AgentError> {
        let action = opt_i64(params, "action", 0);
        if self.gestures.global_action(action).await {
            Ok(Outcome::Success(json!(format!(
                "Global action {action} performed"
            ))))
        } else {
            Err(AgentError::platform(format!(
                "Failed to perform global action {action}"
            )))
        }
    }

    pub async fn start_app(&self, params: &Params) -> Result<Outcome, AgentError> {
        let package = req_str(params, "package")?;
        // Treat empty string or a literal "null" as no activity.
        let activity = opt_str(params, "activity").filter(|a| !a.is_empty() && *a != "null");
        let message = self.device_ui.start_app(package, activity).await?;
        Ok(Outcome::Success(json!(message)))
    }

    pub async fn keyboard_input(&self, params: &Params) -> Result<Outcome, AgentError> {
        let encoded = opt_str(params, "base64_text").unwrap_or_default();
        let clear = opt_bool(params, "clear", true);
        let bytes = BASE64
            .decode(encoded)
            .map_err(|err| AgentError::protocol(format!("Invalid base64 text: {err}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|err| AgentError::protocol(format!("Text is not valid UTF-8: {err}")))?;
        if !self.text_input.is_available().await {
            return Err(AgentError::platform(
                "Input failed (text input service unavailable)",
            ));
        }
        if self.text_input.input_text(&text, clear).await {
            Ok(Outcome::Success(json!(format!("Input done (clear={clear})"))))
        } else {
            Err(AgentError::platform("Input failed"))
        }
    }

    pub async fn keyboard_clear(&self) -> Result<Outcome, AgentError> {
        if !self.text_input.is_available().await {
            return Err(AgentError::platform(
                "Clear failed (text input service unavailable)",
            ));
        }
        if self.text_input.clear_text().await {
            Ok(Outcome::Success(json!("Text cleared")))
        } else {
            Err(AgentError::platform("Clear failed"))
        }
    }

    pub async fn keyboard_key(&self, params: &Params) -> Result<Outcome, AgentError> {
        let key_code = opt_i64(params, "key_code", 0);
        if !self.text_input.is_available().await {
            return Err(AgentError::platform(
                "Key forwarding failed (text input service unavailable)",
            ));
        }
        if self.text_input.send_key(key_code).await {
            Ok(Outcome::Success(json!(format!(
                "Key event sent - code: {key_code}"
            ))))
        } else {
            Err(AgentError::platform(format!(
                "Unsupported key code: {key_code}"
            )))
        }
    }

    pub async fn overlay_offset(&self, params: &Params) -> Result<Outcome, AgentError> {
        let offset = opt_i64(params, "offset", 0);
        if self.device_ui.set_overlay_offset(offset).await {
            Ok(Outcome::Success(json!(format!(
                "Overlay offset updated to {offset}"
            ))))
        } else {
            Err(AgentError::platform("Failed to update overlay offset"))
        }
    }

    pub async fn socket_port(&self, params: &Params) -> Result<Outcome, AgentError> {
        let port = opt_i64(params, "port", 0);
        if !(1..=65535).contains(&port) {
            return Err(AgentError::protocol(format!(
                "Failed to update socket server port to {port} (invalid)"
            )));
        }
        self.local_port
            .send(port as u16)
            .map_err(|_| AgentError::platform("Local channel is not running"))?;
        Ok(Outcome::Success(json!(format!(
            "Socket server port updated to {port}"
        ))))
    }

    pub async fn screenshot(&self, params: &Params) -> Result<Outcome, AgentError> {
        // Hide the overlay by default so it does not end up in the capture.
        let hide_overlay = opt_bool(params, "hideOverlay", true);
        match timeout(SCREENSHOT_TIMEOUT, self.ui_state.screenshot(hide_overlay)).await {
            Err(_) => Err(AgentError::timeout(
                "Screenshot timeout - operation took too long",
            )),
            Ok(Err(err)) => Err(err),
            Ok(Ok(encoded)) => Ok(Outcome::Success(json!(encoded))),
        }
    }

    pub async fn packages(&self) -> Result<Outcome, AgentError> {
        let packages = self.ui_state.list_packages().await?;
        Ok(Outcome::Raw(packages))
    }

    pub async fn state(&self, params: &Params) -> Result<Outcome, AgentError> {
        let filter = opt_bool(params, "filter", false);
        let tree = self
            .ui_state
            .full_tree(filter)
            .await?
            .ok_or_else(|| AgentError::platform("No active window or root filtered out"))?;
        let phone_state = self.ui_state.phone_state().await?;
        let device_context = self.ui_state.device_context().await?;
        Ok(Outcome::Raw(json!({
            "a11y_tree": tree,
            "phone_state": phone_state,
            "device_context": device_context,
        })))
    }

    pub async fn version(&self) -> Result<Outcome, AgentError> {
        Ok(Outcome::Success(json!(self.version)))
    }

    pub async fn time(&self) -> Result<Outcome, AgentError> {
        Ok(Outcome::Success(json!(chrono::Utc::now().timestamp_millis())))
    }

    pub async fn wake(&self) -> Result<Outcome, AgentError> {
        let message = self.device_ui.wake_screen().await?;
        Ok(Outcome::Success(json!(message)))
    }

    /// Validated by the dispatcher before enqueueing; runs on the install
    /// worker, never on a connection task.
    pub async fn install(&self, params: &Params) -> Result<Outcome, AgentError> {
        let hide_overlay = opt_bool(params, "hideOverlay", false);
        let urls = install_urls(params)?;
        let summary = self.install.install_from_urls(urls, hide_overlay).await?;
        Ok(Outcome::Raw(summary))
    }

    pub async fn stream_start(&self, params: &Params) -> Result<Outcome, AgentError> {
        let request = StreamStartRequest {
            width: opt_i64(params, "width", 720).clamp(144, 1920),
            height: opt_i64(params, "height", 1280).clamp(256, 3840),
            fps: opt_i64(params, "fps", 30).clamp(1, 60),
            session_id: opt_str(params, "sessionId")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            wait_for_offer: opt_bool(params, "waitForOffer", false),
            ice_servers: params.get("iceServers").cloned(),
        };
        let message = self.streaming.start(request).await?;
        Ok(Outcome::Success(json!(message)))
    }

    pub async fn stream_stop(&self, graceful: bool) -> Result<Outcome, AgentError> {
        self.streaming.stop(graceful).await?;
        Ok(Outcome::Success(json!("Stop stream requested")))
    }

    pub async fn webrtc_answer(&self, params: &Params) -> Result<Outcome, AgentError> {
        let sdp = req_str(params, "sdp")?;
        if !self.streaming.is_active().await {
            return Err(AgentError::platform("No active stream"));
        }
        self.streaming.handle_answer(sdp).await?;
        Ok(Outcome::Success(json!("SDP Answer processed")))
    }

    pub async fn webrtc_offer(&self, params: &Params) -> Result<Outcome, AgentError> {
        let session_id = req_str(params, "sessionId")?;
        let sdp = req_str(params, "sdp")?;
        if !self.streaming.is_active().await {
            return Err(AgentError::platform(
                "No active stream - call stream/start first",
            ));
        }
        self.streaming.handle_offer(sdp, session_id).await?;
        Ok(Outcome::Success(json!(
            "SDP Offer processed, answer will be sent"
        )))
    }

    pub async fn webrtc_ice(&self, params: &Params) -> Result<Outcome, AgentError> {
        let candidate = req_str(params, "candidate")?;
        let sdp_mid = opt_str(params, "sdpMid").unwrap_or_default();
        let sdp_mline_index = opt_i64(params, "sdpMLineIndex", 0);
        if !self.streaming.is_active().await {
            return Err(AgentError::platform("No active stream"));
        }
        self.streaming
            .handle_ice(candidate, sdp_mid, sdp_mline_index)
            .await?;
        Ok(Outcome::Success(json!("ICE Candidate processed")))
    }
}

/// Extract, trim, and validate the `urls` param. Used by the dispatcher to
/// reject bad installs synchronously before touching the worker queue.
pub fn install_urls(params: &Params) -> Result<Vec<String>, AgentError> {
    let urls: Vec<String> = params
        .get("urls")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if urls.is_empty() {
        return Err(AgentError::protocol("Missing required param: 'urls'"));
    }
    Ok(urls)
}

fn opt_i64(params: &Params, key: &str, default: i64) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn opt_bool(params: &Params, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn opt_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn req_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, AgentError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::protocol(format!("Missing required param: '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn install_urls_requires_non_empty_entries() {
        let err = install_urls(&params(json!({"urls": []}))).unwrap_err();
        assert_eq!(err.to_string(), "Missing required param: 'urls'");
        let err = install_urls(&params(json!({"urls": ["  ", ""]}))).unwrap_err();
        assert_eq!(err.to_string(), "Missing required param: 'urls'");
        let urls = install_urls(&params(json!({"urls": [" https://a/1.pkg "]}))).unwrap();
        assert_eq!(urls, vec!["https://a/1.pkg".to_string()]);
    }

    #[test]
    fn req_str_rejects_missing_and_empty() {
        let p = params(json!({"sdp": ""}));
        assert!(req_str(&p, "sdp").is_err());
        assert!(req_str(&p, "sessionId").is_err());
        let p = params(json!({"sdp": "v=0"}));
        assert_eq!(req_str(&p, "sdp").unwrap(), "v=0");
    }

    #[test]
    fn opt_helpers_fall_back_to_defaults() {
        let p = params(json!({"x": 100, "flag": true}));
        assert_eq!(opt_i64(&p, "x", 0), 100);
        assert_eq!(opt_i64(&p, "y", 7), 7);
        assert!(opt_bool(&p, "flag", false));
        assert!(!opt_bool(&p, "other", false));
    }
}
