//! Shared fakes for channel and dispatcher tests.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use tether_common::AgentError;

use crate::dispatcher::Dispatcher;
use crate::handlers::Handlers;
use crate::install::InstallPipeline;
use crate::services::{
    DeviceUi, Gestures, InstallResult, InstallSession, OutboundSender, PackageInstaller,
    StreamStartRequest, StreamingControl, TextInput, UiState,
};

/// One stub standing in for every collaborator; records interesting calls.
#[derive(Default)]
pub struct StubPlatform {
    pub log: StdMutex<Vec<String>>,
}

impl StubPlatform {
    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[async_trait]
impl UiState for StubPlatform {
    async fn visible_elements(&self) -> Result<Value, AgentError> {
        Ok(json!([]))
    }
    async fn full_tree(&self, _filter: bool) -> Result<Option<Value>, AgentError> {
        Ok(Some(json!({"node": "root"})))
    }
    async fn phone_state(&self) -> Result<Value, AgentError> {
        Ok(json!({"keyboardVisible": false}))
    }
    async fn device_context(&self) -> Result<Value, AgentError> {
        Ok(json!({"locale": "en-US"}))
    }
    async fn list_packages(&self) -> Result<Value, AgentError> {
        Ok(json!([{"packageName": "com.example.app"}]))
    }
    async fn screenshot(&self, _hide_overlay: bool) -> Result<String, AgentError> {
        Ok("aGVsbG8=".to_string())
    }
}

#[async_trait]
impl Gestures for StubPlatform {
    async fn tap(&self, x: i64, y: i64) -> bool {
        self.record(format!("tap {x},{y}"));
        true
    }
    async fn swipe(&self, _: i64, _: i64, _: i64, _: i64, _: i64) -> bool {
        true
    }
    async fn global_action(&self, _: i64) -> bool {
        true
    }
}

#[async_trait]
impl TextInput for StubPlatform {
    async fn is_available(&self) -> bool {
        true
    }
    async fn input_text(&self, text: &str, clear: bool) -> bool {
        self.record(format!("input {text} clear={clear}"));
        true
    }
    async fn clear_text(&self) -> bool {
        true
    }
    async fn send_key(&self, _: i64) -> bool {
        true
    }
}

#[async_trait]
impl StreamingControl for StubPlatform {
    async fn start(&self, _request: StreamStartRequest) -> Result<String, AgentError> {
        self.record("stream start");
        Ok("prompting_user".to_string())
    }
    async fn stop(&self, graceful: bool) -> Result<String, AgentError> {
        self.record(format!("stream stop graceful={graceful}"));
        Ok("stopped".to_string())
    }
    async fn is_active(&self) -> bool {
        true
    }
    async fn handle_offer(&self, _: &str, _: &str) -> Result<(), AgentError> {
        Ok(())
    }
    async fn handle_answer(&self, _: &str) -> Result<(), AgentError> {
        Ok(())
    }
    async fn handle_ice(&self, _: &str, _: &str, _: i64) -> Result<(), AgentError> {
        Ok(())
    }
    async fn transport_available(&self, _outbound: OutboundSender) {}
    async fn transport_lost(&self, _reason: &str) {}
}

#[async_trait]
impl DeviceUi for StubPlatform {
    async fn overlay_visible(&self) -> bool {
        false
    }
    async fn set_overlay_visible(&self, _: bool) -> bool {
        true
    }
    async fn set_overlay_offset(&self, _: i64) -> bool {
        true
    }
    async fn is_app_foreground(&self) -> bool {
        true
    }
    async fn bring_app_foreground(&self) {}
    async fn show_toast(&self, _: &str) {}
    async fn show_notification(&self, _: &str, _: &str) {}
    async fn show_install_permission_help(&self) {
        self.record("permission help");
    }
    async fn start_app(&self, package: &str, _: Option<&str>) -> Result<String, AgentError> {
        Ok(format!("Started app {package}"))
    }
    async fn wake_screen(&self) -> Result<String, AgentError> {
        Ok("Screen woken up".to_string())
    }
    async fn broadcast_install_result(&self, _: &InstallResult) {}
}

/// Installer whose permission is withheld, so deferred installs resolve
/// quickly with a permission error and no network traffic.
pub struct DeniedInstaller;

#[async_trait]
impl PackageInstaller for DeniedInstaller {
    fn can_request_installs(&self) -> bool {
        false
    }
    fn available_bytes(&self) -> Option<u64> {
        None
    }
    async fn create_session(&self) -> Result<Box<dyn InstallSession>, AgentError> {
        Err(AgentError::platform("unused"))
    }
    async fn launch_confirmation(&self, _: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

/// A dispatcher wired entirely to stubs.
pub fn dispatcher_fixture() -> (Arc<Dispatcher>, Arc<StubPlatform>) {
    let platform = Arc::new(StubPlatform::default());
    let pipeline =
        Arc::new(InstallPipeline::new(Arc::new(DeniedInstaller), platform.clone()).unwrap());
    let (port_tx, _port_rx) = watch::channel(8722u16);
    let handlers = Arc::new(Handlers::new(
        platform.clone(),
        platform.clone(),
        platform.clone(),
        platform.clone(),
        platform.clone(),
        pipeline,
        "0.1.0",
        port_tx,
    ));
    (Dispatcher::new(handlers), platform)
}
