//! Collaborator interfaces consumed by the core.
//!
//! The dispatcher, handlers, and install pipeline only ever talk to the
//! platform through these traits; concrete adapters live in `platform/`.
//! Constructors receive the trait objects explicitly so nothing reaches for
//! ambient global state.

use std::io;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tether_common::AgentError;

/// Sender for text frames on whichever channel carried a command. Deferred
/// responses (install results) and push signaling go out through this.
pub type OutboundSender = mpsc::Sender<String>;

/// UI/accessibility tree and phone-state extraction.
#[async_trait]
pub trait UiState: Send + Sync {
    async fn visible_elements(&self) -> Result<Value, AgentError>;
    /// `None` when there is no active window or the root was filtered out.
    async fn full_tree(&self, filter: bool) -> Result<Option<Value>, AgentError>;
    async fn phone_state(&self) -> Result<Value, AgentError>;
    async fn device_context(&self) -> Result<Value, AgentError>;
    async fn list_packages(&self) -> Result<Value, AgentError>;
    /// Base64-encoded capture.
    async fn screenshot(&self, hide_overlay: bool) -> Result<String, AgentError>;
}

/// Gesture/keystroke execution primitives.
#[async_trait]
pub trait Gestures: Send + Sync {
    async fn tap(&self, x: i64, y: i64) -> bool;
    async fn swipe(
        &self,
        start_x: i64,
        start_y: i64,
        end_x: i64,
        end_y: i64,
        duration_ms: i64,
    ) -> bool;
    async fn global_action(&self, action: i64) -> bool;
}

/// Text-input service with an availability/selection check.
#[async_trait]
pub trait TextInput: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn input_text(&self, text: &str, clear: bool) -> bool;
    async fn clear_text(&self) -> bool;
    async fn send_key(&self, key_code: i64) -> bool;
}

/// Parameters for `stream/start`, already clamped by the handler.
#[derive(Debug, Clone)]
pub struct StreamStartRequest {
    pub width: i64,
    pub height: i64,
    pub fps: i64,
    pub session_id: Option<String>,
    pub wait_for_offer: bool,
    pub ice_servers: Option<Value>,
}

/// Screen-stream session manager. Signaling payloads are opaque here; only
/// routing and lifecycle are the agent's business.
#[async_trait]
pub trait StreamingControl: Send + Sync {
    async fn start(&self, request: StreamStartRequest) -> Result<String, AgentError>;
    async fn stop(&self, graceful: bool) -> Result<String, AgentError>;
    async fn is_active(&self) -> bool;
    async fn handle_offer(&self, sdp: &str, session_id: &str) -> Result<(), AgentError>;
    async fn handle_answer(&self, sdp: &str) -> Result<(), AgentError>;
    async fn handle_ice(
        &self,
        candidate: &str,
        sdp_mid: &str,
        sdp_mline_index: i64,
    ) -> Result<(), AgentError>;
    /// The reverse link is up; signaling may flow through `outbound`.
    async fn transport_available(&self, outbound: OutboundSender);
    /// The reverse link dropped; the stream should wind down.
    async fn transport_lost(&self, reason: &str);
}

/// Platform notification, overlay, foregrounding, and app-launch surface.
#[async_trait]
pub trait DeviceUi: Send + Sync {
    async fn overlay_visible(&self) -> bool;
    async fn set_overlay_visible(&self, visible: bool) -> bool;
    async fn set_overlay_offset(&self, offset: i64) -> bool;
    async fn is_app_foreground(&self) -> bool;
    /// The platform only surfaces its install confirmation UI when the
    /// controlling app is frontmost.
    async fn bring_app_foreground(&self);
    async fn show_toast(&self, text: &str);
    async fn show_notification(&self, title: &str, text: &str);
    /// Guide the user to the unknown-sources install permission.
    async fn show_install_permission_help(&self);
    async fn start_app(&self, package: &str, activity: Option<&str>) -> Result<String, AgentError>;
    async fn wake_screen(&self) -> Result<String, AgentError>;
    /// Structured out-of-band install result (in addition to the envelope).
    async fn broadcast_install_result(&self, result: &InstallResult);
}

/// Final outcome of one install transaction.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub success: bool,
    pub message: String,
    pub package: Option<String>,
    pub status_code: Option<i64>,
}

/// Signals from a committed transaction. The platform's completion callback
/// is adapted into this channel at the boundary; the pipeline owns the
/// receiving end for the lifetime of one invocation.
#[derive(Debug)]
pub enum InstallEvent {
    /// The platform wants user confirmation. May repeat on duplicate
    /// notifications; the pipeline launches the prompt once.
    AwaitingConfirmation,
    Finished(InstallResult),
}

/// Platform install-transaction service.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    fn can_request_installs(&self) -> bool;
    fn available_bytes(&self) -> Option<u64>;
    async fn create_session(&self) -> Result<Box<dyn InstallSession>, AgentError>;
    /// Present the platform confirmation UI for a committed session.
    async fn launch_confirmation(&self, session_id: &str) -> Result<(), AgentError>;
}

/// One open install transaction: parts are opened, written, and finished in
/// order, then the whole transaction is committed or abandoned.
#[async_trait]
pub trait InstallSession: Send {
    fn id(&self) -> &str;
    async fn open_part(&mut self, name: &str, declared_len: Option<u64>) -> io::Result<()>;
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
    /// Close the current part, returning the bytes written to it.
    async fn finish_part(&mut self) -> io::Result<u64>;
    async fn abandon(self: Box<Self>);
    /// Commit and subscribe to completion. Dropping the receiver
    /// unregisters the subscription.
    async fn commit(self: Box<Self>) -> Result<mpsc::Receiver<InstallEvent>, AgentError>;
}
