//! Reverse connection to the controller.
//!
//! One supervisor task owns the outbound WebSocket for its whole lifecycle:
//! connect with identifying headers, serve the read loop, classify the end
//! of the session, and schedule at most one reconnect per disconnect.
//! Authentication rejections (401) and device-limit rejections (400) are
//! terminal: the machine parks until the user reconfigures and re-arms it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use tether_common::protocol::{parse_line, snippet, Inbound};
use tether_common::{ConnectionState, Origin};

use crate::dispatcher::{Dispatched, Dispatcher};
use crate::services::{DeviceUi, OutboundSender, StreamingControl};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TOAST_DEBOUNCE: Duration = Duration::from_secs(60);
const DNS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const OUTBOUND_QUEUE: usize = 64;

/// Identity and credentials presented to the controller.
#[derive(Debug, Clone, Default)]
pub struct ReverseConfig {
    /// May contain a `{deviceId}` placeholder.
    pub url_template: String,
    pub token: String,
    pub user_id: String,
    pub service_key: String,
    pub device_id: String,
    pub device_name: String,
    pub device_locale: String,
}

/// Why a connect/serve cycle ended.
enum SessionEnd {
    /// User disconnect; halt without rescheduling.
    Stopped,
    /// Terminal rejection; park in the given state.
    Terminal(ConnectionState),
    /// Transient loss; schedule a reconnect.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseClass {
    Transient,
    Unauthorized,
    LimitExceeded,
}

/// A close reason mentioning an auth failure or a client error suspends
/// reconnection; anything else is treated as transient.
fn classify_close(reason: &str) -> CloseClass {
    if reason.contains("401") || reason.contains("Unauthorized") {
        CloseClass::Unauthorized
    } else if reason.contains("400") || reason.contains("Bad Request") {
        CloseClass::LimitExceeded
    } else {
        CloseClass::Transient
    }
}

/// Guard ensuring at most one pending reconnect timer per disconnect event.
struct ReconnectGate(AtomicBool);

impl ReconnectGate {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns false when a timer is already pending.
    fn arm(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    fn disarm(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReverseLink {
    cfg: ReverseConfig,
    dispatcher: Arc<Dispatcher>,
    streaming: Arc<dyn StreamingControl>,
    ui: Arc<dyn DeviceUi>,
    state_tx: watch::Sender<ConnectionState>,
    running: AtomicBool,
    reconnect: ReconnectGate,
    stop: Notify,
    last_toast: StdMutex<Option<Instant>>,
}

impl ReverseLink {
    pub fn new(
        cfg: ReverseConfig,
        dispatcher: Arc<Dispatcher>,
        streaming: Arc<dyn StreamingControl>,
        ui: Arc<dyn DeviceUi>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            cfg,
            dispatcher,
            streaming,
            ui,
            state_tx,
            running: AtomicBool::new(false),
            reconnect: ReconnectGate::new(),
            stop: Notify::new(),
            last_toast: StdMutex::new(None),
        })
    }

    /// Read-only view of the link state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Arm the machine and start its supervisor task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let link = Arc::clone(self);
        tokio::spawn(async move { link.run().await })
    }

    /// User-initiated disconnect: cancels any pending reconnect timer,
    /// closes the socket, and halts the loop until `spawn` is called again.
    pub fn disconnect(&self) {
        info!("user disconnect requested");
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(state = %state, "connection state");
        self.state_tx.send_replace(state);
    }

    async fn run(self: Arc<Self>) {
        if self.cfg.url_template.trim().is_empty() {
            warn!("no controller URL configured; reverse link idle");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        while self.running() {
            self.set_state(ConnectionState::Connecting);
            match self.connect_and_serve().await {
                SessionEnd::Stopped => {
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                SessionEnd::Terminal(state) => {
                    warn!(state = %state, "controller rejected connection; waiting for user action");
                    self.set_state(state);
                    break;
                }
                SessionEnd::Lost => {
                    self.set_state(ConnectionState::Disconnected);
                    if !self.wait_reconnect().await {
                        self.set_state(ConnectionState::Disconnected);
                        break;
                    }
                }
            }
        }
    }

    /// One connect + serve cycle. Never panics through; every failure is
    /// converted into a `SessionEnd`.
    async fn connect_and_serve(&self) -> SessionEnd {
        let url = self
            .cfg
            .url_template
            .replace("{deviceId}", &self.cfg.device_id);

        let request = match build_request(&self.cfg, &url) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, url = %url, "controller URL or headers are unusable");
                return SessionEnd::Terminal(ConnectionState::Error);
            }
        };

        let (stream, response) = match timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Err(_) => {
                warn!(url = %url, "controller connect timed out");
                self.log_connectivity(&url, "connect_timeout").await;
                return SessionEnd::Lost;
            }
            Ok(Err(WsError::Http(response))) => {
                let status = response.status();
                warn!(status = status.as_u16(), "controller rejected handshake");
                return match status.as_u16() {
                    401 => SessionEnd::Terminal(ConnectionState::Unauthorized),
                    400 => SessionEnd::Terminal(ConnectionState::LimitExceeded),
                    _ => SessionEnd::Lost,
                };
            }
            Ok(Err(err)) => {
                warn!(error = %err, url = %url, "controller connect failed");
                self.log_connectivity(&url, "connect_error").await;
                return SessionEnd::Lost;
            }
            Ok(Ok(ok)) => ok,
        };

        info!(status = response.status().as_u16(), "connected to controller");
        self.set_state(ConnectionState::Connected);
        self.show_connected_toast().await;

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(line.into())).await {
                    warn!(error = %err, "controller write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Let a previously negotiated stream resume its signaling.
        self.streaming.transport_available(out_tx.clone()).await;

        let end = loop {
            tokio::select! {
                _ = self.stop.notified() => break SessionEnd::Stopped,
                frame = source.next() => match frame {
                    None => {
                        warn!("controller connection closed");
                        break SessionEnd::Lost;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "controller read failed");
                        self.log_connectivity(&url, "read_error").await;
                        break SessionEnd::Lost;
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.handle_line(text.as_str(), &out_tx).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .as_ref()
                            .map(|f| f.reason.to_string())
                            .unwrap_or_default();
                        warn!(reason = %reason, "controller closed connection");
                        self.log_connectivity(&url, "close").await;
                        break match classify_close(&reason) {
                            CloseClass::Unauthorized => {
                                SessionEnd::Terminal(ConnectionState::Unauthorized)
                            }
                            CloseClass::LimitExceeded => {
                                SessionEnd::Terminal(ConnectionState::LimitExceeded)
                            }
                            CloseClass::Transient => SessionEnd::Lost,
                        };
                    }
                    // Pings are answered by the websocket layer itself.
                    Some(Ok(_)) => {}
                }
            }
        };

        drop(out_tx);
        writer.abort();
        let reason = match end {
            SessionEnd::Stopped => "user_disconnect",
            _ => "link_lost",
        };
        self.streaming.transport_lost(reason).await;
        end
    }

    async fn handle_line(&self, line: &str, out: &OutboundSender) {
        debug!(msg = %snippet(line, 200), "received message");
        match parse_line(line) {
            Inbound::Reply { id, error: None } => {
                debug!(id = ?id, "received result for an outgoing message");
            }
            Inbound::Reply {
                id,
                error: Some(error),
            } => {
                warn!(id = ?id, error = %error, "received error for an outgoing message");
            }
            Inbound::Malformed(reason) => {
                warn!(reason = %reason, "ignoring inbound message");
            }
            Inbound::Command(cmd) => {
                match self
                    .dispatcher
                    .dispatch(cmd, Origin::ReverseSocket, out)
                    .await
                {
                    Dispatched::Ready(envelope) => {
                        if out.send(envelope.to_line()).await.is_err() {
                            warn!("response dropped; connection writer is gone");
                        }
                    }
                    Dispatched::Deferred => {}
                }
            }
        }
    }

    /// Schedule one reconnect after the fixed delay. Returns false when the
    /// machine should halt instead of reconnecting.
    async fn wait_reconnect(&self) -> bool {
        if !self.running() {
            return false;
        }
        if !self.reconnect.arm() {
            return false;
        }
        self.set_state(ConnectionState::Reconnecting);
        debug!(delay = ?RECONNECT_DELAY, "scheduling reconnect");
        let proceed = tokio::select! {
            _ = sleep(RECONNECT_DELAY) => self.running(),
            _ = self.stop.notified() => false,
        };
        self.reconnect.disarm();
        proceed
    }

    async fn show_connected_toast(&self) {
        let fire = {
            let Ok(mut last) = self.last_toast.lock() else {
                return;
            };
            match *last {
                Some(at) if at.elapsed() < TOAST_DEBOUNCE => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if fire {
            self.ui.show_toast("Connected to controller").await;
        }
    }

    /// Best-effort diagnostics on failure: a DNS probe of the controller
    /// host tells resolution problems apart from path problems.
    async fn log_connectivity(&self, url: &str, context: &str) {
        let Some((host, port)) = endpoint_of(url) else {
            debug!(context, "connectivity: controller endpoint unparseable");
            return;
        };
        match timeout(DNS_PROBE_TIMEOUT, tokio::net::lookup_host((host.as_str(), port))).await {
            Ok(Ok(addrs)) => {
                debug!(context, host = %host, resolved = addrs.count(), "connectivity probe");
            }
            Ok(Err(err)) => {
                debug!(context, host = %host, error = %err, "connectivity: dns lookup failed");
            }
            Err(_) => {
                debug!(context, host = %host, "connectivity: dns probe timed out");
            }
        };
    }
}

/// Build the handshake request with identifying headers. Blank optional
/// credentials are omitted entirely.
fn build_request(cfg: &ReverseConfig, url: &str) -> anyhow::Result<Request> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    if !cfg.token.trim().is_empty() {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", cfg.token))?,
        );
    }
    if !cfg.user_id.trim().is_empty() {
        headers.insert("X-User-ID", HeaderValue::from_str(&cfg.user_id)?);
    }
    headers.insert("X-Device-ID", HeaderValue::from_str(&cfg.device_id)?);
    headers.insert("X-Device-Name", HeaderValue::from_str(&cfg.device_name)?);
    headers.insert("X-Device-Locale", HeaderValue::from_str(&cfg.device_locale)?);
    if !cfg.service_key.trim().is_empty() {
        headers.insert(
            "X-Remote-Device-Key",
            HeaderValue::from_str(&cfg.service_key)?,
        );
    }
    Ok(request)
}

/// Host and port of a ws/wss/http/https URL, with scheme-default ports.
fn endpoint_of(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    let default_port = match scheme {
        "wss" | "https" => 443,
        _ => 80,
    };
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = authority.rfind(']') {
        let host = authority[..=end].to_string();
        let port = authority[end + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(default_port);
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_markers_suspend_reconnection() {
        assert_eq!(classify_close("401"), CloseClass::Unauthorized);
        assert_eq!(
            classify_close("Unauthorized: bad token"),
            CloseClass::Unauthorized
        );
        assert_eq!(classify_close("HTTP 401 Unauthorized"), CloseClass::Unauthorized);
    }

    #[test]
    fn client_error_markers_mean_limit_exceeded() {
        assert_eq!(classify_close("400"), CloseClass::LimitExceeded);
        assert_eq!(
            classify_close("Bad Request: device limit reached"),
            CloseClass::LimitExceeded
        );
    }

    #[test]
    fn other_close_reasons_are_transient() {
        assert_eq!(classify_close(""), CloseClass::Transient);
        assert_eq!(classify_close("going away"), CloseClass::Transient);
        assert_eq!(classify_close("1006 abnormal closure"), CloseClass::Transient);
    }

    #[test]
    fn reconnect_gate_arms_once() {
        let gate = ReconnectGate::new();
        assert!(gate.arm());
        assert!(!gate.arm(), "second arm while pending must be a no-op");
        gate.disarm();
        assert!(gate.arm(), "re-arms after the timer fired");
    }

    #[test]
    fn request_carries_identity_headers() {
        let cfg = ReverseConfig {
            url_template: String::new(),
            token: "tok-1".to_string(),
            user_id: "user-9".to_string(),
            service_key: String::new(),
            device_id: "dev-5".to_string(),
            device_name: "Bench Phone".to_string(),
            device_locale: "en-US".to_string(),
        };
        let request = build_request(&cfg, "wss://ctl.example.com/device/dev-5").unwrap();
        let headers = request.headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok-1");
        assert_eq!(headers.get("X-User-ID").unwrap(), "user-9");
        assert_eq!(headers.get("X-Device-ID").unwrap(), "dev-5");
        assert_eq!(headers.get("X-Device-Name").unwrap(), "Bench Phone");
        assert_eq!(headers.get("X-Device-Locale").unwrap(), "en-US");
        assert!(headers.get("X-Remote-Device-Key").is_none());
    }

    #[test]
    fn blank_token_is_omitted() {
        let cfg = ReverseConfig {
            device_id: "d".to_string(),
            device_name: "n".to_string(),
            device_locale: "l".to_string(),
            ..Default::default()
        };
        let request = build_request(&cfg, "ws://ctl.example.com/ws").unwrap();
        assert!(request.headers().get("Authorization").is_none());
        assert!(request.headers().get("X-User-ID").is_none());
    }

    #[test]
    fn device_placeholder_is_substituted() {
        let template = "wss://ctl.example.com/device/{deviceId}/ws";
        let url = template.replace("{deviceId}", "dev-5");
        assert_eq!(url, "wss://ctl.example.com/device/dev-5/ws");
    }

    #[test]
    fn endpoint_parsing_handles_ports_and_defaults() {
        assert_eq!(
            endpoint_of("wss://ctl.example.com/device/1"),
            Some(("ctl.example.com".to_string(), 443))
        );
        assert_eq!(
            endpoint_of("ws://127.0.0.1:9000/ws?x=1"),
            Some(("127.0.0.1".to_string(), 9000))
        );
        assert_eq!(
            endpoint_of("ws://[::1]:9000/ws"),
            Some(("[::1]".to_string(), 9000))
        );
        assert_eq!(endpoint_of("not a url"), None);
    }
}
