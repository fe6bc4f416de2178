//! Command dispatcher.
//!
//! Normalizes a method name, applies origin-based capability checks, and
//! invokes the matching handler. Installs are never executed on the calling
//! task: they go to a dedicated single-worker queue and their envelope is
//! delivered out-of-band through the originating channel's sender, keyed by
//! the correlation id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_common::{AgentError, Command, Origin, Outcome, ResponseEnvelope};

use crate::handlers::{install_urls, Handlers};
use crate::services::OutboundSender;

const INSTALL_QUEUE_DEPTH: usize = 8;

/// Result of one dispatch call.
pub enum Dispatched {
    Ready(ResponseEnvelope),
    /// Accepted for asynchronous execution; the envelope arrives later on
    /// the channel's outbound sender.
    Deferred,
}

struct InstallJob {
    cmd: Command,
    out: OutboundSender,
}

pub struct Dispatcher {
    handlers: Arc<Handlers>,
    install_tx: mpsc::Sender<InstallJob>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<Handlers>) -> Arc<Self> {
        let (install_tx, install_rx) = mpsc::channel(INSTALL_QUEUE_DEPTH);
        let dispatcher = Arc::new(Self {
            handlers,
            install_tx,
        });
        tokio::spawn(install_worker(
            Arc::clone(&dispatcher.handlers),
            install_rx,
        ));
        dispatcher
    }

    pub async fn dispatch(&self, cmd: Command, origin: Origin, out: &OutboundSender) -> Dispatched {
        let method = normalize(&cmd.method).to_string();
        debug!(method = %method, origin = origin.as_str(), "dispatching command");

        if let Err(message) = check_origin(&method, origin) {
            return Dispatched::Ready(ResponseEnvelope::error(cmd.id, message));
        }

        if method == "install" {
            // Cheap validation happens synchronously; download + commit run
            // on the worker so the connection's read path never stalls.
            if let Err(err) = install_urls(&cmd.params) {
                return Dispatched::Ready(ResponseEnvelope::error(cmd.id, err.to_string()));
            }
            let job = InstallJob {
                cmd,
                out: out.clone(),
            };
            if let Err(send_err) = self.install_tx.send(job).await {
                let job = send_err.0;
                return Dispatched::Ready(ResponseEnvelope::error(
                    job.cmd.id,
                    "Install worker is not available",
                ));
            }
            return Dispatched::Deferred;
        }

        let id = cmd.id.clone();
        let result = AssertUnwindSafe(self.execute(&method, &cmd, origin))
            .catch_unwind()
            .await;
        let envelope = match result {
            Ok(Ok(outcome)) => ResponseEnvelope { id, outcome },
            Ok(Err(err)) => ResponseEnvelope::error(id, err.to_string()),
            Err(_) => {
                warn!(method = %method, "handler panicked");
                ResponseEnvelope::error(id, format!("Internal error in handler: {method}"))
            }
        };
        Dispatched::Ready(envelope)
    }

    async fn execute(
        &self,
        method: &str,
        cmd: &Command,
        origin: Origin,
    ) -> Result<Outcome, AgentError> {
        let params = &cmd.params;
        let h = &self.handlers;
        match method {
            "ping" => h.ping().await,
            "tap" => h.tap(params).await,
            "swipe" => h.swipe(params).await,
            "global" => h.global_action(params).await,
            "app" => h.start_app(params).await,
            "keyboard/input" | "input" => h.keyboard_input(params).await,
            "keyboard/clear" | "clear" => h.keyboard_clear().await,
            "keyboard/key" | "key" => h.keyboard_key(params).await,
            "overlay_offset" => h.overlay_offset(params).await,
            "socket_port" => h.socket_port(params).await,
            "screenshot" => h.screenshot(params).await,
            "packages" => h.packages().await,
            "state" => h.state(params).await,
            "version" => h.version().await,
            "time" => h.time().await,
            "wake" | "screen/wake" => h.wake().await,
            "stream/start" => h.stream_start(params).await,
            "stream/stop" => h.stream_stop(origin == Origin::ReverseSocket).await,
            "webrtc/answer" => h.webrtc_answer(params).await,
            "webrtc/offer" => h.webrtc_offer(params).await,
            "webrtc/ice" => h.webrtc_ice(params).await,
            _ => Err(AgentError::protocol(format!("Unknown method: {method}"))),
        }
    }
}

async fn install_worker(handlers: Arc<Handlers>, mut rx: mpsc::Receiver<InstallJob>) {
    while let Some(job) = rx.recv().await {
        let id = job.cmd.id.clone();
        let params = job.cmd.params.clone();
        let handlers = Arc::clone(&handlers);
        // A task of its own so a panic cannot take the queue down with it.
        let outcome = tokio::spawn(async move { handlers.install(&params).await }).await;
        let envelope = match outcome {
            Ok(Ok(outcome)) => ResponseEnvelope { id, outcome },
            Ok(Err(err)) => ResponseEnvelope::error(id, err.to_string()),
            Err(join_err) => {
                warn!(error = %join_err, "install task failed");
                ResponseEnvelope::error(id, "Install task failed")
            }
        };
        if job.out.send(envelope.to_line()).await.is_err() {
            warn!("install response dropped; originating channel is gone");
        }
    }
}

/// "/action/tap", "action.tap", and "tap" name the same method.
fn normalize(method: &str) -> &str {
    let method = method.strip_prefix("/action/").unwrap_or(method);
    let method = method.strip_prefix("action.").unwrap_or(method);
    method.strip_prefix('/').unwrap_or(method)
}

fn check_origin(method: &str, origin: Origin) -> Result<(), String> {
    match method {
        "install" if !origin.is_socket() => {
            Err("Install is only supported over socket connections".to_string())
        }
        "stream/start" if origin != Origin::ReverseSocket => {
            Err("Streaming requires reverse connection".to_string())
        }
        "stream/stop" if !origin.is_socket() => {
            Err("Streaming requires a socket connection".to_string())
        }
        "webrtc/answer" | "webrtc/offer" | "webrtc/ice" if origin != Origin::ReverseSocket => {
            Err("WebRTC signaling requires reverse connection".to_string())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::dispatcher_fixture;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn fixture() -> (Arc<Dispatcher>, Arc<crate::testutil::StubPlatform>, OutboundSender) {
        let (dispatcher, platform) = dispatcher_fixture();
        let (out_tx, _out_rx) = mpsc::channel(8);
        (dispatcher, platform, out_tx)
    }

    fn command(id: Value, method: &str, params: Value) -> Command {
        Command {
            id: if id.is_null() { None } else { Some(id) },
            method: method.to_string(),
            params: params.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    async fn ready(
        dispatcher: &Dispatcher,
        cmd: Command,
        origin: Origin,
        out: &OutboundSender,
    ) -> ResponseEnvelope {
        match dispatcher.dispatch(cmd, origin, out).await {
            Dispatched::Ready(envelope) => envelope,
            Dispatched::Deferred => panic!("expected a synchronous envelope"),
        }
    }

    #[tokio::test]
    async fn tap_round_trip_matches_wire_format() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(json!(1), "tap", json!({"x": 100, "y": 200}));
        let envelope = ready(&dispatcher, cmd, Origin::ReverseSocket, &out).await;
        assert_eq!(
            envelope.to_value(),
            json!({"id": 1, "status": "success", "result": "Tap performed at (100, 200)"})
        );
    }

    #[tokio::test]
    async fn prefixed_method_names_are_equivalent() {
        let (dispatcher, _platform, out) = fixture();
        for method in ["/action/tap", "action.tap", "tap", "/tap"] {
            let cmd = command(json!(1), method, json!({"x": 1, "y": 2}));
            let envelope = ready(&dispatcher, cmd, Origin::LocalSocket, &out).await;
            assert!(envelope.is_success(), "method {method} failed");
        }
    }

    #[tokio::test]
    async fn unknown_method_names_the_method() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(Value::Null, "foo", json!({}));
        let envelope = ready(&dispatcher, cmd, Origin::ReverseSocket, &out).await;
        assert_eq!(
            envelope.to_value(),
            json!({"status": "error", "error": "Unknown method: foo"})
        );
    }

    #[tokio::test]
    async fn string_ids_are_echoed_verbatim() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(json!("req-77"), "version", json!({}));
        let envelope = ready(&dispatcher, cmd, Origin::Http, &out).await;
        assert_eq!(envelope.to_value()["id"], json!("req-77"));
    }

    #[tokio::test]
    async fn install_is_refused_over_http() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(
            json!(5),
            "install",
            json!({"urls": ["https://a/1.pkg"]}),
        );
        let envelope = ready(&dispatcher, cmd, Origin::Http, &out).await;
        assert!(!envelope.is_success());
        assert_eq!(envelope.to_value()["id"], json!(5));
    }

    #[tokio::test]
    async fn install_without_urls_fails_synchronously() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(json!(6), "install", json!({}));
        let envelope = ready(&dispatcher, cmd, Origin::ReverseSocket, &out).await;
        assert_eq!(
            envelope.to_value()["error"],
            json!("Missing required param: 'urls'")
        );
    }

    #[tokio::test]
    async fn install_envelope_is_delivered_out_of_band() {
        let (dispatcher, _platform, _unused) = fixture();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cmd = command(
            json!("install-1"),
            "install",
            json!({"urls": ["https://a/1.pkg"]}),
        );
        match dispatcher.dispatch(cmd, Origin::ReverseSocket, &out_tx).await {
            Dispatched::Deferred => {}
            Dispatched::Ready(envelope) => {
                panic!("expected deferred install, got {:?}", envelope.to_value())
            }
        }
        let line = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .expect("install envelope within deadline")
            .expect("channel open");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], json!("install-1"));
        assert_eq!(value["status"], json!("error"));
        assert!(value["error"]
            .as_str()
            .unwrap()
            .contains("Install permission denied"));
    }

    #[tokio::test]
    async fn streaming_requires_reverse_origin() {
        let (dispatcher, _platform, out) = fixture();
        let cmd = command(json!(9), "stream/start", json!({}));
        let envelope = ready(&dispatcher, cmd, Origin::LocalSocket, &out).await;
        let error = envelope.to_value()["error"].as_str().unwrap().to_string();
        assert!(error.contains("requires reverse connection"), "{error}");

        for method in ["webrtc/answer", "webrtc/offer", "webrtc/ice"] {
            let cmd = command(json!(9), method, json!({"sdp": "v=0"}));
            let envelope = ready(&dispatcher, cmd, Origin::LocalSocket, &out).await;
            assert!(!envelope.is_success(), "{method} must be gated");
        }
    }

    #[tokio::test]
    async fn stream_stop_gracefulness_depends_on_origin() {
        let (dispatcher, platform, out) = fixture();
        let cmd = command(json!(1), "stream/stop", json!({}));
        ready(&dispatcher, cmd, Origin::ReverseSocket, &out).await;
        let cmd = command(json!(2), "stream/stop", json!({}));
        ready(&dispatcher, cmd, Origin::LocalSocket, &out).await;
        let cmd = command(json!(3), "stream/stop", json!({}));
        let envelope = ready(&dispatcher, cmd, Origin::Http, &out).await;
        assert!(!envelope.is_success(), "HTTP may not stop streams");

        let log = platform.log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                "stream stop graceful=true".to_string(),
                "stream stop graceful=false".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn non_install_commands_answer_in_order() {
        let (dispatcher, _platform, out) = fixture();
        let mut ids = Vec::new();
        for i in 0..5 {
            let cmd = command(json!(i), "time", json!({}));
            let envelope = ready(&dispatcher, cmd, Origin::ReverseSocket, &out).await;
            ids.push(envelope.to_value()["id"].as_i64().unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
