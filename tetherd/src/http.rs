//! HTTP channel.
//!
//! A thin front over the same dispatcher: `POST /command` takes a full
//! command object, `POST /action/{method}` takes the params as its body.
//! Everything dispatches with origin Http, so installs and streaming are
//! refused here by the origin policy rather than by this module.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use tether_common::{Command, Origin, ResponseEnvelope};

use crate::dispatcher::{Dispatched, Dispatcher};

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/command", post(post_command))
        .route("/action/:method", post(post_action))
        .with_state(dispatcher)
}

async fn post_command(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let envelope = match to_command(&body) {
        Ok(cmd) => dispatch(&dispatcher, cmd).await,
        Err(message) => {
            let id = body.get("id").filter(|v| !v.is_null()).cloned();
            ResponseEnvelope::error(id, message)
        }
    };
    Json(envelope.to_value())
}

async fn post_action(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(method): Path<String>,
    Json(params): Json<Value>,
) -> Json<Value> {
    let cmd = Command {
        id: None,
        method,
        params: params.as_object().cloned().unwrap_or_default(),
    };
    Json(dispatch(&dispatcher, cmd).await.to_value())
}

fn to_command(body: &Value) -> Result<Command, String> {
    let obj = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| "missing method".to_string())?;
    let params = match obj.get("params") {
        Some(Value::Object(params)) => params.clone(),
        _ => Map::new(),
    };
    Ok(Command {
        id: obj.get("id").filter(|v| !v.is_null()).cloned(),
        method: method.to_string(),
        params,
    })
}

async fn dispatch(dispatcher: &Dispatcher, cmd: Command) -> ResponseEnvelope {
    // HTTP callers cannot receive out-of-band responses; the origin policy
    // keeps deferring methods off this channel, so the sink stays unused.
    let (out_tx, _out_rx) = mpsc::channel(1);
    match dispatcher.dispatch(cmd, Origin::Http, &out_tx).await {
        Dispatched::Ready(envelope) => envelope,
        Dispatched::Deferred => {
            ResponseEnvelope::error(None, "Asynchronous methods are not available over HTTP")
        }
    }
}
