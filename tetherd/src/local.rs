//! Local line-JSON channel.
//!
//! The same dispatcher the reverse link uses, served to device-local
//! callers over TCP: one JSON command per line in, one envelope per line
//! out. Each connection owns an outbound writer task so deferred install
//! envelopes can be delivered out-of-band. The listen port can be changed
//! at runtime through the `socket_port` command.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tether_common::protocol::{parse_line, Inbound};
use tether_common::Origin;

use crate::dispatcher::{Dispatched, Dispatcher};

const PER_CONNECTION_QUEUE: usize = 32;

pub struct LocalServer {
    dispatcher: Arc<Dispatcher>,
    host: String,
    port_rx: watch::Receiver<u16>,
}

impl LocalServer {
    pub fn new(dispatcher: Arc<Dispatcher>, host: String, port_rx: watch::Receiver<u16>) -> Self {
        Self {
            dispatcher,
            host,
            port_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            let port = *self.port_rx.borrow_and_update();
            let listener = match TcpListener::bind((self.host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(port, error = %err, "local channel bind failed");
                    // Nothing to serve until someone picks a different port.
                    if self.port_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            match listener.local_addr() {
                Ok(addr) => info!(addr = %addr, "local channel listening"),
                Err(_) => info!(port, "local channel listening"),
            }

            loop {
                tokio::select! {
                    changed = self.port_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        info!(port = *self.port_rx.borrow(), "rebinding local channel");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "local connection accepted");
                            tokio::spawn(handle_connection(stream, Arc::clone(&self.dispatcher)));
                        }
                        Err(err) => warn!(error = %err, "local accept failed"),
                    }
                }
            }
        }
    }
}

pub(crate) async fn handle_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    let (reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(PER_CONNECTION_QUEUE);
    let write_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "local read failed");
                break;
            }
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Inbound::Command(cmd) => {
                        match dispatcher.dispatch(cmd, Origin::LocalSocket, &out_tx).await {
                            Dispatched::Ready(envelope) => {
                                if out_tx.send(envelope.to_line()).await.is_err() {
                                    break;
                                }
                            }
                            Dispatched::Deferred => {}
                        }
                    }
                    Inbound::Reply { id, .. } => {
                        debug!(id = ?id, "ignoring reply on local channel");
                    }
                    Inbound::Malformed(reason) => {
                        warn!(reason = %reason, "ignoring local message");
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = write_task.await;
}
