//! Process-wide STOMP broadcaster for Alfresco repository events,
//! shared by every `AlfrescoDetector` pointed at the same
//! `(host, port)`.
//!
//! Held and handed out explicitly by the orchestrator rather than
//! through a module-level global, so tests can construct a fresh
//! registry instead of sharing hidden process state.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use sync_core::SyncError;

/// Per-detector mailbox capacity. A full mailbox drops the event and
/// logs it rather than blocking the shared connection's read loop.
const SUBSCRIBER_MAILBOX_CAPACITY: usize = 256;

#[derive(Default)]
pub struct StompBroadcasterRegistry {
    connections: Mutex<HashMap<(String, u16), Arc<StompConnection>>>,
}

impl StompBroadcasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared connection for `(host, port)`, dialing and
    /// subscribing to `destination` the first time this pair is seen.
    pub async fn connect(&self, host: &str, port: u16, destination: &str) -> Result<Arc<StompConnection>, SyncError> {
        let key = (host.to_string(), port);
        let mut guard = self.connections.lock().await;
        if let Some(existing) = guard.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let connection = Arc::new(StompConnection::dial(host, port, destination).await?);
        guard.insert(key, Arc::clone(&connection));
        Ok(connection)
    }
}

/// One live STOMP session against an Alfresco ActiveMQ broker, fanning
/// its event topic out to every registered detector.
pub struct StompConnection {
    subscribers: DashMap<String, mpsc::Sender<JsonValue>>,
}

impl StompConnection {
    async fn dial(host: &str, port: u16, destination: &str) -> Result<Self, SyncError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SyncError::Transient(format!("connecting to STOMP broker {host}:{port}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();

        let connect_frame = "CONNECT\naccept-version:1.2\nhost:/\n\n\0";
        write_half
            .write_all(connect_frame.as_bytes())
            .await
            .map_err(|e| SyncError::Io(format!("sending STOMP CONNECT: {e}")))?;

        let subscribe_frame = format!("SUBSCRIBE\nid:0\ndestination:{destination}\nack:auto\n\n\0");
        write_half
            .write_all(subscribe_frame.as_bytes())
            .await
            .map_err(|e| SyncError::Io(format!("sending STOMP SUBSCRIBE: {e}")))?;

        let connection = StompConnection {
            subscribers: DashMap::new(),
        };

        let subscribers_for_loop = connection.subscribers.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame_body(&mut reader).await {
                    Ok(Some(body)) => {
                        let Ok(event) = serde_json::from_str::<JsonValue>(&body) else {
                            continue;
                        };
                        for entry in subscribers_for_loop.iter() {
                            if entry.value().try_send(event.clone()).is_err() {
                                warn!(detector = %entry.key(), "STOMP subscriber mailbox full, dropping event");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("STOMP connection closed by broker");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "STOMP read loop error, closing connection");
                        return;
                    }
                }
            }
        });

        Ok(connection)
    }

    /// Registers a detector for this connection's event fan-out, guarded
    /// by the connection's own bounded mailbox per subscriber.
    pub fn register(&self, detector_id: impl Into<String>) -> mpsc::Receiver<JsonValue> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
        self.subscribers.insert(detector_id.into(), tx);
        rx
    }

    pub fn unregister(&self, detector_id: &str) {
        self.subscribers.remove(detector_id);
    }
}

/// Reads one CloudEvents JSON body out of the next `MESSAGE` frame,
/// skipping any other frame type (`CONNECTED`, `RECEIPT`, heartbeats).
/// Returns `Ok(None)` on clean EOF.
async fn read_frame_body<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<String>, SyncError> {
    loop {
        let mut command = String::new();
        let bytes_read = reader
            .read_line(&mut command)
            .await
            .map_err(|e| SyncError::Io(format!("reading STOMP frame: {e}")))?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let command = command.trim_end();
        if command.is_empty() {
            continue; // heartbeat newline
        }

        let mut headers_done = false;
        while !headers_done {
            let mut header_line = String::new();
            reader
                .read_line(&mut header_line)
                .await
                .map_err(|e| SyncError::Io(format!("reading STOMP header: {e}")))?;
            headers_done = header_line.trim_end().is_empty();
        }

        let mut body = Vec::new();
        loop {
            let byte = reader.read_u8_or_none().await;
            match byte {
                Some(0) => break,
                Some(b) => body.push(b),
                None => return Ok(None),
            }
        }
        let body = String::from_utf8_lossy(&body).trim().to_string();

        if command == "MESSAGE" {
            return Ok(Some(body));
        }
        // Anything else (CONNECTED, ERROR, RECEIPT) is consumed and
        // ignored; keep reading for the next frame.
    }
}

#[async_trait::async_trait]
trait ReadByteOrNone {
    async fn read_u8_or_none(&mut self) -> Option<u8>;
}

#[async_trait::async_trait]
impl<R: AsyncBufReadExt + Unpin + Send> ReadByteOrNone for R {
    async fn read_u8_or_none(&mut self) -> Option<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        match self.read_exact(&mut buf).await {
            Ok(_) => Some(buf[0]),
            Err(_) => None,
        }
    }
}
