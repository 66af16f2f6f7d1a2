//! Production connection provider: newline-delimited frames over TCP.

use crate::errors::ConductorError;
use crate::logging::append_run_log;
use crate::runtime::{ConnectionProvider, MessageCallback, PeerHandle};
use crate::types::PeerStatus;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Inbox {
    callback: Option<MessageCallback>,
    pending: Vec<String>,
}

struct TcpConnection {
    identifier: String,
    writer: Mutex<TcpStream>,
    status: Mutex<PeerStatus>,
    inbox: Mutex<Inbox>,
}

impl TcpConnection {
    fn status(&self) -> PeerStatus {
        self.status.lock().map(|s| *s).unwrap_or(PeerStatus::Error)
    }

    fn set_status_if_connected(&self, next: PeerStatus) {
        if let Ok(mut status) = self.status.lock() {
            if *status == PeerStatus::Connected {
                *status = next;
            }
        }
    }

    /// Frames read after an explicit disconnect are dropped.
    fn deliver(&self, frame: String) {
        if self.status() == PeerStatus::Disconnected {
            return;
        }
        let Ok(mut inbox) = self.inbox.lock() else {
            return;
        };
        match &inbox.callback {
            Some(callback) => callback(frame),
            None => inbox.pending.push(frame),
        }
    }
}

#[derive(Default)]
struct Connections {
    next_handle: u64,
    live: HashMap<u64, Arc<TcpConnection>>,
}

pub struct TcpConnectionProvider {
    endpoints: BTreeMap<String, String>,
    connect_timeout: Duration,
    connections: Mutex<Connections>,
}

impl TcpConnectionProvider {
    pub fn new(endpoints: BTreeMap<String, String>, connect_timeout_ms: u64) -> Self {
        Self {
            endpoints,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            connections: Mutex::new(Connections::default()),
        }
    }

    /// `[transport.endpoints]` entry for `identifier`, else the identifier itself.
    pub fn endpoint_for<'a>(&'a self, identifier: &'a str) -> &'a str {
        self.endpoints
            .get(identifier)
            .map(String::as_str)
            .unwrap_or(identifier)
    }

    fn lookup(&self, handle: &PeerHandle) -> Option<Arc<TcpConnection>> {
        self.connections
            .lock()
            .ok()
            .and_then(|connections| connections.live.get(&handle.id).cloned())
    }

    fn open_stream(&self, identifier: &str) -> Result<TcpStream, ConductorError> {
        let endpoint = self.endpoint_for(identifier);
        let unavailable =
            |detail: String| ConductorError::PeerUnavailable(format!("{identifier}: {detail}"));
        let addrs = endpoint
            .to_socket_addrs()
            .map_err(|e| unavailable(format!("cannot resolve {endpoint}: {e}")))?;
        let mut last_error = format!("{endpoint} resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = format!("connect {addr}: {e}"),
            }
        }
        Err(unavailable(last_error))
    }
}

fn read_frames(connection: Arc<TcpConnection>, stream: TcpStream) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                let frame = line.trim_end_matches('\r');
                if !frame.trim().is_empty() {
                    connection.deliver(frame.to_string());
                }
            }
            Err(err) => {
                connection.set_status_if_connected(PeerStatus::Error);
                append_run_log(
                    "warn",
                    "transport.read.failed",
                    json!({
                        "identifier": connection.identifier,
                        "error": err.to_string(),
                    }),
                );
                return;
            }
        }
    }
    connection.set_status_if_connected(PeerStatus::Disconnected);
}

impl ConnectionProvider for TcpConnectionProvider {
    fn connect(&self, identifier: &str) -> Result<PeerHandle, ConductorError> {
        let stream = self.open_stream(identifier)?;
        let _ = stream.set_nodelay(true);
        let read_half = stream
            .try_clone()
            .map_err(|e| ConductorError::PeerUnavailable(format!("{identifier}: {e}")))?;

        let connection = Arc::new(TcpConnection {
            identifier: identifier.to_string(),
            writer: Mutex::new(stream),
            status: Mutex::new(PeerStatus::Connected),
            inbox: Mutex::new(Inbox::default()),
        });
        let handle = {
            let mut connections = self.connections.lock().map_err(|_| {
                ConductorError::PeerUnavailable("connection table poisoned".to_string())
            })?;
            connections.next_handle += 1;
            let handle = PeerHandle {
                id: connections.next_handle,
                identifier: identifier.to_string(),
            };
            connections
                .live
                .insert(handle.id, Arc::clone(&connection));
            handle
        };

        let reader = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("conductor-read-{}", handle.id))
            .spawn(move || read_frames(reader, read_half))
            .map_err(|e| ConductorError::PeerUnavailable(format!("{identifier}: {e}")))?;

        append_run_log(
            "info",
            "transport.connected",
            json!({
                "identifier": identifier,
                "endpoint": self.endpoint_for(identifier),
                "handle": handle.id,
            }),
        );
        Ok(handle)
    }

    fn disconnect(&self, handle: &PeerHandle) -> Result<(), ConductorError> {
        let connection = self
            .connections
            .lock()
            .map_err(|_| ConductorError::PeerUnavailable("connection table poisoned".to_string()))?
            .live
            .remove(&handle.id)
            .ok_or_else(|| {
                ConductorError::PeerUnavailable(format!("unknown handle {}", handle.id))
            })?;
        if let Ok(mut status) = connection.status.lock() {
            *status = PeerStatus::Disconnected;
        }
        if let Ok(mut inbox) = connection.inbox.lock() {
            inbox.callback = None;
            inbox.pending.clear();
        }
        if let Ok(stream) = connection.writer.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn send(&self, handle: &PeerHandle, raw: &str) -> Result<(), ConductorError> {
        let connection = self.lookup(handle).ok_or_else(|| {
            ConductorError::SendFailed(format!("{} is not connected", handle.identifier))
        })?;
        if connection.status() != PeerStatus::Connected {
            return Err(ConductorError::SendFailed(format!(
                "{} is {}",
                handle.identifier,
                connection.status().as_str()
            )));
        }
        let mut frame = raw.replace(['\r', '\n'], " ");
        frame.push('\n');
        let mut stream = connection
            .writer
            .lock()
            .map_err(|_| ConductorError::SendFailed("writer poisoned".to_string()))?;
        stream
            .write_all(frame.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| ConductorError::SendFailed(format!("{}: {e}", handle.identifier)))
    }

    fn on_message(
        &self,
        handle: &PeerHandle,
        callback: MessageCallback,
    ) -> Result<(), ConductorError> {
        let connection = self.lookup(handle).ok_or_else(|| {
            ConductorError::PeerUnavailable(format!("unknown handle {}", handle.id))
        })?;
        let mut inbox = connection
            .inbox
            .lock()
            .map_err(|_| ConductorError::PeerUnavailable("inbox poisoned".to_string()))?;
        for frame in std::mem::take(&mut inbox.pending) {
            callback(frame);
        }
        inbox.callback = Some(callback);
        Ok(())
    }

    fn status(&self, handle: &PeerHandle) -> PeerStatus {
        self.lookup(handle)
            .map(|connection| connection.status())
            .unwrap_or(PeerStatus::Disconnected)
    }
}
