//! CDP transport layer
//!
//! Talks to the browser over its DevTools WebSocket. Commands are correlated
//! to responses by message id; events carrying a `sessionId` are routed to the
//! page session that subscribed for them, so concurrent sniff sessions each
//! consume only their own event stream.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Error, Result};

/// An event the browser delivered for one attached page session.
#[derive(Debug)]
pub struct PageEvent {
    pub method: String,
    pub params: Value,
}

type PendingReply = oneshot::Sender<Result<Value>>;
type EventRoutes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PageEvent>>>>;

mod opcode {
    pub const TEXT: u8 = 0x1;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// Write one masked client text frame (RFC 6455).
fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(14 + len);

    frame.push(0x80 | opcode::TEXT);
    match len {
        0..=125 => frame.push(0x80 | len as u8),
        126..=65535 => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    // Clients must mask every frame
    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

    stream.write_all(&frame)?;
    stream.flush()
}

/// Read one frame, returning (opcode, unmasked payload).
fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let op = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m)?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((op, payload))
}

/// CDP transport: command dispatch plus the reader that demultiplexes
/// responses and events coming back from the browser.
pub struct Transport {
    /// The browser child process
    child: Mutex<Child>,
    /// WebSocket stream for writing
    writer: Mutex<TcpStream>,
    /// Next command id
    next_id: AtomicU64,
    /// Commands awaiting a response
    pending: Arc<Mutex<HashMap<u64, PendingReply>>>,
    /// Per-session event subscribers, keyed by CDP session id
    routes: EventRoutes,
}

impl Transport {
    /// Connect to a freshly launched browser over its DevTools WebSocket URL
    pub fn connect(child: Child, ws_url: &str) -> Result<Self> {
        let trimmed = ws_url.trim_start_matches("ws://");
        let (host_port, path) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        let mut stream = TcpStream::connect(host_port)
            .map_err(|e| Error::transport_io("Failed to connect to browser", e))?;

        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            rand::random::<[u8; 16]>(),
        );
        let handshake = format!(
            "GET /{path} HTTP/1.1\r\n\
             Host: {host_port}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        );
        stream
            .write_all(handshake.as_bytes())
            .map_err(|e| Error::transport_io("Handshake write failed", e))?;

        let mut response = [0u8; 1024];
        let n = stream
            .read(&mut response)
            .map_err(|e| Error::transport_io("Handshake read failed", e))?;
        let status = String::from_utf8_lossy(&response[..n]);
        if !status.contains("101") {
            return Err(Error::transport(format!(
                "WebSocket handshake rejected: {status}"
            )));
        }

        tracing::debug!("WebSocket connected to {}", ws_url);

        let reader_stream = stream
            .try_clone()
            .map_err(|e| Error::transport_io("Failed to clone stream", e))?;

        let pending: Arc<Mutex<HashMap<u64, PendingReply>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let routes: EventRoutes = Arc::new(Mutex::new(HashMap::new()));

        let pending_reader = Arc::clone(&pending);
        let routes_reader = Arc::clone(&routes);
        std::thread::spawn(move || {
            Self::reader_loop(reader_stream, pending_reader, routes_reader);
        });

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending,
            routes,
        })
    }

    /// Reader loop on a dedicated thread: demultiplex responses and events
    fn reader_loop(mut stream: TcpStream, pending: Arc<Mutex<HashMap<u64, PendingReply>>>, routes: EventRoutes) {
        loop {
            let (op, payload) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            };

            match op {
                opcode::TEXT => {
                    let msg: Value = match serde_json::from_slice(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("Unparseable CDP message: {}", e);
                            continue;
                        }
                    };
                    Self::dispatch_message(msg, &pending, &routes);
                }
                opcode::PING => {
                    let pong = [0x80 | opcode::PONG, 0x80, 0, 0, 0, 0];
                    let _ = stream.write_all(&pong);
                }
                opcode::CLOSE => {
                    tracing::debug!("WebSocket closed by browser");
                    break;
                }
                _ => {}
            }
        }

        tracing::debug!("CDP reader loop ended");
    }

    fn dispatch_message(
        msg: Value,
        pending: &Arc<Mutex<HashMap<u64, PendingReply>>>,
        routes: &EventRoutes,
    ) {
        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let reply = if let Some(error) = msg.get("error") {
                Err(Error::cdp(
                    msg.get("method").and_then(Value::as_str).unwrap_or("unknown"),
                    error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    error.get("message").and_then(Value::as_str).unwrap_or("unknown"),
                ))
            } else {
                Ok(msg.get("result").cloned().unwrap_or_else(|| json!({})))
            };

            let mut pending_guard = pending.blocking_lock();
            if let Some(tx) = pending_guard.remove(&id) {
                let _ = tx.send(reply);
            } else {
                tracing::trace!("Response for unknown command id {}", id);
            }
        } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
            let session_id = msg.get("sessionId").and_then(Value::as_str);
            let Some(session_id) = session_id else {
                tracing::trace!("Unrouted browser event: {}", method);
                return;
            };

            let routes_guard = routes.blocking_lock();
            if let Some(tx) = routes_guard.get(session_id) {
                let _ = tx.send(PageEvent {
                    method: method.to_string(),
                    params: msg.get("params").cloned().unwrap_or_else(|| json!({})),
                });
            }
        }
    }

    /// Send a command at browser scope
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch(None, method, params).await
    }

    /// Send a command to an attached page session
    pub async fn send_to_session<C, R>(&self, session_id: &str, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch(Some(session_id), method, params).await
    }

    async fn dispatch<C, R>(&self, session_id: Option<&str>, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = json!(session_id);
        }
        let data = serde_json::to_string(&msg)?;

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, data.as_bytes())
                .map_err(|e| Error::transport_io("WebSocket write failed", e))?;
        }

        tracing::trace!("Sent CDP command: {} (id={})", method, id);

        let reply = rx
            .await
            .map_err(|_| Error::transport("Response channel closed"))??;
        Ok(serde_json::from_value(reply)?)
    }

    /// Register an event subscriber for a page session
    pub async fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock().await;
        routes.insert(session_id.to_string(), tx);
        rx
    }

    /// Drop a session's event subscription; its receiver sees end-of-stream
    pub async fn unsubscribe(&self, session_id: &str) {
        let mut routes = self.routes.lock().await;
        routes.remove(session_id);
    }

    /// Close the transport and kill the browser process
    pub async fn close(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            let close_frame = [0x80 | opcode::CLOSE, 0x80, 0, 0, 0, 0];
            let _ = writer.write_all(&close_frame);
        }

        let mut child = self.child.lock().await;
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.kill();
        }
    }
}

/// Launch the browser and return its DevTools WebSocket URL
pub fn launch_browser(path: &std::path::Path, args: &[String]) -> Result<(Child, String)> {
    let mut child = Command::new(path)
        .args(args)
        .arg("--remote-debugging-port=0") // let the browser pick a free port
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped()) // the DevTools URL is printed on stderr
        .spawn()
        .map_err(|e| Error::Launch(format!("spawn failed: {e}")))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Launch("no stderr from browser".into()))?;

    // The browser prints: DevTools listening on ws://127.0.0.1:PORT/devtools/browser/GUID
    let mut ws_url = None;
    for line in BufReader::new(stderr).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        tracing::trace!("browser stderr: {}", line);
        if line.contains("DevTools listening on") {
            if let Some(start) = line.find("ws://") {
                ws_url = Some(line[start..].trim().to_string());
                break;
            }
        }
    }

    let ws_url = ws_url.ok_or_else(|| {
        Error::Launch("browser did not report a DevTools WebSocket URL".into())
    })?;

    tracing::info!("DevTools URL: {}", ws_url);
    Ok((child, ws_url))
}
