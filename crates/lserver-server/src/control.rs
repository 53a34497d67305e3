//! The control-plane RPC adapter.
//!
//! A thin transport: each frame is a u32 big-endian length followed by a
//! JSON document. Requests select a method plus parameters; responses carry
//! either a result value or an error string. Connections are keep-alive and
//! serve any number of requests.
//!
//! Manager mutations (`add_context`, `deactivate_context`) tear tokio
//! runtimes down, which must not happen on an async worker; the server runs
//! every dispatch on a blocking thread.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lserver_common::{LserverError, Result};

use crate::manager::ServerManager;

/// Maximum control frame size (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Status code for a successful deactivation.
pub const STATUS_OK: i32 = 0;
/// Status code reported while the target context holds dispatch work
/// (EBUSY); the caller may retry.
pub const STATUS_BUSY: i32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ControlRequest {
    /// One stats record per server; delta fields reset on read.
    GetStats,
    AddContext {
        server_id: i32,
        num_threads: usize,
    },
    /// Result: `{"status_code": 0 | 16}`.
    DeactivateContext {
        server_id: i32,
        context_index: usize,
    },
    /// One context list per server.
    GetContextsInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// The control server: accepts framed JSON requests on its own thread and
/// dispatches them into the [`ServerManager`].
pub struct ControlServer {
    local_addr: SocketAddr,
    stop: Arc<tokio::sync::Notify>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ControlServer {
    pub fn start(manager: ServerManager, addr: SocketAddr) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| LserverError::Listen(format!("control server bind {}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| LserverError::Listen(format!("control server setup: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LserverError::Listen(format!("control server addr: {}", e)))?;

        let stop = Arc::new(tokio::sync::Notify::new());
        let stop_rx = stop.clone();
        let thread = std::thread::Builder::new()
            .name("lserver-control".to_string())
            .spawn(move || run_control_server(listener, manager, stop_rx))
            .map_err(|e| LserverError::Listen(format!("control server thread: {}", e)))?;

        tracing::info!("control server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        tracing::info!("shutting down control server");
        self.stop.notify_one();
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn run_control_server(
    listener: std::net::TcpListener,
    manager: ServerManager,
    stop: Arc<tokio::sync::Notify>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("control server runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("control server listener: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = stop.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("control connection from {}", peer);
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, manager).await {
                                tracing::debug!("control connection closed: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("control accept failed: {}", e),
                },
            }
        }
    });
}

async fn serve_connection(mut stream: TcpStream, manager: ServerManager) -> Result<()> {
    loop {
        let Some(frame) = read_frame(&mut stream).await? else {
            return Ok(()); // peer closed between requests
        };

        let response = match serde_json::from_slice::<ControlRequest>(&frame) {
            Ok(request) => {
                let manager = manager.clone();
                // Dispatch may drop a worker runtime; never on this thread.
                tokio::task::spawn_blocking(move || dispatch(&manager, request))
                    .await
                    .unwrap_or_else(|e| ControlResponse::error(format!("dispatch panicked: {}", e)))
            }
            Err(e) => ControlResponse::error(format!("bad request: {}", e)),
        };

        write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
    }
}

/// Executes one control request against the manager.
pub fn dispatch(manager: &ServerManager, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::GetStats => ControlResponse::success(json!(manager.get_stats())),
        ControlRequest::GetContextsInfo => {
            ControlResponse::success(json!(manager.get_servers_info()))
        }
        ControlRequest::AddContext {
            server_id,
            num_threads,
        } => match manager
            .get_server(server_id)
            .and_then(|server| server.add_context(num_threads))
        {
            Ok(()) => ControlResponse::success(Value::Null),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::DeactivateContext {
            server_id,
            context_index,
        } => {
            let server = match manager.get_server(server_id) {
                Ok(server) => server,
                Err(e) => return ControlResponse::error(e.to_string()),
            };
            match server.deactivate_context(context_index) {
                Ok(()) => ControlResponse::success(json!({ "status_code": STATUS_OK })),
                Err(LserverError::Busy) => {
                    ControlResponse::success(json!({ "status_code": STATUS_BUSY }))
                }
                Err(e) => ControlResponse::error(e.to_string()),
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(LserverError::Control(format!("read length: {}", e))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(LserverError::Control(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut frame = vec![0u8; len];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|e| LserverError::Control(format!("read frame: {}", e)))?;
    Ok(Some(frame))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| LserverError::Control(format!("write length: {}", e)))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| LserverError::Control(format!("write frame: {}", e)))?;
    Ok(())
}

/// Client side of the control transport, used by the CLI.
pub struct ControlClient {
    addr: SocketAddr,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn call(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| LserverError::Control(format!("connect {}: {}", self.addr, e)))?;
        write_frame(&mut stream, &serde_json::to_vec(request)?).await?;
        let frame = read_frame(&mut stream)
            .await?
            .ok_or_else(|| LserverError::Control("server closed the connection".to_string()))?;
        Ok(serde_json::from_slice(&frame)?)
    }
}
