//! End-to-end tests: real TCP connections against an in-process server.
//!
//! Clients are plain blocking sockets so the tests exercise the server's
//! runtimes without sharing one. Each test builds its own server on an
//! ephemeral port and stops it at the end.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lserver_common::Config;
use lserver_server::{ControlClient, ControlRequest, ControlServer, HttpProtocol, ServerManager};
use lserver_vm::VirtualMachine;

fn test_config(workers: usize, threads: usize, max_sessions: usize) -> Config {
    Config::from_yaml(&format!(
        r#"
listen:
  ip: 127.0.0.1
  port: 0
concurrency:
  num_workers: {}
  max_num_workers: 8
  num_threads_per_worker: {}
sessions:
  max_session_pool_size: {}
"#,
        workers, threads, max_sessions
    ))
    .unwrap()
}

fn start_server(config: Config) -> (ServerManager, i32, SocketAddr) {
    let manager = ServerManager::new();
    let vm = Arc::new(VirtualMachine::new());
    let handle = manager
        .create_server(config, move || HttpProtocol::new(vm.clone()))
        .unwrap();
    let addr = manager.get_server(handle).unwrap().local_addr();
    (manager, handle, addr)
}

fn send_and_collect(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

fn vscript_request(json: &str, payload: &[u8], keep_alive: bool) -> Vec<u8> {
    let body_len = json.len().to_string().len() + 1 + json.len() + payload.len();
    let mut request = format!(
        "POST /vscript/ HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}\n{}",
        body_len,
        if keep_alive { "Keep-Alive" } else { "close" },
        json.len(),
        json
    )
    .into_bytes();
    request.extend_from_slice(payload);
    request
}

#[test]
fn test_sinkhole_happy_path() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    let response = send_and_collect(
        addr,
        b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nConnection: close\r\n\r\nsome string",
    );
    assert_eq!(
        response,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Close\r\n\r\n"
    );

    manager.stop();
    manager.wait();
}

#[test]
fn test_vscript_download() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    let response = send_and_collect(
        addr,
        &vscript_request(r#"[{"0":{"DOWNLOAD":"16"}}]"#, b"", false),
    );
    let expected_header = b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\nConnection: Close\r\n\r\n";
    assert_eq!(&response[..expected_header.len()], expected_header);
    assert_eq!(response.len(), expected_header.len() + 16);

    manager.stop();
    manager.wait();
}

#[test]
fn test_malformed_vscript_closes_without_response() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    let response = send_and_collect(
        addr,
        b"POST /vscript/ HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\n3\nxxx",
    );
    assert!(response.is_empty());

    manager.stop();
    manager.wait();
}

#[test]
fn test_unknown_url_closes_without_response() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    let response = send_and_collect(
        addr,
        b"GET /elsewhere/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
    );
    assert!(response.is_empty());

    manager.stop();
    manager.wait();
}

#[test]
fn test_keep_alive_reuses_connection() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));
    // Drain startup noise from the delta counters.
    let _ = manager.get_stats();

    let request =
        b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: Keep-Alive\r\n\r\nbody";
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n";

    let mut stream = TcpStream::connect(addr).unwrap();
    for _ in 0..2 {
        stream.write_all(request).unwrap();
        let mut response = vec![0u8; expected.len()];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(response, expected);
    }

    let stats = &manager.get_stats()[0];
    assert_eq!(stats.transactions_delta, 2);
    assert_eq!(stats.accepted, 1);

    drop(stream);
    manager.stop();
    manager.wait();
}

#[test]
fn test_lock_serializes_concurrent_requests() {
    let (manager, _, addr) = start_server(test_config(2, 2, 16));

    // Each request takes resource 1, holds it for 300 ms, releases it, and
    // downloads 64 bytes. Three concurrent clients must serialize.
    let json = r#"[{"0":{"LOCK":"1"}},{"1":{"SLEEP":"300000"}},{"2":{"UNLOCK":"1"}},{"3":{"DOWNLOAD":"64"}}]"#;
    let request = vscript_request(json, b"xyz", false);

    let start = Instant::now();
    let clients: Vec<_> = (0..3)
        .map(|_| {
            let request = request.clone();
            std::thread::spawn(move || send_and_collect(addr, &request))
        })
        .collect();
    for client in clients {
        let response = client.join().unwrap();
        let text = String::from_utf8_lossy(&response).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
        assert!(text.contains("Content-Length: 64"), "{}", text);
    }
    assert!(
        start.elapsed() >= Duration::from_millis(800),
        "requests were not serialized: {:?}",
        start.elapsed()
    );

    manager.stop();
    manager.wait();
}

#[test]
fn test_session_pool_exhaustion_drops_new_connections() {
    let (manager, _, addr) = start_server(test_config(2, 1, 1));

    // Occupy the only session with a keep-alive connection.
    let mut first = TcpStream::connect(addr).unwrap();
    first
        .write_all(b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n")
        .unwrap();
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n";
    let mut response = vec![0u8; expected.len()];
    first.read_exact(&mut response).unwrap();

    // A second connection gets dropped without a response.
    let second = send_and_collect(
        addr,
        b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    );
    assert!(second.is_empty());

    // Releasing the first session makes the slot borrowable again.
    drop(first);
    std::thread::sleep(Duration::from_millis(300));
    let third = send_and_collect(
        addr,
        b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(
        third,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Close\r\n\r\n"
    );

    manager.stop();
    manager.wait();
}

#[test]
fn test_runtime_add_and_deactivate_context() {
    let (manager, handle, _addr) = start_server(test_config(2, 1, 16));
    let server = manager.get_server(handle).unwrap();

    server.add_context(4).unwrap();
    let info = server.server_info();
    assert_eq!(info.contexts.len(), 3);
    assert_eq!(info.contexts[2].threads, 4);
    assert!(info.contexts[2].active);

    server.deactivate_context(2).unwrap();
    let info = server.server_info();
    assert!(!info.contexts[2].active);
    assert_eq!(info.contexts[2].threads, 0);

    // Repeating the deactivation is a logic error.
    assert!(server.deactivate_context(2).is_err());

    manager.stop();
    manager.wait();
}

#[test]
fn test_strand_accounting_per_thread_count() {
    // Single-threaded workers never rent strands.
    let (manager, handle, addr) = start_server(test_config(1, 1, 16));
    let server = manager.get_server(handle).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n")
        .unwrap();
    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n";
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).unwrap();

    let info = server.server_info();
    assert_eq!(info.contexts[0].active_sessions, 1);
    assert_eq!(info.contexts[0].strand_pool_in_flight, 0);

    drop(stream);
    manager.stop();
    manager.wait();

    // Multi-threaded workers rent one strand per live session.
    let (manager, handle, addr) = start_server(test_config(1, 2, 16));
    let server = manager.get_server(handle).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"POST /sinkhole/ HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n")
        .unwrap();
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).unwrap();

    let info = server.server_info();
    assert_eq!(info.contexts[0].strand_pool_in_flight, 1);

    drop(stream);
    manager.stop();
    manager.wait();
}

#[tokio::test]
async fn test_control_plane_round_trip() {
    let (manager, _handle, _addr) = start_server(test_config(2, 1, 16));
    let control = ControlServer::start(manager.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
    let client = ControlClient::new(control.local_addr());

    let response = client.call(&ControlRequest::GetStats).await.unwrap();
    assert!(response.success);
    assert_eq!(response.result.as_ref().unwrap().as_array().unwrap().len(), 1);

    let response = client
        .call(&ControlRequest::AddContext {
            server_id: 0,
            num_threads: 4,
        })
        .await
        .unwrap();
    assert!(response.success, "{:?}", response.error);

    let response = client.call(&ControlRequest::GetContextsInfo).await.unwrap();
    let info = response.result.unwrap();
    let contexts = &info.as_array().unwrap()[0]["contexts"];
    assert_eq!(contexts.as_array().unwrap().len(), 3);
    assert_eq!(contexts[2]["threads"], 4);

    let response = client
        .call(&ControlRequest::DeactivateContext {
            server_id: 0,
            context_index: 2,
        })
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.result.unwrap()["status_code"], 0);

    // A second deactivation of the same slot is an error.
    let response = client
        .call(&ControlRequest::DeactivateContext {
            server_id: 0,
            context_index: 2,
        })
        .await
        .unwrap();
    assert!(!response.success);

    control.stop();
    tokio::task::spawn_blocking(move || {
        manager.stop();
        manager.wait();
    })
    .await
    .unwrap();
}

#[test]
fn test_body_streamed_across_writes() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    // Program triggers only after 4 payload bytes; withhold them briefly.
    let json = r#"[{"4":{"DOWNLOAD":"8"}}]"#;
    let full = vscript_request(json, b"abcd", false);

    let mut stream = TcpStream::connect(addr).unwrap();
    let split = full.len() - 4;
    stream.write_all(&full[..split]).unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    stream.write_all(&full[split..]).unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response).to_string();
    assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
    assert!(text.contains("Content-Length: 8"), "{}", text);

    manager.stop();
    manager.wait();
}

#[test]
fn test_graceful_stop_closes_live_connections() {
    let (manager, _, addr) = start_server(test_config(2, 1, 16));

    // A connection parked waiting for a request.
    let mut idle = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    manager.stop();
    manager.wait();

    // The session was finalized by the shutdown; the peer observes EOF.
    idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    let n = idle.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
}
