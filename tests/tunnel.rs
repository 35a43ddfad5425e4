//! End-to-end tests: a local proxy, a remote proxy and an origin server all
//! on loopback, talking through real sockets.
//!
//! The connection registry and the shutdown signal are process-wide, so the
//! tests serialize themselves on a mutex instead of relying on cargo's
//! default parallelism.

use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use jumptiger::{run_local, run_remote, shutdown, stats_snapshot, Config, ConfigType};

lazy_static::lazy_static! {
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

const PASSWORD: &str = "integration-password";

struct Ports {
    local: u16,
    http: u16,
    server: u16,
}

fn make_configs(idle_timeout: Duration, max_connections: u32) -> (Config, Config, Ports) {
    let ports = Ports {
        local: free_port(),
        http: free_port(),
        server: free_port(),
    };

    let mut local = Config::new(ConfigType::Local);
    local.server_host = "127.0.0.1".to_owned();
    local.server_port = ports.server;
    local.local_host = "127.0.0.1".to_owned();
    local.local_port = ports.local;
    local.http_port = Some(ports.http);
    local.password = PASSWORD.to_owned();
    local.timeout = idle_timeout;
    local.connect_timeout = Duration::from_secs(5);
    local.auto_reconnect = false;
    local.max_connections = max_connections;
    local.check_valid().unwrap();

    let mut server = Config::new(ConfigType::Server);
    server.server_host = "127.0.0.1".to_owned();
    server.server_port = ports.server;
    server.password = PASSWORD.to_owned();
    server.timeout = idle_timeout;
    server.connect_timeout = Duration::from_secs(5);
    server.max_connections = max_connections.max(8);
    server.check_valid().unwrap();

    (local, server, ports)
}

async fn spawn_proxies(local: Config, server: Config, ports: &Ports) {
    tokio::spawn(async move {
        let _ = run_remote(server).await;
    });
    tokio::spawn(async move {
        let _ = run_local(local).await;
    });

    wait_listening(ports.server).await;
    wait_listening(ports.local).await;
    wait_listening(ports.http).await;
    // let the probe connections drain out of the registry
    time::delay_for(Duration::from_millis(200)).await;
}

async fn wait_listening(port: u16) {
    for _ in 0..100u32 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        time::delay_for(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {}", port);
}

/// Echoes every byte back until EOF
async fn spawn_echo_origin() -> SocketAddr {
    let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(..) => break,
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    addr
}

/// Answers one HTTP request per connection, echoing the request line in the
/// response body
async fn spawn_http_origin() -> SocketAddr {
    let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(..) => break,
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 512];
                loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(..) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&chunk[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request_line = {
                    let text = String::from_utf8_lossy(&head);
                    text.lines().next().unwrap_or("").to_owned()
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    request_line.len(),
                    request_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown(Shutdown::Write);
            });
        }
    });

    addr
}

async fn socks5_connect(local_port: u16, addr_bytes: &[u8]) -> TcpStream {
    let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(addr_bytes);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    client
}

fn ipv4_addr_bytes(addr: SocketAddr) -> Vec<u8> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(..) => panic!("expected an IPv4 origin"),
    };
    let mut bytes = vec![0x01];
    bytes.extend_from_slice(&ip);
    bytes.extend_from_slice(&addr.port().to_be_bytes());
    bytes
}

fn domain_addr_bytes(host: &str, port: u16) -> Vec<u8> {
    let mut bytes = vec![0x03, host.len() as u8];
    bytes.extend_from_slice(host.as_bytes());
    bytes.extend_from_slice(&port.to_be_bytes());
    bytes
}

#[tokio::test]
async fn socks5_ipv4_end_to_end() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    let mut client = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;

    client.write_all(b"ping through the tunnel").await.unwrap();
    let mut echo = [0u8; 23];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo[..], b"ping through the tunnel");
}

#[tokio::test]
async fn socks5_domain_name_end_to_end() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    // the host goes through the tunnel as a domain-type address and is
    // resolved on the remote side
    let mut client = socks5_connect(ports.local, &domain_addr_bytes("127.0.0.1", origin.port())).await;

    client.write_all(b"hello by name").await.unwrap();
    let mut echo = [0u8; 13];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo[..], b"hello by name");
}

#[tokio::test]
async fn http_connect_end_to_end() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    let mut client = TcpStream::connect(("127.0.0.1", ports.http)).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n",
        origin.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut reply = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed before replying");
        reply.extend_from_slice(&chunk[..n]);
        if reply.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200"), "unexpected reply: {}", reply);

    client.write_all(b"tunneled!").await.unwrap();
    let mut echo = [0u8; 9];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo[..], b"tunneled!");
}

#[tokio::test]
async fn plain_http_get_is_rewritten_to_origin_form() {
    let _guard = serial();

    let origin = spawn_http_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    let mut client = TcpStream::connect(("127.0.0.1", ports.http)).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{0}/foo HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nProxy-Connection: keep-alive\r\n\r\n",
        origin.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "unexpected response: {}", response);
    // the origin saw the rewritten, origin-form request line
    assert!(response.ends_with("GET /foo HTTP/1.1"), "unexpected response: {}", response);
}

#[tokio::test]
async fn password_mismatch_closes_the_tunnel() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, mut server, ports) = make_configs(Duration::from_secs(30), 64);
    server.password = "a different password".to_owned();
    spawn_proxies(local, server, &ports).await;

    // SOCKS5 negotiation happens purely on the local side and still succeeds
    let mut client = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;

    // The remote fails to parse the garbled destination header and closes;
    // the client observes EOF with zero payload bytes delivered.
    client.write_all(b"does not matter").await.unwrap();
    let mut sink = Vec::new();
    let n = time::timeout(Duration::from_secs(10), client.read_to_end(&mut sink))
        .await
        .expect("expected EOF, got a hang")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn idle_timeout_tears_the_connection_down() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(1), 64);
    spawn_proxies(local, server, &ports).await;

    let baseline = stats_snapshot().active_connections;

    let mut client = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;

    // no traffic in either direction: both sides must close within the idle
    // timeout (plus slack)
    let mut sink = Vec::new();
    let n = time::timeout(Duration::from_secs(10), client.read_to_end(&mut sink))
        .await
        .expect("idle connection was not torn down")
        .unwrap();
    assert_eq!(n, 0);

    // the registry entry goes away with the connection
    for _ in 0..100u32 {
        if stats_snapshot().active_connections <= baseline {
            return;
        }
        time::delay_for(Duration::from_millis(50)).await;
    }
    panic!("connection was not removed from the registry");
}

#[tokio::test]
async fn connection_cap_drops_the_excess_accept() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 1);
    spawn_proxies(local, server, &ports).await;

    // first client occupies the single slot
    let mut first = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;
    first.write_all(b"hold").await.unwrap();
    let mut echo = [0u8; 4];
    first.read_exact(&mut echo).await.unwrap();

    // second client is accepted at the TCP level, then dropped silently
    let mut second = TcpStream::connect(("127.0.0.1", ports.local)).await.unwrap();
    let _ = second.write_all(&[0x05, 0x01, 0x00]).await;
    let mut buf = [0u8; 2];
    let denied = match time::timeout(Duration::from_secs(5), second.read_exact(&mut buf)).await {
        Ok(Err(..)) => true,
        Ok(Ok(..)) => false,
        Err(..) => false,
    };
    assert!(denied, "connection over the cap was served");

    // once the slot frees up, a new client is admitted again
    drop(first);
    for _ in 0..100u32 {
        if stats_snapshot().active_connections == 0 {
            break;
        }
        time::delay_for(Duration::from_millis(50)).await;
    }
    let mut third = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;
    third.write_all(b"admitted").await.unwrap();
    let mut echo = [0u8; 8];
    third.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo[..], b"admitted");
}

#[tokio::test]
async fn stats_reflect_relayed_bytes() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    let before = stats_snapshot();

    let mut client = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;
    client.write_all(b"count me").await.unwrap();
    let mut echo = [0u8; 8];
    client.read_exact(&mut echo).await.unwrap();

    let after = stats_snapshot();
    assert!(after.total_connections > before.total_connections);
    assert!(after.total_bytes_out > before.total_bytes_out);
    assert!(after.total_bytes_in > before.total_bytes_in);
}

#[tokio::test]
async fn shutdown_is_bounded_and_idempotent() {
    let _guard = serial();

    let origin = spawn_echo_origin().await;
    let (local, server, ports) = make_configs(Duration::from_secs(30), 64);
    spawn_proxies(local, server, &ports).await;

    // leave one relay open so shutdown has something to drain
    let mut client = socks5_connect(ports.local, &ipv4_addr_bytes(origin)).await;
    client.write_all(b"still open").await.unwrap();

    time::timeout(Duration::from_secs(10), shutdown())
        .await
        .expect("shutdown did not finish in time");
    // shutdown is terminal: the second call is a plain no-op
    time::timeout(Duration::from_secs(1), shutdown())
        .await
        .expect("second shutdown call was not a no-op");

    assert_eq!(stats_snapshot().active_connections, 0);

    // let the remaining tests in this process host fresh proxies
    jumptiger::context::rearm();
}
