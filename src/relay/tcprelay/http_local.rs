// The MIT License (MIT)

// Copyright (c) 2020 jumptiger project developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! HTTP proxy relay running on the local side
//!
//! `CONNECT` requests become opaque tunnels answered with
//! `200 Connection established`. Plain requests carrying an absolute URI are
//! rewritten to origin-form and the rewritten head is injected into the
//! tunnel as the first payload bytes.

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};

use byte_string::ByteStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use url::Url;

use crate::context::SharedContext;
use crate::relay::flow::ConnGuard;
use crate::relay::socks5::Address;
use crate::relay::tcprelay::{open_tunnel, relay};

/// Request head cap; anything longer is refused
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

#[derive(Debug)]
pub enum HttpError {
    /// Request head exceeded [`MAX_HEADER_SIZE`]
    HeaderTooLarge,
    /// Request could not be parsed
    Malformed(&'static str),
    Io(io::Error),
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            HttpError::HeaderTooLarge => write!(f, "request header too large"),
            HttpError::Malformed(msg) => write!(f, "malformed request, {}", msg),
            HttpError::Io(ref err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> HttpError {
        HttpError::Io(err)
    }
}

impl From<HttpError> for io::Error {
    fn from(err: HttpError) -> io::Error {
        match err {
            HttpError::Io(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}

/// What the client asked the proxy to do
#[derive(Debug)]
pub enum HttpProxyRequest {
    /// Opaque tunnel; `early` holds any bytes the client pipelined after the
    /// request head
    Connect { addr: Address, early: Vec<u8> },
    /// Plain request forwarded through the tunnel; `payload` is the
    /// rewritten head plus any body bytes already read
    Forward { addr: Address, payload: Vec<u8> },
}

impl HttpProxyRequest {
    pub fn addr(&self) -> &Address {
        match *self {
            HttpProxyRequest::Connect { ref addr, .. } => addr,
            HttpProxyRequest::Forward { ref addr, .. } => addr,
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Reads the request head (up to and including `\r\n\r\n`); returns the head
/// and whatever bytes followed it in the same reads
async fn read_request_head<R>(stream: &mut R) -> Result<(Vec<u8>, Vec<u8>), HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Malformed("connection closed before end of header"));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_header_end(&buf) {
            let rest = buf.split_off(pos);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(HttpError::HeaderTooLarge);
        }
    }
}

/// Turns a `host[:port]` authority into an [`Address`]
fn authority_to_address(authority: &str, default_port: u16) -> Result<Address, HttpError> {
    // covers `1.2.3.4:80` and `[::1]:443`
    if let Ok(sa) = authority.parse::<SocketAddr>() {
        return Ok(Address::SocketAddress(sa));
    }
    // a bare IP literal without a port
    if let Ok(ip) = authority.parse::<IpAddr>() {
        return Ok(Address::SocketAddress(SocketAddr::new(ip, default_port)));
    }

    match authority.rfind(':') {
        Some(pos) => {
            let host = &authority[..pos];
            let port = authority[pos + 1..]
                .parse::<u16>()
                .map_err(|_| HttpError::Malformed("invalid port in authority"))?;
            if host.is_empty() {
                return Err(HttpError::Malformed("empty host in authority"));
            }
            Ok(Address::DomainNameAddress(host.to_owned(), port))
        }
        None => {
            if authority.is_empty() {
                return Err(HttpError::Malformed("empty host in authority"));
            }
            Ok(Address::DomainNameAddress(authority.to_owned(), default_port))
        }
    }
}

fn find_host_header<'a, I>(lines: I) -> Result<&'a str, HttpError>
where
    I: Iterator<Item = &'a str>,
{
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(pos) = line.find(':') {
            if line[..pos].trim().eq_ignore_ascii_case("host") {
                return Ok(line[pos + 1..].trim());
            }
        }
    }
    Err(HttpError::Malformed("missing Host header"))
}

fn is_proxy_connection_header(line: &str) -> bool {
    match line.find(':') {
        Some(pos) => line[..pos].trim().eq_ignore_ascii_case("proxy-connection"),
        None => false,
    }
}

/// Parses the request head into a proxy action
pub fn parse_request(head: &[u8], rest: Vec<u8>) -> Result<HttpProxyRequest, HttpError> {
    let head_str = std::str::from_utf8(head).map_err(|_| HttpError::Malformed("header is not utf-8"))?;

    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().ok_or(HttpError::Malformed("empty request"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HttpError::Malformed("missing method"))?;
    let target = parts.next().ok_or(HttpError::Malformed("missing request target"))?;
    let version = parts.next().ok_or(HttpError::Malformed("missing http version"))?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::Malformed("bad http version"));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let addr = authority_to_address(target, 443)?;
        return Ok(HttpProxyRequest::Connect { addr, early: rest });
    }

    // plain request: figure out the target, then rewrite to origin-form
    let (addr, origin_target) = if target.starts_with('/') {
        let host = find_host_header(lines.clone())?;
        (authority_to_address(host, 80)?, target.to_owned())
    } else {
        let url = Url::parse(target).map_err(|_| HttpError::Malformed("invalid request uri"))?;
        if url.scheme() != "http" {
            return Err(HttpError::Malformed("unsupported scheme in request uri"));
        }
        let host = url.host_str().ok_or(HttpError::Malformed("request uri without host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut origin_target = url.path().to_owned();
        if let Some(query) = url.query() {
            origin_target.push('?');
            origin_target.push_str(query);
        }
        (authority_to_address(host, port)?, origin_target)
    };

    let mut payload = Vec::with_capacity(head.len() + rest.len());
    payload.extend_from_slice(method.as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(origin_target.as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(version.as_bytes());
    payload.extend_from_slice(b"\r\n");

    for line in lines {
        if line.is_empty() {
            break;
        }
        // hop-by-hop header meant for the proxy, not the origin
        if is_proxy_connection_header(line) {
            continue;
        }
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(&rest);

    Ok(HttpProxyRequest::Forward { addr, payload })
}

async fn read_request(stream: &mut TcpStream) -> Result<HttpProxyRequest, HttpError> {
    let (head, rest) = read_request_head(stream).await?;
    trace!("request head {:?}", ByteStr::new(&head));
    parse_request(&head, rest)
}

async fn handle_client(context: SharedContext, mut stream: TcpStream, conn: ConnGuard) -> io::Result<()> {
    let config = context.config();

    let request = match time::timeout(config.connect_timeout, read_request(&mut stream)).await {
        Ok(Ok(req)) => req,
        Ok(Err(err)) => {
            match err {
                HttpError::Io(..) => {}
                ref e => {
                    debug!("rejecting request: {}", e);
                    let _ = stream.write_all(RESPONSE_BAD_REQUEST).await;
                }
            }
            return Err(err.into());
        }
        Err(..) => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "request head timed out"));
        }
    };

    match request {
        HttpProxyRequest::Connect { addr, early } => {
            info!("HTTP CONNECT {}", addr);
            let (mut svr_r, mut svr_w) = open_tunnel(&context, &conn, &addr, &early).await?;
            stream.write_all(RESPONSE_ESTABLISHED).await?;

            let (mut client_r, mut client_w) = stream.into_split();
            relay(&mut client_r, &mut client_w, &mut svr_r, &mut svr_w, &conn, config.timeout).await
        }
        HttpProxyRequest::Forward { addr, payload } => {
            info!("HTTP FORWARD {}", addr);
            let (mut svr_r, mut svr_w) = open_tunnel(&context, &conn, &addr, &payload).await?;

            let (mut client_r, mut client_w) = stream.into_split();
            relay(&mut client_r, &mut client_w, &mut svr_r, &mut svr_w, &conn, config.timeout).await
        }
    }
}

async fn accept_loop(context: SharedContext, mut listener: TcpListener) -> io::Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("accept failed: {}", err);
                continue;
            }
        };

        let conn = match context
            .registry()
            .try_register(peer_addr, context.config().max_connections)
        {
            Some(conn) => conn,
            None => {
                warn!("connection limit reached, dropping {}", peer_addr);
                continue;
            }
        };

        let _ = stream.set_nodelay(true);

        let context = context.clone();
        tokio::spawn(async move {
            match crate::relay::until_shutdown(handle_client(context, stream, conn)).await {
                Some(Ok(())) => trace!("client {} finished", peer_addr),
                Some(Err(err)) => match err.kind() {
                    io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::InvalidData => {
                        debug!("client {}: {}", peer_addr, err);
                    }
                    _ => {
                        error!("failed to handle client {}: {}", peer_addr, err);
                    }
                },
                None => trace!("client {} cancelled by shutdown", peer_addr),
            }
        });
    }
}

/// Binds the HTTP proxy listener and serves until shutdown
pub async fn run(context: SharedContext) -> io::Result<()> {
    let port = match context.config().http_port {
        Some(port) => port,
        None => return Ok(()),
    };
    let listen_addr = format!("{}:{}", context.config().local_host, port);

    let listener = TcpListener::bind(listen_addr.as_str()).await.map_err(|err| {
        error!("failed to listen on {}: {}", listen_addr, err);
        err
    })?;

    info!("jumptiger HTTP listening on {}", listen_addr);

    match crate::relay::until_shutdown(accept_loop(context, listener)).await {
        Some(result) => result,
        None => {
            info!("HTTP listener on {} stopped", listen_addr);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(head: &str) -> Result<HttpProxyRequest, HttpError> {
        parse_request(head.as_bytes(), Vec::new())
    }

    #[test]
    fn connect_request_yields_tunnel_target() {
        let req = parse("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").unwrap();
        match req {
            HttpProxyRequest::Connect { addr, early } => {
                assert_eq!(addr.to_string(), "example.com:443");
                assert!(early.is_empty());
            }
            other => panic!("expected Connect, got {:?}", other),
        }
    }

    #[test]
    fn absolute_uri_is_rewritten_to_origin_form() {
        let req = parse("GET http://example.com/foo HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        match req {
            HttpProxyRequest::Forward { addr, payload } => {
                assert_eq!(addr.to_string(), "example.com:80");
                let text = String::from_utf8(payload).unwrap();
                assert!(text.starts_with("GET /foo HTTP/1.1\r\n"));
                assert!(text.contains("Host: example.com\r\n"));
                assert!(text.ends_with("\r\n\r\n"));
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn absolute_uri_keeps_query_and_port() {
        let req = parse("GET http://example.com:8080/a/b?x=1&y=2 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n").unwrap();
        match req {
            HttpProxyRequest::Forward { addr, payload } => {
                assert_eq!(addr.to_string(), "example.com:8080");
                let text = String::from_utf8(payload).unwrap();
                assert!(text.starts_with("GET /a/b?x=1&y=2 HTTP/1.1\r\n"));
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn origin_form_uses_host_header() {
        let req = parse("POST /submit HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: 0\r\n\r\n").unwrap();
        match req {
            HttpProxyRequest::Forward { addr, payload } => {
                assert_eq!(addr.to_string(), "api.example.com:80");
                let text = String::from_utf8(payload).unwrap();
                assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn proxy_connection_header_is_stripped() {
        let req = parse(
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .unwrap();
        match req {
            HttpProxyRequest::Forward { payload, .. } => {
                let text = String::from_utf8(payload).unwrap();
                assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn body_bytes_follow_the_rewritten_head() {
        let head = "POST http://example.com/u HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\n";
        let req = parse_request(head.as_bytes(), b"ping".to_vec()).unwrap();
        match req {
            HttpProxyRequest::Forward { payload, .. } => {
                assert!(payload.ends_with(b"\r\n\r\nping"));
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn https_uri_in_plain_request_is_rejected() {
        assert!(matches!(
            parse("GET https://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            Err(HttpError::Malformed(..))
        ));
    }

    #[test]
    fn missing_host_for_origin_form_is_rejected() {
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(HttpError::Malformed(..))
        ));
    }

    #[test]
    fn connect_ipv6_authority() {
        let req = parse("CONNECT [2001:db8::1]:443 HTTP/1.1\r\n\r\n").unwrap();
        match req {
            HttpProxyRequest::Connect { addr, .. } => {
                assert_eq!(addr.to_string(), "[2001:db8::1]:443");
            }
            other => panic!("expected Connect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_header_is_refused() {
        let mut junk = Vec::new();
        junk.extend_from_slice(b"GET / HTTP/1.1\r\n");
        while junk.len() <= MAX_HEADER_SIZE + 1024 {
            junk.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let mut reader = &junk[..];
        match read_request_head(&mut reader).await {
            Err(HttpError::HeaderTooLarge) => {}
            other => panic!("expected HeaderTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn pipelined_bytes_are_preserved() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        wire.extend_from_slice(b"\x16\x03\x01early-hello");
        let mut reader = &wire[..];
        let (head, rest) = read_request_head(&mut reader).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&rest[..], b"\x16\x03\x01early-hello");
    }
}
