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

//! TCP relay: the full-duplex pump and the tunnel plumbing shared by the
//! local and remote endpoints

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use futures::future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;

use crate::context::Context;
use crate::relay::flow::{ConnGuard, ConnState};
use crate::relay::socks5::Address;

pub mod crypto_io;
pub mod http_local;
pub mod local;
pub mod server;

use self::crypto_io::{split_crypto, DecryptedReader, EncryptedWriter};

/// Relay copy buffer, per direction
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Runs `fut` but gives up once `dur` has elapsed
pub async fn try_timeout<T, F>(fut: F, dur: Duration) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match time::timeout(dur, fut).await {
        Ok(r) => r,
        Err(..) => Err(io::Error::new(io::ErrorKind::TimedOut, "operation timed out")),
    }
}

/// Which way a pipe moves bytes, relative to the accepted client socket
#[derive(Clone, Copy, Debug)]
enum Direction {
    ClientToTarget,
    TargetToClient,
}

/// Idle clock shared by the two directions of one relay.
///
/// A direction whose read timer fires only tears the tunnel down when the
/// other direction has been silent just as long, so a one-sided transfer
/// (a long download, say) is not killed by its quiet request side.
struct Activity {
    base: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Activity {
        Activity {
            base: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let elapsed = self.base.elapsed().as_millis() as u64;
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

async fn pipe<R, W>(
    r: &mut R,
    w: &mut W,
    conn: &ConnGuard,
    direction: Direction,
    idle_timeout: Duration,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match time::timeout(idle_timeout, r.read(&mut buf)).await {
            Ok(res) => res?,
            Err(..) => {
                if activity.idle() >= idle_timeout {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
                }
                // the opposite direction is still moving bytes, keep waiting
                continue;
            }
        };

        if n == 0 {
            // clean EOF: half-close towards the peer and let the other
            // direction finish on its own
            let _ = w.shutdown().await;
            return Ok(total);
        }

        activity.touch();
        match time::timeout(idle_timeout, w.write_all(&buf[..n])).await {
            Ok(res) => res?,
            Err(..) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "relay write timed out"));
            }
        }

        match direction {
            Direction::ClientToTarget => conn.add_bytes_out(n as u64),
            Direction::TargetToClient => conn.add_bytes_in(n as u64),
        }
        total += n as u64;
    }
}

/// Pumps bytes both ways between the accepted client socket and the target
/// side until both directions have seen EOF, the idle timeout expires, or an
/// I/O error ends the tunnel.
///
/// A mid-stream error on either direction aborts both immediately; the
/// position of a stream cipher cannot be rewound, so nothing is retried.
pub async fn relay<CR, CW, TR, TW>(
    client_r: &mut CR,
    client_w: &mut CW,
    target_r: &mut TR,
    target_w: &mut TW,
    conn: &ConnGuard,
    idle_timeout: Duration,
) -> io::Result<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    conn.set_state(ConnState::Relaying);

    let activity = Activity::new();
    let c2t = pipe(
        client_r,
        target_w,
        conn,
        Direction::ClientToTarget,
        idle_timeout,
        &activity,
    );
    let t2c = pipe(
        target_r,
        client_w,
        conn,
        Direction::TargetToClient,
        idle_timeout,
        &activity,
    );

    let result = future::try_join(c2t, t2c).await.map(|_| ());
    conn.set_state(ConnState::Closing);
    result
}

/// Dials the remote proxy endpoint, retrying on failure when configured
pub async fn connect_proxy_server(context: &Context) -> io::Result<TcpStream> {
    let config = context.config();
    let addr = config.server_addr();

    let attempts = if config.auto_reconnect {
        1 + u32::from(config.retry_times)
    } else {
        1
    };

    let mut last_err = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            debug!(
                "retrying proxy server {} ({}/{})",
                addr, attempt, config.retry_times
            );
            time::delay_for(config.retry_interval).await;
        }

        match time::timeout(config.connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(err)) => {
                warn!("failed to connect proxy server {}: {}", addr, err);
                last_err = Some(err);
            }
            Err(..) => {
                warn!("connecting proxy server {} timed out", addr);
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "proxy server connect timed out",
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "proxy server dial failed")))
}

/// Opens a cipher-framed tunnel to the remote proxy and sends the
/// destination header (plus any payload already read from the client) as the
/// first encrypted bytes. The IV goes out implicitly with that first write.
pub async fn open_tunnel(
    context: &Context,
    conn: &ConnGuard,
    addr: &Address,
    initial_payload: &[u8],
) -> io::Result<(DecryptedReader<OwnedReadHalf>, EncryptedWriter<OwnedWriteHalf>)> {
    let config = context.config();

    conn.set_state(ConnState::Connecting);
    conn.set_target(addr);

    let remote = connect_proxy_server(context).await?;
    let (svr_r, mut svr_w) = split_crypto(
        remote,
        config.method,
        config.method.bytes_to_key(config.password.as_bytes()),
    )?;

    let mut buf = BytesMut::with_capacity(addr.serialized_len() + initial_payload.len());
    addr.write_to_buf(&mut buf);
    buf.put_slice(initial_payload);
    try_timeout(svr_w.write_all(&buf), config.connect_timeout).await?;

    Ok((svr_r, svr_w))
}
