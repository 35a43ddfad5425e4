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

//! TCP relay running on the remote side
//!
//! Each accepted tunnel carries the peer IV, then one encrypted destination
//! header, then raw payload. The only authentication is decryptability: a
//! header that does not parse is the rejection signal, answered by closing
//! the socket without a reply.

use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpStream};

use crate::context::{Context, SharedContext};
use crate::relay::flow::{ConnGuard, ConnState};
use crate::relay::socks5::Address;
use crate::relay::tcprelay::crypto_io::split_crypto;
use crate::relay::tcprelay::{relay, try_timeout};

/// Resolves the destination, skipping addresses on the deny-list
async fn resolve_target(context: &Context, addr: &Address) -> io::Result<SocketAddr> {
    let config = context.config();

    match *addr {
        Address::SocketAddress(sa) => {
            if config.forbidden_ip.contains(&sa.ip()) {
                info!("{} is forbidden", sa.ip());
                return Err(io::Error::new(io::ErrorKind::Other, "destination is forbidden"));
            }
            Ok(sa)
        }
        Address::DomainNameAddress(ref dname, port) => {
            let addrs = lookup_host((dname.as_str(), port)).await?;
            let mut resolved_any = false;
            for sa in addrs {
                resolved_any = true;
                if config.forbidden_ip.contains(&sa.ip()) {
                    info!("{} ({}) is forbidden", sa.ip(), dname);
                    continue;
                }
                trace!("resolved {} as {}", dname, sa);
                return Ok(sa);
            }
            let msg = if resolved_any {
                "destination resolved only to forbidden addresses"
            } else {
                "failed to resolve destination"
            };
            Err(io::Error::new(io::ErrorKind::Other, msg))
        }
    }
}

async fn connect_target(context: &Context, addr: &Address) -> io::Result<TcpStream> {
    let target = resolve_target(context, addr).await?;
    let stream = try_timeout(TcpStream::connect(target), context.config().connect_timeout).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn handle_client(context: SharedContext, stream: TcpStream, conn: ConnGuard) -> io::Result<()> {
    let config = context.config();
    let _ = stream.set_nodelay(true);

    let (mut tun_r, mut tun_w) = split_crypto(
        stream,
        config.method,
        config.method.bytes_to_key(config.password.as_bytes()),
    )?;

    // Reading the header drives the IV consumption underneath. A wrong
    // password surfaces right here as a garbled header.
    let addr = match try_timeout(
        async { Address::read_from(&mut tun_r).await.map_err(From::from) },
        config.connect_timeout,
    )
    .await
    {
        Ok(addr) => addr,
        Err(err) => {
            warn!("invalid destination header from {}: {}", conn.client_addr(), err);
            return Err(err);
        }
    };

    conn.set_state(ConnState::Connecting);
    conn.set_target(&addr);
    info!("connecting {}", addr);

    // No reply on failure either way; the peer observes EOF
    let origin = connect_target(&context, &addr).await?;

    let (mut origin_r, mut origin_w) = origin.into_split();
    relay(&mut tun_r, &mut tun_w, &mut origin_r, &mut origin_w, &conn, config.timeout).await
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

        trace!("got tunnel {} from {}", conn.id(), peer_addr);

        let context = context.clone();
        tokio::spawn(async move {
            match crate::relay::until_shutdown(handle_client(context, stream, conn)).await {
                Some(Ok(())) => trace!("tunnel {} finished", peer_addr),
                Some(Err(err)) => match err.kind() {
                    io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut => {
                        debug!("tunnel {}: {}", peer_addr, err);
                    }
                    _ => {
                        error!("failed to handle tunnel {}: {}", peer_addr, err);
                    }
                },
                None => trace!("tunnel {} cancelled by shutdown", peer_addr),
            }
        });
    }
}

/// Binds the tunnel listener and serves until shutdown
pub async fn run(context: SharedContext) -> io::Result<()> {
    let listen_addr = context.config().server_addr();

    let listener = TcpListener::bind(listen_addr.as_str()).await.map_err(|err| {
        error!("failed to listen on {}: {}", listen_addr, err);
        err
    })?;

    info!("jumptiger server listening on {}", listen_addr);

    match crate::relay::until_shutdown(accept_loop(context, listener)).await {
        Some(result) => result,
        None => {
            info!("server listener on {} stopped", listen_addr);
            Ok(())
        }
    }
}
