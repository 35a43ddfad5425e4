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

//! SOCKS5 relay running on the local side

use std::io;

use tokio::net::{TcpListener, TcpStream};

use crate::context::SharedContext;
use crate::relay::flow::ConnGuard;
use crate::relay::socks5::{
    self, Address, Command, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader, TcpResponseHeader,
    SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
};
use crate::relay::tcprelay::{open_tunnel, relay, try_timeout};

async fn handshake(stream: &mut TcpStream) -> io::Result<()> {
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let request = HandshakeRequest::read_from(stream).await?;

    if !request.methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        HandshakeResponse::new(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE)
            .write_to(stream)
            .await?;
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "client offered no acceptable auth method, only no-auth is supported",
        ));
    }

    HandshakeResponse::new(SOCKS5_AUTH_METHOD_NONE).write_to(stream).await?;
    Ok(())
}

/// Runs the SOCKS5 conversation up to the point where the destination is
/// known and the success reply has been written
async fn negotiate(stream: &mut TcpStream) -> io::Result<Address> {
    handshake(stream).await?;

    let header = match TcpRequestHeader::read_from(stream).await {
        Ok(h) => h,
        Err(err) => {
            let _ = TcpResponseHeader::new(err.reply, socks5::unspecified_bind_addr())
                .write_to(stream)
                .await;
            return Err(err.into());
        }
    };

    match header.command {
        Command::TcpConnect => {
            // The bound address in the reply is all zeroes: the real egress
            // socket lives on the remote side and is not disclosed.
            TcpResponseHeader::new(Reply::Succeeded, socks5::unspecified_bind_addr())
                .write_to(stream)
                .await?;
            Ok(header.address)
        }
        cmd => {
            warn!("unsupported command {:?}", cmd);
            let _ = TcpResponseHeader::new(Reply::CommandNotSupported, socks5::unspecified_bind_addr())
                .write_to(stream)
                .await;
            Err(socks5::Error::new(Reply::CommandNotSupported, "command not supported").into())
        }
    }
}

async fn handle_client(context: SharedContext, mut stream: TcpStream, conn: ConnGuard) -> io::Result<()> {
    let config = context.config();

    let addr = try_timeout(negotiate(&mut stream), config.connect_timeout).await?;
    info!("CONNECT {}", addr);

    let (mut svr_r, mut svr_w) = open_tunnel(&context, &conn, &addr, &[]).await?;

    let (mut client_r, mut client_w) = stream.into_split();
    relay(&mut client_r, &mut client_w, &mut svr_r, &mut svr_w, &conn, config.timeout).await
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
                // cap reached, drop without a reply
                warn!("connection limit reached, dropping {}", peer_addr);
                continue;
            }
        };

        trace!("got connection {} from {}", conn.id(), peer_addr);
        let _ = stream.set_nodelay(true);

        let context = context.clone();
        tokio::spawn(async move {
            match crate::relay::until_shutdown(handle_client(context, stream, conn)).await {
                Some(Ok(())) => trace!("client {} finished", peer_addr),
                Some(Err(err)) => match err.kind() {
                    io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut => {
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

/// Binds the SOCKS5 listener and serves until shutdown
pub async fn run(context: SharedContext) -> io::Result<()> {
    let local_addr = context.config().local_addr();

    let listener = TcpListener::bind(local_addr.as_str()).await.map_err(|err| {
        error!("failed to listen on {}: {}", local_addr, err);
        err
    })?;

    info!("jumptiger SOCKS5 listening on {}", local_addr);

    match crate::relay::until_shutdown(accept_loop(context, listener)).await {
        Some(result) => result,
        None => {
            info!("SOCKS5 listener on {} stopped", local_addr);
            Ok(())
        }
    }
}
