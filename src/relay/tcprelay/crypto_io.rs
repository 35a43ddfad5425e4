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

//! Cipher-framed reader and writer halves of a tunnel stream
//!
//! The first `iv_size()` bytes in each direction are the plaintext IV; the
//! rest of the direction is one continuous cipher stream with no framing and
//! no MAC. [`EncryptedWriter`] prepends its IV to the first chunk it sends,
//! [`DecryptedReader`] withholds data from the caller until the peer IV has
//! been consumed. Once the IVs have flowed, the pair behaves as a transparent
//! byte-for-byte duplex.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::crypto::cipher::{self, CipherType};
use crate::crypto::{new_stream, CryptoMode, StreamCipher, StreamCipherVariant};

fn cipher_to_io_error(err: cipher::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Splits a tunnel socket into cipher-framed halves.
///
/// The two directions use independent cipher states keyed from the same
/// password-derived key but separate IVs, so the halves share nothing.
pub fn split_crypto(
    stream: TcpStream,
    method: CipherType,
    key: Bytes,
) -> io::Result<(DecryptedReader<OwnedReadHalf>, EncryptedWriter<OwnedWriteHalf>)> {
    let (r, w) = stream.into_split();
    let reader = DecryptedReader::new(r, method, key.clone())?;
    let writer = EncryptedWriter::new(w, method, key)?;
    Ok((reader, writer))
}

/// Reader half: consumes the peer IV, then decrypts every chunk in order
pub struct DecryptedReader<R> {
    stream: R,
    method: CipherType,
    key: Bytes,
    cipher: Option<StreamCipherVariant>,
    iv_buf: Vec<u8>,
    iv_got: usize,
}

impl<R> DecryptedReader<R> {
    pub fn new(stream: R, method: CipherType, key: Bytes) -> io::Result<DecryptedReader<R>> {
        let cipher = if method.iv_size() == 0 {
            Some(new_stream(method, &key, &[], CryptoMode::Decrypt).map_err(cipher_to_io_error)?)
        } else {
            None
        };

        Ok(DecryptedReader {
            stream,
            method,
            key,
            cipher,
            iv_buf: vec![0u8; method.iv_size()],
            iv_got: 0,
        })
    }
}

impl<R> AsyncRead for DecryptedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        while this.cipher.is_none() {
            let iv_len = this.method.iv_size();
            let n = ready!(Pin::new(&mut this.stream).poll_read(cx, &mut this.iv_buf[this.iv_got..iv_len]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before the full IV arrived",
                )));
            }
            this.iv_got += n;
            if this.iv_got == iv_len {
                let cipher = new_stream(this.method, &this.key, &this.iv_buf[..iv_len], CryptoMode::Decrypt)
                    .map_err(cipher_to_io_error)?;
                this.cipher = Some(cipher);
            }
        }

        let n = ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;
        if n == 0 {
            return Poll::Ready(Ok(0));
        }

        let cipher = match this.cipher {
            Some(ref mut c) => c,
            None => unreachable!("decryptor initialized above"),
        };

        // stream ciphers emit exactly as many bytes as they consume
        let mut out = Vec::with_capacity(n);
        cipher.update(&buf[..n], &mut out).map_err(cipher_to_io_error)?;
        buf[..out.len()].copy_from_slice(&out);
        Poll::Ready(Ok(out.len()))
    }
}

/// Writer half: encrypts every chunk in order, IV prepended to the first one
pub struct EncryptedWriter<W> {
    stream: W,
    cipher: StreamCipherVariant,
    iv: Option<Bytes>,
    send_buf: BytesMut,
    sent: usize,
    accepted: usize,
}

impl<W> EncryptedWriter<W> {
    pub fn new(stream: W, method: CipherType, key: Bytes) -> io::Result<EncryptedWriter<W>> {
        let iv = method.gen_init_vec();
        let cipher = new_stream(method, &key, &iv, CryptoMode::Encrypt).map_err(cipher_to_io_error)?;

        Ok(EncryptedWriter {
            stream,
            cipher,
            iv: if iv.is_empty() { None } else { Some(iv) },
            send_buf: BytesMut::new(),
            sent: 0,
            accepted: 0,
        })
    }
}

impl<W> EncryptedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.sent < self.send_buf.len() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.send_buf[self.sent..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer closed while draining ciphertext",
                )));
            }
            self.sent += n;
        }
        self.send_buf.clear();
        self.sent = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W> AsyncWrite for EncryptedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // `accepted != 0` means a chunk is already encrypted and mid-drain;
        // callers retry with the same data after Pending, so it must not be
        // encrypted twice.
        if this.accepted == 0 {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            if let Some(iv) = this.iv.take() {
                this.send_buf.extend_from_slice(&iv);
            }
            let mut out = Vec::with_capacity(buf.len());
            this.cipher.update(buf, &mut out).map_err(cipher_to_io_error)?;
            this.send_buf.extend_from_slice(&out);
            this.accepted = buf.len();
        }

        ready!(this.poll_drain(cx))?;
        let n = this.accepted;
        this.accepted = 0;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (a, b) = futures::join!(connect, accept);
        (a.unwrap(), (b.unwrap()).0)
    }

    #[tokio::test]
    async fn iv_is_prepended_to_the_first_write() {
        let method = CipherType::Aes256Cfb;
        let key = method.bytes_to_key(b"barfoo!");
        let (a, mut b) = tcp_pair().await;

        let (_, mut writer) = split_crypto(a, method, key.clone()).unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut raw = [0u8; 21];
        b.read_exact(&mut raw).await.unwrap();

        let mut dec = new_stream(method, &key, &raw[..16], CryptoMode::Decrypt).unwrap();
        let mut plain = Vec::new();
        dec.update(&raw[16..], &mut plain).unwrap();
        assert_eq!(&plain[..], b"hello");
    }

    #[tokio::test]
    async fn round_trip_through_framed_halves() {
        let method = CipherType::Aes256Cfb;
        let key = method.bytes_to_key(b"barfoo!");
        let (a, b) = tcp_pair().await;

        let (_, mut writer) = split_crypto(a, method, key.clone()).unwrap();
        let (mut reader, _) = split_crypto(b, method, key).unwrap();

        writer.write_all(b"first chunk / ").await.unwrap();
        writer.write_all(b"second chunk").await.unwrap();

        let mut got = vec![0u8; 26];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], b"first chunk / second chunk");
    }

    #[tokio::test]
    async fn truncated_iv_is_unexpected_eof() {
        let method = CipherType::Aes256Cfb;
        let key = method.bytes_to_key(b"barfoo!");
        let (mut a, b) = tcp_pair().await;

        // 15 bytes, one short of the IV, then EOF
        a.write_all(&[0u8; 15]).await.unwrap();
        drop(a);

        let (mut reader, _) = split_crypto(b, method, key).unwrap();
        let mut buf = [0u8; 32];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn exactly_sixteen_iv_bytes_then_data_succeeds() {
        let method = CipherType::Aes256Cfb;
        let key = method.bytes_to_key(b"barfoo!");
        let (mut a, b) = tcp_pair().await;

        let iv = method.gen_init_vec();
        let mut enc = new_stream(method, &key, &iv, CryptoMode::Encrypt).unwrap();
        let mut wire = iv.to_vec();
        enc.update(b"payload", &mut wire).unwrap();
        a.write_all(&wire).await.unwrap();

        let (mut reader, _) = split_crypto(b, method, key).unwrap();
        let mut got = vec![0u8; 7];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], b"payload");
    }
}
