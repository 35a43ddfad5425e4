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

//! SOCKS5 protocol definition (RFC 1928)
//!
//! Only the `CONNECT` command with the no-auth method is supported. The
//! [`Address`] type doubles as the binary destination header sent through the
//! tunnel ahead of the first payload bytes.

use std::error;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_METHOD_GSSAPI: u8 = 0x01;
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// CONNECT
    TcpConnect,
    /// BIND
    TcpBind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl Command {
    fn from_u8(code: u8) -> Option<Command> {
        match code {
            SOCKS5_CMD_TCP_CONNECT => Some(Command::TcpConnect),
            SOCKS5_CMD_TCP_BIND => Some(Command::TcpBind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    OtherReply(u8),
}

impl Reply {
    fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded => SOCKS5_REPLY_SUCCEEDED,
            Reply::GeneralFailure => SOCKS5_REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed => SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable => SOCKS5_REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable => SOCKS5_REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired => SOCKS5_REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported => SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::OtherReply(c) => c,
        }
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Reply::Succeeded => write!(f, "Succeeded"),
            Reply::GeneralFailure => write!(f, "General failure"),
            Reply::ConnectionNotAllowed => write!(f, "Connection not allowed"),
            Reply::NetworkUnreachable => write!(f, "Network unreachable"),
            Reply::HostUnreachable => write!(f, "Host unreachable"),
            Reply::ConnectionRefused => write!(f, "Connection refused"),
            Reply::TtlExpired => write!(f, "TTL expired"),
            Reply::CommandNotSupported => write!(f, "Command not supported"),
            Reply::AddressTypeNotSupported => write!(f, "Address type not supported"),
            Reply::OtherReply(c) => write!(f, "Other reply ({})", c),
        }
    }
}

/// SOCKS5 protocol error, carrying the reply code sent back to the client
pub struct Error {
    pub reply: Reply,
    pub message: String,
}

impl Error {
    pub fn new<S: Into<String>>(reply: Reply, message: S) -> Error {
        Error {
            reply,
            message: message.into(),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new(Reply::GeneralFailure, err.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err.message)
    }
}

/// A destination address, either a socket address or a hostname with port.
///
/// On the wire: `ATYP (1B) | addr (var) | port (2B BE)`, where ATYP 0x01 is
/// 4 bytes of IPv4, 0x03 is a length-prefixed hostname and 0x04 is 16 bytes
/// of IPv6. The same encoding is used in the SOCKS5 request and as the
/// tunnel's destination header.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Parses an address (ATYP, addr, port) from the stream
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut addr_type_buf = [0u8; 1];
        stream.read_exact(&mut addr_type_buf).await?;

        match addr_type_buf[0] {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;
                let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = BigEndian::read_u16(&buf[4..]);
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;
                let addr = Ipv6Addr::new(
                    BigEndian::read_u16(&buf[0..]),
                    BigEndian::read_u16(&buf[2..]),
                    BigEndian::read_u16(&buf[4..]),
                    BigEndian::read_u16(&buf[6..]),
                    BigEndian::read_u16(&buf[8..]),
                    BigEndian::read_u16(&buf[10..]),
                    BigEndian::read_u16(&buf[12..]),
                    BigEndian::read_u16(&buf[14..]),
                );
                let port = BigEndian::read_u16(&buf[16..]);
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let mut length_buf = [0u8; 1];
                stream.read_exact(&mut length_buf).await?;
                let length = length_buf[0] as usize;
                if length == 0 {
                    return Err(Error::new(Reply::AddressTypeNotSupported, "zero-length domain name"));
                }

                let mut raw_addr = vec![0u8; length + 2];
                stream.read_exact(&mut raw_addr).await?;
                let port = BigEndian::read_u16(&raw_addr[length..]);
                raw_addr.truncate(length);

                let addr = match String::from_utf8(raw_addr) {
                    Ok(a) => a,
                    Err(..) => {
                        return Err(Error::new(Reply::GeneralFailure, "invalid utf-8 domain name"));
                    }
                };

                Ok(Address::DomainNameAddress(addr, port))
            }
            t => Err(Error::new(
                Reply::AddressTypeNotSupported,
                format!("unsupported address type {:#x}", t),
            )),
        }
    }

    /// Appends the wire encoding to `buf`
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                for seg in &addr.ip().segments() {
                    buf.put_u16(*seg);
                }
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref dname, port) => {
                assert!(dname.len() <= 255, "domain name longer than 255 bytes");
                buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dname.len() as u8);
                buf.put_slice(dname.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Length of the wire encoding in bytes
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref dname, _) => 1 + 1 + dname.len() + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(ref addr) => addr.port(),
            Address::DomainNameAddress(_, port) => port,
        }
    }

    /// Host portion as a display string, without the port
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref dname, _) => dname.clone(),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{}", addr),
            Address::DomainNameAddress(ref addr, port) => write!(f, "{}:{}", addr, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

/// Method-selection request
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 5  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub async fn read_from<R>(stream: &mut R) -> Result<HandshakeRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        let [ver, nmet] = buf;

        if ver != SOCKS5_VERSION {
            return Err(Error::new(
                Reply::GeneralFailure,
                format!("unsupported socks version {:#x}", ver),
            ));
        }

        let mut methods = vec![0u8; nmet as usize];
        stream.read_exact(&mut methods).await?;

        Ok(HandshakeRequest { methods })
    }
}

/// Method-selection reply
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(cm: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method: cm }
    }

    pub async fn write_to<W>(&self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(&[SOCKS5_VERSION, self.chosen_method]).await
    }
}

/// Request header after method selection
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub async fn read_from<R>(stream: &mut R) -> Result<TcpRequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await?;

        let [ver, cmd, _rsv] = buf;
        if ver != SOCKS5_VERSION {
            return Err(Error::new(
                Reply::GeneralFailure,
                format!("unsupported socks version {:#x}", ver),
            ));
        }

        let command = match Command::from_u8(cmd) {
            Some(c) => c,
            None => {
                return Err(Error::new(
                    Reply::CommandNotSupported,
                    format!("unsupported command {:#x}", cmd),
                ));
            }
        };

        let address = Address::read_from(stream).await?;
        Ok(TcpRequestHeader { command, address })
    }
}

/// Response header
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    pub async fn write_to<W>(&self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_u8(SOCKS5_VERSION);
        buf.put_u8(self.reply.as_u8());
        buf.put_u8(0x00);
        self.address.write_to_buf(&mut buf);
        stream.write_all(&buf).await
    }
}

/// The all-zero bound address sent in successful replies; the real egress
/// address lives on the remote side and is not disclosed to clients.
pub fn unspecified_bind_addr() -> Address {
    Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
}
