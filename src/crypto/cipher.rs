//! Cipher types and key material

use std::error;
use std::fmt::{self, Display};
use std::str::FromStr;

use bytes::Bytes;
use openssl::error::ErrorStack;
use openssl::sha;
use rand::rngs::OsRng;
use rand::RngCore;

/// Cipher methods the tunnel supports.
///
/// `Table` is a non-cryptographic byte permutation kept only for
/// interoperability with legacy deployments; configuration refuses it unless
/// explicitly enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherType {
    Table,
    Aes256Cfb,
}

const CIPHER_TABLE: &str = "table";
const CIPHER_AES_256_CFB: &str = "aes-256-cfb";

#[derive(Debug)]
pub enum Error {
    UnknownCipherType(String),
    OpenSSLError(ErrorStack),
}

pub type CipherResult<T> = Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::UnknownCipherType(ref name) => write!(f, "unknown cipher type `{}`", name),
            Error::OpenSSLError(ref err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for Error {}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Error {
        Error::OpenSSLError(e)
    }
}

impl CipherType {
    /// Symmetric key length in bytes
    pub fn key_size(self) -> usize {
        match self {
            CipherType::Table => 0,
            CipherType::Aes256Cfb => 32,
        }
    }

    /// Initialization vector length in bytes
    pub fn iv_size(self) -> usize {
        match self {
            CipherType::Table => 0,
            CipherType::Aes256Cfb => 16,
        }
    }

    /// Derives the symmetric key from the shared password.
    ///
    /// AES keys are `SHA256(password)`. The table cipher seeds its
    /// permutation from the raw password bytes itself.
    pub fn bytes_to_key(self, password: &[u8]) -> Bytes {
        match self {
            CipherType::Table => Bytes::copy_from_slice(password),
            CipherType::Aes256Cfb => Bytes::copy_from_slice(&sha::sha256(password)),
        }
    }

    /// Generates a random initialization vector of `iv_size()` bytes
    pub fn gen_init_vec(self) -> Bytes {
        let mut iv = vec![0u8; self.iv_size()];
        if !iv.is_empty() {
            OsRng.fill_bytes(&mut iv);
        }
        Bytes::from(iv)
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherType::Table => CIPHER_TABLE,
            CipherType::Aes256Cfb => CIPHER_AES_256_CFB,
        }
    }
}

impl FromStr for CipherType {
    type Err = Error;

    fn from_str(s: &str) -> Result<CipherType, Error> {
        match s {
            CIPHER_TABLE => Ok(CipherType::Table),
            CIPHER_AES_256_CFB => Ok(CipherType::Aes256Cfb),
            _ => Err(Error::UnknownCipherType(s.to_owned())),
        }
    }
}

impl Display for CipherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aes_key_is_sha256_of_password() {
        let key = CipherType::Aes256Cfb.bytes_to_key(b"barfoo!");
        assert_eq!(key.len(), 32);
        // same password, same key
        assert_eq!(key, CipherType::Aes256Cfb.bytes_to_key(b"barfoo!"));
        assert_ne!(key, CipherType::Aes256Cfb.bytes_to_key(b"barfoo?"));
    }

    #[test]
    fn init_vec_sizes() {
        assert_eq!(CipherType::Aes256Cfb.gen_init_vec().len(), 16);
        assert_eq!(CipherType::Table.gen_init_vec().len(), 0);
    }

    #[test]
    fn method_names_round_trip() {
        for t in &[CipherType::Table, CipherType::Aes256Cfb] {
            assert_eq!(t.name().parse::<CipherType>().unwrap(), *t);
        }
        assert!("rot13".parse::<CipherType>().is_err());
    }
}
