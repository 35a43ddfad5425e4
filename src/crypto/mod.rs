//! Cipher suite for the tunnel transport

pub use self::cipher::{CipherResult, CipherType};
pub use self::stream::{new_stream, StreamCipher, StreamCipherVariant};

pub mod cipher;
pub mod openssl;
pub mod stream;
pub mod table;

/// Direction a cipher instance is driven in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoMode {
    Encrypt,
    Decrypt,
}
