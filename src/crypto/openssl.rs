//! Ciphers backed by OpenSSL's EVP interface

use openssl::symm::{self, Crypter, Mode};

use crate::crypto::cipher::{CipherResult, CipherType, Error};
use crate::crypto::stream::StreamCipher;
use crate::crypto::CryptoMode;

/// AES in CFB mode, driven incrementally as a stream
pub struct OpenSSLCipher {
    crypter: Crypter,
    block_size: usize,
}

impl OpenSSLCipher {
    pub fn new(t: CipherType, key: &[u8], iv: &[u8], mode: CryptoMode) -> CipherResult<OpenSSLCipher> {
        let cipher = match t {
            CipherType::Aes256Cfb => symm::Cipher::aes_256_cfb128(),
            _ => return Err(Error::UnknownCipherType(t.name().to_owned())),
        };

        let mode = match mode {
            CryptoMode::Encrypt => Mode::Encrypt,
            CryptoMode::Decrypt => Mode::Decrypt,
        };

        let mut crypter = Crypter::new(cipher, mode, key, Some(iv))?;
        // CFB at block-size segments never pads
        crypter.pad(false);

        Ok(OpenSSLCipher {
            crypter,
            block_size: cipher.block_size(),
        })
    }
}

impl StreamCipher for OpenSSLCipher {
    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> CipherResult<()> {
        let orig_len = out.len();
        out.resize(orig_len + data.len() + self.block_size, 0);
        let n = self.crypter.update(data, &mut out[orig_len..])?;
        out.truncate(orig_len + n);
        Ok(())
    }

    fn finalize(&mut self, _out: &mut Vec<u8>) -> CipherResult<()> {
        // stream mode holds nothing back
        Ok(())
    }
}
