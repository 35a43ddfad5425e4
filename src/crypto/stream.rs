//! Stream ciphers

use crate::crypto::cipher::{CipherResult, CipherType};
use crate::crypto::openssl::OpenSSLCipher;
use crate::crypto::table::TableCipher;
use crate::crypto::CryptoMode;

/// Basic operation of a symmetric stream cipher.
///
/// `update` may be called any number of times with arbitrary-length chunks,
/// as long as the byte order of the stream is preserved. `finalize` flushes
/// whatever the backend buffers; for the ciphers here it emits nothing.
pub trait StreamCipher {
    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> CipherResult<()>;
    fn finalize(&mut self, out: &mut Vec<u8>) -> CipherResult<()>;
}

macro_rules! define_stream_ciphers {
    ($($name:ident => $cipher:ty,)+) => {
        /// Variant cipher which contains all possible ciphers
        pub enum StreamCipherVariant {
            $(
                $name($cipher),
            )+
        }

        impl StreamCipherVariant {
            /// Creates from an actual cipher
            pub fn new<C>(cipher: C) -> StreamCipherVariant
                where StreamCipherVariant: From<C>
            {
                From::from(cipher)
            }
        }

        impl StreamCipher for StreamCipherVariant {
            fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> CipherResult<()> {
                match *self {
                    $(
                        StreamCipherVariant::$name(ref mut cipher) => cipher.update(data, out),
                    )+
                }
            }

            fn finalize(&mut self, out: &mut Vec<u8>) -> CipherResult<()> {
                match *self {
                    $(
                        StreamCipherVariant::$name(ref mut cipher) => cipher.finalize(out),
                    )+
                }
            }
        }

        $(
            impl From<$cipher> for StreamCipherVariant {
                fn from(cipher: $cipher) -> StreamCipherVariant {
                    StreamCipherVariant::$name(cipher)
                }
            }
        )+
    }
}

define_stream_ciphers! {
    TableCipher => TableCipher,
    OpenSSLCipher => OpenSSLCipher,
}

/// Generate a specific cipher with key and initialization vector
pub fn new_stream(t: CipherType, key: &[u8], iv: &[u8], mode: CryptoMode) -> CipherResult<StreamCipherVariant> {
    match t {
        CipherType::Table => Ok(StreamCipherVariant::new(TableCipher::new(key, mode))),
        CipherType::Aes256Cfb => Ok(StreamCipherVariant::new(OpenSSLCipher::new(t, key, iv, mode)?)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip_streamed(t: CipherType) {
        let message = b"the quick brown fox jumps over the lazy dog, twice over";
        let key = t.bytes_to_key(b"barfoo!");
        let iv = t.gen_init_vec();

        let mut enc = new_stream(t, &key, &iv, CryptoMode::Encrypt).unwrap();
        let mut ciphertext = Vec::new();
        // feed in deliberately uneven chunks
        for chunk in message.chunks(7) {
            enc.update(chunk, &mut ciphertext).unwrap();
        }
        enc.finalize(&mut ciphertext).unwrap();
        assert_eq!(ciphertext.len(), message.len());
        assert_ne!(&ciphertext[..], &message[..]);

        let mut dec = new_stream(t, &key, &iv, CryptoMode::Decrypt).unwrap();
        let mut plaintext = Vec::new();
        for chunk in ciphertext.chunks(13) {
            dec.update(chunk, &mut plaintext).unwrap();
        }
        dec.finalize(&mut plaintext).unwrap();
        assert_eq!(&plaintext[..], &message[..]);
    }

    #[test]
    fn aes_256_cfb_round_trip() {
        round_trip_streamed(CipherType::Aes256Cfb);
    }

    #[test]
    fn table_round_trip() {
        round_trip_streamed(CipherType::Table);
    }

    #[test]
    fn different_passwords_disagree() {
        let t = CipherType::Aes256Cfb;
        let iv = t.gen_init_vec();
        let mut enc = new_stream(t, &t.bytes_to_key(b"password-a"), &iv, CryptoMode::Encrypt).unwrap();
        let mut dec = new_stream(t, &t.bytes_to_key(b"password-b"), &iv, CryptoMode::Decrypt).unwrap();

        let mut ciphertext = Vec::new();
        enc.update(b"plaintext payload", &mut ciphertext).unwrap();
        let mut garbled = Vec::new();
        dec.update(&ciphertext, &mut garbled).unwrap();
        assert_ne!(&garbled[..], b"plaintext payload");
    }
}
