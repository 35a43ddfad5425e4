//! The legacy byte-permutation "cipher"
//!
//! A 256-entry substitution table seeded from the MD5 of the password,
//! compatible with the original deployments. It offers no real
//! confidentiality and exists purely as an interop shim.

use md5::{Digest, Md5};

use crate::crypto::cipher::CipherResult;
use crate::crypto::stream::StreamCipher;
use crate::crypto::CryptoMode;

pub struct TableCipher {
    table: [u8; 256],
}

impl TableCipher {
    pub fn new(key: &[u8], mode: CryptoMode) -> TableCipher {
        let digest = Md5::digest(key);

        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let seed = u64::from_le_bytes(seed_bytes);

        // The historical table construction: 1023 rounds of a stable sort
        // keyed on `seed % (x + i)`.
        let mut table: Vec<u64> = (0..256).collect();
        for i in 1..1024 {
            table.sort_by_key(|&x| seed % (x + i));
        }

        let mut enc = [0u8; 256];
        for (i, &x) in table.iter().enumerate() {
            enc[i] = x as u8;
        }

        let table = match mode {
            CryptoMode::Encrypt => enc,
            CryptoMode::Decrypt => {
                let mut dec = [0u8; 256];
                for (i, &x) in enc.iter().enumerate() {
                    dec[x as usize] = i as u8;
                }
                dec
            }
        };

        TableCipher { table }
    }
}

impl StreamCipher for TableCipher {
    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> CipherResult<()> {
        out.reserve(data.len());
        for &b in data {
            out.push(self.table[b as usize]);
        }
        Ok(())
    }

    fn finalize(&mut self, _out: &mut Vec<u8>) -> CipherResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_is_a_permutation() {
        let cipher = TableCipher::new(b"keykeykey", CryptoMode::Encrypt);
        let mut seen = [false; 256];
        for &b in cipher.table.iter() {
            assert!(!seen[b as usize]);
            seen[b as usize] = true;
        }
    }

    #[test]
    fn encrypt_then_decrypt_restores_input() {
        let mut enc = TableCipher::new(b"barfoo!", CryptoMode::Encrypt);
        let mut dec = TableCipher::new(b"barfoo!", CryptoMode::Decrypt);

        let message = b"hello world, this is a table cipher test";
        let mut ciphertext = Vec::new();
        enc.update(message, &mut ciphertext).unwrap();
        assert_ne!(&ciphertext[..], &message[..]);

        let mut plaintext = Vec::new();
        dec.update(&ciphertext, &mut plaintext).unwrap();
        assert_eq!(&plaintext[..], &message[..]);
    }
}
