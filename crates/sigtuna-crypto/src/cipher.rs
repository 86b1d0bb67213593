#![forbid(unsafe_code)]

//! Block cipher implementations (AES-CBC, 3DES-CBC).
//!
//! The primitives take an explicit IV and return bare ciphertext; the
//! XML-Enc wire format (`IV ‖ ciphertext`, Base64-encoded) is assembled
//! by the cipher façade, which owns IV generation and splitting.
//! Padding follows the XML Encryption rule: the last byte is the pad
//! length, filler bytes are arbitrary (compatible with both PKCS#7 and
//! ISO 10126 producers).

use sigtuna_core::{algorithm, Error, Result};

/// A block cipher with explicit IV handling.
pub trait BlockCipher: Send {
    fn uri(&self) -> &'static str;
    /// Cipher block size in bytes; also the IV length.
    fn block_size(&self) -> usize;
    /// Expected key length in bytes.
    fn key_size(&self) -> usize;
    /// Encrypt; output length is a padded multiple of the block size.
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Decrypt and strip padding.
    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Create a block cipher from its URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn BlockCipher>> {
    match uri {
        algorithm::AES128_CBC => Ok(Box::new(AesCbc {
            key_size: 16,
            uri: algorithm::AES128_CBC,
        })),
        algorithm::AES192_CBC => Ok(Box::new(AesCbc {
            key_size: 24,
            uri: algorithm::AES192_CBC,
        })),
        algorithm::AES256_CBC => Ok(Box::new(AesCbc {
            key_size: 32,
            uri: algorithm::AES256_CBC,
        })),
        algorithm::TRIPLEDES_CBC => Ok(Box::new(TripleDesCbc)),
        _ => Err(Error::UnsupportedAlgorithm(format!("cipher: {uri}"))),
    }
}

/// Key length in bytes for a block cipher or key-wrap URI; 0 if the
/// URI does not imply a symmetric key length.
pub fn key_length_for_uri(uri: &str) -> usize {
    match uri {
        algorithm::AES128_CBC | algorithm::KW_AES128 => 16,
        algorithm::AES192_CBC | algorithm::KW_AES192 => 24,
        algorithm::AES256_CBC | algorithm::KW_AES256 => 32,
        algorithm::TRIPLEDES_CBC | algorithm::KW_TRIPLEDES => 24,
        _ => 0,
    }
}

// ── AES-CBC ──────────────────────────────────────────────────────────

struct AesCbc {
    key_size: usize,
    uri: &'static str,
}

impl BlockCipher for AesCbc {
    fn uri(&self) -> &'static str {
        self.uri
    }
    fn block_size(&self) -> usize {
        16
    }
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use cbc::cipher::{BlockEncryptMut, KeyIvInit};

        check_key(key.len(), self.key_size)?;
        check_iv(iv.len(), 16)?;

        let mut buf = pad(plaintext, 16);
        let buf_len = buf.len();

        macro_rules! do_encrypt {
            ($aes:ty) => {{
                let enc = cbc::Encryptor::<$aes>::new_from_slices(key, iv)
                    .map_err(|e| Error::Encryption(format!("AES-CBC init: {e}")))?;
                enc.encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, buf_len)
                    .map_err(|e| Error::Encryption(format!("AES-CBC encrypt: {e}")))?;
            }};
        }
        match self.key_size {
            16 => do_encrypt!(aes::Aes128),
            24 => do_encrypt!(aes::Aes192),
            32 => do_encrypt!(aes::Aes256),
            _ => return Err(Error::Encryption("unsupported AES key size".into())),
        }
        Ok(buf)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use cbc::cipher::{BlockDecryptMut, KeyIvInit};

        check_key(key.len(), self.key_size)?;
        check_iv(iv.len(), 16)?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(Error::Encryption("AES-CBC ciphertext length invalid".into()));
        }

        let mut buf = ciphertext.to_vec();
        macro_rules! do_decrypt {
            ($aes:ty) => {{
                let dec = cbc::Decryptor::<$aes>::new_from_slices(key, iv)
                    .map_err(|e| Error::Encryption(format!("AES-CBC init: {e}")))?;
                dec.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
                    .map_err(|e| Error::Encryption(format!("AES-CBC decrypt: {e}")))?;
            }};
        }
        match self.key_size {
            16 => do_decrypt!(aes::Aes128),
            24 => do_decrypt!(aes::Aes192),
            32 => do_decrypt!(aes::Aes256),
            _ => return Err(Error::Encryption("unsupported AES key size".into())),
        }
        unpad(&buf, 16)
    }
}

// ── 3DES-CBC ─────────────────────────────────────────────────────────

struct TripleDesCbc;

impl BlockCipher for TripleDesCbc {
    fn uri(&self) -> &'static str {
        algorithm::TRIPLEDES_CBC
    }
    fn block_size(&self) -> usize {
        8
    }
    fn key_size(&self) -> usize {
        24
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use cbc::cipher::{BlockEncryptMut, KeyIvInit};

        check_key(key.len(), 24)?;
        check_iv(iv.len(), 8)?;

        let mut buf = pad(plaintext, 8);
        let buf_len = buf.len();
        let enc = cbc::Encryptor::<des::TdesEde3>::new_from_slices(key, iv)
            .map_err(|e| Error::Encryption(format!("3DES init: {e}")))?;
        enc.encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, buf_len)
            .map_err(|e| Error::Encryption(format!("3DES encrypt: {e}")))?;
        Ok(buf)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use cbc::cipher::{BlockDecryptMut, KeyIvInit};

        check_key(key.len(), 24)?;
        check_iv(iv.len(), 8)?;
        if ciphertext.is_empty() || ciphertext.len() % 8 != 0 {
            return Err(Error::Encryption("3DES ciphertext length invalid".into()));
        }

        let mut buf = ciphertext.to_vec();
        let dec = cbc::Decryptor::<des::TdesEde3>::new_from_slices(key, iv)
            .map_err(|e| Error::Encryption(format!("3DES init: {e}")))?;
        dec.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
            .map_err(|e| Error::Encryption(format!("3DES decrypt: {e}")))?;
        unpad(&buf, 8)
    }
}

fn check_key(got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::InvalidInput(format!(
            "expected {want} byte key, got {got}"
        )));
    }
    Ok(())
}

fn check_iv(got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::InvalidInput(format!(
            "expected {want} byte IV, got {got}"
        )));
    }
    Ok(())
}

fn pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let pad_len = block_size - (data.len() % block_size);
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    padded
}

/// Strip XML Encryption padding: the last byte is the pad length,
/// filler bytes are not checked (accepts PKCS#7 and ISO 10126).
fn unpad(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let pad_len = *data.last().unwrap() as usize;
    if pad_len == 0 || pad_len > block_size || pad_len > data.len() {
        return Err(Error::Encryption("invalid padding".into()));
    }
    Ok(data[..data.len() - pad_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 3 + 1) as u8).collect()
    }

    #[test]
    fn padding_round_trip() {
        let padded = pad(b"hello", 16);
        assert_eq!(padded.len(), 16);
        assert_eq!(unpad(&padded, 16).unwrap(), b"hello");
    }

    #[test]
    fn iso10126_style_padding_accepted() {
        let mut data = b"hello world!".to_vec();
        data.extend_from_slice(&[0xAB, 0xCD, 0xEF, 0x04]);
        assert_eq!(unpad(&data, 16).unwrap(), b"hello world!");
    }

    #[test]
    fn block_aligned_input_gains_a_block() {
        let padded = pad(b"Exactly16bytes!!", 16);
        assert_eq!(padded.len(), 32);
        assert_eq!(unpad(&padded, 16).unwrap(), b"Exactly16bytes!!");
    }

    #[test]
    fn aes_cbc_round_trip_all_sizes() {
        let cases: &[(&str, usize)] = &[
            (algorithm::AES128_CBC, 16),
            (algorithm::AES192_CBC, 24),
            (algorithm::AES256_CBC, 32),
        ];
        let plaintexts: &[&[u8]] = &[
            b"A",
            b"Hello, World!",
            b"Exactly16bytes!!",
            b"This is a much longer test message that spans multiple AES blocks.",
        ];
        for &(uri, key_size) in cases {
            let key: Vec<u8> = (0..key_size).map(|i| i as u8).collect();
            let cipher = from_uri(uri).unwrap();
            assert_eq!(cipher.key_size(), key_size);
            assert_eq!(cipher.block_size(), 16);
            for &pt in plaintexts {
                let iv = iv_of(16);
                let ct = cipher.encrypt(&key, &iv, pt).unwrap();
                assert_eq!(ct.len() % 16, 0);
                let back = cipher.decrypt(&key, &iv, &ct).unwrap();
                assert_eq!(back, pt, "round trip failed for {uri}");
            }
        }
    }

    #[test]
    fn tripledes_round_trip() {
        let key = [0x42u8; 24];
        let cipher = from_uri(algorithm::TRIPLEDES_CBC).unwrap();
        assert_eq!(cipher.block_size(), 8);
        let iv = iv_of(8);
        let ct = cipher.encrypt(&key, &iv, b"test data").unwrap();
        assert_eq!(cipher.decrypt(&key, &iv, &ct).unwrap(), b"test data");
    }

    #[test]
    fn wrong_key_size_rejected() {
        let cipher = from_uri(algorithm::AES128_CBC).unwrap();
        assert!(cipher.encrypt(&[0u8; 15], &iv_of(16), b"x").is_err());
    }

    #[test]
    fn unknown_cipher_uri_rejected() {
        assert!(from_uri("http://example.com/fake-cipher").is_err());
    }
}
