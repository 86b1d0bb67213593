#![forbid(unsafe_code)]

//! Key wrap algorithms.
//!
//! AES key wrap is RFC 3394 via the `aes-kw` crate, one enum variant
//! per KEK size.  Triple-DES key wrap is the CMS construction from
//! RFC 3217: append a SHA-1 checksum, CBC-encrypt under a random IV,
//! reverse the bytes, CBC-encrypt again under the fixed IV the RFC
//! prescribes.

use aes_kw::Kek;
use sigtuna_core::{algorithm, Error, Result};

/// A key wrap algorithm.
pub trait KeyWrapAlgorithm: Send {
    fn uri(&self) -> &'static str;
    fn kek_size(&self) -> usize;
    fn wrap(&self, kek: &[u8], key_data: &[u8]) -> Result<Vec<u8>>;
    fn unwrap(&self, kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// Create a key wrap algorithm from its URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn KeyWrapAlgorithm>> {
    match uri {
        algorithm::KW_AES128 => Ok(Box::new(AesKw::Bits128)),
        algorithm::KW_AES192 => Ok(Box::new(AesKw::Bits192)),
        algorithm::KW_AES256 => Ok(Box::new(AesKw::Bits256)),
        algorithm::KW_TRIPLEDES => Ok(Box::new(CmsTripleDesWrap)),
        _ => Err(Error::UnsupportedAlgorithm(format!("key wrap: {uri}"))),
    }
}

fn expect_kek_len(kek: &[u8], want: usize) -> Result<()> {
    if kek.len() != want {
        return Err(Error::InvalidInput(format!(
            "expected a {want} byte KEK, got {}",
            kek.len()
        )));
    }
    Ok(())
}

// ── AES key wrap (RFC 3394) ──────────────────────────────────────────

/// AES-KW integrity-check header length: wrapping always grows the key
/// data by one semiblock.
const KW_OVERHEAD: usize = 8;

#[derive(Clone, Copy)]
enum AesKw {
    Bits128,
    Bits192,
    Bits256,
}

impl AesKw {
    fn kek_len(self) -> usize {
        match self {
            AesKw::Bits128 => 16,
            AesKw::Bits192 => 24,
            AesKw::Bits256 => 32,
        }
    }
}

impl KeyWrapAlgorithm for AesKw {
    fn uri(&self) -> &'static str {
        match self {
            AesKw::Bits128 => algorithm::KW_AES128,
            AesKw::Bits192 => algorithm::KW_AES192,
            AesKw::Bits256 => algorithm::KW_AES256,
        }
    }

    fn kek_size(&self) -> usize {
        self.kek_len()
    }

    fn wrap(&self, kek: &[u8], key_data: &[u8]) -> Result<Vec<u8>> {
        expect_kek_len(kek, self.kek_len())?;
        let mut wrapped = vec![0u8; key_data.len() + KW_OVERHEAD];
        let outcome = match self {
            AesKw::Bits128 => Kek::<aes::Aes128>::new(kek.into()).wrap(key_data, &mut wrapped),
            AesKw::Bits192 => Kek::<aes::Aes192>::new(kek.into()).wrap(key_data, &mut wrapped),
            AesKw::Bits256 => Kek::<aes::Aes256>::new(kek.into()).wrap(key_data, &mut wrapped),
        };
        outcome.map_err(|e| Error::Encryption(format!("AES key wrap: {e}")))?;
        Ok(wrapped)
    }

    fn unwrap(&self, kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
        expect_kek_len(kek, self.kek_len())?;
        if wrapped.len() < 2 * KW_OVERHEAD {
            return Err(Error::Encryption("wrapped key too short".into()));
        }
        let mut key_data = vec![0u8; wrapped.len() - KW_OVERHEAD];
        let outcome = match self {
            AesKw::Bits128 => Kek::<aes::Aes128>::new(kek.into()).unwrap(wrapped, &mut key_data),
            AesKw::Bits192 => Kek::<aes::Aes192>::new(kek.into()).unwrap(wrapped, &mut key_data),
            AesKw::Bits256 => Kek::<aes::Aes256>::new(kek.into()).unwrap(wrapped, &mut key_data),
        };
        outcome.map_err(|e| Error::Encryption(format!("AES key unwrap: {e}")))?;
        Ok(key_data)
    }
}

// ── Triple-DES key wrap (RFC 3217) ───────────────────────────────────

struct CmsTripleDesWrap;

/// IV of the second CBC pass, fixed by RFC 3217 section 3.2.
const SECOND_PASS_IV: [u8; 8] = [0x4a, 0xdd, 0xa2, 0x2c, 0x79, 0xe8, 0x21, 0x05];

/// CMS key checksum: the first 8 bytes of SHA-1 over the key data.
fn cms_checksum(key_data: &[u8]) -> [u8; 8] {
    use sha1::Digest;
    let hash = sha1::Sha1::digest(key_data);
    hash[..8].try_into().expect("SHA-1 output is 20 bytes")
}

impl KeyWrapAlgorithm for CmsTripleDesWrap {
    fn uri(&self) -> &'static str {
        algorithm::KW_TRIPLEDES
    }

    fn kek_size(&self) -> usize {
        24
    }

    fn wrap(&self, kek: &[u8], key_data: &[u8]) -> Result<Vec<u8>> {
        expect_kek_len(kek, 24)?;

        let mut material = key_data.to_vec();
        material.extend_from_slice(&cms_checksum(key_data));

        use rand::RngCore;
        let mut first_iv = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut first_iv);

        let inner = des3_cbc(kek, &first_iv, &material, Direction::Encrypt)?;
        let mut outer_input = Vec::with_capacity(first_iv.len() + inner.len());
        outer_input.extend_from_slice(&first_iv);
        outer_input.extend_from_slice(&inner);
        outer_input.reverse();
        des3_cbc(kek, &SECOND_PASS_IV, &outer_input, Direction::Encrypt)
    }

    fn unwrap(&self, kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
        expect_kek_len(kek, 24)?;
        if wrapped.len() < 16 {
            return Err(Error::Encryption("3DES-wrapped key too short".into()));
        }

        let mut outer = des3_cbc(kek, &SECOND_PASS_IV, wrapped, Direction::Decrypt)?;
        outer.reverse();
        let (first_iv, inner) = outer.split_at(8);
        let first_iv: [u8; 8] = first_iv
            .try_into()
            .map_err(|_| Error::Encryption("3DES key wrap IV truncated".into()))?;
        let material = des3_cbc(kek, &first_iv, inner, Direction::Decrypt)?;

        if material.len() < 8 {
            return Err(Error::Encryption(
                "3DES key wrap material shorter than its checksum".into(),
            ));
        }
        let (key_data, tag) = material.split_at(material.len() - 8);
        if tag != cms_checksum(key_data) {
            return Err(Error::Encryption(
                "3DES key wrap checksum verification failed".into(),
            ));
        }
        Ok(key_data.to_vec())
    }
}

enum Direction {
    Encrypt,
    Decrypt,
}

/// One raw 3DES-CBC pass without padding; input must be a whole number
/// of blocks.
fn des3_cbc(key: &[u8], iv: &[u8; 8], data: &[u8], direction: Direction) -> Result<Vec<u8>> {
    use cbc::cipher::block_padding::NoPadding;
    use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

    if data.len() % 8 != 0 {
        return Err(Error::Encryption("3DES key wrap data not block-aligned".into()));
    }
    let mut buf = data.to_vec();
    let len = buf.len();
    match direction {
        Direction::Encrypt => {
            cbc::Encryptor::<des::TdesEde3>::new(key.into(), iv.into())
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(|e| Error::Encryption(format!("3DES-CBC encrypt: {e}")))?;
        }
        Direction::Decrypt => {
            cbc::Decryptor::<des::TdesEde3>::new(key.into(), iv.into())
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|e| Error::Encryption(format!("3DES-CBC decrypt: {e}")))?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 3394 test vectors, sections 4.1 through 4.6 minus the
    /// 192-bit-data/256-bit-KEK case: (KEK, key data, expected
    /// ciphertext).
    const RFC3394_VECTORS: &[(&str, &str, &str)] = &[
        (
            "000102030405060708090A0B0C0D0E0F",
            "00112233445566778899AABBCCDDEEFF",
            "1FA68B0A8112B447AEF34BD8FB5A7B829D3E862371D2CFE5",
        ),
        (
            "000102030405060708090A0B0C0D0E0F1011121314151617",
            "00112233445566778899AABBCCDDEEFF",
            "96778B25AE6CA435F92B5B97C050AED2468AB8A17AD84E5D",
        ),
        (
            "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F",
            "00112233445566778899AABBCCDDEEFF",
            "64E8C3F9CE0F5BA263E9777905818A2A93C8191E7D6E8AE7",
        ),
        (
            "000102030405060708090A0B0C0D0E0F1011121314151617",
            "00112233445566778899AABBCCDDEEFF0001020304050607",
            "031D33264E15D33268F24EC260743EDCE1C6C7DDEE725A936BA814915C6762D2",
        ),
        (
            "000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F",
            "00112233445566778899AABBCCDDEEFF000102030405060708090A0B0C0D0E0F",
            "28C9F404C4B810F4CBCCB35CFB87F8263F5786E2D80ED326CBC7F0E71A99F43BFB988B9B7A02DD21",
        ),
    ];

    fn kw_for_kek_len(len: usize) -> Box<dyn KeyWrapAlgorithm> {
        let uri = match len {
            16 => algorithm::KW_AES128,
            24 => algorithm::KW_AES192,
            32 => algorithm::KW_AES256,
            other => panic!("no AES key wrap for a {other} byte KEK"),
        };
        from_uri(uri).unwrap()
    }

    #[test]
    fn rfc3394_known_answers() {
        for (kek_hex, data_hex, expected_hex) in RFC3394_VECTORS {
            let kek = hex::decode(kek_hex).unwrap();
            let key_data = hex::decode(data_hex).unwrap();
            let expected = hex::decode(expected_hex).unwrap();

            let kw = kw_for_kek_len(kek.len());
            assert_eq!(
                kw.wrap(&kek, &key_data).unwrap(),
                expected,
                "wrap mismatch for KEK {kek_hex}"
            );
            assert_eq!(
                kw.unwrap(&kek, &expected).unwrap(),
                key_data,
                "unwrap mismatch for KEK {kek_hex}"
            );
        }
    }

    #[test]
    fn aes_kw_round_trips_every_kek_and_data_size() {
        for kek_len in [16usize, 24, 32] {
            let kw = kw_for_kek_len(kek_len);
            let kek: Vec<u8> = (0..kek_len).map(|i| (i * 7 + 3) as u8).collect();
            for data_len in [16usize, 24, 32, 40, 64, 128] {
                let key_data: Vec<u8> = (0..data_len).map(|i| (i * 13 + 5) as u8).collect();
                let wrapped = kw.wrap(&kek, &key_data).unwrap();
                assert_eq!(wrapped.len(), data_len + KW_OVERHEAD);
                assert_eq!(
                    kw.unwrap(&kek, &wrapped).unwrap(),
                    key_data,
                    "round trip failed for kek={kek_len}, data={data_len}"
                );
            }
        }
    }

    #[test]
    fn aes_kw_detects_corruption() {
        let kek = [7u8; 16];
        let kw = from_uri(algorithm::KW_AES128).unwrap();
        let mut wrapped = kw.wrap(&kek, &[0x55u8; 16]).unwrap();
        wrapped[3] ^= 0x01;
        assert!(kw.unwrap(&kek, &wrapped).is_err());
    }

    #[test]
    fn aes_kw_rejects_short_kek() {
        let kw = from_uri(algorithm::KW_AES128).unwrap();
        assert!(matches!(
            kw.wrap(&[0u8; 15], &[0u8; 16]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn tdes_key_wrap_round_trip() {
        let kek: Vec<u8> = (1u8..=24).collect();
        let key_data: Vec<u8> = (0u8..24).map(|i| 0xA0 | i).collect();
        let kw = from_uri(algorithm::KW_TRIPLEDES).unwrap();
        let wrapped = kw.wrap(&kek, &key_data).unwrap();
        // IV block + key material + checksum block.
        assert_eq!(wrapped.len(), 8 + key_data.len() + 8);
        assert_eq!(kw.unwrap(&kek, &wrapped).unwrap(), key_data);
    }

    #[test]
    fn tdes_key_wrap_checksum_detects_corruption() {
        let kek = [0x2Du8; 24];
        let kw = from_uri(algorithm::KW_TRIPLEDES).unwrap();
        let mut wrapped = kw.wrap(&kek, &[0x11u8; 24]).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x80;
        assert!(kw.unwrap(&kek, &wrapped).is_err());
    }
}
