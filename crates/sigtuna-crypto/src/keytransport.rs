#![forbid(unsafe_code)]

//! Key transport algorithms: RSA PKCS#1 v1.5 and RSA-OAEP.

use sigtuna_core::{algorithm, Error, Result};

/// RSA-OAEP parameters carried on an `EncryptionMethod`.
#[derive(Debug, Default, Clone)]
pub struct OaepParams {
    /// DigestMethod Algorithm inside the EncryptionMethod.
    pub digest_uri: Option<String>,
    /// Decoded OAEPparams bytes.
    pub oaep_params: Option<Vec<u8>>,
}

/// A key transport algorithm.
pub trait KeyTransportAlgorithm: Send {
    fn uri(&self) -> &'static str;
    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, private_key: &rsa::RsaPrivateKey, encrypted: &[u8]) -> Result<Vec<u8>>;
}

/// Create a key transport algorithm from its URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn KeyTransportAlgorithm>> {
    from_uri_with_params(uri, OaepParams::default())
}

/// Create a key transport algorithm with explicit OAEP parameters.
pub fn from_uri_with_params(
    uri: &str,
    params: OaepParams,
) -> Result<Box<dyn KeyTransportAlgorithm>> {
    match uri {
        algorithm::RSA_PKCS1 => Ok(Box::new(RsaPkcs1Transport)),
        algorithm::RSA_OAEP => {
            // The mandatory-to-implement OAEP profile is SHA-1 with
            // MGF1-SHA1; anything else on the method is unsupported.
            if let Some(digest) = &params.digest_uri {
                if digest != algorithm::SHA1 {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "RSA-OAEP digest: {digest}"
                    )));
                }
            }
            Ok(Box::new(RsaOaepTransport))
        }
        _ => Err(Error::UnsupportedAlgorithm(format!("key transport: {uri}"))),
    }
}

struct RsaPkcs1Transport;

impl KeyTransportAlgorithm for RsaPkcs1Transport {
    fn uri(&self) -> &'static str {
        algorithm::RSA_PKCS1
    }

    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>> {
        use rsa::Pkcs1v15Encrypt;
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, key_data)
            .map_err(|e| Error::Encryption(format!("RSA PKCS#1 encrypt: {e}")))
    }

    fn decrypt(&self, private_key: &rsa::RsaPrivateKey, encrypted: &[u8]) -> Result<Vec<u8>> {
        use rsa::Pkcs1v15Encrypt;
        private_key
            .decrypt(Pkcs1v15Encrypt, encrypted)
            .map_err(|e| Error::Encryption(format!("RSA PKCS#1 decrypt: {e}")))
    }
}

struct RsaOaepTransport;

impl KeyTransportAlgorithm for RsaOaepTransport {
    fn uri(&self) -> &'static str {
        algorithm::RSA_OAEP
    }

    fn encrypt(&self, public_key: &rsa::RsaPublicKey, key_data: &[u8]) -> Result<Vec<u8>> {
        use rsa::Oaep;
        let mut rng = rand::thread_rng();
        public_key
            .encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), key_data)
            .map_err(|e| Error::Encryption(format!("RSA-OAEP encrypt: {e}")))
    }

    fn decrypt(&self, private_key: &rsa::RsaPrivateKey, encrypted: &[u8]) -> Result<Vec<u8>> {
        use rsa::Oaep;
        private_key
            .decrypt(Oaep::new::<sha1::Sha1>(), encrypted)
            .map_err(|e| Error::Encryption(format!("RSA-OAEP decrypt: {e}")))
    }
}
