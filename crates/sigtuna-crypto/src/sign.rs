#![forbid(unsafe_code)]

//! Signature algorithms: HMAC-SHA* and RSA-SHA* (PKCS#1 v1.5).

use sigtuna_core::{algorithm, Error, Result};

/// Key material for signing or verification.
pub enum SigningKey {
    /// Symmetric key bytes for HMAC.
    Hmac(Vec<u8>),
    RsaPrivate(Box<rsa::RsaPrivateKey>),
    RsaPublic(Box<rsa::RsaPublicKey>),
}

/// A signature algorithm.
pub trait SignatureAlgorithm: Send {
    fn uri(&self) -> &'static str;
    fn sign(&self, key: &SigningKey, data: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, key: &SigningKey, data: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Create a signature algorithm from its URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn SignatureAlgorithm>> {
    match uri {
        algorithm::HMAC_SHA1 => Ok(Box::new(HmacSig {
            uri: algorithm::HMAC_SHA1,
        })),
        algorithm::HMAC_SHA256 => Ok(Box::new(HmacSig {
            uri: algorithm::HMAC_SHA256,
        })),
        algorithm::HMAC_SHA512 => Ok(Box::new(HmacSig {
            uri: algorithm::HMAC_SHA512,
        })),
        algorithm::RSA_SHA1 => Ok(Box::new(RsaSig {
            uri: algorithm::RSA_SHA1,
        })),
        algorithm::RSA_SHA256 => Ok(Box::new(RsaSig {
            uri: algorithm::RSA_SHA256,
        })),
        algorithm::RSA_SHA512 => Ok(Box::new(RsaSig {
            uri: algorithm::RSA_SHA512,
        })),
        _ => Err(Error::UnsupportedAlgorithm(format!("signature: {uri}"))),
    }
}

pub fn is_hmac_algorithm(uri: &str) -> bool {
    matches!(
        uri,
        algorithm::HMAC_SHA1 | algorithm::HMAC_SHA256 | algorithm::HMAC_SHA512
    )
}

// ── HMAC ─────────────────────────────────────────────────────────────

struct HmacSig {
    uri: &'static str,
}

impl HmacSig {
    fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        use hmac::{Hmac, Mac};
        macro_rules! do_mac {
            ($hash:ty) => {{
                let mut mac = Hmac::<$hash>::new_from_slice(key)
                    .map_err(|e| Error::Signature(format!("HMAC init: {e}")))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }};
        }
        match self.uri {
            algorithm::HMAC_SHA1 => do_mac!(sha1::Sha1),
            algorithm::HMAC_SHA256 => do_mac!(sha2::Sha256),
            algorithm::HMAC_SHA512 => do_mac!(sha2::Sha512),
            _ => Err(Error::Signature("unknown HMAC variant".into())),
        }
    }
}

impl SignatureAlgorithm for HmacSig {
    fn uri(&self) -> &'static str {
        self.uri
    }

    fn sign(&self, key: &SigningKey, data: &[u8]) -> Result<Vec<u8>> {
        match key {
            SigningKey::Hmac(bytes) => self.mac(bytes, data),
            _ => Err(Error::KeyResolution("HMAC requires a symmetric key".into())),
        }
    }

    fn verify(&self, key: &SigningKey, data: &[u8], signature: &[u8]) -> Result<bool> {
        use subtle::ConstantTimeEq;
        let expected = self.sign(key, data)?;
        if expected.len() != signature.len() {
            return Ok(false);
        }
        Ok(expected.ct_eq(signature).into())
    }
}

// ── RSA PKCS#1 v1.5 ──────────────────────────────────────────────────

struct RsaSig {
    uri: &'static str,
}

impl RsaSig {
    fn scheme_and_hash(&self, data: &[u8]) -> Result<(rsa::Pkcs1v15Sign, Vec<u8>)> {
        use digest::Digest;
        match self.uri {
            algorithm::RSA_SHA1 => Ok((
                rsa::Pkcs1v15Sign::new::<sha1::Sha1>(),
                sha1::Sha1::digest(data).to_vec(),
            )),
            algorithm::RSA_SHA256 => Ok((
                rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                sha2::Sha256::digest(data).to_vec(),
            )),
            algorithm::RSA_SHA512 => Ok((
                rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
                sha2::Sha512::digest(data).to_vec(),
            )),
            _ => Err(Error::Signature("unknown RSA variant".into())),
        }
    }
}

impl SignatureAlgorithm for RsaSig {
    fn uri(&self) -> &'static str {
        self.uri
    }

    fn sign(&self, key: &SigningKey, data: &[u8]) -> Result<Vec<u8>> {
        let SigningKey::RsaPrivate(private) = key else {
            return Err(Error::KeyResolution(
                "RSA signing requires a private key".into(),
            ));
        };
        let (scheme, hashed) = self.scheme_and_hash(data)?;
        private
            .sign(scheme, &hashed)
            .map_err(|e| Error::Signature(format!("RSA sign: {e}")))
    }

    fn verify(&self, key: &SigningKey, data: &[u8], signature: &[u8]) -> Result<bool> {
        let public = match key {
            SigningKey::RsaPublic(public) => (**public).clone(),
            SigningKey::RsaPrivate(private) => private.to_public_key(),
            SigningKey::Hmac(_) => {
                return Err(Error::KeyResolution(
                    "RSA verification requires an RSA key".into(),
                ))
            }
        };
        let (scheme, hashed) = self.scheme_and_hash(data)?;
        Ok(public.verify(scheme, &hashed, signature).is_ok())
    }
}
