#![forbid(unsafe_code)]

//! Digest (hash) algorithms.
//!
//! Every supported hash goes through one generic [`Hasher`] wrapper
//! over the RustCrypto `Digest` trait; `from_uri` picks the concrete
//! hash function for a `DigestMethod` URI.

use sigtuna_core::{algorithm, Error, Result};

/// A streaming digest handed out by the algorithm registry.
pub trait DigestAlgorithm: Send {
    /// Algorithm URI.
    fn uri(&self) -> &'static str;
    /// Feed data into the hash.
    fn update(&mut self, data: &[u8]);
    /// Finalize and return the hash value.
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

/// Generic adapter from a RustCrypto hash to [`DigestAlgorithm`].
struct Hasher<D> {
    state: D,
    uri: &'static str,
}

impl<D: digest::Digest + Send> DigestAlgorithm for Hasher<D> {
    fn uri(&self) -> &'static str {
        self.uri
    }

    fn update(&mut self, data: &[u8]) {
        digest::Digest::update(&mut self.state, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        digest::Digest::finalize(self.state).to_vec()
    }
}

fn hasher<D>(uri: &'static str) -> Box<dyn DigestAlgorithm>
where
    D: digest::Digest + Send + 'static,
{
    Box::new(Hasher {
        state: D::new(),
        uri,
    })
}

/// Create a digest algorithm from its URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn DigestAlgorithm>> {
    Ok(match uri {
        algorithm::SHA1 => hasher::<sha1::Sha1>(algorithm::SHA1),
        algorithm::SHA256 => hasher::<sha2::Sha256>(algorithm::SHA256),
        algorithm::SHA512 => hasher::<sha2::Sha512>(algorithm::SHA512),
        algorithm::RIPEMD160 => hasher::<ripemd::Ripemd160>(algorithm::RIPEMD160),
        algorithm::MD5 => hasher::<md5::Md5>(algorithm::MD5),
        _ => {
            return Err(Error::UnsupportedAlgorithm(format!(
                "digest algorithm: {uri}"
            )))
        }
    })
}

/// Compute a digest in one shot.
pub fn digest(uri: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut hasher = from_uri(uri)?;
    hasher.update(data);
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answers_for_abc() {
        // The classic "abc" test vectors for every registered hash.
        let expectations: &[(&str, &str)] = &[
            (algorithm::SHA1, "a9993e364706816aba3e25717850c26c9cd0d89d"),
            (
                algorithm::SHA256,
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            ),
            (
                algorithm::SHA512,
                "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
                 2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f",
            ),
            (
                algorithm::RIPEMD160,
                "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc",
            ),
            (algorithm::MD5, "900150983cd24fb0d6963f7d28e17f72"),
        ];
        for (uri, expected) in expectations {
            let value = digest(uri, b"abc").unwrap();
            assert_eq!(hex::encode(&value), *expected, "mismatch for {uri}");
        }
    }

    #[test]
    fn streaming_and_one_shot_agree() {
        let mut hasher = from_uri(algorithm::SHA256).unwrap();
        hasher.update(b"a");
        hasher.update(b"b");
        hasher.update(b"c");
        assert_eq!(
            hasher.finalize(),
            digest(algorithm::SHA256, b"abc").unwrap()
        );
    }

    #[test]
    fn uri_is_reported_back() {
        let hasher = from_uri(algorithm::RIPEMD160).unwrap();
        assert_eq!(hasher.uri(), algorithm::RIPEMD160);
    }

    #[test]
    fn unknown_uri_rejected() {
        assert!(matches!(
            from_uri("http://example.com/fake-digest"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }
}
