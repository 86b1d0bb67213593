#![forbid(unsafe_code)]

//! Streaming digest sink fed by the terminal transform.

use sigtuna_crypto::digest::DigestAlgorithm;

/// Collects the canonical octets of a reference into a digest.
///
/// With capture enabled (the `cache_reference` context property) the
/// sink also keeps a copy of everything written, so callers can replay
/// the exact bytes that were digested.
pub struct DigestSink {
    digest: Box<dyn DigestAlgorithm>,
    captured: Option<Vec<u8>>,
}

impl DigestSink {
    pub fn new(digest: Box<dyn DigestAlgorithm>) -> Self {
        Self {
            digest,
            captured: None,
        }
    }

    pub fn with_capture(digest: Box<dyn DigestAlgorithm>) -> Self {
        Self {
            digest,
            captured: Some(Vec::new()),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
        if let Some(buf) = &mut self.captured {
            buf.extend_from_slice(bytes);
        }
    }

    /// Finish: the digest value, plus the captured input when capture
    /// was enabled.
    pub fn finish(self) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.digest.finalize(), self.captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigtuna_core::algorithm;
    use sigtuna_crypto::digest;

    #[test]
    fn chunked_writes_match_one_shot_digest() {
        let mut sink = DigestSink::new(digest::from_uri(algorithm::SHA256).unwrap());
        sink.write(b"hel");
        sink.write(b"lo");
        let (value, captured) = sink.finish();
        assert_eq!(value, digest::digest(algorithm::SHA256, b"hello").unwrap());
        assert!(captured.is_none());
    }

    #[test]
    fn capture_replays_exact_bytes() {
        let mut sink = DigestSink::with_capture(digest::from_uri(algorithm::SHA1).unwrap());
        sink.write(b"abc");
        sink.write(b"def");
        let (_, captured) = sink.finish();
        assert_eq!(captured.unwrap(), b"abcdef");
    }
}
