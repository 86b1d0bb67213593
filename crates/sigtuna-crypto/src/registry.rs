#![forbid(unsafe_code)]

//! The URI-keyed algorithm registry.
//!
//! One process-wide instance ([`AlgorithmRegistry::global`]) serves
//! normal use; [`AlgorithmRegistry::scoped`] builds an independent,
//! still-open instance for tests.  Registration is only permitted
//! before the first lookup: the registry seals itself on first use and
//! later registration attempts return `AlreadyInitialized`.
//!
//! Every lookup takes the caller's secure-validation flag.  Algorithms
//! on the deny-list (minimum: MD5) stay registered but fail lookup with
//! `UnsupportedAlgorithm` when secure validation is in force.

use crate::cipher::BlockCipher;
use crate::digest::DigestAlgorithm;
use crate::keytransport::KeyTransportAlgorithm;
use crate::keywrap::KeyWrapAlgorithm;
use crate::sign::SignatureAlgorithm;
use sigtuna_core::{algorithm, Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

type DigestFactory = Box<dyn Fn() -> Result<Box<dyn DigestAlgorithm>> + Send + Sync>;
type CipherFactory = Box<dyn Fn() -> Result<Box<dyn BlockCipher>> + Send + Sync>;
type KeyWrapFactory = Box<dyn Fn() -> Result<Box<dyn KeyWrapAlgorithm>> + Send + Sync>;
type KeyTransportFactory = Box<dyn Fn() -> Result<Box<dyn KeyTransportAlgorithm>> + Send + Sync>;
type SignatureFactory = Box<dyn Fn() -> Result<Box<dyn SignatureAlgorithm>> + Send + Sync>;

pub struct AlgorithmRegistry {
    digests: HashMap<String, DigestFactory>,
    ciphers: HashMap<String, CipherFactory>,
    key_wraps: HashMap<String, KeyWrapFactory>,
    key_transports: HashMap<String, KeyTransportFactory>,
    signatures: HashMap<String, SignatureFactory>,
    /// URI → key kind ("RSA", "AES", "DESede", "HMAC").
    key_algorithms: HashMap<String, &'static str>,
    /// Recognized canonicalization algorithm URIs.  The c14n crate
    /// builds the actual serializer; the registry only answers whether
    /// a URI is known and permitted.
    canonicalizers: HashSet<String>,
    deny_list: HashSet<String>,
    sealed: AtomicBool,
}

impl AlgorithmRegistry {
    /// The process-wide registry, initialized with the built-in
    /// algorithm set on first access.
    pub fn global() -> &'static AlgorithmRegistry {
        static GLOBAL: OnceLock<AlgorithmRegistry> = OnceLock::new();
        GLOBAL.get_or_init(AlgorithmRegistry::scoped)
    }

    /// An independent registry with the built-in algorithm set, still
    /// open for registration.
    pub fn scoped() -> Self {
        let mut registry = Self {
            digests: HashMap::new(),
            ciphers: HashMap::new(),
            key_wraps: HashMap::new(),
            key_transports: HashMap::new(),
            signatures: HashMap::new(),
            key_algorithms: HashMap::new(),
            canonicalizers: HashSet::new(),
            deny_list: [algorithm::MD5.to_owned()].into_iter().collect(),
            sealed: AtomicBool::new(false),
        };
        registry.install_defaults();
        registry
    }

    fn install_defaults(&mut self) {
        for uri in [
            algorithm::SHA1,
            algorithm::SHA256,
            algorithm::SHA512,
            algorithm::RIPEMD160,
            algorithm::MD5,
        ] {
            self.digests
                .insert(uri.to_owned(), Box::new(move || crate::digest::from_uri(uri)));
        }
        for uri in [
            algorithm::AES128_CBC,
            algorithm::AES192_CBC,
            algorithm::AES256_CBC,
            algorithm::TRIPLEDES_CBC,
        ] {
            self.ciphers
                .insert(uri.to_owned(), Box::new(move || crate::cipher::from_uri(uri)));
        }
        for uri in [
            algorithm::KW_AES128,
            algorithm::KW_AES192,
            algorithm::KW_AES256,
            algorithm::KW_TRIPLEDES,
        ] {
            self.key_wraps
                .insert(uri.to_owned(), Box::new(move || crate::keywrap::from_uri(uri)));
        }
        for uri in [algorithm::RSA_PKCS1, algorithm::RSA_OAEP] {
            self.key_transports.insert(
                uri.to_owned(),
                Box::new(move || crate::keytransport::from_uri(uri)),
            );
        }
        for uri in [
            algorithm::HMAC_SHA1,
            algorithm::HMAC_SHA256,
            algorithm::HMAC_SHA512,
            algorithm::RSA_SHA1,
            algorithm::RSA_SHA256,
            algorithm::RSA_SHA512,
        ] {
            self.signatures
                .insert(uri.to_owned(), Box::new(move || crate::sign::from_uri(uri)));
        }

        for uri in [
            algorithm::C14N,
            algorithm::C14N_WITH_COMMENTS,
            algorithm::C14N11,
            algorithm::C14N11_WITH_COMMENTS,
            algorithm::EXC_C14N,
            algorithm::EXC_C14N_WITH_COMMENTS,
        ] {
            self.canonicalizers.insert(uri.to_owned());
        }

        for (uri, kind) in [
            (algorithm::RSA_PKCS1, "RSA"),
            (algorithm::RSA_OAEP, "RSA"),
            (algorithm::AES128_CBC, "AES"),
            (algorithm::AES192_CBC, "AES"),
            (algorithm::AES256_CBC, "AES"),
            (algorithm::KW_AES128, "AES"),
            (algorithm::KW_AES192, "AES"),
            (algorithm::KW_AES256, "AES"),
            (algorithm::TRIPLEDES_CBC, "DESede"),
            (algorithm::KW_TRIPLEDES, "DESede"),
            (algorithm::HMAC_SHA1, "HMAC"),
            (algorithm::HMAC_SHA256, "HMAC"),
            (algorithm::HMAC_SHA512, "HMAC"),
        ] {
            self.key_algorithms.insert(uri.to_owned(), kind);
        }
    }

    fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    fn check_open(&self, uri: &str) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized(uri.to_owned()));
        }
        Ok(())
    }

    fn check_denied(&self, uri: &str, secure_validation: bool) -> Result<()> {
        if secure_validation && self.deny_list.contains(uri) {
            return Err(Error::UnsupportedAlgorithm(format!(
                "algorithm {uri} is forbidden when secure validation is enabled"
            )));
        }
        Ok(())
    }

    // ── Registration (before first lookup only) ──────────────────────

    pub fn register_digest(&mut self, uri: &str, factory: DigestFactory) -> Result<()> {
        self.check_open(uri)?;
        self.digests.insert(uri.to_owned(), factory);
        Ok(())
    }

    pub fn register_cipher(&mut self, uri: &str, factory: CipherFactory) -> Result<()> {
        self.check_open(uri)?;
        self.ciphers.insert(uri.to_owned(), factory);
        Ok(())
    }

    pub fn register_key_wrap(&mut self, uri: &str, factory: KeyWrapFactory) -> Result<()> {
        self.check_open(uri)?;
        self.key_wraps.insert(uri.to_owned(), factory);
        Ok(())
    }

    /// Add an algorithm URI to the secure-validation deny-list.
    pub fn deny(&mut self, uri: &str) -> Result<()> {
        self.check_open(uri)?;
        self.deny_list.insert(uri.to_owned());
        Ok(())
    }

    // ── Lookups (seal the registry) ──────────────────────────────────

    pub fn lookup_digest(
        &self,
        uri: &str,
        secure_validation: bool,
    ) -> Result<Box<dyn DigestAlgorithm>> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        match self.digests.get(uri) {
            Some(factory) => factory(),
            None => Err(Error::UnsupportedAlgorithm(format!("digest: {uri}"))),
        }
    }

    pub fn lookup_cipher(
        &self,
        uri: &str,
        secure_validation: bool,
    ) -> Result<Box<dyn BlockCipher>> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        match self.ciphers.get(uri) {
            Some(factory) => factory(),
            None => Err(Error::UnsupportedAlgorithm(format!("cipher: {uri}"))),
        }
    }

    pub fn lookup_key_wrap(
        &self,
        uri: &str,
        secure_validation: bool,
    ) -> Result<Box<dyn KeyWrapAlgorithm>> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        match self.key_wraps.get(uri) {
            Some(factory) => factory(),
            None => Err(Error::UnsupportedAlgorithm(format!("key wrap: {uri}"))),
        }
    }

    pub fn lookup_key_transport(
        &self,
        uri: &str,
        secure_validation: bool,
    ) -> Result<Box<dyn KeyTransportAlgorithm>> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        match self.key_transports.get(uri) {
            Some(factory) => factory(),
            None => Err(Error::UnsupportedAlgorithm(format!("key transport: {uri}"))),
        }
    }

    pub fn lookup_signature(
        &self,
        uri: &str,
        secure_validation: bool,
    ) -> Result<Box<dyn SignatureAlgorithm>> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        match self.signatures.get(uri) {
            Some(factory) => factory(),
            None => Err(Error::UnsupportedAlgorithm(format!("signature: {uri}"))),
        }
    }

    /// Validate that a canonicalization algorithm URI is registered
    /// and permitted; returns the URI for the caller to construct the
    /// serializer from.
    pub fn lookup_canonicalizer<'u>(
        &self,
        uri: &'u str,
        secure_validation: bool,
    ) -> Result<&'u str> {
        self.seal();
        self.check_denied(uri, secure_validation)?;
        if self.canonicalizers.contains(uri) {
            Ok(uri)
        } else {
            Err(Error::UnsupportedAlgorithm(format!("canonicalizer: {uri}")))
        }
    }

    /// The key kind an algorithm URI expects: used when resolving a KEK
    /// from `KeyInfo` ("RSA" selects a private key, anything else a
    /// secret key).
    pub fn lookup_key_algorithm(&self, uri: &str) -> Result<&'static str> {
        self.seal();
        self.key_algorithms
            .get(uri)
            .copied()
            .ok_or_else(|| Error::UnsupportedAlgorithm(format!("key algorithm: {uri}")))
    }

    /// Whether a URI is on the secure-validation deny-list.
    pub fn is_denied(&self, uri: &str) -> bool {
        self.deny_list.contains(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_algorithms() {
        let registry = AlgorithmRegistry::scoped();
        assert!(registry.lookup_digest(algorithm::SHA256, false).is_ok());
        assert!(registry.lookup_cipher(algorithm::AES128_CBC, false).is_ok());
        assert!(registry.lookup_key_wrap(algorithm::KW_AES192, false).is_ok());
        assert!(registry
            .lookup_key_transport(algorithm::RSA_OAEP, false)
            .is_ok());
        assert!(registry
            .lookup_signature(algorithm::HMAC_SHA256, false)
            .is_ok());
    }

    #[test]
    fn unknown_uri_fails() {
        let registry = AlgorithmRegistry::scoped();
        assert!(matches!(
            registry.lookup_digest("http://example.com/nope", false),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn md5_denied_under_secure_validation() {
        let registry = AlgorithmRegistry::scoped();
        assert!(registry.lookup_digest(algorithm::MD5, false).is_ok());
        assert!(registry.lookup_digest(algorithm::MD5, true).is_err());
    }

    #[test]
    fn registration_after_first_lookup_fails() {
        let mut registry = AlgorithmRegistry::scoped();
        registry
            .register_digest(
                "http://example.com/custom",
                Box::new(|| crate::digest::from_uri(algorithm::SHA256)),
            )
            .unwrap();
        let _ = registry.lookup_digest(algorithm::SHA1, false).unwrap();
        assert!(matches!(
            registry.register_digest(
                "http://example.com/late",
                Box::new(|| crate::digest::from_uri(algorithm::SHA256)),
            ),
            Err(Error::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn key_algorithm_mapping() {
        let registry = AlgorithmRegistry::scoped();
        assert_eq!(
            registry.lookup_key_algorithm(algorithm::RSA_OAEP).unwrap(),
            "RSA"
        );
        assert_eq!(
            registry.lookup_key_algorithm(algorithm::KW_AES128).unwrap(),
            "AES"
        );
    }

    #[test]
    fn canonicalizer_lookup() {
        let registry = AlgorithmRegistry::scoped();
        assert!(registry.lookup_canonicalizer(algorithm::C14N, false).is_ok());
        assert!(registry
            .lookup_canonicalizer("http://example.com/c14n", false)
            .is_err());
    }

    #[test]
    fn configurable_deny_list() {
        let mut registry = AlgorithmRegistry::scoped();
        registry.deny(algorithm::SHA1).unwrap();
        assert!(registry.lookup_digest(algorithm::SHA1, true).is_err());
        assert!(registry.lookup_digest(algorithm::SHA1, false).is_ok());
    }
}
