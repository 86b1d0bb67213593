#![forbid(unsafe_code)]

//! Signature operation context: configuration properties, ID attribute
//! registration and key selection.

use sigtuna_core::Result;
use sigtuna_crypto::sign::SigningKey;
use sigtuna_transforms::UriDereferencer;

/// Selects a signing or verification key from `KeyInfo` hints.  Trust
/// decisions (certificate paths and the like) live behind this trait;
/// the engine only passes through what the document says.
pub trait KeySelector: Send {
    /// `method_uri` is the SignatureMethod algorithm; `key_names` are
    /// the `KeyName` values found in `KeyInfo`, in document order.
    fn select(&self, method_uri: &str, key_names: &[String]) -> Result<SigningKey>;
}

/// Context for XML-DSig operations.
///
/// Not safe for concurrent use; build one per signature.
pub struct DsigContext {
    /// Additional ID attribute names to register.
    pub id_attrs: Vec<String>,
    /// External URI → local file mappings.
    pub url_maps: Vec<(String, String)>,
    /// Base directory for resolving relative external URIs.
    pub base_dir: Option<String>,
    /// Payload for detached references with no URI.
    pub detached_payload: Option<Vec<u8>>,
    /// Enforce the transform cap, digest deny-list and ID
    /// pre-registration.
    pub secure_validation: bool,
    /// Materialize an implicit C14N 1.1 transform when signing.
    pub use_c14n11: bool,
    /// Retain dereferenced data and the digest input on references.
    pub cache_reference: bool,
    /// Key selection from KeyInfo, when no key is passed explicitly.
    pub key_selector: Option<Box<dyn KeySelector>>,
    /// Caller-supplied URI dereferencer overriding the default.
    pub dereferencer: Option<Box<dyn UriDereferencer>>,
}

impl DsigContext {
    pub fn new() -> Self {
        Self {
            id_attrs: Vec::new(),
            url_maps: Vec::new(),
            base_dir: None,
            detached_payload: None,
            secure_validation: false,
            use_c14n11: false,
            cache_reference: false,
            key_selector: None,
            dereferencer: None,
        }
    }

    /// Register an additional ID attribute name.
    pub fn add_id_attr(&mut self, name: &str) {
        self.id_attrs.push(name.to_owned());
    }

    /// Map an external URI prefix to a local file path.
    pub fn add_url_map(&mut self, url: &str, file_path: &str) {
        self.url_maps.push((url.to_owned(), file_path.to_owned()));
    }
}

impl Default for DsigContext {
    fn default() -> Self {
        Self::new()
    }
}
