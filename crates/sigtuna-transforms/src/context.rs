#![forbid(unsafe_code)]

//! Shared evaluation context threaded through dereferencing and the
//! transform chain.

use crate::dereference::UriDereferencer;
use std::collections::HashMap;

/// Context for dereferencing and transform execution.
///
/// Holds the owning document, the ID registry, and the recognized
/// configuration properties (`secure_validation`, `use_c14n11`,
/// `cache_reference`).  One context serves one signature operation;
/// nothing here is thread-safe.
pub struct TransformContext<'a> {
    /// The owning document text.
    pub xml: &'a str,
    /// ID value → node index, built from registered ID attributes.
    pub id_map: HashMap<String, usize>,
    /// Node index of the enclosing `Signature` element, for the
    /// enveloped-signature transform.
    pub signature_node: Option<usize>,
    /// Node index of the element carrying the reference URI attribute,
    /// exposed to XPath evaluation as `here()`.
    pub here_node: Option<usize>,
    /// Payload for a detached reference with no URI.
    pub detached_payload: Option<Vec<u8>>,
    /// External URI → local file mappings.
    pub url_maps: Vec<(String, String)>,
    /// Base directory for resolving relative external URIs.
    pub base_dir: Option<String>,
    /// Enforce the transform cap, digest deny-list and ID
    /// pre-registration.
    pub secure_validation: bool,
    /// Materialize an implicit C14N 1.1 transform when signing.
    pub use_c14n11: bool,
    /// Retain dereferenced data and the digest input on references.
    pub cache_reference: bool,
    /// Whether this context drives signature generation (the implicit
    /// C14N 1.1 switch only applies on the sign path).
    pub signing: bool,
    /// Caller-supplied dereferencer overriding the default.
    pub dereferencer: Option<&'a dyn UriDereferencer>,
}

impl<'a> TransformContext<'a> {
    pub fn new(xml: &'a str) -> Self {
        Self {
            xml,
            id_map: HashMap::new(),
            signature_node: None,
            here_node: None,
            detached_payload: None,
            url_maps: Vec::new(),
            base_dir: None,
            secure_validation: false,
            use_c14n11: false,
            cache_reference: false,
            signing: false,
            dereferencer: None,
        }
    }
}
