#![forbid(unsafe_code)]

//! XML Encryption (XML-Enc).
//!
//! The in-memory model mirrors the W3C element forms
//! (`EncryptedData`, `EncryptedKey` and their sub-elements); the
//! [`XmlCipher`] façade drives the four operation modes (ENCRYPT,
//! DECRYPT, WRAP, UNWRAP) over documents, replacing elements with their
//! encrypted counterparts and back.

pub mod cipher;
pub mod marshal;
pub mod model;
pub mod serializer;

pub use cipher::{CipherMode, KeyMaterial, Target, XmlCipher};
pub use model::{
    CipherData, CipherReference, CipherRefTransform, EncryptedData, EncryptedKey, EncryptedType,
    EncryptionMethod, KeyInfo, ReferenceList, ReferenceListKind,
};
pub use serializer::Serializer;
