#![forbid(unsafe_code)]

//! XML Digital Signature (XML-DSig).
//!
//! The object model follows the W3C element structure: an
//! [`XmlSignature`] owns a [`SignedInfo`] (canonicalization method,
//! signature method, ordered [`Reference`]s) and a `SignatureValue`.
//!
//! Signing digests every reference, marshals the signature into the
//! target document, canonicalizes `SignedInfo` in that final context
//! and signs the canonical bytes.  Verification canonicalizes
//! `SignedInfo`, checks the signature value, then validates every
//! reference — a failing reference does not short-circuit the rest, so
//! the result reports each reference's status.

pub mod context;
pub mod reference;
pub mod signature;
pub mod signed_info;

pub use context::{DsigContext, KeySelector};
pub use reference::Reference;
pub use signature::{ReferenceResult, SignatureVerification, XmlSignature};
pub use signed_info::SignedInfo;
