#![forbid(unsafe_code)]

//! The Reference transform pipeline for the Sigtuna XML Security
//! library.
//!
//! Each signature reference carries an ordered sequence of transforms.
//! The chain applies them in order; the last transform streams
//! canonical octets into the digest sink, and an implicit
//! canonicalization step is appended when the value reaching the
//! terminal position is still a node-set.

pub mod base64_transform;
pub mod chain;
pub mod context;
pub mod data;
pub mod dereference;
pub mod enveloped;
pub mod sink;
pub mod xpath2;
pub mod xpath_filter;
pub mod xpointer;

pub use chain::{ChainOutcome, Transform, TransformChain, TransformRegistry};
pub use context::TransformContext;
pub use data::Data;
pub use dereference::{DefaultDereferencer, RefInfo, UriDereferencer};
pub use sink::DigestSink;
