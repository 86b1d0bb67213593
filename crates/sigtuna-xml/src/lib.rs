#![forbid(unsafe_code)]

//! XML support layer for the Sigtuna XML Security library.
//!
//! Wraps `roxmltree` with ID registration, node sets for
//! canonicalization and transforms, the tri-state node filter used by
//! document-subset canonicalization, and the XPath 1.0-compatible
//! expression subset that XML-DSig and XML-Enc documents actually use.

pub mod document;
pub mod filter;
pub mod nodeset;
pub mod writer;
pub mod xpath;

pub use document::{find_child_element, find_child_elements, find_element, XmlDocument};
pub use filter::{Include, NodeFilter};
pub use nodeset::{node_index, NodeSet};
pub use writer::XmlWriter;

/// Parsing options used throughout the library: DTDs are tolerated
/// because several historical test documents carry a DOCTYPE.
pub fn parsing_options() -> roxmltree::ParsingOptions {
    roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    }
}
