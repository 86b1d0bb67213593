#![forbid(unsafe_code)]

//! XML Canonicalization (C14N) for the Sigtuna XML Security library.
//!
//! Implements the six W3C canonicalization variants:
//! - Canonical XML 1.0 (with and without comments)
//! - Canonical XML 1.1 (with and without comments)
//! - Exclusive Canonical XML 1.0 (with and without comments)
//!
//! Document-subset canonicalization honors a [`NodeSet`] and an
//! optional tri-state [`NodeFilter`](sigtuna_xml::NodeFilter), which is
//! how XPath Filter 2.0 selections reach the serializer.

pub mod engine;
pub mod escape;
pub mod render;

use sigtuna_core::{algorithm, Error, Result};
use sigtuna_xml::{NodeFilter, NodeSet};

/// The canonicalization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C14nMode {
    /// Canonical XML 1.0
    Inclusive,
    /// Canonical XML 1.0 with comments
    InclusiveWithComments,
    /// Canonical XML 1.1
    Inclusive11,
    /// Canonical XML 1.1 with comments
    Inclusive11WithComments,
    /// Exclusive Canonical XML 1.0
    Exclusive,
    /// Exclusive Canonical XML 1.0 with comments
    ExclusiveWithComments,
}

impl C14nMode {
    /// Get the algorithm URI for this mode.
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Inclusive => algorithm::C14N,
            Self::InclusiveWithComments => algorithm::C14N_WITH_COMMENTS,
            Self::Inclusive11 => algorithm::C14N11,
            Self::Inclusive11WithComments => algorithm::C14N11_WITH_COMMENTS,
            Self::Exclusive => algorithm::EXC_C14N,
            Self::ExclusiveWithComments => algorithm::EXC_C14N_WITH_COMMENTS,
        }
    }

    /// Parse a C14N mode from an algorithm URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithm::C14N => Some(Self::Inclusive),
            algorithm::C14N_WITH_COMMENTS => Some(Self::InclusiveWithComments),
            algorithm::C14N11 => Some(Self::Inclusive11),
            algorithm::C14N11_WITH_COMMENTS => Some(Self::Inclusive11WithComments),
            algorithm::EXC_C14N => Some(Self::Exclusive),
            algorithm::EXC_C14N_WITH_COMMENTS => Some(Self::ExclusiveWithComments),
            _ => None,
        }
    }

    pub fn with_comments(&self) -> bool {
        matches!(
            self,
            Self::InclusiveWithComments
                | Self::Inclusive11WithComments
                | Self::ExclusiveWithComments
        )
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive | Self::ExclusiveWithComments)
    }

    pub fn is_c14n11(&self) -> bool {
        matches!(self, Self::Inclusive11 | Self::Inclusive11WithComments)
    }
}

/// A canonicalizer with an owned output buffer.
///
/// The buffer accumulates across `canonicalize_subtree` calls, which is
/// what content serialization needs (several siblings in sequence).  The
/// instance is single-use until [`Canonicalizer::reset`]; starting a new
/// serialization without resetting trips [`Canonicalizer::not_reset`].
pub struct Canonicalizer {
    mode: C14nMode,
    out: Vec<u8>,
    in_use: bool,
}

impl Canonicalizer {
    pub fn new(mode: C14nMode) -> Self {
        Self {
            mode,
            out: Vec::new(),
            in_use: false,
        }
    }

    pub fn mode(&self) -> C14nMode {
        self.mode
    }

    /// Assert the in-use state without clearing the buffer.
    pub fn not_reset(&mut self) -> Result<()> {
        if self.in_use {
            return Err(Error::InvalidState(
                "canonicalizer already in use; call reset() first".into(),
            ));
        }
        self.in_use = true;
        Ok(())
    }

    /// Clear the buffer and re-arm the instance.
    pub fn reset(&mut self) {
        self.out.clear();
        self.in_use = false;
    }

    /// Canonicalize a subtree, appending to the output buffer.
    pub fn canonicalize_subtree(
        &mut self,
        doc: &roxmltree::Document<'_>,
        root: roxmltree::Node<'_, '_>,
    ) -> Result<()> {
        let node_set = if self.mode.with_comments() {
            NodeSet::tree_with_comments(root)
        } else {
            NodeSet::tree_without_comments(root)
        };
        let bytes = canonicalize_doc(doc, self.mode, Some(&node_set), None, &[])?;
        self.out.extend_from_slice(&bytes);
        Ok(())
    }

    /// Take the accumulated output, leaving the instance in-use.
    pub fn output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// Canonicalize an XML document given as text.
///
/// - `node_set`: optional document subset
/// - `filter`: optional tri-state node filter, consulted in addition to
///   the node set
/// - `inclusive_prefixes`: the `InclusiveNamespaces PrefixList` for
///   exclusive C14N
pub fn canonicalize(
    xml: &str,
    mode: C14nMode,
    node_set: Option<&NodeSet>,
    filter: Option<&dyn NodeFilter>,
    inclusive_prefixes: &[String],
) -> Result<Vec<u8>> {
    let doc = roxmltree::Document::parse_with_options(xml, sigtuna_xml::parsing_options())
        .map_err(|e| Error::Canonicalization(format!("input does not parse: {e}")))?;
    canonicalize_doc(&doc, mode, node_set, filter, inclusive_prefixes)
}

/// Canonicalize a pre-parsed document.
pub fn canonicalize_doc(
    doc: &roxmltree::Document<'_>,
    mode: C14nMode,
    node_set: Option<&NodeSet>,
    filter: Option<&dyn NodeFilter>,
    inclusive_prefixes: &[String],
) -> Result<Vec<u8>> {
    engine::Engine::new(mode, node_set, filter, inclusive_prefixes).run(doc)
}
