#![forbid(unsafe_code)]

//! Plaintext serialization for encryption and namespace-aware
//! deserialization for decryption.
//!
//! Serialization goes through the configured canonicalizer so the
//! octets are stable; it must never pretty-print, or content signed
//! before encryption would no longer verify after a decrypt.
//!
//! Deserialization parses the decrypted fragment inside a synthetic
//! wrapper element that declares every namespace binding visible on
//! the source element's ancestor chain (nearest binding wins), so
//! prefixes that were in scope at encryption time resolve again.

use sigtuna_c14n::C14nMode;
use sigtuna_core::{Error, Result};
use sigtuna_xml::NodeSet;

/// Serializer for element and content plaintext.
pub struct Serializer {
    mode: C14nMode,
}

impl Serializer {
    pub fn new(mode: C14nMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> C14nMode {
        self.mode
    }

    /// Serialize one element (the `Type=Element` case).
    pub fn serialize_element(
        &self,
        doc: &roxmltree::Document<'_>,
        element: roxmltree::Node<'_, '_>,
    ) -> Result<Vec<u8>> {
        let nodes = self.subtree(element);
        sigtuna_c14n::canonicalize_doc(doc, self.mode, Some(&nodes), None, &[])
    }

    /// Serialize the children of an element (the `Type=Content` case).
    pub fn serialize_content(
        &self,
        doc: &roxmltree::Document<'_>,
        element: roxmltree::Node<'_, '_>,
    ) -> Result<Vec<u8>> {
        let mut nodes = NodeSet::new();
        for child in element.children() {
            nodes = nodes.union(&self.subtree(child));
        }
        sigtuna_c14n::canonicalize_doc(doc, self.mode, Some(&nodes), None, &[])
    }

    fn subtree(&self, node: roxmltree::Node<'_, '_>) -> NodeSet {
        if self.mode.with_comments() {
            NodeSet::tree_with_comments(node)
        } else {
            NodeSet::tree_without_comments(node)
        }
    }

    /// Validate a decrypted fragment in the namespace context of
    /// `context_node`'s ancestor chain and return the fragment text,
    /// ready to splice where the `EncryptedData` stood.
    ///
    /// The fragment is parsed inside `<dummy>` carrying every binding
    /// in scope at the context node; a fragment using prefixes that
    /// were visible at encryption time parses cleanly, anything
    /// malformed is rejected before it touches the document.
    pub fn deserialize(
        &self,
        context_node: Option<roxmltree::Node<'_, '_>>,
        fragment: &str,
    ) -> Result<String> {
        let mut wrapper = String::with_capacity(fragment.len() + 64);
        wrapper.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?><dummy");
        if let Some(ctx) = context_node {
            // In-scope namespaces of the context node are exactly the
            // nearest-binding-wins walk over its ancestor chain.
            let mut bindings: Vec<(String, String)> = ctx
                .namespaces()
                .filter(|ns| ns.name() != Some("xml"))
                .map(|ns| (ns.name().unwrap_or("").to_owned(), ns.uri().to_owned()))
                .collect();
            bindings.sort();
            for (prefix, uri) in bindings {
                if prefix.is_empty() {
                    wrapper.push_str(&format!(" xmlns=\"{uri}\""));
                } else {
                    wrapper.push_str(&format!(" xmlns:{prefix}=\"{uri}\""));
                }
            }
        }
        wrapper.push('>');
        wrapper.push_str(fragment);
        wrapper.push_str("</dummy>");

        roxmltree::Document::parse_with_options(&wrapper, sigtuna_xml::parsing_options())
            .map_err(|e| Error::Encryption(format!("decrypted fragment is not well-formed: {e}")))?;
        Ok(fragment.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_serialization_is_canonical() {
        let doc = roxmltree::Document::parse(r#"<a><b  z="1"   a="2">hi</b></a>"#).unwrap();
        let b = doc
            .descendants()
            .find(|n| n.tag_name().name() == "b")
            .unwrap();
        let s = Serializer::new(C14nMode::Inclusive);
        let octets = s.serialize_element(&doc, b).unwrap();
        assert_eq!(octets, br#"<b a="2" z="1">hi</b>"#);
    }

    #[test]
    fn content_serialization_covers_all_children() {
        let doc = roxmltree::Document::parse("<a>text<b/>more<c>x</c></a>").unwrap();
        let s = Serializer::new(C14nMode::Inclusive);
        let octets = s.serialize_content(&doc, doc.root_element()).unwrap();
        assert_eq!(octets, b"text<b></b>more<c>x</c>");
    }

    #[test]
    fn deserialize_accepts_inherited_prefixes() {
        let doc =
            roxmltree::Document::parse(r#"<root xmlns:p="http://p"><holder/></root>"#).unwrap();
        let holder = doc
            .descendants()
            .find(|n| n.tag_name().name() == "holder")
            .unwrap();
        let s = Serializer::new(C14nMode::Inclusive);
        // The fragment uses a prefix declared only on the ancestor.
        let out = s.deserialize(Some(holder), "<p:x>ok</p:x>").unwrap();
        assert_eq!(out, "<p:x>ok</p:x>");
        // Without the context the same fragment is rejected.
        assert!(s.deserialize(None, "<p:x>ok</p:x>").is_err());
    }

    #[test]
    fn deserialize_rejects_malformed_fragments() {
        let s = Serializer::new(C14nMode::Inclusive);
        assert!(s.deserialize(None, "<unclosed>").is_err());
        assert!(s.deserialize(None, "plain text is fine").is_ok());
    }
}
