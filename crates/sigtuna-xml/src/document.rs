#![forbid(unsafe_code)]

//! Owned XML document with ID attribute registration.

use sigtuna_core::{Error, Result};
use std::collections::HashMap;

/// An owned XML document.  Stores the text; parsed views are produced on
/// demand because `roxmltree::Document` borrows from the input.
pub struct XmlDocument {
    text: String,
    /// ID attribute names registered beyond the default `Id`, `ID`, `id`.
    extra_id_attrs: Vec<String>,
}

impl XmlDocument {
    /// Parse and validate XML from a string, taking ownership.
    pub fn parse(text: String) -> Result<Self> {
        let _doc = roxmltree::Document::parse_with_options(&text, crate::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))?;
        Ok(Self {
            text,
            extra_id_attrs: Vec::new(),
        })
    }

    /// Parse and validate XML from bytes.
    pub fn parse_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::XmlParse(format!("invalid UTF-8: {e}")))?
            .to_owned();
        Self::parse(text)
    }

    /// Get the raw XML text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Register an additional ID attribute name (e.g. `"AssertionID"`).
    pub fn add_id_attr(&mut self, name: &str) {
        self.extra_id_attrs.push(name.to_owned());
    }

    /// Re-parse the stored text.  Call once at the top of a processing
    /// pipeline and pass the document reference down.
    pub fn parse_doc(&self) -> Result<roxmltree::Document<'_>> {
        roxmltree::Document::parse_with_options(&self.text, crate::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))
    }

    /// Build the ID → node-index mapping for a parsed document.
    ///
    /// With `reject_duplicates` (on under secure validation) a document
    /// carrying the same ID value twice is rejected; duplicate IDs are
    /// the lever of signature-wrapping attacks.
    pub fn build_id_map(
        &self,
        doc: &roxmltree::Document<'_>,
        reject_duplicates: bool,
    ) -> Result<HashMap<String, usize>> {
        let names: Vec<&str> = ["Id", "ID", "id"]
            .into_iter()
            .chain(self.extra_id_attrs.iter().map(|s| s.as_str()))
            .collect();
        build_id_map(doc, &names, reject_duplicates)
    }
}

/// Build an ID map from explicit attribute names.  `xml:id` is always
/// recognized.
pub fn build_id_map(
    doc: &roxmltree::Document<'_>,
    attr_names: &[&str],
    reject_duplicates: bool,
) -> Result<HashMap<String, usize>> {
    let mut map = HashMap::new();
    for node in doc.descendants() {
        if !node.is_element() {
            continue;
        }
        for attr_name in attr_names {
            if let Some(val) = node.attribute(*attr_name) {
                insert_id(&mut map, val, node, reject_duplicates)?;
            }
        }
        if let Some(val) = node.attribute((sigtuna_core::ns::XML, "id")) {
            insert_id(&mut map, val, node, reject_duplicates)?;
        }
    }
    Ok(map)
}

fn insert_id(
    map: &mut HashMap<String, usize>,
    val: &str,
    node: roxmltree::Node<'_, '_>,
    reject_duplicates: bool,
) -> Result<()> {
    let idx = crate::nodeset::node_index(node);
    if let Some(prev) = map.insert(val.to_owned(), idx) {
        if reject_duplicates && prev != idx {
            return Err(Error::InvalidInput(format!("duplicate ID: {val}")));
        }
    }
    Ok(())
}

/// Find the first descendant element with the given namespace and local name.
pub fn find_element<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
    ns_uri: &str,
    local_name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    doc.descendants().find(|n| {
        n.is_element()
            && n.tag_name().name() == local_name
            && n.tag_name().namespace().unwrap_or("") == ns_uri
    })
}

/// Find the first child element with the given namespace and local name.
pub fn find_child_element<'a, 'input>(
    parent: roxmltree::Node<'a, 'input>,
    ns_uri: &str,
    local_name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    parent.children().find(|n| {
        n.is_element()
            && n.tag_name().name() == local_name
            && n.tag_name().namespace().unwrap_or("") == ns_uri
    })
}

/// Find all child elements with the given namespace and local name.
pub fn find_child_elements<'a, 'input>(
    parent: roxmltree::Node<'a, 'input>,
    ns_uri: &str,
    local_name: &str,
) -> Vec<roxmltree::Node<'a, 'input>> {
    parent
        .children()
        .filter(|n| {
            n.is_element()
                && n.tag_name().name() == local_name
                && n.tag_name().namespace().unwrap_or("") == ns_uri
        })
        .collect()
}

/// Collect the text content of a node and its descendants.
pub fn text_content(node: roxmltree::Node<'_, '_>) -> String {
    let mut out = String::new();
    for n in node.descendants() {
        if n.is_text() {
            out.push_str(n.text().unwrap_or(""));
        }
    }
    out
}
