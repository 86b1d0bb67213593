#![forbid(unsafe_code)]

//! Data flowing through the transform pipeline.

use sigtuna_core::{Error, Result};
use sigtuna_xml::NodeSet;

/// A value passed between transforms.
///
/// XML-bearing variants carry the owning document text; the read-only
/// DOM model re-parses from text where a node view is needed.
#[derive(Debug, Clone)]
pub enum Data {
    /// A node-set over a document.
    NodeSet { xml: String, nodes: NodeSet },
    /// A whole subtree, identified by its root node index.
    SubTree {
        xml: String,
        root: usize,
        exclude_comments: bool,
    },
    /// Raw octets.
    OctetStream {
        bytes: Vec<u8>,
        source_uri: Option<String>,
        mime_type: Option<String>,
    },
}

impl Data {
    /// Octet-stream data without source metadata.
    pub fn octets(bytes: Vec<u8>) -> Self {
        Data::OctetStream {
            bytes,
            source_uri: None,
            mime_type: None,
        }
    }

    pub fn is_octet_stream(&self) -> bool {
        matches!(self, Data::OctetStream { .. })
    }

    /// Normalize to a `(document text, node set)` pair.  Octet streams
    /// are parsed as XML, per the DSig rule that a node-set-consuming
    /// transform converts octets by parsing them.
    pub fn into_node_set(self) -> Result<(String, NodeSet)> {
        match self {
            Data::NodeSet { xml, nodes } => Ok((xml, nodes)),
            Data::SubTree {
                xml,
                root,
                exclude_comments,
            } => {
                let doc =
                    roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
                        .map_err(|e| Error::XmlParse(e.to_string()))?;
                let root_node = doc
                    .get_node(roxmltree::NodeId::new(root as u32))
                    .ok_or_else(|| Error::Transform("subtree root node not found".into()))?;
                let nodes = if exclude_comments {
                    NodeSet::tree_without_comments(root_node)
                } else {
                    NodeSet::tree_with_comments(root_node)
                };
                drop(doc);
                Ok((xml, nodes))
            }
            Data::OctetStream { bytes, .. } => {
                let xml = String::from_utf8(bytes)
                    .map_err(|e| Error::XmlParse(format!("octet stream is not UTF-8: {e}")))?;
                let doc =
                    roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
                        .map_err(|e| Error::XmlParse(e.to_string()))?;
                let nodes = NodeSet::all(&doc);
                drop(doc);
                Ok((xml, nodes))
            }
        }
    }
}
