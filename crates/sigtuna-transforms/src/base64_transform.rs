#![forbid(unsafe_code)]

//! Base64 decode transform.

use crate::chain::Transform;
use crate::context::TransformContext;
use crate::data::Data;
use base64::Engine;
use sigtuna_core::{algorithm, Error, Result};
use sigtuna_xml::NodeSet;

/// Decodes Base64 content.  XML input is reduced to the text content
/// of the node-set first, per the DSig rule that the transform
/// "removes the tags".
pub struct Base64DecodeTransform;

impl Transform for Base64DecodeTransform {
    fn uri(&self) -> &str {
        algorithm::BASE64
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn transform(&self, data: Data, _ctx: &TransformContext<'_>) -> Result<Data> {
        let text = match &data {
            Data::OctetStream { bytes, .. } => std::str::from_utf8(bytes)
                .map_err(|e| Error::Transform(format!("base64 input not UTF-8: {e}")))?
                .to_owned(),
            Data::NodeSet { xml, nodes } => extract_text_content(xml, Some(nodes))?,
            Data::SubTree { .. } => {
                let (xml, nodes) = data.clone().into_node_set()?;
                extract_text_content(&xml, Some(&nodes))?
            }
        };

        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| Error::Base64(format!("base64 transform: {e}")))?;
        Ok(Data::octets(decoded))
    }
}

/// Collect text node content, optionally restricted to a node set.
fn extract_text_content(xml: &str, node_set: Option<&NodeSet>) -> Result<String> {
    let doc = roxmltree::Document::parse_with_options(xml, sigtuna_xml::parsing_options())
        .map_err(|e| Error::Transform(format!("base64: XML parse: {e}")))?;
    let mut text = String::new();
    for node in doc.descendants() {
        if node.is_text() && node_set.is_none_or(|ns| ns.contains(&node)) {
            text.push_str(node.text().unwrap_or(""));
        }
    }
    Ok(text)
}
