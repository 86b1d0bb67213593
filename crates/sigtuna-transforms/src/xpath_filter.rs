#![forbid(unsafe_code)]

//! XPath 1.0 filter transform.
//!
//! Evaluates a boolean expression for every node of the input set and
//! keeps the nodes for which it is true.  Only the expression subset in
//! [`sigtuna_xml::xpath`] is supported; the common enveloped-signature
//! pattern `not(ancestor-or-self::ds:Signature)` falls out of it
//! naturally.

use crate::chain::Transform;
use crate::context::TransformContext;
use crate::data::Data;
use sigtuna_core::{algorithm, ns, Error, Result};
use sigtuna_xml::xpath::{self, BoolExpr, NsBindings};
use sigtuna_xml::{node_index, NodeSet};
use std::collections::HashSet;

pub struct XPathFilterTransform {
    expression: String,
    parsed: BoolExpr,
    bindings: NsBindings,
}

impl XPathFilterTransform {
    pub fn new(expression: &str, bindings: NsBindings) -> Result<Self> {
        let parsed = xpath::parse_bool_expr(expression, &bindings).ok_or_else(|| {
            Error::Transform(format!("XPath expression not supported: {expression}"))
        })?;
        Ok(Self {
            expression: expression.to_owned(),
            parsed,
            bindings,
        })
    }

    /// Read the `<XPath>` child of a `<Transform>` element, capturing
    /// the in-scope namespace bindings for prefix resolution.
    pub fn from_element(node: roxmltree::Node<'_, '_>) -> Result<Self> {
        let xpath_node = node
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == ns::node::XPATH)
            .ok_or_else(|| Error::Marshal("XPath transform is missing XPath".into()))?;
        let expr = sigtuna_xml::document::text_content(xpath_node);
        Self::new(expr.trim(), xpath::ns_bindings_of(xpath_node))
    }
}

impl Transform for XPathFilterTransform {
    fn uri(&self) -> &str {
        algorithm::XPATH
    }

    fn transform(&self, data: Data, _ctx: &TransformContext<'_>) -> Result<Data> {
        let (xml, input) = data.into_node_set()?;
        let doc = roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))?;

        let mut result = HashSet::new();
        for node in doc.descendants() {
            if input.contains(&node) && xpath::eval_bool_expr(&self.parsed, node) {
                result.insert(node_index(node));
            }
        }
        drop(doc);
        Ok(Data::NodeSet {
            xml,
            nodes: NodeSet::from_ids(result),
        })
    }

    fn marshal_params(&self, w: &mut sigtuna_xml::XmlWriter) {
        let mut attrs: Vec<(String, String)> = Vec::new();
        for (prefix, uri) in &self.bindings {
            // Never re-declare the default namespace here; it would
            // move the XPath element out of the dsig namespace.
            if prefix.is_empty() || prefix == "xml" {
                continue;
            }
            attrs.push((format!("xmlns:{prefix}"), uri.clone()));
        }
        attrs.sort();
        let attr_refs: Vec<(&str, Option<&str>)> = attrs
            .iter()
            .map(|(k, v)| (k.as_str(), Some(v.as_str())))
            .collect();
        w.start_element("XPath", &attr_refs);
        w.text(&self.expression);
        w.end_element();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_matching_nodes() {
        let xml = r#"<r><CipherText Id="CipherTextId">secret</CipherText><noise>x</noise></r>"#;
        let ctx = TransformContext::new(xml);
        let doc = roxmltree::Document::parse(xml).unwrap();
        let data = Data::NodeSet {
            xml: xml.to_owned(),
            nodes: NodeSet::all(&doc),
        };
        let t = XPathFilterTransform::new(
            r#"self::text()[parent::CipherText[@Id="CipherTextId"]]"#,
            NsBindings::new(),
        )
        .unwrap();
        let out = t.transform(data, &ctx).unwrap();
        let (out_xml, nodes) = out.into_node_set().unwrap();
        assert_eq!(nodes.len(), 1);
        let doc = roxmltree::Document::parse(&out_xml).unwrap();
        let kept = doc
            .descendants()
            .find(|n| nodes.contains(n))
            .unwrap();
        assert_eq!(kept.text(), Some("secret"));
    }

    #[test]
    fn unsupported_expression_rejected_at_construction() {
        assert!(XPathFilterTransform::new("count(//a) > 2", NsBindings::new()).is_err());
    }
}
