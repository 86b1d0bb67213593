#![forbid(unsafe_code)]

//! XPointer transform: `xpointer(id('…'))` subtree selection.

use crate::chain::Transform;
use crate::context::TransformContext;
use crate::data::Data;
use sigtuna_core::{algorithm, ns, Error, Result};
use sigtuna_xml::{xpath, NodeSet};

pub struct XPointerTransform {
    id: String,
}

impl XPointerTransform {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Read the `<XPointer>` child of a `<Transform>` element.
    pub fn from_element(node: roxmltree::Node<'_, '_>) -> Result<Self> {
        let xpointer_node = node
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == ns::node::XPOINTER)
            .ok_or_else(|| Error::Marshal("XPointer transform is missing XPointer".into()))?;
        let expr = sigtuna_xml::document::text_content(xpointer_node);
        let id = xpath::parse_xpointer_id(expr.trim()).ok_or_else(|| {
            Error::Transform(format!("XPointer expression not supported: {}", expr.trim()))
        })?;
        Ok(Self { id: id.to_owned() })
    }
}

impl Transform for XPointerTransform {
    fn uri(&self) -> &str {
        algorithm::XPOINTER
    }

    fn transform(&self, data: Data, ctx: &TransformContext<'_>) -> Result<Data> {
        let (xml, nodes) = data.into_node_set()?;
        let doc = roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))?;

        let target = xpath::resolve_id(&doc, &ctx.id_map, &self.id)?;
        // XPointer selections include comment nodes.
        let subtree = NodeSet::tree_with_comments(target);
        let result = nodes.intersection(&subtree);
        drop(doc);
        Ok(Data::NodeSet { xml, nodes: result })
    }

    fn marshal_params(&self, w: &mut sigtuna_xml::XmlWriter) {
        w.start_element("XPointer", &[("xmlns", Some(algorithm::XPOINTER))]);
        w.text(&format!("xpointer(id('{}'))", self.id));
        w.end_element();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_subtree_with_comments() {
        let xml = r#"<doc><a Id="t"><!--c--><b/></a><other/></doc>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut ctx = TransformContext::new(xml);
        ctx.id_map = sigtuna_xml::document::build_id_map(&doc, &["Id"], false).unwrap();

        let data = Data::NodeSet {
            xml: xml.to_owned(),
            nodes: NodeSet::all(&doc),
        };
        let out = XPointerTransform::new("t").transform(data, &ctx).unwrap();
        let (out_xml, nodes) = out.into_node_set().unwrap();
        let bytes = sigtuna_c14n::canonicalize(
            &out_xml,
            sigtuna_c14n::C14nMode::InclusiveWithComments,
            Some(&nodes),
            None,
            &[],
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"<a Id="t"><!--c--><b></b></a>"#
        );
    }
}
