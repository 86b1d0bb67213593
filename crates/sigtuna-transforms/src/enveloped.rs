#![forbid(unsafe_code)]

//! Enveloped signature transform: removes the enclosing `<Signature>`
//! subtree from the node set.

use crate::chain::Transform;
use crate::context::TransformContext;
use crate::data::Data;
use sigtuna_core::{algorithm, Error, Result};

pub struct EnvelopedSignatureTransform;

impl Transform for EnvelopedSignatureTransform {
    fn uri(&self) -> &str {
        algorithm::ENVELOPED_SIGNATURE
    }

    fn transform(&self, data: Data, ctx: &TransformContext<'_>) -> Result<Data> {
        if data.is_octet_stream() {
            return Err(Error::Transform(
                "enveloped-signature transform requires XML input".into(),
            ));
        }
        let sig_index = ctx.signature_node.ok_or_else(|| {
            Error::Transform("enveloped-signature transform outside a signature".into())
        })?;

        let (xml, mut nodes) = data.into_node_set()?;
        let doc = roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))?;
        let sig_node = doc
            .get_node(roxmltree::NodeId::new(sig_index as u32))
            .ok_or_else(|| Error::Transform("signature node not found in document".into()))?;
        for n in sig_node.descendants() {
            nodes.remove(&n);
        }
        drop(doc);
        Ok(Data::NodeSet { xml, nodes })
    }
}
