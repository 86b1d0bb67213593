#![forbid(unsafe_code)]

//! `XmlSignature`: aggregation, signing and verification.

use crate::context::DsigContext;
use crate::signed_info::SignedInfo;
use base64::Engine;
use sigtuna_c14n::C14nMode;
use sigtuna_core::{ns, Error, Result};
use sigtuna_crypto::sign::SigningKey;
use sigtuna_crypto::AlgorithmRegistry;
use sigtuna_transforms::{TransformContext, TransformRegistry};
use sigtuna_xml::{document::build_id_map, NodeSet, XmlWriter};
use std::collections::HashMap;

/// Validation status of one reference.
#[derive(Debug)]
pub struct ReferenceResult {
    pub uri: Option<String>,
    pub valid: bool,
}

/// Outcome of signature verification.  The signature value check and
/// every reference are always evaluated so diagnostics can report each
/// failing reference.
#[derive(Debug)]
pub struct SignatureVerification {
    pub signature_valid: bool,
    pub references: Vec<ReferenceResult>,
}

impl SignatureVerification {
    pub fn is_valid(&self) -> bool {
        self.signature_valid && self.references.iter().all(|r| r.valid)
    }
}

/// An XML signature: a `SignedInfo`, a `SignatureValue` and optional
/// `KeyInfo` key names.
pub struct XmlSignature {
    pub signed_info: SignedInfo,
    pub signature_value: Option<Vec<u8>>,
    /// `KeyName` hints marshaled into `KeyInfo`.
    pub key_names: Vec<String>,
    pub id: Option<String>,
    /// Node index of the `<Signature>` element after unmarshal.
    signature_node: Option<usize>,
}

impl XmlSignature {
    pub fn new(signed_info: SignedInfo) -> Self {
        Self {
            signed_info,
            signature_value: None,
            key_names: Vec::new(),
            id: None,
            signature_node: None,
        }
    }

    /// Emit the `<Signature>` element with the dsig namespace declared
    /// as the default.
    pub fn marshal(&self, w: &mut XmlWriter) {
        w.start_element(
            ns::node::SIGNATURE,
            &[("xmlns", Some(ns::DSIG)), (ns::attr::ID, self.id.as_deref())],
        );
        self.signed_info.marshal(w);
        w.start_element(ns::node::SIGNATURE_VALUE, &[]);
        if let Some(value) = &self.signature_value {
            w.text(&base64::engine::general_purpose::STANDARD.encode(value));
        }
        w.end_element();
        if !self.key_names.is_empty() {
            w.start_element(ns::node::KEY_INFO, &[]);
            for name in &self.key_names {
                w.start_element(ns::node::KEY_NAME, &[]);
                w.text(name);
                w.end_element();
            }
            w.end_element();
        }
        w.end_element();
    }

    fn marshal_to_string(&self) -> String {
        let mut w = XmlWriter::new();
        self.marshal(&mut w);
        w.into_string()
    }

    /// Sign enveloped: marshal this signature as the last child of the
    /// document element of `xml`, digest every reference against that
    /// document, sign the canonicalized `SignedInfo` and return the
    /// signed document.
    pub fn sign_enveloped(
        &mut self,
        ctx: &DsigContext,
        xml: &str,
        key: &SigningKey,
    ) -> Result<String> {
        let placeholder = self.marshal_to_string();
        let (combined, offset) = insert_as_last_child(xml, &placeholder)?;
        self.sign_at(ctx, combined, offset, placeholder.len(), key)
    }

    /// Sign detached: the signature element is the whole document;
    /// references point at detached or external data.
    pub fn sign_detached(&mut self, ctx: &DsigContext, key: &SigningKey) -> Result<String> {
        let placeholder = self.marshal_to_string();
        let len = placeholder.len();
        self.sign_at(ctx, placeholder, 0, len, key)
    }

    fn sign_at(
        &mut self,
        ctx: &DsigContext,
        combined: String,
        offset: usize,
        placeholder_len: usize,
        key: &SigningKey,
    ) -> Result<String> {
        // Digest every reference against the document containing the
        // placeholder signature.
        {
            let doc = parse(&combined)?;
            let id_map = id_map_for(&doc, ctx)?;
            let sig_node = element_starting_at(&doc, offset)?;
            let tctx = transform_context(&combined, id_map, Some(sig_node), ctx, true);
            for reference in &mut self.signed_info.references {
                reference.digest(&tctx)?;
            }
        }

        // Re-marshal with digest values (and any materialized implicit
        // transform) in place, then canonicalize SignedInfo in the
        // final document context.
        let with_digests = self.marshal_to_string();
        let mut combined = combined;
        combined.replace_range(offset..offset + placeholder_len, &with_digests);

        let signed_info_bytes = {
            let doc = parse(&combined)?;
            let sig_node = element_starting_at(&doc, offset)?;
            let si_node = sigtuna_xml::find_child_element(sig_node, ns::DSIG, ns::node::SIGNED_INFO)
                .ok_or_else(|| Error::Marshal("Signature is missing SignedInfo".into()))?;
            canonicalize_subtree(
                &doc,
                si_node,
                self.signed_info.c14n_method,
                &self.signed_info.inclusive_prefixes,
            )?
        };

        let sig_alg = AlgorithmRegistry::global()
            .lookup_signature(&self.signed_info.signature_method, ctx.secure_validation)?;
        let value = sig_alg.sign(key, &signed_info_bytes)?;
        self.signature_value = Some(value);

        let finished = self.marshal_to_string();
        combined.replace_range(offset..offset + with_digests.len(), &finished);
        Ok(combined)
    }

    /// Unmarshal the first `<Signature>` element of a document.
    pub fn from_document(xml: &str, ctx: &DsigContext) -> Result<Self> {
        let doc = parse(xml)?;
        let sig_node = sigtuna_xml::find_element(&doc, ns::DSIG, ns::node::SIGNATURE)
            .ok_or_else(|| Error::Marshal("no Signature element found".into()))?;
        Self::from_element(sig_node, ctx)
    }

    /// Unmarshal a `<Signature>` element.
    pub fn from_element(node: roxmltree::Node<'_, '_>, ctx: &DsigContext) -> Result<Self> {
        let registry = TransformRegistry::global();
        let si_node = sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::SIGNED_INFO)
            .ok_or_else(|| Error::Marshal("Signature is missing SignedInfo".into()))?;
        let signed_info = SignedInfo::from_element(si_node, registry, ctx.secure_validation)?;

        let sv_node = sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::SIGNATURE_VALUE)
            .ok_or_else(|| Error::Marshal("Signature is missing SignatureValue".into()))?;
        let b64: String = sigtuna_xml::document::text_content(sv_node)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let signature_value = if b64.is_empty() {
            None
        } else {
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(&b64)
                    .map_err(|e| Error::Marshal(format!("SignatureValue: {e}")))?,
            )
        };

        let mut key_names = Vec::new();
        if let Some(ki) = sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::KEY_INFO) {
            for kn in sigtuna_xml::find_child_elements(ki, ns::DSIG, ns::node::KEY_NAME) {
                let name = sigtuna_xml::document::text_content(kn).trim().to_owned();
                if !name.is_empty() {
                    key_names.push(name);
                }
            }
        }

        Ok(Self {
            signed_info,
            signature_value,
            key_names,
            id: node.attribute(ns::attr::ID).map(str::to_owned),
            signature_node: Some(sigtuna_xml::node_index(node)),
        })
    }

    /// Verify the signature value and validate every reference against
    /// the document the signature was unmarshaled from.
    ///
    /// `key` may be omitted when the context carries a `KeySelector`.
    pub fn validate(
        &mut self,
        ctx: &DsigContext,
        xml: &str,
        key: Option<&SigningKey>,
    ) -> Result<SignatureVerification> {
        let sig_index = self
            .signature_node
            .ok_or_else(|| Error::InvalidState("signature was not loaded from a document".into()))?;
        let signature_value = self
            .signature_value
            .clone()
            .ok_or_else(|| Error::Marshal("Signature has no SignatureValue".into()))?;

        let selected;
        let key = match key {
            Some(k) => k,
            None => match &ctx.key_selector {
                Some(selector) => {
                    selected =
                        selector.select(&self.signed_info.signature_method, &self.key_names)?;
                    &selected
                }
                None => {
                    return Err(Error::KeyResolution(
                        "no verification key and no key selector".into(),
                    ))
                }
            },
        };

        let doc = parse(xml)?;
        let id_map = id_map_for(&doc, ctx)?;
        let sig_node = doc
            .get_node(roxmltree::NodeId::new(sig_index as u32))
            .ok_or_else(|| Error::InvalidState("signature node not found in document".into()))?;
        let si_node = sigtuna_xml::find_child_element(sig_node, ns::DSIG, ns::node::SIGNED_INFO)
            .ok_or_else(|| Error::Marshal("Signature is missing SignedInfo".into()))?;

        let signed_info_bytes = canonicalize_subtree(
            &doc,
            si_node,
            self.signed_info.c14n_method,
            &self.signed_info.inclusive_prefixes,
        )?;

        let sig_alg = AlgorithmRegistry::global()
            .lookup_signature(&self.signed_info.signature_method, ctx.secure_validation)?;
        let signature_valid = sig_alg.verify(key, &signed_info_bytes, &signature_value)?;

        // Validate every reference; a failure never short-circuits the
        // others.
        let tctx = transform_context(xml, id_map, Some(sig_node), ctx, false);
        let mut references = Vec::new();
        for reference in &mut self.signed_info.references {
            let valid = reference.validate(&tctx)?;
            if !valid {
                tracing::debug!(uri = ?reference.uri(), "reference digest mismatch");
            }
            references.push(ReferenceResult {
                uri: reference.uri().map(str::to_owned),
                valid,
            });
        }

        Ok(SignatureVerification {
            signature_valid,
            references,
        })
    }
}

fn parse(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse_with_options(xml, sigtuna_xml::parsing_options())
        .map_err(|e| Error::XmlParse(e.to_string()))
}

fn id_map_for(
    doc: &roxmltree::Document<'_>,
    ctx: &DsigContext,
) -> Result<HashMap<String, usize>> {
    let names: Vec<&str> = ["Id", "ID", "id"]
        .into_iter()
        .chain(ctx.id_attrs.iter().map(|s| s.as_str()))
        .collect();
    build_id_map(doc, &names, ctx.secure_validation)
}

fn transform_context<'a>(
    xml: &'a str,
    id_map: HashMap<String, usize>,
    sig_node: Option<roxmltree::Node<'_, '_>>,
    ctx: &'a DsigContext,
    signing: bool,
) -> TransformContext<'a> {
    let mut tctx = TransformContext::new(xml);
    tctx.id_map = id_map;
    tctx.signature_node = sig_node.map(sigtuna_xml::node_index);
    tctx.detached_payload = ctx.detached_payload.clone();
    tctx.url_maps = ctx.url_maps.clone();
    tctx.base_dir = ctx.base_dir.clone();
    tctx.secure_validation = ctx.secure_validation;
    tctx.use_c14n11 = ctx.use_c14n11;
    tctx.cache_reference = ctx.cache_reference;
    tctx.signing = signing;
    tctx.dereferencer = ctx.dereferencer.as_deref();
    tctx
}

fn canonicalize_subtree(
    doc: &roxmltree::Document<'_>,
    node: roxmltree::Node<'_, '_>,
    mode: C14nMode,
    inclusive_prefixes: &[String],
) -> Result<Vec<u8>> {
    let nodes = if mode.with_comments() {
        NodeSet::tree_with_comments(node)
    } else {
        NodeSet::tree_without_comments(node)
    };
    sigtuna_c14n::canonicalize_doc(doc, mode, Some(&nodes), None, inclusive_prefixes)
}

/// Splice `insert` in as the last child of the document element,
/// returning the new text and the byte offset of the insertion.
fn insert_as_last_child(xml: &str, insert: &str) -> Result<(String, usize)> {
    let doc = parse(xml)?;
    let root = doc.root_element();
    let range = root.range();
    drop(doc);
    let slice = &xml[range.clone()];

    if let Some(stripped) = slice.strip_suffix("/>") {
        // Self-closing document element: expand it.
        let name_end = stripped[1..]
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .map(|i| i + 1)
            .unwrap_or(stripped.len());
        let name = &stripped[1..name_end];
        let mut out = String::with_capacity(xml.len() + insert.len() + name.len() + 3);
        out.push_str(&xml[..range.start]);
        out.push_str(stripped);
        out.push('>');
        let offset = out.len();
        out.push_str(insert);
        out.push_str("</");
        out.push_str(name);
        out.push('>');
        out.push_str(&xml[range.end..]);
        Ok((out, offset))
    } else {
        let close_start = range.start
            + slice
                .rfind("</")
                .ok_or_else(|| Error::XmlParse("document element has no close tag".into()))?;
        let mut out = String::with_capacity(xml.len() + insert.len());
        out.push_str(&xml[..close_start]);
        out.push_str(insert);
        out.push_str(&xml[close_start..]);
        Ok((out, close_start))
    }
}

fn element_starting_at<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
    offset: usize,
) -> Result<roxmltree::Node<'a, 'input>> {
    doc.descendants()
        .find(|n| n.is_element() && n.range().start == offset)
        .ok_or_else(|| Error::InvalidState("marshaled signature not found at offset".into()))
}
