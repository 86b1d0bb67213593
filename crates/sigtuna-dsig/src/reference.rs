#![forbid(unsafe_code)]

//! One signed item: URI, transforms, digest method and digest value.

use base64::Engine;
use sigtuna_core::{algorithm, ns, uri::validate_uri_reference, Error, Result};
use sigtuna_crypto::AlgorithmRegistry;
use sigtuna_transforms::{
    dereference, Data, DigestSink, RefInfo, Transform, TransformChain, TransformContext,
    TransformRegistry,
};
use sigtuna_xml::XmlWriter;

/// Maximum number of transforms per reference under secure validation.
pub const MAXIMUM_TRANSFORM_COUNT: usize = 5;

/// A `<Reference>`: one cryptographic binding between a transformed
/// view of data and its digest.
///
/// Lifecycle: constructed (from the API or from an element), then
/// digested on the sign path or validated on the verify path, and
/// immutable afterwards apart from the cached dereferenced data.
#[derive(Debug)]
pub struct Reference {
    uri: Option<String>,
    ref_type: Option<String>,
    id: Option<String>,
    digest_method: String,
    chain: TransformChain,
    /// Pre-transformed input supplied by the caller; skips
    /// dereferencing when present.
    applied_transform_data: Option<Data>,
    digest_value: Option<Vec<u8>>,
    calc_digest_value: Option<Vec<u8>>,
    validated: Option<bool>,
    /// Emit the implicit C14N 1.1 transform on marshal (set while
    /// digesting under `use_c14n11`).
    materialized_c14n11: bool,
    /// Node index of the element carrying the URI attribute (`here()`).
    here_node: Option<usize>,
    // cache_reference artifacts
    deref_data: Option<Data>,
    digest_input: Option<Vec<u8>>,
}

impl Reference {
    /// Create a reference.  A non-empty URI must be a well-formed URI
    /// reference.
    pub fn new(uri: Option<&str>, digest_method: &str) -> Result<Self> {
        if let Some(u) = uri {
            if !u.is_empty() && !u.starts_with('#') {
                validate_uri_reference(u)?;
            }
        }
        Ok(Self {
            uri: uri.map(str::to_owned),
            ref_type: None,
            id: None,
            digest_method: digest_method.to_owned(),
            chain: TransformChain::new(),
            applied_transform_data: None,
            digest_value: None,
            calc_digest_value: None,
            validated: None,
            materialized_c14n11: false,
            here_node: None,
            deref_data: None,
            digest_input: None,
        })
    }

    pub fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_owned());
    }

    pub fn set_type(&mut self, ref_type: &str) -> Result<()> {
        if !ref_type.is_empty() {
            validate_uri_reference(ref_type)?;
        }
        self.ref_type = Some(ref_type.to_owned());
        Ok(())
    }

    pub fn push_transform(&mut self, transform: Box<dyn Transform>) {
        self.chain.push(transform);
    }

    /// Supply pre-transformed data; `digest` will use it instead of
    /// dereferencing the URI.
    pub fn set_applied_transform_data(&mut self, data: Data) {
        self.applied_transform_data = Some(data);
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn ref_type(&self) -> Option<&str> {
        self.ref_type.as_deref()
    }

    pub fn digest_method(&self) -> &str {
        &self.digest_method
    }

    pub fn digest_value(&self) -> Option<&[u8]> {
        self.digest_value.as_deref()
    }

    pub fn calculated_digest_value(&self) -> Option<&[u8]> {
        self.calc_digest_value.as_deref()
    }

    pub fn is_digested(&self) -> bool {
        self.digest_value.is_some()
    }

    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        self.chain.transforms()
    }

    /// The dereferenced data retained under `cache_reference`.
    pub fn dereferenced_data(&self) -> Option<&Data> {
        self.deref_data.as_ref()
    }

    /// The exact octets fed to the digest, retained under
    /// `cache_reference`.
    pub fn digest_input(&self) -> Option<&[u8]> {
        self.digest_input.as_deref()
    }

    /// Dereference, transform and digest; stores the digest value.
    pub fn digest(&mut self, ctx: &TransformContext<'_>) -> Result<()> {
        let (value, outcome_c14n11, captured) = self
            .transform_and_digest(ctx)
            .map_err(|e| Error::Signature(format!("reference digest failed: {e}")))?;
        self.digest_value = Some(value);
        self.materialized_c14n11 |= outcome_c14n11;
        self.digest_input = captured;
        Ok(())
    }

    /// Validate the stored digest value against a fresh computation.
    ///
    /// Idempotent: a second call returns the cached status without
    /// re-reading the source.  A mismatch is a `false` result, never an
    /// error.
    pub fn validate(&mut self, ctx: &TransformContext<'_>) -> Result<bool> {
        if let Some(status) = self.validated {
            return Ok(status);
        }
        let expected = self
            .digest_value
            .clone()
            .ok_or_else(|| Error::InvalidState("reference has no digest value".into()))?;
        let (calculated, _, captured) = self
            .transform_and_digest(ctx)
            .map_err(|e| Error::Signature(format!("reference validation failed: {e}")))?;
        self.digest_input = captured;

        use subtle::ConstantTimeEq;
        let status =
            expected.len() == calculated.len() && bool::from(expected.ct_eq(&calculated));
        self.calc_digest_value = Some(calculated);
        self.validated = Some(status);
        Ok(status)
    }

    fn transform_and_digest(
        &mut self,
        ctx: &TransformContext<'_>,
    ) -> Result<(Vec<u8>, bool, Option<Vec<u8>>)> {
        let data = match &self.applied_transform_data {
            Some(data) => data.clone(),
            None => {
                let ref_info = RefInfo {
                    uri: self.uri.as_deref(),
                    base_uri: ctx.base_dir.as_deref(),
                    here: self.here_node,
                };
                let data = dereference::dereference(&ref_info, ctx)?;
                if ctx.cache_reference {
                    self.deref_data = Some(data.clone());
                }
                data
            }
        };

        let digest =
            AlgorithmRegistry::global().lookup_digest(&self.digest_method, ctx.secure_validation)?;
        let mut sink = if ctx.cache_reference {
            DigestSink::with_capture(digest)
        } else {
            DigestSink::new(digest)
        };

        // The reference element's URI attribute is this reference's
        // `here` node for XPath evaluation.
        let mut chain_ctx = TransformContext::new(ctx.xml);
        chain_ctx.id_map = ctx.id_map.clone();
        chain_ctx.signature_node = ctx.signature_node;
        chain_ctx.here_node = self.here_node.or(ctx.here_node);
        chain_ctx.detached_payload = ctx.detached_payload.clone();
        chain_ctx.url_maps = ctx.url_maps.clone();
        chain_ctx.base_dir = ctx.base_dir.clone();
        chain_ctx.secure_validation = ctx.secure_validation;
        chain_ctx.use_c14n11 = ctx.use_c14n11;
        chain_ctx.cache_reference = ctx.cache_reference;
        chain_ctx.signing = ctx.signing;

        let outcome = self.chain.execute_to_sink(data, &chain_ctx, &mut sink)?;
        let (value, captured) = sink.finish();
        Ok((value, outcome.materialized_c14n11, captured))
    }

    /// Emit `<Reference Id? URI? Type?><Transforms>?<DigestMethod/>
    /// <DigestValue>…</DigestValue></Reference>`.
    ///
    /// A materialized implicit C14N 1.1 transform gets a fresh
    /// `<Transforms>` before `<DigestMethod>` when the chain was
    /// otherwise empty.
    pub fn marshal(&self, w: &mut XmlWriter) {
        w.start_element(
            ns::node::REFERENCE,
            &[
                (ns::attr::ID, self.id.as_deref()),
                (ns::attr::URI, self.uri.as_deref()),
                (ns::attr::TYPE, self.ref_type.as_deref()),
            ],
        );

        if !self.chain.is_empty() || self.materialized_c14n11 {
            w.start_element(ns::node::TRANSFORMS, &[]);
            for t in self.chain.transforms() {
                w.start_element(ns::node::TRANSFORM, &[(ns::attr::ALGORITHM, Some(t.uri()))]);
                t.marshal_params(w);
                w.end_element();
            }
            if self.materialized_c14n11 {
                w.empty_element(
                    ns::node::TRANSFORM,
                    &[(ns::attr::ALGORITHM, Some(algorithm::C14N11))],
                );
            }
            w.end_element();
        }

        w.empty_element(
            ns::node::DIGEST_METHOD,
            &[(ns::attr::ALGORITHM, Some(&self.digest_method))],
        );
        w.start_element(ns::node::DIGEST_VALUE, &[]);
        if let Some(value) = &self.digest_value {
            w.text(&base64::engine::general_purpose::STANDARD.encode(value));
        }
        w.end_element();
        w.end_element();
    }

    /// Unmarshal a `<Reference>` element.  Enforces the transform cap
    /// and the digest deny-list under secure validation.
    pub fn from_element(
        node: roxmltree::Node<'_, '_>,
        registry: &TransformRegistry,
        secure_validation: bool,
    ) -> Result<Self> {
        let mut chain = TransformChain::new();
        if let Some(transforms) =
            sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::TRANSFORMS)
        {
            let mut count = 0usize;
            for t_node in transforms.children() {
                if !t_node.is_element() || t_node.tag_name().name() != ns::node::TRANSFORM {
                    continue;
                }
                count += 1;
                if secure_validation && count > MAXIMUM_TRANSFORM_COUNT {
                    return Err(Error::Marshal(format!(
                        "a maximum of {MAXIMUM_TRANSFORM_COUNT} transforms per Reference are \
                         allowed with secure validation"
                    )));
                }
                chain.push(registry.from_element(t_node)?);
            }
        }

        let digest_method_node =
            sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::DIGEST_METHOD)
                .ok_or_else(|| Error::Marshal("Reference is missing DigestMethod".into()))?;
        let digest_method = digest_method_node
            .attribute(ns::attr::ALGORITHM)
            .ok_or_else(|| Error::Marshal("DigestMethod is missing Algorithm".into()))?
            .to_owned();
        if secure_validation && AlgorithmRegistry::global().is_denied(&digest_method) {
            return Err(Error::Marshal(format!(
                "it is forbidden to use algorithm {digest_method} when secure validation is \
                 enabled"
            )));
        }

        let digest_value_node =
            sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::DIGEST_VALUE)
                .ok_or_else(|| Error::Marshal("Reference is missing DigestValue".into()))?;
        let b64: String = sigtuna_xml::document::text_content(digest_value_node)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let digest_value = if b64.is_empty() {
            None
        } else {
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(&b64)
                    .map_err(|e| Error::Marshal(format!("DigestValue: {e}")))?,
            )
        };

        let mut reference = Self::new(node.attribute(ns::attr::URI), &digest_method)
            .map_err(|e| Error::Marshal(e.to_string()))?;
        reference.chain = chain;
        reference.digest_value = digest_value;
        reference.id = node.attribute(ns::attr::ID).map(str::to_owned);
        reference.ref_type = node.attribute(ns::attr::TYPE).map(str::to_owned);
        reference.here_node = Some(sigtuna_xml::node_index(node));
        Ok(reference)
    }
}

/// Structural equality on digest method, id, uri, type, transform list
/// and digest value.
impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        let transforms_equal = self.chain.len() == other.chain.len()
            && self
                .chain
                .transforms()
                .iter()
                .zip(other.chain.transforms())
                .all(|(a, b)| a.uri() == b.uri());
        self.digest_method == other.digest_method
            && self.id == other.id
            && self.uri == other.uri
            && self.ref_type == other.ref_type
            && transforms_equal
            && self.digest_value == other.digest_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigtuna_xml::document::build_id_map;

    fn ctx_for<'a>(xml: &'a str) -> TransformContext<'a> {
        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut ctx = TransformContext::new(xml);
        ctx.id_map = build_id_map(&doc, &["Id"], false).unwrap();
        ctx
    }

    #[test]
    fn digest_then_validate_round_trip() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let ctx = ctx_for(xml);
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.digest(&ctx).unwrap();
        assert!(reference.is_digested());
        assert_eq!(reference.digest_value().unwrap().len(), 32);
        assert!(reference.validate(&ctx).unwrap());
    }

    #[test]
    fn validate_is_idempotent_and_cached() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let ctx = ctx_for(xml);
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.digest(&ctx).unwrap();

        assert!(reference.validate(&ctx).unwrap());
        // A second validation must return the cached status without
        // re-reading the source, even against a different context.
        let other = TransformContext::new("<doc/>");
        assert!(reference.validate(&other).unwrap());
    }

    #[test]
    fn tampered_digest_fails_validation() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let ctx = ctx_for(xml);
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.digest(&ctx).unwrap();
        reference.digest_value.as_mut().unwrap()[0] ^= 0xFF;
        assert!(!reference.validate(&ctx).unwrap());
    }

    #[test]
    fn cache_reference_retains_data_and_digest_input() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let mut ctx = ctx_for(xml);
        ctx.cache_reference = true;
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.digest(&ctx).unwrap();

        assert!(reference.dereferenced_data().is_some());
        let replayed = reference.digest_input().unwrap().to_vec();
        assert_eq!(
            replayed,
            sigtuna_c14n::canonicalize(
                xml,
                sigtuna_c14n::C14nMode::Inclusive,
                Some(&{
                    let doc = roxmltree::Document::parse(xml).unwrap();
                    let part = doc
                        .descendants()
                        .find(|n| n.tag_name().name() == "part")
                        .unwrap();
                    sigtuna_xml::NodeSet::tree_without_comments(part)
                }),
                None,
                &[],
            )
            .unwrap()
        );
    }

    #[test]
    fn invalid_uri_rejected_at_construction() {
        assert!(Reference::new(Some("http://a b/"), algorithm::SHA256).is_err());
        assert!(Reference::new(Some("#fragment ok even with space"), algorithm::SHA256).is_ok());
    }

    #[test]
    fn transform_cap_enforced_under_secure_validation() {
        let transform = format!(
            r#"<Transform Algorithm="{}"/>"#,
            algorithm::BASE64
        );
        let xml = format!(
            r##"<Reference xmlns="{dsig}" URI="#x"><Transforms>{transforms}</Transforms><DigestMethod Algorithm="{dm}"/><DigestValue>AA==</DigestValue></Reference>"##,
            dsig = ns::DSIG,
            transforms = transform.repeat(6),
            dm = algorithm::SHA256,
        );
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let registry = TransformRegistry::scoped();
        let err = Reference::from_element(doc.root_element(), &registry, true).unwrap_err();
        assert!(err.to_string().contains('5'), "error should name the cap: {err}");
        assert!(Reference::from_element(doc.root_element(), &registry, false).is_ok());
    }

    #[test]
    fn md5_digest_rejected_under_secure_validation() {
        let xml = format!(
            r##"<Reference xmlns="{dsig}" URI="#x"><DigestMethod Algorithm="{dm}"/><DigestValue>AA==</DigestValue></Reference>"##,
            dsig = ns::DSIG,
            dm = algorithm::MD5,
        );
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let registry = TransformRegistry::scoped();
        assert!(matches!(
            Reference::from_element(doc.root_element(), &registry, true),
            Err(Error::Marshal(_))
        ));
        assert!(Reference::from_element(doc.root_element(), &registry, false).is_ok());
    }

    #[test]
    fn marshal_emits_schema_order() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let ctx = ctx_for(xml);
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.set_id("ref-1");
        reference.digest(&ctx).unwrap();

        let mut w = XmlWriter::new();
        reference.marshal(&mut w);
        let out = w.into_string();
        assert!(out.starts_with(r##"<Reference Id="ref-1" URI="#p1">"##));
        let dm_pos = out.find("<DigestMethod").unwrap();
        let dv_pos = out.find("<DigestValue>").unwrap();
        assert!(dm_pos < dv_pos);
    }

    #[test]
    fn materialized_c14n11_gets_fresh_transforms_element() {
        let xml = r#"<doc><part Id="p1">content</part></doc>"#;
        let mut ctx = ctx_for(xml);
        ctx.signing = true;
        ctx.use_c14n11 = true;
        let mut reference = Reference::new(Some("#p1"), algorithm::SHA256).unwrap();
        reference.digest(&ctx).unwrap();

        let mut w = XmlWriter::new();
        reference.marshal(&mut w);
        let out = w.into_string();
        let transforms_pos = out.find("<Transforms>").expect("Transforms materialized");
        let dm_pos = out.find("<DigestMethod").unwrap();
        assert!(transforms_pos < dm_pos);
        assert!(out.contains(algorithm::C14N11));
    }

    #[test]
    fn structural_equality() {
        let a = Reference::new(Some("#x"), algorithm::SHA256).unwrap();
        let b = Reference::new(Some("#x"), algorithm::SHA256).unwrap();
        let c = Reference::new(Some("#y"), algorithm::SHA256).unwrap();
        assert!(a == b);
        assert!(a != c);
    }
}
