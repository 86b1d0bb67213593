#![forbid(unsafe_code)]

//! The `Transform` trait, the per-reference transform chain, and the
//! URI-keyed transform registry.

use crate::context::TransformContext;
use crate::data::Data;
use crate::sink::DigestSink;
use sigtuna_c14n::C14nMode;
use sigtuna_core::{algorithm, ns, Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// A URI-identified operation on a [`Data`] value.
pub trait Transform: Send {
    /// The algorithm URI.
    fn uri(&self) -> &str;

    /// Whether the transform can terminate a chain by streaming octets
    /// into the digest sink.  The chain planner uses this to decide
    /// where implicit canonicalization inserts itself.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Non-terminal application.
    fn transform(&self, data: Data, ctx: &TransformContext<'_>) -> Result<Data>;

    /// Terminal application.  Streaming transforms write octets into
    /// `sink` and return `None`; others return the transformed data so
    /// the chain can canonicalize it.
    fn transform_to_sink(
        &self,
        data: Data,
        ctx: &TransformContext<'_>,
        sink: &mut DigestSink,
    ) -> Result<Option<Data>> {
        let out = self.transform(data, ctx)?;
        if self.is_streaming() {
            match out {
                Data::OctetStream { bytes, .. } => {
                    sink.write(&bytes);
                    Ok(None)
                }
                other => Ok(Some(other)),
            }
        } else {
            Ok(Some(out))
        }
    }

    /// Marshal the transform's parameter children (the content between
    /// `<Transform>` and `</Transform>`), if any.
    fn marshal_params(&self, _w: &mut sigtuna_xml::XmlWriter) {}
}

/// Result of running a chain into the digest sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChainOutcome {
    /// The implicit canonicalization was C14N 1.1 and must be
    /// materialized into the reference's `Transforms` on marshal.
    pub materialized_c14n11: bool,
}

/// An ordered list of transforms applied to a reference.
#[derive(Default)]
pub struct TransformChain {
    transforms: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformChain")
            .field("transforms", &self.transforms.iter().map(|t| t.uri()).collect::<Vec<_>>())
            .finish()
    }
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        &self.transforms
    }

    /// Apply all transforms without a terminal sink.
    pub fn execute(&self, input: Data, ctx: &TransformContext<'_>) -> Result<Data> {
        let mut data = input;
        for t in &self.transforms {
            data = t.transform(data, ctx)?;
        }
        Ok(data)
    }

    /// Apply the chain with the last transform in terminal position,
    /// then canonicalize whatever is still a node-set into the sink.
    ///
    /// At most one terminal invocation happens per call; the implicit
    /// canonicalization is C14N 1.0 unless the context asks for C14N
    /// 1.1 on the sign path, in which case the outcome tells the
    /// caller to materialize the transform.
    pub fn execute_to_sink(
        &self,
        input: Data,
        ctx: &TransformContext<'_>,
        sink: &mut DigestSink,
    ) -> Result<ChainOutcome> {
        let mut data = Some(input);
        let count = self.transforms.len();
        for (i, t) in self.transforms.iter().enumerate() {
            let d = data.take().expect("chain data present");
            if i + 1 < count {
                data = Some(t.transform(d, ctx)?);
            } else {
                data = t.transform_to_sink(d, ctx, sink)?;
            }
        }

        let mut outcome = ChainOutcome::default();
        if let Some(d) = data {
            match d {
                Data::OctetStream { bytes, .. } => sink.write(&bytes),
                xml_data => {
                    let c14n11 = ctx.signing && ctx.use_c14n11;
                    let mode = if c14n11 {
                        C14nMode::Inclusive11
                    } else {
                        C14nMode::Inclusive
                    };
                    let (xml, nodes) = xml_data.into_node_set()?;
                    let bytes = sigtuna_c14n::canonicalize(&xml, mode, Some(&nodes), None, &[])?;
                    sink.write(&bytes);
                    outcome.materialized_c14n11 = c14n11;
                }
            }
        }
        Ok(outcome)
    }
}

// ── Canonicalization transform ───────────────────────────────────────

/// A canonicalization transform.
pub struct C14nTransform {
    mode: C14nMode,
    inclusive_prefixes: Vec<String>,
}

impl C14nTransform {
    pub fn new(mode: C14nMode, inclusive_prefixes: Vec<String>) -> Self {
        Self {
            mode,
            inclusive_prefixes,
        }
    }
}

impl Transform for C14nTransform {
    fn uri(&self) -> &str {
        self.mode.uri()
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn transform(&self, data: Data, _ctx: &TransformContext<'_>) -> Result<Data> {
        let (xml, nodes) = data.into_node_set()?;
        let bytes = sigtuna_c14n::canonicalize(
            &xml,
            self.mode,
            Some(&nodes),
            None,
            &self.inclusive_prefixes,
        )?;
        Ok(Data::octets(bytes))
    }

    fn marshal_params(&self, w: &mut sigtuna_xml::XmlWriter) {
        if self.mode.is_exclusive() && !self.inclusive_prefixes.is_empty() {
            w.empty_element(
                "InclusiveNamespaces",
                &[
                    ("xmlns", Some(ns::EXC_C14N)),
                    ("PrefixList", Some(&self.inclusive_prefixes.join(" "))),
                ],
            );
        }
    }
}

// ── Transform registry ───────────────────────────────────────────────

type TransformFactory =
    Box<dyn for<'a, 'b> Fn(roxmltree::Node<'a, 'b>) -> Result<Box<dyn Transform>> + Send + Sync>;

/// URI → transform factory, for unmarshaling `<Transform>` elements.
///
/// Factories receive the `<Transform>` element so parameterized
/// transforms can read their children.  Like the algorithm registry,
/// the global instance seals on first lookup.
pub struct TransformRegistry {
    factories: HashMap<String, TransformFactory>,
    sealed: AtomicBool,
}

impl TransformRegistry {
    pub fn global() -> &'static TransformRegistry {
        static GLOBAL: OnceLock<TransformRegistry> = OnceLock::new();
        GLOBAL.get_or_init(TransformRegistry::scoped)
    }

    pub fn scoped() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            sealed: AtomicBool::new(false),
        };
        registry.install_defaults();
        registry
    }

    fn install_defaults(&mut self) {
        for uri in [
            algorithm::C14N,
            algorithm::C14N_WITH_COMMENTS,
            algorithm::C14N11,
            algorithm::C14N11_WITH_COMMENTS,
            algorithm::EXC_C14N,
            algorithm::EXC_C14N_WITH_COMMENTS,
        ] {
            self.factories.insert(
                uri.to_owned(),
                Box::new(move |node| {
                    let mode = C14nMode::from_uri(uri)
                        .ok_or_else(|| Error::UnsupportedAlgorithm(format!("C14N: {uri}")))?;
                    let prefixes = read_inclusive_prefixes(node);
                    Ok(Box::new(C14nTransform::new(mode, prefixes)) as Box<dyn Transform>)
                }),
            );
        }
        self.factories.insert(
            algorithm::BASE64.to_owned(),
            Box::new(|_| Ok(Box::new(crate::base64_transform::Base64DecodeTransform))),
        );
        self.factories.insert(
            algorithm::ENVELOPED_SIGNATURE.to_owned(),
            Box::new(|_| Ok(Box::new(crate::enveloped::EnvelopedSignatureTransform))),
        );
        self.factories.insert(
            algorithm::XPATH.to_owned(),
            Box::new(|node| {
                Ok(Box::new(crate::xpath_filter::XPathFilterTransform::from_element(node)?)
                    as Box<dyn Transform>)
            }),
        );
        self.factories.insert(
            algorithm::XPATH2.to_owned(),
            Box::new(|node| {
                Ok(Box::new(crate::xpath2::XPathFilter2Transform::from_element(node)?)
                    as Box<dyn Transform>)
            }),
        );
        self.factories.insert(
            algorithm::XPOINTER.to_owned(),
            Box::new(|node| {
                Ok(Box::new(crate::xpointer::XPointerTransform::from_element(node)?)
                    as Box<dyn Transform>)
            }),
        );
    }

    /// Register a custom transform factory.  Only allowed before the
    /// first lookup.
    pub fn register_transform(&mut self, uri: &str, factory: TransformFactory) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized(uri.to_owned()));
        }
        self.factories.insert(uri.to_owned(), factory);
        Ok(())
    }

    /// Build a transform from a `<Transform Algorithm="…">` element.
    pub fn from_element(&self, node: roxmltree::Node<'_, '_>) -> Result<Box<dyn Transform>> {
        self.sealed.store(true, Ordering::Release);
        let uri = node
            .attribute(ns::attr::ALGORITHM)
            .ok_or_else(|| Error::Marshal("Transform is missing Algorithm".into()))?;
        match self.factories.get(uri) {
            Some(factory) => factory(node),
            None => Err(Error::UnsupportedAlgorithm(format!("transform: {uri}"))),
        }
    }

    /// Build a transform from a bare URI (no parameters).
    pub fn lookup(&self, uri: &str) -> Result<Box<dyn Transform>> {
        self.sealed.store(true, Ordering::Release);
        // A transform built from a bare URI has no parameter children;
        // a synthetic empty element satisfies the factory signature.
        let doc = roxmltree::Document::parse("<t/>").map_err(|e| Error::XmlParse(e.to_string()))?;
        match self.factories.get(uri) {
            Some(factory) => factory(doc.root_element()),
            None => Err(Error::UnsupportedAlgorithm(format!("transform: {uri}"))),
        }
    }
}

/// Read the `InclusiveNamespaces PrefixList` child of a transform or
/// canonicalization-method element.
pub fn read_inclusive_prefixes(node: roxmltree::Node<'_, '_>) -> Vec<String> {
    for child in node.children() {
        if child.is_element() && child.tag_name().name() == ns::node::INCLUSIVE_NAMESPACES {
            if let Some(prefix_list) = child.attribute(ns::attr::PREFIX_LIST) {
                return prefix_list.split_whitespace().map(str::to_owned).collect();
            }
        }
    }
    Vec::new()
}
