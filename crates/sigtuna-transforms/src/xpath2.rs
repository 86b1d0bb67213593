#![forbid(unsafe_code)]

//! XPath Filter 2.0.
//!
//! Each `<XPath Filter="union|intersect|subtract">` expression is
//! evaluated into a set of subtree roots.  The combined sets U/I/S
//! drive a tri-state membership filter:
//!
//! - descendant-or-self of S → drop with the whole subtree,
//! - I non-empty and not descendant-or-self of I → drop the node but
//!   continue into children, unless descendant-or-self of U,
//! - keep otherwise.
//!
//! The filter implements both the plain per-node contract (ancestor
//! walks) and the level-memoized contract the canonicalizer calls in
//! document order, which remembers the shallowest enclosing root per
//! set and answers in O(1) per node.

use crate::chain::Transform;
use crate::context::TransformContext;
use crate::data::Data;
use sigtuna_core::{algorithm, ns, Error, Result};
use sigtuna_xml::xpath::{self, NsBindings};
use sigtuna_xml::{node_index, Include, NodeFilter, NodeSet};
use std::cell::Cell;
use std::collections::HashSet;

/// The set operation an XPath expression contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Union,
    Intersect,
    Subtract,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Union => ns::XPATH2_FILTER_UNION,
            FilterOp::Intersect => ns::XPATH2_FILTER_INTERSECT,
            FilterOp::Subtract => ns::XPATH2_FILTER_SUBTRACT,
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ns::XPATH2_FILTER_UNION => Ok(FilterOp::Union),
            ns::XPATH2_FILTER_INTERSECT => Ok(FilterOp::Intersect),
            ns::XPATH2_FILTER_SUBTRACT => Ok(FilterOp::Subtract),
            other => Err(Error::Marshal(format!("unknown XPath2 filter: {other}"))),
        }
    }
}

/// One `<XPath>` entry of the transform.
#[derive(Debug, Clone)]
pub struct FilterExpr {
    pub op: FilterOp,
    pub expression: String,
    pub bindings: NsBindings,
}

/// The XPath Filter 2.0 transform.
pub struct XPathFilter2Transform {
    filters: Vec<FilterExpr>,
}

impl XPathFilter2Transform {
    pub fn new(filters: Vec<FilterExpr>) -> Result<Self> {
        if filters.is_empty() {
            return Err(Error::Marshal(
                "XPath Filter 2.0 transform requires at least one XPath".into(),
            ));
        }
        Ok(Self { filters })
    }

    /// Read the `<XPath Filter="…">` children of a `<Transform>`.
    pub fn from_element(node: roxmltree::Node<'_, '_>) -> Result<Self> {
        let mut filters = Vec::new();
        for child in node.children() {
            if !child.is_element()
                || child.tag_name().name() != ns::node::XPATH
                || child.tag_name().namespace().unwrap_or("") != ns::XPATH2
            {
                continue;
            }
            let op = FilterOp::from_str(
                child
                    .attribute(ns::attr::FILTER)
                    .ok_or_else(|| Error::Marshal("XPath2 is missing Filter".into()))?,
            )?;
            filters.push(FilterExpr {
                op,
                expression: sigtuna_xml::document::text_content(child).trim().to_owned(),
                bindings: xpath::ns_bindings_of(child),
            });
        }
        Self::new(filters)
    }

    /// Evaluate the expressions against the document and build the
    /// membership filter.
    pub fn build_filter(
        &self,
        doc: &roxmltree::Document<'_>,
        ctx: &TransformContext<'_>,
    ) -> Result<XPath2NodeFilter> {
        let mut union = HashSet::new();
        let mut intersect = HashSet::new();
        let mut subtract = HashSet::new();
        for f in &self.filters {
            let roots = xpath::select_roots(
                doc,
                &f.expression,
                &f.bindings,
                &ctx.id_map,
                ctx.here_node,
            )?;
            let target = match f.op {
                FilterOp::Union => &mut union,
                FilterOp::Intersect => &mut intersect,
                FilterOp::Subtract => &mut subtract,
            };
            target.extend(roots.node_ids().iter().copied());
        }
        Ok(XPath2NodeFilter::new(union, subtract, intersect))
    }
}

impl Transform for XPathFilter2Transform {
    fn uri(&self) -> &str {
        algorithm::XPATH2
    }

    fn transform(&self, data: Data, ctx: &TransformContext<'_>) -> Result<Data> {
        let (xml, input) = data.into_node_set()?;
        let doc = roxmltree::Document::parse_with_options(&xml, sigtuna_xml::parsing_options())
            .map_err(|e| Error::XmlParse(e.to_string()))?;

        let filter = self.build_filter(&doc, ctx)?;
        let mut result = HashSet::new();
        for node in doc.descendants() {
            if input.contains(&node) && filter.is_node_include(node) == Include::Accept {
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
        for f in &self.filters {
            let mut attrs: Vec<(String, String)> = vec![
                ("Filter".to_owned(), f.op.as_str().to_owned()),
                ("xmlns".to_owned(), ns::XPATH2.to_owned()),
            ];
            for (prefix, uri) in &f.bindings {
                if prefix.is_empty() || prefix == "xml" {
                    continue;
                }
                attrs.push((format!("xmlns:{prefix}"), uri.clone()));
            }
            let attr_refs: Vec<(&str, Option<&str>)> = attrs
                .iter()
                .map(|(k, v)| (k.as_str(), Some(v.as_str())))
                .collect();
            w.start_element("XPath", &attr_refs);
            w.text(&f.expression);
            w.end_element();
        }
    }
}

/// The combined union/subtract/intersect membership filter.
pub struct XPath2NodeFilter {
    union: HashSet<usize>,
    subtract: HashSet<usize>,
    intersect: HashSet<usize>,
    has_union: bool,
    has_subtract: bool,
    has_intersect: bool,
    // Shallowest enclosing root level per set for the document-order
    // walk; -1 when outside.
    in_subtract: Cell<i64>,
    in_intersect: Cell<i64>,
    in_union: Cell<i64>,
}

impl XPath2NodeFilter {
    pub fn new(
        union: HashSet<usize>,
        subtract: HashSet<usize>,
        intersect: HashSet<usize>,
    ) -> Self {
        Self {
            has_union: !union.is_empty(),
            has_subtract: !subtract.is_empty(),
            has_intersect: !intersect.is_empty(),
            union,
            subtract,
            intersect,
            in_subtract: Cell::new(-1),
            in_intersect: Cell::new(-1),
            in_union: Cell::new(-1),
        }
    }

    fn rooted(node: roxmltree::Node<'_, '_>, roots: &HashSet<usize>) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if roots.contains(&node_index(n)) {
                return true;
            }
            current = n.parent();
        }
        false
    }
}

impl NodeFilter for XPath2NodeFilter {
    fn is_node_include(&self, node: roxmltree::Node<'_, '_>) -> Include {
        if self.has_subtract && Self::rooted(node, &self.subtract) {
            return Include::Reject;
        }
        if self.has_intersect && !Self::rooted(node, &self.intersect) {
            if self.has_union && Self::rooted(node, &self.union) {
                return Include::Accept;
            }
            return Include::Skip;
        }
        Include::Accept
    }

    fn is_node_include_at(&self, node: roxmltree::Node<'_, '_>, level: usize) -> Include {
        let level = level as i64;
        let idx = node_index(node);
        let mut result = Include::Accept;

        if self.has_subtract {
            let in_s = self.in_subtract.get();
            if in_s == -1 || level <= in_s {
                self.in_subtract
                    .set(if self.subtract.contains(&idx) { level } else { -1 });
            }
            if self.in_subtract.get() != -1 {
                result = Include::Reject;
            }
        }
        if result != Include::Reject && self.has_intersect {
            let in_i = self.in_intersect.get();
            if in_i == -1 || level <= in_i {
                if self.intersect.contains(&idx) {
                    self.in_intersect.set(level);
                } else {
                    self.in_intersect.set(-1);
                    result = Include::Skip;
                }
            }
        }
        if level <= self.in_union.get() {
            self.in_union.set(-1);
        }
        match result {
            Include::Reject => Include::Reject,
            Include::Accept => Include::Accept,
            Include::Skip => {
                if self.has_union {
                    if self.in_union.get() == -1 && self.union.contains(&idx) {
                        self.in_union.set(level);
                    }
                    if self.in_union.get() != -1 {
                        return Include::Accept;
                    }
                }
                Include::Skip
            }
        }
    }
}
