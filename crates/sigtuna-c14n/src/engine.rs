#![forbid(unsafe_code)]

//! The shared canonical-form rendering engine.
//!
//! One traversal serves all six variants; inclusive/exclusive and
//! comment handling are mode switches.  Visibility is the conjunction
//! of the optional `NodeSet` and the optional tri-state `NodeFilter`;
//! a `Reject` from the filter prunes a whole subtree without descending.

use crate::escape;
use crate::render::{Attr, NsDecl};
use crate::C14nMode;
use sigtuna_core::Result;
use sigtuna_xml::{Include, NodeFilter, NodeSet};
use std::collections::{BTreeMap, HashSet};

pub(crate) struct Engine<'a> {
    mode: C14nMode,
    node_set: Option<&'a NodeSet>,
    filter: Option<&'a dyn NodeFilter>,
    inclusive_prefixes: HashSet<String>,
}

enum Vis {
    /// Render the node.
    Render,
    /// Skip the node itself but descend into children.
    Skip,
    /// Drop the node and its whole subtree.
    Prune,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        mode: C14nMode,
        node_set: Option<&'a NodeSet>,
        filter: Option<&'a dyn NodeFilter>,
        inclusive_prefixes: &[String],
    ) -> Self {
        Self {
            mode,
            node_set,
            filter,
            inclusive_prefixes: inclusive_prefixes.iter().cloned().collect(),
        }
    }

    pub(crate) fn run(&self, doc: &roxmltree::Document<'_>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for child in doc.root().children() {
            self.process_node(child, 1, &mut out, &BTreeMap::new())?;
        }
        Ok(out)
    }

    /// Visibility of a node under the node set and filter.  The filter
    /// is consulted with the node's document level so memoizing filters
    /// stay O(1) per node.
    fn visibility(&self, node: roxmltree::Node<'_, '_>, level: usize) -> Vis {
        if let Some(f) = self.filter {
            match f.is_node_include_at(node, level) {
                Include::Reject => return Vis::Prune,
                Include::Skip => return Vis::Skip,
                Include::Accept => {}
            }
        }
        if let Some(ns) = self.node_set {
            if !ns.contains(&node) {
                return Vis::Skip;
            }
        }
        Vis::Render
    }

    /// Visibility check outside the document-order walk (parent
    /// lookups).  Uses the level-free filter entry point so the
    /// memoized state is not disturbed.
    fn is_visible_out_of_order(&self, node: roxmltree::Node<'_, '_>) -> bool {
        if let Some(f) = self.filter {
            if f.is_node_include(node) != Include::Accept {
                return false;
            }
        }
        if let Some(ns) = self.node_set {
            if !ns.contains(&node) {
                return false;
            }
        }
        true
    }

    fn process_node(
        &self,
        node: roxmltree::Node<'_, '_>,
        level: usize,
        out: &mut Vec<u8>,
        rendered_ns: &BTreeMap<String, String>,
    ) -> Result<()> {
        match node.node_type() {
            roxmltree::NodeType::Root => {
                for child in node.children() {
                    self.process_node(child, level, out, rendered_ns)?;
                }
            }
            roxmltree::NodeType::Element => {
                let vis = self.visibility(node, level);
                match vis {
                    Vis::Prune => {}
                    Vis::Render => self.render_element(node, level, out, rendered_ns)?,
                    Vis::Skip => {
                        // Children of an unrendered element keep the
                        // namespace context of the nearest rendered
                        // ancestor.
                        for child in node.children() {
                            self.process_node(child, level + 1, out, rendered_ns)?;
                        }
                    }
                }
            }
            roxmltree::NodeType::Text => {
                if matches!(self.visibility(node, level), Vis::Render) {
                    let text = node.text().unwrap_or("");
                    out.extend_from_slice(escape::escape_text(text).as_bytes());
                }
            }
            roxmltree::NodeType::Comment => {
                if self.mode.with_comments()
                    && matches!(self.visibility(node, level), Vis::Render)
                {
                    self.render_outside_doc_element(node, out, |out| {
                        out.extend_from_slice(b"<!--");
                        out.extend_from_slice(node.text().unwrap_or("").as_bytes());
                        out.extend_from_slice(b"-->");
                    });
                }
            }
            roxmltree::NodeType::PI => {
                if matches!(self.visibility(node, level), Vis::Render) {
                    self.render_outside_doc_element(node, out, |out| {
                        out.extend_from_slice(b"<?");
                        if let Some(pi) = node.pi() {
                            out.extend_from_slice(pi.target.as_bytes());
                            if let Some(value) = pi.value {
                                if !value.is_empty() {
                                    out.push(b' ');
                                    out.extend_from_slice(escape::escape_pi(value).as_bytes());
                                }
                            }
                        }
                        out.extend_from_slice(b"?>");
                    });
                }
            }
        }
        Ok(())
    }

    /// Comments and PIs at document level get a newline between
    /// themselves and the document element.
    fn render_outside_doc_element(
        &self,
        node: roxmltree::Node<'_, '_>,
        out: &mut Vec<u8>,
        render: impl FnOnce(&mut Vec<u8>),
    ) {
        let parent_is_root = node
            .parent()
            .is_some_and(|p| p.node_type() == roxmltree::NodeType::Root);
        if parent_is_root && node.prev_siblings().any(|s| s.is_element()) {
            out.push(b'\n');
        }
        render(out);
        if parent_is_root && node.next_siblings().any(|s| s.is_element()) {
            out.push(b'\n');
        }
    }

    fn render_element(
        &self,
        node: roxmltree::Node<'_, '_>,
        level: usize,
        out: &mut Vec<u8>,
        rendered_ns: &BTreeMap<String, String>,
    ) -> Result<()> {
        let current_ns = inscope_namespaces(node);

        let ns_decls = if self.mode.is_exclusive() {
            self.exclusive_ns_decls(node, &current_ns, rendered_ns)
        } else {
            inclusive_ns_decls(&current_ns, rendered_ns)
        };

        let mut attrs = self.collect_attrs(node);

        // In document-subset mode, a rendered element whose parent is
        // not rendered inherits the xml:* attributes of its ancestors
        // (inclusive C14N only; exclusive C14N never imports them).
        let subset_mode = self.node_set.is_some() || self.filter.is_some();
        if subset_mode && !self.mode.is_exclusive() {
            let parent_unrendered = node
                .parent()
                .is_none_or(|p| !p.is_element() || !self.is_visible_out_of_order(p));
            if parent_unrendered {
                let extra = self.inherited_xml_attrs(node, &attrs);
                attrs.extend(extra);
            }
        }
        attrs.sort();

        let elem_name = qualified_element_name(node);

        out.push(b'<');
        out.extend_from_slice(elem_name.as_bytes());
        for decl in &ns_decls {
            out.extend_from_slice(decl.render().as_bytes());
        }
        for attr in &attrs {
            out.extend_from_slice(attr.render().as_bytes());
        }
        out.push(b'>');

        // A rendered element becomes the nearest rendered ancestor for
        // its children: inclusive tracking switches to this element's
        // in-scope set, exclusive tracking adds what was just emitted.
        let child_ns = if self.mode.is_exclusive() {
            let mut m = rendered_ns.clone();
            for decl in &ns_decls {
                m.insert(decl.prefix.clone(), decl.uri.clone());
            }
            m
        } else {
            current_ns.clone()
        };

        for child in node.children() {
            self.process_node(child, level + 1, out, &child_ns)?;
        }

        out.extend_from_slice(b"</");
        out.extend_from_slice(elem_name.as_bytes());
        out.push(b'>');
        Ok(())
    }

    /// Exclusive C14N: only visibly-utilized prefixes are rendered.
    fn exclusive_ns_decls(
        &self,
        node: roxmltree::Node<'_, '_>,
        current_ns: &BTreeMap<String, String>,
        rendered_ns: &BTreeMap<String, String>,
    ) -> Vec<NsDecl> {
        let mut utilized: HashSet<String> = HashSet::new();
        utilized.insert(element_prefix(node));
        for attr in node.attributes() {
            if let Some(uri) = attr.namespace() {
                if uri != sigtuna_core::ns::XML {
                    if let Some(p) = named_prefix_for(node, uri) {
                        utilized.insert(p);
                    }
                }
            }
        }
        for p in &self.inclusive_prefixes {
            if p == "#default" {
                utilized.insert(String::new());
            } else {
                utilized.insert(p.clone());
            }
        }

        let mut decls = Vec::new();
        for prefix in &utilized {
            if prefix == "xml" {
                continue;
            }
            match current_ns.get(prefix) {
                Some(uri) => {
                    if rendered_ns.get(prefix) != Some(uri) {
                        decls.push(NsDecl {
                            prefix: prefix.clone(),
                            uri: uri.clone(),
                        });
                    }
                }
                None if prefix.is_empty() => {
                    // Default namespace was rendered non-empty by an
                    // ancestor and is undeclared here.
                    if rendered_ns.get("").is_some_and(|u| !u.is_empty()) {
                        decls.push(NsDecl {
                            prefix: String::new(),
                            uri: String::new(),
                        });
                    }
                }
                None => {}
            }
        }
        decls.sort();
        decls
    }

    fn collect_attrs(&self, node: roxmltree::Node<'_, '_>) -> Vec<Attr> {
        let mut attrs = Vec::new();
        for attr in node.attributes() {
            let ns_uri = attr.namespace().unwrap_or("");
            let qname = attr_qualified_name(node, &attr);
            attrs.push(Attr {
                ns_uri: ns_uri.to_owned(),
                local_name: attr.name().to_owned(),
                qualified_name: qname,
                value: attr.value().to_owned(),
            });
        }
        attrs
    }

    /// Collect xml:* attributes from ancestors, nearest value winning,
    /// excluding names the element already carries.  C14N 1.1 does not
    /// inherit `xml:id` and `xml:base` this way.
    fn inherited_xml_attrs(
        &self,
        node: roxmltree::Node<'_, '_>,
        existing: &[Attr],
    ) -> Vec<Attr> {
        let xml_ns = sigtuna_core::ns::XML;
        let mut inherited: BTreeMap<String, String> = BTreeMap::new();
        let mut current = node.parent();
        while let Some(ancestor) = current {
            if ancestor.is_element() {
                for attr in ancestor.attributes() {
                    if attr.namespace() == Some(xml_ns) {
                        let name = attr.name();
                        if self.mode.is_c14n11() && (name == "id" || name == "base") {
                            continue;
                        }
                        inherited
                            .entry(name.to_owned())
                            .or_insert_with(|| attr.value().to_owned());
                    }
                }
            }
            current = ancestor.parent();
        }

        inherited
            .into_iter()
            .filter(|(name, _)| {
                !existing
                    .iter()
                    .any(|a| a.ns_uri == xml_ns && a.local_name == *name)
            })
            .map(|(name, value)| Attr {
                ns_uri: xml_ns.to_owned(),
                local_name: name.clone(),
                qualified_name: format!("xml:{name}"),
                value,
            })
            .collect()
    }
}

/// Inclusive C14N: declarations that differ from the nearest rendered
/// ancestor, plus the default-namespace undeclaration.
fn inclusive_ns_decls(
    current_ns: &BTreeMap<String, String>,
    rendered_ns: &BTreeMap<String, String>,
) -> Vec<NsDecl> {
    let mut decls = Vec::new();
    for (prefix, uri) in current_ns {
        if prefix == "xml" {
            continue;
        }
        if rendered_ns.get(prefix) != Some(uri) {
            decls.push(NsDecl {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
    }
    if let Some(inherited_default) = rendered_ns.get("") {
        if !inherited_default.is_empty() && !current_ns.contains_key("") {
            decls.push(NsDecl {
                prefix: String::new(),
                uri: String::new(),
            });
        }
    }
    decls.sort();
    decls
}

/// All namespace bindings in scope at an element, keyed by prefix.
fn inscope_namespaces(node: roxmltree::Node<'_, '_>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for ns in node.namespaces() {
        let prefix = ns.name().unwrap_or("").to_owned();
        if prefix == "xml" {
            continue;
        }
        if !ns.uri().is_empty() {
            map.insert(prefix, ns.uri().to_owned());
        }
    }
    map
}

/// The prefix the element renders with ("" when unprefixed).
fn element_prefix(node: roxmltree::Node<'_, '_>) -> String {
    match node.tag_name().namespace() {
        None => String::new(),
        Some(uri) => {
            let mut named = None;
            for ns in node.namespaces() {
                if ns.uri() == uri {
                    match ns.name() {
                        None => return String::new(),
                        Some(p) => {
                            if named.is_none() {
                                named = Some(p.to_owned());
                            }
                        }
                    }
                }
            }
            named.unwrap_or_default()
        }
    }
}

fn qualified_element_name(node: roxmltree::Node<'_, '_>) -> String {
    let prefix = element_prefix(node);
    if prefix.is_empty() {
        node.tag_name().name().to_owned()
    } else {
        format!("{}:{}", prefix, node.tag_name().name())
    }
}

/// A named (non-default) prefix bound to `uri` in scope at `node`.
fn named_prefix_for(node: roxmltree::Node<'_, '_>, uri: &str) -> Option<String> {
    node.namespaces()
        .find(|ns| ns.uri() == uri && ns.name().is_some())
        .and_then(|ns| ns.name().map(str::to_owned))
}

fn attr_qualified_name(node: roxmltree::Node<'_, '_>, attr: &roxmltree::Attribute<'_, '_>) -> String {
    match attr.namespace() {
        None => attr.name().to_owned(),
        Some(uri) if uri == sigtuna_core::ns::XML => format!("xml:{}", attr.name()),
        Some(uri) => match named_prefix_for(node, uri) {
            Some(prefix) => format!("{}:{}", prefix, attr.name()),
            None => attr.name().to_owned(),
        },
    }
}
