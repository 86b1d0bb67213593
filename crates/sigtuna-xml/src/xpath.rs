#![forbid(unsafe_code)]

//! The XPath 1.0-compatible expression subset used by XML-DSig and
//! XML-Enc documents.
//!
//! This is deliberately not a general XPath engine.  It covers the
//! patterns that appear in signatures and encrypted documents in the
//! wild:
//!
//! - same-document references `#id` and `xpointer(id('…'))`
//! - root-set selection: `/`, `//Name`, `//prefix:Name`, `id('…')`,
//!   `here()/ancestor::prefix:Name`
//! - boolean filters: `ancestor-or-self::prefix:Name`, `self::text()`,
//!   `not(…)`, `and`, `or`
//! - the CipherReference pattern
//!   `self::text()[parent::prefix:Name[@Id="…"]]`
//!
//! Namespace prefixes resolve against bindings captured from the
//! element that carried the expression (the `<XPath>` element), which
//! is how signature processors set up their evaluation contexts.

use crate::nodeset::{node_index, NodeSet};
use sigtuna_core::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Prefix → namespace URI bindings for expression evaluation.
pub type NsBindings = HashMap<String, String>;

/// Capture the in-scope namespace bindings of an element.
///
/// Only named prefixes are kept: XPath 1.0 name tests never consult
/// the default namespace, and the `xml` prefix is implicit.
pub fn ns_bindings_of(node: roxmltree::Node<'_, '_>) -> NsBindings {
    let mut map = HashMap::new();
    for ns in node.namespaces() {
        match ns.name() {
            Some("xml") | None => {}
            Some(prefix) => {
                map.insert(prefix.to_owned(), ns.uri().to_owned());
            }
        }
    }
    map
}

/// Parse a same-document reference (`#foo` → `foo`).
pub fn parse_same_document_ref(uri: &str) -> Option<&str> {
    uri.strip_prefix('#')
}

/// Parse an `xpointer(id('…'))` expression and return the ID value.
pub fn parse_xpointer_id(expr: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        let prefix = format!("xpointer(id({quote}");
        let suffix = format!("{quote}))");
        if let Some(inner) = expr
            .strip_prefix(prefix.as_str())
            .and_then(|s| s.strip_suffix(suffix.as_str()))
        {
            return Some(inner);
        }
    }
    None
}

/// Resolve an ID value in a parsed document using a pre-built ID map.
pub fn resolve_id<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
    id_map: &HashMap<String, usize>,
    id: &str,
) -> Result<roxmltree::Node<'a, 'input>> {
    id_map
        .get(id)
        .and_then(|idx| doc.get_node(roxmltree::NodeId::new(*idx as u32)))
        .ok_or_else(|| Error::InvalidUri(format!("ID not found: {id}")))
}

/// Check whether `ancestor` is an ancestor-or-self of `node`.
pub fn is_ancestor_or_self(
    ancestor: roxmltree::Node<'_, '_>,
    node: roxmltree::Node<'_, '_>,
) -> bool {
    let mut current = Some(node);
    while let Some(n) = current {
        if n.id() == ancestor.id() {
            return true;
        }
        current = n.parent();
    }
    false
}

// ── Root-set selection ───────────────────────────────────────────────

/// Evaluate a root-selecting expression and return the set of matching
/// node indices.  Used by XPath Filter 2.0, where each expression
/// contributes a set of subtree roots.
///
/// `here` is the node index of the element owning the URI attribute,
/// exposed as the `here()` function.
pub fn select_roots(
    doc: &roxmltree::Document<'_>,
    expr: &str,
    bindings: &NsBindings,
    id_map: &HashMap<String, usize>,
    here: Option<usize>,
) -> Result<NodeSet> {
    let expr = expr.trim();

    // `/` — the document root node.
    if expr == "/" {
        return Ok(NodeSet::from_ids(
            [node_index(doc.root())].into_iter().collect(),
        ));
    }

    // `id('X')`
    if let Some(id) = parse_id_call(expr) {
        let node = resolve_id(doc, id_map, id)?;
        return Ok(NodeSet::from_ids([node_index(node)].into_iter().collect()));
    }

    // `here()/ancestor::prefix:Name[1]` and the unindexed form.
    if let Some(rest) = expr.strip_prefix("here()/ancestor::") {
        let here = here
            .and_then(|idx| doc.get_node(roxmltree::NodeId::new(idx as u32)))
            .ok_or_else(|| Error::Transform("here() used outside a reference context".into()))?;
        let name = rest.strip_suffix("[1]").unwrap_or(rest);
        let (ns_uri, local) = split_qname(name, bindings)?;
        let mut result = HashSet::new();
        let mut current = here.parent();
        while let Some(n) = current {
            if element_matches(n, ns_uri.as_deref(), local) {
                result.insert(node_index(n));
                break;
            }
            current = n.parent();
        }
        return Ok(NodeSet::from_ids(result));
    }

    // `//Name` or `//prefix:Name` — all matching elements become roots.
    if let Some(name) = expr.strip_prefix("//") {
        let (ns_uri, local) = split_qname(name, bindings)?;
        let mut result = HashSet::new();
        for node in doc.descendants() {
            if element_matches(node, ns_uri.as_deref(), local) {
                result.insert(node_index(node));
            }
        }
        return Ok(NodeSet::from_ids(result));
    }

    Err(Error::Transform(format!(
        "XPath expression not supported: {expr}"
    )))
}

fn parse_id_call(expr: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        let prefix = format!("id({quote}");
        let suffix = format!("{quote})");
        if let Some(inner) = expr
            .strip_prefix(prefix.as_str())
            .and_then(|s| s.strip_suffix(suffix.as_str()))
        {
            return Some(inner);
        }
    }
    None
}

/// Split `prefix:local` and resolve the prefix.  An unprefixed name
/// matches elements in any namespace (`None`).
fn split_qname<'e>(name: &'e str, bindings: &NsBindings) -> Result<(Option<String>, &'e str)> {
    if let Some((prefix, local)) = name.split_once(':') {
        let uri = bindings
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::Transform(format!("unresolved namespace prefix: {prefix}")))?;
        Ok((Some(uri), local))
    } else {
        Ok((None, name))
    }
}

fn element_matches(node: roxmltree::Node<'_, '_>, ns_uri: Option<&str>, local: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == local
        && match ns_uri {
            Some(uri) => node.tag_name().namespace().unwrap_or("") == uri,
            None => true,
        }
}

// ── Boolean filter expressions ───────────────────────────────────────

/// A parsed XPath boolean filter expression.
#[derive(Debug, Clone)]
pub enum BoolExpr {
    /// `ancestor-or-self::ns:Name`
    AncestorOrSelf {
        ns_uri: Option<String>,
        local: String,
    },
    /// `self::text()`
    SelfText,
    /// `self::text()[parent::Name[@Id="…"]]`
    TextWithParent {
        ns_uri: Option<String>,
        local: String,
        id_value: Option<String>,
    },
    Not(Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
}

/// Parse a boolean filter expression against the given bindings.
pub fn parse_bool_expr(expr: &str, bindings: &NsBindings) -> Option<BoolExpr> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }

    if let Some((left, right)) = split_top_level(expr, " and ") {
        let l = parse_bool_expr(left, bindings)?;
        let r = parse_bool_expr(right, bindings)?;
        return Some(BoolExpr::And(Box::new(l), Box::new(r)));
    }
    if let Some((left, right)) = split_top_level(expr, " or ") {
        let l = parse_bool_expr(left, bindings)?;
        let r = parse_bool_expr(right, bindings)?;
        return Some(BoolExpr::Or(Box::new(l), Box::new(r)));
    }
    if let Some(inner) = strip_not(expr) {
        return Some(BoolExpr::Not(Box::new(parse_bool_expr(inner, bindings)?)));
    }
    if expr.starts_with('(') && expr.ends_with(')') {
        return parse_bool_expr(&expr[1..expr.len() - 1], bindings);
    }
    if expr == "self::text()" {
        return Some(BoolExpr::SelfText);
    }
    if let Some(rest) = expr.strip_prefix("self::text()[parent::") {
        let rest = rest.strip_suffix(']')?;
        // rest = Name or Name[@Id="…"]
        let (name_part, id_value) = match rest.find('[') {
            Some(pos) => {
                let pred = &rest[pos..];
                (
                    &rest[..pos],
                    parse_attr_predicate(pred, "Id").map(str::to_owned),
                )
            }
            None => (rest, None),
        };
        let (ns_uri, local) = split_qname(name_part, bindings).ok()?;
        return Some(BoolExpr::TextWithParent {
            ns_uri,
            local: local.to_owned(),
            id_value,
        });
    }
    if let Some(name) = expr.strip_prefix("ancestor-or-self::") {
        let (ns_uri, local) = split_qname(name, bindings).ok()?;
        return Some(BoolExpr::AncestorOrSelf {
            ns_uri,
            local: local.to_owned(),
        });
    }
    None
}

/// Evaluate a parsed boolean expression for a node.
pub fn eval_bool_expr(expr: &BoolExpr, node: roxmltree::Node<'_, '_>) -> bool {
    match expr {
        BoolExpr::AncestorOrSelf { ns_uri, local } => {
            let mut current = Some(node);
            while let Some(n) = current {
                if element_matches(n, ns_uri.as_deref(), local) {
                    return true;
                }
                current = n.parent();
            }
            false
        }
        BoolExpr::SelfText => node.is_text(),
        BoolExpr::TextWithParent {
            ns_uri,
            local,
            id_value,
        } => {
            if !node.is_text() {
                return false;
            }
            let Some(parent) = node.parent() else {
                return false;
            };
            if !element_matches(parent, ns_uri.as_deref(), local) {
                return false;
            }
            match id_value {
                Some(want) => parent.attribute("Id") == Some(want.as_str()),
                None => true,
            }
        }
        BoolExpr::Not(inner) => !eval_bool_expr(inner, node),
        BoolExpr::And(l, r) => eval_bool_expr(l, node) && eval_bool_expr(r, node),
        BoolExpr::Or(l, r) => eval_bool_expr(l, node) || eval_bool_expr(r, node),
    }
}

/// Split at the first top-level (outside parentheses and quotes)
/// occurrence of `sep`.
fn split_top_level<'a>(expr: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let bytes = expr.as_bytes();
    let sep_bytes = sep.as_bytes();
    let mut depth = 0i32;
    let mut in_quote: Option<u8> = None;
    for i in 0..bytes.len() {
        match (in_quote, bytes[i]) {
            (Some(q), b) if b == q => in_quote = None,
            (Some(_), _) => continue,
            (None, b'\'') | (None, b'"') => in_quote = Some(bytes[i]),
            (None, b'(') | (None, b'[') => depth += 1,
            (None, b')') | (None, b']') => depth -= 1,
            _ => {}
        }
        if depth == 0
            && in_quote.is_none()
            && i + sep_bytes.len() <= bytes.len()
            && &bytes[i..i + sep_bytes.len()] == sep_bytes
        {
            let (left, right) = (expr[..i].trim(), expr[i + sep.len()..].trim());
            if !left.is_empty() && !right.is_empty() {
                return Some((left, right));
            }
        }
    }
    None
}

/// Strip a `not(…)` wrapper if the parentheses balance.
fn strip_not(expr: &str) -> Option<&str> {
    let expr = expr.trim();
    let inner = expr.strip_prefix("not(")?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    (depth == 0).then(|| inner.trim())
}

/// Parse `[@Name="Value"]` or `[@Name='Value']`.
pub fn parse_attr_predicate<'a>(pred: &'a str, attr_name: &str) -> Option<&'a str> {
    let inner = pred.strip_prefix("[@")?.strip_suffix(']')?;
    let rest = inner.strip_prefix(attr_name)?.strip_prefix('=')?;
    rest.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_and_id_map(xml: &str) -> (roxmltree::Document<'_>, HashMap<String, usize>) {
        let doc = roxmltree::Document::parse(xml).unwrap();
        let map = crate::document::build_id_map(&doc, &["Id", "ID", "id"], false).unwrap();
        (doc, map)
    }

    #[test]
    fn xpointer_id_both_quotes() {
        assert_eq!(parse_xpointer_id("xpointer(id('a'))"), Some("a"));
        assert_eq!(parse_xpointer_id("xpointer(id(\"a\"))"), Some("a"));
        assert_eq!(parse_xpointer_id("xpointer(/)"), None);
    }

    #[test]
    fn select_descendant_roots() {
        let (doc, map) = doc_and_id_map("<doc><a/><b><x/></b></doc>");
        let roots = select_roots(&doc, "//b", &NsBindings::new(), &map, None).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn select_prefixed_roots() {
        let (doc, map) = doc_and_id_map(r#"<doc xmlns:p="http://p"><p:b/><b/></doc>"#);
        let bindings: NsBindings = [("p".to_owned(), "http://p".to_owned())].into();
        let roots = select_roots(&doc, "//p:b", &bindings, &map, None).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn select_id_roots() {
        let (doc, map) = doc_and_id_map(r#"<doc><a Id="target"/></doc>"#);
        let roots = select_roots(&doc, "id('target')", &NsBindings::new(), &map, None).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn here_ancestor_selection() {
        let (doc, map) = doc_and_id_map("<doc><wrap><holder/></wrap></doc>");
        let holder = doc
            .descendants()
            .find(|n| n.tag_name().name() == "holder")
            .unwrap();
        let roots = select_roots(
            &doc,
            "here()/ancestor::wrap",
            &NsBindings::new(),
            &map,
            Some(crate::node_index(holder)),
        )
        .unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn bool_expr_enveloped_pattern() {
        let xml = r#"<r xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:Signature><x/></ds:Signature><keep/></r>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let bindings = ns_bindings_of(doc.root_element());
        let expr = parse_bool_expr("not(ancestor-or-self::ds:Signature)", &bindings).unwrap();
        let inside = doc
            .descendants()
            .find(|n| n.tag_name().name() == "x")
            .unwrap();
        let keep = doc
            .descendants()
            .find(|n| n.tag_name().name() == "keep")
            .unwrap();
        assert!(!eval_bool_expr(&expr, inside));
        assert!(eval_bool_expr(&expr, keep));
    }

    #[test]
    fn cipher_reference_text_pattern() {
        let xml = r#"<r><CipherText Id="CipherTextId">payload</CipherText><CipherText Id="other">no</CipherText></r>"#;
        let doc = roxmltree::Document::parse(xml).unwrap();
        let expr = parse_bool_expr(
            r#"self::text()[parent::CipherText[@Id="CipherTextId"]]"#,
            &NsBindings::new(),
        )
        .unwrap();
        let hits: Vec<_> = doc
            .descendants()
            .filter(|n| n.is_text() && eval_bool_expr(&expr, *n))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text(), Some("payload"));
    }
}
