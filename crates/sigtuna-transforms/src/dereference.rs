#![forbid(unsafe_code)]

//! Reference URI dereferencing.

use crate::context::TransformContext;
use crate::data::Data;
use sigtuna_core::{Error, Result};
use sigtuna_xml::{xpath, NodeSet};

/// What a reference exposes to the dereferencer: its URI, the base URI
/// and the `here` node (the element carrying the URI attribute, used by
/// the XPath `here()` function).
pub struct RefInfo<'a> {
    pub uri: Option<&'a str>,
    pub base_uri: Option<&'a str>,
    pub here: Option<usize>,
}

/// Resolves a reference URI to a [`Data`] value.  A caller-supplied
/// implementation on the context overrides [`DefaultDereferencer`].
pub trait UriDereferencer {
    fn dereference(&self, ref_info: &RefInfo<'_>, ctx: &TransformContext<'_>) -> Result<Data>;
}

/// The built-in dereferencer:
///
/// - no URI → the context's detached payload
/// - `""` → the whole document without comments
/// - `#xpointer(/)` → the whole document with comments
/// - `#xpointer(id('x'))` → the identified subtree with comments
/// - `#x` → the identified subtree without comments
/// - anything else → octets from the context URL map or local files
pub struct DefaultDereferencer;

impl UriDereferencer for DefaultDereferencer {
    fn dereference(&self, ref_info: &RefInfo<'_>, ctx: &TransformContext<'_>) -> Result<Data> {
        let Some(uri) = ref_info.uri else {
            return match &ctx.detached_payload {
                Some(bytes) => Ok(Data::octets(bytes.clone())),
                None => Err(Error::InvalidInput(
                    "reference without URI requires a detached payload".into(),
                )),
            };
        };

        if uri.is_empty() {
            // Per W3C DSig 4.3.3.3: a same-document reference that is
            // not a full XPointer excludes comment nodes.
            let doc = parse(ctx.xml)?;
            let nodes = NodeSet::all_without_comments(&doc);
            drop(doc);
            return Ok(Data::NodeSet {
                xml: ctx.xml.to_owned(),
                nodes,
            });
        }

        if let Some(fragment) = xpath::parse_same_document_ref(uri) {
            let doc = parse(ctx.xml)?;
            if fragment == "xpointer(/)" {
                let nodes = NodeSet::all(&doc);
                drop(doc);
                return Ok(Data::NodeSet {
                    xml: ctx.xml.to_owned(),
                    nodes,
                });
            }
            let is_xpointer = xpath::parse_xpointer_id(fragment).is_some();
            let id = xpath::parse_xpointer_id(fragment).unwrap_or(fragment);
            let node = xpath::resolve_id(&doc, &ctx.id_map, id)?;
            let root = sigtuna_xml::node_index(node);
            drop(doc);
            return Ok(Data::SubTree {
                xml: ctx.xml.to_owned(),
                root,
                exclude_comments: !is_xpointer,
            });
        }

        dereference_external(uri, ref_info.base_uri, ctx)
    }
}

fn parse(xml: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse_with_options(xml, sigtuna_xml::parsing_options())
        .map_err(|e| Error::XmlParse(e.to_string()))
}

/// Resolve an external URI through the context URL map or the local
/// filesystem.
fn dereference_external(
    uri: &str,
    base_uri: Option<&str>,
    ctx: &TransformContext<'_>,
) -> Result<Data> {
    for (map_url, file_path) in &ctx.url_maps {
        if uri == map_url || uri.starts_with(map_url.as_str()) {
            tracing::debug!(uri, file_path = %file_path, "dereferencing external URI via URL map");
            let bytes = std::fs::read(file_path)?;
            return Ok(Data::OctetStream {
                bytes,
                source_uri: Some(uri.to_owned()),
                mime_type: None,
            });
        }
    }
    if !uri.contains("://") {
        let base = ctx.base_dir.as_deref().or(base_uri);
        if let Some(base) = base {
            let path = std::path::Path::new(base).join(uri);
            if path.exists() {
                let bytes = std::fs::read(&path)?;
                return Ok(Data::OctetStream {
                    bytes,
                    source_uri: Some(uri.to_owned()),
                    mime_type: None,
                });
            }
        }
        let path = std::path::Path::new(uri);
        if path.exists() {
            let bytes = std::fs::read(path)?;
            return Ok(Data::OctetStream {
                bytes,
                source_uri: Some(uri.to_owned()),
                mime_type: None,
            });
        }
    }
    Err(Error::InvalidUri(format!(
        "cannot dereference external URI: {uri}"
    )))
}

/// Dereference through the context's override, falling back to the
/// default rules.
pub fn dereference(ref_info: &RefInfo<'_>, ctx: &TransformContext<'_>) -> Result<Data> {
    match ctx.dereferencer {
        Some(custom) => custom.dereference(ref_info, ctx),
        None => DefaultDereferencer.dereference(ref_info, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_for<'a>(xml: &'a str) -> TransformContext<'a> {
        let doc = roxmltree::Document::parse(xml).unwrap();
        let mut ctx = TransformContext::new(xml);
        ctx.id_map = sigtuna_xml::document::build_id_map(&doc, &["Id"], false).unwrap();
        ctx
    }

    #[test]
    fn empty_uri_excludes_comments() {
        let xml = "<a><!--c--><b/></a>";
        let ctx = ctx_for(xml);
        let data = DefaultDereferencer
            .dereference(
                &RefInfo {
                    uri: Some(""),
                    base_uri: None,
                    here: None,
                },
                &ctx,
            )
            .unwrap();
        let (_, nodes) = data.into_node_set().unwrap();
        let doc = roxmltree::Document::parse(xml).unwrap();
        let comment = doc.descendants().find(|n| n.is_comment()).unwrap();
        assert!(!nodes.contains(&comment));
    }

    #[test]
    fn fragment_selects_subtree() {
        let xml = r#"<a><b Id="x"><c/></b><d/></a>"#;
        let ctx = ctx_for(xml);
        let data = DefaultDereferencer
            .dereference(
                &RefInfo {
                    uri: Some("#x"),
                    base_uri: None,
                    here: None,
                },
                &ctx,
            )
            .unwrap();
        let (_, nodes) = data.into_node_set().unwrap();
        assert_eq!(nodes.len(), 2); // b, c
    }

    #[test]
    fn xpointer_fragment_keeps_comments() {
        let xml = r#"<a><b Id="x"><!--c--></b></a>"#;
        let ctx = ctx_for(xml);
        let data = DefaultDereferencer
            .dereference(
                &RefInfo {
                    uri: Some("#xpointer(id('x'))"),
                    base_uri: None,
                    here: None,
                },
                &ctx,
            )
            .unwrap();
        let (_, nodes) = data.into_node_set().unwrap();
        assert_eq!(nodes.len(), 2); // b and the comment
    }

    #[test]
    fn missing_id_is_an_error() {
        let ctx = ctx_for("<a/>");
        assert!(DefaultDereferencer
            .dereference(
                &RefInfo {
                    uri: Some("#nope"),
                    base_uri: None,
                    here: None,
                },
                &ctx,
            )
            .is_err());
    }

    #[test]
    fn no_uri_uses_detached_payload() {
        let mut ctx = ctx_for("<a/>");
        ctx.detached_payload = Some(b"payload".to_vec());
        let data = DefaultDereferencer
            .dereference(
                &RefInfo {
                    uri: None,
                    base_uri: None,
                    here: None,
                },
                &ctx,
            )
            .unwrap();
        let Data::OctetStream { bytes, .. } = data else {
            panic!("expected octets")
        };
        assert_eq!(bytes, b"payload");
    }

    #[test]
    fn custom_dereferencer_overrides_default() {
        struct Fixed;
        impl UriDereferencer for Fixed {
            fn dereference(
                &self,
                _ref_info: &RefInfo<'_>,
                _ctx: &TransformContext<'_>,
            ) -> Result<Data> {
                Ok(Data::octets(b"fixed".to_vec()))
            }
        }
        let mut ctx = ctx_for("<a/>");
        let custom = Fixed;
        ctx.dereferencer = Some(&custom);
        let data = dereference(
            &RefInfo {
                uri: Some("http://anywhere/"),
                base_uri: None,
                here: None,
            },
            &ctx,
        )
        .unwrap();
        let Data::OctetStream { bytes, .. } = data else {
            panic!("expected octets")
        };
        assert_eq!(bytes, b"fixed");
    }
}
