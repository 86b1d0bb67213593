#![forbid(unsafe_code)]

//! Element ↔ object conversion for the encryption types.
//!
//! Object-to-element emits children in schema order.  Element-to-object
//! selects the **last** `CipherData` child of the containing element
//! (earlier occurrences may belong to a nested `KeyInfo/EncryptedKey`)
//! and the **first** of each other singleton child.

use crate::model::{
    CipherData, CipherRefTransform, CipherReference, EncryptedData, EncryptedKey, EncryptedType,
    EncryptionMethod, KeyInfo, ReferenceList, ReferenceListKind,
};
use base64::Engine;
use sigtuna_core::{algorithm, ns, Error, Result};
use sigtuna_xml::{find_child_elements, xpath, XmlWriter};

// ── Object to element ────────────────────────────────────────────────

/// Marshal an `EncryptedData` to its element form.
pub fn encrypted_data_to_string(ed: &EncryptedData) -> String {
    let mut w = XmlWriter::new();
    write_encrypted_data(&mut w, ed);
    w.into_string()
}

/// Marshal an `EncryptedKey` to its element form.
pub fn encrypted_key_to_string(ek: &EncryptedKey) -> String {
    let mut w = XmlWriter::new();
    write_encrypted_key(&mut w, ek);
    w.into_string()
}

fn write_encrypted_data(w: &mut XmlWriter, ed: &EncryptedData) {
    let c = &ed.common;
    w.start_element(
        ns::node::ENCRYPTED_DATA,
        &[
            ("xmlns", Some(ns::ENC)),
            (ns::attr::ID, c.id.as_deref()),
            (ns::attr::TYPE, c.type_.as_deref()),
            (ns::attr::MIME_TYPE, c.mime_type.as_deref()),
            (ns::attr::ENCODING, c.encoding.as_deref()),
        ],
    );
    write_type_body(w, c);
    w.end_element();
}

fn write_encrypted_key(w: &mut XmlWriter, ek: &EncryptedKey) {
    let c = &ek.common;
    w.start_element(
        ns::node::ENCRYPTED_KEY,
        &[
            ("xmlns", Some(ns::ENC)),
            (ns::attr::ID, c.id.as_deref()),
            (ns::attr::TYPE, c.type_.as_deref()),
            (ns::attr::MIME_TYPE, c.mime_type.as_deref()),
            (ns::attr::ENCODING, c.encoding.as_deref()),
            (ns::attr::RECIPIENT, ek.recipient.as_deref()),
        ],
    );
    write_type_body(w, c);
    if let Some(list) = &ek.reference_list {
        w.start_element(ns::node::REFERENCE_LIST, &[]);
        let name = match list.kind() {
            ReferenceListKind::Data => ns::node::DATA_REFERENCE,
            ReferenceListKind::Key => ns::node::KEY_REFERENCE,
        };
        for uri in list.uris() {
            w.empty_element(name, &[(ns::attr::URI, Some(uri))]);
        }
        w.end_element();
    }
    if let Some(name) = &ek.carried_key_name {
        w.start_element(ns::node::CARRIED_KEY_NAME, &[]);
        w.text(name);
        w.end_element();
    }
    w.end_element();
}

/// The children shared by both types, in schema order.
fn write_type_body(w: &mut XmlWriter, c: &EncryptedType) {
    if let Some(method) = &c.encryption_method {
        if method.key_size.is_none() && method.oaep_params.is_none() {
            w.empty_element(
                ns::node::ENCRYPTION_METHOD,
                &[(ns::attr::ALGORITHM, Some(&method.algorithm))],
            );
        } else {
            w.start_element(
                ns::node::ENCRYPTION_METHOD,
                &[(ns::attr::ALGORITHM, Some(&method.algorithm))],
            );
            if let Some(bits) = method.key_size {
                w.start_element(ns::node::KEY_SIZE, &[]);
                w.text(&bits.to_string());
                w.end_element();
            }
            if let Some(params) = &method.oaep_params {
                w.start_element(ns::node::OAEP_PARAMS, &[]);
                w.text(&base64::engine::general_purpose::STANDARD.encode(params));
                w.end_element();
            }
            w.end_element();
        }
    }
    if let Some(ki) = &c.key_info {
        w.start_element(ns::node::KEY_INFO, &[("xmlns", Some(ns::DSIG))]);
        for name in &ki.key_names {
            w.start_element(ns::node::KEY_NAME, &[]);
            w.text(name);
            w.end_element();
        }
        for ek in &ki.encrypted_keys {
            write_encrypted_key(w, ek);
        }
        w.end_element();
    }
    w.start_element(ns::node::CIPHER_DATA, &[]);
    if let Some(value) = c.cipher_data.value() {
        w.start_element(ns::node::CIPHER_VALUE, &[]);
        w.text(value);
        w.end_element();
    } else if let Some(reference) = c.cipher_data.reference() {
        if reference.transforms.is_empty() {
            w.empty_element(
                ns::node::CIPHER_REFERENCE,
                &[(ns::attr::URI, Some(&reference.uri))],
            );
        } else {
            w.start_element(
                ns::node::CIPHER_REFERENCE,
                &[(ns::attr::URI, Some(&reference.uri))],
            );
            w.start_element(ns::node::TRANSFORMS, &[]);
            for t in &reference.transforms {
                match t {
                    CipherRefTransform::Base64 => {
                        w.empty_element(
                            ns::node::TRANSFORM,
                            &[
                                ("xmlns", Some(ns::DSIG)),
                                (ns::attr::ALGORITHM, Some(algorithm::BASE64)),
                            ],
                        );
                    }
                    CipherRefTransform::XPath { expression, bindings } => {
                        w.start_element(
                            ns::node::TRANSFORM,
                            &[
                                ("xmlns", Some(ns::DSIG)),
                                (ns::attr::ALGORITHM, Some(algorithm::XPATH)),
                            ],
                        );
                        let mut attrs: Vec<(String, String)> = Vec::new();
                        for (prefix, uri) in bindings {
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
                        w.start_element(ns::node::XPATH, &attr_refs);
                        w.text(expression);
                        w.end_element();
                        w.end_element();
                    }
                }
            }
            w.end_element();
            w.end_element();
        }
    }
    w.end_element();
    if let Some(props) = &c.encryption_properties {
        w.raw(props);
    }
}

// ── Element to object ────────────────────────────────────────────────

/// Unmarshal an `<EncryptedData>` element.
pub fn encrypted_data_from_element(node: roxmltree::Node<'_, '_>) -> Result<EncryptedData> {
    expect_element(node, ns::node::ENCRYPTED_DATA)?;
    Ok(EncryptedData {
        common: read_type_body(node)?,
    })
}

/// Unmarshal an `<EncryptedKey>` element.
pub fn encrypted_key_from_element(node: roxmltree::Node<'_, '_>) -> Result<EncryptedKey> {
    expect_element(node, ns::node::ENCRYPTED_KEY)?;
    let common = read_type_body(node)?;

    let reference_list = match sigtuna_xml::find_child_element(
        node,
        ns::ENC,
        ns::node::REFERENCE_LIST,
    ) {
        Some(list_node) => Some(read_reference_list(list_node)?),
        None => None,
    };

    let carried_key_name =
        sigtuna_xml::find_child_element(node, ns::ENC, ns::node::CARRIED_KEY_NAME)
            .map(|n| sigtuna_xml::document::text_content(n).trim().to_owned());

    Ok(EncryptedKey {
        common,
        recipient: node.attribute(ns::attr::RECIPIENT).map(str::to_owned),
        reference_list,
        carried_key_name,
    })
}

fn expect_element(node: roxmltree::Node<'_, '_>, local: &str) -> Result<()> {
    if !node.is_element()
        || node.tag_name().name() != local
        || node.tag_name().namespace().unwrap_or("") != ns::ENC
    {
        return Err(Error::Marshal(format!("expected an {local} element")));
    }
    Ok(())
}

fn read_type_body(node: roxmltree::Node<'_, '_>) -> Result<EncryptedType> {
    // The last CipherData child belongs to this element; earlier ones
    // sit inside a nested KeyInfo/EncryptedKey.
    let cipher_data_node = find_child_elements(node, ns::ENC, ns::node::CIPHER_DATA)
        .into_iter()
        .last()
        .ok_or_else(|| Error::Marshal("EncryptedType is missing CipherData".into()))?;
    let cipher_data = read_cipher_data(cipher_data_node)?;

    let encryption_method =
        match sigtuna_xml::find_child_element(node, ns::ENC, ns::node::ENCRYPTION_METHOD) {
            Some(method_node) => Some(read_encryption_method(method_node)?),
            None => None,
        };

    let key_info = match sigtuna_xml::find_child_element(node, ns::DSIG, ns::node::KEY_INFO) {
        Some(ki_node) => Some(read_key_info(ki_node)?),
        None => None,
    };

    let encryption_properties =
        sigtuna_xml::find_child_element(node, ns::ENC, ns::node::ENCRYPTION_PROPERTIES)
            .map(|n| n.document().input_text()[n.range()].to_owned());

    let mut et = EncryptedType::new(cipher_data);
    et.id = node.attribute(ns::attr::ID).map(str::to_owned);
    if let Some(type_) = node.attribute(ns::attr::TYPE) {
        et.set_type(type_)?;
    }
    et.mime_type = node.attribute(ns::attr::MIME_TYPE).map(str::to_owned);
    if let Some(encoding) = node.attribute(ns::attr::ENCODING) {
        et.set_encoding(encoding)?;
    }
    et.encryption_method = encryption_method;
    et.key_info = key_info;
    et.encryption_properties = encryption_properties;
    Ok(et)
}

fn read_encryption_method(node: roxmltree::Node<'_, '_>) -> Result<EncryptionMethod> {
    let mut method = EncryptionMethod::new(
        node.attribute(ns::attr::ALGORITHM)
            .ok_or_else(|| Error::Marshal("EncryptionMethod is missing Algorithm".into()))?,
    );
    if let Some(ks) = sigtuna_xml::find_child_element(node, ns::ENC, ns::node::KEY_SIZE) {
        let text = sigtuna_xml::document::text_content(ks);
        method.key_size = Some(
            text.trim()
                .parse()
                .map_err(|_| Error::Marshal(format!("invalid KeySize: {}", text.trim())))?,
        );
    }
    if let Some(op) = sigtuna_xml::find_child_element(node, ns::ENC, ns::node::OAEP_PARAMS) {
        let text: String = sigtuna_xml::document::text_content(op)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        method.oaep_params = Some(
            base64::engine::general_purpose::STANDARD
                .decode(&text)
                .map_err(|e| Error::Marshal(format!("OAEPparams: {e}")))?,
        );
    }
    Ok(method)
}

fn read_cipher_data(node: roxmltree::Node<'_, '_>) -> Result<CipherData> {
    if let Some(value_node) =
        sigtuna_xml::find_child_element(node, ns::ENC, ns::node::CIPHER_VALUE)
    {
        let text: String = sigtuna_xml::document::text_content(value_node)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        return Ok(CipherData::new_value(text));
    }
    if let Some(ref_node) =
        sigtuna_xml::find_child_element(node, ns::ENC, ns::node::CIPHER_REFERENCE)
    {
        let uri = ref_node
            .attribute(ns::attr::URI)
            .ok_or_else(|| Error::Marshal("CipherReference is missing URI".into()))?;
        let mut reference = CipherReference::new(uri);
        // xenc:Transforms holding ds:Transform children.
        let transforms = sigtuna_xml::find_child_element(ref_node, ns::ENC, ns::node::TRANSFORMS)
            .or_else(|| sigtuna_xml::find_child_element(ref_node, ns::DSIG, ns::node::TRANSFORMS));
        if let Some(transforms) = transforms {
            for t in transforms.children() {
                if !t.is_element() || t.tag_name().name() != ns::node::TRANSFORM {
                    continue;
                }
                match t.attribute(ns::attr::ALGORITHM).unwrap_or("") {
                    algorithm::BASE64 => reference.transforms.push(CipherRefTransform::Base64),
                    algorithm::XPATH => {
                        let xpath_node = t
                            .children()
                            .find(|n| n.is_element() && n.tag_name().name() == ns::node::XPATH)
                            .ok_or_else(|| {
                                Error::Marshal("XPath transform is missing XPath".into())
                            })?;
                        reference.transforms.push(CipherRefTransform::XPath {
                            expression: sigtuna_xml::document::text_content(xpath_node)
                                .trim()
                                .to_owned(),
                            bindings: xpath::ns_bindings_of(xpath_node),
                        });
                    }
                    other => {
                        return Err(Error::UnsupportedAlgorithm(format!(
                            "CipherReference transform: {other}"
                        )))
                    }
                }
            }
        }
        return Ok(CipherData::new_reference(reference));
    }
    Err(Error::Marshal(
        "CipherData needs a CipherValue or CipherReference".into(),
    ))
}

fn read_key_info(node: roxmltree::Node<'_, '_>) -> Result<KeyInfo> {
    let mut ki = KeyInfo::new();
    for kn in find_child_elements(node, ns::DSIG, ns::node::KEY_NAME) {
        let name = sigtuna_xml::document::text_content(kn).trim().to_owned();
        if !name.is_empty() {
            ki.key_names.push(name);
        }
    }
    for ek in find_child_elements(node, ns::ENC, ns::node::ENCRYPTED_KEY) {
        ki.encrypted_keys.push(encrypted_key_from_element(ek)?);
    }
    Ok(ki)
}

fn read_reference_list(node: roxmltree::Node<'_, '_>) -> Result<ReferenceList> {
    let data_refs = find_child_elements(node, ns::ENC, ns::node::DATA_REFERENCE);
    let key_refs = find_child_elements(node, ns::ENC, ns::node::KEY_REFERENCE);
    if !data_refs.is_empty() && !key_refs.is_empty() {
        return Err(Error::InvalidInput(
            "ReferenceList mixes DataReference and KeyReference".into(),
        ));
    }
    let (kind, nodes) = if key_refs.is_empty() {
        (ReferenceListKind::Data, data_refs)
    } else {
        (ReferenceListKind::Key, key_refs)
    };
    let mut list = ReferenceList::new(kind);
    for r in nodes {
        let uri = r
            .attribute(ns::attr::URI)
            .ok_or_else(|| Error::Marshal("reference is missing URI".into()))?;
        match kind {
            ReferenceListKind::Data => list.add_data_reference(uri)?,
            ReferenceListKind::Key => list.add_key_reference(uri)?,
        }
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> roxmltree::Document<'_> {
        roxmltree::Document::parse_with_options(xml, sigtuna_xml::parsing_options()).unwrap()
    }

    #[test]
    fn encrypted_data_round_trip() {
        let mut ed = EncryptedData::new(CipherData::new_value("Y2lwaGVydGV4dA=="));
        ed.common.id = Some("ed-1".into());
        ed.common.set_type(ns::ENC_TYPE_ELEMENT).unwrap();
        ed.common.mime_type = Some("text/xml".into());
        ed.common.encryption_method = Some(EncryptionMethod::new(algorithm::AES128_CBC));
        ed.key_info_mut().key_names.push("job".into());

        let xml = encrypted_data_to_string(&ed);
        let doc = parse(&xml);
        let parsed = encrypted_data_from_element(doc.root_element()).unwrap();
        assert_eq!(parsed, ed);
    }

    #[test]
    fn encrypted_key_round_trip_with_recipient_and_references() {
        let mut ek = EncryptedKey::new(CipherData::new_value("d3JhcHBlZA=="));
        ek.common.encryption_method = Some(EncryptionMethod::new(algorithm::KW_AES192));
        ek.recipient = Some("bob".into());
        ek.carried_key_name = Some("session key".into());
        let mut list = ReferenceList::new(ReferenceListKind::Data);
        list.add_data_reference("#ed-1").unwrap();
        ek.reference_list = Some(list);

        let xml = encrypted_key_to_string(&ek);
        assert!(xml.contains(r#"Recipient="bob""#));
        let doc = parse(&xml);
        let parsed = encrypted_key_from_element(doc.root_element()).unwrap();
        assert_eq!(parsed, ek);
    }

    #[test]
    fn schema_order_is_emitted() {
        let mut ed = EncryptedData::new(CipherData::new_value("AA=="));
        ed.common.encryption_method = Some(EncryptionMethod::new(algorithm::AES256_CBC));
        ed.key_info_mut().key_names.push("k".into());
        let xml = encrypted_data_to_string(&ed);
        let method = xml.find("<EncryptionMethod").unwrap();
        let ki = xml.find("<KeyInfo").unwrap();
        let cd = xml.find("<CipherData>").unwrap();
        assert!(method < ki && ki < cd);
    }

    #[test]
    fn last_cipher_data_wins_over_nested_encrypted_key() {
        // The EncryptedKey inside KeyInfo carries its own CipherData;
        // the EncryptedData's own CipherData comes after KeyInfo in
        // schema order and must be the one selected.
        let mut ek = EncryptedKey::new(CipherData::new_value("a2V5"));
        ek.common.encryption_method = Some(EncryptionMethod::new(algorithm::KW_AES128));
        let mut ed = EncryptedData::new(CipherData::new_value("ZGF0YQ=="));
        ed.common.encryption_method = Some(EncryptionMethod::new(algorithm::AES128_CBC));
        ed.key_info_mut().add_encrypted_key(ek);

        let xml = encrypted_data_to_string(&ed);
        let doc = parse(&xml);
        let parsed = encrypted_data_from_element(doc.root_element()).unwrap();
        assert_eq!(parsed.common.cipher_data.value(), Some("ZGF0YQ=="));
        let nested = &parsed.common.key_info.as_ref().unwrap().encrypted_keys[0];
        assert_eq!(nested.common.cipher_data.value(), Some("a2V5"));
    }

    #[test]
    fn cipher_reference_with_transforms_round_trip() {
        let mut reference = CipherReference::new("#CipherTextId");
        reference.transforms.push(CipherRefTransform::XPath {
            expression: r#"self::text()[parent::CipherText[@Id="CipherTextId"]]"#.into(),
            bindings: Default::default(),
        });
        reference.transforms.push(CipherRefTransform::Base64);
        let mut ed = EncryptedData::new(CipherData::new_reference(reference));
        ed.common.encryption_method = Some(EncryptionMethod::new(algorithm::AES128_CBC));

        let xml = encrypted_data_to_string(&ed);
        let doc = parse(&xml);
        let parsed = encrypted_data_from_element(doc.root_element()).unwrap();
        assert_eq!(parsed, ed);
    }

    #[test]
    fn mixed_reference_list_rejected() {
        let xml = format!(
            r##"<EncryptedKey xmlns="{enc}"><CipherData><CipherValue>AA==</CipherValue></CipherData><ReferenceList><DataReference URI="#a"/><KeyReference URI="#b"/></ReferenceList></EncryptedKey>"##,
            enc = ns::ENC
        );
        let doc = parse(&xml);
        assert!(matches!(
            encrypted_key_from_element(doc.root_element()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_cipher_data_rejected() {
        let xml = format!(r#"<EncryptedData xmlns="{enc}"/>"#, enc = ns::ENC);
        let doc = parse(&xml);
        assert!(matches!(
            encrypted_data_from_element(doc.root_element()),
            Err(Error::Marshal(_))
        ));
    }
}
