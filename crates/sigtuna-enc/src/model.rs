#![forbid(unsafe_code)]

//! The in-memory model for `EncryptedData`, `EncryptedKey` and their
//! sub-elements.

use sigtuna_core::{uri::validate_uri_reference, Error, Result};
use sigtuna_xml::xpath::NsBindings;

/// `<EncryptionMethod Algorithm="…">` with its optional children.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionMethod {
    pub algorithm: String,
    /// `<KeySize>` in bits.
    pub key_size: Option<usize>,
    /// Decoded `<OAEPparams>`.
    pub oaep_params: Option<Vec<u8>>,
}

impl EncryptionMethod {
    pub fn new(algorithm: &str) -> Self {
        Self {
            algorithm: algorithm.to_owned(),
            key_size: None,
            oaep_params: None,
        }
    }
}

/// A transform inside a `<CipherReference>`.  Only the two kinds that
/// occur in practice are supported: an XPath selection followed by a
/// Base64 decode.
#[derive(Debug, Clone, PartialEq)]
pub enum CipherRefTransform {
    Base64,
    XPath {
        expression: String,
        bindings: NsBindings,
    },
}

/// `<CipherReference URI="…">` with optional transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherReference {
    pub uri: String,
    pub transforms: Vec<CipherRefTransform>,
}

impl CipherReference {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            transforms: Vec::new(),
        }
    }
}

/// Which arm a `CipherData` was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDataKind {
    Value,
    Reference,
}

/// `<CipherData>`: exactly one of `<CipherValue>` or
/// `<CipherReference>`.  The arm is fixed at construction; setting the
/// other arm is an invalid state.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherData {
    kind: CipherDataKind,
    value: Option<String>,
    reference: Option<CipherReference>,
}

impl CipherData {
    /// A value-kind CipherData holding Base64 text.
    pub fn new_value(value: impl Into<String>) -> Self {
        Self {
            kind: CipherDataKind::Value,
            value: Some(value.into()),
            reference: None,
        }
    }

    /// A reference-kind CipherData pointing at external ciphertext.
    pub fn new_reference(reference: CipherReference) -> Self {
        Self {
            kind: CipherDataKind::Reference,
            value: None,
            reference: Some(reference),
        }
    }

    pub fn kind(&self) -> CipherDataKind {
        self.kind
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn reference(&self) -> Option<&CipherReference> {
        self.reference.as_ref()
    }

    pub fn set_value(&mut self, value: impl Into<String>) -> Result<()> {
        if self.kind != CipherDataKind::Value {
            return Err(Error::InvalidState(
                "CipherData already holds a CipherReference".into(),
            ));
        }
        self.value = Some(value.into());
        Ok(())
    }

    pub fn set_reference(&mut self, reference: CipherReference) -> Result<()> {
        if self.kind != CipherDataKind::Reference {
            return Err(Error::InvalidState(
                "CipherData already holds a CipherValue".into(),
            ));
        }
        self.reference = Some(reference);
        Ok(())
    }
}

/// Which kind of references a `<ReferenceList>` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceListKind {
    Data,
    Key,
}

/// `<ReferenceList>`: a homogeneous list of `<DataReference>` or
/// `<KeyReference>` URIs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceList {
    kind: ReferenceListKind,
    uris: Vec<String>,
}

impl ReferenceList {
    pub fn new(kind: ReferenceListKind) -> Self {
        Self {
            kind,
            uris: Vec::new(),
        }
    }

    pub fn kind(&self) -> ReferenceListKind {
        self.kind
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn add_data_reference(&mut self, uri: &str) -> Result<()> {
        if self.kind != ReferenceListKind::Data {
            return Err(Error::InvalidInput(
                "DataReference added to a KeyReference list".into(),
            ));
        }
        self.uris.push(uri.to_owned());
        Ok(())
    }

    pub fn add_key_reference(&mut self, uri: &str) -> Result<()> {
        if self.kind != ReferenceListKind::Key {
            return Err(Error::InvalidInput(
                "KeyReference added to a DataReference list".into(),
            ));
        }
        self.uris.push(uri.to_owned());
        Ok(())
    }
}

/// The `ds:KeyInfo` subset used by encryption: key-name hints and
/// nested `EncryptedKey`s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyInfo {
    pub key_names: Vec<String>,
    pub encrypted_keys: Vec<EncryptedKey>,
}

impl KeyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_encrypted_key(&mut self, ek: EncryptedKey) {
        self.encrypted_keys.push(ek);
    }
}

/// The fields shared by `EncryptedData` and `EncryptedKey`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedType {
    pub id: Option<String>,
    pub type_: Option<String>,
    pub mime_type: Option<String>,
    pub encoding: Option<String>,
    pub encryption_method: Option<EncryptionMethod>,
    pub key_info: Option<KeyInfo>,
    pub cipher_data: CipherData,
    /// `<EncryptionProperties>` carried through verbatim.
    pub encryption_properties: Option<String>,
}

impl EncryptedType {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            id: None,
            type_: None,
            mime_type: None,
            encoding: None,
            encryption_method: None,
            key_info: None,
            cipher_data,
            encryption_properties: None,
        }
    }

    /// Set the `Type` attribute; non-empty values must be URIs.
    pub fn set_type(&mut self, type_: &str) -> Result<()> {
        if !type_.is_empty() {
            validate_uri_reference(type_)?;
        }
        self.type_ = Some(type_.to_owned());
        Ok(())
    }

    /// Set the `Encoding` attribute; non-empty values must be URIs.
    pub fn set_encoding(&mut self, encoding: &str) -> Result<()> {
        if !encoding.is_empty() {
            validate_uri_reference(encoding)?;
        }
        self.encoding = Some(encoding.to_owned());
        Ok(())
    }
}

/// `<EncryptedData>`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedData {
    pub common: EncryptedType,
}

impl EncryptedData {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            common: EncryptedType::new(cipher_data),
        }
    }

    /// The KeyInfo, created on first access so callers can attach
    /// encrypted keys before finalizing.
    pub fn key_info_mut(&mut self) -> &mut KeyInfo {
        self.common.key_info.get_or_insert_with(KeyInfo::new)
    }
}

/// `<EncryptedKey>`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedKey {
    pub common: EncryptedType,
    pub recipient: Option<String>,
    pub reference_list: Option<ReferenceList>,
    pub carried_key_name: Option<String>,
}

impl EncryptedKey {
    pub fn new(cipher_data: CipherData) -> Self {
        Self {
            common: EncryptedType::new(cipher_data),
            recipient: None,
            reference_list: None,
            carried_key_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_data_arms_are_exclusive() {
        let mut value = CipherData::new_value("AAAA");
        assert!(value.set_value("BBBB").is_ok());
        assert!(matches!(
            value.set_reference(CipherReference::new("#ct")),
            Err(Error::InvalidState(_))
        ));

        let mut reference = CipherData::new_reference(CipherReference::new("#ct"));
        assert!(reference.set_reference(CipherReference::new("#other")).is_ok());
        assert!(matches!(
            reference.set_value("AAAA"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn reference_list_rejects_mixed_kinds() {
        let mut list = ReferenceList::new(ReferenceListKind::Data);
        list.add_data_reference("#e1").unwrap();
        assert!(matches!(
            list.add_key_reference("#k1"),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(list.uris(), ["#e1"]);
    }

    #[test]
    fn type_and_encoding_validated() {
        let mut et = EncryptedType::new(CipherData::new_value(""));
        et.set_type(sigtuna_core::ns::ENC_TYPE_ELEMENT).unwrap();
        assert!(et.set_type("not a uri").is_err());
        et.set_encoding("").unwrap();
        assert!(et.set_encoding("bad uri with spaces").is_err());
    }
}
