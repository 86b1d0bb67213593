#![forbid(unsafe_code)]

//! Sigtuna — XML Signature and XML Encryption for Rust.
//!
//! The workspace splits along the W3C processing model:
//!
//! - [`core`]: error type, algorithm URIs, namespace constants
//! - [`xml`]: document handling, node sets, the XPath filter subset
//! - [`c14n`]: Canonical XML 1.0/1.1 and exclusive C14N
//! - [`crypto`]: digests, block ciphers, key wrap/transport,
//!   signatures, and the URI-keyed algorithm registry
//! - [`transforms`]: the reference transform pipeline, XPath Filter
//!   2.0, URI dereferencing
//! - [`dsig`]: `Reference`, `SignedInfo`, `XmlSignature`
//! - [`enc`]: the `EncryptedData`/`EncryptedKey` model and the
//!   four-mode `XmlCipher`

pub use sigtuna_c14n as c14n;
pub use sigtuna_core as core;
pub use sigtuna_crypto as crypto;
pub use sigtuna_dsig as dsig;
pub use sigtuna_enc as enc;
pub use sigtuna_transforms as transforms;
pub use sigtuna_xml as xml;

pub use sigtuna_core::{Error, Result};

#[cfg(test)]
mod tests {
    use sigtuna_c14n::C14nMode;
    use sigtuna_core::algorithm;
    use sigtuna_crypto::sign::SigningKey;
    use sigtuna_dsig::{DsigContext, Reference, SignedInfo, XmlSignature};
    use sigtuna_enc::{CipherMode, KeyMaterial, Target, XmlCipher};
    use sigtuna_transforms::enveloped::EnvelopedSignatureTransform;

    /// Sign a document, encrypt part of it, then decrypt and verify:
    /// the two engines compose over the same document text.
    #[test]
    fn sign_then_encrypt_then_decrypt_then_verify() {
        let xml = r#"<invoice><amount>42</amount></invoice>"#;
        let key = SigningKey::Hmac(b"integration secret".to_vec());

        // Sign (enveloped).
        let ctx = DsigContext::new();
        let mut si = SignedInfo::new(C14nMode::Inclusive, algorithm::HMAC_SHA256);
        let mut reference = Reference::new(Some(""), algorithm::SHA256).unwrap();
        reference.push_transform(Box::new(EnvelopedSignatureTransform));
        si.push_reference(reference);
        let mut signature = XmlSignature::new(si);
        let signed = signature.sign_enveloped(&ctx, xml, &key).unwrap();

        // Encrypt the amount element.
        let aes_key = vec![0x21u8; 16];
        let mut cipher = XmlCipher::new(Some(algorithm::AES128_CBC));
        cipher
            .init(
                CipherMode::Encrypt,
                Some(KeyMaterial::symmetric(aes_key.clone())),
            )
            .unwrap();
        let encrypted = cipher.do_final(&signed, &Target::name("amount")).unwrap();
        assert!(!encrypted.contains("<amount>"));

        // Decrypt it back.
        let mut decrypter = XmlCipher::new(None);
        decrypter
            .init(CipherMode::Decrypt, Some(KeyMaterial::symmetric(aes_key)))
            .unwrap();
        let decrypted = decrypter
            .do_final(&encrypted, &Target::name("EncryptedData"))
            .unwrap();

        // The restored document still verifies.
        let mut parsed = XmlSignature::from_document(&decrypted, &ctx).unwrap();
        let result = parsed.validate(&ctx, &decrypted, Some(&key)).unwrap();
        assert!(result.is_valid());
    }
}
