#![forbid(unsafe_code)]

//! URI reference syntax validation.
//!
//! `Reference` URIs and the `Type`/`Encoding` attributes of encryption
//! types must parse as URI references (RFC 3986).  Relative references
//! are accepted; the check rejects characters that can never appear in
//! a URI and malformed percent-escapes.

use crate::{Error, Result};

/// Validate that `s` is a syntactically well-formed URI reference.
pub fn validate_uri_reference(s: &str) -> Result<()> {
    let mut chars = s.char_indices();
    while let Some((pos, c)) = chars.next() {
        match c {
            // unreserved / reserved / delimiters
            'A'..='Z' | 'a'..='z' | '0'..='9' => {}
            '-' | '.' | '_' | '~' => {}
            ':' | '/' | '?' | '#' | '[' | ']' | '@' => {}
            '!' | '$' | '&' | '\'' | '(' | ')' | '*' | '+' | ',' | ';' | '=' => {}
            '%' => {
                let hi = chars.next().map(|(_, c)| c);
                let lo = chars.next().map(|(_, c)| c);
                match (hi, lo) {
                    (Some(h), Some(l)) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => {}
                    _ => {
                        return Err(Error::InvalidUri(format!(
                            "malformed percent-escape at offset {pos} in {s:?}"
                        )))
                    }
                }
            }
            _ => {
                return Err(Error::InvalidUri(format!(
                    "character {c:?} at offset {pos} not allowed in URI {s:?}"
                )))
            }
        }
    }
    // At most one fragment separator.
    if s.matches('#').count() > 1 {
        return Err(Error::InvalidUri(format!("multiple fragments in {s:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_absolute_and_relative() {
        validate_uri_reference("http://www.w3.org/2001/04/xmlenc#Element").unwrap();
        validate_uri_reference("#some-id").unwrap();
        validate_uri_reference("chapter1.xml").unwrap();
        validate_uri_reference("").unwrap();
    }

    #[test]
    fn rejects_spaces_and_bad_escapes() {
        assert!(validate_uri_reference("http://a b").is_err());
        assert!(validate_uri_reference("%zz").is_err());
        assert!(validate_uri_reference("a#b#c").is_err());
    }
}
