//! Nonce derivation and the Apple nonce certificate extension.
//!
//! Both attestation and assertion bind authenticator data to the client's
//! request with `SHA256(authenticator_data || SHA256(client_data))`. For
//! attestation Apple embeds that value in the credential certificate under
//! OID 1.2.840.113635.100.8.2.

use der_parser::der::{parse_der_container, parse_der_octetstring, Header, Tag};
use der_parser::error::{BerError, BerResult};
use sha2::{Digest, Sha256};
use x509_parser::{certificate::X509Certificate, prelude::FromDer};

use crate::error::{AppAttestError, Result};

/// OID of the App Attest nonce extension on the credential certificate.
pub const NONCE_EXTENSION_OID: &str = "1.2.840.113635.100.8.2";

pub fn client_data_hash(client_data: &[u8]) -> [u8; 32] {
    Sha256::digest(client_data).into()
}

pub fn nonce(authenticator_data: &[u8], client_data_hash: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(authenticator_data);
    hasher.update(client_data_hash);
    hasher.finalize().into()
}

/// Decodes the nonce extension value: a SEQUENCE holding one constructed
/// element (a SEQUENCE, or the `[1]` tag Apple emits) holding exactly one
/// 32 byte OCTET STRING.
pub fn parse_nonce_extension(value: &[u8]) -> BerResult<'_, [u8; 32]> {
    parse_der_container(|i: &[u8], hdr: Header| {
        if hdr.tag() != Tag::Sequence {
            return Err(nom::Err::Error(BerError::BerTypeError));
        }
        parse_der_container(|i: &[u8], hdr: Header| {
            if !hdr.is_constructed() {
                return Err(nom::Err::Error(BerError::BerTypeError));
            }
            let (i, octets) = parse_der_octetstring(i)?;
            if !i.is_empty() {
                return Err(nom::Err::Error(BerError::InvalidLength));
            }
            let nonce: [u8; 32] = octets
                .as_slice()?
                .try_into()
                .map_err(|_| BerError::InvalidLength)?;
            Ok((i, nonce))
        })(i)
    })(value)
}

/// Pulls the embedded nonce out of a DER encoded credential certificate.
/// Returns `None` when the certificate has no well formed nonce extension.
pub fn extract_certificate_nonce(cert_der: &[u8]) -> Result<Option<[u8; 32]>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AppAttestError::malformed(format!("credential certificate: {e}")))?;

    let nonce = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == NONCE_EXTENSION_OID)
        .and_then(|ext| match parse_nonce_extension(ext.value) {
            Ok((_, nonce)) => Some(nonce),
            Err(e) => {
                debug!(error = %e, "nonce extension does not decode");
                None
            }
        });

    Ok(nonce)
}

/// Compares the certificate nonce against the recomputed one in constant time.
pub fn verify_certificate_nonce(cert_der: &[u8], expected: &[u8; 32]) -> Result<()> {
    match extract_certificate_nonce(cert_der)? {
        Some(embedded) if openssl::memcmp::eq(&embedded, expected) => Ok(()),
        Some(_) => Err(AppAttestError::ChallengeMismatch),
        None => {
            debug!("credential certificate has no nonce extension");
            Err(AppAttestError::ChallengeMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::nonce_extension_value;

    #[test]
    fn nonce_is_hash_of_concatenation() {
        let auth_data = b"fake-auth-data";
        let cdh = client_data_hash(b"challenge");

        let mut joined = auth_data.to_vec();
        joined.extend_from_slice(&cdh);
        assert_eq!(nonce(auth_data, &cdh), client_data_hash(&joined));
    }

    #[test]
    fn parses_nested_sequences() {
        let expected = [9u8; 32];
        let value = nonce_extension_value(&expected);

        let (rest, parsed) = parse_nonce_extension(&value).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parses_context_tagged_form() {
        let expected = [3u8; 32];
        let mut value = vec![0x30, 0x24, 0xa1, 0x22, 0x04, 0x20];
        value.extend_from_slice(&expected);

        let (_, parsed) = parse_nonce_extension(&value).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_wrong_length_nonce() {
        let mut value = vec![0x30, 0x14, 0x30, 0x12, 0x04, 0x10];
        value.extend_from_slice(&[1u8; 16]);
        assert!(parse_nonce_extension(&value).is_err());
    }

    #[test]
    fn rejects_trailing_element_after_nonce() {
        // SEQUENCE { SEQUENCE { OCTET STRING (32), NULL } }
        let mut value = vec![0x30, 0x26, 0x30, 0x24, 0x04, 0x20];
        value.extend_from_slice(&[1u8; 32]);
        value.extend_from_slice(&[0x05, 0x00]);
        assert!(parse_nonce_extension(&value).is_err());
    }

    #[test]
    fn rejects_bare_octet_string() {
        let mut value = vec![0x04, 0x20];
        value.extend_from_slice(&[1u8; 32]);
        assert!(parse_nonce_extension(&value).is_err());
    }
}
