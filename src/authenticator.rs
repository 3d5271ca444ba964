//! Authenticator data, as embedded in attestation and assertion objects.
//!
//! ```text
//! rp_id_hash      32 bytes
//! flags            1 byte
//! sign_count       4 bytes, big-endian
//! -- attested credential data, when flags & 0x40 --
//! aaguid          16 bytes
//! credential_id_len 2 bytes, big-endian (L)
//! credential_id    L bytes
//! credential_public_key, extensions: remaining bytes
//! -- otherwise --
//! extensions: remaining bytes, opaque
//! ```

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

use crate::config::Environment;
use crate::error::{AppAttestError, Result};

const RP_ID_HASH_LEN: usize = 32;
const FIXED_LEN: usize = RP_ID_HASH_LEN + 1 + 4;
const AAGUID_LEN: usize = 16;
const ATTESTED_PREFIX_LEN: usize = FIXED_LEN + AAGUID_LEN + 2;

/// AT: attested credential data follows the fixed prefix.
pub const FLAG_ATTESTED_CREDENTIAL: u8 = 0x40;
/// ED: extension data is present.
pub const FLAG_EXTENSIONS: u8 = 0x80;

/// Structurally decoded authenticator data. Field contents are not validated
/// here; see the `verify_*` helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorData<'a> {
    raw: &'a [u8],
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredentialData<'a>>,
    /// Bytes after the fixed prefix when no attested credential data is
    /// present. Not interpreted.
    pub extensions: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData<'a> {
    pub aaguid: [u8; 16],
    pub credential_id: &'a [u8],
    /// Everything after the credential id: the COSE key and any extensions.
    pub credential_public_key: &'a [u8],
}

impl<'a> AuthenticatorData<'a> {
    /// Unpacks `bytes`. With the AT flag set the attested credential data
    /// block must be complete; without it, anything past the 37 byte prefix
    /// is kept as opaque extension data.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < FIXED_LEN {
            return Err(AppAttestError::malformed(format!(
                "authenticator data is {} bytes, expected at least {FIXED_LEN}",
                bytes.len()
            )));
        }

        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..RP_ID_HASH_LEN]);

        let flags = bytes[RP_ID_HASH_LEN];
        let (attested_credential, extensions) = if flags & FLAG_ATTESTED_CREDENTIAL != 0 {
            (Some(Self::parse_attested_credential(bytes)?), &bytes[bytes.len()..])
        } else {
            (None, &bytes[FIXED_LEN..])
        };

        Ok(AuthenticatorData {
            raw: bytes,
            rp_id_hash,
            flags,
            sign_count: BigEndian::read_u32(&bytes[RP_ID_HASH_LEN + 1..FIXED_LEN]),
            attested_credential,
            extensions,
        })
    }

    fn parse_attested_credential(bytes: &'a [u8]) -> Result<AttestedCredentialData<'a>> {
        if bytes.len() < ATTESTED_PREFIX_LEN {
            return Err(AppAttestError::malformed(format!(
                "attested credential data is truncated: {} bytes, expected at least {ATTESTED_PREFIX_LEN}",
                bytes.len()
            )));
        }

        let mut aaguid = [0u8; 16];
        aaguid.copy_from_slice(&bytes[FIXED_LEN..FIXED_LEN + AAGUID_LEN]);

        let length = BigEndian::read_u16(&bytes[ATTESTED_PREFIX_LEN - 2..ATTESTED_PREFIX_LEN]) as usize;
        let end = ATTESTED_PREFIX_LEN + length;
        if bytes.len() < end {
            return Err(AppAttestError::malformed(format!(
                "credential id claims {length} bytes but only {} remain",
                bytes.len() - ATTESTED_PREFIX_LEN
            )));
        }

        Ok(AttestedCredentialData {
            aaguid,
            credential_id: &bytes[ATTESTED_PREFIX_LEN..end],
            credential_public_key: &bytes[end..],
        })
    }

    /// The bytes this structure was parsed from; these are what get hashed
    /// into the nonce.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub(crate) fn attested(&self) -> Result<&AttestedCredentialData<'a>> {
        self.attested_credential
            .as_ref()
            .ok_or_else(|| AppAttestError::malformed("authenticator data has no attested credential data"))
    }

    pub fn verify_app_id(&self, app_id: &str) -> Result<()> {
        if self.rp_id_hash[..] != Sha256::digest(app_id.as_bytes())[..] {
            return Err(AppAttestError::RpIdMismatch);
        }
        Ok(())
    }

    /// Attestation happens before the key has ever signed, so the counter is zero.
    pub fn verify_zero_counter(&self) -> Result<()> {
        if self.sign_count != 0 {
            return Err(AppAttestError::SignCounterNonZero);
        }
        Ok(())
    }

    pub fn verify_aaguid(&self, environment: Environment) -> Result<()> {
        if &self.attested()?.aaguid != environment.aaguid() {
            return Err(AppAttestError::AaguidMismatch);
        }
        Ok(())
    }

    pub fn verify_credential_id(&self, expected: &[u8]) -> Result<()> {
        if self.attested()?.credential_id != expected {
            return Err(AppAttestError::CredentialIdMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::AuthenticatorDataBuilder;

    #[test]
    fn parses_attestation_layout() {
        let rp_id_hash = [0xa5u8; 32];
        let aaguid = *b"appattestdevelop";
        let credential_id = [7u8; 16];
        let public_key = [0x42u8; 65];

        let bytes = AuthenticatorDataBuilder::new(rp_id_hash)
            .flags(0x40)
            .sign_count(1)
            .attested(aaguid, &credential_id, &public_key)
            .build();

        let auth_data = AuthenticatorData::parse(&bytes).unwrap();
        assert_eq!(auth_data.rp_id_hash, rp_id_hash);
        assert_eq!(auth_data.flags, 0x40);
        assert_eq!(auth_data.sign_count, 1);
        assert_eq!(auth_data.raw(), &bytes[..]);

        let attested = auth_data.attested_credential.unwrap();
        assert_eq!(attested.aaguid, aaguid);
        assert_eq!(attested.credential_id, &credential_id);
        assert_eq!(attested.credential_public_key, &public_key);
    }

    #[test]
    fn parses_assertion_layout() {
        let mut bytes = vec![0u8; 37];
        bytes[32] = 0b0000_0001;
        BigEndian::write_u32(&mut bytes[33..37], 1);

        let auth_data = AuthenticatorData::parse(&bytes).unwrap();
        assert_eq!(auth_data.sign_count, 1);
        assert!(auth_data.attested_credential.is_none());
        assert!(auth_data.extensions.is_empty());
    }

    #[test]
    fn tail_without_at_flag_is_extension_data() {
        // {1: 2}
        let extensions = [0xa1, 0x01, 0x02];
        let bytes = AuthenticatorDataBuilder::new([0u8; 32])
            .sign_count(4)
            .extensions(&extensions)
            .build();

        let auth_data = AuthenticatorData::parse(&bytes).unwrap();
        assert_eq!(auth_data.flags, FLAG_EXTENSIONS);
        assert_eq!(auth_data.sign_count, 4);
        assert!(auth_data.attested_credential.is_none());
        assert_eq!(auth_data.extensions, &extensions);

        let mut long_tail = vec![0u8; 37];
        long_tail.extend_from_slice(&[0xffu8; 20]);
        let auth_data = AuthenticatorData::parse(&long_tail).unwrap();
        assert_eq!(auth_data.extensions.len(), 20);
        assert!(matches!(
            auth_data.verify_aaguid(Environment::Production),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn empty_credential_id_leaves_tail_as_public_key() {
        let bytes = AuthenticatorDataBuilder::new([0u8; 32])
            .attested([0u8; 16], &[], b"tail")
            .build();

        let attested = AuthenticatorData::parse(&bytes)
            .unwrap()
            .attested_credential
            .unwrap();
        assert!(attested.credential_id.is_empty());
        assert_eq!(attested.credential_public_key, b"tail");
    }

    #[test]
    fn rejects_short_fixed_prefix() {
        let bytes = vec![0u8; 36];
        assert!(matches!(
            AuthenticatorData::parse(&bytes),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn rejects_truncated_attested_data() {
        let mut bytes = vec![0u8; 50];
        bytes[32] = FLAG_ATTESTED_CREDENTIAL;
        assert!(matches!(
            AuthenticatorData::parse(&bytes),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn rejects_credential_id_longer_than_buffer() {
        let mut bytes = AuthenticatorDataBuilder::new([0u8; 32])
            .attested([0u8; 16], &[1u8; 32], &[])
            .build();
        bytes.truncate(bytes.len() - 1);

        assert!(matches!(
            AuthenticatorData::parse(&bytes),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn verify_app_id() {
        let app_id = "app.apple.connect";
        let bytes = AuthenticatorDataBuilder::new(Sha256::digest(app_id).into()).build();
        let auth_data = AuthenticatorData::parse(&bytes).unwrap();

        assert!(auth_data.verify_app_id("app.apple.connect").is_ok());
        assert_eq!(
            auth_data.verify_app_id("invalid.apple.connect"),
            Err(AppAttestError::RpIdMismatch)
        );
    }

    #[test]
    fn verify_zero_counter() {
        let zero = AuthenticatorDataBuilder::new([0u8; 32]).build();
        assert!(AuthenticatorData::parse(&zero).unwrap().verify_zero_counter().is_ok());

        for count in [1, 2, u32::MAX] {
            let bytes = AuthenticatorDataBuilder::new([0u8; 32]).sign_count(count).build();
            assert_eq!(
                AuthenticatorData::parse(&bytes).unwrap().verify_zero_counter(),
                Err(AppAttestError::SignCounterNonZero)
            );
        }
    }

    #[test]
    fn aaguid_is_environment_specific() {
        let develop = AuthenticatorDataBuilder::new([0u8; 32])
            .attested(*b"appattestdevelop", &[], &[])
            .build();
        let develop = AuthenticatorData::parse(&develop).unwrap();
        assert!(develop.verify_aaguid(Environment::Development).is_ok());
        assert_eq!(
            develop.verify_aaguid(Environment::Production),
            Err(AppAttestError::AaguidMismatch)
        );

        let production = AuthenticatorDataBuilder::new([0u8; 32])
            .attested(*b"appattest\0\0\0\0\0\0\0", &[], &[])
            .build();
        let production = AuthenticatorData::parse(&production).unwrap();
        assert!(production.verify_aaguid(Environment::Production).is_ok());
        assert_eq!(
            production.verify_aaguid(Environment::Development),
            Err(AppAttestError::AaguidMismatch)
        );
    }

    #[test]
    fn verify_credential_id() {
        let key_id = [1u8, 2, 3, 4];
        let bytes = AuthenticatorDataBuilder::new([0u8; 32])
            .attested([0u8; 16], &key_id, &[])
            .build();
        let auth_data = AuthenticatorData::parse(&bytes).unwrap();

        assert!(auth_data.verify_credential_id(&key_id).is_ok());
        assert_eq!(
            auth_data.verify_credential_id(&[4, 3, 2, 1]),
            Err(AppAttestError::CredentialIdMismatch)
        );
    }
}
