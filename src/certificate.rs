//! Certificate chain validation against the Apple App Attestation root.

use std::sync::OnceLock;

use openssl::{
    stack::Stack,
    x509::{store::X509StoreBuilder, X509StoreContext, X509VerifyResult, X509},
};

use crate::error::{AppAttestError, Result};

/// Apple App Attestation Root CA, from
/// <https://www.apple.com/certificateauthority/Apple_App_Attestation_Root_CA.pem>.
pub const APPLE_APP_ATTESTATION_ROOT_CA_PEM: &[u8] = b"-----BEGIN CERTIFICATE-----
MIICITCCAaegAwIBAgIQC/O+DvHN0uD7jG5yH2IXmDAKBggqhkjOPQQDAzBSMSYw
JAYDVQQDDB1BcHBsZSBBcHAgQXR0ZXN0YXRpb24gUm9vdCBDQTETMBEGA1UECgwK
QXBwbGUgSW5jLjETMBEGA1UECAwKQ2FsaWZvcm5pYTAeFw0yMDAzMTgxODMyNTNa
Fw00NTAzMTUwMDAwMDBaMFIxJjAkBgNVBAMMHUFwcGxlIEFwcCBBdHRlc3RhdGlv
biBSb290IENBMRMwEQYDVQQKDApBcHBsZSBJbmMuMRMwEQYDVQQIDApDYWxpZm9y
bmlhMHYwEAYHKoZIzj0CAQYFK4EEACIDYgAERTHhmLW07ATaFQIEVwTtT4dyctdh
NbJhFs/Ii2FdCgAHGbpphY3+d8qjuDngIN3WVhQUBHAoMeQ/cLiP1sOUtgjqK9au
Yen1mMEvRq9Sk3Jm5X8U62H+xTD3FE9TgS41o0IwQDAPBgNVHRMBAf8EBTADAQH/
MB0GA1UdDgQWBBSskRBTM72+aEH/pwyp5frq5eWKoTAOBgNVHQ8BAf8EBAMCAQYw
CgYIKoZIzj0EAwMDaAAwZQIwQgFGnByvsiVbpTKwSga0kP0e8EeDS4+sQmTvb7vn
53O5+FRXgeLhpJ06ysC5PrOyAjEAp5U4xDgEgllF7En3VcE3iexZZtKeYnpqtijV
oyFraWVIyd/dganmrduC1bmTBGwD
-----END CERTIFICATE-----
";

static APPLE_ROOT: OnceLock<Option<X509>> = OnceLock::new();

fn apple_root() -> Option<&'static X509> {
    APPLE_ROOT
        .get_or_init(|| match X509::from_pem(APPLE_APP_ATTESTATION_ROOT_CA_PEM) {
            Ok(cert) => Some(cert),
            Err(e) => {
                error!(?e, "embedded Apple App Attestation root does not parse");
                None
            }
        })
        .as_ref()
}

/// Verifies that an `x5c` array chains from its first certificate (the
/// credential certificate) through the remaining intermediates to a single
/// pinned root.
#[derive(Clone)]
pub struct CertificateChainValidator {
    root: X509,
}

impl std::fmt::Debug for CertificateChainValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateChainValidator")
            .field("root", &self.root.subject_name())
            .finish()
    }
}

impl CertificateChainValidator {
    /// Validator pinned to the Apple App Attestation root.
    pub fn apple() -> Result<Self> {
        apple_root()
            .cloned()
            .map(Self::with_root)
            .ok_or(AppAttestError::CertificateChainInvalid)
    }

    /// Validator pinned to another root, for tests and private deployments.
    pub fn with_root(root: X509) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &X509 {
        &self.root
    }

    /// Returns the credential certificate when the chain verifies, and
    /// `CertificateChainInvalid` for every other outcome, including
    /// certificates that do not decode.
    pub fn validate<C: AsRef<[u8]>>(&self, x5c: &[C]) -> Result<X509> {
        let (leaf_der, intermediates_der) = x5c.split_first().ok_or_else(|| {
            debug!("x5c is empty");
            AppAttestError::CertificateChainInvalid
        })?;

        let leaf = X509::from_der(leaf_der.as_ref()).map_err(|e| {
            debug!(?e, "credential certificate does not decode");
            AppAttestError::CertificateChainInvalid
        })?;

        let trusted = self.verify(&leaf, intermediates_der).map_err(|e| {
            debug!(?e, "certificate chain verification errored");
            AppAttestError::CertificateChainInvalid
        })?;

        if trusted {
            Ok(leaf)
        } else {
            Err(AppAttestError::CertificateChainInvalid)
        }
    }

    fn verify<C: AsRef<[u8]>>(
        &self,
        leaf: &X509,
        intermediates_der: &[C],
    ) -> std::result::Result<bool, openssl::error::ErrorStack> {
        let mut intermediates = Stack::new()?;
        for cert_der in intermediates_der {
            intermediates.push(X509::from_der(cert_der.as_ref())?)?;
        }

        let mut store_builder = X509StoreBuilder::new()?;
        store_builder.add_cert(self.root.clone())?;
        let store = store_builder.build();

        let mut store_ctx = X509StoreContext::new()?;
        store_ctx.init(&store, leaf, &intermediates, |ctx| {
            let verified = ctx.verify_cert()?;
            if !verified {
                let res: X509VerifyResult = ctx.error();
                debug!(
                    error = %res,
                    depth = ctx.error_depth(),
                    "certificate chain not trusted"
                );
            }
            Ok(verified)
        })
    }
}
