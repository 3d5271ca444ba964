//! Attestation: the one time proof that a key lives in the Secure Enclave.
//!
//! See <https://developer.apple.com/documentation/devicecheck/validating-apps-that-connect-to-your-server>.

use base64::{engine::general_purpose, Engine};
use openssl::{
    bn::BigNumContext,
    ec::PointConversionForm,
    pkey::{PKey, Public},
    x509::X509,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::{
    authenticator::AuthenticatorData,
    certificate::CertificateChainValidator,
    config::{AppAttestConfig, Environment},
    error::{AppAttestError, Result},
    nonce::{client_data_hash, nonce, verify_certificate_nonce},
};

/// Decoded attestation object, before any verification.
#[derive(Deserialize, Debug, Clone)]
pub struct Attestation {
    #[serde(rename = "attStmt")]
    pub statement: AttestationStatement,
    #[serde(rename = "authData")]
    pub auth_data: Vec<u8>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AttestationStatement {
    /// Credential certificate first, then intermediates.
    #[serde(rename = "x5c")]
    pub certificates: Vec<Vec<u8>>,
    #[serde(default)]
    pub receipt: Vec<u8>,
}

impl Attestation {
    /// Creates a new `Attestation` from a Base64-encoded CBOR string.
    ///
    /// # Errors
    /// Returns `MalformedInput` if decoding or deserialization fails.
    pub fn from_base64(base64_attestation: &str) -> Result<Self> {
        let decoded_bytes = general_purpose::STANDARD
            .decode(base64_attestation.trim())
            .map_err(|e| AppAttestError::malformed(format!("attestation is not base64: {e}")))?;

        Self::from_cbor(&decoded_bytes)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| AppAttestError::malformed(format!("attestation object: {e}")))
    }
}

/// What a successful attestation hands back for the caller to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAttestation {
    /// The credential certificate's SubjectPublicKeyInfo, DER encoded.
    pub public_key_der: Vec<u8>,
    /// Opaque App Attest receipt, unchanged.
    pub receipt: Vec<u8>,
}

impl VerifiedAttestation {
    /// The public key as an uncompressed SEC1 point.
    pub fn public_key_sec1(&self) -> Result<Vec<u8>> {
        let key = PKey::public_key_from_der(&self.public_key_der)
            .map_err(|e| AppAttestError::malformed(format!("public key: {e}")))?;
        uncompressed_point(&key)
    }
}

fn uncompressed_point(key: &PKey<Public>) -> Result<Vec<u8>> {
    let ec_key = key
        .ec_key()
        .map_err(|_| AppAttestError::malformed("credential key is not an EC key"))?;
    let mut ctx = BigNumContext::new().map_err(AppAttestError::malformed)?;
    ec_key
        .public_key()
        .to_bytes(ec_key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
        .map_err(AppAttestError::malformed)
}

/// The credential certificate's key as (SubjectPublicKeyInfo DER, SEC1 point).
fn credential_public_key(cert: &X509) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = cert
        .public_key()
        .map_err(|e| AppAttestError::malformed(format!("credential certificate key: {e}")))?;
    let der = key.public_key_to_der().map_err(AppAttestError::malformed)?;
    Ok((der, uncompressed_point(&key)?))
}

/// Verifies attestation objects for one app.
#[derive(Debug, Clone)]
pub struct AttestationVerifier {
    app_id: String,
    environment: Environment,
    validator: CertificateChainValidator,
}

impl AttestationVerifier {
    /// Verifier pinned to the Apple App Attestation root.
    pub fn new(app_id: impl Into<String>, environment: Environment) -> Result<Self> {
        Ok(Self {
            app_id: app_id.into(),
            environment,
            validator: CertificateChainValidator::apple()?,
        })
    }

    pub fn from_config(config: &AppAttestConfig) -> Result<Self> {
        Self::new(config.app_id.clone(), config.environment)
    }

    /// Replaces the chain validator, e.g. with one pinned to a test root.
    pub fn with_validator(mut self, validator: CertificateChainValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Decodes and verifies a base64 attestation object.
    ///
    /// `key_id` is the base64 key identifier the device reported and
    /// `challenge` the one-time challenge the server issued for this
    /// attestation.
    ///
    /// # Example
    /// ```no_run
    /// use devicecheck::{AttestationVerifier, Environment};
    ///
    /// # fn main() -> devicecheck::Result<()> {
    /// let verifier = AttestationVerifier::new("TEAMID.com.example.app", Environment::Production)?;
    /// let verified = verifier.attest(
    ///     "base64encodedkeyid==",
    ///     "base64_encoded_attestation_object",
    ///     "example_challenge",
    /// )?;
    /// // store verified.public_key_der and verified.receipt against the key id
    /// # Ok(())
    /// # }
    /// ```
    pub fn attest(
        &self,
        key_id: &str,
        attestation_object: &str,
        challenge: &str,
    ) -> Result<VerifiedAttestation> {
        let attestation = Attestation::from_base64(attestation_object).inspect_err(|e| {
            debug!(check = e.label(), "attestation object rejected");
        })?;
        self.verify(&attestation, key_id, challenge)
    }

    /// Runs every check, in order, against an already decoded attestation.
    #[instrument(
        level = "debug",
        skip_all,
        fields(app_id = %self.app_id, environment = %self.environment)
    )]
    pub fn verify(
        &self,
        attestation: &Attestation,
        key_id: &str,
        challenge: &str,
    ) -> Result<VerifiedAttestation> {
        self.verify_steps(attestation, key_id, challenge)
            .inspect(|_| debug!("attestation verified"))
            .inspect_err(|e| debug!(check = e.label(), "attestation rejected"))
    }

    fn verify_steps(
        &self,
        attestation: &Attestation,
        key_id: &str,
        challenge: &str,
    ) -> Result<VerifiedAttestation> {
        // 1. Verify the x5c chain up to the pinned root.
        let cred_cert = self.validator.validate(&attestation.statement.certificates)?;

        // 2. nonce = SHA256(authData || SHA256(challenge))
        let client_data_hash = client_data_hash(challenge.as_bytes());
        let nonce = nonce(&attestation.auth_data, &client_data_hash);

        // 3. The nonce must match the credential certificate's extension.
        let cred_cert_der = cred_cert.to_der().map_err(AppAttestError::malformed)?;
        verify_certificate_nonce(&cred_cert_der, &nonce)?;

        // 4. The key id is the hash of the credential certificate's public key.
        let (public_key_der, public_key_point) = credential_public_key(&cred_cert)?;
        let public_key_hash = Sha256::digest(&public_key_point);
        if general_purpose::STANDARD.encode(public_key_hash) != key_id {
            return Err(AppAttestError::KeyIdMismatch);
        }

        // 5. The RP ID hash must be the hash of our App ID.
        let auth_data = AuthenticatorData::parse(&attestation.auth_data)?;
        auth_data.verify_app_id(&self.app_id)?;

        // 6. A freshly attested key has never signed anything.
        auth_data.verify_zero_counter()?;

        // 7. The AAGUID names the environment the app was built for.
        auth_data.verify_aaguid(self.environment)?;

        // 8. The credential id is the same public key hash.
        auth_data.verify_credential_id(&public_key_hash)?;

        Ok(VerifiedAttestation {
            public_key_der,
            receipt: attestation.statement.receipt.clone(),
        })
    }
}
