use thiserror::Error;

/// Every way a single attestation or assertion verification can fail.
///
/// Verification is fail-fast: the first failing check is returned and no
/// further checks run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppAttestError {
    #[error("Failed certificate chain check")]
    CertificateChainInvalid,

    #[error("Failed challenge check")]
    ChallengeMismatch,

    #[error("Failed key ID check")]
    KeyIdMismatch,

    #[error("Failed RP ID check")]
    RpIdMismatch,

    #[error("Failed sign counter = 0 check")]
    SignCounterNonZero,

    #[error("Failed AAGUID check")]
    AaguidMismatch,

    #[error("Failed credentialId check")]
    CredentialIdMismatch,

    #[error("Failed count check")]
    CounterRegressed,

    #[error("Failed signature check")]
    SignatureInvalid,

    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

impl AppAttestError {
    /// Stable identifier for the failure kind, suitable for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AppAttestError::CertificateChainInvalid => "certificate_chain_invalid",
            AppAttestError::ChallengeMismatch => "challenge_mismatch",
            AppAttestError::KeyIdMismatch => "key_id_mismatch",
            AppAttestError::RpIdMismatch => "rp_id_mismatch",
            AppAttestError::SignCounterNonZero => "sign_counter_non_zero",
            AppAttestError::AaguidMismatch => "aaguid_mismatch",
            AppAttestError::CredentialIdMismatch => "credential_id_mismatch",
            AppAttestError::CounterRegressed => "counter_regressed",
            AppAttestError::SignatureInvalid => "signature_invalid",
            AppAttestError::MalformedInput(_) => "malformed_input",
        }
    }

    pub(crate) fn malformed(what: impl std::fmt::Display) -> Self {
        AppAttestError::MalformedInput(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppAttestError>;
