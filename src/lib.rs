//! Server side verification for Apple App Attest.
//!
//! Two flows are covered:
//!
//! * [`AttestationVerifier`] checks the one time attestation object a device
//!   sends after generating a key, and returns the public key and receipt to
//!   store against the key id.
//! * [`AssertionVerifier`] checks every later request signed with that key,
//!   against the stored public key and sign counter.
//!
//! With the `bits-client` feature (on by default), [`bits::BitsClient`] talks
//! to the DeviceCheck two-bit endpoints.
//!
//! Verification emits `tracing` events at `debug` level naming the check that
//! failed; install a subscriber to see them.

#[macro_use]
extern crate tracing;

pub mod assertion;
pub mod attestation;
pub mod authenticator;
pub mod certificate;
pub mod config;
pub mod error;
pub mod nonce;

#[cfg(feature = "bits-client")]
pub mod bits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use assertion::{Assertion, AssertionVerifier};
pub use attestation::{Attestation, AttestationStatement, AttestationVerifier, VerifiedAttestation};
pub use authenticator::{AttestedCredentialData, AuthenticatorData};
pub use certificate::{CertificateChainValidator, APPLE_APP_ATTESTATION_ROOT_CA_PEM};
pub use config::{AppAttestConfig, ConfigError, CounterPolicy, Environment};
pub use error::{AppAttestError, Result};

#[cfg(feature = "bits-client")]
pub use bits::{BitsClient, BitsError, BitsState};
