//! Runs a full attestation followed by two assertions against a synthetic CA.
//!
//! ```text
//! RUST_LOG=devicecheck=debug cargo run --example assertion --features testing
//! ```

use devicecheck::{
    testing::{build_assertion, AttestationFixture, TestCa},
    AssertionVerifier, AttestationVerifier, Environment,
};
use tracing_subscriber::EnvFilter;

fn main() -> devicecheck::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_id = "9000738U8.auth.iphone.com";
    let challenge = "5b3b2303-e650-4a56-a9ec-33e3e2a90d14";

    let ca = TestCa::new();
    let built = AttestationFixture::new(app_id, challenge, Environment::Development).build(&ca);

    let verifier = AttestationVerifier::new(app_id, Environment::Development)?
        .with_validator(ca.validator());
    let verified = verifier.attest(&built.key_id, &built.attestation, challenge)?;
    println!("attested key {} ({} byte receipt)", built.key_id, verified.receipt.len());

    let assertions = AssertionVerifier::new(app_id, &verified.public_key_der)?;
    let mut counter = 0;
    for next in [1, 2] {
        let client_data = format!(r#"{{"challenge":"{challenge}"}}"#);
        let assertion = build_assertion(app_id, client_data.as_bytes(), next, &built.device_key);

        match assertions.verify_client_data(client_data.as_bytes(), challenge, &assertion, counter) {
            Ok(()) => {
                println!("assertion with counter {next} verified");
                counter = next;
            }
            Err(e) => println!("assertion rejected: {e} ({})", e.label()),
        }
    }

    let replay = build_assertion(app_id, br#"{"challenge":"stale"}"#, counter, &built.device_key);
    if let Err(e) = assertions.verify_client_data(br#"{"challenge":"stale"}"#, challenge, &replay, counter) {
        println!("replayed assertion rejected: {e}");
    }

    Ok(())
}
