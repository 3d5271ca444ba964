use base64::{engine::general_purpose, Engine};
use p256::{
    ecdsa::{signature::Verifier, Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
};
use serde::Deserialize;
use tracing::instrument;

use crate::{
    authenticator::AuthenticatorData,
    config::{AppAttestConfig, CounterPolicy},
    error::{AppAttestError, Result},
    nonce::{client_data_hash, nonce},
};

/// Decoded assertion object.
#[derive(Deserialize, Debug, Clone)]
pub struct Assertion {
    #[serde(rename = "authenticatorData")]
    pub raw_authenticator_data: Vec<u8>,
    #[serde(rename = "signature")]
    pub signature: Vec<u8>,
}

#[derive(Deserialize, Debug)]
struct ClientData {
    challenge: String,
}

impl Assertion {
    /// Creates a new `Assertion` from a Base64-encoded CBOR string.
    ///
    /// # Errors
    /// Returns `MalformedInput` if decoding or deserialization fails.
    pub fn from_base64(base64_assertion: &str) -> Result<Self> {
        let decoded_bytes = general_purpose::STANDARD
            .decode(base64_assertion.trim())
            .map_err(|e| AppAttestError::malformed(format!("assertion is not base64: {e}")))?;

        Self::from_cbor(&decoded_bytes)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| AppAttestError::malformed(format!("assertion object: {e}")))
    }

    /// The counter the device reported; persist it after a successful
    /// verification and pass it back as `previous_count` next time.
    pub fn sign_count(&self) -> Result<u32> {
        Ok(AuthenticatorData::parse(&self.raw_authenticator_data)?.sign_count)
    }
}

/// Verifies assertions made with one previously attested key.
#[derive(Debug, Clone)]
pub struct AssertionVerifier {
    app_id: String,
    public_key: VerifyingKey,
    counter_policy: CounterPolicy,
}

impl AssertionVerifier {
    /// `public_key` is the key stored at attestation time, either as
    /// SubjectPublicKeyInfo DER or as a SEC1 encoded point.
    pub fn new(app_id: impl Into<String>, public_key: &[u8]) -> Result<Self> {
        let public_key = VerifyingKey::from_public_key_der(public_key)
            .or_else(|_| VerifyingKey::from_sec1_bytes(public_key))
            .map_err(|_| AppAttestError::malformed("failed to parse the public key"))?;

        Ok(Self {
            app_id: app_id.into(),
            public_key,
            counter_policy: CounterPolicy::default(),
        })
    }

    pub fn from_config(config: &AppAttestConfig, public_key: &[u8]) -> Result<Self> {
        Ok(Self::new(config.app_id.clone(), public_key)?
            .with_counter_policy(config.counter_policy))
    }

    pub fn with_counter_policy(mut self, counter_policy: CounterPolicy) -> Self {
        self.counter_policy = counter_policy;
        self
    }

    /// Verifies a base64 assertion object.
    ///
    /// * `client_data` - the exact bytes the client passed to
    ///   `generateAssertion`, hashed into the signed nonce.
    /// * `client_data_challenge` - the challenge carried inside `client_data`.
    /// * `expected_challenge` - the challenge the server issued.
    /// * `previous_count` - the counter stored after the last successful assertion.
    ///
    /// # Example
    /// ```no_run
    /// use devicecheck::AssertionVerifier;
    ///
    /// # fn main() -> devicecheck::Result<()> {
    /// # let stored_public_key: Vec<u8> = vec![];
    /// let verifier = AssertionVerifier::new("TEAMID.com.example.app", &stored_public_key)?;
    /// verifier.verify(
    ///     br#"{"challenge":"challenge123"}"#,
    ///     "challenge123",
    ///     "challenge123",
    ///     "base64_encoded_assertion_object",
    ///     5,
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn verify(
        &self,
        client_data: &[u8],
        client_data_challenge: &str,
        expected_challenge: &str,
        assertion_object: &str,
        previous_count: u32,
    ) -> Result<()> {
        let assertion = Assertion::from_base64(assertion_object).inspect_err(|e| {
            debug!(check = e.label(), "assertion object rejected");
        })?;
        self.verify_assertion(
            &assertion,
            client_data,
            client_data_challenge,
            expected_challenge,
            previous_count,
        )
    }

    /// Like [`verify`](Self::verify), taking the challenge from the
    /// `challenge` field of the client data JSON.
    pub fn verify_client_data(
        &self,
        client_data_json: &[u8],
        expected_challenge: &str,
        assertion_object: &str,
        previous_count: u32,
    ) -> Result<()> {
        let client_data = serde_json::from_slice::<ClientData>(client_data_json)
            .map_err(|e| AppAttestError::malformed(format!("client data: {e}")))?;

        self.verify(
            client_data_json,
            &client_data.challenge,
            expected_challenge,
            assertion_object,
            previous_count,
        )
    }

    /// Runs every check, in order, against an already decoded assertion.
    #[instrument(
        level = "debug",
        skip_all,
        fields(app_id = %self.app_id, previous_count = previous_count)
    )]
    pub fn verify_assertion(
        &self,
        assertion: &Assertion,
        client_data: &[u8],
        client_data_challenge: &str,
        expected_challenge: &str,
        previous_count: u32,
    ) -> Result<()> {
        self.verify_steps(
            assertion,
            client_data,
            client_data_challenge,
            expected_challenge,
            previous_count,
        )
        .inspect(|_| debug!("assertion verified"))
        .inspect_err(|e| debug!(check = e.label(), "assertion rejected"))
    }

    fn verify_steps(
        &self,
        assertion: &Assertion,
        client_data: &[u8],
        client_data_challenge: &str,
        expected_challenge: &str,
        previous_count: u32,
    ) -> Result<()> {
        let auth_data = AuthenticatorData::parse(&assertion.raw_authenticator_data)?;

        // 1. The RP ID hash must be the hash of our App ID.
        auth_data.verify_app_id(&self.app_id)?;

        // 2. The counter must not go backwards.
        if !self
            .counter_policy
            .accepts(auth_data.sign_count, previous_count)
        {
            return Err(AppAttestError::CounterRegressed);
        }

        // 3. The client data must carry the challenge we issued.
        if client_data_challenge != expected_challenge {
            return Err(AppAttestError::ChallengeMismatch);
        }

        // 4. nonce = SHA256(authenticatorData || SHA256(clientData)), signed by the attested key.
        let nonce = nonce(auth_data.raw(), &client_data_hash(client_data));
        let signature =
            Signature::from_der(&assertion.signature).map_err(|_| AppAttestError::SignatureInvalid)?;
        self.public_key
            .verify(&nonce, &signature)
            .map_err(|_| AppAttestError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        assertion_cbor, build_assertion, generate_device_key, sign, AuthenticatorDataBuilder,
        DeviceKey,
    };

    const APP_ID: &str = "TEAMID.com.example.foo";
    const CHALLENGE: &str = "challenge123";

    fn client_data() -> Vec<u8> {
        format!(r#"{{"foo":200,"challenge":"{CHALLENGE}"}}"#).into_bytes()
    }

    fn verifier(key: &DeviceKey) -> AssertionVerifier {
        AssertionVerifier::new(APP_ID, &key.public_key_to_der().unwrap()).unwrap()
    }

    #[test]
    fn valid_assertion() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 0, &key);

        assert!(verifier(&key)
            .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0)
            .is_ok());
        assert!(verifier(&key)
            .verify_client_data(&client_data(), CHALLENGE, &assertion, 0)
            .is_ok());
    }

    #[test]
    fn accepts_extension_data_after_fixed_prefix() {
        let key = generate_device_key();
        // {"credProtect": 2}
        let mut extensions = vec![0xa1, 0x6b];
        extensions.extend_from_slice(b"credProtect");
        extensions.push(0x02);

        let authenticator_data = AuthenticatorDataBuilder::for_app_id(APP_ID)
            .flags(0x01)
            .sign_count(5)
            .extensions(&extensions)
            .build();
        let signature = sign(
            &key,
            &nonce(&authenticator_data, &client_data_hash(&client_data())),
        );
        let assertion =
            general_purpose::STANDARD.encode(assertion_cbor(&authenticator_data, &signature));

        assert_eq!(Assertion::from_base64(&assertion).unwrap().sign_count().unwrap(), 5);
        assert!(verifier(&key)
            .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 4)
            .is_ok());
    }

    #[test]
    fn accepts_sec1_public_key() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 3, &key);
        let sec1 = crate::testing::uncompressed_public_key(&key);

        assert!(AssertionVerifier::new(APP_ID, &sec1)
            .unwrap()
            .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 2)
            .is_ok());
    }

    #[test]
    fn rejects_unparseable_public_key() {
        assert!(matches!(
            AssertionVerifier::new(APP_ID, b"not a key"),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn rp_id_mismatch() {
        let key = generate_device_key();
        let assertion = build_assertion("some.other.id", &client_data(), 0, &key);

        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0)
                .unwrap_err(),
            AppAttestError::RpIdMismatch
        );
    }

    #[test]
    fn counter_regressed() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 9, &key);

        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 10)
                .unwrap_err(),
            AppAttestError::CounterRegressed
        );
    }

    #[test]
    fn equal_counter_depends_on_policy() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 10, &key);

        assert!(verifier(&key)
            .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 10)
            .is_ok());
        assert_eq!(
            verifier(&key)
                .with_counter_policy(CounterPolicy::StrictlyIncreasing)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 10)
                .unwrap_err(),
            AppAttestError::CounterRegressed
        );
    }

    #[test]
    fn challenge_mismatch_with_valid_signature() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 1, &key);
        let expected = format!("{CHALLENGE}-other");

        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, &expected, &assertion, 0)
                .unwrap_err(),
            AppAttestError::ChallengeMismatch
        );
        assert_eq!(
            verifier(&key)
                .verify_client_data(&client_data(), &expected, &assertion, 0)
                .unwrap_err(),
            AppAttestError::ChallengeMismatch
        );
    }

    #[test]
    fn tampered_signature() {
        let key = generate_device_key();
        let authenticator_data = AuthenticatorDataBuilder::for_app_id(APP_ID)
            .sign_count(1)
            .build();
        let nonce = nonce(&authenticator_data, &client_data_hash(&client_data()));
        let mut signature = sign(&key, &nonce);
        let last = signature.len() - 1;
        signature[last] ^= 0x01;

        let assertion =
            general_purpose::STANDARD.encode(assertion_cbor(&authenticator_data, &signature));
        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0)
                .unwrap_err(),
            AppAttestError::SignatureInvalid
        );
    }

    #[test]
    fn signature_from_another_key() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, &client_data(), 1, &generate_device_key());

        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0)
                .unwrap_err(),
            AppAttestError::SignatureInvalid
        );
    }

    #[test]
    fn signature_over_different_client_data() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, b"{\"challenge\":\"other\"}", 1, &key);

        assert_eq!(
            verifier(&key)
                .verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0)
                .unwrap_err(),
            AppAttestError::SignatureInvalid
        );
    }

    #[test]
    fn client_data_without_challenge() {
        let key = generate_device_key();
        let assertion = build_assertion(APP_ID, b"{\"foo\":1}", 1, &key);

        assert!(matches!(
            verifier(&key).verify_client_data(b"{\"foo\":1}", CHALLENGE, &assertion, 0),
            Err(AppAttestError::MalformedInput(_))
        ));
    }

    #[test]
    fn from_base64_valid() {
        let valid_cbor_base64 = "omlzaWduYXR1cmVYRjBEAiAImFuY4+UbGZ5/ZbjAJpjQ3bd8GxaKFpMEo58WMEUGbwIgaqdDJnVS8/3oJCz16O5Zp4Qga5g6zrFF7eoiYEWkdtNxYXV0aGVudGljYXRvckRhdGFYJaRc2WwGuoniZEqtF+kolObjxcczFdDxbrhJR/nT8ehTQAAAAAI=";
        let assertion = Assertion::from_base64(valid_cbor_base64).unwrap();

        assert_eq!(assertion.raw_authenticator_data.len(), 37);
        assert_eq!(assertion.signature.len(), 70);
        assert_eq!(assertion.sign_count().unwrap(), 2);
    }

    #[test]
    fn truncated_authenticator_data() {
        let key = generate_device_key();
        let assertion =
            general_purpose::STANDARD.encode(assertion_cbor(&[0u8; 20], &sign(&key, b"x")));

        assert!(matches!(
            verifier(&key).verify(&client_data(), CHALLENGE, CHALLENGE, &assertion, 0),
            Err(AppAttestError::MalformedInput(_))
        ));
    }
}
