//! Fixture builders for exercising the verifiers without a real device.
//!
//! Available under `cfg(test)` and the `testing` feature. Everything is
//! generated at runtime with openssl: a self-signed P-256 root, an
//! intermediate CA standing in for "Apple App Attestation CA 1", and per-call
//! credential certificates carrying the nonce extension. Pass
//! [`TestCa::validator`] to the attestation verifier in place of the Apple root.
//!
//! The nonce extension is written as
//!
//! ```text
//! SEQUENCE {
//!   SEQUENCE {
//!     OCTET STRING (32 bytes)
//!   }
//! }
//! ```

use base64::{engine::general_purpose, Engine};
use byteorder::{BigEndian, ByteOrder};
use ciborium::{cbor, Value};
use openssl::{
    asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time},
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey, PointConversionForm},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rand::rand_bytes,
    sign::Signer,
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509Extension, X509Name, X509NameBuilder, X509NameRef, X509,
    },
};
use sha2::{Digest, Sha256};

use crate::{
    authenticator::{FLAG_ATTESTED_CREDENTIAL, FLAG_EXTENSIONS},
    certificate::CertificateChainValidator,
    config::Environment,
    nonce::{client_data_hash, nonce, NONCE_EXTENSION_OID},
};

pub type DeviceKey = PKey<Private>;

pub fn generate_device_key() -> DeviceKey {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// `0x04 || X || Y` for a P-256 key.
pub fn uncompressed_public_key(key: &DeviceKey) -> Vec<u8> {
    let ec_key = key.ec_key().unwrap();
    let mut ctx = BigNumContext::new().unwrap();
    ec_key
        .public_key()
        .to_bytes(ec_key.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
        .unwrap()
}

/// `base64(SHA256(uncompressed public key))`, the key id the device reports.
pub fn key_id(key: &DeviceKey) -> String {
    general_purpose::STANDARD.encode(Sha256::digest(uncompressed_public_key(key)))
}

pub fn nonce_extension_value(nonce: &[u8]) -> Vec<u8> {
    assert_eq!(nonce.len(), 32);
    let mut value = Vec::with_capacity(38);
    value.extend_from_slice(&[0x30, 0x24, 0x30, 0x22, 0x04, 0x20]);
    value.extend_from_slice(nonce);
    value
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_text("CN", common_name).unwrap();
    builder.append_entry_by_text("O", "Test").unwrap();
    builder.build()
}

fn certificate_builder(subject: &X509NameRef, issuer: &X509NameRef, key: &DeviceKey) -> X509Builder {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(issuer).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();

    let mut serial = [0u8; 8];
    rand_bytes(&mut serial).unwrap();
    serial[0] &= 0x7f;
    let serial = Asn1Integer::from_bn(&BigNum::from_slice(&serial).unwrap()).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder
}

fn mark_as_ca(builder: &mut X509Builder, is_ca: bool) {
    let constraints = if is_ca {
        BasicConstraints::new().critical().ca().build()
    } else {
        BasicConstraints::new().critical().build()
    };
    builder.append_extension(constraints.unwrap()).unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
}

/// A throwaway two level CA.
pub struct TestCa {
    pub root: X509,
    pub root_key: DeviceKey,
    pub intermediate: X509,
    pub intermediate_key: DeviceKey,
}

impl Default for TestCa {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCa {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// The intermediate is signed by the root but is not a CA certificate.
    pub fn new_with_non_ca_intermediate() -> Self {
        Self::build(false)
    }

    fn build(intermediate_is_ca: bool) -> Self {
        let root_key = generate_device_key();
        let root_name = name("Test App Attestation Root CA");
        let mut root = certificate_builder(&root_name, &root_name, &root_key);
        mark_as_ca(&mut root, true);
        root.sign(&root_key, MessageDigest::sha256()).unwrap();
        let root = root.build();

        let intermediate_key = generate_device_key();
        let intermediate_name = name("Test App Attestation CA 1");
        let mut intermediate =
            certificate_builder(&intermediate_name, root.subject_name(), &intermediate_key);
        mark_as_ca(&mut intermediate, intermediate_is_ca);
        intermediate.sign(&root_key, MessageDigest::sha256()).unwrap();

        TestCa {
            root,
            root_key,
            intermediate: intermediate.build(),
            intermediate_key,
        }
    }

    pub fn validator(&self) -> CertificateChainValidator {
        CertificateChainValidator::with_root(self.root.clone())
    }

    pub fn intermediate_der(&self) -> Vec<u8> {
        self.intermediate.to_der().unwrap()
    }

    /// Credential certificate for `device_key`, issued by the intermediate.
    pub fn issue_leaf(&self, device_key: &DeviceKey, nonce: Option<&[u8]>) -> X509 {
        leaf(device_key, self.intermediate.subject_name(), &self.intermediate_key, nonce, None)
    }

    /// Credential certificate valid between two Unix timestamps.
    pub fn issue_leaf_with_validity(
        &self,
        device_key: &DeviceKey,
        not_before: i64,
        not_after: i64,
    ) -> X509 {
        leaf(
            device_key,
            self.intermediate.subject_name(),
            &self.intermediate_key,
            None,
            Some((not_before, not_after)),
        )
    }

    /// Credential certificate issued straight from the root.
    pub fn issue_leaf_from_root(&self, device_key: &DeviceKey, nonce: Option<&[u8]>) -> X509 {
        leaf(device_key, self.root.subject_name(), &self.root_key, nonce, None)
    }

    /// Names the intermediate as issuer but signs with `signer`.
    pub fn issue_leaf_signed_by(&self, device_key: &DeviceKey, signer: &DeviceKey) -> X509 {
        leaf(device_key, self.intermediate.subject_name(), signer, None, None)
    }
}

fn leaf(
    device_key: &DeviceKey,
    issuer: &X509NameRef,
    signer: &DeviceKey,
    nonce: Option<&[u8]>,
    validity: Option<(i64, i64)>,
) -> X509 {
    let subject = name(&key_id(device_key));
    let mut builder = certificate_builder(&subject, issuer, device_key);
    if let Some((not_before, not_after)) = validity {
        builder
            .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
            .unwrap();
    }
    builder
        .append_extension(BasicConstraints::new().build().unwrap())
        .unwrap();

    if let Some(nonce) = nonce {
        let oid = Asn1Object::from_str(NONCE_EXTENSION_OID).unwrap();
        let value = Asn1OctetString::new_from_bytes(&nonce_extension_value(nonce)).unwrap();
        builder
            .append_extension(X509Extension::new_from_der(&oid, false, &value).unwrap())
            .unwrap();
    }

    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Builds raw authenticator data byte by byte.
#[derive(Debug, Clone)]
pub struct AuthenticatorDataBuilder {
    rp_id_hash: [u8; 32],
    flags: u8,
    sign_count: u32,
    attested: Option<([u8; 16], Vec<u8>, Vec<u8>)>,
    extensions: Vec<u8>,
}

impl AuthenticatorDataBuilder {
    pub fn new(rp_id_hash: [u8; 32]) -> Self {
        Self {
            rp_id_hash,
            flags: 0,
            sign_count: 0,
            attested: None,
            extensions: Vec::new(),
        }
    }

    pub fn for_app_id(app_id: &str) -> Self {
        Self::new(Sha256::digest(app_id.as_bytes()).into())
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn sign_count(mut self, sign_count: u32) -> Self {
        self.sign_count = sign_count;
        self
    }

    /// Appends attested credential data and sets the AT flag.
    pub fn attested(mut self, aaguid: [u8; 16], credential_id: &[u8], tail: &[u8]) -> Self {
        self.attested = Some((aaguid, credential_id.to_vec(), tail.to_vec()));
        self
    }

    /// Raw bytes appended after the fixed prefix, with the ED flag set.
    /// Ignored when attested credential data is present.
    pub fn extensions(mut self, extensions: &[u8]) -> Self {
        self.extensions = extensions.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut flags = self.flags;
        if self.attested.is_some() {
            flags |= FLAG_ATTESTED_CREDENTIAL;
        } else if !self.extensions.is_empty() {
            flags |= FLAG_EXTENSIONS;
        }

        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(&self.rp_id_hash);
        bytes.push(flags);
        let mut counter = [0u8; 4];
        BigEndian::write_u32(&mut counter, self.sign_count);
        bytes.extend_from_slice(&counter);

        if let Some((aaguid, credential_id, tail)) = &self.attested {
            bytes.extend_from_slice(aaguid);
            let mut length = [0u8; 2];
            BigEndian::write_u16(&mut length, credential_id.len() as u16);
            bytes.extend_from_slice(&length);
            bytes.extend_from_slice(credential_id);
            bytes.extend_from_slice(tail);
        } else {
            bytes.extend_from_slice(&self.extensions);
        }
        bytes
    }
}

/// Knobs for a synthetic attestation object. The defaults produce one that
/// verifies for `app_id`, `challenge` and `environment`.
#[derive(Debug, Clone)]
pub struct AttestationFixture {
    app_id: String,
    challenge: String,
    environment: Environment,
    receipt: Vec<u8>,
    sign_count: u32,
    rp_id: Option<String>,
    aaguid: Option<[u8; 16]>,
    credential_id: Option<Vec<u8>>,
    flipped_nonce_byte: Option<usize>,
    with_nonce: bool,
    directly_from_root: bool,
}

/// Output of [`AttestationFixture::build`].
pub struct BuiltAttestation {
    /// Base64 of the CBOR attestation object, as sent by the device.
    pub attestation: String,
    pub cbor: Vec<u8>,
    pub key_id: String,
    pub device_key: DeviceKey,
    pub credential_certificate: X509,
    pub auth_data: Vec<u8>,
}

impl AttestationFixture {
    pub fn new(app_id: &str, challenge: &str, environment: Environment) -> Self {
        Self {
            app_id: app_id.to_string(),
            challenge: challenge.to_string(),
            environment,
            receipt: b"receipt".to_vec(),
            sign_count: 0,
            rp_id: None,
            aaguid: None,
            credential_id: None,
            flipped_nonce_byte: None,
            with_nonce: true,
            directly_from_root: false,
        }
    }

    pub fn receipt(mut self, receipt: &[u8]) -> Self {
        self.receipt = receipt.to_vec();
        self
    }

    pub fn sign_count(mut self, sign_count: u32) -> Self {
        self.sign_count = sign_count;
        self
    }

    pub fn rp_id(mut self, rp_id: &str) -> Self {
        self.rp_id = Some(rp_id.to_string());
        self
    }

    pub fn aaguid(mut self, aaguid: [u8; 16]) -> Self {
        self.aaguid = Some(aaguid);
        self
    }

    pub fn credential_id(mut self, credential_id: &[u8]) -> Self {
        self.credential_id = Some(credential_id.to_vec());
        self
    }

    /// Flips one byte of the nonce written into the certificate.
    pub fn flip_nonce_byte(mut self, index: usize) -> Self {
        self.flipped_nonce_byte = Some(index);
        self
    }

    pub fn without_nonce(mut self) -> Self {
        self.with_nonce = false;
        self
    }

    /// Issue the credential certificate from the root, with no intermediate.
    pub fn directly_from_root(mut self) -> Self {
        self.directly_from_root = true;
        self
    }

    pub fn build(&self, ca: &TestCa) -> BuiltAttestation {
        let device_key = generate_device_key();
        let public_key_hash = Sha256::digest(uncompressed_public_key(&device_key));

        let rp_id = self.rp_id.as_deref().unwrap_or(&self.app_id);
        let aaguid = self.aaguid.unwrap_or(*self.environment.aaguid());
        let credential_id = self
            .credential_id
            .clone()
            .unwrap_or_else(|| public_key_hash.to_vec());

        let auth_data = AuthenticatorDataBuilder::for_app_id(rp_id)
            .flags(0x40)
            .sign_count(self.sign_count)
            .attested(aaguid, &credential_id, &cose_key_placeholder())
            .build();

        let mut nonce = nonce(&auth_data, &client_data_hash(self.challenge.as_bytes()));
        if let Some(index) = self.flipped_nonce_byte {
            nonce[index] ^= 0xff;
        }
        let nonce = self.with_nonce.then_some(&nonce[..]);

        let (credential_certificate, chain) = if self.directly_from_root {
            (ca.issue_leaf_from_root(&device_key, nonce), vec![])
        } else {
            (ca.issue_leaf(&device_key, nonce), vec![ca.intermediate_der()])
        };

        let mut x5c = vec![Value::Bytes(credential_certificate.to_der().unwrap())];
        x5c.extend(chain.into_iter().map(Value::Bytes));

        let cbor = encode(
            &cbor!({
                "fmt" => "apple-appattest",
                "attStmt" => {
                    "x5c" => Value::Array(x5c),
                    "receipt" => Value::Bytes(self.receipt.clone())
                },
                "authData" => Value::Bytes(auth_data.clone())
            })
            .unwrap(),
        );

        BuiltAttestation {
            attestation: general_purpose::STANDARD.encode(&cbor),
            cbor,
            key_id: general_purpose::STANDARD.encode(public_key_hash),
            device_key,
            credential_certificate,
            auth_data,
        }
    }
}

/// Stand-in for the COSE key that follows the credential id.
fn cose_key_placeholder() -> Vec<u8> {
    vec![0xa5, 0x01, 0x02, 0x03, 0x26]
}

fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).unwrap();
    buf
}

/// ECDSA P-256 / SHA-256 signature in DER form, as the device produces it.
pub fn sign(device_key: &DeviceKey, message: &[u8]) -> Vec<u8> {
    let mut signer = Signer::new(MessageDigest::sha256(), device_key).unwrap();
    signer.update(message).unwrap();
    signer.sign_to_vec().unwrap()
}

pub fn assertion_cbor(authenticator_data: &[u8], signature: &[u8]) -> Vec<u8> {
    encode(
        &cbor!({
            "signature" => Value::Bytes(signature.to_vec()),
            "authenticatorData" => Value::Bytes(authenticator_data.to_vec())
        })
        .unwrap(),
    )
}

/// Base64 assertion object over `client_data` for the given counter.
pub fn build_assertion(
    app_id: &str,
    client_data: &[u8],
    sign_count: u32,
    device_key: &DeviceKey,
) -> String {
    let authenticator_data = AuthenticatorDataBuilder::for_app_id(app_id)
        .flags(0x01)
        .sign_count(sign_count)
        .build();
    let nonce = nonce(&authenticator_data, &client_data_hash(client_data));
    let signature = sign(device_key, &nonce);
    general_purpose::STANDARD.encode(assertion_cbor(&authenticator_data, &signature))
}
