//! Per-session certificate provisioning.
//!
//! Mutual-TLS sessions present identity through ephemeral self-signed
//! certificates: each side generates a fresh keypair and certificate for
//! every session and trusts exactly the certificate the other side
//! presented. Nothing here touches the filesystem and nothing is cached;
//! rapid successive calls produce cryptographically independent material.
//!
//! EC keys come straight from `rcgen`; RSA keypairs are generated with the
//! `rsa` crate (rcgen cannot generate them) and imported for signing.

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair, SanType,
    SignatureAlgorithm,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::KeyType;

/// DNS name placed in every session certificate and used as the TLS server
/// name when dialing.
pub const SESSION_SERVER_NAME: &str = "localhost";

/// RSA key size for [`KeyType::Rsa`] sessions.
pub const RSA_KEY_BITS: usize = 2048;

/// Certificate provisioning errors.
#[derive(Debug, Error)]
pub enum CertError {
    /// EC was requested with a curve outside the supported set.
    #[error("unsupported key parameters: key type {key_type:?} with curve {curve:?}")]
    UnsupportedKeyParameters {
        /// Requested key family.
        key_type: KeyType,
        /// Rejected curve name.
        curve: String,
    },

    /// Keypair generation failed.
    #[error("key generation failed: {reason}")]
    KeyGeneration {
        /// Description of the failure.
        reason: String,
    },

    /// Certificate construction or signing failed.
    #[error("certificate generation failed: {reason}")]
    Certificate {
        /// Description of the failure.
        reason: String,
    },
}

/// Ephemeral session credentials: a keypair and its self-signed
/// certificate.
///
/// Key material is zeroized on drop and is never written to disk. A
/// `Credentials` value belongs to exactly one session.
pub struct Credentials {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: Zeroizing<Vec<u8>>,
    key_pem: Zeroizing<String>,
}

impl Credentials {
    /// Certificate in PEM form, as handed to the peer via the environment.
    #[must_use]
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Certificate in DER form, as trusted by the other side.
    #[must_use]
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Certificate as base64 DER, the form carried in a handshake line.
    #[must_use]
    pub fn certificate_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(self.cert_der.as_ref())
    }

    /// Private key (PKCS#8 PEM). Only ever shared with the local TLS stack.
    #[must_use]
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Private key as a rustls key, cloned out of the zeroized buffer.
    #[must_use]
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is deliberately absent.
        f.debug_struct("Credentials")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Generates fresh session credentials.
///
/// For [`KeyType::Ec`] the curve must be one of `secp256r1`/`P-256`,
/// `secp384r1`/`P-384`, `secp521r1`/`P-521`, or `auto` (provisioner's
/// choice, currently P-256). For [`KeyType::Rsa`] the curve argument is
/// accepted and ignored, whatever its value.
///
/// # Errors
///
/// [`CertError::UnsupportedKeyParameters`] for an unrecognized EC curve;
/// [`CertError::KeyGeneration`] / [`CertError::Certificate`] if the
/// underlying generation fails.
pub fn provision(key_type: KeyType, curve: &str) -> Result<Credentials, CertError> {
    let key_pair = match key_type {
        KeyType::Ec => generate_ec_key(curve)?,
        KeyType::Rsa => generate_rsa_key()?,
    };

    let params = session_params()?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Certificate {
            reason: e.to_string(),
        })?;

    Ok(Credentials {
        cert_pem: cert.pem(),
        cert_der: cert.der().clone(),
        key_der: Zeroizing::new(key_pair.serialize_der()),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
    })
}

/// Resolves a curve name to an rcgen signature algorithm.
fn ec_algorithm(curve: &str) -> Option<&'static SignatureAlgorithm> {
    match curve.to_ascii_lowercase().as_str() {
        "" | "auto" | "secp256r1" | "p-256" | "p256" | "prime256v1" => {
            Some(&rcgen::PKCS_ECDSA_P256_SHA256)
        }
        "secp384r1" | "p-384" | "p384" => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
        "secp521r1" | "p-521" | "p521" => Some(&rcgen::PKCS_ECDSA_P521_SHA512),
        _ => None,
    }
}

fn generate_ec_key(curve: &str) -> Result<KeyPair, CertError> {
    let algorithm = ec_algorithm(curve).ok_or_else(|| CertError::UnsupportedKeyParameters {
        key_type: KeyType::Ec,
        curve: curve.to_string(),
    })?;

    KeyPair::generate_for(algorithm).map_err(|e| CertError::KeyGeneration {
        reason: e.to_string(),
    })
}

fn generate_rsa_key() -> Result<KeyPair, CertError> {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).map_err(|e| {
        CertError::KeyGeneration {
            reason: e.to_string(),
        }
    })?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertError::KeyGeneration {
            reason: e.to_string(),
        })?;

    KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256).map_err(|e| {
        CertError::KeyGeneration {
            reason: e.to_string(),
        }
    })
}

/// Certificate parameters shared by both sides of a session.
fn session_params() -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "shakedown session");

    let dns = Ia5String::try_from(SESSION_SERVER_NAME).map_err(|e| CertError::Certificate {
        reason: e.to_string(),
    })?;
    params.subject_alt_names = vec![
        SanType::DnsName(dns),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];

    // Both ends present and verify, so every session certificate carries
    // both EKUs.
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisions_every_supported_ec_curve() {
        for curve in [
            "auto",
            "secp256r1",
            "P-256",
            "secp384r1",
            "P-384",
            "secp521r1",
            "P-521",
        ] {
            let creds = provision(KeyType::Ec, curve)
                .unwrap_or_else(|e| panic!("curve {curve} should provision: {e}"));
            assert!(creds.certificate_pem().contains("BEGIN CERTIFICATE"));
            assert!(!creds.certificate_der().is_empty());
        }
    }

    #[test]
    fn rejects_unsupported_ec_curve() {
        for curve in ["secp192r1", "curve25519", "bogus"] {
            assert!(matches!(
                provision(KeyType::Ec, curve),
                Err(CertError::UnsupportedKeyParameters { .. })
            ));
        }
    }

    #[test]
    fn rsa_ignores_curve_including_invalid_values() {
        for curve in ["auto", "secp384r1", "not-a-curve", ""] {
            let creds = provision(KeyType::Rsa, curve)
                .unwrap_or_else(|e| panic!("rsa with curve {curve:?} should provision: {e}"));
            assert!(creds.certificate_pem().contains("BEGIN CERTIFICATE"));
        }
    }

    #[test]
    fn successive_calls_are_independent() {
        let a = provision(KeyType::Ec, "auto").unwrap();
        let b = provision(KeyType::Ec, "auto").unwrap();

        assert_ne!(a.certificate_der(), b.certificate_der());
        assert_ne!(a.private_key_pem(), b.private_key_pem());
    }

    #[test]
    fn private_key_is_valid_pkcs8() {
        let creds = provision(KeyType::Ec, "auto").unwrap();
        assert!(matches!(creds.private_key(), PrivateKeyDer::Pkcs8(_)));
        assert!(creds.private_key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let creds = provision(KeyType::Ec, "auto").unwrap();
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
