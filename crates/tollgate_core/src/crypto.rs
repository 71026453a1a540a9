//! Per-tenant envelope encryption for secrets at rest.
//!
//! A single 32-byte master key is expanded with HKDF-SHA256 into one
//! AES-256-GCM key per (purpose, tenant). The purpose label is the HKDF salt
//! and the tenant id is the info string, so a token key can never open a
//! credential and one tenant's key can never open another's.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use miette::Diagnostic;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::context::TenantId;

/// Environment variable the master key is read from when not configured.
pub const MASTER_KEY_ENV: &str = "TOLLGATE_MASTER_KEY";

/// Length of the master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

#[derive(Error, Diagnostic, Debug)]
pub enum CryptoError {
    #[error("Invalid master key: {reason}")]
    #[diagnostic(
        code(tollgate_core::crypto::invalid_key),
        help("Generate a key with `tollgate key generate` and set TOLLGATE_MASTER_KEY")
    )]
    InvalidKey { reason: String },

    #[error("Encryption failed")]
    #[diagnostic(code(tollgate_core::crypto::encrypt))]
    EncryptionFailed,

    /// Wrong key, tenant or purpose, or the bytes were tampered with.
    #[error("Decryption failed")]
    #[diagnostic(code(tollgate_core::crypto::decrypt))]
    DecryptionFailed,

    #[error("Ciphertext too short: {len} bytes")]
    #[diagnostic(code(tollgate_core::crypto::truncated))]
    Truncated { len: usize },

    #[error("Decrypted payload is not valid: {reason}")]
    #[diagnostic(code(tollgate_core::crypto::payload))]
    InvalidPayload { reason: String },
}

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::EncryptionFailed
    }
}

/// Which key space a secret belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    Credential,
    Token,
}

impl KeyPurpose {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Credential => "tollgate.credential.v1",
            Self::Token => "tollgate.token.v1",
        }
    }
}

/// The root secret every per-tenant key is derived from.
#[derive(Clone)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; MASTER_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!("expected {MASTER_KEY_LEN} bytes, got {}", bytes.len()),
            })?;
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey {
                reason: format!("not valid base64: {e}"),
            })?;
        Self::from_bytes(&bytes)
    }

    /// Read the key from [`MASTER_KEY_ENV`].
    pub fn from_env() -> Result<Self, CryptoError> {
        let encoded = std::env::var(MASTER_KEY_ENV).map_err(|_| CryptoError::InvalidKey {
            reason: format!("{MASTER_KEY_ENV} is not set"),
        })?;
        Self::from_base64(&encoded)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::InvalidKey {
                reason: "system random source unavailable".to_string(),
            })?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Symmetric encryption scoped by tenant and purpose.
#[derive(Clone)]
pub struct CryptoBox {
    master_key: MasterKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox").finish_non_exhaustive()
    }
}

impl CryptoBox {
    pub fn new(master_key: MasterKey) -> Self {
        Self {
            master_key,
            rng: SystemRandom::new(),
        }
    }

    fn derive_key(&self, tenant: &TenantId, purpose: KeyPurpose) -> Result<LessSafeKey, CryptoError> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, purpose.label().as_bytes());
        let prk = salt.extract(&self.master_key.0);
        let info = [tenant.as_str().as_bytes()];
        let okm = prk
            .expand(&info, &AES_256_GCM)
            .map_err(|_| CryptoError::InvalidKey {
                reason: "key derivation failed".to_string(),
            })?;
        Ok(LessSafeKey::new(UnboundKey::from(okm)))
    }

    fn aad(tenant: &TenantId, purpose: KeyPurpose) -> String {
        format!("{}|{}", purpose.label(), tenant.as_str())
    }

    pub fn encrypt(
        &self,
        tenant: &TenantId,
        purpose: KeyPurpose,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.derive_key(tenant, purpose)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let aad = Self::aad(tenant, purpose);
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::from(aad.as_bytes()), &mut in_out)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn decrypt(
        &self,
        tenant: &TenantId,
        purpose: KeyPurpose,
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::Truncated { len: sealed.len() });
        }

        let key = self.derive_key(tenant, purpose)?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let aad = Self::aad(tenant, purpose);
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(aad.as_bytes()), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(plaintext.to_vec())
    }

    pub fn encrypt_str(
        &self,
        tenant: &TenantId,
        purpose: KeyPurpose,
        plaintext: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(tenant, purpose, plaintext.as_bytes())
    }

    pub fn decrypt_string(
        &self,
        tenant: &TenantId,
        purpose: KeyPurpose,
        sealed: &[u8],
    ) -> Result<String, CryptoError> {
        let bytes = self.decrypt(tenant, purpose, sealed)?;
        String::from_utf8(bytes).map_err(|e| CryptoError::InvalidPayload {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> CryptoBox {
        CryptoBox::new(MasterKey::from_bytes(&[7u8; MASTER_KEY_LEN]).unwrap())
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let crypto = crypto();
        let sealed = crypto
            .encrypt(&tenant("acme"), KeyPurpose::Credential, b"{\"key\":\"abc\"}")
            .unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"{\"key\":\"abc\"}");

        let opened = crypto
            .decrypt(&tenant("acme"), KeyPurpose::Credential, &sealed)
            .unwrap();
        assert_eq!(opened, b"{\"key\":\"abc\"}");
    }

    #[test]
    fn test_nonces_differ_between_calls() {
        let crypto = crypto();
        let a = crypto.encrypt_str(&tenant("acme"), KeyPurpose::Token, "tok").unwrap();
        let b = crypto.encrypt_str(&tenant("acme"), KeyPurpose::Token, "tok").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_tenant_or_purpose_fails() {
        let crypto = crypto();
        let sealed = crypto
            .encrypt_str(&tenant("acme"), KeyPurpose::Credential, "secret")
            .unwrap();

        assert!(matches!(
            crypto.decrypt(&tenant("globex"), KeyPurpose::Credential, &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(
            crypto.decrypt(&tenant("acme"), KeyPurpose::Token, &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let sealed = crypto()
            .encrypt_str(&tenant("acme"), KeyPurpose::Token, "secret")
            .unwrap();
        let other = CryptoBox::new(MasterKey::from_bytes(&[8u8; MASTER_KEY_LEN]).unwrap());
        assert!(other.decrypt(&tenant("acme"), KeyPurpose::Token, &sealed).is_err());
    }

    #[test]
    fn test_tampered_and_truncated_fail() {
        let crypto = crypto();
        let mut sealed = crypto
            .encrypt_str(&tenant("acme"), KeyPurpose::Token, "secret")
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            crypto.decrypt(&tenant("acme"), KeyPurpose::Token, &sealed),
            Err(CryptoError::DecryptionFailed)
        ));

        assert!(matches!(
            crypto.decrypt(&tenant("acme"), KeyPurpose::Token, &[0u8; 10]),
            Err(CryptoError::Truncated { len: 10 })
        ));
    }

    #[test]
    fn test_master_key_parsing() {
        let key = MasterKey::generate().unwrap();
        let parsed = MasterKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed.to_base64(), key.to_base64());

        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            MasterKey::from_base64(&short),
            Err(CryptoError::InvalidKey { .. })
        ));
        assert!(MasterKey::from_base64("not base64!").is_err());
        assert_eq!(format!("{key:?}"), "MasterKey(..)");
    }
}
