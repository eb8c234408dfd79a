use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Auth material supplied with a scan request and stored (as ciphertext)
/// in the job's config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub access_token: String,
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("failed to encode credential: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode credential: {0}")]
    Decode(serde_json::Error),
}

/// Boundary for credential encryption-at-rest.
///
/// The engine only ever sees ciphertext strings in stored job config; a
/// deployment plugs in a KMS-backed implementation here. The shipped
/// `PassthroughCipher` is the transparent JSON encoding used when
/// encryption is disabled.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, auth: &AuthConfig) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<AuthConfig, CipherError>;
}

#[derive(Debug, Default, Clone)]
pub struct PassthroughCipher;

impl CredentialCipher for PassthroughCipher {
    fn encrypt(&self, auth: &AuthConfig) -> Result<String, CipherError> {
        serde_json::to_string(auth).map_err(CipherError::Encode)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<AuthConfig, CipherError> {
        serde_json::from_str(ciphertext).map_err(CipherError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trips() {
        let cipher = PassthroughCipher;
        let auth = AuthConfig {
            access_token: "pat-123".to_string(),
        };

        let stored = cipher.encrypt(&auth).unwrap();
        let restored = cipher.decrypt(&stored).unwrap();

        assert_eq!(restored.access_token, "pat-123");
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let cipher = PassthroughCipher;
        assert!(cipher.decrypt("not-json").is_err());
    }
}
