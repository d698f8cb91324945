//! Payload sealing for intents that require encryption.
//!
//! A sealed payload is stored as
//! `{"$key": "<record key>", "$sealed": "<base64(nonce || ciphertext)>"}`
//! where the ciphertext is the AES-256-GCM encryption of the JSON document
//! with the 128-bit tag appended.  The collection and key are bound as
//! associated data, so a sealed record copied to another key will not open.
//! The key is carried in the clear so query results can be opened without
//! knowing where they were read from.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

const SEALED_FIELD: &str = "$sealed";
const KEY_FIELD: &str = "$key";

pub struct Sealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sealer(..)")
    }
}

impl Sealer {
    pub fn new(key: &[u8]) -> StoreResult<Self> {
        if key.len() != KEY_LEN {
            return Err(StoreError::Crypto(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| StoreError::Crypto("failed to create AES-256-GCM key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a base64-encoded 256-bit key.
    pub fn from_base64(encoded: &str) -> StoreResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| StoreError::Crypto(format!("key is not valid base64: {e}")))?;
        Self::new(&bytes)
    }

    /// Generate a fresh random key, base64-encoded.
    pub fn generate_key() -> StoreResult<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| StoreError::Crypto("failed to generate key".into()))?;
        Ok(BASE64.encode(key))
    }

    pub fn is_sealed(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|o| {
                o.len() == 2
                    && o.get(SEALED_FIELD).is_some_and(Value::is_string)
                    && o.get(KEY_FIELD).is_some_and(Value::is_string)
            })
    }

    /// Record key a sealed payload claims to belong to.
    pub fn sealed_key(value: &Value) -> Option<&str> {
        if !Self::is_sealed(value) {
            return None;
        }
        value.get(KEY_FIELD).and_then(Value::as_str)
    }

    pub fn seal(&self, collection: &str, key: &str, value: &Value) -> StoreResult<Value> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| StoreError::Crypto("failed to generate nonce".into()))?;

        let mut in_out = serde_json::to_vec(value)?;
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(associated(collection, key)),
                &mut in_out,
            )
            .map_err(|_| StoreError::Crypto("seal failed".into()))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + in_out.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&in_out);
        let mut sealed = serde_json::Map::with_capacity(2);
        sealed.insert(KEY_FIELD.to_string(), Value::String(key.to_string()));
        sealed.insert(SEALED_FIELD.to_string(), Value::String(BASE64.encode(framed)));
        Ok(Value::Object(sealed))
    }

    /// Open a sealed payload.  Values that are not sealed pass through.
    pub fn open(&self, collection: &str, key: &str, value: Value) -> StoreResult<Value> {
        if !Self::is_sealed(&value) {
            return Ok(value);
        }
        let encoded = value
            .get(SEALED_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let framed = BASE64
            .decode(encoded)
            .map_err(|e| StoreError::Crypto(format!("sealed payload is not base64: {e}")))?;
        if framed.len() < NONCE_LEN {
            return Err(StoreError::Crypto("sealed payload too short".into()));
        }

        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| StoreError::Crypto("bad nonce".into()))?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(associated(collection, key)), &mut in_out)
            .map_err(|_| {
                StoreError::Crypto("authentication failed: wrong key or corrupted data".into())
            })?;
        Ok(serde_json::from_slice(plaintext)?)
    }
}

fn associated(collection: &str, key: &str) -> Vec<u8> {
    format!("{collection}\u{1f}{key}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealer() -> Sealer {
        Sealer::from_base64(&Sealer::generate_key().unwrap()).unwrap()
    }

    #[test]
    fn seal_hides_and_open_restores() {
        let sealer = sealer();
        let doc = json!({"card": "4111-1111", "amount": 12});
        let sealed = sealer.seal("Payment", "p1", &doc).unwrap();

        assert!(Sealer::is_sealed(&sealed));
        assert_eq!(Sealer::sealed_key(&sealed), Some("p1"));
        assert!(!sealed.to_string().contains("4111"));
        assert_eq!(sealer.open("Payment", "p1", sealed).unwrap(), doc);
    }

    #[test]
    fn sealed_record_is_bound_to_its_key() {
        let sealer = sealer();
        let sealed = sealer.seal("Payment", "p1", &json!({"a": 1})).unwrap();
        assert!(matches!(
            sealer.open("Payment", "p2", sealed),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = sealer().seal("A", "1", &json!(true)).unwrap();
        assert!(sealer().open("A", "1", sealed).is_err());
    }

    #[test]
    fn plain_values_pass_through() {
        let value = json!({"plain": true});
        assert_eq!(sealer().open("A", "1", value.clone()).unwrap(), value);
    }

    #[test]
    fn rejects_short_keys() {
        assert!(Sealer::new(&[0u8; 16]).is_err());
        assert!(Sealer::from_base64("not base64!").is_err());
    }
}
