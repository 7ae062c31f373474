use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use md5::{Digest, Md5};

/// Value stored in `encryption_type` and echoed in
/// `x-amz-server-side-encryption`. Doubles as the sealed-format version tag.
pub const SSE_AES256: &str = "AES256";

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("SSE_MASTER_KEY must be 64 hex characters (32 bytes)")]
    InvalidMasterKey,
    #[error("Encryption failed")]
    Seal,
    #[error("Decryption failed: ciphertext corrupt or wrong key")]
    Open,
}

/// Process-wide SSE master key, loaded once at startup and read-only after.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"REDACTED").finish()
    }
}

impl MasterKey {
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidMasterKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidMasterKey)?;
        Ok(MasterKey(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Seals plaintext as `nonce(12) ‖ ciphertext ‖ tag` with a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// The S3 multipart convention: MD5 over the concatenated binary part
/// digests, suffixed with the part count.
pub fn multipart_etag(part_etags: &[String]) -> Result<String, hex::FromHexError> {
    let mut hasher = Md5::new();
    for etag in part_etags {
        hasher.update(hex::decode(etag.trim_matches('"'))?);
    }
    Ok(format!("{}-{}", hex::encode(hasher.finalize()), part_etags.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn rejects_short_master_keys() {
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_hex("not-hex").is_err());
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = test_key();
        let sealed = key.seal(b"payload bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"payload bytes");
        assert_eq!(key.open(&sealed).unwrap(), b"payload bytes");
    }

    #[test]
    fn open_rejects_tampering() {
        let key = test_key();
        let mut sealed = key.seal(b"payload bytes").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(key.open(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn open_rejects_the_wrong_key() {
        let sealed = test_key().seal(b"payload").unwrap();
        let other = MasterKey::from_hex(&"cd".repeat(32)).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn multipart_etag_is_md5_of_md5s() {
        let e1 = md5_hex(&vec![0u8; 1024]);
        let e2 = md5_hex(b"ones");
        let combined = multipart_etag(&[e1.clone(), e2.clone()]).unwrap();
        assert!(combined.ends_with("-2"));

        let mut hasher = Md5::new();
        hasher.update(hex::decode(&e1).unwrap());
        hasher.update(hex::decode(&e2).unwrap());
        assert_eq!(combined, format!("{}-2", hex::encode(hasher.finalize())));
    }
}
