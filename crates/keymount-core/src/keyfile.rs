//! Filesystem keyfile handling.
//!
//! Keyfiles are OpenSSL-style envelopes: the literal tag `Salted__`, an
//! 8-byte salt, then ciphertext. Key and IV are derived from the login
//! password with the legacy single-iteration `EVP_BytesToKey` scheme, so
//! keyfiles produced with `openssl enc` keep working.

use crate::error::{MountError, MountResult};
use crate::volume::MAX_PAR;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use zeroize::{Zeroize, Zeroizing};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

const MAGIC: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;
const AES_BLOCK: usize = 16;

/// Digests accepted for keyfile key derivation, by OpenSSL name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyDigest {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl KeyDigest {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha1" => Some(Self::Sha1),
            "sha224" => Some(Self::Sha224),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn round(&self, prev: &[u8], password: &[u8], salt: &[u8]) -> Vec<u8> {
        fn one<D: Digest>(prev: &[u8], password: &[u8], salt: &[u8]) -> Vec<u8> {
            let mut hasher = D::new();
            hasher.update(prev);
            hasher.update(password);
            hasher.update(salt);
            hasher.finalize().to_vec()
        }

        match self {
            Self::Md5 => one::<Md5>(prev, password, salt),
            Self::Sha1 => one::<Sha1>(prev, password, salt),
            Self::Sha224 => one::<Sha224>(prev, password, salt),
            Self::Sha256 => one::<Sha256>(prev, password, salt),
            Self::Sha384 => one::<Sha384>(prev, password, salt),
            Self::Sha512 => one::<Sha512>(prev, password, salt),
        }
    }
}

/// Ciphers accepted for keyfile envelopes, by OpenSSL name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyCipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}

impl KeyCipher {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-cbc" => Some(Self::Aes128Cbc),
            "aes-192-cbc" => Some(Self::Aes192Cbc),
            "aes-256-cbc" => Some(Self::Aes256Cbc),
            _ => None,
        }
    }

    fn key_len(&self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc => 32,
        }
    }

    fn iv_len(&self) -> usize {
        AES_BLOCK
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> MountResult<Vec<u8>> {
        let unpad = |e: aes::cipher::block_padding::UnpadError| {
            MountError::KeyDecrypt(format!("bad padding: {e}"))
        };
        let badlen = |e: aes::cipher::InvalidLength| {
            MountError::KeyDecrypt(format!("bad key length: {e}"))
        };

        match self {
            Self::Aes128Cbc => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(badlen)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
            Self::Aes192Cbc => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
                .map_err(badlen)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
            Self::Aes256Cbc => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(badlen)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(unpad),
        }
    }
}

/// Derive key and IV from a password and salt, legacy OpenSSL style:
/// each round hashes `previous || password || salt`, with one iteration.
/// A zero-length password is legal.
fn bytes_to_key(
    digest: KeyDigest,
    password: &[u8],
    salt: &[u8],
    key_len: usize,
    iv_len: usize,
) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    let mut material = Zeroizing::new(Vec::with_capacity(key_len + iv_len));
    let mut prev: Vec<u8> = Vec::new();

    while material.len() < key_len + iv_len {
        let mut next = digest.round(&prev, password, salt);
        material.extend_from_slice(&next);
        next.zeroize();
        prev.zeroize();
        prev = material[material.len() - digest_output_len(digest)..].to_vec();
    }
    prev.zeroize();

    let key = Zeroizing::new(material[..key_len].to_vec());
    let iv = Zeroizing::new(material[key_len..key_len + iv_len].to_vec());
    (key, iv)
}

fn digest_output_len(digest: KeyDigest) -> usize {
    match digest {
        KeyDigest::Md5 => 16,
        KeyDigest::Sha1 => 20,
        KeyDigest::Sha224 => 28,
        KeyDigest::Sha256 => 32,
        KeyDigest::Sha384 => 48,
        KeyDigest::Sha512 => 64,
    }
}

/// Decrypt a salted keyfile into the raw filesystem key.
///
/// The caller owns the plaintext; the buffer zeroes itself on drop.
pub fn decrypt_keyfile(
    path: &str,
    digest_name: &str,
    cipher_name: &str,
    password: &[u8],
) -> MountResult<Zeroizing<Vec<u8>>> {
    let digest = KeyDigest::from_name(digest_name)
        .ok_or_else(|| MountError::DigestUnknown(digest_name.to_string()))?;
    let cipher = KeyCipher::from_name(cipher_name)
        .ok_or_else(|| MountError::CipherUnknown(cipher_name.to_string()))?;

    let blob = std::fs::read(path).map_err(|e| MountError::KeyIo(format!("{path}: {e}")))?;
    if blob.len() < MAGIC.len() + SALT_LEN {
        return Err(MountError::KeyIo(format!(
            "{path}: truncated keyfile ({} bytes)",
            blob.len()
        )));
    }
    if &blob[..MAGIC.len()] != MAGIC {
        return Err(MountError::KeyIo(format!("{path}: missing Salted__ tag")));
    }

    let salt = &blob[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let ciphertext = &blob[MAGIC.len() + SALT_LEN..];
    if ciphertext.len() > MAX_PAR + AES_BLOCK {
        return Err(MountError::KeyIo(format!(
            "{path}: keyfile payload of {} bytes exceeds the {} byte bound",
            ciphertext.len(),
            MAX_PAR + AES_BLOCK
        )));
    }

    let (key, iv) = bytes_to_key(digest, password, salt, cipher.key_len(), cipher.iv_len());
    cipher.decrypt(&key, &iv, ciphertext).map(Zeroizing::new)
}

/// Security verdict for a cipher or digest name.
///
/// Ordered: anything below [`SecurityLevel::Adequate`] deserves at least a
/// warning. Only `Blacklisted` and `Adequate` are currently produced; the
/// middle tiers are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    Blacklisted,
    Subpar,
    Unspec,
    Adequate,
}

const BLACKLIST: &[&str] = &["ecb", "rc2", "rc4", "des", "des3", "md2", "md4"];

/// Score a compound cipher/digest name (OpenSSL or cryptsetup spelling).
/// Any blacklisted token condemns the whole specification.
pub fn cipher_digest_security(spec: &str) -> SecurityLevel {
    for token in spec.split(['-', ',', '.', ':', '_']) {
        if BLACKLIST.contains(&token.to_ascii_lowercase().as_str()) {
            return SecurityLevel::Blacklisted;
        }
    }
    SecurityLevel::Adequate
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use std::io::Write;

    fn write_keyfile(salt: &[u8; 8], ciphertext: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MAGIC).unwrap();
        file.write_all(salt).unwrap();
        file.write_all(ciphertext).unwrap();
        file.flush().unwrap();
        file
    }

    fn seal(password: &[u8], salt: &[u8; 8], plaintext: &[u8]) -> Vec<u8> {
        let (key, iv) = bytes_to_key(KeyDigest::Md5, password, salt, 32, 16);
        cbc::Encryptor::<aes::Aes256>::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    #[test]
    fn decrypts_a_sealed_keyfile() {
        let salt = *b"\x01\x02\x03\x04\x05\x06\x07\x08";
        let fskey = b"0123456789abcdef0123456789abcdef";
        let file = write_keyfile(&salt, &seal(b"hunter2", &salt, fskey));

        let out = decrypt_keyfile(
            file.path().to_str().unwrap(),
            "md5",
            "aes-256-cbc",
            b"hunter2",
        )
        .unwrap();
        assert_eq!(&out[..], fskey);
    }

    #[test]
    fn empty_passphrase_is_legal() {
        let salt = *b"saltsalt";
        let fskey = b"shortkey";
        let file = write_keyfile(&salt, &seal(b"", &salt, fskey));

        let out =
            decrypt_keyfile(file.path().to_str().unwrap(), "md5", "aes-256-cbc", b"").unwrap();
        assert_eq!(&out[..], fskey);
    }

    #[test]
    fn wrong_password_fails_decrypt() {
        let salt = *b"saltsalt";
        let file = write_keyfile(&salt, &seal(b"right", &salt, b"fskey"));

        let err = decrypt_keyfile(
            file.path().to_str().unwrap(),
            "md5",
            "aes-256-cbc",
            b"wrong",
        )
        .unwrap_err();
        assert!(matches!(err, MountError::KeyDecrypt(_)), "{err:?}");
    }

    #[test]
    fn unknown_digest_and_cipher_are_distinct_errors() {
        let err = decrypt_keyfile("/nonexistent", "whirlpool2", "aes-256-cbc", b"x").unwrap_err();
        assert!(matches!(err, MountError::DigestUnknown(_)), "{err:?}");

        let err = decrypt_keyfile("/nonexistent", "md5", "rot13", b"x").unwrap_err();
        assert!(matches!(err, MountError::CipherUnknown(_)), "{err:?}");
    }

    #[test]
    fn short_keyfile_is_key_io() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Salted__1234").unwrap();
        let err = decrypt_keyfile(
            file.path().to_str().unwrap(),
            "md5",
            "aes-256-cbc",
            b"pw",
        )
        .unwrap_err();
        assert!(matches!(err, MountError::KeyIo(_)), "{err:?}");
    }

    #[test]
    fn missing_magic_is_key_io() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 48]).unwrap();
        let err = decrypt_keyfile(
            file.path().to_str().unwrap(),
            "md5",
            "aes-256-cbc",
            b"pw",
        )
        .unwrap_err();
        assert!(matches!(err, MountError::KeyIo(_)), "{err:?}");
    }

    #[test]
    fn oversized_payload_is_rejected_before_decryption() {
        let salt = *b"saltsalt";
        let file = write_keyfile(&salt, &vec![0u8; MAX_PAR + AES_BLOCK + 16]);
        let err = decrypt_keyfile(
            file.path().to_str().unwrap(),
            "md5",
            "aes-256-cbc",
            b"pw",
        )
        .unwrap_err();
        assert!(matches!(err, MountError::KeyIo(_)), "{err:?}");
    }

    #[test]
    fn derivation_is_deterministic_and_salt_sensitive() {
        let (k1, iv1) = bytes_to_key(KeyDigest::Sha256, b"pw", b"saltsalt", 32, 16);
        let (k2, iv2) = bytes_to_key(KeyDigest::Sha256, b"pw", b"saltsalt", 32, 16);
        let (k3, _) = bytes_to_key(KeyDigest::Sha256, b"pw", b"SALTSALT", 32, 16);
        assert_eq!(&k1[..], &k2[..]);
        assert_eq!(&iv1[..], &iv2[..]);
        assert_ne!(&k1[..], &k3[..]);
        assert_eq!(k1.len(), 32);
        assert_eq!(iv1.len(), 16);
    }

    #[test]
    fn blacklisted_tokens_condemn_the_spec() {
        assert_eq!(cipher_digest_security("aes-256-cbc"), SecurityLevel::Adequate);
        assert_eq!(cipher_digest_security("aes-ecb"), SecurityLevel::Blacklisted);
        assert_eq!(
            cipher_digest_security("md4-sha256"),
            SecurityLevel::Blacklisted
        );
        assert_eq!(
            cipher_digest_security("aes:xts:plain64"),
            SecurityLevel::Adequate
        );
        assert_eq!(cipher_digest_security("des_ede"), SecurityLevel::Blacklisted);
        assert_eq!(cipher_digest_security("DES-cbc"), SecurityLevel::Blacklisted);
    }

    #[test]
    fn verdicts_are_ordered() {
        assert!(SecurityLevel::Blacklisted < SecurityLevel::Subpar);
        assert!(SecurityLevel::Subpar < SecurityLevel::Unspec);
        assert!(SecurityLevel::Unspec < SecurityLevel::Adequate);
    }
}
