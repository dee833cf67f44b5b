//! 会话加密 / Per-session payload crypto.
//!
//! 握手用 X25519 ECDH；载荷用 AES-128-CBC + PKCS#7，以 base64 形式上线。
//! Handshake is X25519 ECDH; payloads travel as base64(AES-128-CBC-PKCS7).
//! `aesKey` 为 md5(base64(共享密钥)) 的前16个十六进制字符，`aesIV` 为16位随机串。

use aes::cipher::{block_padding::Pkcs7, BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("client key is not valid base64")]
    ClientKeyBase64,
    #[error("client key must be 32 bytes, got {0}")]
    ClientKeyLength(usize),
    #[error("invalid aes key/iv length")]
    KeyIvLength,
    #[error("payload is not valid base64")]
    PayloadBase64,
    #[error("bad pkcs7 padding")]
    Padding,
}

/// 生成服务端 X25519 密钥对 / Generate the server-side X25519 keypair.
pub fn dh_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// 由客户端公钥推导会话参数，返回 (aesKey, aesIV)
/// Derive session parameters from the client's public key.
pub fn session_params(
    client_key_b64: &str,
    server_secret: &StaticSecret,
) -> Result<(String, String), CryptoError> {
    let raw = B64
        .decode(client_key_b64.trim())
        .map_err(|_| CryptoError::ClientKeyBase64)?;
    if raw.len() < 32 {
        return Err(CryptoError::ClientKeyLength(raw.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw[..32]);
    let shared = server_secret.diffie_hellman(&PublicKey::from(key));
    let aes_key = md5_hex(B64.encode(shared.as_bytes()).as_bytes())[..16].to_string();
    let aes_iv = random_alnum(16);
    Ok((aes_key, aes_iv))
}

/// md5 十六进制摘要 / md5 hex digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 随机字母数字串 / Random alphanumeric string.
pub fn random_alnum(n: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// AES-CBC-PKCS7 加密并 base64 / Encrypt then base64.
pub fn aes_encrypt_b64(plain: &[u8], key: &str, iv: &str) -> Result<String, CryptoError> {
    let enc = Aes128CbcEnc::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|_| CryptoError::KeyIvLength)?;
    Ok(B64.encode(enc.encrypt_padded_vec::<Pkcs7>(plain)))
}

/// base64 解码并 AES-CBC-PKCS7 解密 / Decode base64 then decrypt.
pub fn aes_decrypt_b64(payload_b64: &str, key: &str, iv: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = B64
        .decode(payload_b64.trim())
        .map_err(|_| CryptoError::PayloadBase64)?;
    let dec = Aes128CbcDec::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|_| CryptoError::KeyIvLength)?;
    dec.decrypt_padded_vec::<Pkcs7>(&raw)
        .map_err(|_| CryptoError::Padding)
}

/// 计算校验串的 msgKey / Compute the msgKey digest for a verity string.
pub fn msg_key(verity: &str, key: &str, iv: &str) -> Result<String, CryptoError> {
    Ok(md5_hex(aes_encrypt_b64(verity.as_bytes(), key, iv)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as B64;

    #[test]
    fn ecdh_both_sides_agree() {
        let (server_secret, server_public) = dh_keypair();
        let (client_secret, client_public) = dh_keypair();

        let client_key_b64 = B64.encode(client_public.as_bytes());
        let (aes_key, aes_iv) = session_params(&client_key_b64, &server_secret).expect("derive");
        assert_eq!(aes_key.len(), 16);
        assert_eq!(aes_iv.len(), 16);

        // 客户端以同样方式推导 / client derives the same key from the server public
        let shared = client_secret.diffie_hellman(&server_public);
        let client_side = md5_hex(B64.encode(shared.as_bytes()).as_bytes())[..16].to_string();
        assert_eq!(aes_key, client_side);
    }

    #[test]
    fn rejects_bad_client_keys() {
        let (secret, _) = dh_keypair();
        assert!(matches!(
            session_params("!!!", &secret),
            Err(CryptoError::ClientKeyBase64)
        ));
        let short = B64.encode([1u8; 8]);
        assert!(matches!(
            session_params(&short, &secret),
            Err(CryptoError::ClientKeyLength(8))
        ));
    }

    #[test]
    fn payload_round_trip() {
        let key = "0123456789abcdef";
        let iv = "fedcba9876543210";
        let cipher = aes_encrypt_b64("你好 hello".as_bytes(), key, iv).expect("encrypt");
        let plain = aes_decrypt_b64(&cipher, key, iv).expect("decrypt");
        assert_eq!(plain, "你好 hello".as_bytes());
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let cipher =
            aes_encrypt_b64(b"secret", "0123456789abcdef", "fedcba9876543210").expect("encrypt");
        // 错误密钥要么填充失败要么得到乱码 / wrong key: padding error or garbage
        match aes_decrypt_b64(&cipher, "ffffffffffffffff", "fedcba9876543210") {
            Ok(plain) => assert_ne!(plain, b"secret"),
            Err(e) => assert!(matches!(e, CryptoError::Padding)),
        }
    }

    #[test]
    fn msg_key_is_stable() {
        let key = "0123456789abcdef";
        let iv = "fedcba9876543210";
        let a = msg_key("1|no|ch|2|alice|payload", key, iv).expect("msg key");
        let b = msg_key("1|no|ch|2|alice|payload", key, iv).expect("msg key");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let c = msg_key("2|no|ch|2|alice|payload", key, iv).expect("msg key");
        assert_ne!(a, c);
    }
}
