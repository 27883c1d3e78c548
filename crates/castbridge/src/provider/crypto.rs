use std::sync::LazyLock;

use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use md5::{Digest, Md5};
use regex::Regex;
use sha2::Sha256;

use crate::BridgeError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.+?)\?token=([a-f0-9_]+)").expect("valid token pattern"));

const SESSION_KEY_LEN: usize = 16;

/// A full block of PKCS#7 padding, appended by the login protocol in hex
const AUTH_PADDING: &str = "10101010101010101010101010101010";

/// Derive the login key from the account password and the server salt
pub(crate) fn derive_session_key(
    password: &str,
    salt_hex: &str,
    iterations: u32,
) -> Result<[u8; SESSION_KEY_LEN], BridgeError> {
    let password_hash = hex::encode(Md5::digest(password.as_bytes()));
    let password_bytes = hex::decode(password_hash)
        .map_err(|e| BridgeError::Auth(format!("Password digest is not hex: {e}")))?;
    let salt = hex::decode(salt_hex)
        .map_err(|e| BridgeError::Auth(format!("Login salt is not hex: {e}")))?;

    let mut key = [0u8; SESSION_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(&password_bytes, &salt, iterations, &mut key);
    Ok(key)
}

/// Answer to the login challenge, tied to the fixed player identity
pub(crate) fn challenge_proof(
    hardware_id: &str,
    ethernet_mac: &str,
    challenge: &str,
) -> Result<String, BridgeError> {
    let identity = hex::decode(format!("{hardware_id}{ethernet_mac}{challenge}"))
        .map_err(|e| BridgeError::Auth(format!("Login challenge is not hex: {e}")))?;
    let digest = hex::encode(Sha256::digest(&identity));
    Ok(format!("{challenge}{}", &digest[..32]))
}

/// Encrypt the challenge proof with the login key
pub(crate) fn encrypt_auth_blob(
    key: &[u8; SESSION_KEY_LEN],
    proof_hex: &str,
) -> Result<Vec<u8>, BridgeError> {
    let plaintext = hex::decode(format!("{proof_hex}{AUTH_PADDING}"))
        .map_err(|e| BridgeError::Auth(format!("Challenge proof is not hex: {e}")))?;
    aes_cbc_encrypt_blocks(key, &plaintext)
}

/// Decrypt the hex `tokenData` of a stream token response
pub(crate) fn decrypt_token_data(key: &[u8], token_hex: &str) -> Result<Vec<u8>, BridgeError> {
    let ciphertext = hex::decode(token_hex.trim())
        .map_err(|e| BridgeError::Transport(format!("Token data is not hex: {e}")))?;
    aes_cbc_decrypt_blocks(key, &ciphertext)
}

/// Pull the stream base URL and token out of decrypted token data.
///
/// The payload carries a little endian string length at offset 4 followed
/// by `<url>?token=<token>`.
pub(crate) fn parse_token_payload(data: &[u8]) -> Result<(String, String), BridgeError> {
    if data.len() < 6 {
        return Err(BridgeError::Transport(format!(
            "Token payload too short: {} bytes",
            data.len()
        )));
    }
    let len = u16::from_le_bytes([data[4], data[5]]) as usize;
    let text = data
        .get(6..6 + len)
        .ok_or_else(|| BridgeError::Transport(format!("Token length {len} exceeds payload")))?;
    let text = std::str::from_utf8(text)
        .map_err(|e| BridgeError::Transport(format!("Token is not UTF-8: {e}")))?;

    let captures = TOKEN_RE
        .captures(text)
        .ok_or_else(|| BridgeError::Transport("Token payload has no stream URL".to_string()))?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

/// AES-128-CBC with a zero IV over whole blocks
pub(crate) fn aes_cbc_encrypt_blocks(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let cipher = Aes128CbcEnc::new_from_slices(key, &[0u8; 16])
        .map_err(|e| BridgeError::Auth(format!("Failed to initialize AES encryptor: {e}")))?;
    let mut buffer = plaintext.to_vec();
    let len = cipher
        .encrypt_padded_mut::<NoPadding>(&mut buffer, plaintext.len())
        .map_err(|e| BridgeError::Auth(format!("Plaintext is not block aligned: {e}")))?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}

/// Inverse of [`aes_cbc_encrypt_blocks`]
pub(crate) fn aes_cbc_decrypt_blocks(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let cipher = Aes128CbcDec::new_from_slices(key, &[0u8; 16])
        .map_err(|e| BridgeError::Transport(format!("Failed to initialize AES decryptor: {e}")))?;
    let mut buffer = ciphertext.to_vec();
    let len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| BridgeError::Transport(format!("Ciphertext is not block aligned: {e}")))?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}
