// Packet decryption strategies.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BridgeError;
use crate::media::{EncryptedPacket, KeyEpoch};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),

    #[error("Ciphertext length {0} is not a multiple of the block size")]
    NotBlockAligned(usize),

    #[error("Invalid key or IV length")]
    InvalidKeyLength,

    #[error("Invalid padding, wrong key or corrupt packet")]
    BadPadding,
}

impl From<CipherError> for BridgeError {
    fn from(err: CipherError) -> Self {
        BridgeError::DecodeValidation(err.to_string())
    }
}

/// Turns an encrypted packet into container bytes under a key epoch
pub trait PacketCipher: Send + Sync {
    fn decrypt(&self, epoch: &KeyEpoch, packet: &EncryptedPacket) -> Result<Bytes, CipherError>;

    fn name(&self) -> &'static str;
}

/// Which [`PacketCipher`] a channel uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    /// AES-128-CBC, first 16 bytes of every packet are the IV
    #[default]
    PrefixedIv,
    /// AES-128-CBC, IV from the key tag or the media sequence number
    SequenceIv,
    Plaintext,
}

impl CipherKind {
    pub fn build(self) -> Box<dyn PacketCipher> {
        match self {
            CipherKind::PrefixedIv => Box::new(PrefixedIvAes128Cbc),
            CipherKind::SequenceIv => Box::new(SequenceIvAes128Cbc),
            CipherKind::Plaintext => Box::new(Plaintext),
        }
    }
}

fn decrypt_cbc(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Bytes, CipherError> {
    if ciphertext.is_empty() {
        return Err(CipherError::TooShort(0));
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::NotBlockAligned(ciphertext.len()));
    }

    let mut buffer = ciphertext.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength)?;
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| CipherError::BadPadding)?
        .len();
    buffer.truncate(len);
    Ok(Bytes::from(buffer))
}

pub struct PrefixedIvAes128Cbc;

impl PacketCipher for PrefixedIvAes128Cbc {
    fn decrypt(&self, epoch: &KeyEpoch, packet: &EncryptedPacket) -> Result<Bytes, CipherError> {
        let data = &packet.data;
        if data.len() <= BLOCK_SIZE {
            return Err(CipherError::TooShort(data.len()));
        }
        let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
        let mut iv_bytes = [0u8; BLOCK_SIZE];
        iv_bytes.copy_from_slice(iv);
        decrypt_cbc(&epoch.key, &iv_bytes, ciphertext)
    }

    fn name(&self) -> &'static str {
        "aes-128-cbc/prefixed-iv"
    }
}

pub struct SequenceIvAes128Cbc;

impl SequenceIvAes128Cbc {
    /// HLS default IV: the media sequence number as a big endian 128-bit value
    pub fn sequence_iv(sequence: u64) -> [u8; 16] {
        u128::from(sequence).to_be_bytes()
    }
}

impl PacketCipher for SequenceIvAes128Cbc {
    fn decrypt(&self, epoch: &KeyEpoch, packet: &EncryptedPacket) -> Result<Bytes, CipherError> {
        let iv = epoch
            .iv
            .unwrap_or_else(|| Self::sequence_iv(packet.sequence));
        decrypt_cbc(&epoch.key, &iv, &packet.data)
    }

    fn name(&self) -> &'static str {
        "aes-128-cbc/sequence-iv"
    }
}

pub struct Plaintext;

impl PacketCipher for Plaintext {
    fn decrypt(&self, _epoch: &KeyEpoch, packet: &EncryptedPacket) -> Result<Bytes, CipherError> {
        Ok(packet.data.clone())
    }

    fn name(&self) -> &'static str {
        "plaintext"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{PACKET_KEY, encrypt_prefixed};

    fn packet(data: Bytes, sequence: u64) -> EncryptedPacket {
        EncryptedPacket {
            data,
            sequence,
            epoch_id: 1,
            epoch_change: None,
        }
    }

    #[test]
    fn test_prefixed_iv() {
        let epoch = KeyEpoch::new(1, PACKET_KEY, None);
        let data = encrypt_prefixed(&PACKET_KEY, [3u8; 16], b"G some transport bytes");
        let plain = PrefixedIvAes128Cbc.decrypt(&epoch, &packet(data, 0)).unwrap();
        assert_eq!(&plain[..], b"G some transport bytes");
    }

    #[test]
    fn test_sequence_iv() {
        let epoch = KeyEpoch::new(1, PACKET_KEY, None);
        let iv = SequenceIvAes128Cbc::sequence_iv(0x0102);
        assert_eq!(iv[14..], [0x01, 0x02]);
        assert!(iv[..14].iter().all(|b| *b == 0));

        // Strip the prefix to get plain HLS ciphertext
        let data = encrypt_prefixed(&PACKET_KEY, iv, b"hls segment").slice(16..);
        let plain = SequenceIvAes128Cbc.decrypt(&epoch, &packet(data.clone(), 0x0102)).unwrap();
        assert_eq!(&plain[..], b"hls segment");

        // An explicit IV on the epoch wins over the sequence number
        let explicit = KeyEpoch::new(2, PACKET_KEY, Some(iv));
        let plain = SequenceIvAes128Cbc.decrypt(&explicit, &packet(data, 7)).unwrap();
        assert_eq!(&plain[..], b"hls segment");
    }

    #[test]
    fn test_wrong_key_and_bad_sizes() {
        let data = encrypt_prefixed(&PACKET_KEY, [0u8; 16], &[0x47; 188]);
        let wrong = KeyEpoch::new(1, [0x11; 16], None);
        // A wrong key leaves random padding behind, or at best garbage
        let result = PrefixedIvAes128Cbc.decrypt(&wrong, &packet(data, 0));
        assert!(result.map_or(true, |plain| plain[..] != [0x47; 188][..]));

        let epoch = KeyEpoch::new(1, PACKET_KEY, None);
        assert_eq!(
            PrefixedIvAes128Cbc.decrypt(&epoch, &packet(Bytes::from_static(&[0; 16]), 0)),
            Err(CipherError::TooShort(16))
        );
        assert_eq!(
            PrefixedIvAes128Cbc.decrypt(&epoch, &packet(Bytes::from(vec![0; 20]), 0)),
            Err(CipherError::NotBlockAligned(4))
        );
    }

    #[test]
    fn test_plaintext_passthrough() {
        let epoch = KeyEpoch::new(1, [0; 16], None);
        let plain = CipherKind::Plaintext
            .build()
            .decrypt(&epoch, &packet(Bytes::from_static(b"abc"), 0))
            .unwrap();
        assert_eq!(&plain[..], b"abc");
        assert_eq!(CipherKind::default(), CipherKind::PrefixedIv);
    }
}
