//! Framing: length-prefix (4 bytes LE) + bincode payload, optionally sealed
//! with ChaCha20-Poly1305 once a session is verified.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// BLE notifications are small; anything bigger is a corrupt or hostile peer.
const MAX_FRAME_LEN: u32 = 4 * 1024;

/// Encode a message into a single clear frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    prefix(payload)
}

fn prefix(payload: Vec<u8>) -> Result<Vec<u8>, FrameEncodeError> {
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("seal failed: {0}")]
    Crypto(#[from] WireCryptoError),
}

/// Split the length prefix off the front of `bytes`. Returns the payload slice and bytes consumed.
fn unprefix(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Decode one clear frame from the front of `bytes`. Returns the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (payload, consumed) = unprefix(bytes)?;
    let msg: Message = bincode::deserialize(payload).map_err(FrameDecodeError::Decode)?;
    Ok((msg, consumed))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("open failed: {0}")]
    Crypto(#[from] WireCryptoError),
}

/// Outbound half of a verified link. Nonce is a per-direction counter; never reused.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Sealer {
    key: [u8; 32],
    counter: u64,
}

impl Sealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Encode and encrypt `msg` into one frame.
    pub fn seal(&mut self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        let payload = bincode::serialize(msg)?;
        let sealed = encrypt_wire(&self.key, self.counter, &payload)?;
        self.counter = self.counter.wrapping_add(1);
        prefix(sealed)
    }
}

/// Inbound half of a verified link. Frames must be opened in the order they were sealed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Opener {
    key: [u8; 32],
    counter: u64,
}

impl Opener {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Decrypt and decode one frame from the front of `bytes`.
    pub fn open(&mut self, bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
        let (sealed, consumed) = unprefix(bytes)?;
        let payload = decrypt_wire(&self.key, self.counter, sealed)?;
        self.counter = self.counter.wrapping_add(1);
        let msg: Message = bincode::deserialize(&payload)?;
        Ok((msg, consumed))
    }
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

/// Wire encryption: ChaCha20-Poly1305 with a 96-bit counter nonce.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_for(nonce);
    let nonce_arr = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_for(nonce);
    let nonce_arr = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventKind, RevokeReason};

    fn sample_event(seq: u32) -> Message {
        Message::ButtonEvent {
            seq,
            kind: EventKind::Click,
            queued: false,
            timestamp_ms: 1_000,
            device_time_ms: 1_000,
            press_count: seq,
        }
    }

    #[test]
    fn clear_frame_roundtrip() {
        let msg = Message::VerifyRejected {
            reason: RevokeReason::FactoryReset,
        };
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_event(1)).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn sealed_frames_open_in_order() {
        let key = [9u8; 32];
        let mut sealer = Sealer::new(key);
        let mut opener = Opener::new(key);
        let a = sealer.seal(&sample_event(1)).unwrap();
        let b = sealer.seal(&sample_event(2)).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (m1, n1) = opener.open(&buf).unwrap();
        let (m2, n2) = opener.open(&buf[n1..]).unwrap();
        assert_eq!(n1, a.len());
        assert_eq!(n2, b.len());
        assert_eq!(m1, sample_event(1));
        assert_eq!(m2, sample_event(2));
    }

    #[test]
    fn replayed_sealed_frame_fails() {
        let key = [3u8; 32];
        let mut sealer = Sealer::new(key);
        let mut opener = Opener::new(key);
        let frame = sealer.seal(&sample_event(1)).unwrap();
        opener.open(&frame).unwrap();
        assert!(matches!(
            opener.open(&frame),
            Err(FrameDecodeError::Crypto(WireCryptoError::Decrypt))
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let mut sealer = Sealer::new([1u8; 32]);
        let mut opener = Opener::new([2u8; 32]);
        let frame = sealer.seal(&Message::QueueDrained).unwrap();
        assert!(opener.open(&frame).is_err());
    }
}
