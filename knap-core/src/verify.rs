//! Verification engine: proves a freshly linked button holds this host's
//! pairing secret and is the paired serial, then derives session keys.
//!
//! One round trip:
//!
//! ```text
//! host   ── VerifyRequest  { host_nonce, host_public } ─────────────────────▶ button
//! host   ◀── VerifyResponse { device_nonce, device_public, serial, fw, tag } ── button
//! ```
//!
//! `tag` is HMAC-SHA256 under the pairing secret over both nonces, both
//! ephemeral keys, the address, the serial and the firmware revision. Session
//! keys come from HKDF-SHA256 over the X25519 shared secret and the pairing
//! secret, one key per direction.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::identity::{BdAddr, ButtonId, PairingRecord, PairingSecret, PublicKey};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::wire::{Opener, Sealer};

type HmacSha256 = Hmac<Sha256>;

const TRANSCRIPT_LABEL: &[u8] = b"knap-verify-v1";
const SESSION_INFO: &[u8] = b"knap-session-v1";

/// Keys for one verified link, already oriented for the side holding them.
pub struct SessionKeys {
    pub sealer: Sealer,
    pub opener: Opener,
}

/// Result of a successful verification on the host side.
pub struct Verified {
    pub keys: SessionKeys,
    pub firmware_revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("unsupported protocol version {0}")]
    ProtocolVersion(u8),
    #[error("unexpected message during verification")]
    UnexpectedMessage,
    #[error("device serial {got:?} does not match paired serial {expected:?}")]
    IdentityMismatch { expected: String, got: String },
    #[error("device could not prove the pairing secret")]
    SecretMismatch,
    #[error("malformed verification exchange: {0}")]
    Malformed(String),
}

/// Everything both sides bind into the tag.
struct Transcript<'a> {
    host_nonce: &'a [u8; 16],
    device_nonce: &'a [u8; 16],
    host_public: &'a PublicKey,
    device_public: &'a PublicKey,
    address: &'a BdAddr,
    serial_number: &'a str,
    firmware_revision: u32,
}

impl Transcript<'_> {
    fn mac(&self, secret: &PairingSecret) -> Result<HmacSha256, VerificationError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| VerificationError::SecretMismatch)?;
        mac.update(TRANSCRIPT_LABEL);
        mac.update(&[PROTOCOL_VERSION]);
        mac.update(self.host_nonce);
        mac.update(self.device_nonce);
        mac.update(self.host_public.as_bytes());
        mac.update(self.device_public.as_bytes());
        mac.update(self.address.as_bytes());
        mac.update(&(self.serial_number.len() as u32).to_le_bytes());
        mac.update(self.serial_number.as_bytes());
        mac.update(&self.firmware_revision.to_le_bytes());
        Ok(mac)
    }
}

/// Direction keys: (host → button, button → host).
fn derive_keys(
    shared: &[u8; 32],
    secret: &PairingSecret,
    host_nonce: &[u8; 16],
    device_nonce: &[u8; 16],
) -> Result<([u8; 32], [u8; 32]), VerificationError> {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(host_nonce);
    salt[16..].copy_from_slice(device_nonce);
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(shared);
    ikm[32..].copy_from_slice(secret.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 64];
    let expanded = hk.expand(SESSION_INFO, &mut okm);
    ikm.zeroize();
    expanded.map_err(|_| VerificationError::Malformed("key derivation failed".into()))?;

    let mut to_device = [0u8; 32];
    let mut to_host = [0u8; 32];
    to_device.copy_from_slice(&okm[..32]);
    to_host.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((to_device, to_host))
}

fn diffie_hellman(secret: &StaticSecret, other: &PublicKey) -> Result<[u8; 32], VerificationError> {
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*other.as_bytes()));
    if !shared.was_contributory() {
        return Err(VerificationError::Malformed(
            "non-contributory ephemeral key".into(),
        ));
    }
    Ok(shared.to_bytes())
}

fn fresh_ephemeral() -> (StaticSecret, PublicKey, [u8; 16]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes());
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    (secret, public, nonce)
}

/// Host side of one verification attempt. Consumed by [`Verifier::finish`];
/// dropping it on any path discards the ephemeral secret.
pub struct Verifier {
    button: ButtonId,
    address: BdAddr,
    expected_serial: String,
    pairing_secret: PairingSecret,
    secret: StaticSecret,
    host_public: PublicKey,
    host_nonce: [u8; 16],
}

impl Verifier {
    /// Begin verification. Returns the verifier and the request to send over the fresh link.
    pub fn start(pairing: &PairingRecord) -> (Self, Message) {
        let (secret, host_public, host_nonce) = fresh_ephemeral();
        let request = Message::VerifyRequest {
            protocol_version: PROTOCOL_VERSION,
            host_nonce,
            host_public: host_public.clone(),
        };
        let verifier = Self {
            button: pairing.identity.id,
            address: pairing.identity.address,
            expected_serial: pairing.identity.serial_number.clone(),
            pairing_secret: pairing.secret.clone(),
            secret,
            host_public,
            host_nonce,
        };
        (verifier, request)
    }

    pub fn button(&self) -> ButtonId {
        self.button
    }

    /// Check the button's response and derive session keys.
    pub fn finish(self, response: &Message) -> Result<Verified, VerificationError> {
        let Message::VerifyResponse {
            protocol_version,
            device_nonce,
            device_public,
            serial_number,
            firmware_revision,
            tag,
        } = response
        else {
            return Err(VerificationError::UnexpectedMessage);
        };
        if *protocol_version != PROTOCOL_VERSION {
            return Err(VerificationError::ProtocolVersion(*protocol_version));
        }

        let transcript = Transcript {
            host_nonce: &self.host_nonce,
            device_nonce,
            host_public: &self.host_public,
            device_public,
            address: &self.address,
            serial_number,
            firmware_revision: *firmware_revision,
        };
        transcript
            .mac(&self.pairing_secret)?
            .verify_slice(tag)
            .map_err(|_| VerificationError::SecretMismatch)?;
        if *serial_number != self.expected_serial {
            return Err(VerificationError::IdentityMismatch {
                expected: self.expected_serial.clone(),
                got: serial_number.clone(),
            });
        }

        let mut shared = diffie_hellman(&self.secret, device_public)?;
        let keys = derive_keys(&shared, &self.pairing_secret, &self.host_nonce, device_nonce);
        shared.zeroize();
        let (to_device, to_host) = keys?;
        Ok(Verified {
            keys: SessionKeys {
                sealer: Sealer::new(to_device),
                opener: Opener::new(to_host),
            },
            firmware_revision: *firmware_revision,
        })
    }
}

/// Verification work handed off the session's thread of control.
/// `epoch` ties the result to the link that produced the response.
pub struct VerifyJob {
    epoch: u64,
    verifier: Verifier,
    response: Message,
}

impl VerifyJob {
    pub(crate) fn new(epoch: u64, verifier: Verifier, response: Message) -> Self {
        Self {
            epoch,
            verifier,
            response,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn button(&self) -> ButtonId {
        self.verifier.button()
    }

    /// Run the checks. CPU-bound; callers run it on a blocking pool.
    pub fn run(self) -> Result<Verified, VerificationError> {
        self.verifier.finish(&self.response)
    }
}

impl std::fmt::Debug for VerifyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyJob")
            .field("epoch", &self.epoch)
            .field("button", &self.verifier.button)
            .finish_non_exhaustive()
    }
}

/// Button side of the exchange. Used by simulated and test peripherals.
pub struct Responder {
    pub address: BdAddr,
    pub serial_number: String,
    pub firmware_revision: u32,
    pub secret: PairingSecret,
}

impl Responder {
    /// Answer a `VerifyRequest`. Returns the response and the button's session keys.
    pub fn respond(&self, request: &Message) -> Result<(Message, SessionKeys), VerificationError> {
        let Message::VerifyRequest {
            protocol_version,
            host_nonce,
            host_public,
        } = request
        else {
            return Err(VerificationError::UnexpectedMessage);
        };
        if *protocol_version != PROTOCOL_VERSION {
            return Err(VerificationError::ProtocolVersion(*protocol_version));
        }
        let (secret, device_public, device_nonce) = fresh_ephemeral();
        let tag: [u8; 32] = Transcript {
            host_nonce,
            device_nonce: &device_nonce,
            host_public,
            device_public: &device_public,
            address: &self.address,
            serial_number: &self.serial_number,
            firmware_revision: self.firmware_revision,
        }
        .mac(&self.secret)?
        .finalize()
        .into_bytes()
        .into();

        let mut shared = diffie_hellman(&secret, host_public)?;
        let keys = derive_keys(&shared, &self.secret, host_nonce, &device_nonce);
        shared.zeroize();
        let (to_device, to_host) = keys?;
        let response = Message::VerifyResponse {
            protocol_version: PROTOCOL_VERSION,
            device_nonce,
            device_public,
            serial_number: self.serial_number.clone(),
            firmware_revision: self.firmware_revision,
            tag,
        };
        Ok((
            response,
            SessionKeys {
                sealer: Sealer::new(to_host),
                opener: Opener::new(to_device),
            },
        ))
    }
}
