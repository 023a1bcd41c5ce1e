//! Button identity: stable identifiers, link-layer address, pairing record.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Stable identifier of one pairing on this host. Unique across re-pairings of the same button.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ButtonId(Uuid);

impl ButtonId {
    /// Fresh identifier for a newly created pairing.
    pub fn generate() -> Self {
        ButtonId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        ButtonId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Link-layer (Bluetooth device) address. Rendered as `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        BdAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({self})")
    }
}

impl FromStr for BdAddr {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(AddressParseError::TooShort)?;
            if part.len() != 2 {
                return Err(AddressParseError::BadOctet(part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::BadOctet(part.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError::TooLong);
        }
        Ok(BdAddr(out))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address has fewer than 6 octets")]
    TooShort,
    #[error("address has more than 6 octets")]
    TooLong,
    #[error("invalid octet {0:?}")]
    BadOctet(String),
}

/// X25519 public key (32 bytes). Serializable for the verification exchange.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

pub(crate) mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Secret exchanged when the button was paired with this host. Never leaves the host.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PairingSecret([u8; 32]);

impl PairingSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        PairingSecret(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PairingSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairingSecret(..)")
    }
}

/// Everything the host knows about a paired button.
///
/// `nickname` is the only user-editable field; `firmware_revision` is refreshed
/// from the device after every successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonIdentity {
    pub id: ButtonId,
    /// Cross-ecosystem identifier, identical for this button on every host.
    pub uuid: String,
    pub address: BdAddr,
    /// Advertisement name.
    pub name: Option<String>,
    pub nickname: Option<String>,
    /// Printed inside the battery hatch. Cosmetic only.
    pub serial_number: String,
    pub firmware_revision: u32,
}

/// Identity plus the pairing secret; handed to the registry by whatever persists pairings.
#[derive(Debug, Clone)]
pub struct PairingRecord {
    pub identity: ButtonIdentity,
    pub secret: PairingSecret,
}

impl PairingRecord {
    pub fn new(identity: ButtonIdentity, secret: PairingSecret) -> Self {
        Self { identity, secret }
    }
}
