//! Principal identifiers and ledger account ids.
//!
//! The text codec (CRC32-prefixed base32 in dash-separated groups, e.g.
//! `rrkah-fqaaa-aaaaa-aaaaq-cai`) comes from `ic-principal`; this module adds
//! the text-only serde form and account id derivation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha224};

use crate::error::PrincipalError;

const ACCOUNT_DOMAIN_SEPARATOR: &[u8] = b"\x0Aaccount-id";

/// An opaque, stable identifier of a party (user, wallet or service).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(ic_principal::Principal);

impl Principal {
    pub const MAX_LENGTH: usize = 29;

    /// The principal used for unauthenticated calls (`2vxsx-fae`).
    pub fn anonymous() -> Self {
        Self(ic_principal::Principal::anonymous())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PrincipalError> {
        Ok(Self(ic_principal::Principal::try_from_slice(bytes)?))
    }

    /// Parse the canonical text form. Uppercase input is accepted.
    pub fn from_text(text: &str) -> Result<Self, PrincipalError> {
        Ok(Self(ic_principal::Principal::from_text(text.trim())?))
    }

    pub fn to_text(&self) -> String {
        self.0.to_text()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ic_principal::Principal::anonymous()
    }

    /// Ledger account id of this principal's default (all-zero) subaccount.
    pub fn account_id(&self) -> AccountId {
        AccountId::new(self, &[0u8; 32])
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Principal({})", self.to_text())
    }
}

impl FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_text(&text).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte ledger account identifier: CRC32 (big-endian) of a SHA-224 hash,
/// followed by that hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId([u8; 32]);

impl AccountId {
    pub fn new(owner: &Principal, subaccount: &[u8; 32]) -> Self {
        let mut hasher = Sha224::new();
        hasher.update(ACCOUNT_DOMAIN_SEPARATOR);
        hasher.update(owner.as_slice());
        hasher.update(subaccount);
        let hash = hasher.finalize();

        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&crc32fast::hash(&hash).to_be_bytes());
        bytes[4..].copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.to_hex())
    }
}
