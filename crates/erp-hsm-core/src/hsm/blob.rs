//! Blob types
//!
//! A blob is an opaque piece of key material (or a signed token) that is
//! stored outside the HSM but can only be used through it.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Kind of key material managed by the blob store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobType {
    /// Token the HSM requires on most operations
    TeeToken,
    /// Attestation key pair used to obtain TEE tokens
    AttestationKeyPair,
    /// Key derivation for task resources
    TaskKeyDerivation,
    /// Key derivation for communication resources
    CommunicationKeyDerivation,
    /// Key derivation for audit log entries
    AuditLogKeyDerivation,
    /// Key derivation for charge items
    ChargeItemKeyDerivation,
    /// Salt for hashing insurant numbers
    KvnrHashKey,
    /// Salt for hashing telematik ids
    TelematikIdHashKey,
    /// Signing key of the service
    VauSig,
    /// Key used to pseudonymize report data
    PseudonymKey,
}

impl BlobType {
    /// All blob types, in declaration order
    pub const ALL: [BlobType; 10] = [
        Self::TeeToken,
        Self::AttestationKeyPair,
        Self::TaskKeyDerivation,
        Self::CommunicationKeyDerivation,
        Self::AuditLogKeyDerivation,
        Self::ChargeItemKeyDerivation,
        Self::KvnrHashKey,
        Self::TelematikIdHashKey,
        Self::VauSig,
        Self::PseudonymKey,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeeToken => "tee_token",
            Self::AttestationKeyPair => "attestation_key_pair",
            Self::TaskKeyDerivation => "task_key_derivation",
            Self::CommunicationKeyDerivation => "communication_key_derivation",
            Self::AuditLogKeyDerivation => "audit_log_key_derivation",
            Self::ChargeItemKeyDerivation => "charge_item_key_derivation",
            Self::KvnrHashKey => "kvnr_hash_key",
            Self::TelematikIdHashKey => "telematik_id_hash_key",
            Self::VauSig => "vau_sig",
            Self::PseudonymKey => "pseudonym_key",
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BlobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown blob type: {}", s)))
    }
}

/// Store-assigned id, unique within one blob type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(pub u32);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open validity window `[not_before, not_after)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl Validity {
    /// Create a window; `not_after` must lie strictly after `not_before`
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Result<Self> {
        if not_after <= not_before {
            return Err(Error::InvalidInput(format!(
                "Empty validity window [{}, {})",
                not_before, not_after
            )));
        }
        Ok(Self {
            not_before,
            not_after,
        })
    }

    /// Window starting at `start` and lasting `length`
    pub fn starting_at(start: DateTime<Utc>, length: Duration) -> Result<Self> {
        Self::new(start, start + length)
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// `not_before <= at < not_after`
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at < self.not_after
    }
}

/// A blob as handed to the store; the id is assigned on insertion
#[derive(Debug, Clone)]
pub struct NewBlob {
    pub blob_type: BlobType,
    pub name: String,
    pub data: Vec<u8>,
    pub generation: u32,
    pub validity: Validity,
}

impl NewBlob {
    pub fn new(blob_type: BlobType, name: impl Into<String>, data: Vec<u8>, validity: Validity) -> Self {
        Self {
            blob_type,
            name: name.into(),
            data,
            generation: 0,
            validity,
        }
    }

    /// Set the HSM key generation the blob was created with
    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    pub(crate) fn into_entry(self, id: BlobId) -> BlobEntry {
        BlobEntry {
            blob_type: self.blob_type,
            id,
            name: self.name,
            data: self.data,
            generation: self.generation,
            validity: self.validity,
        }
    }
}

/// A stored blob
#[derive(Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub blob_type: BlobType,
    pub id: BlobId,
    pub name: String,
    pub data: Vec<u8>,
    pub generation: u32,
    pub validity: Validity,
}

impl BlobEntry {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.validity.contains(at)
    }

    /// Short hex digest of the data, for telling blobs apart without exposing them
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(&self.data)[..8])
    }
}

// Blob data is wrapped key material; keep it out of logs.
impl fmt::Debug for BlobEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobEntry")
            .field("blob_type", &self.blob_type)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("data", &format_args!("<{} bytes, {}>", self.data.len(), self.fingerprint()))
            .field("generation", &self.generation)
            .field("validity", &self.validity)
            .finish()
    }
}
