//! Public keys granting SSH access to job environments

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{require_non_empty, ExtraFields, Record};
use crate::{Error, Result};

const KEY_ALGORITHMS: &[&str] = &[
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Public key record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: Uuid,

    pub created: DateTime<Utc>,

    pub name: String,

    /// OpenSSH formatted public key
    pub public_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicKeyRequest {
    pub name: String,
    pub public_key: String,
}

impl PublicKey {
    pub fn from_request(request: PublicKeyRequest) -> Result<Self> {
        let key = Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            name: request.name,
            public_key: request.public_key.trim().to_string(),
            deleted: None,
            extra: ExtraFields::new(),
        };
        key.validate()?;
        Ok(key)
    }
}

/// Check `<algorithm> <base64 blob>[ comment]`.
///
/// The blob must decode and start with the same algorithm name the line
/// declares.
pub fn validate_openssh_key(key: &str) -> Result<()> {
    let mut parts = key.split_whitespace();
    let (Some(algorithm), Some(blob)) = (parts.next(), parts.next()) else {
        return Err(Error::validation("public_key is not an OpenSSH public key"));
    };

    if !KEY_ALGORITHMS.contains(&algorithm) {
        return Err(Error::validation(format!(
            "public_key has unsupported key type: {}",
            algorithm
        )));
    }

    let decoded = BASE64
        .decode(blob)
        .map_err(|_| Error::validation("public_key data is not valid base64"))?;

    // wire format: u32 length then the algorithm name
    let embedded = decoded
        .get(..4)
        .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
        .and_then(|len| decoded.get(4..4 + len));

    if embedded != Some(algorithm.as_bytes()) {
        return Err(Error::validation(
            "public_key data does not match its key type",
        ));
    }

    Ok(())
}

impl Record for PublicKey {
    const KIND: &'static str = "public key";
    const COLLECTION: &'static str = "public_keys";
    const PATCHABLE: &'static [&'static str] = &[];

    fn id(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn deleted(&self) -> Option<DateTime<Utc>> {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: Option<DateTime<Utc>>) {
        self.deleted = deleted;
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        validate_openssh_key(&self.public_key)
    }
}
