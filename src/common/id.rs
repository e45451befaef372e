//! Kademlia node Id or a lookup target, drawn from the SHA-256 digest space.
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// Kademlia node Id, lookup target, or the key of a stored chunk.
///
/// Ordering is the lexicographic order of the big-endian bytes, which is the
/// numeric order of the 256 bit value, so comparing two [Id::distance]
/// results compares the magnitude of the distances.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// The Id of a content-addressed chunk: the SHA-256 digest of its bytes.
    pub fn hash(bytes: &[u8]) -> Id {
        let digest: [u8; ID_SIZE] = Sha256::digest(bytes).into();

        Id(digest)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdError> {
        let bytes = bytes.as_ref();

        let array: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| InvalidIdError::InvalidIdSize(bytes.len()))?;

        Ok(Id(array))
    }

    /// XOR distance between this Id and a target Id.
    ///
    /// Symmetric, and zero only for equal Ids.
    pub fn distance(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Returns true if every bit is zero, i.e. a distance between equal Ids.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Returns a byte slice of this Id.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Lowercase hex encoding, the key format used by storage and the bulk channel.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = InvalidIdError;

    fn from_str(s: &str) -> Result<Id, InvalidIdError> {
        if s.len() != ID_SIZE * 2 {
            return Err(InvalidIdError::InvalidIdSize(s.len() / 2));
        }

        let bytes = hex::decode(s).map_err(|_| InvalidIdError::InvalidHex(s.to_string()))?;

        Id::from_bytes(bytes)
    }
}

impl TryFrom<String> for Id {
    type Error = InvalidIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.to_hex()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Errors parsing an [Id].
pub enum InvalidIdError {
    #[error("Invalid Id size, expected {ID_SIZE} bytes, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid Id hex encoding: {0}")]
    InvalidHex(String),
}
