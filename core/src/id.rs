use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a content-addressable identifier (a SHA-1 digest).
pub const ID_LEN: usize = 20;

/// A 20-byte opaque content-addressable identifier.
///
/// Ids are value types, compared bytewise (`derive(Ord)` on a `[u8; 20]`
/// gives exactly that), and rendered in lowercase hex at external
/// boundaries.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Id([u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The 4-bit nibble at `level` (0-indexed), used to index a merkle
    /// trie slot. Level 0 is the high nibble of byte 0.
    pub fn nibble(&self, level: usize) -> u8 {
        let byte = self.0[level / 2];
        if level % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }
}

impl From<Id> for [u8; ID_LEN] {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != ID_LEN {
            anyhow::bail!("expected {} bytes for an id, got {}", ID_LEN, bytes.len());
        }
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl FromStr for Id {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN * 2 {
            anyhow::bail!("invalid id length {}, expected {}", s.len(), ID_LEN * 2);
        }
        let bytes = hex::decode(s)?;
        Self::try_from(&bytes[..])
    }
}

/// The five disjoint item categories a session reconciles.
///
/// Wire values match the `Done`/`Data`/`Delta` category byte in §6.2.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum ItemCategory {
    Revision = 1,
    File = 2,
    Cert = 3,
    Key = 4,
    Epoch = 5,
}

impl ItemCategory {
    /// The four categories a refiner independently reconciles. File
    /// content only ever rides along with a revision (§4.4) and is never
    /// itself the subject of a `Refine`/`Done` exchange.
    pub const REFINED: [ItemCategory; 4] = [
        ItemCategory::Epoch,
        ItemCategory::Key,
        ItemCategory::Cert,
        ItemCategory::Revision,
    ];
}

impl fmt::Display for ItemCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ItemCategory::Revision => "revision",
            ItemCategory::File => "file",
            ItemCategory::Cert => "cert",
            ItemCategory::Key => "key",
            ItemCategory::Epoch => "epoch",
        };
        write!(f, "{}", s)
    }
}

impl TryFrom<u8> for ItemCategory {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            1 => ItemCategory::Revision,
            2 => ItemCategory::File,
            3 => ItemCategory::Cert,
            4 => ItemCategory::Key,
            5 => ItemCategory::Epoch,
            other => anyhow::bail!("unknown item category byte {}", other),
        })
    }
}

impl From<ItemCategory> for u8 {
    fn from(cat: ItemCategory) -> Self {
        cat as u8
    }
}
