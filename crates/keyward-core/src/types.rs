//! Strong identifier types.
//!
//! All identifiers are 16-byte newtypes so a user id can never be passed
//! where a secret id is expected.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            /// Generate a new random identifier.
            pub fn generate() -> Self {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 16] = slice.try_into()?;
                Ok(Self(arr))
            }
        }
    };
}

define_id!(
    /// Identifier of a stored secret.
    SecretId
);

define_id!(
    /// Identifier of a user principal.
    UserId
);

define_id!(
    /// Identifier of a group principal.
    GroupId
);

define_id!(
    /// Identifier of a restricted-access request.
    RequestId
);

define_id!(
    /// Identifier of an approver list snapshot.
    ApproverListId
);

impl GroupId {
    /// The root administrative group. Its grants are never bulk-deleted.
    pub const ADMIN: Self = Self([0u8; 16]);

    /// Whether this is the root administrative group.
    pub fn is_admin(&self) -> bool {
        *self == Self::ADMIN
    }
}

impl UserId {
    /// Reserved "no user" sentinel written to the audit log.
    pub const NONE: Self = Self([0xff; 16]);
}

/// A principal: the unit of symmetric-key ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// A single user.
    User(UserId),
    /// A group of users.
    Group(GroupId),
}

impl Principal {
    /// The grant kind this principal owns.
    pub fn kind(&self) -> GrantKind {
        match self {
            Principal::User(_) => GrantKind::User,
            Principal::Group(_) => GrantKind::Group,
        }
    }

    /// The raw id bytes, regardless of kind.
    pub fn id_bytes(&self) -> &[u8; 16] {
        match self {
            Principal::User(id) => id.as_bytes(),
            Principal::Group(id) => id.as_bytes(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{}", id),
            Principal::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl From<UserId> for Principal {
    fn from(id: UserId) -> Self {
        Principal::User(id)
    }
}

impl From<GroupId> for Principal {
    fn from(id: GroupId) -> Self {
        Principal::Group(id)
    }
}

/// The two kinds of access grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GrantKind {
    /// Grant held directly by a user.
    User = 0,
    /// Grant held by a group and reached through membership.
    Group = 1,
}

impl GrantKind {
    /// Convert from the stored discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(GrantKind::User),
            1 => Some(GrantKind::Group),
            _ => None,
        }
    }
}

/// Level of access requested or granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessMode {
    /// Decrypt the payload.
    Read,
    /// Decrypt and re-seal the payload.
    Modify,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Modify => f.write_str("modify"),
        }
    }
}
