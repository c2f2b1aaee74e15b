//! Identity types shared across the delivery subsystem.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DeliveryError;

/// Identity of a chat user.
///
/// Matches the integer primary key of the users table. Zero is reserved as
/// "absent" on the wire and never names a real user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identity of a chat group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

macro_rules! impl_id {
    ($ty:ident, $what:literal) => {
        impl $ty {
            /// The raw integer value.
            pub fn get(self) -> i64 {
                self.0
            }

            /// Whether the id can name an entity (strictly positive).
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl From<i64> for $ty {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $ty {
            type Err = DeliveryError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                let value: i64 = trimmed.parse().map_err(|_| {
                    DeliveryError::invalid_message(format!("invalid {}: {:?}", $what, s))
                })?;
                let id = Self(value);
                if !id.is_valid() {
                    return Err(DeliveryError::invalid_message(format!(
                        "{} must be positive, got {}",
                        $what, value
                    )));
                }
                Ok(id)
            }
        }
    };
}

impl_id!(UserId, "user id");
impl_id!(GroupId, "group id");

/// Identifies one live connection.
///
/// A user may reconnect to the same process before the old socket is torn
/// down; the connection id tells the two sessions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_id() {
        assert_eq!("42".parse::<UserId>().unwrap(), UserId(42));
        assert_eq!(" 7 ".parse::<UserId>().unwrap(), UserId(7));
    }

    #[test]
    fn test_parse_rejects_zero_negative_and_garbage() {
        assert!("0".parse::<UserId>().is_err());
        assert!("-3".parse::<GroupId>().is_err());
        assert!("abc".parse::<UserId>().is_err());
        assert!("".parse::<UserId>().is_err());
    }

    #[test]
    fn test_display_is_bare_integer() {
        assert_eq!(UserId(12).to_string(), "12");
        assert_eq!(GroupId(3).to_string(), "3");
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
