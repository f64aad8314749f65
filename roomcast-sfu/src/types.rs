//! Identifier types shared by the registries and the signaling layer

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of one live signaling connection
    ConnectionId
);

string_id!(
    /// Room name, case-sensitive
    RoomName
);

string_id!(
    /// Engine-assigned routing context identifier
    RouterId
);

string_id!(
    /// Engine-assigned transport identifier
    TransportId
);

string_id!(
    /// Engine-assigned producer identifier
    ProducerId
);

string_id!(
    /// Engine-assigned consumer identifier
    ConsumerId
);

impl ConnectionId {
    /// Allocate a fresh identifier for a new connection
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_names_are_case_sensitive() {
        assert_ne!(RoomName::from("Lobby"), RoomName::from("lobby"));
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = ProducerId::from("p-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p-1\"");
        let back: ProducerId = serde_json::from_str("\"p-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_eq!(a.as_str().len(), 20);
        assert_ne!(a, b);
    }
}
