//! Stable identifiers.
//!
//! BigInt keys are serialized as decimal strings at API/event boundaries.
//! [`BigId`] wraps a monotonic `i64` primary key and always serializes as a
//! JSON string, while still accepting a bare JSON number on deserialization
//! so older event payloads keep working.

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! opaque_string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

/// A fiche's id in the CRM, e.g. `"00123456"`. Opaque: never parsed as a
/// number, never reformatted.
opaque_string_id!(FicheId);

/// A schedule's id, assigned by the admin surface (out of scope, interface
/// only).
opaque_string_id!(ScheduleId);

/// An audit configuration's id. Opaque at this layer even though the
/// underlying table uses a numeric primary key, because callers only ever
/// compare/dedupe it, never arithmetic on it.
opaque_string_id!(AuditConfigId);

/// A monotonic, database-assigned primary key that crosses the workflow
/// boundary as a decimal string: large-integer ids are serialized as
/// strings so JSON consumers never round-trip them through a float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BigId(pub i64);

impl BigId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BigId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl Serialize for BigId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for BigId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse::<i64>().map(BigId).map_err(DeError::custom),
            Repr::Num(n) => Ok(BigId(n)),
        }
    }
}

/// `Run.id`.
pub type RunId = BigId;
/// `FicheCache` row id (distinct from the CRM-assigned [`FicheId`]).
pub type FicheCacheId = BigId;
/// `Audit.id`.
pub type AuditId = BigId;
/// `Recording` row id.
pub type RecordingId = BigId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_id_round_trips_through_json_as_string() {
        let id = BigId(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"42\"");
        let back: BigId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn big_id_accepts_bare_number_for_legacy_payloads() {
        let back: BigId = serde_json::from_str("42").unwrap();
        assert_eq!(back, BigId(42));
    }

    #[test]
    fn fiche_id_is_never_reformatted() {
        let id = FicheId::from("00123456");
        assert_eq!(id.as_str(), "00123456");
    }
}
