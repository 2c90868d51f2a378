//! Normalization of identifiers supplied by clients.
//!
//! Some clients send timestamp-like values where a session UUID is expected.
//! Those are mapped to a name-based UUID so that the same raw value always
//! resolves to the same row.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use uuid::{uuid, Uuid};

const CLIENT_ID_NAMESPACE: Uuid = uuid!("5b0f3c1e-6f0e-4d8a-9a51-7c2b8e3f9d14");

pub fn normalize_client_id(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Uuid::parse_str(trimmed) {
        Ok(id) => Some(id),
        Err(_) => Some(Uuid::new_v5(&CLIENT_ID_NAMESPACE, trimmed.as_bytes())),
    }
}

/// A UUID accepted from a JSON string or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ClientIdVisitor;

        impl<'de> Visitor<'de> for ClientIdVisitor {
            type Value = ClientId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a UUID, or a non-empty string or number identifier")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ClientId, E> {
                normalize_client_id(value)
                    .map(ClientId)
                    .ok_or_else(|| E::custom("identifier must not be empty"))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ClientId, E> {
                self.visit_str(&value.to_string())
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ClientId, E> {
                self.visit_str(&value.to_string())
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<ClientId, E> {
                if value.fract() == 0.0 && value.is_finite() {
                    self.visit_str(&format!("{}", value as i64))
                } else {
                    self.visit_str(&value.to_string())
                }
            }
        }

        deserializer.deserialize_any(ClientIdVisitor)
    }
}
