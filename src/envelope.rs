use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit of work carried through a stream entry's `"data"` field.
///
/// `id` is set once at construction and never mutated; `headers` is always
/// a concrete (possibly empty) map, never null, even across a JSON round
/// trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_headers_to_empty")]
    pub headers: HashMap<String, String>,
    pub body: String,
}

fn null_headers_to_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    /// Builds a fresh envelope around any serializable body. Generates a
    /// new v4 UUID and stamps the current UTC instant.
    pub fn new_from<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Envelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
            body: serde_json::to_string(body)?,
        })
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Overwrites any existing value for `key`.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_id_and_body() {
        let env = Envelope::new_from(&"hello").unwrap();
        let json = env.serialize().unwrap();
        let back = Envelope::parse(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn null_headers_coerce_to_empty_map() {
        let raw = format!(
            r#"{{"id":"{}","timestamp":"2024-01-01T00:00:00Z","headers":null,"body":"x"}}"#,
            Uuid::new_v4()
        );
        let env = Envelope::parse(&raw).unwrap();
        assert!(env.headers.is_empty());
    }

    #[test]
    fn set_header_overwrites() {
        let mut env = Envelope::new_from(&"x").unwrap();
        env.set_header("a", "1");
        env.set_header("a", "2");
        assert_eq!(env.headers.get("a"), Some(&"2".to_string()));
    }

    #[test]
    fn decode_body_round_trips_typed_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payment {
            amount: u64,
        }
        let env = Envelope::new_from(&Payment { amount: 42 }).unwrap();
        let decoded: Payment = env.decode_body().unwrap();
        assert_eq!(decoded, Payment { amount: 42 });
    }
}
