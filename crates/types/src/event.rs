use alloy_primitives::{Address, Bytes, B256};
use serde::{de, Deserialize, Serialize};

/// An event delivered through the mailbox (spec.md §3 "Event").
///
/// Every variant carries `id`, equal to the mailbox offset it was inserted
/// at. The wire discriminator is structural (spec.md §6): `DataEvent` has
/// `data`/`topics`, `ExecuteEvent` has `output`, `DeployEvent` has neither,
/// `ErrorEvent` has `errorCode`. [`Event::serialize`] is written by hand to
/// preserve exactly that shape instead of adding an explicit tag field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data {
        id: u64,
        data: Bytes,
        topics: Vec<B256>,
    },
    Deploy {
        id: u64,
        address: Address,
    },
    Execute {
        id: u64,
        address: Address,
        output: Bytes,
    },
    Error {
        id: u64,
        error_code: i64,
        description: String,
    },
}

impl Event {
    pub fn id(&self) -> u64 {
        match self {
            Self::Data { id, .. }
            | Self::Deploy { id, .. }
            | Self::Execute { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// Returns the event with its `id` rewritten to `new_id`. The mailbox
    /// uses this to stamp the assigned offset onto an event built before
    /// the offset was known.
    pub fn with_id(self, new_id: u64) -> Self {
        match self {
            Self::Data { data, topics, .. } => Self::Data {
                id: new_id,
                data,
                topics,
            },
            Self::Deploy { address, .. } => Self::Deploy {
                id: new_id,
                address,
            },
            Self::Execute {
                address, output, ..
            } => Self::Execute {
                id: new_id,
                address,
                output,
            },
            Self::Error {
                error_code,
                description,
                ..
            } => Self::Error {
                id: new_id,
                error_code,
                description,
            },
        }
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        match self {
            Self::Data { id, data, topics } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("data", data)?;
                map.serialize_entry("topics", topics)?;
                map.end()
            }
            Self::Deploy { id, address } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("address", address)?;
                map.end()
            }
            Self::Execute {
                id,
                address,
                output,
            } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("address", address)?;
                map.serialize_entry("output", output)?;
                map.end()
            }
            Self::Error {
                id,
                error_code,
                description,
            } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("errorCode", error_code)?;
                map.serialize_entry("description", description)?;
                map.end()
            }
        }
    }
}

/// Mirrors [`Event`]'s hand-written [`Serialize`] in reverse, used when a
/// mailbox backend needs to round-trip an event through storage (the Redis
/// backend) rather than hand it to an HTTP client. Discriminates on the
/// same field presence as the wire format.
impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let id = value
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| de::Error::missing_field("id"))?;

        if let Some(error_code) = value.get("errorCode").and_then(|v| v.as_i64()) {
            let description = value
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Ok(Self::Error {
                id,
                error_code,
                description,
            });
        }

        if value.get("data").is_some() && value.get("topics").is_some() {
            let data: Bytes = serde_json::from_value(value["data"].clone()).map_err(de::Error::custom)?;
            let topics: Vec<B256> =
                serde_json::from_value(value["topics"].clone()).map_err(de::Error::custom)?;
            return Ok(Self::Data { id, data, topics });
        }

        let address: Address = value
            .get("address")
            .cloned()
            .ok_or_else(|| de::Error::missing_field("address"))
            .and_then(|v| serde_json::from_value(v).map_err(de::Error::custom))?;

        if let Some(output) = value.get("output") {
            let output: Bytes = serde_json::from_value(output.clone()).map_err(de::Error::custom)?;
            return Ok(Self::Execute {
                id,
                address,
                output,
            });
        }

        Ok(Self::Deploy { id, address })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_event_round_trips_through_storage_deserialize() {
        let e = Event::Error {
            id: 3,
            error_code: 1002,
            description: "gas estimate failed".into(),
        };
        let stored = serde_json::to_string(&e).unwrap();
        let parsed: Event = serde_json::from_str(&stored).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn deploy_event_has_no_output_key() {
        let e = Event::Deploy {
            id: 0,
            address: Address::ZERO,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("output").is_none());
        assert!(v.get("address").is_some());
    }

    #[test]
    fn execute_event_always_carries_output() {
        let e = Event::Execute {
            id: 0,
            address: Address::ZERO,
            output: Bytes::new(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert!(v.get("output").is_some());
    }

    #[test]
    fn error_event_carries_code_and_description() {
        let e = Event::Error {
            id: 7,
            error_code: 1000,
            description: "status 0".into(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["errorCode"], 1000);
        assert_eq!(v["description"], "status 0");
    }
}
