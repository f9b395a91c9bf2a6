//! Canonical event envelope and its JSON codec.
//!
//! Every domain event travels as one flat JSON object: the four header fields
//! followed by the payload's own fields.
//!
//! ```json
//! {"id":"20240102150405-a8Kd93xQ","type":"profile.updated","timestamp":1704207845,"version":"1.0","username":"alice"}
//! ```

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EventBusError, Result};

/// Envelope schema version stamped on every published event.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Header keys owned by the envelope. Payloads may not reuse them.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "type", "timestamp", "version"];

const ID_SUFFIX_LEN: usize = 8;

/// Routing keys and event type names shared across services.
pub mod event_types {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_LOGIN: &str = "user.login";
    pub const PROFILE_UPDATED: &str = "profile.updated";
    pub const PROFILE_DELETED: &str = "profile.deleted";
    pub const GOOGLE_LOGIN: &str = "google.login";
    pub const GOOGLE_LOGIN_REQUEST: &str = "google.login.request";
    pub const GOOGLE_LOGIN_RESPONSE: &str = "google.login.response";
    pub const EMAIL_VERIFICATION_SUCCESS: &str = "email.verification.success";
    pub const PLAN_CREATED: &str = "plan.created";
    pub const PLAN_UPDATED: &str = "plan.updated";
    pub const PLAN_DELETED: &str = "plan.deleted";
    pub const SUBSCRIPTION_UPDATED: &str = "subscription.updated";
}

/// A domain event with its header.
///
/// The header is fixed at construction; there are no setters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope<P> {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: i64,
    version: String,
    #[serde(flatten)]
    payload: P,
}

impl<P> Envelope<P> {
    /// Wrap `payload` with a fresh ID and the current time.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self {
            id: time_prefixed_id(ID_SUFFIX_LEN),
            event_type: event_type.into(),
            timestamp: Utc::now().timestamp(),
            version: ENVELOPE_VERSION.to_string(),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Creation time in epoch seconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Serialize> Envelope<P> {
    /// Serialize to the flat wire form.
    ///
    /// Fails with [`EventBusError::InvalidPayload`] when the payload is not a
    /// JSON object or shadows a header field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = match serde_json::to_value(&self.payload)? {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                return Err(EventBusError::InvalidPayload(format!(
                    "payload must serialize to a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        if let Some(key) = RESERVED_FIELDS.iter().find(|key| body.contains_key(**key)) {
            return Err(EventBusError::InvalidPayload(format!(
                "payload field `{key}` collides with the envelope header"
            )));
        }

        let mut wire = Map::with_capacity(body.len() + RESERVED_FIELDS.len());
        wire.insert("id".into(), Value::String(self.id.clone()));
        wire.insert("type".into(), Value::String(self.event_type.clone()));
        wire.insert("timestamp".into(), Value::from(self.timestamp));
        wire.insert("version".into(), Value::String(self.version.clone()));
        wire.append(&mut body);

        Ok(serde_json::to_vec(&Value::Object(wire))?)
    }
}

impl<P: DeserializeOwned> Envelope<P> {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Header-only view used for logging and auditing deliveries whose payload
/// type is unknown. Every field is optional so foreign messages still parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub timestamp: Option<i64>,
    pub version: Option<String>,
}

impl EnvelopeHeader {
    pub fn peek(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Decode a handler payload straight from a delivery body, ignoring the
/// envelope header fields.
pub fn decode_payload<P: DeserializeOwned>(bytes: &[u8]) -> Result<P> {
    Ok(serde_json::from_slice(bytes)?)
}

/// `YYYYMMDDHHMMSS-<random alphanumeric>`, UTC.
///
/// Used for envelope IDs, correlation request IDs and session tokens.
pub fn time_prefixed_id(suffix_len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(suffix_len)
        .map(char::from)
        .collect();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

/// Fresh correlation ID for request/response exchanges.
pub fn new_request_id() -> String {
    time_prefixed_id(ID_SUFFIX_LEN)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
