//! Wire envelopes exchanged over a relay connection.
//!
//! Every envelope is a JSON object with a string `type` tag. Inbound text is
//! parsed once, at the boundary, into the closed [`Inbound`] enum. Text that is
//! not an object with a string tag is a protocol error; field values are read
//! loosely (set or unset) and never rejected. Envelopes that may be
//! re-broadcast keep their original object so peers receive it verbatim.

use serde_json::{json, Map, Value};

use crate::errors::RelayError;
use crate::geo::Position;

/// A JSON object as received from a client.
pub type Payload = Map<String, Value>;

/// Type tags used on the wire.
pub mod kind {
    pub const JOIN_RESCUE_TEAM: &str = "JOIN_RESCUE_TEAM";
    pub const JOIN_MAP_UPDATES: &str = "JOIN_MAP_UPDATES";
    pub const LOCATION_UPDATE: &str = "LOCATION_UPDATE";
    pub const SOS_LOCATION_UPDATE: &str = "SOS_LOCATION_UPDATE";
    pub const FACILITY_CAPACITY_UPDATE: &str = "FACILITY_CAPACITY_UPDATE";
    pub const FACILITY_UPDATE: &str = "FACILITY_UPDATE";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const ERROR: &str = "ERROR";
    pub const JOIN_SUCCESS: &str = "JOIN_SUCCESS";
    pub const MAP_SUBSCRIPTION_SUCCESS: &str = "MAP_SUBSCRIPTION_SUCCESS";
}

/// A validated inbound envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    JoinRescueTeam {
        user_id: Option<String>,
    },
    JoinMapUpdates {
        location: Option<Position>,
    },
    LocationUpdate {
        coordinates: Option<Position>,
        is_sos: bool,
        raw: Payload,
    },
    SosLocationUpdate {
        coordinates: Option<Position>,
        raw: Payload,
    },
    FacilityCapacityUpdate {
        raw: Payload,
    },
    Ping,
    /// Any tag the relay does not know.
    Unrecognized {
        kind: String,
        raw: Payload,
    },
}

impl Inbound {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RelayError::InvalidFormat(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        let Value::Object(raw) = value else {
            return Err(RelayError::InvalidFormat("envelope must be a JSON object".into()));
        };
        let tag = match raw.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            Some(_) => return Err(RelayError::InvalidFormat("`type` must be a string".into())),
            None => return Err(RelayError::InvalidFormat("missing `type`".into())),
        };

        let inbound = match tag.as_str() {
            kind::JOIN_RESCUE_TEAM => Self::JoinRescueTeam {
                user_id: optional_text(&raw, "userId"),
            },
            kind::JOIN_MAP_UPDATES => Self::JoinMapUpdates {
                location: optional_position(&raw, "location"),
            },
            kind::LOCATION_UPDATE => Self::LocationUpdate {
                coordinates: optional_position(&raw, "coordinates"),
                is_sos: flag(&raw, "isSOS"),
                raw,
            },
            kind::SOS_LOCATION_UPDATE => Self::SosLocationUpdate {
                coordinates: optional_position(&raw, "coordinates"),
                raw,
            },
            kind::FACILITY_CAPACITY_UPDATE => Self::FacilityCapacityUpdate { raw },
            kind::PING => Self::Ping,
            _ => Self::Unrecognized { kind: tag, raw },
        };
        Ok(inbound)
    }

    /// The wire tag of this envelope.
    pub fn kind(&self) -> &str {
        match self {
            Self::JoinRescueTeam { .. } => kind::JOIN_RESCUE_TEAM,
            Self::JoinMapUpdates { .. } => kind::JOIN_MAP_UPDATES,
            Self::LocationUpdate { .. } => kind::LOCATION_UPDATE,
            Self::SosLocationUpdate { .. } => kind::SOS_LOCATION_UPDATE,
            Self::FacilityCapacityUpdate { .. } => kind::FACILITY_CAPACITY_UPDATE,
            Self::Ping => kind::PING,
            Self::Unrecognized { kind, .. } => kind,
        }
    }
}

/// Loose truthiness of a client-supplied field: null, `false`, `0`, `""` and
/// absent all count as unset.
fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// A set field as text; numbers and other scalars keep their JSON form.
fn optional_text(raw: &Payload, key: &str) -> Option<String> {
    let value = raw.get(key).filter(|v| is_set(Some(*v)))?;
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn flag(raw: &Payload, key: &str) -> bool {
    is_set(raw.get(key))
}

fn optional_position(raw: &Payload, key: &str) -> Option<Position> {
    raw.get(key)
        .filter(|v| is_set(Some(*v)))
        .map(Position::from_value)
}

/// An envelope the relay sends.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Error { message: String },
    JoinSuccess,
    MapSubscriptionSuccess,
    Pong,
    /// A client payload forwarded to peers.
    Relay(Payload),
}

impl Outbound {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.client_message(),
        }
    }

    /// Forward `raw` with its `type` replaced by `tag`.
    pub fn retagged(mut raw: Payload, tag: &str) -> Self {
        raw.insert("type".into(), Value::String(tag.to_owned()));
        Self::Relay(raw)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Error { .. } => kind::ERROR,
            Self::JoinSuccess => kind::JOIN_SUCCESS,
            Self::MapSubscriptionSuccess => kind::MAP_SUBSCRIPTION_SUCCESS,
            Self::Pong => kind::PONG,
            Self::Relay(raw) => raw.get("type").and_then(Value::as_str).unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Error { message } => json!({ "type": kind::ERROR, "message": message }),
            Self::JoinSuccess => json!({
                "type": kind::JOIN_SUCCESS,
                "message": "Successfully joined rescue team",
            }),
            Self::MapSubscriptionSuccess => json!({
                "type": kind::MAP_SUBSCRIPTION_SUCCESS,
                "message": "Subscribed to map updates",
            }),
            Self::Pong => json!({ "type": kind::PONG }),
            Self::Relay(raw) => Value::Object(raw.clone()),
        }
    }

    /// Serialized text frame.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_join_rescue_team() {
        let msg = Inbound::parse(r#"{"type":"JOIN_RESCUE_TEAM","userId":"u1"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::JoinRescueTeam {
                user_id: Some("u1".into())
            }
        );
        assert_eq!(msg.kind(), kind::JOIN_RESCUE_TEAM);
    }

    #[test]
    fn empty_or_null_user_id_is_absent() {
        for text in [
            r#"{"type":"JOIN_RESCUE_TEAM"}"#,
            r#"{"type":"JOIN_RESCUE_TEAM","userId":null}"#,
            r#"{"type":"JOIN_RESCUE_TEAM","userId":""}"#,
        ] {
            assert_eq!(
                Inbound::parse(text).unwrap(),
                Inbound::JoinRescueTeam { user_id: None },
                "{text}"
            );
        }
    }

    #[test]
    fn scalar_user_id_is_accepted_as_text() {
        assert_eq!(
            Inbound::parse(r#"{"type":"JOIN_RESCUE_TEAM","userId":42}"#).unwrap(),
            Inbound::JoinRescueTeam {
                user_id: Some("42".into())
            }
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"JOIN_RESCUE_TEAM","userId":0}"#).unwrap(),
            Inbound::JoinRescueTeam { user_id: None }
        );
    }

    #[test]
    fn sos_flag_follows_truthiness() {
        let sos = |flag: &str| {
            let text = format!(r#"{{"type":"LOCATION_UPDATE","coordinates":[1,2],"isSOS":{flag}}}"#);
            match Inbound::parse(&text).unwrap() {
                Inbound::LocationUpdate { is_sos, .. } => is_sos,
                other => panic!("unexpected: {other:?}"),
            }
        };
        assert!(sos("true"));
        assert!(sos("1"));
        assert!(sos(r#""yes""#));
        assert!(!sos("false"));
        assert!(!sos("0"));
        assert!(!sos(r#""""#));
        assert!(!sos("null"));
    }

    #[test]
    fn parse_location_update_with_sos() {
        let msg = Inbound::parse(
            r#"{"type":"LOCATION_UPDATE","coordinates":[19.07,72.87],"isSOS":true,"note":"x"}"#,
        )
        .unwrap();
        match msg {
            Inbound::LocationUpdate {
                coordinates,
                is_sos,
                raw,
            } => {
                assert_eq!(coordinates, Some(Position::Pair([19.07, 72.87])));
                assert!(is_sos);
                assert_eq!(raw["note"], "x");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn location_update_without_coordinates_parses() {
        let msg = Inbound::parse(r#"{"type":"LOCATION_UPDATE"}"#).unwrap();
        assert!(matches!(
            msg,
            Inbound::LocationUpdate {
                coordinates: None,
                is_sos: false,
                ..
            }
        ));
    }

    #[test]
    fn any_coordinates_shape_is_accepted() {
        for (text, expected) in [
            (
                r#"{"type":"SOS_LOCATION_UPDATE","coordinates":[139.69,35.68]}"#,
                Position::Pair([139.69, 35.68]),
            ),
            (
                r#"{"type":"SOS_LOCATION_UPDATE","coordinates":{"lat":19.07,"lng":72.87}}"#,
                Position::Other(json!({"lat": 19.07, "lng": 72.87})),
            ),
            (
                r#"{"type":"SOS_LOCATION_UPDATE","coordinates":"here"}"#,
                Position::Other(json!("here")),
            ),
        ] {
            match Inbound::parse(text).unwrap() {
                Inbound::SosLocationUpdate { coordinates, .. } => {
                    assert_eq!(coordinates, Some(expected), "{text}")
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn falsy_coordinates_count_as_absent() {
        for text in [
            r#"{"type":"SOS_LOCATION_UPDATE","coordinates":null}"#,
            r#"{"type":"SOS_LOCATION_UPDATE","coordinates":0}"#,
            r#"{"type":"SOS_LOCATION_UPDATE","coordinates":""}"#,
        ] {
            assert!(matches!(
                Inbound::parse(text).unwrap(),
                Inbound::SosLocationUpdate {
                    coordinates: None,
                    ..
                }
            ));
        }
    }

    #[test]
    fn unknown_tag_keeps_payload() {
        let msg = Inbound::parse(r#"{"type":"CUSTOM_EVENT","foo":1}"#).unwrap();
        match msg {
            Inbound::Unrecognized { kind, raw } => {
                assert_eq!(kind, "CUSTOM_EVENT");
                assert_eq!(raw["foo"], 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_envelopes() {
        for text in ["not json", "[1,2]", r#""PING""#, r#"{"foo":1}"#, r#"{"type":7}"#] {
            let err = Inbound::parse(text).unwrap_err();
            assert_eq!(err.client_message(), "Invalid message format", "{text}");
        }
    }

    #[test]
    fn outbound_acks_serialize() {
        assert_eq!(Outbound::Pong.to_text(), r#"{"type":"PONG"}"#);
        let err = Outbound::error(&RelayError::MissingUserId).to_value();
        assert_eq!(err["type"], "ERROR");
        assert_eq!(err["message"], "userId is required");
        assert_eq!(Outbound::JoinSuccess.to_value()["type"], "JOIN_SUCCESS");
        assert_eq!(
            Outbound::MapSubscriptionSuccess.to_value()["message"],
            "Subscribed to map updates"
        );
    }

    #[test]
    fn retag_replaces_type_and_keeps_fields() {
        let Value::Object(raw) = json!({"type":"FACILITY_CAPACITY_UPDATE","facilityId":"h1","beds":3})
        else {
            unreachable!()
        };
        let out = Outbound::retagged(raw, kind::FACILITY_UPDATE);
        assert_eq!(out.kind(), kind::FACILITY_UPDATE);
        let value = out.to_value();
        assert_eq!(value["facilityId"], "h1");
        assert_eq!(value["beds"], 3);
    }
}
