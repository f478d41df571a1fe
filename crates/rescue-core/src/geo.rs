use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reported position, kept in the shape the client sent it.
///
/// `{latitude, longitude}` and two-number arrays are recognized; anything else
/// is carried as raw JSON. No range or axis-order check is made: clients send
/// both `[lat, lng]` and GeoJSON-style `[lng, lat]`, and peers receive the
/// value untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Position {
    LatLng { latitude: f64, longitude: f64 },
    Pair([f64; 2]),
    Other(Value),
}

impl Position {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::Other(value.clone()))
    }

    /// Latitude when the position names it explicitly.
    pub fn latitude(&self) -> Option<f64> {
        match self {
            Self::LatLng { latitude, .. } => Some(*latitude),
            Self::Pair(_) | Self::Other(_) => None,
        }
    }

    /// Longitude when the position names it explicitly.
    pub fn longitude(&self) -> Option<f64> {
        match self {
            Self::LatLng { longitude, .. } => Some(*longitude),
            Self::Pair(_) | Self::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_pair_in_either_axis_order() {
        assert_eq!(
            Position::from_value(&json!([19.07, 72.87])),
            Position::Pair([19.07, 72.87])
        );
        // GeoJSON order, longitude first.
        assert_eq!(
            Position::from_value(&json!([139.69, 35.68])),
            Position::Pair([139.69, 35.68])
        );
    }

    #[test]
    fn parses_object() {
        let pos = Position::from_value(&json!({"latitude": 18.9, "longitude": 72.8}));
        assert_eq!(pos.latitude(), Some(18.9));
        assert_eq!(pos.longitude(), Some(72.8));
    }

    #[test]
    fn unfamiliar_shapes_are_kept_raw() {
        for raw in [
            json!({"lat": 19.07, "lng": 72.87}),
            json!("19.07,72.87"),
            json!([19.07]),
            json!({"type": "Point", "coordinates": [72.87, 19.07]}),
        ] {
            let pos = Position::from_value(&raw);
            assert_eq!(pos, Position::Other(raw.clone()));
            assert_eq!(pos.latitude(), None);
            assert_eq!(serde_json::to_value(&pos).unwrap(), raw);
        }
    }

    #[test]
    fn keeps_shape_on_serialize() {
        let pair = Position::Pair([1.0, 2.0]);
        assert_eq!(serde_json::to_value(&pair).unwrap(), json!([1.0, 2.0]));

        let obj = Position::LatLng {
            latitude: 1.0,
            longitude: 2.0,
        };
        assert_eq!(
            serde_json::to_value(&obj).unwrap(),
            json!({"latitude": 1.0, "longitude": 2.0})
        );
    }
}
