// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Inbound frames are UTF-8 JSON objects in one of three shapes:
//!
//! - flat sample: `{"x": 1, "y": 2, "pressure": 0.5}`
//! - stroke collection: `{"strokes": [{"stroke": 0, "points": [{"x": 0, "y": 0}]}]}`
//! - attributed stroke collection: the above plus `name` and/or `personal_color`
//!
//! Any shape may carry the client identity (`mac`) and a client timestamp in
//! Unix milliseconds (`timestamp`). The shape is inferred from which fields
//! are present; nothing declares it up front. `mac` and `timestamp` never make
//! a frame invalid: a value of the wrong type is treated as absent.
//!
//! Numbers are kept as [`serde_json::Number`] so a stored payload serializes
//! back exactly as the client sent it (`1` stays `1`, not `1.0`).

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// JSON field carrying the client-declared identity (hardware address).
pub const IDENTITY_FIELD: &str = "mac";

/// JSON field carrying the record timestamp in Unix milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Largest client timestamp accepted, so it fits a signed 64-bit column.
pub const MAX_TIMESTAMP: u64 = i64::MAX as u64;

/// Rejection sent when an identity is already held by an active connection.
pub const ERR_ALREADY_CONNECTED: &str = "Device already connected";
/// Rejection sent when the handshake frame carries no identity.
pub const ERR_MISSING_IDENTITY: &str = "Missing device identity";
/// Rejection sent when the handshake frame cannot be decoded at all.
pub const ERR_INVALID_HANDSHAKE: &str = "Invalid handshake";

/// Errors produced while decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame matches no known payload shape")]
    UnrecognizedShape,
    #[error("handshake frame has no identity")]
    MissingIdentity,
}

/// A 2D point within a stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: Number,
    pub y: Number,
}

/// One stroke: its index within the drawing and its ordered points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub stroke: u32,
    pub points: Vec<Point>,
}

/// A single sensor or pen sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatSample {
    pub x: Number,
    pub y: Number,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<Number>,
}

/// An ordered collection of strokes without attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrokeCollection {
    pub strokes: Vec<Stroke>,
}

/// A stroke collection tagged with a display name and/or a color.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributedStrokeCollection {
    pub strokes: Vec<Stroke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_color: Option<String>,
}

/// A decoded payload body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Sample(FlatSample),
    Strokes(StrokeCollection),
    AttributedStrokes(AttributedStrokeCollection),
}

/// Discriminant of [`Payload`], stored alongside records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Sample,
    Strokes,
    AttributedStrokes,
}

impl PayloadShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadShape::Sample => "sample",
            PayloadShape::Strokes => "strokes",
            PayloadShape::AttributedStrokes => "attributed_strokes",
        }
    }
}

impl Payload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            Payload::Sample(_) => PayloadShape::Sample,
            Payload::Strokes(_) => PayloadShape::Strokes,
            Payload::AttributedStrokes(_) => PayloadShape::AttributedStrokes,
        }
    }

    /// Display name, only present on attributed stroke collections.
    pub fn name(&self) -> Option<&str> {
        match self {
            Payload::AttributedStrokes(a) => a.name.as_deref(),
            _ => None,
        }
    }

    /// Serializes the payload fields as a JSON object.
    pub fn to_fields(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: Payload,
    /// Identity the client put in the frame, if any. Not trusted.
    pub identity: Option<String>,
    /// Client-supplied timestamp in Unix milliseconds, if any.
    pub timestamp: Option<u64>,
}

/// The first frame of a connection in handshake mode.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub identity: String,
    /// Payload carried alongside the identity, handled as the first message.
    pub frame: Option<Frame>,
}

/// Every field any shape may use. Presence decides the shape.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    strokes: Option<Vec<Stroke>>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    personal_color: Option<String>,
    #[serde(default)]
    x: Option<Number>,
    #[serde(default)]
    y: Option<Number>,
    #[serde(default)]
    pressure: Option<Number>,
    #[serde(default)]
    mac: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
}

impl RawFrame {
    fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    fn identity(&self) -> Option<String> {
        self.mac
            .as_ref()
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    }

    fn timestamp(&self) -> Option<u64> {
        self.timestamp
            .as_ref()
            .and_then(Value::as_u64)
            .filter(|ts| *ts <= MAX_TIMESTAMP)
    }

    fn payload(&self) -> Option<Payload> {
        if let Some(strokes) = &self.strokes {
            if self.name.is_some() || self.personal_color.is_some() {
                return Some(Payload::AttributedStrokes(AttributedStrokeCollection {
                    strokes: strokes.clone(),
                    name: self.name.clone(),
                    personal_color: self.personal_color.clone(),
                }));
            }
            return Some(Payload::Strokes(StrokeCollection {
                strokes: strokes.clone(),
            }));
        }
        match (&self.x, &self.y) {
            (Some(x), Some(y)) => Some(Payload::Sample(FlatSample {
                x: x.clone(),
                y: y.clone(),
                pressure: self.pressure.clone(),
            })),
            _ => None,
        }
    }

    fn into_frame(self) -> Result<Frame, DecodeError> {
        let payload = self.payload().ok_or(DecodeError::UnrecognizedShape)?;
        Ok(Frame {
            payload,
            identity: self.identity(),
            timestamp: self.timestamp(),
        })
    }
}

/// Rejects frames larger than `max` bytes before any parsing happens.
pub fn check_size(raw: &[u8], max: usize) -> Result<(), DecodeError> {
    if raw.len() > max {
        return Err(DecodeError::TooLarge {
            size: raw.len(),
            max,
        });
    }
    Ok(())
}

/// Decodes an inbound frame into a typed payload.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    RawFrame::parse(raw)?.into_frame()
}

/// Decodes an already-parsed JSON document (used when reading stored records).
pub fn decode_value(value: Value) -> Result<Frame, DecodeError> {
    RawFrame::from_value(value)?.into_frame()
}

/// Decodes the handshake frame. The identity is mandatory; a payload is not.
pub fn decode_handshake(raw: &[u8]) -> Result<Handshake, DecodeError> {
    let raw_frame = RawFrame::parse(raw)?;
    let identity = raw_frame.identity().ok_or(DecodeError::MissingIdentity)?;
    let frame = match raw_frame.payload() {
        Some(payload) => Some(Frame {
            payload,
            identity: Some(identity.clone()),
            timestamp: raw_frame.timestamp(),
        }),
        None => None,
    };
    Ok(Handshake { identity, frame })
}

/// Builds the `{"error": ...}` control frame.
pub fn error_frame(reason: &str) -> String {
    serde_json::json!({ "error": reason }).to_string()
}

/// Builds the control frame confirming a registered identity.
pub fn registered_frame(identity: &str) -> String {
    serde_json::json!({ "status": "registered", "mac": identity }).to_string()
}
