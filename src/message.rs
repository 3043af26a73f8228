//! NIP-01 message framing between clients and relays.

use serde_json::{json, Value};

use crate::{event::Event, filter::Filter};

/// Messages a client sends to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Event(ev) => json!(["EVENT", ev]).to_string(),
            ClientMessage::Req { sub_id, filters } => {
                let mut arr = vec![Value::from("REQ"), Value::from(sub_id.as_str())];
                arr.extend(filters.iter().map(Filter::to_json));
                Value::Array(arr).to_string()
            }
            ClientMessage::Close(sub_id) => json!(["CLOSE", sub_id]).to_string(),
        }
    }

    /// Parse a client frame as a relay would.
    #[cfg(test)]
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        match arr.first()?.as_str()? {
            "EVENT" => {
                let ev = serde_json::from_value(arr.get(1)?.clone()).ok()?;
                Some(ClientMessage::Event(ev))
            }
            "REQ" if arr.len() >= 2 => Some(ClientMessage::Req {
                sub_id: arr[1].as_str()?.to_string(),
                filters: arr[2..].iter().map(Filter::from_json).collect(),
            }),
            "CLOSE" => Some(ClientMessage::Close(arr.get(1)?.as_str()?.to_string())),
            _ => None,
        }
    }
}

/// Messages a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        sub_id: String,
        event: Event,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose(String),
    Closed {
        sub_id: String,
        message: String,
    },
    Notice(String),
}

impl RelayMessage {
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first()?.as_str()? {
            "EVENT" if arr.len() >= 3 => Some(RelayMessage::Event {
                sub_id: text(1)?,
                event: serde_json::from_value(arr[2].clone()).ok()?,
            }),
            "OK" if arr.len() >= 3 => Some(RelayMessage::Ok {
                event_id: text(1)?,
                accepted: arr[2].as_bool()?,
                message: text(3).unwrap_or_default(),
            }),
            "EOSE" => Some(RelayMessage::Eose(text(1)?)),
            "CLOSED" => Some(RelayMessage::Closed {
                sub_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice(text(1).unwrap_or_default())),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event { sub_id, event } => json!(["EVENT", sub_id, event]).to_string(),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]).to_string(),
            RelayMessage::Eose(sub_id) => json!(["EOSE", sub_id]).to_string(),
            RelayMessage::Closed { sub_id, message } => {
                json!(["CLOSED", sub_id, message]).to_string()
            }
            RelayMessage::Notice(message) => json!(["NOTICE", message]).to_string(),
        }
    }
}
