//! Plist message shapes for mux requests, replies and device events.

use crate::config;
use crate::error::{AppError, Result};
use crate::plist::{self, Dict, Value};

/// Result of a `Listen` or `Connect` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxReply {
    Success,
    MalformedRequest,
    DeviceNotConnected,
    PortNotAvailable,
    UnknownCode(i64),
}

impl MuxReply {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MuxReply::Success,
            1 => MuxReply::MalformedRequest,
            2 => MuxReply::DeviceNotConnected,
            3 => MuxReply::PortNotAvailable,
            other => MuxReply::UnknownCode(other),
        }
    }
}

/// Properties delivered with an `Attached` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub device_id: i32,
    pub serial_number: String,
    pub connection_speed: i64,
    pub connection_type: String,
    pub product_id: i64,
    pub location_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Attached(DeviceProperties),
    Detached { device_id: i32 },
}

fn client_fields(message_type: &str) -> Vec<(&'static str, Value)> {
    vec![
        ("MessageType", Value::String(message_type.to_string())),
        (
            "ClientVersionString",
            Value::String(config::CLIENT_VERSION.to_string()),
        ),
        ("ProgName", Value::String(config::PROG_NAME.to_string())),
    ]
}

/// Payload of the `Listen` request that opens an event subscription.
#[must_use]
pub fn listen_payload() -> Vec<u8> {
    plist::encode_dict(&client_fields("Listen"))
}

/// Payload of the `Connect` request. `PortNumber` is byte-swapped into
/// network order before encoding; the mux passes the value through as if it
/// were already big-endian when it hands the connection off.
#[must_use]
pub fn connect_payload(device_id: i32, device_port: u16) -> Vec<u8> {
    let mut fields = client_fields("Connect");
    fields.insert(1, ("DeviceID", Value::Integer(i64::from(device_id))));
    fields.insert(
        2,
        ("PortNumber", Value::Integer(i64::from(device_port.to_be()))),
    );
    plist::encode_dict(&fields)
}

/// Parse a `Result` reply frame.
pub fn parse_reply(payload: &[u8]) -> Result<MuxReply> {
    let dict = plist::parse_dict(payload)?;
    let message_type = dict
        .as_string("MessageType")
        .ok_or_else(|| AppError::UnexpectedReply("reply has no MessageType".into()))?;
    if message_type != "Result" {
        return Err(AppError::UnexpectedReply(format!(
            "expected Result, got {:?}",
            message_type
        )));
    }
    let number = dict
        .as_int("Number")
        .ok_or_else(|| AppError::UnexpectedReply("Result reply has no Number".into()))?;
    Ok(MuxReply::from_code(number))
}

/// Parse one event frame from a subscription. Returns `None` for message
/// types the daemon does not act on (the mux also reports pairing changes).
pub fn parse_event(payload: &[u8]) -> Result<Option<MuxEvent>> {
    let dict = plist::parse_dict(payload)?;
    let message_type = dict
        .as_string("MessageType")
        .ok_or_else(|| AppError::UnexpectedReply("event has no MessageType".into()))?;

    match message_type {
        "Attached" => {
            let properties = dict
                .as_dict("Properties")
                .ok_or_else(|| AppError::UnexpectedReply("Attached has no Properties".into()))?;
            let device_id = event_device_id(&dict, Some(properties))?;
            let serial_number = properties
                .as_string("SerialNumber")
                .ok_or_else(|| {
                    AppError::UnexpectedReply("Attached has no SerialNumber".into())
                })?
                .to_string();
            Ok(Some(MuxEvent::Attached(DeviceProperties {
                device_id,
                serial_number,
                connection_speed: properties.as_int("ConnectionSpeed").unwrap_or(0),
                connection_type: properties
                    .as_string("ConnectionType")
                    .unwrap_or("USB")
                    .to_string(),
                product_id: properties.as_int("ProductID").unwrap_or(0),
                location_id: properties.as_int("LocationID").unwrap_or(0),
            })))
        }
        "Detached" => {
            let device_id = event_device_id(&dict, None)?;
            Ok(Some(MuxEvent::Detached { device_id }))
        }
        _ => Ok(None),
    }
}

fn event_device_id(dict: &Dict, properties: Option<&Dict>) -> Result<i32> {
    let raw = dict
        .as_int("DeviceID")
        .or_else(|| properties.and_then(|p| p.as_int("DeviceID")))
        .ok_or_else(|| AppError::UnexpectedReply("event has no DeviceID".into()))?;
    i32::try_from(raw)
        .map_err(|_| AppError::UnexpectedReply(format!("DeviceID {} out of range", raw)))
}
