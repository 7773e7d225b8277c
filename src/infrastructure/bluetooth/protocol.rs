//! Stroke Engine Protocol
//!
//! This module contains the protocol definitions for talking to the device:
//! GATT identifiers, the ASCII command format and the JSON payloads of the
//! status and pattern characteristics.

use crate::domain::models::{DeviceState, Field, Page};
use crate::error::{ClientError, Result};
use serde::Deserialize;
use tracing::trace;
use uuid::Uuid;

/// Primary service exposed by the device
pub const SERVICE_UUID: &str = "522b443a-4f53-534d-0001-420badbabe69";

/// Command characteristic - `set:`/`go:` writes, echo read-back
pub const COMMAND_CHAR_UUID: &str = "522b443a-4f53-534d-1000-420badbabe69";

/// Speed knob limit characteristic - "true"/"false" text
pub const SPEED_KNOB_CHAR_UUID: &str = "522b443a-4f53-534d-1010-420badbabe69";

/// Status characteristic - JSON state notifications
pub const STATUS_CHAR_UUID: &str = "522b443a-4f53-534d-2000-420badbabe69";

/// Pattern list characteristic - JSON array of `{name, idx}`
pub const PATTERN_LIST_CHAR_UUID: &str = "522b443a-4f53-534d-3000-420badbabe69";

/// Pattern description characteristic - write index, read text
pub const PATTERN_DESCRIPTION_CHAR_UUID: &str = "522b443a-4f53-534d-3010-420badbabe69";

/// Prefix the device puts in front of a rejected command
pub const FAIL_PREFIX: &str = "fail:";

/// Commands understood by the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set a field to the value the caller wants the device to report
    Set { field: Field, value: u32 },
    /// Switch page
    Go(Page),
}

impl Command {
    /// Emergency stop
    pub const STOP: Command = Command::Set {
        field: Field::Speed,
        value: 0,
    };

    /// Wire text, with the firmware's off-by-one compensation applied
    pub fn text(&self) -> String {
        match self {
            Command::Set { field, value } => {
                format!("set:{}:{}", field.wire_name(), field.wire_value(*value))
            }
            Command::Go(page) => format!("go:{}", page.wire_name()),
        }
    }
}

/// Check the read-back of a command write
pub fn classify_echo(command: &str, response: &str) -> Result<()> {
    trace!("Echo for '{}': '{}'", command, response);
    if response == command {
        Ok(())
    } else if response.strip_prefix(FAIL_PREFIX) == Some(command) {
        Err(ClientError::OperationFailed(command.to_string()))
    } else {
        Err(ClientError::UnexpectedResponse {
            command: command.to_string(),
            response: response.to_string(),
        })
    }
}

/// Status notification as sent by the firmware
#[derive(Debug, Clone, Deserialize)]
struct StatusPayload {
    state: String,
    speed: u8,
    stroke: u8,
    depth: u8,
    sensation: u8,
    pattern: u32,
}

impl From<StatusPayload> for DeviceState {
    fn from(p: StatusPayload) -> Self {
        DeviceState {
            status: p.state,
            speed: p.speed,
            stroke: p.stroke,
            depth: p.depth,
            sensation: p.sensation,
            pattern: p.pattern,
        }
    }
}

/// Parse a status notification into the canonical model
pub fn parse_status(bytes: &[u8]) -> Result<DeviceState> {
    let payload: StatusPayload = serde_json::from_slice(bytes)?;
    Ok(payload.into())
}

#[derive(Debug, Clone, Deserialize)]
struct PatternEntry {
    name: String,
    idx: u32,
}

/// Parse the pattern list into `(name, index)` pairs, in device order
pub fn parse_pattern_list(bytes: &[u8]) -> Result<Vec<(String, u32)>> {
    let entries: Vec<PatternEntry> = serde_json::from_slice(bytes)?;
    Ok(entries.into_iter().map(|e| (e.name, e.idx)).collect())
}

pub fn bool_text(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

pub fn parse_bool_text(text: &str) -> Result<bool> {
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ClientError::DataError(format!(
            "expected 'true' or 'false', got '{}'",
            other
        ))),
    }
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str)
        .map_err(|e| ClientError::InvalidInput(format!("invalid UUID '{}': {}", uuid_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_fields().0, 0x522b443a);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_command_text() {
        assert_eq!(
            Command::Set {
                field: Field::Speed,
                value: 50
            }
            .text(),
            "set:speed:50"
        );
        assert_eq!(
            Command::Set {
                field: Field::Depth,
                value: 50
            }
            .text(),
            "set:depth:49"
        );
        assert_eq!(
            Command::Set {
                field: Field::Stroke,
                value: 100
            }
            .text(),
            "set:stroke:100"
        );
        assert_eq!(Command::Go(Page::StrokeEngine).text(), "go:strokeEngine");
        assert_eq!(Command::STOP.text(), "set:speed:0");
    }

    #[test]
    fn test_classify_echo() {
        assert_eq!(classify_echo("go:menu", "go:menu"), Ok(()));
        assert_eq!(
            classify_echo("go:menu", "fail:go:menu"),
            Err(ClientError::OperationFailed("go:menu".to_string()))
        );
        assert!(matches!(
            classify_echo("go:menu", "set:speed:3"),
            Err(ClientError::UnexpectedResponse { .. })
        ));
        assert!(matches!(
            classify_echo("go:menu", "fail:go:strokeEngine"),
            Err(ClientError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_parse_status_renames_state() {
        let json = br#"{"state":"strokeEngine.idle","speed":10,"stroke":20,"depth":30,"sensation":40,"pattern":2}"#;
        let state = parse_status(json).unwrap();
        assert_eq!(
            state,
            DeviceState {
                status: "strokeEngine.idle".to_string(),
                speed: 10,
                stroke: 20,
                depth: 30,
                sensation: 40,
                pattern: 2,
            }
        );
    }

    #[test]
    fn test_parse_status_rejects_garbage() {
        assert!(matches!(
            parse_status(b"{\"state\": 3}"),
            Err(ClientError::DataError(_))
        ));
    }

    #[test]
    fn test_parse_pattern_list() {
        let json = br#"[{"name":"Simple Stroke","idx":0},{"name":"Teasing Pounding","idx":1}]"#;
        assert_eq!(
            parse_pattern_list(json).unwrap(),
            vec![
                ("Simple Stroke".to_string(), 0),
                ("Teasing Pounding".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_bool_text() {
        assert_eq!(parse_bool_text(bool_text(true)), Ok(true));
        assert_eq!(parse_bool_text("false\n"), Ok(false));
        assert!(parse_bool_text("yes").is_err());
    }
}
