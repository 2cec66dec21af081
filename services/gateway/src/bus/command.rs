//! Inbound control commands

use std::fmt;

/// Command carried on the control topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Enable real-time publishing
    Start,
    /// Disable real-time publishing
    Stop,
    /// Anything else; logged and ignored
    Unrecognized(String),
}

impl ControlCommand {
    /// Parse a control payload
    ///
    /// Surrounding whitespace is ignored, case is not: only `START` and `STOP`
    /// are commands.
    pub fn parse(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) => match text.trim() {
                "START" => Self::Start,
                "STOP" => Self::Stop,
                other => Self::Unrecognized(other.to_string()),
            },
            Err(_) => Self::Unrecognized(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    /// Wire form of a real command
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Unrecognized(raw) => raw,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
