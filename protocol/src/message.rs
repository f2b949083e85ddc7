use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Messages a client sends over its socket. Text frames, one flat JSON
/// object per frame, discriminated by the `"type"` field.
///
/// Anything with an unrecognized `"type"` deserializes to [`Unknown`]
/// so the relay can drop it without treating it as a parse failure.
///
/// [`Unknown`]: ClientMessage::Unknown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Join {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Draw {
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        color: String,
        size: f64,
    },
    Cursor {
        x: f64,
        y: f64,
    },
    Clear,
    #[serde(other)]
    Unknown,
}

/// Messages the relay fans out to clients. `draw` and `clear` are the
/// sender's payload verbatim; `cursor` additionally carries the sender's
/// identity so receivers can attribute the pointer to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Draw {
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        color: String,
        size: f64,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        user_id: SessionId,
        name: String,
        x: f64,
        y: f64,
    },
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationError {
    EmptyName,
    NonFiniteCoordinate,
    NonPositiveSize,
    InvalidColor,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::EmptyName => write!(f, "join name is empty"),
            ValidationError::NonFiniteCoordinate => write!(f, "coordinate is not a finite number"),
            ValidationError::NonPositiveSize => write!(f, "brush size must be a positive number"),
            ValidationError::InvalidColor => write!(f, "color is not a recognized color string"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ClientMessage {
    /// Wire-level name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Draw { .. } => "draw",
            ClientMessage::Cursor { .. } => "cursor",
            ClientMessage::Clear => "clear",
            ClientMessage::Unknown => "unknown",
        }
    }

    /// Checks the field-level constraints the relay enforces before a
    /// message is acted on. JSON itself cannot encode NaN, but values
    /// like `1e999` deserialize to infinity, hence the finite checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ClientMessage::Join { name } => {
                if name.trim().is_empty() {
                    Err(ValidationError::EmptyName)
                } else {
                    Ok(())
                }
            }
            ClientMessage::Draw {
                from_x,
                from_y,
                to_x,
                to_y,
                color,
                size,
            } => {
                if ![from_x, from_y, to_x, to_y].iter().all(|v| v.is_finite()) {
                    Err(ValidationError::NonFiniteCoordinate)
                } else if !size.is_finite() || *size <= 0.0 {
                    Err(ValidationError::NonPositiveSize)
                } else if !is_valid_color(color) {
                    Err(ValidationError::InvalidColor)
                } else {
                    Ok(())
                }
            }
            ClientMessage::Cursor { x, y } => {
                if x.is_finite() && y.is_finite() {
                    Ok(())
                } else {
                    Err(ValidationError::NonFiniteCoordinate)
                }
            }
            ClientMessage::Clear | ClientMessage::Unknown => Ok(()),
        }
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Draw { .. } => "draw",
            ServerMessage::Cursor { .. } => "cursor",
            ServerMessage::Clear => "clear",
        }
    }

    /// Cursor updates supersede each other, so one may be dropped under
    /// backpressure without corrupting the shared picture. Draw and
    /// clear may not.
    pub fn is_supersedable(&self) -> bool {
        matches!(self, ServerMessage::Cursor { .. })
    }
}

/// Accepts the two color forms the whiteboard client emits: `#rgb` /
/// `#rrggbb` hex from the color picker, or an alphabetic CSS keyword.
pub fn is_valid_color(color: &str) -> bool {
    let color = color.trim();
    if let Some(hex) = color.strip_prefix('#') {
        (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
    } else {
        !color.is_empty() && color.chars().all(|c| c.is_ascii_alphabetic())
    }
}
