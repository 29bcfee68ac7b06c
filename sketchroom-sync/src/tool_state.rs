//! Locally authoritative drawing parameters.
//!
//! One [`ToolStore`] per tab. It is a plain state holder: writes are
//! validated and applied, reads return the latest write, and nothing here
//! talks to a channel.

use serde::{Deserialize, Serialize};

use crate::protocol::SyncMessage;

/// Palette names accepted as color tokens (besides `#rgb` / `#rrggbb`).
pub const PALETTE: [&str; 11] = [
    "black", "white", "red", "orange", "yellow", "green", "blue", "purple", "pink", "brown",
    "gray",
];

/// Active drawing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pencil,
    Eraser,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Pencil => "pencil",
            Tool::Eraser => "eraser",
        }
    }
}

impl std::str::FromStr for Tool {
    type Err = ToolStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pencil" => Ok(Tool::Pencil),
            "eraser" => Ok(Tool::Eraser),
            other => Err(ToolStateError::UnknownTool(other.to_string())),
        }
    }
}

/// The drawing parameters fed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub color: String,
    pub stroke_width: f32,
    pub tool: Tool,
}

impl Default for ToolState {
    fn default() -> Self {
        Self {
            color: "black".to_string(),
            stroke_width: 2.0,
            tool: Tool::Pencil,
        }
    }
}

/// A partial update coming from the toolbar. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPatch {
    pub color: Option<String>,
    pub stroke_width: Option<f32>,
    pub tool: Option<Tool>,
}

impl ToolPatch {
    pub fn color(color: impl Into<String>) -> Self {
        Self {
            color: Some(color.into()),
            ..Self::default()
        }
    }

    pub fn stroke_width(stroke_width: f32) -> Self {
        Self {
            stroke_width: Some(stroke_width),
            ..Self::default()
        }
    }

    pub fn tool(tool: Tool) -> Self {
        Self {
            tool: Some(tool),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.stroke_width.is_none() && self.tool.is_none()
    }
}

/// Normalize a color token, or reject it.
pub fn normalize_color(token: &str) -> Result<String, ToolStateError> {
    let lowered = token.trim().to_ascii_lowercase();
    if PALETTE.contains(&lowered.as_str()) {
        return Ok(lowered);
    }
    if let Some(hex) = lowered.strip_prefix('#') {
        if (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(lowered);
        }
    }
    Err(ToolStateError::InvalidColor(token.to_string()))
}

pub fn validate_stroke_width(stroke_width: f32) -> Result<f32, ToolStateError> {
    if stroke_width.is_finite() && stroke_width > 0.0 {
        Ok(stroke_width)
    } else {
        Err(ToolStateError::InvalidStrokeWidth(stroke_width))
    }
}

/// Holder of the single authoritative [`ToolState`] of a tab.
#[derive(Debug, Clone, Default)]
pub struct ToolStore {
    state: ToolState,
    revision: u64,
}

impl ToolStore {
    pub fn new(initial: ToolState) -> Self {
        Self {
            state: initial,
            revision: 0,
        }
    }

    pub fn state(&self) -> &ToolState {
        &self.state
    }

    /// Number of writes applied since creation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_color(&mut self, color: &str) -> Result<(), ToolStateError> {
        self.state.color = normalize_color(color)?;
        self.revision += 1;
        Ok(())
    }

    pub fn set_stroke_width(&mut self, stroke_width: f32) -> Result<(), ToolStateError> {
        self.state.stroke_width = validate_stroke_width(stroke_width)?;
        self.revision += 1;
        Ok(())
    }

    pub fn set_tool(&mut self, tool: Tool) {
        self.state.tool = tool;
        self.revision += 1;
    }

    /// Apply a patch atomically.
    ///
    /// Every field is validated before anything is written, so a rejected
    /// patch leaves the store untouched. Returns the mirror messages for the
    /// fields written, in color, stroke, tool order.
    pub fn apply(&mut self, patch: &ToolPatch) -> Result<Vec<SyncMessage>, ToolStateError> {
        let color = patch.color.as_deref().map(normalize_color).transpose()?;
        let stroke_width = patch.stroke_width.map(validate_stroke_width).transpose()?;

        let mut messages = Vec::with_capacity(3);
        if let Some(color) = color {
            self.state.color = color.clone();
            messages.push(SyncMessage::ColorChange { color });
        }
        if let Some(stroke_width) = stroke_width {
            self.state.stroke_width = stroke_width;
            messages.push(SyncMessage::StrokeChange { stroke_width });
        }
        if let Some(tool) = patch.tool {
            self.state.tool = tool;
            messages.push(SyncMessage::ToolChange { tool });
        }
        self.revision += messages.len() as u64;
        Ok(messages)
    }
}

/// Tool state errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStateError {
    InvalidColor(String),
    InvalidStrokeWidth(f32),
    UnknownTool(String),
}

impl std::fmt::Display for ToolStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidColor(c) => write!(f, "Unrecognized color token: {c:?}"),
            Self::InvalidStrokeWidth(w) => write!(f, "Stroke width must be positive, got {w}"),
            Self::UnknownTool(t) => write!(f, "Unknown tool: {t:?}"),
        }
    }
}

impl std::error::Error for ToolStateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let store = ToolStore::default();
        assert_eq!(store.state().color, "black");
        assert_eq!(store.state().stroke_width, 2.0);
        assert_eq!(store.state().tool, Tool::Pencil);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_color_tokens() {
        assert_eq!(normalize_color("Red").unwrap(), "red");
        assert_eq!(normalize_color("#0F0").unwrap(), "#0f0");
        assert_eq!(normalize_color("#1f1f1f").unwrap(), "#1f1f1f");
        assert!(normalize_color("#12345").is_err());
        assert!(normalize_color("#zzzzzz").is_err());
        assert!(normalize_color("chartreuse").is_err());
        assert!(normalize_color("").is_err());
    }

    #[test]
    fn test_stroke_width_must_be_positive() {
        assert!(validate_stroke_width(0.5).is_ok());
        assert!(validate_stroke_width(0.0).is_err());
        assert!(validate_stroke_width(-3.0).is_err());
        assert!(validate_stroke_width(f32::NAN).is_err());
        assert!(validate_stroke_width(f32::INFINITY).is_err());
    }

    #[test]
    fn test_last_write_wins_per_field() {
        let mut store = ToolStore::default();
        let patches = [
            ToolPatch::color("red"),
            ToolPatch::stroke_width(8.0),
            ToolPatch::tool(Tool::Eraser),
            ToolPatch::color("blue"),
            ToolPatch::stroke_width(3.0),
        ];
        for patch in &patches {
            store.apply(patch).unwrap();
        }
        assert_eq!(
            store.state(),
            &ToolState {
                color: "blue".into(),
                stroke_width: 3.0,
                tool: Tool::Eraser,
            }
        );
        assert_eq!(store.revision(), 5);
    }

    #[test]
    fn test_apply_emits_messages_in_field_order() {
        let mut store = ToolStore::default();
        let patch = ToolPatch {
            color: Some("green".into()),
            stroke_width: Some(5.0),
            tool: Some(Tool::Eraser),
        };
        let messages = store.apply(&patch).unwrap();
        assert_eq!(
            messages,
            vec![
                SyncMessage::ColorChange { color: "green".into() },
                SyncMessage::StrokeChange { stroke_width: 5.0 },
                SyncMessage::ToolChange { tool: Tool::Eraser },
            ]
        );
    }

    #[test]
    fn test_rejected_patch_leaves_store_untouched() {
        let mut store = ToolStore::default();
        let patch = ToolPatch {
            color: Some("red".into()),
            stroke_width: Some(-1.0),
            tool: Some(Tool::Eraser),
        };
        assert_eq!(store.apply(&patch), Err(ToolStateError::InvalidStrokeWidth(-1.0)));
        assert_eq!(store.state(), &ToolState::default());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_same_value_still_counts_as_write() {
        let mut store = ToolStore::default();
        let messages = store.apply(&ToolPatch::color("black")).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let mut store = ToolStore::default();
        assert!(ToolPatch::default().is_empty());
        assert!(store.apply(&ToolPatch::default()).unwrap().is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_tool_parse() {
        assert_eq!("eraser".parse::<Tool>().unwrap(), Tool::Eraser);
        assert_eq!(Tool::Pencil.as_str(), "pencil");
        assert!("brush".parse::<Tool>().is_err());
    }
}
