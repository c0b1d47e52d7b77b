//! Shared workspace state: quadrant fields, file documents, cursors.
//!
//! Pure data, no I/O. Every operation is a single synchronous write and
//! the last write always wins.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::registry::UserId;

/// One of the three legacy quadrant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuadrantField {
    Css,
    Javascript,
    Html,
}

impl QuadrantField {
    /// Parse a wire field name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "css" => Some(Self::Css),
            "javascript" => Some(Self::Javascript),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Css => "css",
            Self::Javascript => "javascript",
            Self::Html => "html",
        }
    }
}

/// The three whole-value quadrant fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuadrantState {
    pub css: String,
    pub javascript: String,
    pub html: String,
}

impl QuadrantState {
    pub fn get(&self, field: QuadrantField) -> &str {
        match field {
            QuadrantField::Css => &self.css,
            QuadrantField::Javascript => &self.javascript,
            QuadrantField::Html => &self.html,
        }
    }

    fn slot(&mut self, field: QuadrantField) -> &mut String {
        match field {
            QuadrantField::Css => &mut self.css,
            QuadrantField::Javascript => &mut self.javascript,
            QuadrantField::Html => &mut self.html,
        }
    }
}

/// Last reported cursor of a user. Position fields echo the client verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorState {
    pub field: Value,
    pub line: Value,
    pub column: Value,
    pub timestamp: String,
}

/// Quadrant fields, per-path file contents and per-user cursors.
#[derive(Debug, Default)]
pub struct StateStore {
    quadrant: QuadrantState,
    files: BTreeMap<String, String>,
    cursors: BTreeMap<UserId, CursorState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a quadrant field by wire name.
    ///
    /// Returns the parsed field, or `None` (and leaves state untouched) when
    /// the name is not one of `css`, `javascript`, `html`.
    pub fn update_quadrant(&mut self, field: &str, value: impl Into<String>) -> Option<QuadrantField> {
        let field = QuadrantField::parse(field)?;
        *self.quadrant.slot(field) = value.into();
        Some(field)
    }

    pub fn quadrant(&self) -> &QuadrantState {
        &self.quadrant
    }

    pub fn get_file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Create or overwrite a file's full content.
    pub fn set_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Store `content` only if the path has no content yet.
    ///
    /// Returns `true` if the path was seeded.
    pub fn seed_file(&mut self, path: &str, content: &str) -> bool {
        if self.files.contains_key(path) {
            return false;
        }
        self.files.insert(path.to_string(), content.to_string());
        true
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn set_cursor(&mut self, user_id: UserId, cursor: CursorState) {
        self.cursors.insert(user_id, cursor);
    }

    pub fn remove_cursor(&mut self, user_id: &UserId) -> Option<CursorState> {
        self.cursors.remove(user_id)
    }

    pub fn cursors(&self) -> &BTreeMap<UserId, CursorState> {
        &self.cursors
    }

    /// Clear quadrant fields and file contents. Cursors belong to live
    /// sessions and are left alone.
    pub fn reset(&mut self) {
        self.quadrant = QuadrantState::default();
        self.files.clear();
    }
}
