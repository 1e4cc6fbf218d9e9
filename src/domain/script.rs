//! Script identity and stored-script metadata.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::Serialize;

use crate::domain::error::QuantscriptError;

pub const MAX_NAME_LEN: usize = 100;

/// Either inline source text or a reference to a stored script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptSource {
    Inline(String),
    Stored(i64),
}

/// A saved script as held by the script store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredScript {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub code: String,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewScript {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
}

impl NewScript {
    /// Trims the fields and rejects empty names/code.
    pub fn new(
        name: &str,
        code: &str,
        description: Option<&str>,
    ) -> Result<Self, QuantscriptError> {
        let name = name.trim();
        let code = code.trim();
        if name.is_empty() {
            return Err(QuantscriptError::parameter("name must not be empty"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(QuantscriptError::parameter(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if code.is_empty() {
            return Err(QuantscriptError::parameter("code must not be empty"));
        }
        Ok(Self {
            name: name.to_string(),
            code: code.to_string(),
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        })
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptUpdate {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
}

impl ScriptUpdate {
    /// Blank strings count as "not supplied", the same way create trims them.
    pub fn new(name: Option<&str>, code: Option<&str>, description: Option<&str>) -> Self {
        let keep = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            name: keep(name),
            code: keep(code),
            description: description.map(|d| d.trim().to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.code.is_none() && self.description.is_none()
    }
}

/// Result of an all-or-nothing lookup: what was found and what was not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptLookup {
    pub found: Vec<StoredScript>,
    pub missing: Vec<i64>,
}

/// UTC+8, the fixed timezone stored scripts are stamped in.
pub fn china_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn now_china() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&china_offset())
}
