//! The transaction log: one line per applied mutation.
//!
//! Line format, UTF-8, newline-terminated:
//!
//! ```text
//! T <epoch-millis> <L|R|I> <json-path-array> [<json-value>]
//! ```
//!
//! `L` is a leaf write and carries a value; `R` removes the node at the
//! path; `I` bumps an interior node's timestamp. The path is a JSON
//! array of child names from the root.

pub mod reader;
pub(crate) mod writer;

use crate::error::{Result, StoreError};
use crate::value::{ConfigValue, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlogAction {
    WriteLeaf,
    RemoveNode,
    InteriorTimestamp,
}

impl TlogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteLeaf => "L",
            Self::RemoveNode => "R",
            Self::InteriorTimestamp => "I",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "L" => Some(Self::WriteLeaf),
            "R" => Some(Self::RemoveNode),
            "I" => Some(Self::InteriorTimestamp),
            _ => None,
        }
    }
}

/// One applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct TlogRecord {
    pub timestamp: Timestamp,
    pub action: TlogAction,
    pub path: Vec<String>,
    /// Present only for `WriteLeaf`.
    pub value: Option<ConfigValue>,
}

impl TlogRecord {
    pub fn write(timestamp: Timestamp, path: Vec<String>, value: ConfigValue) -> Self {
        Self {
            timestamp,
            action: TlogAction::WriteLeaf,
            path,
            value: Some(value),
        }
    }

    pub fn remove(timestamp: Timestamp, path: Vec<String>) -> Self {
        Self {
            timestamp,
            action: TlogAction::RemoveNode,
            path,
            value: None,
        }
    }

    pub fn interior(timestamp: Timestamp, path: Vec<String>) -> Self {
        Self {
            timestamp,
            action: TlogAction::InteriorTimestamp,
            path,
            value: None,
        }
    }

    /// Render without the trailing newline.
    pub fn to_line(&self) -> String {
        let path = serde_json::Value::Array(
            self.path
                .iter()
                .map(|s| serde_json::Value::String(s.clone()))
                .collect(),
        );
        match &self.value {
            Some(value) => format!(
                "T {} {} {} {}",
                self.timestamp,
                self.action.as_str(),
                path,
                value.to_json()
            ),
            None => format!("T {} {} {}", self.timestamp, self.action.as_str(), path),
        }
    }

    /// Parse one line. `line_no` is 1-based and only feeds diagnostics.
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let bad = |reason: String| StoreError::Decode {
            line: line_no,
            reason,
        };

        let rest = line
            .strip_prefix("T ")
            .ok_or_else(|| bad("missing record marker".to_string()))?;
        let (ts_token, rest) = rest
            .split_once(' ')
            .ok_or_else(|| bad("truncated record".to_string()))?;
        let timestamp: Timestamp = ts_token
            .parse()
            .map_err(|_| bad(format!("bad timestamp {ts_token:?}")))?;
        let (action_token, rest) = rest
            .split_once(' ')
            .ok_or_else(|| bad("truncated record".to_string()))?;
        let action = TlogAction::parse(action_token)
            .ok_or_else(|| bad(format!("unknown action {action_token:?}")))?;

        // The path array and the optional value are two concatenated
        // JSON documents; the stream deserializer splits them.
        let mut docs = serde_json::Deserializer::from_str(rest).into_iter::<serde_json::Value>();
        let path_doc = docs
            .next()
            .ok_or_else(|| bad("missing path".to_string()))?
            .map_err(|e| bad(format!("bad path: {e}")))?;
        let serde_json::Value::Array(segments) = path_doc else {
            return Err(bad("path is not an array".to_string()));
        };
        let mut path = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                serde_json::Value::String(s) => path.push(s),
                other => return Err(bad(format!("path segment is not a string: {other}"))),
            }
        }

        let value_doc = match docs.next() {
            Some(Ok(doc)) => Some(doc),
            Some(Err(e)) => return Err(bad(format!("bad value: {e}"))),
            None => None,
        };

        match (action, value_doc) {
            (TlogAction::WriteLeaf, Some(doc)) => {
                let value = ConfigValue::from_json(&doc)
                    .ok_or_else(|| bad(format!("value is not leaf material: {doc}")))?;
                Ok(Self::write(timestamp, path, value))
            }
            (TlogAction::WriteLeaf, None) => Err(bad("leaf write without a value".to_string())),
            (TlogAction::RemoveNode, None) => Ok(Self::remove(timestamp, path)),
            (TlogAction::InteriorTimestamp, None) => Ok(Self::interior(timestamp, path)),
            (_, Some(_)) => Err(bad("unexpected value payload".to_string())),
        }
    }
}
