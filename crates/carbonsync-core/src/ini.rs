//! Minimal INI reader for `storage-schemas.conf` / `storage-aggregation.conf`.
//!
//! Sections keep file order. Keys are lowercased; `#` and `;` start comment
//! lines. Duplicate keys in one section keep the last value.

use std::collections::BTreeMap;

use crate::error::SchemaError;

/// One `[name]` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    /// 1-based line of the section header.
    pub line: usize,
    pub entries: BTreeMap<String, String>,
}

impl IniSection {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

pub fn parse(text: &str) -> Result<Vec<IniSection>, SchemaError> {
    let mut sections: Vec<IniSection> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| SchemaError::Syntax {
                line: line_no,
                message: format!("unterminated section header {line:?}"),
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(SchemaError::Syntax {
                    line: line_no,
                    message: "empty section name".to_string(),
                });
            }
            sections.push(IniSection {
                name: name.to_string(),
                line: line_no,
                entries: BTreeMap::new(),
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| SchemaError::Syntax {
            line: line_no,
            message: format!("expected `key = value`, got {line:?}"),
        })?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(SchemaError::Syntax {
                line: line_no,
                message: "empty key".to_string(),
            });
        }
        let section = sections.last_mut().ok_or_else(|| SchemaError::Syntax {
            line: line_no,
            message: format!("key {key:?} outside of any section"),
        })?;
        section.entries.insert(key, value.trim().to_string());
    }

    Ok(sections)
}
