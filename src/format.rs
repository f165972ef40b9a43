//! Event formatting
//!
//! Pure, deterministic functions computing the subject, action, source and
//! ETag of an event from configuration and an entity snapshot. No I/O, no
//! clocks, no randomness: identical inputs always format identically.

use crate::change::OperationKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Divider between canonical entity text and extra ETag parts. Reserved:
/// must not occur in observable field values.
pub const ETAG_DIVIDER: char = '\u{1F}';

/// How the event subject is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectFormat {
    /// Table name only
    NameOnly,
    /// Table name + separator + primary key
    NameAndKey,
    /// Table name + separator + external table key (primary key when absent)
    NameAndTableKey,
}

/// How the event action is conjugated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFormat {
    /// Operation verb as-is
    None,
    /// English past tense of the operation verb
    PastTense,
}

/// How the event source URI is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// No source
    None,
    /// Base URI only
    NameOnly,
    /// Base URI + "/" + primary key
    NameAndKey,
    /// Base URI + "/" + external table key (primary key when absent)
    NameAndTableKey,
}

/// Formatting configuration for one entity.
#[derive(Debug, Clone)]
pub struct FormatterConfig {
    pub subject_format: SubjectFormat,
    pub action_format: ActionFormat,
    pub source_format: SourceFormat,
    /// Separator between table name and key in subjects
    pub separator: String,
    /// Base URI for sources; absolute or relative
    pub base_uri: String,
    /// Volatile fields excluded from ETag canonicalization
    pub etag_excluded: Vec<String>,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            subject_format: SubjectFormat::NameOnly,
            action_format: ActionFormat::PastTense,
            source_format: SourceFormat::None,
            separator: ".".to_string(),
            base_uri: String::new(),
            etag_excluded: Vec::new(),
        }
    }
}

impl FormatterConfig {
    pub fn subject_format(mut self, format: SubjectFormat) -> Self {
        self.subject_format = format;
        self
    }

    pub fn action_format(mut self, format: ActionFormat) -> Self {
        self.action_format = format;
        self
    }

    pub fn source_format(mut self, format: SourceFormat) -> Self {
        self.source_format = format;
        self
    }

    pub fn separator(mut self, sep: impl Into<String>) -> Self {
        self.separator = sep.into();
        self
    }

    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.base_uri = uri.into();
        self
    }

    pub fn etag_excluded(mut self, fields: Vec<String>) -> Self {
        self.etag_excluded = fields;
        self
    }
}

/// Compute the event subject.
pub fn subject(
    format: SubjectFormat,
    separator: &str,
    table_name: &str,
    primary_key: &str,
    table_key: Option<&str>,
) -> String {
    match format {
        SubjectFormat::NameOnly => table_name.to_string(),
        SubjectFormat::NameAndKey => format!("{table_name}{separator}{primary_key}"),
        SubjectFormat::NameAndTableKey => {
            format!("{table_name}{separator}{}", table_key.unwrap_or(primary_key))
        }
    }
}

/// Compute the event action.
pub fn action(format: ActionFormat, op: OperationKind) -> String {
    match format {
        ActionFormat::None => op.verb().to_string(),
        ActionFormat::PastTense => past_tense(op.verb()),
    }
}

/// English past tense of a verb. Irregular verbs are looked up, regular
/// verbs follow the usual orthographic rules.
pub fn past_tense(verb: &str) -> String {
    // Irregulars that plausibly appear as operation verbs.
    match verb {
        "send" => return "sent".to_string(),
        "set" => return "set".to_string(),
        "put" => return "put".to_string(),
        "read" => return "read".to_string(),
        "write" => return "written".to_string(),
        "make" => return "made".to_string(),
        "do" => return "done".to_string(),
        "undo" => return "undone".to_string(),
        "none" => return "none".to_string(),
        _ => {}
    }

    let mut chars: Vec<char> = verb.chars().collect();
    match chars.last() {
        Some('e') => format!("{verb}d"),
        Some('y') => {
            // consonant + y -> -ied; vowel + y -> -yed
            let vowel_before = chars
                .get(chars.len().saturating_sub(2))
                .is_some_and(|c| "aeiou".contains(*c));
            if vowel_before {
                format!("{verb}ed")
            } else {
                chars.pop();
                format!("{}ied", chars.into_iter().collect::<String>())
            }
        }
        _ => format!("{verb}ed"),
    }
}

/// Compute the event source URI, preserving absolute vs relative base kind.
pub fn source(format: SourceFormat, base_uri: &str, key: &str) -> Option<String> {
    match format {
        SourceFormat::None => None,
        SourceFormat::NameOnly => Some(base_uri.to_string()),
        SourceFormat::NameAndKey | SourceFormat::NameAndTableKey => {
            match Url::parse(base_uri) {
                Ok(mut url) => {
                    // Absolute base: append a path segment with proper
                    // encoding.
                    if let Ok(mut segments) = url.path_segments_mut() {
                        segments.pop_if_empty().push(key);
                    }
                    Some(url.to_string())
                }
                Err(_) => {
                    // Relative base: plain path concatenation.
                    let base = base_uri.trim_end_matches('/');
                    Some(format!("{base}/{key}"))
                }
            }
        }
    }
}

/// Compute a deterministic ETag for an entity snapshot.
///
/// The snapshot is canonicalized (object keys sorted, excluded fields
/// removed at every level, keys and string values JSON-quoted so distinct
/// structures never share a canonical form), extra parts are appended
/// behind the reserved divider, and the whole is hashed with SHA-256.
pub fn etag(entity: &serde_json::Value, excluded: &[String], extra_parts: &[&str]) -> String {
    let mut canonical = String::new();
    write_canonical(entity, excluded, &mut canonical);
    for part in extra_parts {
        canonical.push(ETAG_DIVIDER);
        canonical.push_str(part);
    }

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn write_canonical(value: &serde_json::Value, excluded: &[String], out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !excluded.iter().any(|e| e == *k))
                .collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push('=');
                write_canonical(&map[key.as_str()], excluded, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, excluded, out);
            }
            out.push(']');
        }
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => write_json_string(s, out),
    }
}

/// Write `s` as a JSON string literal.
///
/// Quoting keeps `"null"` distinct from `null` and a value containing the
/// canonical punctuation distinct from the punctuation itself; escaping
/// control characters keeps the reserved divider out of the entity text.
fn write_json_string(s: &str, out: &mut String) {
    use std::fmt::Write;
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subject_formats() {
        assert_eq!(
            subject(SubjectFormat::NameOnly, ".", "Legacy.Contact", "42", None),
            "Legacy.Contact"
        );
        assert_eq!(
            subject(SubjectFormat::NameAndKey, ".", "Legacy.Contact", "42", None),
            "Legacy.Contact.42"
        );
        assert_eq!(
            subject(
                SubjectFormat::NameAndTableKey,
                "/",
                "Legacy.Contact",
                "42",
                Some("ext-9")
            ),
            "Legacy.Contact/ext-9"
        );
        // Falls back to the primary key when no table key exists
        assert_eq!(
            subject(SubjectFormat::NameAndTableKey, ".", "T", "42", None),
            "T.42"
        );
    }

    #[test]
    fn test_action_formats() {
        assert_eq!(action(ActionFormat::None, OperationKind::Insert), "create");
        assert_eq!(
            action(ActionFormat::PastTense, OperationKind::Insert),
            "created"
        );
        assert_eq!(
            action(ActionFormat::PastTense, OperationKind::Update),
            "updated"
        );
        assert_eq!(
            action(ActionFormat::PastTense, OperationKind::Delete),
            "deleted"
        );
    }

    #[test]
    fn test_past_tense_rules() {
        assert_eq!(past_tense("create"), "created"); // trailing e
        assert_eq!(past_tense("update"), "updated");
        assert_eq!(past_tense("modify"), "modified"); // consonant + y
        assert_eq!(past_tense("destroy"), "destroyed"); // vowel + y
        assert_eq!(past_tense("insert"), "inserted");
    }

    #[test]
    fn test_past_tense_irregulars() {
        assert_eq!(past_tense("send"), "sent");
        assert_eq!(past_tense("set"), "set");
        assert_eq!(past_tense("put"), "put");
        assert_eq!(past_tense("write"), "written");
        assert_eq!(past_tense("do"), "done");
    }

    #[test]
    fn test_source_formats() {
        assert_eq!(source(SourceFormat::None, "https://api.example.com", "42"), None);
        assert_eq!(
            source(SourceFormat::NameOnly, "https://api.example.com/contacts", "42"),
            Some("https://api.example.com/contacts".to_string())
        );
        assert_eq!(
            source(SourceFormat::NameAndKey, "https://api.example.com/contacts", "42"),
            Some("https://api.example.com/contacts/42".to_string())
        );
        // Trailing slash on an absolute base does not double up
        assert_eq!(
            source(SourceFormat::NameAndKey, "https://api.example.com/contacts/", "42"),
            Some("https://api.example.com/contacts/42".to_string())
        );
    }

    #[test]
    fn test_source_relative_base_preserved() {
        assert_eq!(
            source(SourceFormat::NameAndKey, "/contacts", "42"),
            Some("/contacts/42".to_string())
        );
        assert_eq!(
            source(SourceFormat::NameAndTableKey, "contacts/", "ext-9"),
            Some("contacts/ext-9".to_string())
        );
    }

    #[test]
    fn test_etag_deterministic() {
        let a = json!({"Name": "Alice", "Age": 30});
        let b = json!({"Age": 30, "Name": "Alice"});
        assert_eq!(etag(&a, &[], &[]), etag(&b, &[], &[]));
    }

    #[test]
    fn test_etag_observable_change_changes_digest() {
        let a = json!({"Name": "Alice", "Age": 30});
        let b = json!({"Name": "Alice", "Age": 31});
        assert_ne!(etag(&a, &[], &[]), etag(&b, &[], &[]));
    }

    #[test]
    fn test_etag_excludes_volatile_fields() {
        let excluded = vec!["ModifiedAt".to_string()];
        let a = json!({"Name": "Alice", "ModifiedAt": "2026-01-01"});
        let b = json!({"Name": "Alice", "ModifiedAt": "2026-06-30"});
        assert_eq!(etag(&a, &excluded, &[]), etag(&b, &excluded, &[]));
    }

    #[test]
    fn test_etag_extra_parts() {
        let entity = json!({"Name": "Alice"});
        let plain = etag(&entity, &[], &[]);
        let with_part = etag(&entity, &[], &["v2"]);
        assert_ne!(plain, with_part);
        // Divider prevents ambiguity between joined parts
        assert_ne!(etag(&entity, &[], &["ab", "c"]), etag(&entity, &[], &["a", "bc"]));
    }

    #[test]
    fn test_etag_nested_exclusion() {
        let excluded = vec!["Volatile".to_string()];
        let a = json!({"Name": "A", "Child": {"Volatile": 1, "Kept": true}});
        let b = json!({"Name": "A", "Child": {"Volatile": 2, "Kept": true}});
        assert_eq!(etag(&a, &excluded, &[]), etag(&b, &excluded, &[]));
    }

    #[test]
    fn test_etag_string_values_are_quoted() {
        // A value containing the canonical punctuation must not collide
        // with the structure that punctuation would describe.
        let a = json!({"a": "b,c=d"});
        let b = json!({"a": "b", "c": "d"});
        assert_ne!(etag(&a, &[], &[]), etag(&b, &[], &[]));

        // null and the string "null" are different observable values.
        assert_ne!(
            etag(&json!({"a": null}), &[], &[]),
            etag(&json!({"a": "null"}), &[], &[])
        );
        assert_ne!(
            etag(&json!({"a": 1}), &[], &[]),
            etag(&json!({"a": "1"}), &[], &[])
        );
    }

    #[test]
    fn test_etag_divider_never_raw_in_entity_text() {
        // Control characters (the divider included) are escaped inside
        // keys and string values, so only extra parts sit behind a raw
        // divider.
        let with_divider_value = json!({"a": "x\u{1F}v2"});
        let with_part = etag(&json!({"a": "x"}), &[], &["v2"]);
        assert_ne!(etag(&with_divider_value, &[], &[]), with_part);

        let mut canonical = String::new();
        write_canonical(&json!({"k\u{1F}": "v\u{1F}"}), &[], &mut canonical);
        assert!(!canonical.contains(ETAG_DIVIDER));
        assert!(canonical.contains("\\u001f"));
    }

    #[test]
    fn test_etag_is_hex_sha256() {
        let digest = etag(&json!({"a": 1}), &[], &[]);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
