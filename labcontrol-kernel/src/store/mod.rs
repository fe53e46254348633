/**
 * OBJECT STORE - Persistance des cartes, ressources et utilisateurs
 *
 * RÔLE : Un document JSON par enregistrement, dernier écrivain gagnant.
 * ARCHITECTURE : Trait `ObjectStore` + `FileStore` (disque) + `MemoryStore` (tests).
 * LIMITE : Aucune transaction ni verrou entre documents.
 */

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::error::{LabError, LabResult};

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Board,
    Resource,
    User,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Board => "board",
            ObjectKind::Resource => "resource",
            ObjectKind::User => "user",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named document: string keys mapped to strings, lists of strings or scalars
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    name: String,
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(name.clone()));
        Self { name, fields }
    }

    /// Builds a record from a JSON object; the object must carry a `name`
    pub fn from_json(value: Value) -> LabResult<Self> {
        let Value::Object(fields) = value else {
            return Err(LabError::invalid("record", "expected a JSON object"));
        };
        let name = fields
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| LabError::invalid("record", "missing 'name' field"))?
            .to_string();
        Ok(Self { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Reads a field that may be a single string or a list of strings
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key == "name" {
            return;
        }
        self.fields.insert(key, value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Scalar attributes rendered as strings, the variable set for interpolation
    pub fn string_attrs(&self) -> HashMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), s))
            })
            .collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Persistence contract consumed by the reservation and capture managers
pub trait ObjectStore: Send + Sync {
    fn get(&self, kind: ObjectKind, name: &str) -> LabResult<Record>;
    fn list(&self, kind: ObjectKind) -> LabResult<Vec<String>>;
    fn put(&self, kind: ObjectKind, record: &Record) -> LabResult<()>;

    /// Names matching a simple wildcard pattern (`*`, `prefix*`, `*suffix`)
    fn list_matching(&self, kind: ObjectKind, pattern: &str) -> LabResult<Vec<String>> {
        Ok(self
            .list(kind)?
            .into_iter()
            .filter(|name| item_match(pattern, name))
            .collect())
    }
}

pub fn item_match(pattern: &str, item: &str) -> bool {
    if pattern == "*" || pattern == item {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if item.starts_with(prefix) {
            return true;
        }
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if item.ends_with(suffix) {
            return true;
        }
    }
    false
}

/// Checks a caller-supplied name before it becomes part of a file path
pub fn validate_name(field: &str, name: &str) -> LabResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(LabError::invalid(field, "must be 1-128 characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(LabError::invalid(field, "must not start with '.' or '-'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(LabError::invalid(
            field,
            format!("'{name}' contains characters outside [A-Za-z0-9._-]"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_matching() {
        assert!(item_match("*", "bbb"));
        assert!(item_match("bbb", "bbb"));
        assert!(item_match("rpi*", "rpi4"));
        assert!(item_match("*-pdu", "lab-pdu"));
        assert!(!item_match("rpi*", "bbb"));
        assert!(!item_match("*-pdu", "pdu-lab"));
    }

    #[test]
    fn record_lists_accept_string_or_array() {
        let rec = Record::from_json(json!({
            "name": "bbb",
            "serial_endpoints": ["serial0", "serial1"],
            "camera": "cam0",
            "baud": 115200
        }))
        .unwrap();
        assert_eq!(rec.get_list("serial_endpoints"), vec!["serial0", "serial1"]);
        assert_eq!(rec.get_list("camera"), vec!["cam0"]);
        assert!(rec.get_list("audio").is_empty());
        assert_eq!(rec.string_attrs()["baud"], "115200");
        assert!(!rec.string_attrs().contains_key("serial_endpoints"));
    }

    #[test]
    fn record_requires_name() {
        assert!(Record::from_json(json!({"type": "serial"})).is_err());
        assert!(Record::from_json(json!(["bbb"])).is_err());
    }

    #[test]
    fn record_name_is_immutable() {
        let rec = Record::new("bbb").with("name", "other");
        assert_eq!(rec.name(), "bbb");
        assert_eq!(rec.get_str("name"), Some("bbb"));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("board", "bbb-1.lab_2").is_ok());
        assert!(validate_name("board", "../etc").is_err());
        assert!(validate_name("board", "a/b").is_err());
        assert!(validate_name("board", "").is_err());
        assert!(validate_name("board", "-rf").is_err());
        assert!(validate_name("board", "a b").is_err());
    }
}
