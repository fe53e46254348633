use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{validate_name, ObjectKind, ObjectStore, Record};
use crate::error::{LabError, LabResult};

/// One JSON document per record: `<data_dir>/<kind>s/<kind>-<name>.json`
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn kind_dir(&self, kind: ObjectKind) -> PathBuf {
        self.data_dir.join(format!("{}s", kind.as_str()))
    }

    fn record_path(&self, kind: ObjectKind, name: &str) -> LabResult<PathBuf> {
        validate_name(kind.as_str(), name)?;
        Ok(self
            .kind_dir(kind)
            .join(format!("{}-{}.json", kind.as_str(), name)))
    }
}

/// Pretty JSON with 4-space indentation, keys already sorted by the map
fn to_pretty_json(value: &serde_json::Value) -> LabResult<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}

fn write_replace(path: &Path, content: &[u8]) -> LabResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|e| LabError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| LabError::io(path, e))
}

impl ObjectStore for FileStore {
    fn get(&self, kind: ObjectKind, name: &str) -> LabResult<Record> {
        let path = self.record_path(kind, name)?;
        if !path.is_file() {
            return Err(LabError::not_found(kind.as_str(), name));
        }
        let content = fs::read_to_string(&path).map_err(|e| LabError::io(&path, e))?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let record = Record::from_json(value)?;
        if record.name() != name {
            warn!(kind = %kind, file = %path.display(), inner = record.name(), "record name does not match its file name");
        }
        Ok(record)
    }

    fn list(&self, kind: ObjectKind) -> LabResult<Vec<String>> {
        let dir = self.kind_dir(kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-", kind.as_str());
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| LabError::io(&dir, e))? {
            let entry = entry.map_err(|e| LabError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn put(&self, kind: ObjectKind, record: &Record) -> LabResult<()> {
        let path = self.record_path(kind, record.name())?;
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).map_err(|e| LabError::io(&dir, e))?;
        write_replace(&path, &to_pretty_json(&record.to_json())?)?;
        debug!(kind = %kind, name = record.name(), "record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_list_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let board = Record::new("bbb").with("power_controller", "pdu1");
        store.put(ObjectKind::Board, &board).unwrap();
        store.put(ObjectKind::Board, &Record::new("rpi4")).unwrap();

        let on_disk = dir.path().join("boards/board-bbb.json");
        let text = std::fs::read_to_string(on_disk).unwrap();
        assert!(text.contains("    \"power_controller\": \"pdu1\""));

        assert_eq!(store.get(ObjectKind::Board, "bbb").unwrap(), board);
        assert_eq!(store.list(ObjectKind::Board).unwrap(), vec!["bbb", "rpi4"]);
        assert_eq!(
            store.list_matching(ObjectKind::Board, "rp*").unwrap(),
            vec!["rpi4"]
        );
    }

    #[test]
    fn unknown_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let err = store.get(ObjectKind::Resource, "pdu9").unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(store.list(ObjectKind::Resource).unwrap().is_empty());
    }

    #[test]
    fn stray_files_are_ignored_by_list() {
        let dir = tempfile::tempdir().unwrap();
        let boards = dir.path().join("boards");
        std::fs::create_dir_all(&boards).unwrap();
        std::fs::write(boards.join("README"), "x").unwrap();
        std::fs::write(boards.join("board-.json"), "{}").unwrap();
        std::fs::write(
            boards.join("board-bbb.json"),
            json!({"name": "bbb"}).to_string(),
        )
        .unwrap();

        let store = FileStore::new(dir.path());
        assert_eq!(store.list(ObjectKind::Board).unwrap(), vec!["bbb"]);
    }

    #[test]
    fn path_traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let err = store.get(ObjectKind::Board, "../users/user-admin").unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}
