/*!
Record builders and helper scripts for lab tests.
*/

use labcontrol_kernel::store::Record;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Board record with a free reservation
pub struct BoardBuilder {
    record: Record,
}

impl BoardBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            record: Record::new(name)
                .with("AssignedTo", "nobody")
                .with("start_time", "unknown")
                .with("end_time", "unknown"),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.record.set(key, value);
        self
    }

    pub fn power_controller(self, resource: &str) -> Self {
        self.attr("power_controller", resource)
    }

    pub fn serial(self, resources: &[&str]) -> Self {
        self.attr("serial_endpoints", json!(resources))
    }

    pub fn build(self) -> Record {
        self.record
    }
}

pub struct ResourceBuilder {
    record: Record,
}

impl ResourceBuilder {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            record: Record::new(name).with("type", kind),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.record.set(key, value);
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

pub fn user(name: &str, token: &str, admin: bool) -> Record {
    Record::new(name)
        .with("auth_token", token)
        .with("admin", admin)
}

/// Writes an executable `/bin/sh` script
pub fn write_script(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
