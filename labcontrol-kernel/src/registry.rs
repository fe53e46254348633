/**
 * REGISTRE DE PROCESSUS - Processus auxiliaires de longue durée (webterms)
 *
 * RÔLE : Document JSON unique `webterm-<carte>` -> {pid, commande, début}.
 * FONCTIONNEMENT : Relu à chaque appel ; le mutex ne sérialise que ce serveur.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{LabError, LabResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: i32,
    pub command: String,
    pub started: String,
}

type Entries = BTreeMap<String, ProcessEntry>;

pub struct ProcessRegistry {
    path: PathBuf,
    update: Mutex<()>,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update: Mutex::new(()),
        }
    }

    async fn load(&self) -> LabResult<Entries> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => return Err(LabError::io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Entries::new());
        }
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "process registry unreadable, starting empty");
                Ok(Entries::new())
            }
        }
    }

    async fn save(&self, entries: &Entries) -> LabResult<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| LabError::io(dir, e))?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| LabError::io(&self.path, e))
    }

    pub async fn get(&self, key: &str) -> LabResult<Option<ProcessEntry>> {
        Ok(self.load().await?.remove(key))
    }

    pub async fn entries(&self) -> LabResult<Vec<(String, ProcessEntry)>> {
        Ok(self.load().await?.into_iter().collect())
    }

    pub async fn insert(&self, key: &str, entry: ProcessEntry) -> LabResult<()> {
        let _guard = self.update.lock().await;
        let mut entries = self.load().await?;
        debug!(key, pid = entry.pid, "registering auxiliary process");
        entries.insert(key.to_string(), entry);
        self.save(&entries).await
    }

    pub async fn remove(&self, key: &str) -> LabResult<Option<ProcessEntry>> {
        let _guard = self.update.lock().await;
        let mut entries = self.load().await?;
        let removed = entries.remove(key);
        if removed.is_some() {
            self.save(&entries).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32) -> ProcessEntry {
        ProcessEntry {
            pid,
            command: "ssh root@10.0.0.5".into(),
            started: "2024-03-01 12:00:00".into(),
        }
    }

    #[tokio::test]
    async fn entries_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/process-registry.json");

        let reg = ProcessRegistry::new(&path);
        assert!(reg.get("webterm-bbb").await.unwrap().is_none());
        reg.insert("webterm-bbb", entry(4242)).await.unwrap();
        reg.insert("webterm-rpi", entry(4343)).await.unwrap();

        let reopened = ProcessRegistry::new(&path);
        assert_eq!(reopened.get("webterm-bbb").await.unwrap(), Some(entry(4242)));
        assert_eq!(reopened.entries().await.unwrap().len(), 2);

        assert_eq!(reopened.remove("webterm-bbb").await.unwrap(), Some(entry(4242)));
        assert!(reopened.remove("webterm-bbb").await.unwrap().is_none());
        assert!(reg.get("webterm-bbb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_registry_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process-registry.json");
        std::fs::write(&path, "{not json").unwrap();
        let reg = ProcessRegistry::new(&path);
        assert!(reg.entries().await.unwrap().is_empty());
    }
}
