//! Filesystem Store backend: one YAML file per entity under
//! `<root>/<plural>/<sanitized-name>.yaml`, watched by a directory watch
//! plus a periodic rescan to cover events the watcher misses.

use super::{EntityKey, EntityKind, Store, StoreEvent, StoreEventKind, StoredEntity};
use crate::error::{Error, Result};
use async_trait::async_trait;
use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{error, warn};

const RESCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const NAMESPACE: &str = "default";

#[derive(Debug, Serialize, Deserialize, Default)]
struct EntityDocument {
    #[serde(default)]
    spec: serde_json::Value,
    #[serde(default)]
    status: serde_json::Value,
}

/// Replaces anything but lowercase letters/digits/hyphens/underscores with
/// `_`, collapses runs, trims the edges, and falls back to `unnamed`.
pub fn sanitize_filename(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_underscore = false;
    for c in lowered.chars() {
        let keep = c.is_ascii_alphanumeric() || c == '-' || c == '_';
        let c = if keep { c } else { '_' };
        if c == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Appends a numeric suffix when sanitization collides two distinct
/// input names onto the same filename, rather than silently overwriting.
fn unique_path(dir: &Path, base: &str, taken: &HashMap<PathBuf, String>, original_name: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{base}.yaml"));
    if !taken.contains_key(&candidate) || taken.get(&candidate).map(String::as_str) == Some(original_name) {
        return candidate;
    }
    let mut n = 2;
    loop {
        candidate = dir.join(format!("{base}_{n}.yaml"));
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub struct FsStore {
    root: PathBuf,
    events: broadcast::Sender<StoreEvent>,
    /// Remembers which original name sanitized to which file, per kind,
    /// so collisions append a suffix instead of clobbering.
    name_index: Mutex<HashMap<EntityKind, HashMap<PathBuf, String>>>,
}

impl FsStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        for kind in EntityKind::all() {
            tokio::fs::create_dir_all(root.join(kind.plural())).await?;
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self { root, events, name_index: Mutex::new(HashMap::new()) })
    }

    fn dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.plural())
    }

    async fn read_entity(path: &Path, kind: EntityKind) -> Result<StoredEntity> {
        let raw = tokio::fs::read_to_string(path).await?;
        let doc: EntityDocument = serde_yaml_ng::from_str(&raw)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::InvariantViolation(format!("non-utf8 store filename: {}", path.display())))?
            .to_string();
        Ok(StoredEntity {
            key: EntityKey { kind, namespace: NAMESPACE.to_string(), name },
            spec: doc.spec,
            status: doc.status,
        })
    }

    fn path_for_name(&self, kind: EntityKind, name: &str) -> Result<PathBuf> {
        let dir = self.dir(kind);
        let base = sanitize_filename(name);
        let mut index = self.name_index.lock().expect("name index poisoned");
        let taken = index.entry(kind).or_default();
        if let Some((existing_path, _)) =
            taken.iter().find(|(_, original)| original.as_str() == name)
        {
            return Ok(existing_path.clone());
        }
        let path = unique_path(&dir, &base, taken, name);
        taken.insert(path.clone(), name.to_string());
        Ok(path)
    }

    /// Writes `content` atomically: write to a sibling temp file, then
    /// rename over the target, so a crash mid-write never leaves a
    /// partial document where readers expect a complete one.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Spawns the directory watcher plus periodic rescan for one entity
    /// kind. Mirrors the teacher's file-watch pattern: a std-thread
    /// callback feeds a std channel, a background task bridges it onto
    /// the broadcast channel subscribers see.
    pub fn spawn_watch(&self, kind: EntityKind) -> Result<()> {
        let dir = self.dir(kind);
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<NotifyEvent, notify::Error>| {
                if let Err(e) = tx.send(result) {
                    error!("store watch event send failed: {e}");
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let events = self.events.clone();
        std::thread::spawn(move || {
            let _watcher = watcher; // keep alive for the thread's lifetime
            while let Ok(result) = rx.recv() {
                match result {
                    Ok(event) => {
                        if let Some(store_event) = classify(kind, &event) {
                            let _ = events.send(store_event);
                        }
                    }
                    Err(e) => warn!("store watch error: {e}"),
                }
            }
        });

        let rescan_root = dir.clone();
        let rescan_events = self.events.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESCAN_INTERVAL);
            loop {
                interval.tick().await;
                if let Ok(mut entries) = tokio::fs::read_dir(&rescan_root).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                            let _ = rescan_events.send(StoreEvent::Changed {
                                key: EntityKey { kind, namespace: NAMESPACE.to_string(), name: name.to_string() },
                                kind: StoreEventKind::Modified,
                            });
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

fn classify(kind: EntityKind, event: &NotifyEvent) -> Option<StoreEvent> {
    use notify::EventKind;
    let path = event.paths.first()?;
    if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
        return None;
    }
    let name = path.file_stem()?.to_str()?.to_string();
    let key = EntityKey { kind, namespace: NAMESPACE.to_string(), name };
    let event_kind = match event.kind {
        EventKind::Create(_) => StoreEventKind::Added,
        EventKind::Modify(_) => StoreEventKind::Modified,
        EventKind::Remove(_) => StoreEventKind::Deleted,
        _ => return None,
    };
    Some(StoreEvent::Changed { key, kind: event_kind })
}

#[async_trait]
impl Store for FsStore {
    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.dir(kind)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                out.push(Self::read_entity(&path, kind).await?);
            }
        }
        Ok(out)
    }

    async fn get(&self, kind: EntityKind, _namespace: &str, name: &str) -> Result<StoredEntity> {
        let path = self.path_for_name(kind, name)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(name.to_string()));
        }
        Self::read_entity(&path, kind).await
    }

    async fn watch(&self, _kind: EntityKind) -> Result<super::StoreSubscription> {
        Ok(super::StoreSubscription::new(self.events.subscribe()))
    }

    async fn update_status(&self, kind: EntityKind, _namespace: &str, name: &str, status: serde_json::Value) -> Result<()> {
        let path = self.path_for_name(kind, name)?;
        let mut doc = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_yaml_ng::from_str(&raw)?
        } else {
            EntityDocument::default()
        };
        doc.status = status;
        let rendered = serde_yaml_ng::to_string(&doc)?;
        Self::write_atomic(&path, &rendered).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_filename("My Server/v1:test"), "my_server_v1_test");
        assert_eq!(sanitize_filename("   "), "unnamed");
        assert_eq!(sanitize_filename("a///b"), "a_b");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_spec() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf()).await.unwrap();

        let path = store.path_for_name(EntityKind::McpServer, "My Server").unwrap();
        let doc = EntityDocument { spec: serde_json::json!({"transport": "stdio"}), status: serde_json::Value::Null };
        let rendered = serde_yaml_ng::to_string(&doc).unwrap();
        FsStore::write_atomic(&path, &rendered).await.unwrap();

        let loaded = store.get(EntityKind::McpServer, "default", "My Server").await.unwrap();
        assert_eq!(loaded.spec["transport"], "stdio");
    }

    #[tokio::test]
    async fn collision_gets_numeric_suffix_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf()).await.unwrap();

        let a = store.path_for_name(EntityKind::Workflow, "a/b").unwrap();
        let b = store.path_for_name(EntityKind::Workflow, "a:b").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn update_status_preserves_existing_spec() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf()).await.unwrap();

        store
            .update_status(EntityKind::McpServer, "default", "srv", serde_json::json!({"state": "Running"}))
            .await
            .unwrap();
        let path = store.path_for_name(EntityKind::McpServer, "srv").unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: EntityDocument = serde_yaml_ng::from_str(&raw).unwrap();
        assert_eq!(doc.status["state"], "Running");
    }
}
