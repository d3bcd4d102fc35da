//! Append-only JSON artifact store.
//!
//! Every artifact lands in its own `<timestamp>-<id>.json` file. Keys sort
//! chronologically, files are published with an exclusive hard link and are
//! never rewritten.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::records::ArtifactRef;
use crate::error::GateError;

const KEY_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

static ARTIFACT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate an artifact id unique within this host (`<prefix>-<pid>-<seq>`).
pub fn next_artifact_id(prefix: &str) -> String {
    let seq = ARTIFACT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{seq:06}", std::process::id())
}

/// An artifact read back from a store.
#[derive(Debug, Clone)]
pub struct StoredArtifact<T> {
    pub reference: ArtifactRef,
    pub record: T,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `record` under a new key. Fails rather than overwrite an existing file.
    pub fn append<T: Serialize>(
        &self,
        timestamp: DateTime<Utc>,
        id: &str,
        record: &T,
    ) -> Result<ArtifactRef> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let key = format!("{}-{id}", timestamp.format(KEY_TIME_FORMAT));
        let path = self.path_for(&key);
        let mut buf = serde_json::to_string_pretty(record).context("serialize artifact")?;
        buf.push('\n');

        let tmp_path = self.dir.join(format!(".{key}.tmp"));
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp artifact {}", tmp_path.display()))?;
        let linked = fs::hard_link(&tmp_path, &path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "artifact {} already exists (append-only store)",
                    path.display()
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("publish artifact {}", path.display()));
            }
        }

        debug!(path = %path.display(), "artifact written");
        Ok(ArtifactRef {
            key,
            sha256: sha256_hex(buf.as_bytes()),
        })
    }

    /// All keys in chronological order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read artifact dir {}", self.dir.display()));
            }
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.context("read artifact dir entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<StoredArtifact<T>> {
        let path = self.path_for(key);
        let bytes = fs::read(&path).with_context(|| format!("read artifact {}", path.display()))?;
        let record = serde_json::from_slice(&bytes).map_err(|err| GateError::Unparseable {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Ok(StoredArtifact {
            reference: ArtifactRef {
                key: key.to_string(),
                sha256: sha256_hex(&bytes),
            },
            record,
        })
    }

    /// The most recent artifact, if any. An unparseable latest file is an error.
    pub fn latest<T: DeserializeOwned>(&self) -> Result<Option<StoredArtifact<T>>> {
        match self.keys()?.last() {
            Some(key) => self.read(key).map(Some),
            None => Ok(None),
        }
    }

    /// Every artifact, oldest first.
    pub fn all<T: DeserializeOwned>(&self) -> Result<Vec<StoredArtifact<T>>> {
        self.keys()?.iter().map(|key| self.read(key)).collect()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, classify};
    use chrono::Duration;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
        }
    }

    #[test]
    fn latest_follows_timestamp_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path().join("hk"));
        let now = Utc::now();
        store.append(now, "b", &note("newer")).expect("append");
        store
            .append(now - Duration::hours(1), "a", &note("older"))
            .expect("append");

        let latest = store.latest::<Note>().expect("latest").expect("present");
        assert_eq!(latest.record, note("newer"));
        assert_eq!(store.keys().expect("keys").len(), 2);
    }

    #[test]
    fn reference_digest_matches_file_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let reference = store.append(Utc::now(), "x", &note("hi")).expect("append");
        let bytes = fs::read(temp.path().join(format!("{}.json", reference.key))).expect("read");
        assert_eq!(reference.sha256, sha256_hex(&bytes));
        let read = store.read::<Note>(&reference.key).expect("read back");
        assert_eq!(read.reference, reference);
    }

    #[test]
    fn same_key_is_never_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let now = Utc::now();
        store.append(now, "dup", &note("first")).expect("append");
        let err = store.append(now, "dup", &note("second")).unwrap_err();
        assert!(err.to_string().contains("append-only"));
        let latest = store.latest::<Note>().expect("latest").expect("present");
        assert_eq!(latest.record, note("first"));
    }

    #[test]
    fn empty_or_missing_store_has_no_latest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path().join("missing"));
        assert!(store.latest::<Note>().expect("latest").is_none());
    }

    #[test]
    fn corrupt_latest_is_ambiguous() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("20260101T000000.000000Z-x.json"), "not json").expect("write");
        let store = ArtifactStore::new(temp.path());
        let err = store.latest::<Note>().unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
    }

    #[test]
    fn artifact_ids_are_unique() {
        assert_ne!(next_artifact_id("sr"), next_artifact_id("sr"));
    }
}
