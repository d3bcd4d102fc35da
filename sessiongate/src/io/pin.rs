//! Session pins: JSON record plus a markdown rendition for humans.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::{debug, info};

use crate::core::records::{ArtifactRef, SessionPin};
use crate::io::artifact_store::{ArtifactStore, StoredArtifact};

const PIN_TEMPLATE: &str = include_str!("templates/session_pin.md");

static TESTS_PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:tests? )?passed").expect("valid tests regex"));

/// Extract a passed-test count from a test runner summary (`"42 passed"`).
pub fn parse_tests_passed(detail: &str) -> Option<u32> {
    TESTS_PASSED_RE
        .captures(detail)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn render_pin_markdown(pin: &SessionPin) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("session_pin", PIN_TEMPLATE)
        .context("load session pin template")?;
    let template = env.get_template("session_pin")?;
    let rendered = template.render(context! { pin => pin })?;
    Ok(rendered)
}

#[derive(Debug, Clone)]
pub struct PinStore {
    store: ArtifactStore,
}

impl PinStore {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Write the pin record and its markdown next to it.
    pub fn write(&self, pin: &SessionPin) -> Result<ArtifactRef> {
        let reference = self.store.append(pin.ended_at, &pin.id, pin)?;
        let markdown = render_pin_markdown(pin)?;
        let md_path = self.store.dir().join(format!("{}.md", reference.key));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&md_path)
            .with_context(|| format!("create {}", md_path.display()))?;
        file.write_all(markdown.as_bytes())
            .with_context(|| format!("write {}", md_path.display()))?;
        info!(session_id = %pin.session_id, key = %reference.key, "session pin written");
        Ok(reference)
    }

    pub fn exists_for(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .store
            .all::<SessionPin>()?
            .iter()
            .any(|stored| stored.record.session_id == session_id))
    }

    /// Most recent pin written by a session other than `session_id`.
    pub fn latest_other_than(&self, session_id: &str) -> Result<Option<StoredArtifact<SessionPin>>> {
        for key in self.store.keys()?.iter().rev() {
            let stored = self.store.read::<SessionPin>(key)?;
            if stored.record.session_id != session_id {
                debug!(key = %key, "previous session pin found");
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }
}
