//! Per-container custom rule storage
//!
//! Each container owns a directory under the rules root holding one
//! newline-delimited file per [`RuleKind`] plus a `profile` file recording the
//! selected egress profile. Files are append-only; a rule is committed by a
//! single write of one line, so an interrupted invocation never leaves a
//! half-written record behind.

use async_trait::async_trait;
use cordon_core::{ContainerId, CustomRule, Result, RuleKind};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// File recording the selected profile inside a container's rule directory
pub const PROFILE_FILE: &str = "profile";

/// Ordered, deduplicated set of custom rules for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomRuleSet {
    entries: Vec<CustomRule>,
}

impl CustomRuleSet {
    /// Empty rule set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a rule unless an identical one is present. Returns whether it was added.
    pub fn insert(&mut self, rule: CustomRule) -> bool {
        if self.entries.contains(&rule) {
            return false;
        }
        self.entries.push(rule);
        true
    }

    /// Rules in listing order (grouped by kind, then insertion order)
    #[must_use]
    pub fn entries(&self) -> &[CustomRule] {
        &self.entries
    }

    /// Values recorded for one kind
    pub fn values(&self, kind: RuleKind) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |rule| rule.kind == kind)
            .map(|rule| rule.value.as_str())
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no rules are recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<CustomRule> for CustomRuleSet {
    fn from_iter<I: IntoIterator<Item = CustomRule>>(iter: I) -> Self {
        let mut set = Self::new();
        for rule in iter {
            set.insert(rule);
        }
        set
    }
}

/// Storage for custom rules and the selected profile
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Create an empty store for a container (no-op if it exists)
    async fn init(&self, id: &ContainerId) -> Result<()>;

    /// Append a rule. Returns `false` if the exact value was already present.
    async fn append(&self, id: &ContainerId, rule: &CustomRule) -> Result<bool>;

    /// Read every rule. An absent store yields an empty set.
    async fn load(&self, id: &ContainerId) -> Result<CustomRuleSet>;

    /// Delete the store. Returns `false` if it did not exist.
    async fn clear(&self, id: &ContainerId) -> Result<bool>;

    /// Profile recorded for the container, if any
    async fn selected_profile(&self, id: &ContainerId) -> Result<Option<String>>;

    /// Record the container's profile
    async fn select_profile(&self, id: &ContainerId, profile: &str) -> Result<()>;

    /// Rules as an ordered list of `(kind, value)` entries
    async fn list_rules(&self, id: &ContainerId) -> Result<Vec<CustomRule>> {
        Ok(self.load(id).await?.entries().to_vec())
    }
}

/// [`RuleRepository`] backed by plain text files
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    root: PathBuf,
}

impl FileRuleStore {
    /// Store rooted at `root` (one subdirectory per container)
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one container's rules
    #[must_use]
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a rule store was ever initialized for `id`
    pub async fn exists(&self, id: &ContainerId) -> Result<bool> {
        Ok(fs::try_exists(self.container_dir(id)).await?)
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn record_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[async_trait]
impl RuleRepository for FileRuleStore {
    async fn init(&self, id: &ContainerId) -> Result<()> {
        let dir = self.container_dir(id);
        fs::create_dir_all(&dir).await?;

        for kind in RuleKind::ALL {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(kind.file_name()))
                .await?;
        }

        debug!(container_id = %id, dir = %dir.display(), "Initialized rule store");
        Ok(())
    }

    async fn append(&self, id: &ContainerId, rule: &CustomRule) -> Result<bool> {
        let dir = self.container_dir(id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(rule.kind.file_name());
        let existing = read_optional(&path).await?.unwrap_or_default();

        if record_lines(&existing).any(|value| value == rule.value) {
            debug!(container_id = %id, rule = %rule, "Rule already present");
            return Ok(false);
        }

        let mut line = String::with_capacity(rule.value.len() + 2);
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&rule.value);
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(container_id = %id, rule = %rule, "Appended rule");
        Ok(true)
    }

    async fn load(&self, id: &ContainerId) -> Result<CustomRuleSet> {
        let dir = self.container_dir(id);
        let mut set = CustomRuleSet::new();

        for kind in RuleKind::ALL {
            let Some(contents) = read_optional(&dir.join(kind.file_name())).await? else {
                continue;
            };

            for value in record_lines(&contents) {
                match CustomRule::new(kind, value) {
                    Ok(rule) => {
                        set.insert(rule);
                    }
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "Skipping invalid stored rule");
                    }
                }
            }
        }

        Ok(set)
    }

    async fn clear(&self, id: &ContainerId) -> Result<bool> {
        match fs::remove_dir_all(self.container_dir(id)).await {
            Ok(()) => {
                debug!(container_id = %id, "Removed rule store");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn selected_profile(&self, id: &ContainerId) -> Result<Option<String>> {
        let contents = read_optional(&self.container_dir(id).join(PROFILE_FILE)).await?;
        Ok(contents
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    async fn select_profile(&self, id: &ContainerId, profile: &str) -> Result<()> {
        let dir = self.container_dir(id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(PROFILE_FILE), format!("{profile}\n")).await?;
        Ok(())
    }
}
