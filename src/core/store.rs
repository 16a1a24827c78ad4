//! Rule store: the indexed buckets behind the REST surface
//!
//! Each bucket (block, forward, tag, group, sitevpns) is an independent
//! append-only sequence behind its own writer lock, so mutations within a
//! bucket apply in arrival order. Callers always speak 0-based indices;
//! storage positions are 1-based and the two only meet in
//! [`external_to_internal`] / [`internal_to_external`].

use crate::core::error::{Error, Result};
use crate::core::firewall::FirewallConfig;
use crate::core::identity::{Directory, DirectorySnapshot, settle};
use crate::core::rules::{
    BlockRule, Bucket, Config, ForwardRule, GroupRule, MAX_RULES, SiteVpn, TagRule,
};
use crate::core::tasks::{TaskConfig, TaskName};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Index mapping
// ═══════════════════════════════════════════════════════════════════════════

/// 1-based storage position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot(NonZeroUsize);

impl Slot {
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Maps an API index to its storage slot (`index + 1`).
///
/// Returns `None` only when the index cannot be represented.
pub fn external_to_internal(index: usize) -> Option<Slot> {
    index.checked_add(1).and_then(NonZeroUsize::new).map(Slot)
}

pub fn internal_to_external(slot: Slot) -> usize {
    slot.get() - 1
}

// ═══════════════════════════════════════════════════════════════════════════
// Buckets
// ═══════════════════════════════════════════════════════════════════════════

/// A document kept in one of the indexed buckets
pub trait StoredRule: Clone + Send + Sync + 'static {
    const BUCKET: Bucket;

    /// Validates the document and fills in derived fields.
    fn prepare(&mut self, directory: &DirectorySnapshot) -> Result<()>;

    /// Carries over anything an update may leave implicit.
    fn inherit(&mut self, _previous: &Self) {}

    fn list(store: &RuleStore) -> &RuleList<Self>;

    fn label(&self) -> &str {
        ""
    }

    /// The document as API callers may see it.
    fn redacted(&self) -> Self {
        self.clone()
    }
}

impl StoredRule for BlockRule {
    const BUCKET: Bucket = Bucket::Block;

    fn prepare(&mut self, directory: &DirectorySnapshot) -> Result<()> {
        settle(&mut self.base.client, directory);
        self.normalize()
    }

    fn list(store: &RuleStore) -> &RuleList<Self> {
        &store.block
    }

    fn label(&self) -> &str {
        &self.base.rule_name
    }
}

impl StoredRule for ForwardRule {
    const BUCKET: Bucket = Bucket::Forward;

    fn prepare(&mut self, directory: &DirectorySnapshot) -> Result<()> {
        settle(&mut self.base.client, directory);
        self.normalize()
    }

    fn list(store: &RuleStore) -> &RuleList<Self> {
        &store.forward
    }

    fn label(&self) -> &str {
        &self.base.rule_name
    }
}

impl StoredRule for TagRule {
    const BUCKET: Bucket = Bucket::Tag;

    fn prepare(&mut self, directory: &DirectorySnapshot) -> Result<()> {
        settle(&mut self.base.client, directory);
        self.normalize()
    }

    fn list(store: &RuleStore) -> &RuleList<Self> {
        &store.tag
    }

    fn label(&self) -> &str {
        &self.base.rule_name
    }
}

impl StoredRule for GroupRule {
    const BUCKET: Bucket = Bucket::Group;

    fn prepare(&mut self, directory: &DirectorySnapshot) -> Result<()> {
        settle(&mut self.base.client, directory);
        self.normalize()
    }

    fn list(store: &RuleStore) -> &RuleList<Self> {
        &store.group
    }

    fn label(&self) -> &str {
        &self.base.rule_name
    }
}

impl StoredRule for SiteVpn {
    const BUCKET: Bucket = Bucket::SiteVpn;

    fn prepare(&mut self, _directory: &DirectorySnapshot) -> Result<()> {
        self.normalize()
    }

    fn inherit(&mut self, previous: &Self) {
        self.keep_secrets_from(previous);
    }

    fn redacted(&self) -> Self {
        self.masked()
    }

    fn list(store: &RuleStore) -> &RuleList<Self> {
        &store.site_vpns
    }

    fn label(&self) -> &str {
        &self.endpoint
    }
}

/// One bucket's rules in slot order
pub struct RuleList<T> {
    rules: RwLock<Vec<T>>,
}

impl<T: Clone> RuleList<T> {
    fn new(rules: Vec<T>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.rules.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    pub async fn get(&self, index: usize) -> Option<T> {
        let slot = external_to_internal(index)?;
        self.rules.read().await.get(slot.get() - 1).cloned()
    }

    async fn push(&self, rule: T) -> Result<usize> {
        let mut rules = self.rules.write().await;
        if rules.len() >= MAX_RULES {
            return Err(Error::validation(
                "index",
                format!("bucket is full ({MAX_RULES} rules)"),
            ));
        }
        rules.push(rule);
        let slot = external_to_internal(rules.len() - 1)
            .ok_or_else(|| Error::Internal("slot overflow".to_string()))?;
        Ok(internal_to_external(slot))
    }

    async fn replace<F>(&self, index: usize, build: F) -> Result<T>
    where
        F: FnOnce(&T) -> Result<T>,
    {
        let mut rules = self.rules.write().await;
        let position = Self::position(&rules, index)?;
        let updated = build(&rules[position])?;
        rules[position] = updated.clone();
        Ok(updated)
    }

    async fn remove(&self, index: usize) -> Result<T> {
        let mut rules = self.rules.write().await;
        let position = Self::position(&rules, index)?;
        Ok(rules.remove(position))
    }

    async fn remove_first<F>(&self, matches: F) -> Result<(usize, T)>
    where
        F: Fn(&T) -> bool,
    {
        let mut rules = self.rules.write().await;
        let position = rules
            .iter()
            .position(matches)
            .ok_or_else(|| Error::not_found("matching rule"))?;
        Ok((position, rules.remove(position)))
    }

    fn position(rules: &[T], index: usize) -> Result<usize> {
        external_to_internal(index)
            .map(|slot| slot.get() - 1)
            .filter(|&position| position < rules.len())
            .ok_or_else(|| Error::not_found(format!("index {index}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Persisted form
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the service persists, with real secrets
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PersistedState {
    #[serde(flatten)]
    pub pfw: Config,
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Last run request per task, unix seconds
    #[serde(default)]
    pub task_runs: BTreeMap<String, i64>,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

/// Acknowledgement for `PUT /tasks/run/{task}`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRun {
    pub task: String,
    pub requested_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════

pub struct RuleStore {
    directory: Arc<dyn Directory>,
    forward: RuleList<ForwardRule>,
    block: RuleList<BlockRule>,
    tag: RuleList<TagRule>,
    group: RuleList<GroupRule>,
    site_vpns: RuleList<SiteVpn>,
    variables: RwLock<BTreeMap<String, String>>,
    api_token: RwLock<String>,
    tasks: RwLock<TaskConfig>,
    task_runs: RwLock<BTreeMap<String, i64>>,
    firewall: RwLock<FirewallConfig>,
}

impl RuleStore {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self::from_state(PersistedState::default(), directory)
    }

    /// Restores a store from its persisted form without re-validating.
    pub fn from_state(state: PersistedState, directory: Arc<dyn Directory>) -> Self {
        let PersistedState {
            pfw,
            tasks,
            task_runs,
            firewall,
        } = state;
        info!(
            forward = pfw.forwarding_rules.len(),
            block = pfw.block_rules.len(),
            tag = pfw.tag_rules.len(),
            group = pfw.group_rules.len(),
            site_vpns = pfw.site_vpns.len(),
            "Loaded rule store"
        );
        Self {
            directory,
            forward: RuleList::new(pfw.forwarding_rules),
            block: RuleList::new(pfw.block_rules),
            tag: RuleList::new(pfw.tag_rules),
            group: RuleList::new(pfw.group_rules),
            site_vpns: RuleList::new(pfw.site_vpns),
            variables: RwLock::new(pfw.variables),
            api_token: RwLock::new(pfw.api_token),
            tasks: RwLock::new(tasks),
            task_runs: RwLock::new(task_runs),
            firewall: RwLock::new(firewall),
        }
    }

    /// Current directory snapshot, read on the blocking pool.
    pub async fn directory(&self) -> DirectorySnapshot {
        let directory = Arc::clone(&self.directory);
        tokio::task::spawn_blocking(move || directory.snapshot())
            .await
            .unwrap_or_else(|e| {
                warn!("directory read failed: {e}");
                DirectorySnapshot::default()
            })
    }

    pub fn bucket<T: StoredRule>(&self) -> &RuleList<T> {
        T::list(self)
    }

    /// Appends a rule; returns its index and the document as stored.
    pub async fn add<T: StoredRule>(&self, mut rule: T) -> Result<(usize, T)> {
        rule.prepare(&self.directory().await)?;
        let index = T::list(self).push(rule.clone()).await?;
        debug!(bucket = %T::BUCKET, index, rule = %validators::sanitize_label(rule.label()), "Rule added");
        Ok((index, rule))
    }

    /// Replaces the rule at `index` in place.
    pub async fn update<T: StoredRule>(&self, index: usize, mut rule: T) -> Result<T> {
        let directory = self.directory().await;
        let updated = T::list(self)
            .replace(index, |previous| {
                rule.inherit(previous);
                rule.prepare(&directory)?;
                Ok(rule)
            })
            .await?;
        debug!(bucket = %T::BUCKET, index, "Rule updated");
        Ok(updated)
    }

    /// Removes the rule at `index`; later rules move down by one.
    pub async fn delete<T: StoredRule>(&self, index: usize) -> Result<T> {
        let removed = T::list(self).remove(index).await?;
        debug!(bucket = %T::BUCKET, index, "Rule deleted");
        Ok(removed)
    }

    /// Removes the first rule equal to `rule` once both are prepared the
    /// same way; returns its index and the removed document.
    pub async fn delete_matching<T>(&self, mut rule: T) -> Result<(usize, T)>
    where
        T: StoredRule + PartialEq,
    {
        rule.prepare(&self.directory().await)?;
        let (index, removed) = T::list(self)
            .remove_first(|stored| {
                let mut candidate = rule.clone();
                candidate.inherit(stored);
                candidate == *stored
            })
            .await?;
        debug!(bucket = %T::BUCKET, index, "Rule deleted by value");
        Ok((index, removed))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Variables
    // ───────────────────────────────────────────────────────────────────────

    pub async fn variables(&self) -> BTreeMap<String, String> {
        self.variables.read().await.clone()
    }

    pub async fn get_variable(&self, name: &str) -> Result<String> {
        self.variables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("variable '{name}'")))
    }

    pub async fn set_variable(&self, name: &str, value: String) -> Result<()> {
        validators::validate_variable_name(name).map_err(|e| Error::validation("name", e))?;
        if value.chars().any(char::is_control) {
            return Err(Error::validation("value", "contains control characters"));
        }
        self.variables.write().await.insert(name.to_string(), value);
        Ok(())
    }

    pub async fn delete_variable(&self, name: &str) -> Result<()> {
        self.variables
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("variable '{name}'")))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Token
    // ───────────────────────────────────────────────────────────────────────

    pub async fn set_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::validation("APIToken", "cannot be empty"));
        }
        if token.chars().any(char::is_control) {
            return Err(Error::validation("APIToken", "contains control characters"));
        }
        *self.api_token.write().await = token.to_string();
        Ok(())
    }

    pub async fn token(&self) -> String {
        self.api_token.read().await.clone()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Tasks
    // ───────────────────────────────────────────────────────────────────────

    pub async fn tasks(&self) -> TaskConfig {
        self.tasks.read().await.clone()
    }

    pub async fn configure_task(&self, task: TaskName, body: serde_json::Value) -> Result<()> {
        self.tasks.write().await.configure(task, body)
    }

    pub async fn request_task_run(&self, task: TaskName, now_unix: i64) -> TaskRun {
        self.task_runs
            .write()
            .await
            .insert(task.to_string(), now_unix);
        TaskRun {
            task: task.to_string(),
            requested_at: now_unix,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Plain firewall
    // ───────────────────────────────────────────────────────────────────────

    pub async fn firewall(&self) -> FirewallConfig {
        self.firewall.read().await.clone()
    }

    /// Runs `edit` against the plain firewall rules under the writer lock.
    ///
    /// A failing edit leaves the rules untouched.
    pub async fn edit_firewall<F, R>(&self, edit: F) -> Result<R>
    where
        F: FnOnce(&mut FirewallConfig) -> Result<R>,
    {
        let mut guard = self.firewall.write().await;
        let mut draft = guard.clone();
        let out = edit(&mut draft)?;
        *guard = draft;
        Ok(out)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Projections
    // ───────────────────────────────────────────────────────────────────────

    /// The aggregate view with real secrets, as fed to the compiler.
    pub async fn config(&self) -> Config {
        Config {
            forwarding_rules: self.forward.snapshot().await,
            block_rules: self.block.snapshot().await,
            tag_rules: self.tag.snapshot().await,
            group_rules: self.group.snapshot().await,
            variables: self.variables().await,
            site_vpns: self.site_vpns.snapshot().await,
            api_token: self.token().await,
        }
    }

    /// The aggregate view safe to return to API callers.
    pub async fn masked_config(&self) -> Config {
        self.config().await.masked()
    }

    pub async fn export(&self) -> PersistedState {
        PersistedState {
            pfw: self.config().await,
            tasks: self.tasks().await,
            task_runs: self.task_runs.read().await.clone(),
            firewall: self.firewall().await,
        }
    }

    /// Puts every bucket back to `state`, as taken by [`Self::export`].
    pub async fn restore(&self, state: PersistedState) {
        let PersistedState {
            pfw,
            tasks,
            task_runs,
            firewall,
        } = state;
        *self.forward.rules.write().await = pfw.forwarding_rules;
        *self.block.rules.write().await = pfw.block_rules;
        *self.tag.rules.write().await = pfw.tag_rules;
        *self.group.rules.write().await = pfw.group_rules;
        *self.site_vpns.rules.write().await = pfw.site_vpns;
        *self.variables.write().await = pfw.variables;
        *self.api_token.write().await = pfw.api_token;
        *self.tasks.write().await = tasks;
        *self.task_runs.write().await = task_runs;
        *self.firewall.write().await = firewall;
        info!("Rule store restored from checkpoint");
    }
}
