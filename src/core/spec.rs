//! Declarative protocol specifications and the protocol digest.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::model::{canonical_json, Model, ModelInfo};

pub const PROTOCOL_DIGEST_PREFIX: &str = "proto:";

/// An ordered set of model types, resolved to `ModelInfo` on use.
#[derive(Debug, Clone, Default)]
pub struct MessageSet {
    loaders: Vec<fn() -> Result<ModelInfo>>,
}

impl MessageSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of<M: Model>() -> Self {
        Self::empty().and::<M>()
    }

    pub fn and<M: Model>(mut self) -> Self {
        self.loaders.push(ModelInfo::of::<M>);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub(crate) fn resolve(&self) -> Result<Vec<ModelInfo>> {
        self.loaders.iter().map(|load| load()).collect()
    }
}

/// Interaction graph: message digest -> digests allowed in reply.
pub(crate) type Interactions = BTreeMap<String, BTreeSet<String>>;

/// The full interaction graph of a protocol, declared up front, plus the
/// role partition. Each role lists the message types it handles.
#[derive(Debug, Clone)]
pub struct ProtocolSpecification {
    name: String,
    version: String,
    models: BTreeMap<String, ModelInfo>,
    interactions: Interactions,
    roles: BTreeMap<String, BTreeSet<String>>,
}

impl ProtocolSpecification {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            models: BTreeMap::new(),
            interactions: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }

    /// Declare that `M` may be answered with any of `replies`.
    pub fn interaction<M: Model>(self, replies: MessageSet) -> Result<Self> {
        let request = ModelInfo::of::<M>()?;
        let replies = replies.resolve()?;
        Ok(self.with_interaction(request, replies))
    }

    pub(crate) fn with_interaction(mut self, request: ModelInfo, replies: Vec<ModelInfo>) -> Self {
        let entry = self
            .interactions
            .entry(request.digest.clone())
            .or_default();
        for reply in replies {
            entry.insert(reply.digest.clone());
            self.models.entry(reply.digest.clone()).or_insert(reply);
        }
        self.models.entry(request.digest.clone()).or_insert(request);
        self
    }

    /// Declare the messages handled by `role`. Every one must already be
    /// part of the graph.
    pub fn role(mut self, role: impl Into<String>, handles: MessageSet) -> Result<Self> {
        let role = role.into();
        let mut digests = BTreeSet::new();
        for model in handles.resolve()? {
            if !self.models.contains_key(&model.digest) {
                return Err(Error::RoleViolation(format!(
                    "role '{}' lists {} which is not part of protocol {}",
                    role, model.name, self.name
                )));
            }
            digests.insert(model.digest);
        }
        self.roles.insert(role, digests);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }

    pub fn model(&self, digest: &str) -> Option<&ModelInfo> {
        self.models.get(digest)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.models.contains_key(digest)
    }

    pub fn replies_for(&self, digest: &str) -> BTreeSet<String> {
        self.interactions.get(digest).cloned().unwrap_or_default()
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn role_messages(&self, role: &str) -> Option<&BTreeSet<String>> {
        self.roles.get(role)
    }

    pub fn digest(&self) -> String {
        compute_protocol_digest(
            &self.name,
            &self.version,
            self.models.keys().map(String::as_str),
            &self.interactions,
        )
    }
}

/// `proto:` + SHA-256 over the canonical `{name, version, models, interactions}`.
/// Interactions without replies carry no structure and are left out, so a
/// graph built one handler at a time matches its declared equivalent.
pub(crate) fn compute_protocol_digest<'a>(
    name: &str,
    version: &str,
    models: impl Iterator<Item = &'a str>,
    interactions: &Interactions,
) -> String {
    let models: BTreeSet<&str> = models.collect();
    let interactions: Vec<_> = interactions
        .iter()
        .filter(|(_, replies)| !replies.is_empty())
        .map(|(request, replies)| json!({"request": request, "responses": replies}))
        .collect();
    let manifest = json!({
        "name": name,
        "version": version,
        "models": models,
        "interactions": interactions,
    });
    let hash = Sha256::digest(canonical_json(&manifest).as_bytes());
    format!("{}{}", PROTOCOL_DIGEST_PREFIX, hex::encode(hash))
}
