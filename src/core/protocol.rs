//! Protocols: named, versioned bundles of message handlers and reply rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::dialogue::TransitionGuard;
use super::spec::{compute_protocol_digest, Interactions, MessageSet, ProtocolSpecification};
use crate::agent::scheduler::IntervalTask;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::model::{Model, ModelInfo};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Type-erased message handler: context, sender address, JSON payload.
pub type MessageHandler = Arc<dyn Fn(Context, String, String) -> HandlerFuture + Send + Sync>;

pub type IntervalHandler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Handler {
    pub(crate) func: MessageHandler,
    pub(crate) allow_unverified: bool,
}

/// Wrap a typed handler so it decodes its payload first.
pub(crate) fn typed_handler<M, F, Fut>(handler: F) -> MessageHandler
where
    M: Model,
    F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(
        move |ctx: Context, sender: String, payload: String| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message: M = serde_json::from_str(&payload).map_err(|e| {
                    Error::Payload(format!("cannot decode {}: {}", M::schema_name(), e))
                })?;
                handler(ctx, sender, message).await
            })
        },
    )
}

/// Portable description of a protocol for discovery services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub metadata: ManifestMetadata,
    pub models: Vec<ManifestModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interactions: Vec<ManifestInteraction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    pub version: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestModel {
    pub digest: String,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInteraction {
    pub request: String,
    pub responses: Vec<String>,
}

pub const MANIFEST_VERSION: &str = "1.0";

/// A named, versioned set of message handlers.
///
/// Built incrementally with `on_message`, or from a `ProtocolSpecification`
/// that fixes the interaction graph and, optionally, the role this instance
/// plays. The digest depends only on the message set and graph.
pub struct Protocol {
    name: String,
    version: String,
    models: BTreeMap<String, ModelInfo>,
    replies: Interactions,
    handlers: HashMap<String, Handler>,
    intervals: Vec<IntervalTask>,
    spec: Option<ProtocolSpecification>,
    role: Option<String>,
    guard: Option<Arc<dyn TransitionGuard>>,
    digest: String,
}

impl Protocol {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let mut protocol = Self {
            name: name.into(),
            version: version.into(),
            models: BTreeMap::new(),
            replies: BTreeMap::new(),
            handlers: HashMap::new(),
            intervals: Vec::new(),
            spec: None,
            role: None,
            guard: None,
            digest: String::new(),
        };
        protocol.update_digest();
        protocol
    }

    /// Instantiate a specification, optionally as one of its roles.
    pub fn from_spec(spec: ProtocolSpecification, role: Option<&str>) -> Result<Self> {
        if let Some(role) = role {
            if spec.role_messages(role).is_none() {
                return Err(Error::RoleViolation(format!(
                    "protocol {} has no role '{}'",
                    spec.name(),
                    role
                )));
            }
        }

        let models = spec
            .models()
            .map(|m| (m.digest.clone(), m.clone()))
            .collect();
        Ok(Self {
            name: spec.name().to_string(),
            version: spec.version().to_string(),
            models,
            replies: BTreeMap::new(),
            handlers: HashMap::new(),
            intervals: Vec::new(),
            digest: spec.digest(),
            role: role.map(str::to_string),
            spec: Some(spec),
            guard: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `name:version`
    pub fn canonical_name(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn specification(&self) -> Option<&ProtocolSpecification> {
        self.spec.as_ref()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }

    pub fn has_handler(&self, schema_digest: &str) -> bool {
        self.handlers.contains_key(schema_digest)
    }

    /// Digests allowed in reply to `schema_digest`; `None` when unconstrained.
    pub fn replies_for(&self, schema_digest: &str) -> Option<BTreeSet<String>> {
        match &self.spec {
            Some(spec) => Some(spec.replies_for(schema_digest)),
            None => self.replies.get(schema_digest).cloned(),
        }
    }

    /// Register a handler for signed messages of type `M`. An empty reply
    /// set leaves replies unconstrained.
    pub fn on_message<M, F, Fut>(&mut self, replies: MessageSet, handler: F) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let model = ModelInfo::of::<M>()?;
        self.register(model, replies, typed_handler(handler), false)?;
        Ok(self)
    }

    /// Like `on_message`, but also accepts unsigned envelopes.
    pub fn on_unverified_message<M, F, Fut>(
        &mut self,
        replies: MessageSet,
        handler: F,
    ) -> Result<&mut Self>
    where
        M: Model,
        F: Fn(Context, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let model = ModelInfo::of::<M>()?;
        self.register(model, replies, typed_handler(handler), true)?;
        Ok(self)
    }

    /// Run `handler` every `period` once the owning agent starts.
    pub fn on_interval<F, Fut>(&mut self, period: Duration, handler: F) -> Result<&mut Self>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.intervals.push(IntervalTask::new(period, handler)?);
        Ok(self)
    }

    pub(crate) fn register(
        &mut self,
        model: ModelInfo,
        replies: MessageSet,
        func: MessageHandler,
        allow_unverified: bool,
    ) -> Result<()> {
        let replies = replies.resolve()?;

        if let Some(spec) = &self.spec {
            if !spec.contains(&model.digest) {
                return Err(Error::RoleViolation(format!(
                    "{} is not part of protocol {}",
                    model.name,
                    self.canonical_name()
                )));
            }
            if let Some(role) = &self.role {
                let handled = spec.role_messages(role).cloned().unwrap_or_default();
                if !handled.contains(&model.digest) {
                    return Err(Error::RoleViolation(format!(
                        "{} is not handled by role '{}' of protocol {}",
                        model.name,
                        role,
                        self.canonical_name()
                    )));
                }
            }
            let allowed = spec.replies_for(&model.digest);
            if let Some(extra) = replies.iter().find(|r| !allowed.contains(&r.digest)) {
                return Err(Error::ProtocolViolation(format!(
                    "{} is not a valid reply to {} in protocol {}",
                    extra.name,
                    model.name,
                    self.canonical_name()
                )));
            }
        } else if !replies.is_empty() {
            let digests = replies.iter().map(|r| r.digest.clone()).collect();
            self.replies.insert(model.digest.clone(), digests);
            for reply in replies {
                self.models.entry(reply.digest.clone()).or_insert(reply);
            }
        }

        if self.handlers.contains_key(&model.digest) {
            tracing::warn!(
                protocol = %self.canonical_name(),
                model = %model.name,
                "Replacing existing handler"
            );
        }
        self.handlers.insert(
            model.digest.clone(),
            Handler {
                func,
                allow_unverified,
            },
        );
        self.models.entry(model.digest.clone()).or_insert(model);
        self.update_digest();
        Ok(())
    }

    fn update_digest(&mut self) {
        if self.spec.is_none() {
            self.digest = compute_protocol_digest(
                &self.name,
                &self.version,
                self.models.keys().map(String::as_str),
                &self.replies,
            );
        }
    }

    /// A role-bound protocol must handle every message of its role.
    pub fn verify_complete(&self) -> Result<()> {
        let (Some(spec), Some(role)) = (&self.spec, &self.role) else {
            return Ok(());
        };
        let missing: Vec<String> = spec
            .role_messages(role)
            .into_iter()
            .flatten()
            .filter(|digest| !self.handlers.contains_key(*digest))
            .map(|digest| {
                spec.model(digest)
                    .map(|m| m.name.clone())
                    .unwrap_or_else(|| digest.clone())
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompleteProtocol(format!(
                "role '{}' of protocol {} has no handler for {}",
                role,
                self.canonical_name(),
                missing.join(", ")
            )))
        }
    }

    pub fn manifest(&self) -> Manifest {
        let interactions: Vec<ManifestInteraction> = match &self.spec {
            Some(spec) => spec
                .models()
                .map(|m| (m.digest.clone(), spec.replies_for(&m.digest)))
                .filter(|(_, replies)| !replies.is_empty())
                .map(|(request, replies)| ManifestInteraction {
                    request,
                    responses: replies.into_iter().collect(),
                })
                .collect(),
            None => self
                .replies
                .iter()
                .map(|(request, replies)| ManifestInteraction {
                    request: request.clone(),
                    responses: replies.iter().cloned().collect(),
                })
                .collect(),
        };

        Manifest {
            version: MANIFEST_VERSION.to_string(),
            metadata: ManifestMetadata {
                name: self.name.clone(),
                version: self.version.clone(),
                digest: self.digest.clone(),
            },
            models: self
                .models
                .values()
                .map(|m| ManifestModel {
                    digest: m.digest.clone(),
                    schema: m.schema.clone(),
                })
                .collect(),
            interactions,
        }
    }

    pub(crate) fn handlers(&self) -> &HashMap<String, Handler> {
        &self.handlers
    }

    pub(crate) fn take_intervals(&mut self) -> Vec<IntervalTask> {
        std::mem::take(&mut self.intervals)
    }

    pub(crate) fn guard(&self) -> Option<Arc<dyn TransitionGuard>> {
        self.guard.clone()
    }

    pub(crate) fn set_guard(&mut self, guard: Arc<dyn TransitionGuard>) {
        self.guard = Some(guard);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.intervals.is_empty()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("digest", &self.digest)
            .field("role", &self.role)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Request {
        query: String,
    }
    impl Model for Request {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Response {
        result: String,
    }
    impl Model for Response {}

    #[derive(Debug, Serialize, Deserialize, JsonSchema)]
    struct Cancel {
        reason: String,
    }
    impl Model for Cancel {}

    fn spec() -> ProtocolSpecification {
        ProtocolSpecification::new("lookup", "0.1.0")
            .interaction::<Request>(MessageSet::of::<Response>().and::<Cancel>())
            .unwrap()
            .interaction::<Response>(MessageSet::empty())
            .unwrap()
            .interaction::<Cancel>(MessageSet::empty())
            .unwrap()
            .role("server", MessageSet::of::<Request>())
            .unwrap()
            .role("client", MessageSet::of::<Response>().and::<Cancel>())
            .unwrap()
    }

    #[test]
    fn test_canonical_name_and_empty_digest() {
        let protocol = Protocol::new("lookup", "0.1.0");
        assert_eq!(protocol.canonical_name(), "lookup:0.1.0");
        assert!(protocol.digest().starts_with("proto:"));
        assert!(protocol.is_empty());
    }

    #[test]
    fn test_digest_changes_with_models_not_handlers() {
        let mut first = Protocol::new("lookup", "0.1.0");
        let empty = first.digest().to_string();
        first
            .on_message(MessageSet::empty(), |_ctx, _sender, _msg: Request| async {
                Ok(())
            })
            .unwrap();
        assert_ne!(first.digest(), empty);

        let mut second = Protocol::new("lookup", "0.1.0");
        second
            .on_message(MessageSet::empty(), |_ctx, sender, msg: Request| async move {
                anyhow::bail!("{} asked {}", sender, msg.query)
            })
            .unwrap();
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_incremental_matches_spec_in_any_order() {
        let from_spec = Protocol::from_spec(spec(), None).unwrap();

        let mut forward = Protocol::new("lookup", "0.1.0");
        forward
            .on_message(
                MessageSet::of::<Response>().and::<Cancel>(),
                |_ctx, _s, _m: Request| async { Ok(()) },
            )
            .unwrap()
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Response| async { Ok(()) })
            .unwrap()
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Cancel| async { Ok(()) })
            .unwrap();

        let mut backward = Protocol::new("lookup", "0.1.0");
        backward
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Cancel| async { Ok(()) })
            .unwrap()
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Response| async { Ok(()) })
            .unwrap()
            .on_message(
                MessageSet::of::<Cancel>().and::<Response>(),
                |_ctx, _s, _m: Request| async { Ok(()) },
            )
            .unwrap();

        assert_eq!(forward.digest(), from_spec.digest());
        assert_eq!(backward.digest(), from_spec.digest());
    }

    #[test]
    fn test_role_digest_is_graph_digest() {
        let server = Protocol::from_spec(spec(), Some("server")).unwrap();
        let client = Protocol::from_spec(spec(), Some("client")).unwrap();
        assert_eq!(server.digest(), client.digest());
        assert_eq!(server.role(), Some("server"));
    }

    #[test]
    fn test_unknown_role_rejected() {
        assert!(matches!(
            Protocol::from_spec(spec(), Some("observer")),
            Err(Error::RoleViolation(_))
        ));
    }

    #[test]
    fn test_handler_outside_role_rejected() {
        let mut server = Protocol::from_spec(spec(), Some("server")).unwrap();
        let result =
            server.on_message(MessageSet::empty(), |_ctx, _s, _m: Response| async { Ok(()) });
        assert!(matches!(result, Err(Error::RoleViolation(_))));
        assert!(!server.has_handler(&Response::schema_digest().unwrap()));
    }

    #[test]
    fn test_reply_outside_spec_rejected() {
        let mut server = Protocol::from_spec(spec(), Some("server")).unwrap();
        let result = server.on_message(
            MessageSet::of::<Request>(),
            |_ctx, _s, _m: Request| async { Ok(()) },
        );
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_completeness() {
        let mut client = Protocol::from_spec(spec(), Some("client")).unwrap();
        client
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Response| async { Ok(()) })
            .unwrap();
        match client.verify_complete() {
            Err(Error::IncompleteProtocol(detail)) => assert!(detail.contains("Cancel")),
            other => panic!("expected incomplete protocol, got {:?}", other),
        }

        client
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Cancel| async { Ok(()) })
            .unwrap();
        assert!(client.verify_complete().is_ok());
        assert!(Protocol::new("free", "1").verify_complete().is_ok());
    }

    #[test]
    fn test_replies_for() {
        let mut protocol = Protocol::new("lookup", "0.1.0");
        protocol
            .on_message(MessageSet::of::<Response>(), |_ctx, _s, _m: Request| async { Ok(()) })
            .unwrap()
            .on_message(MessageSet::empty(), |_ctx, _s, _m: Response| async { Ok(()) })
            .unwrap();

        let request = Request::schema_digest().unwrap();
        let response = Response::schema_digest().unwrap();
        assert_eq!(
            protocol.replies_for(&request),
            Some(BTreeSet::from([response.clone()]))
        );
        assert_eq!(protocol.replies_for(&response), None);

        let server = Protocol::from_spec(spec(), Some("server")).unwrap();
        assert_eq!(server.replies_for(&response), Some(BTreeSet::new()));
    }

    #[test]
    fn test_manifest() {
        let protocol = Protocol::from_spec(spec(), Some("server")).unwrap();
        let manifest = protocol.manifest();

        assert_eq!(manifest.metadata.name, "lookup");
        assert_eq!(manifest.metadata.version, "0.1.0");
        assert_eq!(manifest.metadata.digest, protocol.digest());
        assert_eq!(manifest.models.len(), 3);
        assert_eq!(manifest.interactions.len(), 1);
        assert_eq!(manifest.interactions[0].responses.len(), 2);

        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json["metadata"]["digest"].as_str().unwrap().starts_with("proto:"));

        let bare = serde_json::to_value(Protocol::new("bare", "1").manifest()).unwrap();
        assert!(bare.get("interactions").is_none());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut protocol = Protocol::new("ticks", "1");
        assert!(protocol
            .on_interval(Duration::ZERO, |_ctx| async { Ok(()) })
            .is_err());
        protocol
            .on_interval(Duration::from_secs(1), |_ctx| async { Ok(()) })
            .unwrap();
        assert_eq!(protocol.take_intervals().len(), 1);
        assert!(protocol.take_intervals().is_empty());
    }
}
