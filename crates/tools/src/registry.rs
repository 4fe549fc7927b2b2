//! The tool registry
//!
//! Holds one managed connection per configured server and a copy-on-write
//! snapshot of every known tool. Refresh tasks rebuild the snapshot in the
//! background; readers clone the current `Arc` and keep a consistent view
//! for as long as they hold it. A refresh failure retains the previous
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use hearth_config::{ServerTransportKind, ToolServerDocument, ToolServerEntry};

use crate::descriptor::ToolDescriptor;
use crate::transport::{
    HttpStreamTransport, ServerTransport, SseTransport, StdioTransport,
};
use crate::InvokeError;

/// A consistent view of every known tool
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tools: Vec<ToolDescriptor>,
    pub refreshed_at: DateTime<Utc>,
}

impl Snapshot {
    fn empty() -> Self {
        Self { tools: Vec::new(), refreshed_at: Utc::now() }
    }

    pub fn describe(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }
}

struct ManagedServer {
    entry: ToolServerEntry,
    transport: Arc<dyn ServerTransport>,
}

/// Registry of callable external tools
pub struct ToolRegistry {
    servers: Vec<ManagedServer>,
    /// Per-server tool lists, merged into the snapshot in document order
    tools_by_server: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
    snapshot: RwLock<Arc<Snapshot>>,
    default_deadline: Duration,
}

impl ToolRegistry {
    pub fn new(default_deadline: Duration) -> Self {
        Self {
            servers: Vec::new(),
            tools_by_server: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            default_deadline,
        }
    }

    /// Register one server with an already-built transport.
    pub fn add_server(&mut self, entry: ToolServerEntry, transport: Arc<dyn ServerTransport>) {
        self.servers.push(ManagedServer { entry, transport });
    }

    /// Build a registry from the declaration document.
    ///
    /// Servers whose transport cannot be set up (e.g. a subprocess that
    /// fails to spawn) are logged and skipped; the hub starts without them.
    pub fn from_document(document: &ToolServerDocument, default_deadline: Duration) -> Self {
        let mut registry = Self::new(default_deadline);

        for entry in document.enabled_servers() {
            let transport: Arc<dyn ServerTransport> = match entry.transport {
                ServerTransportKind::Stdio => {
                    let command = entry.command.as_deref().unwrap_or_default();
                    match StdioTransport::spawn(command, &entry.args) {
                        Ok(t) => Arc::new(t),
                        Err(e) => {
                            tracing::warn!(server = %entry.name, error = %e, "skipping tool server");
                            continue;
                        }
                    }
                }
                ServerTransportKind::Sse => {
                    Arc::new(SseTransport::new(entry.url.clone().unwrap_or_default()))
                }
                ServerTransportKind::HttpStream => {
                    Arc::new(HttpStreamTransport::new(entry.url.clone().unwrap_or_default()))
                }
            };
            registry.add_server(entry.clone(), transport);
        }

        registry
    }

    /// Configured entries, in document order (prompt composition reads the
    /// per-server examples from here).
    pub fn server_entries(&self) -> Vec<&ToolServerEntry> {
        self.servers.iter().map(|s| &s.entry).collect()
    }

    /// Current snapshot; the caller sees a consistent view until it asks
    /// for a new one.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// The full executable set.
    pub fn list_all(&self) -> Vec<ToolDescriptor> {
        self.snapshot().tools.clone()
    }

    /// The curated subset for classifier prompts.
    pub fn list_for_prompt(&self) -> Vec<ToolDescriptor> {
        self.snapshot().tools.iter().filter(|t| t.prompt_included).cloned().collect()
    }

    pub fn describe(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot().describe(name).cloned()
    }

    /// Refresh one server's tool list and swap the snapshot.
    pub async fn refresh_server(&self, name: &str) -> Result<(), InvokeError> {
        let server = self
            .servers
            .iter()
            .find(|s| s.entry.name == name)
            .ok_or_else(|| InvokeError::UnknownTool(name.to_string()))?;

        let specs = server.transport.list_tools().await?;
        let descriptors: Vec<ToolDescriptor> = specs
            .into_iter()
            .map(|spec| {
                let included = server.entry.include_in_prompt(&spec.name);
                ToolDescriptor::from_spec(&server.entry.name, spec, included)
            })
            .collect();

        tracing::debug!(server = name, tools = descriptors.len(), "refreshed tool list");
        self.tools_by_server.write().insert(name.to_string(), descriptors);
        self.rebuild_snapshot();
        Ok(())
    }

    /// Refresh every server once; failures retain the previous snapshot.
    pub async fn refresh_all(&self) {
        for server in &self.servers {
            if let Err(e) = self.refresh_server(&server.entry.name).await {
                tracing::warn!(server = %server.entry.name, error = %e, "tool refresh failed");
            }
        }
    }

    fn rebuild_snapshot(&self) {
        let by_server = self.tools_by_server.read();
        let mut tools = Vec::new();
        for server in &self.servers {
            if let Some(server_tools) = by_server.get(&server.entry.name) {
                tools.extend(server_tools.iter().cloned());
            }
        }
        *self.snapshot.write() = Arc::new(Snapshot { tools, refreshed_at: Utc::now() });
    }

    /// Spawn one background refresh task per server.
    ///
    /// Tasks exit when `shutdown` flips to true. Refresh never blocks
    /// callers; they keep reading the old snapshot until the swap.
    pub fn spawn_refresh_tasks(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        for server in &self.servers {
            let name = server.entry.name.clone();
            let interval = Duration::from_secs(server.entry.refresh_interval_seconds.max(1));
            let registry = Arc::clone(self);
            let mut shutdown = shutdown.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = registry.refresh_server(&name).await {
                                tracing::warn!(server = %name, error = %e, "tool refresh failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                tracing::debug!(server = %name, "refresh task shutting down");
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Issue one call to the owning server.
    pub async fn invoke(
        &self,
        name: &str,
        params: &serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value, InvokeError> {
        let descriptor = self
            .describe(name)
            .ok_or_else(|| InvokeError::UnknownTool(name.to_string()))?;

        validate_params(&descriptor.input_schema, params)?;

        let server = self
            .servers
            .iter()
            .find(|s| s.entry.name == descriptor.server)
            .ok_or_else(|| InvokeError::ServerUnavailable(descriptor.server.clone()))?;

        let deadline = deadline.unwrap_or(self.default_deadline);
        tracing::debug!(tool = name, ?deadline, "invoking tool");
        server.transport.invoke(&descriptor.tool, params, deadline).await
    }

    /// `invoke` racing a cancellation token.
    pub async fn invoke_cancellable(
        &self,
        name: &str,
        params: &serde_json::Value,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, InvokeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(InvokeError::Cancelled),
            result = self.invoke(name, params, deadline) => result,
        }
    }
}

fn validate_params(
    schema: &serde_json::Value,
    params: &serde_json::Value,
) -> Result<(), InvokeError> {
    if schema.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Ok(());
    }
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| InvokeError::InvalidParams(format!("bad schema: {e}")))?;
    let result = compiled.validate(params);
    if let Err(errors) = result {
        let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(InvokeError::InvalidParams(message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RemoteToolSpec;
    use async_trait::async_trait;
    use hearth_config::EnabledFlag;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockTransport {
        tools: Vec<RemoteToolSpec>,
        fail_listing: AtomicBool,
        result: serde_json::Value,
    }

    impl MockTransport {
        fn new(tools: Vec<RemoteToolSpec>, result: serde_json::Value) -> Self {
            Self { tools, fail_listing: AtomicBool::new(false), result }
        }
    }

    #[async_trait]
    impl ServerTransport for MockTransport {
        async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, InvokeError> {
            if self.fail_listing.load(Ordering::Relaxed) {
                return Err(InvokeError::ServerUnavailable("down".to_string()));
            }
            Ok(self.tools.clone())
        }

        async fn invoke(
            &self,
            _tool: &str,
            _params: &serde_json::Value,
            _deadline: Duration,
        ) -> Result<serde_json::Value, InvokeError> {
            Ok(self.result.clone())
        }
    }

    fn entry(name: &str, prompt_tools: Option<Vec<String>>) -> ToolServerEntry {
        ToolServerEntry {
            name: name.to_string(),
            transport: ServerTransportKind::HttpStream,
            url: Some("http://localhost:1".to_string()),
            command: None,
            args: vec![],
            enabled: EnabledFlag::Literal(true),
            refresh_interval_seconds: 60,
            prompt_tools,
            example_intent: None,
            examples: HashMap::new(),
        }
    }

    fn spec(name: &str) -> RemoteToolSpec {
        RemoteToolSpec {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({
                "type": "object",
                "properties": {"entity": {"type": "string"}},
                "required": ["entity"]
            }),
        }
    }

    fn registry_with_mock(
        prompt_tools: Option<Vec<String>>,
        transport: Arc<MockTransport>,
    ) -> ToolRegistry {
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.add_server(entry("home_assistant", prompt_tools), transport);
        registry
    }

    #[tokio::test]
    async fn test_refresh_populates_snapshot() {
        let transport = Arc::new(MockTransport::new(
            vec![spec("turn_on"), spec("turn_off")],
            json!({"acknowledged": true}),
        ));
        let registry = registry_with_mock(None, transport);

        assert!(registry.list_all().is_empty());
        registry.refresh_all().await;

        let tools = registry.list_all();
        assert_eq!(tools.len(), 2);
        assert!(registry.describe("home_assistant.turn_on").is_some());
        assert!(registry.describe("home_assistant.reboot").is_none());
    }

    #[tokio::test]
    async fn test_prompt_curation() {
        let transport = Arc::new(MockTransport::new(
            vec![spec("turn_on"), spec("restart_core")],
            json!({}),
        ));
        let registry = registry_with_mock(Some(vec!["turn_on".to_string()]), transport);
        registry.refresh_all().await;

        // curated subset for prompts, full set for execution
        let prompt = registry.list_for_prompt();
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].name, "home_assistant.turn_on");
        assert_eq!(registry.list_all().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_retains_snapshot() {
        let transport = Arc::new(MockTransport::new(vec![spec("turn_on")], json!({})));
        let registry = {
            let mut r = ToolRegistry::new(Duration::from_secs(5));
            r.add_server(entry("home_assistant", None), Arc::clone(&transport) as Arc<dyn ServerTransport>);
            r
        };
        registry.refresh_all().await;
        assert_eq!(registry.list_all().len(), 1);

        transport.fail_listing.store(true, Ordering::Relaxed);
        registry.refresh_all().await;
        assert_eq!(registry.list_all().len(), 1, "old snapshot must survive");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let transport = Arc::new(MockTransport::new(vec![], json!({})));
        let registry = registry_with_mock(None, transport);
        let err = registry.invoke("nope.tool", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, InvokeError::UnknownTool(_)));
        assert_eq!(err.kind(), "tool-unknown");
    }

    #[tokio::test]
    async fn test_invoke_validates_params() {
        let transport = Arc::new(MockTransport::new(vec![spec("turn_on")], json!({})));
        let registry = registry_with_mock(None, transport);
        registry.refresh_all().await;

        let err = registry
            .invoke("home_assistant.turn_on", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidParams(_)));

        let ok = registry
            .invoke("home_assistant.turn_on", &json!({"entity": "light.office"}), None)
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_cancellable() {
        let transport = Arc::new(MockTransport::new(vec![spec("turn_on")], json!({})));
        let registry = registry_with_mock(None, transport);
        registry.refresh_all().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry
            .invoke_cancellable(
                "home_assistant.turn_on",
                &json!({"entity": "light.office"}),
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, InvokeError::Cancelled);
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_for_holder() {
        let transport = Arc::new(MockTransport::new(vec![spec("turn_on")], json!({})));
        let registry = registry_with_mock(None, transport);
        registry.refresh_all().await;

        let held = registry.snapshot();
        assert_eq!(held.tools.len(), 1);

        // snapshot swap under the holder's feet
        registry.tools_by_server.write().insert("home_assistant".to_string(), vec![]);
        registry.rebuild_snapshot();

        assert_eq!(held.tools.len(), 1, "held snapshot unchanged");
        assert_eq!(registry.snapshot().tools.len(), 0);
    }
}
