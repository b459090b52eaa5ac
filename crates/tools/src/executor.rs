//! Session tool executor.
//!
//! One executor lives per session, holding the agent's bindings and a cache
//! of one integration instance per tool. Tool errors are data: every
//! failure mode is converted into a `{success:false, error}` result so the
//! model can recover, and a round's calls run concurrently while results
//! come back in request order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use voice_broker_core::{AgentProfile, ChatMessage, ToolBinding, ToolCallRequest, ToolSpec};

use crate::integrations::ToolIntegration;
use crate::registry::{registry_resolver, ToolRegistry};
use crate::ToolError;

/// Resolves a binding into a live integration. The default resolver goes
/// through the static registry; tests inject scripted integrations.
pub type IntegrationResolver =
    Arc<dyn Fn(&ToolBinding) -> Result<Arc<dyn ToolIntegration>, ToolError> + Send + Sync>;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-call budget; an expired call becomes an error tool-result, not a
    /// failed turn.
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-session tool dispatch.
pub struct SessionToolExecutor {
    bindings: HashMap<String, ToolBinding>,
    resolver: IntegrationResolver,
    cache: Mutex<HashMap<String, Arc<dyn ToolIntegration>>>,
    config: ExecutorConfig,
}

impl SessionToolExecutor {
    /// Executor for an agent's enabled bindings, resolving through the
    /// static registry.
    pub fn for_agent(agent: &AgentProfile) -> Self {
        Self::with_resolver(agent, registry_resolver(), ExecutorConfig::default())
    }

    pub fn with_resolver(
        agent: &AgentProfile,
        resolver: IntegrationResolver,
        config: ExecutorConfig,
    ) -> Self {
        let bindings = agent
            .enabled_tools()
            .map(|b| (b.tool_slug.clone(), b.clone()))
            .collect();
        Self {
            bindings,
            resolver,
            cache: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Descriptors for the agent's enabled tools, in descriptor form for
    /// the model.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .bindings
            .keys()
            .filter_map(|slug| ToolRegistry::descriptor(slug))
            .map(|d| d.to_spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn has_tools(&self) -> bool {
        !self.bindings.is_empty()
    }

    /// Execute one round's calls concurrently. Results come back as `tool`
    /// messages in the exact order the model requested them.
    pub async fn execute_calls(&self, calls: &[ToolCallRequest]) -> Vec<ChatMessage> {
        let futures = calls.iter().map(|call| async {
            let result = self.execute_one(call).await;
            let content = serde_json::to_string(&result)
                .unwrap_or_else(|_| r#"{"success":false,"error":"unserializable result"}"#.into());
            ChatMessage::tool(call.id.clone(), content)
        });
        join_all(futures).await
    }

    async fn execute_one(&self, call: &ToolCallRequest) -> Value {
        let arguments: Value = match serde_json::from_str(&call.arguments) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) | Err(_) => {
                tracing::warn!(tool = %call.name, "tool arguments were not a JSON object");
                json!({})
            }
        };

        let Some(binding) = self.bindings.get(&call.name) else {
            return json!({"success": false, "error": "tool not available"});
        };

        if let Some(descriptor) = ToolRegistry::descriptor(&call.name) {
            if let Err(message) = validate_arguments(&descriptor.parameters, &arguments) {
                return json!({"success": false, "error": format!("invalid arguments: {message}")});
            }
        }

        let integration = match self.integration_for(binding).await {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "integration unavailable");
                return json!({"success": false, "error": "tool not available"});
            }
        };

        tracing::info!(tool = %call.name, call_id = %call.id, "executing tool call");
        match tokio::time::timeout(self.config.call_timeout, integration.execute(&arguments)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                json!({"success": false, "error": e.to_string()})
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout = ?self.config.call_timeout, "tool call timed out");
                json!({
                    "success": false,
                    "error": format!("tool call timed out after {:?}", self.config.call_timeout),
                })
            }
        }
    }

    async fn integration_for(
        &self,
        binding: &ToolBinding,
    ) -> Result<Arc<dyn ToolIntegration>, ToolError> {
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&binding.tool_slug) {
            return Ok(existing.clone());
        }
        let integration = (self.resolver)(binding)?;
        cache.insert(binding.tool_slug.clone(), integration.clone());
        Ok(integration)
    }

    /// The catalog source behind a binding, for the sync pipeline.
    pub async fn catalog_integration(
        &self,
        tool_slug: &str,
    ) -> Result<Arc<dyn ToolIntegration>, ToolError> {
        let binding = self.bindings.get(tool_slug).ok_or(ToolError::NotAvailable)?;
        self.integration_for(binding).await
    }

    /// Close cached integrations. Called at session end.
    pub async fn close(&self) {
        let mut cache = self.cache.lock().await;
        for (slug, integration) in cache.drain() {
            tracing::debug!(tool = %slug, "closing integration");
            integration.close().await;
        }
    }
}

fn validate_arguments(schema: &Value, instance: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("descriptor schema invalid: {e}"))?;
    if let Err(errors) = compiled.validate(instance) {
        let first = errors
            .into_iter()
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "validation failed".to_string());
        return Err(first);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;
    use voice_broker_core::ProviderSelection;

    struct SlowEcho {
        delay: Duration,
        tag: &'static str,
    }

    #[async_trait]
    impl ToolIntegration for SlowEcho {
        async fn execute(&self, _arguments: &Value) -> Result<Value, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({"success": true, "tag": self.tag}))
        }
    }

    fn agent_with(slugs: &[&str]) -> AgentProfile {
        let agent_id = Uuid::new_v4();
        AgentProfile {
            id: agent_id,
            name: "test".into(),
            system_prompt: "prompt".into(),
            stt: ProviderSelection::new("mock", json!({})),
            llm: ProviderSelection::new("ollama", json!({"model": "m"})),
            tts: ProviderSelection::new("mock", json!({})),
            tools: slugs
                .iter()
                .map(|slug| ToolBinding {
                    id: Uuid::new_v4(),
                    agent_id,
                    tool_slug: slug.to_string(),
                    integration_slug: "scripted".into(),
                    integration_config: json!({}),
                    enabled: true,
                })
                .collect(),
            rag: None,
        }
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    #[tokio::test]
    async fn test_results_preserve_request_order_despite_latency() {
        let agent = agent_with(&["slow_tool", "fast_tool"]);
        let resolver: IntegrationResolver = Arc::new(|binding: &ToolBinding| {
            let integration: Arc<dyn ToolIntegration> = if binding.tool_slug == "slow_tool" {
                Arc::new(SlowEcho { delay: Duration::from_millis(80), tag: "slow" })
            } else {
                Arc::new(SlowEcho { delay: Duration::from_millis(1), tag: "fast" })
            };
            Ok(integration)
        });
        let executor =
            SessionToolExecutor::with_resolver(&agent, resolver, ExecutorConfig::default());

        let results = executor
            .execute_calls(&[
                call("call_1", "slow_tool", "{}"),
                call("call_2", "fast_tool", "{}"),
            ])
            .await;

        assert_eq!(results[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("call_2"));
        assert!(results[0].text().contains("slow"));
        assert!(results[1].text().contains("fast"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recoverable_result() {
        let agent = agent_with(&[]);
        let executor = SessionToolExecutor::for_agent(&agent);
        let results = executor.execute_calls(&[call("c1", "missing", "{}")]).await;

        let payload: Value = serde_json::from_str(results[0].text()).unwrap();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error"], "tool not available");
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let agent = agent_with(&["slow_tool"]);
        let resolver: IntegrationResolver = Arc::new(|_: &ToolBinding| {
            Ok(Arc::new(SlowEcho { delay: Duration::from_millis(200), tag: "slow" })
                as Arc<dyn ToolIntegration>)
        });
        let executor = SessionToolExecutor::with_resolver(
            &agent,
            resolver,
            ExecutorConfig {
                call_timeout: Duration::from_millis(20),
            },
        );

        let results = executor.execute_calls(&[call("c1", "slow_tool", "{}")]).await;
        let payload: Value = serde_json::from_str(results[0].text()).unwrap();
        assert_eq!(payload["success"], false);
        assert!(payload["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_schema_validation_rejects_bad_arguments() {
        // product_stock requires `query`; registry descriptor drives this.
        let agent = agent_with(&["product_stock"]);
        let resolver: IntegrationResolver = Arc::new(|_: &ToolBinding| {
            Ok(Arc::new(SlowEcho { delay: Duration::from_millis(1), tag: "stock" })
                as Arc<dyn ToolIntegration>)
        });
        let executor =
            SessionToolExecutor::with_resolver(&agent, resolver, ExecutorConfig::default());

        let results = executor
            .execute_calls(&[call("c1", "product_stock", r#"{"unexpected": 1}"#)])
            .await;
        let payload: Value = serde_json::from_str(results[0].text()).unwrap();
        assert_eq!(payload["success"], false);
        assert!(payload["error"].as_str().unwrap().contains("invalid arguments"));
    }

    #[tokio::test]
    async fn test_integration_instances_are_cached_per_session() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CREATED: AtomicUsize = AtomicUsize::new(0);

        let agent = agent_with(&["echo_tool"]);
        let resolver: IntegrationResolver = Arc::new(|_: &ToolBinding| {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(SlowEcho { delay: Duration::from_millis(1), tag: "echo" })
                as Arc<dyn ToolIntegration>)
        });
        let executor =
            SessionToolExecutor::with_resolver(&agent, resolver, ExecutorConfig::default());

        executor.execute_calls(&[call("c1", "echo_tool", "{}")]).await;
        executor.execute_calls(&[call("c2", "echo_tool", "{}")]).await;
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    }
}
