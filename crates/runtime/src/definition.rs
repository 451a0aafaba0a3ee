//! Workflow, tool, and agent definitions.
//!
//! A definition is declarative config plus a handler, immutable after
//! registration and shared read-only across executions. Tools add an
//! LLM-facing description, a JSON-schema parameter spec, and an approval
//! policy; agents swap the handler for the built-in LLM ⇄ tool loop.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use polos_domain::error::{Error, Result};
use polos_domain::StepInfo;
use polos_llm::LlmProvider;

use crate::context::WorkflowContext;
use crate::hooks::{Guardrail, Hook};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kind / trigger / queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    Workflow,
    Tool,
    Agent,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Workflow => "workflow",
            WorkflowKind::Tool => "tool",
            WorkflowKind::Agent => "agent",
        }
    }
}

/// What causes executions of this workflow to be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Cron expression evaluated by the orchestrator.
    Cron(String),
    /// Fires on events published to a topic.
    Event(String),
    Manual,
}

/// Binding to a named concurrency-limited dispatch lane.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub name: String,
    pub concurrency_limit: Option<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque validator attached to a definition's input/state/output.
pub trait Schema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<()>;

    /// The JSON-schema document, when one exists (embedded in structured
    /// output fix-up prompts and tool registrations).
    fn json_schema(&self) -> Option<Value> {
        None
    }
}

/// Shallow JSON-schema validator: checks the top-level `type` and, for
/// objects, that `required` properties are present.
pub struct JsonSchema {
    schema: Value,
}

impl JsonSchema {
    pub fn new(schema: Value) -> Arc<Self> {
        Arc::new(Self { schema })
    }
}

impl Schema for JsonSchema {
    fn validate(&self, value: &Value) -> Result<()> {
        if let Some(ty) = self.schema.get("type").and_then(Value::as_str) {
            let ok = match ty {
                "object" => value.is_object(),
                "array" => value.is_array(),
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "null" => value.is_null(),
                _ => true,
            };
            if !ok {
                return Err(Error::Validation(format!("expected {ty}")));
            }
        }
        if let (Some(required), Some(obj)) = (
            self.schema.get("required").and_then(Value::as_array),
            value.as_object(),
        ) {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    return Err(Error::Validation(format!("missing required field '{field}'")));
                }
            }
        }
        Ok(())
    }

    fn json_schema(&self) -> Option<Value> {
        Some(self.schema.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The user function executed for workflow and tool definitions.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: Arc<WorkflowContext>, payload: Value) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arc<WorkflowContext>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, ctx: Arc<WorkflowContext>, payload: Value) -> Result<Value> {
        (self.0)(ctx, payload).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<WorkflowContext>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When a tool execution requires a human in the loop.
pub enum ApprovalPolicy {
    /// Never gate.
    None,
    /// Gate every invocation.
    Always,
    /// Gate only when a string argument matches one of the patterns.
    PathRestricted(regex::RegexSet),
}

impl ApprovalPolicy {
    /// Compile a path-restricted policy from regex patterns.
    pub fn path_restricted<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        regex::RegexSet::new(patterns)
            .map(ApprovalPolicy::PathRestricted)
            .map_err(|e| Error::Config(format!("invalid approval pattern: {e}")))
    }

    /// Whether invoking with `args` requires approval.
    pub fn requires_approval(&self, args: &Value) -> bool {
        match self {
            ApprovalPolicy::None => false,
            ApprovalPolicy::Always => true,
            ApprovalPolicy::PathRestricted(set) => any_string_matches(args, set),
        }
    }
}

fn any_string_matches(value: &Value, set: &regex::RegexSet) -> bool {
    match value {
        Value::String(s) => set.is_match(s),
        Value::Array(items) => items.iter().any(|v| any_string_matches(v, set)),
        Value::Object(map) => map.values().any(|v| any_string_matches(v, set)),
        _ => false,
    }
}

/// LLM-facing tool metadata.
pub struct ToolConfig {
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    pub approval: ApprovalPolicy,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop conditions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Predicate over the agent's step history that terminates the loop.
#[async_trait]
pub trait StopCondition: Send + Sync {
    fn name(&self) -> &str;

    /// When this condition is itself a step cap, the cap value. Its
    /// presence disables the env-derived safety bound.
    fn max_steps(&self) -> Option<u32> {
        None
    }

    async fn evaluate(&self, steps: &[StepInfo]) -> Result<bool>;
}

/// Stop after N agent steps.
pub struct MaxSteps(pub u32);

#[async_trait]
impl StopCondition for MaxSteps {
    fn name(&self) -> &str {
        "max_steps"
    }

    fn max_steps(&self) -> Option<u32> {
        Some(self.0)
    }

    async fn evaluate(&self, steps: &[StepInfo]) -> Result<bool> {
        Ok(steps.len() as u32 >= self.0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation compaction settings.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub max_conversation_tokens: u64,
    pub max_summary_tokens: u64,
    pub min_recent_messages: usize,
    /// Model used for summarisation; `None` = the agent's own model.
    pub model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_conversation_tokens: 80_000,
            max_summary_tokens: 20_000,
            min_recent_messages: 2,
            model: None,
        }
    }
}

/// Configuration of an agent definition: the LLM, its tools, and the
/// middleware around the loop.
pub struct AgentConfig {
    pub llm: Arc<dyn LlmProvider>,
    /// Provider label reported at registration (e.g. "openai").
    pub provider: String,
    pub system_prompt: String,
    /// Tool workflow ids this agent may call.
    pub tools: Vec<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub guardrails: Vec<Arc<dyn Guardrail>>,
    pub stop_conditions: Vec<Arc<dyn StopCondition>>,
    pub on_agent_step_start: Vec<Arc<dyn Hook>>,
    pub on_agent_step_end: Vec<Arc<dyn Hook>>,
    pub on_tool_start: Vec<Arc<dyn Hook>>,
    pub on_tool_end: Vec<Arc<dyn Hook>>,
    pub compaction: CompactionConfig,
    pub guardrail_max_retries: u32,
}

impl AgentConfig {
    pub fn new(llm: Arc<dyn LlmProvider>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            provider: "custom".into(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            temperature: None,
            max_output_tokens: None,
            guardrails: Vec::new(),
            stop_conditions: Vec::new(),
            on_agent_step_start: Vec::new(),
            on_agent_step_end: Vec::new(),
            on_tool_start: Vec::new(),
            on_tool_end: Vec::new(),
            compaction: CompactionConfig::default(),
            guardrail_max_retries: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition + builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered workflow, tool, or agent. Immutable after registration.
pub struct WorkflowDefinition {
    pub id: String,
    pub kind: WorkflowKind,
    pub trigger: Option<Trigger>,
    pub queue: Option<QueueBinding>,
    pub input_schema: Option<Arc<dyn Schema>>,
    pub state_schema: Option<Arc<dyn Schema>>,
    pub output_schema: Option<Arc<dyn Schema>>,
    pub on_start: Vec<Arc<dyn Hook>>,
    pub on_end: Vec<Arc<dyn Hook>>,
    /// `None` only for agents, whose handler is the built-in loop.
    pub handler: Option<Arc<dyn Handler>>,
    pub tool: Option<ToolConfig>,
    pub agent: Option<AgentConfig>,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trigger", &self.trigger)
            .field("queue", &self.queue)
            .field("has_tool", &self.tool.is_some())
            .field("has_agent", &self.agent.is_some())
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn workflow(id: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder::new(id, WorkflowKind::Workflow)
    }

    /// A tool: a workflow with LLM-facing description and parameters.
    pub fn tool(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> DefinitionBuilder {
        let mut builder = DefinitionBuilder::new(id, WorkflowKind::Tool);
        builder.tool = Some(ToolConfig {
            description: description.into(),
            parameters,
            approval: ApprovalPolicy::None,
        });
        builder
    }

    /// An agent: a workflow whose handler is the LLM ⇄ tool loop.
    pub fn agent(id: impl Into<String>, config: AgentConfig) -> DefinitionBuilder {
        let mut builder = DefinitionBuilder::new(id, WorkflowKind::Agent);
        builder.agent = Some(config);
        builder
    }

    pub fn is_workflow(&self) -> bool {
        self.kind == WorkflowKind::Workflow
    }

    pub fn is_tool(&self) -> bool {
        self.kind == WorkflowKind::Tool
    }

    pub fn is_agent(&self) -> bool {
        self.kind == WorkflowKind::Agent
    }
}

/// Fluent builder for [`WorkflowDefinition`].
pub struct DefinitionBuilder {
    id: String,
    kind: WorkflowKind,
    trigger: Option<Trigger>,
    queue: Option<QueueBinding>,
    input_schema: Option<Arc<dyn Schema>>,
    state_schema: Option<Arc<dyn Schema>>,
    output_schema: Option<Arc<dyn Schema>>,
    on_start: Vec<Arc<dyn Hook>>,
    on_end: Vec<Arc<dyn Hook>>,
    handler: Option<Arc<dyn Handler>>,
    tool: Option<ToolConfig>,
    agent: Option<AgentConfig>,
}

impl DefinitionBuilder {
    fn new(id: impl Into<String>, kind: WorkflowKind) -> Self {
        Self {
            id: id.into(),
            kind,
            trigger: None,
            queue: None,
            input_schema: None,
            state_schema: None,
            output_schema: None,
            on_start: Vec::new(),
            on_end: Vec::new(),
            handler: None,
            tool: None,
            agent: None,
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn queue(mut self, name: impl Into<String>, concurrency_limit: Option<usize>) -> Self {
        self.queue = Some(QueueBinding {
            name: name.into(),
            concurrency_limit,
        });
        self
    }

    pub fn input_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn state_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.state_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn on_start(mut self, hook: Arc<dyn Hook>) -> Self {
        self.on_start.push(hook);
        self
    }

    pub fn on_end(mut self, hook: Arc<dyn Hook>) -> Self {
        self.on_end.push(hook);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the approval policy (tools only).
    pub fn approval(mut self, approval: ApprovalPolicy) -> Self {
        if let Some(tool) = self.tool.as_mut() {
            tool.approval = approval;
        }
        self
    }

    pub fn build(self) -> Result<Arc<WorkflowDefinition>> {
        match self.kind {
            WorkflowKind::Agent => {
                if self.agent.is_none() {
                    return Err(Error::Config(format!(
                        "agent '{}' has no agent configuration",
                        self.id
                    )));
                }
            }
            _ => {
                if self.handler.is_none() {
                    return Err(Error::Config(format!(
                        "{} '{}' has no handler",
                        self.kind.as_str(),
                        self.id
                    )));
                }
            }
        }
        Ok(Arc::new(WorkflowDefinition {
            id: self.id,
            kind: self.kind,
            trigger: self.trigger,
            queue: self.queue,
            input_schema: self.input_schema,
            state_schema: self.state_schema,
            output_schema: self.output_schema,
            on_start: self.on_start,
            on_end: self.on_end,
            handler: self.handler,
            tool: self.tool,
            agent: self.agent,
        }))
    }

    /// Build and register in the process-wide registry.
    pub fn register(self) -> Result<Arc<WorkflowDefinition>> {
        let def = self.build()?;
        crate::registry::global_registry().register(def.clone())?;
        Ok(def)
    }
}
