//! Hook and guardrail middleware.
//!
//! Hooks wrap workflow lifecycle phases; guardrails wrap LLM output inside
//! the agent loop. Both run in declared order with modify-and-pass
//! semantics. Each hook link executes durably under
//! `{hook_name}.{identifier}.{index}` so replay never re-runs a completed
//! link.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use polos_domain::error::{Error, Result};
use polos_domain::{ConversationMessage, ToolCall};

use crate::context::ExecutionContext;
use crate::step::{RunOptions, Step};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookPhase {
    #[serde(rename = "onStart")]
    OnStart,
    #[serde(rename = "onEnd")]
    OnEnd,
}

/// The state a hook observes and may modify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub workflow_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub current_payload: Value,
    pub current_output: Option<Value>,
    pub phase: HookPhase,
}

/// What a hook decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_output: Option<Value>,
}

impl HookResult {
    pub fn proceed() -> Self {
        Self {
            continue_: true,
            error: None,
            modified_payload: None,
            modified_output: None,
        }
    }

    pub fn stop(error: impl Into<String>) -> Self {
        Self {
            continue_: false,
            error: Some(error.into()),
            modified_payload: None,
            modified_output: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.modified_payload = Some(payload);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.modified_output = Some(output);
        self
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &ExecutionContext, hook_ctx: &HookContext) -> Result<HookResult>;
}

/// Run a hook chain durably, threading payload/output modifications.
///
/// Returns the effective `(payload, output)` after every link ran. A link
/// with `continue = false` — or one that errored — stops the chain with
/// `HookFailure` carrying the hook's name.
pub async fn run_hooks(
    step: &Step,
    ctx: &ExecutionContext,
    hooks: &[Arc<dyn Hook>],
    identifier: &str,
    phase: HookPhase,
    payload: Value,
    output: Option<Value>,
) -> Result<(Value, Option<Value>)> {
    let mut payload = payload;
    let mut output = output;

    for (index, hook) in hooks.iter().enumerate() {
        let key = format!("{}.{identifier}.{index}", hook.name());
        let hook_ctx = HookContext {
            workflow_id: ctx.workflow_id.clone(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            current_payload: payload.clone(),
            current_output: output.clone(),
            phase,
        };

        // Errors are folded into the durable result so a failing hook is
        // replayed as "failed", never re-executed.
        let value = step
            .run(
                &key,
                || {
                    let hook = hook.clone();
                    let ctx = ctx;
                    let hook_ctx = hook_ctx.clone();
                    async move {
                        let result = match hook.run(ctx, &hook_ctx).await {
                            Ok(r) => r,
                            Err(e) => HookResult::stop(e.to_string()),
                        };
                        Ok(serde_json::to_value(result)?)
                    }
                },
                RunOptions::no_retry(),
            )
            .await?;

        let result: HookResult = serde_json::from_value(value)?;
        if !result.continue_ {
            return Err(Error::HookFailure {
                hook: hook.name().to_owned(),
                message: result
                    .error
                    .unwrap_or_else(|| "hook requested stop".to_owned()),
            });
        }
        if let Some(p) = result.modified_payload {
            payload = p;
        }
        if let Some(o) = result.modified_output {
            output = Some(o);
        }
    }

    Ok((payload, output))
}

// ── Combinators ─────────────────────────────────────────────────────

struct CompositeHook {
    name: String,
    hooks: Vec<Arc<dyn Hook>>,
}

#[async_trait]
impl Hook for CompositeHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecutionContext, hook_ctx: &HookContext) -> Result<HookResult> {
        let mut combined = HookResult::proceed();
        let mut current = hook_ctx.clone();

        for hook in &self.hooks {
            let result = hook.run(ctx, &current).await?;
            if !result.continue_ {
                return Ok(result);
            }
            if let Some(p) = result.modified_payload {
                current.current_payload = p.clone();
                combined.modified_payload = Some(p);
            }
            if let Some(o) = result.modified_output {
                current.current_output = Some(o.clone());
                combined.modified_output = Some(o);
            }
        }
        Ok(combined)
    }
}

/// Combine hooks into one link with composite naming.
pub fn compose_hooks(hooks: Vec<Arc<dyn Hook>>) -> Arc<dyn Hook> {
    let name = hooks
        .iter()
        .map(|h| h.name())
        .collect::<Vec<_>>()
        .join("+");
    Arc::new(CompositeHook { name, hooks })
}

struct ConditionalHook<P> {
    predicate: P,
    hook: Arc<dyn Hook>,
}

#[async_trait]
impl<P> Hook for ConditionalHook<P>
where
    P: Fn(&HookContext) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        self.hook.name()
    }

    async fn run(&self, ctx: &ExecutionContext, hook_ctx: &HookContext) -> Result<HookResult> {
        if !(self.predicate)(hook_ctx) {
            return Ok(HookResult::proceed());
        }
        self.hook.run(ctx, hook_ctx).await
    }
}

/// Gate a hook on a predicate over the hook context.
pub fn conditional_hook<P>(predicate: P, hook: Arc<dyn Hook>) -> Arc<dyn Hook>
where
    P: Fn(&HookContext) -> bool + Send + Sync + 'static,
{
    Arc::new(ConditionalHook { predicate, hook })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guardrails
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a guardrail observes: the LLM output of the current round plus the
/// conversation that produced it.
#[derive(Debug, Clone)]
pub struct GuardrailContext {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub messages: Vec<ConversationMessage>,
}

/// A guardrail's verdict on one LLM round.
#[derive(Debug, Clone)]
pub enum GuardrailOutcome {
    Continue,
    /// Continue with rewritten content and/or tool calls.
    Modify {
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
    },
    /// Re-issue the LLM call with this feedback appended as a user
    /// message. Bounded by the agent's `guardrail_max_retries`.
    Retry { feedback: String },
    /// Stop the agent loop.
    Fail { reason: String },
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn check(
        &self,
        ctx: &ExecutionContext,
        guard_ctx: &GuardrailContext,
    ) -> Result<GuardrailOutcome>;
}
