//! The agent execution loop: LLM call → tool dispatch → stop conditions →
//! structured output, with hook and guardrail middleware, durable session
//! memory, and streaming event emission.
//!
//! Every LLM round, hook link, stop-condition evaluation, and tool batch
//! runs under the durable step protocol, so a loop suspended mid-flight on
//! a tool batch replays deterministically to the same point.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use polos_domain::error::{Error, Result};
use polos_domain::{
    ConversationMessage, StepInfo, ToolCall, ToolResultInfo, ToolResultStatus, Usage,
};
use polos_llm::{collect_stream, ChatRequest, LlmProvider, StreamEvent, StreamSink, ToolSpec};
use polos_protocol::{event_types, SessionMemory};

use crate::context::WorkflowContext;
use crate::definition::{AgentConfig, Schema, WorkflowDefinition};
use crate::hooks::{run_hooks, GuardrailContext, GuardrailOutcome, HookPhase};
use crate::memory::{compact_if_needed, strip_summary_pair, summary_pair};
use crate::step::{sub_result_to_text, InvokeOptions, RunOptions, Step, SUB_ERROR_KEY};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input / output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The user input to an agent run.
#[derive(Debug, Clone)]
pub enum AgentInput {
    Text(String),
    Messages(Vec<ConversationMessage>),
}

/// Parsed agent payload: `{"input": ..., "streaming": bool}` or a bare
/// string.
#[derive(Debug, Clone)]
pub struct AgentRunInput {
    pub input: AgentInput,
    pub streaming: bool,
}

impl AgentRunInput {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        if let Some(text) = payload.as_str() {
            return Ok(Self {
                input: AgentInput::Text(text.to_owned()),
                streaming: false,
            });
        }
        let input_value = payload
            .get("input")
            .ok_or_else(|| Error::Validation("agent payload missing 'input'".into()))?;
        let input = if let Some(text) = input_value.as_str() {
            AgentInput::Text(text.to_owned())
        } else {
            AgentInput::Messages(
                serde_json::from_value(input_value.clone())
                    .map_err(|e| Error::Validation(format!("invalid agent input: {e}")))?,
            )
        };
        let streaming = payload
            .get("streaming")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self { input, streaming })
    }
}

/// What an agent run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub agent_run_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_schema: Option<Value>,
    pub tool_results: Vec<ToolResultInfo>,
    pub total_steps: u32,
    pub usage: Usage,
}

/// One durable LLM round: the response after guardrails settled, plus the
/// feedback messages any guardrail retries appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmRound {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_output: Option<Value>,
    #[serde(default)]
    guardrail_feedback: Vec<String>,
    #[serde(default)]
    guardrail_retries: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Publishes text deltas on the execution topic while the provider is
/// streaming. Tool-call events are published at dispatch time instead so
/// the streaming and non-streaming paths emit the same sequence.
struct TopicSink {
    step: Step,
}

#[async_trait::async_trait]
impl StreamSink for TopicSink {
    async fn on_event(&self, event: &StreamEvent) {
        if let StreamEvent::TextDelta { text } = event {
            publish_logged(&self.step, event_types::TEXT_DELTA, json!({ "text": text })).await;
        }
    }
}

/// Fire-and-forget event publication; failures log, never fail the run.
async fn publish_logged(step: &Step, event_type: &str, data: Value) {
    if let Err(e) = step.publish_workflow_event(Some(event_type), data).await {
        tracing::warn!(event_type, error = %e, "event publication failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_agent — the loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute the agent loop for `def`, returning the serialized
/// [`AgentRunResult`].
pub async fn run_agent(
    wctx: &Arc<WorkflowContext>,
    def: &WorkflowDefinition,
    payload: Value,
    agent_max_steps_default: u32,
) -> Result<Value> {
    let agent = def
        .agent
        .as_ref()
        .ok_or_else(|| Error::Config(format!("'{}' is not an agent", def.id)))?;
    let ctx = &wctx.execution;
    let step = &wctx.step;
    let run_input = AgentRunInput::from_payload(&payload)?;

    // ── Initialisation ───────────────────────────────────────────────
    let mut compaction_cfg = agent.compaction.clone();
    if compaction_cfg.model.is_none() {
        compaction_cfg.model = Some(agent.llm.model().to_owned());
    }

    let mut conversation: Vec<ConversationMessage> = Vec::new();
    let mut current_summary: Option<String> = None;

    if let Some(session_id) = ctx.session_id.clone() {
        let memory_value = step
            .run(
                "load_session_memory",
                || {
                    let session_id = session_id.clone();
                    async move {
                        let memory = step.client().get_session_memory(&session_id).await?;
                        Ok(serde_json::to_value(memory)?)
                    }
                },
                RunOptions::default(),
            )
            .await?;
        let memory: SessionMemory = serde_json::from_value(memory_value)?;
        if let Some(summary) = memory.summary {
            conversation.extend(summary_pair(&summary));
            current_summary = Some(summary);
        }
        conversation.extend(memory.messages);
    }

    match run_input.input {
        AgentInput::Text(text) => conversation.push(ConversationMessage::user(text)),
        AgentInput::Messages(messages) => conversation.extend(messages),
    }

    // A `max_steps` stop condition disables the env-derived safety cap.
    let has_max_steps = agent
        .stop_conditions
        .iter()
        .any(|sc| sc.max_steps().is_some());
    let safety_bound = if has_max_steps {
        None
    } else {
        Some(agent_max_steps_default)
    };

    let tool_specs = resolve_tool_specs(wctx, agent);
    let tools_enabled = !tool_specs.is_empty();
    let result_schema = def.output_schema.as_ref().and_then(|s| s.json_schema());

    let sink = TopicSink { step: step.clone() };
    let mut steps: Vec<StepInfo> = Vec::new();
    let mut all_tool_results: Vec<ToolResultInfo> = Vec::new();
    let mut total_usage = Usage::default();
    let mut agent_step: u32 = 1;
    let mut output_retry_used = false;
    let mut final_content = String::new();
    let mut final_value: Option<Value> = None;

    // ── Main cycle ───────────────────────────────────────────────────
    loop {
        if let Some(bound) = safety_bound {
            // Bound compared before increment; a run stopped here reports
            // total_steps = bound + 1.
            if agent_step > bound {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    bound,
                    "agent safety step bound reached, terminating with last content"
                );
                break;
            }
        }

        // 1. onAgentStepStart hooks may rewrite the conversation.
        if !agent.on_agent_step_start.is_empty() {
            let (modified, _) = run_hooks(
                step,
                ctx,
                &agent.on_agent_step_start,
                &format!("{agent_step}.on_agent_step_start"),
                HookPhase::OnStart,
                serde_json::to_value(&conversation)?,
                None,
            )
            .await?;
            conversation = serde_json::from_value(modified)?;
        }

        // 2. Compact when the token estimate exceeds the budget.
        if compaction_cfg.enabled {
            let outcome = compact_if_needed(
                &conversation,
                current_summary.as_deref(),
                &compaction_cfg,
                agent.llm.as_ref(),
            )
            .await?;
            if outcome.compacted {
                conversation = outcome.messages;
                current_summary = outcome.summary;
            }
        }

        // 3. The LLM round (durable, including the guardrail loop).
        let round: LlmRound = {
            let conversation_snapshot = conversation.clone();
            let tool_specs_ref = tool_specs.as_slice();
            let output_schema = def.output_schema.as_deref();
            let sink_ref = &sink;
            let streaming = run_input.streaming;
            let value = step
                .run(
                    &format!("{agent_step}.llm_call"),
                    || {
                        let conversation = conversation_snapshot.clone();
                        async move {
                            let round = llm_round(
                                agent,
                                &conversation,
                                tool_specs_ref,
                                tools_enabled,
                                output_schema,
                                streaming,
                                sink_ref,
                                step,
                                ctx,
                            )
                            .await?;
                            Ok(serde_json::to_value(round)?)
                        }
                    },
                    RunOptions::no_retry(),
                )
                .await?;
            serde_json::from_value(value)?
        };

        // Guardrail feedback messages become part of the history.
        for feedback in &round.guardrail_feedback {
            conversation.push(ConversationMessage::user(feedback.clone()));
        }

        // 4. Accumulate usage.
        if let Some(usage) = &round.usage {
            total_usage.add(usage);
        }

        // 5. Dispatch tool calls.
        let mut step_tool_results: Vec<ToolResultInfo> = Vec::new();
        if !round.tool_calls.is_empty() {
            conversation.push(ConversationMessage::assistant_tool_calls(
                round.content.clone(),
                round.tool_calls.clone(),
            ));

            step_tool_results = dispatch_tools(wctx, agent, &round.tool_calls, agent_step, &mut conversation).await?;
            all_tool_results.extend(step_tool_results.clone());
        } else if !round.content.is_empty() {
            conversation.push(ConversationMessage::assistant(round.content.clone()));
        }

        // 6. Record the step; onAgentStepEnd hooks may rewrite it.
        let mut info = StepInfo {
            step: agent_step,
            content: round.content.clone(),
            tool_calls: round.tool_calls.clone(),
            tool_results: step_tool_results,
            usage: round.usage.clone().unwrap_or_default(),
            raw_output: round.raw_output.clone(),
        };
        if !agent.on_agent_step_end.is_empty() {
            let (modified, _) = run_hooks(
                step,
                ctx,
                &agent.on_agent_step_end,
                &format!("{agent_step}.on_agent_step_end"),
                HookPhase::OnEnd,
                serde_json::to_value(&info)?,
                None,
            )
            .await?;
            info = serde_json::from_value(modified)?;
        }
        publish_logged(
            step,
            event_types::STEP_FINISH,
            json!({ "step": info.step, "content": info.content }),
        )
        .await;
        steps.push(info);

        // 7. Terminate?
        let mut terminating = round.tool_calls.is_empty();
        if !terminating {
            for (i, condition) in agent.stop_conditions.iter().enumerate() {
                let key = format!("{agent_step}.stop_condition.{}.{i}", condition.name());
                let value = step
                    .run(
                        &key,
                        || {
                            let condition = condition.clone();
                            let steps = steps.clone();
                            async move { Ok(json!(condition.evaluate(&steps).await?)) }
                        },
                        RunOptions::no_retry(),
                    )
                    .await?;
                if value.as_bool().unwrap_or(false) {
                    terminating = true;
                    break;
                }
            }
        }

        // 8. Structured-output parse, with one fix-up retry.
        final_content = round.content.clone();
        if terminating {
            if let Some(schema) = &def.output_schema {
                match parse_structured_output(&final_content, schema.as_ref()) {
                    Ok(value) => final_value = Some(value),
                    Err(e) if !output_retry_used => {
                        output_retry_used = true;
                        terminating = false;
                        let schema_text = schema
                            .json_schema()
                            .map(|s| s.to_string())
                            .unwrap_or_default();
                        conversation.push(ConversationMessage::user(format!(
                            "Your previous response could not be parsed as the required \
                             structured output ({e}). Respond ONLY with JSON matching this \
                             schema:\n{schema_text}"
                        )));
                    }
                    Err(e) => {
                        return Err(Error::Validation(format!(
                            "structured output failed after retry: {e}"
                        )))
                    }
                }
            }
        }

        // 9.
        if terminating {
            break;
        }
        agent_step += 1;
    }

    // ── Finalisation ─────────────────────────────────────────────────
    if let Some(session_id) = ctx.session_id.clone() {
        let (stripped_summary, stored_messages) = strip_summary_pair(&conversation);
        let memory = SessionMemory {
            summary: stripped_summary.or(current_summary),
            messages: stored_messages,
        };
        step.run(
            "store_session_memory",
            || {
                let session_id = session_id.clone();
                let memory = memory.clone();
                async move {
                    step.client().put_session_memory(&session_id, &memory).await?;
                    Ok(json!(true))
                }
            },
            RunOptions::default(),
        )
        .await?;
    }

    let agent_run_id = step.uuid("agent_run_id").await?;
    let result = AgentRunResult {
        agent_run_id,
        result: final_value.unwrap_or_else(|| json!(final_content)),
        result_schema,
        tool_results: all_tool_results,
        total_steps: agent_step,
        usage: total_usage,
    };

    publish_logged(
        step,
        event_types::AGENT_FINISH,
        json!({
            "agent_run_id": result.agent_run_id,
            "total_steps": result.total_steps,
            "usage": result.usage,
        }),
    )
    .await;

    Ok(serde_json::to_value(result)?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One LLM round with guardrails
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn llm_round(
    agent: &AgentConfig,
    conversation: &[ConversationMessage],
    tool_specs: &[ToolSpec],
    tools_enabled: bool,
    output_schema: Option<&dyn Schema>,
    streaming: bool,
    sink: &TopicSink,
    step: &Step,
    ctx: &crate::context::ExecutionContext,
) -> Result<LlmRound> {
    // Guardrails need the whole response up-front, so they force the
    // non-streaming path.
    let use_streaming = streaming && agent.guardrails.is_empty();
    let mut feedback: Vec<String> = Vec::new();
    let mut retries: u32 = 0;

    loop {
        let mut messages = Vec::with_capacity(conversation.len() + feedback.len() + 1);
        messages.push(ConversationMessage::system(agent.system_prompt.clone()));
        messages.extend_from_slice(conversation);
        messages.extend(feedback.iter().map(|f| ConversationMessage::user(f.clone())));

        // The schema only travels when no tools are enabled; providers
        // reject tool-use combined with a response format.
        let response_schema = if tools_enabled {
            None
        } else {
            output_schema.and_then(Schema::json_schema)
        };

        let req = ChatRequest {
            messages,
            tools: tool_specs.to_vec(),
            temperature: agent.temperature,
            max_tokens: agent.max_output_tokens,
            response_schema,
            model: None,
        };

        let resp = if use_streaming {
            let stream = agent.llm.stream(req).await?;
            collect_stream(stream, sink, agent.llm.model()).await?
        } else {
            agent.llm.generate(req).await?
        };

        let mut content = resp.content;
        let mut tool_calls = resp.tool_calls;
        let mut retry_feedback: Option<String> = None;

        for guardrail in &agent.guardrails {
            let guard_ctx = GuardrailContext {
                content: Some(content.clone()),
                tool_calls: tool_calls.clone(),
                messages: conversation.to_vec(),
            };
            match guardrail.check(ctx, &guard_ctx).await? {
                GuardrailOutcome::Continue => {}
                GuardrailOutcome::Modify {
                    content: new_content,
                    tool_calls: new_calls,
                } => {
                    if let Some(c) = new_content {
                        content = c;
                    }
                    if let Some(t) = new_calls {
                        tool_calls = t;
                    }
                }
                GuardrailOutcome::Retry { feedback: f } => {
                    retry_feedback = Some(f);
                    break;
                }
                GuardrailOutcome::Fail { reason } => {
                    return Err(Error::GuardrailFailure(format!(
                        "{}: {reason}",
                        guardrail.name()
                    )))
                }
            }
        }

        if let Some(f) = retry_feedback {
            if retries >= agent.guardrail_max_retries {
                return Err(Error::GuardrailFailure(format!(
                    "guardrail retries exhausted after {retries} attempts"
                )));
            }
            retries += 1;
            feedback.push(f);
            continue;
        }

        // Streaming was requested but disabled by guardrails: emit one
        // synthetic delta so downstream consumers still see the final text.
        if streaming && !use_streaming && !content.is_empty() {
            publish_logged(step, event_types::TEXT_DELTA, json!({ "text": content })).await;
        }

        return Ok(LlmRound {
            content,
            tool_calls,
            usage: resp.usage,
            raw_output: resp.raw_output,
            guardrail_feedback: feedback,
            guardrail_retries: retries,
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the agent's tool ids to LLM-facing specs, skipping ids with no
/// registered tool definition.
fn resolve_tool_specs(wctx: &WorkflowContext, agent: &AgentConfig) -> Vec<ToolSpec> {
    agent
        .tools
        .iter()
        .filter_map(|id| {
            let def = wctx.registry.get(id)?;
            let tool = match &def.tool {
                Some(t) => t,
                None => {
                    tracing::warn!(tool = %id, "configured tool has no tool metadata, skipping");
                    return None;
                }
            };
            Some(ToolSpec {
                name: id.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
        })
        .collect()
}

/// Dispatch one round's tool calls through the durable batch step and
/// append their results to the conversation.
async fn dispatch_tools(
    wctx: &Arc<WorkflowContext>,
    agent: &AgentConfig,
    tool_calls: &[ToolCall],
    agent_step: u32,
    conversation: &mut Vec<ConversationMessage>,
) -> Result<Vec<ToolResultInfo>> {
    let step = &wctx.step;
    let ctx = &wctx.execution;

    let mut entries: Vec<(String, Value)> = Vec::new();
    let mut dispatched: Vec<ToolCall> = Vec::new();

    for (i, call) in tool_calls.iter().enumerate() {
        if wctx.registry.get(&call.function.name).is_none() {
            tracing::warn!(
                tool = %call.function.name,
                call_id = %call.call_id,
                "unknown tool requested by model, skipping"
            );
            continue;
        }

        let mut args = call.parsed_arguments();
        if !agent.on_tool_start.is_empty() {
            let (modified, _) = run_hooks(
                step,
                ctx,
                &agent.on_tool_start,
                &format!("{agent_step}.on_tool_start.{i}"),
                HookPhase::OnStart,
                args,
                None,
            )
            .await?;
            args = modified;
        }

        publish_logged(
            step,
            event_types::TOOL_CALL,
            json!({
                "call_id": call.call_id,
                "tool_name": call.function.name,
                "arguments": args,
            }),
        )
        .await;

        entries.push((call.function.name.clone(), args));
        dispatched.push(call.clone());
    }

    if entries.is_empty() {
        return Ok(Vec::new());
    }

    // Tool failures are not retried here — they come back as error values
    // the LLM can react to.
    let results = step
        .batch_invoke_and_wait(
            &format!("execute_tools:step_{agent_step}"),
            entries,
            InvokeOptions::default(),
        )
        .await?;

    let mut infos = Vec::with_capacity(results.len());
    for (i, (call, mut result)) in dispatched.into_iter().zip(results).enumerate() {
        if !agent.on_tool_end.is_empty() {
            let (modified, _) = run_hooks(
                step,
                ctx,
                &agent.on_tool_end,
                &format!("{agent_step}.on_tool_end.{i}"),
                HookPhase::OnEnd,
                result,
                None,
            )
            .await?;
            result = modified;
        }

        let failed = result.get(SUB_ERROR_KEY).is_some();
        let text = sub_result_to_text(&result);

        publish_logged(
            step,
            event_types::TOOL_RESULT,
            json!({
                "call_id": call.call_id,
                "tool_name": call.function.name,
                "content": text,
                "is_error": failed,
            }),
        )
        .await;

        conversation.push(ConversationMessage::tool_result(&call.call_id, &text));
        infos.push(ToolResultInfo {
            id: call.call_id,
            name: call.function.name,
            status: if failed {
                ToolResultStatus::Failed
            } else {
                ToolResultStatus::Completed
            },
            result: if failed { json!(text) } else { result },
        });
    }

    Ok(infos)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Structured output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse the final LLM content against the output schema, tolerating
/// markdown code fences.
fn parse_structured_output(content: &str, schema: &dyn Schema) -> Result<Value> {
    let stripped = strip_code_fences(content);
    let value: Value = serde_json::from_str(stripped.trim())
        .map_err(|e| Error::Validation(format!("not valid JSON: {e}")))?;
    schema.validate(&value)?;
    Ok(value)
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", etc.) on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
