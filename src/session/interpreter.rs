//! Tool call interpretation and the continuation state machine.
//!
//! Models emit tool calls in one of two equivalent forms:
//!
//! ```text
//! <tool_call name="current_time" server="builtin">{"utc": true}</tool_call>
//!
//! {"tool_calls": [{"name": "current_time", "server": "builtin", "parameters": {"utc": true}}]}
//! ```
//!
//! The JSON form may be fenced in a code block or surrounded by prose.
//!
//! ```text
//! AwaitingModel -> Parsing -> Resolved
//!                         \-> Executing -> Continuing -> AwaitingModel
//!                         \-> Failed(MaxIterationsExceeded)
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::tools::schema::validate_parameters;
use crate::tools::ToolExecutor;
use crate::Result;

use super::message::{Message, ToolCallRequest, ToolCallStatus};

/// Why the loop stopped without resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFailure {
    MaxIterationsExceeded { iterations: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    Parsing,
    Executing,
    Continuing,
    Resolved,
    Failed(LoopFailure),
}

/// What to do with a finished model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// No tool calls; the conversation turn is done.
    Resolved,
    /// Run these calls, then continue.
    Execute(Vec<ToolCallRequest>),
    /// The model asked for tools but the iteration bound is reached.
    Exhausted(Vec<ToolCallRequest>),
}

fn tagged_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<tool_call\b([^>]*)>(.*?)</tool_call>").expect("valid tool_call regex")
    })
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
            .expect("valid attribute regex")
    })
}

fn json_form_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{\s*"tool_calls"\s*:"#).expect("valid tool_calls regex"))
}

fn parse_tagged(text: &str, out: &mut Vec<(usize, ToolCallRequest)>) {
    for caps in tagged_regex().captures_iter(text) {
        let (Some(whole), Some(attrs)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();

        let mut name = None;
        let mut server = String::new();
        let mut id = None;
        for attr in attr_regex().captures_iter(attrs.as_str()) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map_or("", |m| m.as_str())
                .to_string();
            match &attr[1] {
                "name" | "tool" => name = Some(value),
                "server" | "server_id" => server = value,
                "id" => id = Some(value),
                _ => {}
            }
        }

        let Some(name) = name.filter(|n| !n.is_empty()) else {
            warn!("Ignoring <tool_call> without a name");
            continue;
        };

        // Unparsable bodies are kept verbatim and rejected by validation.
        let parameters = if body.is_empty() {
            json!({})
        } else {
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
        };

        let mut request = ToolCallRequest::new(server, name, parameters);
        if let Some(id) = id {
            request = request.with_id(id);
        }
        out.push((whole.start(), request));
    }
}

fn request_from_json(item: &Value) -> Option<ToolCallRequest> {
    let function = item.get("function");
    let name = ["name", "tool", "tool_name"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .or_else(|| function.and_then(|f| f.get("name")).and_then(Value::as_str))?;
    let server = ["server", "server_id"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .unwrap_or_default();

    let raw = ["parameters", "arguments", "params"]
        .iter()
        .find_map(|k| item.get(*k))
        .or_else(|| function.and_then(|f| f.get("arguments")))
        .cloned()
        .unwrap_or_else(|| json!({}));
    // Some models send arguments as a JSON-encoded string
    let parameters = match raw {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    };

    let mut request = ToolCallRequest::new(server, name, parameters);
    if let Some(id) = item.get("id").and_then(Value::as_str) {
        request = request.with_id(id);
    }
    Some(request)
}

fn parse_json_form(text: &str, out: &mut Vec<(usize, ToolCallRequest)>) {
    let mut search_from = 0;
    while let Some(found) = json_form_regex().find_at(text, search_from) {
        let start = found.start();
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let parsed = values.next();
        let consumed = values.byte_offset();

        match parsed {
            Some(Ok(value)) => {
                if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
                    for (n, item) in calls.iter().enumerate() {
                        match request_from_json(item) {
                            // keep list order for calls sharing a start offset
                            Some(request) => out.push((start + n, request)),
                            None => warn!("Ignoring tool_calls entry without a name"),
                        }
                    }
                }
                search_from = start + consumed.max(1);
            }
            _ => {
                debug!("Skipping malformed tool_calls block at {}", start);
                search_from = found.end();
            }
        }
    }
}

/// Extract tool calls from model output, in order of appearance.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCallRequest> {
    let mut found = Vec::new();
    parse_tagged(text, &mut found);
    parse_json_form(text, &mut found);
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, r)| r).collect()
}

/// Drives one send's tool loop.
#[derive(Debug)]
pub struct ToolCallInterpreter {
    state: LoopState,
    iteration: usize,
    max_iterations: usize,
}

impl ToolCallInterpreter {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            state: LoopState::AwaitingModel,
            iteration: 0,
            max_iterations: max_iterations.max(1),
        }
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Model turns started so far.
    #[inline]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn expect(&self, expected: LoopState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "tool loop is {:?}, expected {:?}",
                self.state, expected
            )))
        }
    }

    /// Count a new model turn.
    pub fn begin_turn(&mut self) -> Result<usize> {
        self.expect(LoopState::AwaitingModel)?;
        self.iteration += 1;
        debug!("Tool loop iteration {}/{}", self.iteration, self.max_iterations);
        Ok(self.iteration)
    }

    /// Inspect a finished model turn.
    pub fn interpret(&mut self, turn: &str) -> Result<Interpretation> {
        self.expect(LoopState::AwaitingModel)?;
        self.state = LoopState::Parsing;

        let calls = parse_tool_calls(turn);
        if calls.is_empty() {
            self.state = LoopState::Resolved;
            return Ok(Interpretation::Resolved);
        }

        if self.iteration >= self.max_iterations {
            warn!(
                "Model requested {} tool call(s) after {} iterations; stopping",
                calls.len(),
                self.iteration
            );
            self.state = LoopState::Failed(LoopFailure::MaxIterationsExceeded {
                iterations: self.iteration,
            });
            return Ok(Interpretation::Exhausted(calls));
        }

        info!("Model requested {} tool call(s)", calls.len());
        self.state = LoopState::Executing;
        Ok(Interpretation::Execute(calls))
    }

    /// Validate and run each call in order, producing one `tool` message per
    /// call. Failures become messages too; they never abort the loop.
    pub async fn execute(
        &mut self,
        conversation_id: &str,
        calls: &mut [ToolCallRequest],
        executor: &dyn ToolExecutor,
    ) -> Result<Vec<Message>> {
        self.expect(LoopState::Executing)?;

        let mut results = Vec::with_capacity(calls.len());
        for call in calls.iter_mut() {
            let outcome = self.run_one(call, executor).await;
            let content = match outcome {
                Ok(output) => {
                    call.status = ToolCallStatus::Succeeded;
                    output
                }
                Err(e) => {
                    call.status = ToolCallStatus::Failed;
                    format!("Error: {e}")
                }
            };
            results.push(Message::tool_result(conversation_id, call.id.clone(), content));
        }

        self.state = LoopState::Continuing;
        Ok(results)
    }

    async fn run_one(&self, call: &mut ToolCallRequest, executor: &dyn ToolExecutor) -> Result<String> {
        let schema = executor
            .parameter_schema(&call.server_id, &call.tool_name)
            .ok_or_else(|| {
                Error::ToolValidation(format!("unknown tool {}/{}", call.server_id, call.tool_name))
            })?;
        if let Err(e) = validate_parameters(&schema, &call.parameters) {
            debug!("Tool {} rejected: {}", call.tool_name, e);
            return Err(e);
        }

        call.status = ToolCallStatus::Executing;
        debug!("Executing tool {}/{} ({})", call.server_id, call.tool_name, call.id);
        match executor
            .execute(&call.server_id, &call.tool_name, call.parameters.clone())
            .await
        {
            Ok(output) => {
                debug!("Tool {} succeeded: {} chars", call.tool_name, output.len());
                Ok(output)
            }
            Err(e @ Error::ToolExecution(_)) => Err(e),
            Err(e) => Err(Error::ToolExecution(e.to_string())),
        }
    }

    /// Hand control back to the model after tool results were recorded.
    pub fn continue_loop(&mut self) -> Result<()> {
        self.expect(LoopState::Continuing)?;
        self.state = LoopState::AwaitingModel;
        Ok(())
    }
}
