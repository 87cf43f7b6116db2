//! Tools the remote model may call, and the dispatcher that runs them.
//!
//! A `ToolDefinition` pairs a declared JSON-schema parameter shape with a
//! handler. The `ToolDispatcher` watches the event flow: it invokes each
//! tool call once per item id, reports the result back to the session, and
//! asks for a follow-up response when a turn ended with tool calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, VoxformError};
use crate::session::{ConversationEvent, ConversationItem, ItemFinished, RealtimeSession};

/// Name of the single tool bound to the shared form record.
pub const SAVE_MODEL_DATA: &str = "Save_ModelData";

/// Key the model may wrap the record under when calling `Save_ModelData`.
pub const MODEL_DATA_KEY: &str = "modelData";

/// Tool declaration as sent in the session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
}

type Handler = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// A named tool: its declaration plus the bound handler.
#[derive(Clone)]
pub struct ToolDefinition {
    spec: ToolSpec,
    handler: Arc<Handler>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.spec.name)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    /// Untyped tool over raw JSON arguments.
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Run the handler on already-parsed arguments.
    pub fn invoke(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments)
    }
}

/// Build a tool whose arguments deserialize into `T`.
///
/// The declared schema is generated from `T`. A single-key object
/// `{"modelData": ...}` is unwrapped before deserializing.
pub fn typed_tool<T, F>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: F,
) -> Result<ToolDefinition>
where
    T: DeserializeOwned + JsonSchema,
    F: Fn(T) -> Result<Value> + Send + Sync + 'static,
{
    let name = name.into();
    let parameters = schema_value::<T>()?;
    let tool_name = name.clone();
    Ok(ToolDefinition::new(name, description, parameters, move |args| {
        let value: T = serde_json::from_value(unwrap_model_data(args)).map_err(|e| {
            VoxformError::ToolDispatch {
                tool: tool_name.clone(),
                reason: format!("invalid arguments: {e}"),
            }
        })?;
        handler(value)
    }))
}

/// The `Save_ModelData` tool: replaces the whole record with the model's
/// version. Declared as `{ modelData: <record> }`.
pub fn save_model_data_tool<M, F>(on_update: F) -> Result<ToolDefinition>
where
    M: DeserializeOwned + JsonSchema,
    F: Fn(M) -> Result<()> + Send + Sync + 'static,
{
    let mut tool = typed_tool::<M, _>(
        SAVE_MODEL_DATA,
        "Saves the updated form data. Always pass every field, including unchanged ones.",
        move |model| {
            on_update(model)?;
            Ok(Value::Null)
        },
    )?;
    tool.spec.parameters = wrap_parameter(MODEL_DATA_KEY, tool.spec.parameters);
    Ok(tool)
}

/// JSON schema of `T` as a plain value.
pub fn schema_value<T: JsonSchema>() -> Result<Value> {
    let schema = schemars::schema_for!(T);
    Ok(serde_json::to_value(&schema)?)
}

/// Nest `schema` under one required property, hoisting `$defs` so local
/// references keep resolving.
fn wrap_parameter(key: &str, schema: Value) -> Value {
    let mut inner = match schema {
        Value::Object(map) => map,
        other => return json!({ "type": "object", "properties": { key: other }, "required": [key] }),
    };
    inner.remove("$schema");
    let defs = inner.remove("$defs");

    let mut outer = Map::new();
    outer.insert("type".into(), json!("object"));
    outer.insert("properties".into(), json!({ key: Value::Object(inner) }));
    outer.insert("required".into(), json!([key]));
    if let Some(defs) = defs {
        outer.insert("$defs".into(), defs);
    }
    Value::Object(outer)
}

fn unwrap_model_data(args: Value) -> Value {
    match args {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(MODEL_DATA_KEY) => {
            map.remove(MODEL_DATA_KEY).unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Named tools. Names are unique.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDefinition) -> Result<()> {
        if self.by_name.contains_key(tool.name()) {
            return Err(anyhow!("tool `{}` is already registered", tool.name()).into());
        }
        self.by_name.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    /// Declarations for the session configuration, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Result of running one tool call.
#[derive(Debug)]
pub struct Dispatched {
    pub tool: String,
    pub call_id: String,
    /// Item to report back to the session.
    pub output: ConversationItem,
    pub error: Option<VoxformError>,
}

/// What tool handling did for one event.
#[derive(Debug)]
pub enum ToolActivity {
    /// Nothing tool-related in this event.
    Idle,
    Dispatched(Dispatched),
    /// The item id was already handled; skipped.
    Duplicate { item_id: String },
    /// A follow-up response was requested.
    ResponseRequested,
}

/// Runs tool calls at most once per item id (call id when the item id is missing).
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    dispatched: HashSet<String>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            dispatched: HashSet::new(),
        }
    }

    /// Run the tool call carried by `item`, if any. Returns `None` when the
    /// item is not a tool call or its id was already dispatched.
    pub fn dispatch(&mut self, item: &ItemFinished) -> Option<Dispatched> {
        let name = item.tool_name()?;
        let key = dedupe_key(item);
        if !key.is_empty() && !self.dispatched.insert(key.to_string()) {
            return None;
        }
        let call_id = item.output_call_id().to_string();

        let result = self
            .registry
            .get(name)
            .ok_or_else(|| VoxformError::ToolDispatch {
                tool: name.to_string(),
                reason: "unknown tool".into(),
            })
            .and_then(|tool| {
                let args = parse_arguments(name, item.arguments.as_deref())?;
                tool.invoke(args)
            });

        let (output, error) = match result {
            Ok(value) => (value.to_string(), None),
            Err(e) => {
                let e = match e {
                    e @ VoxformError::ToolDispatch { .. } => e,
                    other => VoxformError::ToolDispatch {
                        tool: name.to_string(),
                        reason: other.to_string(),
                    },
                };
                (json!({ "error": e.to_string() }).to_string(), Some(e))
            }
        };

        Some(Dispatched {
            tool: name.to_string(),
            call_id: call_id.clone(),
            output: ConversationItem::FunctionCallOutput { call_id, output },
            error,
        })
    }

    pub fn was_dispatched(&self, item_id: &str) -> bool {
        self.dispatched.contains(item_id)
    }

    /// Tool handling for one event. Session errors propagate; tool errors
    /// come back inside `ToolActivity::Dispatched`.
    pub async fn handle_event(
        &mut self,
        event: &ConversationEvent,
        session: &dyn RealtimeSession,
    ) -> Result<ToolActivity> {
        match event {
            ConversationEvent::ItemStreamingFinished(item) => {
                if item.tool_name().is_none() {
                    return Ok(ToolActivity::Idle);
                }
                let Some(dispatched) = self.dispatch(item) else {
                    debug!(item_id = %item.item_id, "tool call already dispatched");
                    return Ok(ToolActivity::Duplicate {
                        item_id: item.item_id.clone(),
                    });
                };
                match &dispatched.error {
                    None => info!(tool = %dispatched.tool, call_id = %dispatched.call_id, "tool call dispatched"),
                    Some(e) => warn!(tool = %dispatched.tool, call_id = %dispatched.call_id, error = %e, "tool call failed"),
                }
                session.add_item(dispatched.output.clone()).await?;
                Ok(ToolActivity::Dispatched(dispatched))
            }
            ConversationEvent::ResponseFinished(summary) if summary.has_tool_calls() => {
                session.start_response().await?;
                debug!("requested follow-up response after tool calls");
                Ok(ToolActivity::ResponseRequested)
            }
            _ => Ok(ToolActivity::Idle),
        }
    }
}

/// Identity of a tool call for dedupe: the item id, else the call id.
/// Empty when the event carries neither, and such calls always run.
fn dedupe_key(item: &ItemFinished) -> &str {
    if item.item_id.is_empty() {
        item.output_call_id()
    } else {
        &item.item_id
    }
}

fn parse_arguments(tool: &str, raw: Option<&str>) -> Result<Value> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("{}");
    serde_json::from_str(raw).map_err(|e| VoxformError::ToolDispatch {
        tool: tool.to_string(),
        reason: format!("arguments are not valid JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        CreatedItem, ResponseSummary, ScriptStep, ScriptedSessionFactory, SessionFactory,
    };
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase", default)]
    struct Form {
        case_id: Option<String>,
        notes: Option<String>,
    }

    fn registry_with_recorder() -> (Arc<ToolRegistry>, Arc<Mutex<Vec<Form>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let tool = save_model_data_tool::<Form, _>(move |form| {
            sink.lock().push(form);
            Ok(())
        })
        .expect("build tool");
        let mut registry = ToolRegistry::new();
        registry.register(tool).expect("register");
        (Arc::new(registry), updates)
    }

    fn tool_call(item_id: &str, arguments: &str) -> ItemFinished {
        ItemFinished {
            item_id: item_id.into(),
            function_name: Some(SAVE_MODEL_DATA.into()),
            call_id: Some(format!("call-{item_id}")),
            arguments: Some(arguments.into()),
        }
    }

    #[test]
    fn same_item_id_invokes_handler_once() {
        let (registry, updates) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);
        let item = tool_call("it-1", r#"{"caseId":"X1"}"#);

        assert!(dispatcher.dispatch(&item).is_some());
        assert!(dispatcher.dispatch(&item).is_none());
        assert_eq!(updates.lock().len(), 1);
        assert!(dispatcher.was_dispatched("it-1"));
    }

    #[test]
    fn calls_without_item_id_dedupe_on_call_id() {
        let (registry, updates) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);
        let call = |call_id: &str, case_id: &str| ItemFinished {
            item_id: String::new(),
            function_name: Some(SAVE_MODEL_DATA.into()),
            call_id: Some(call_id.into()),
            arguments: Some(format!(r#"{{"caseId":"{case_id}"}}"#)),
        };

        let first = dispatcher.dispatch(&call("c1", "X1")).expect("first call");
        let second = dispatcher.dispatch(&call("c2", "X2")).expect("second call");
        assert!(dispatcher.dispatch(&call("c2", "X2")).is_none());

        assert_eq!(first.call_id, "c1");
        assert_eq!(second.call_id, "c2");
        let updates = updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].case_id.as_deref(), Some("X2"));
    }

    #[test]
    fn calls_without_any_id_are_never_skipped() {
        let (registry, updates) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);
        let anonymous = ItemFinished {
            function_name: Some(SAVE_MODEL_DATA.into()),
            arguments: Some(r#"{"caseId":"X1"}"#.into()),
            ..ItemFinished::default()
        };

        assert!(dispatcher.dispatch(&anonymous).is_some());
        assert!(dispatcher.dispatch(&anonymous).is_some());
        assert_eq!(updates.lock().len(), 2);
    }

    #[test]
    fn wrapped_and_bare_arguments_both_accepted() {
        let (registry, updates) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);

        dispatcher.dispatch(&tool_call("a", r#"{"caseId":"X1"}"#));
        dispatcher.dispatch(&tool_call("b", r#"{"modelData":{"caseId":"X2","notes":"n"}}"#));

        let updates = updates.lock();
        assert_eq!(updates[0].case_id.as_deref(), Some("X1"));
        assert_eq!(updates[1].case_id.as_deref(), Some("X2"));
        assert_eq!(updates[1].notes.as_deref(), Some("n"));
    }

    #[test]
    fn bad_arguments_still_produce_an_error_output() {
        let (registry, updates) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);

        let dispatched = dispatcher
            .dispatch(&tool_call("it-9", "{not json"))
            .expect("tool call handled");
        assert!(matches!(dispatched.error, Some(VoxformError::ToolDispatch { .. })));
        let ConversationItem::FunctionCallOutput { call_id, output } = &dispatched.output else {
            panic!("expected function output");
        };
        assert_eq!(call_id, "call-it-9");
        assert!(output.contains("error"));
        assert!(updates.lock().is_empty());
    }

    #[test]
    fn unknown_tool_is_a_dispatch_error() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::new()));
        let item = ItemFinished {
            item_id: "it-3".into(),
            function_name: Some("Delete_Everything".into()),
            ..ItemFinished::default()
        };
        let dispatched = dispatcher.dispatch(&item).expect("handled");
        let Some(VoxformError::ToolDispatch { tool, reason }) = dispatched.error else {
            panic!("expected dispatch error");
        };
        assert_eq!(tool, "Delete_Everything");
        assert_eq!(reason, "unknown tool");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let tool = ToolDefinition::new("echo", "echo", json!({}), Ok);
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone()).expect("first");
        assert!(registry.register(tool).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn save_tool_declares_wrapped_schema() {
        let (registry, _) = registry_with_recorder();
        let spec = &registry.specs()[0];
        assert_eq!(spec.name, SAVE_MODEL_DATA);
        assert_eq!(spec.parameters["required"], json!(["modelData"]));
        assert!(spec.parameters["properties"]["modelData"]["properties"]
            .get("caseId")
            .is_some());
        assert!(spec.parameters.get("$schema").is_none());
    }

    #[tokio::test]
    async fn response_with_tool_item_requests_exactly_one_response() {
        let factory = ScriptedSessionFactory::new(Vec::<ScriptStep>::new());
        let log = factory.log();
        let session = factory.open().await.expect("open");
        let (registry, _) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);

        let with_tool = ConversationEvent::ResponseFinished(ResponseSummary {
            response_id: None,
            created_items: vec![CreatedItem {
                item_id: "it-1".into(),
                function_name: Some(SAVE_MODEL_DATA.into()),
            }],
        });
        let without_tool = ConversationEvent::ResponseFinished(ResponseSummary::default());

        let activity = dispatcher
            .handle_event(&with_tool, session.as_ref())
            .await
            .expect("handle");
        assert!(matches!(activity, ToolActivity::ResponseRequested));
        dispatcher
            .handle_event(&without_tool, session.as_ref())
            .await
            .expect("handle");
        assert_eq!(log.lock().responses_started, 1);
    }

    #[tokio::test]
    async fn dispatched_output_is_added_to_session() {
        let factory = ScriptedSessionFactory::new(Vec::<ScriptStep>::new());
        let log = factory.log();
        let session = factory.open().await.expect("open");
        let (registry, _) = registry_with_recorder();
        let mut dispatcher = ToolDispatcher::new(registry);
        let event = ConversationEvent::ItemStreamingFinished(tool_call("it-1", r#"{"caseId":"X1"}"#));

        dispatcher.handle_event(&event, session.as_ref()).await.expect("first");
        let again = dispatcher.handle_event(&event, session.as_ref()).await.expect("second");
        assert!(matches!(again, ToolActivity::Duplicate { .. }));

        let log = log.lock();
        assert_eq!(log.items.len(), 1);
        assert_eq!(
            log.items[0],
            ConversationItem::FunctionCallOutput {
                call_id: "call-it-1".into(),
                output: "null".into(),
            }
        );
    }
}
