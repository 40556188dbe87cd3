//! Intent -> `TodoList` decomposition.
//!
//! The model is asked for a JSON array of items whose dependencies are given
//! as *descriptions* of other items. Parsing is permissive: the first JSON
//! array of objects found in the reply is used, numbers may arrive as
//! strings, and unknown kinds go through [`TodoKind::parse_lenient`]. A reply
//! that still cannot be parsed earns exactly one retry with a stricter
//! instruction; a second failure aborts with [`DecomposeError::Parse`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EventType;
use ap_core::types::{
    Todo, TodoKind, TodoList, COMPLEXITY_MIN, COMPLEXITY_MODERATE, PRIORITY_NORMAL,
};
use ap_core::workspace::WorkspaceContext;

use crate::llm::{LlmConfig, LlmError, LlmProvider};

/// Files listed in the prompt, most relevant first.
const MAX_PROMPT_FILES: usize = 50;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("intent is empty")]
    EmptyIntent,
    #[error("could not parse todos after {attempts} attempts: {reason}")]
    Parse { attempts: u32, reason: String },
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, DecomposeError>;

// ---------------------------------------------------------------------------
// Raw model output
// ---------------------------------------------------------------------------

/// One item as the model wrote it. Everything but `description` is optional
/// and loosely typed.
#[derive(Debug, Clone, Deserialize)]
struct RawTodo {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    active_form: Option<String>,
    #[serde(default, rename = "type", alias = "kind")]
    kind: Option<String>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default)]
    complexity: Option<Value>,
    #[serde(default)]
    target_files: Option<Value>,
    #[serde(default)]
    dependencies: Option<Value>,
}

/// An item after validation, dependencies still as descriptions.
#[derive(Debug, Clone)]
pub struct ParsedTodo {
    pub description: String,
    pub active_form: String,
    pub kind: TodoKind,
    pub priority: i32,
    pub complexity: u8,
    pub target_files: Vec<String>,
    pub dependency_descriptions: Vec<String>,
}

/// Find the first JSON array of objects embedded anywhere in `text`.
fn extract_array(text: &str) -> Option<Vec<Value>> {
    for (idx, _) in text.match_indices('[') {
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Vec<Value>>();
        if let Some(Ok(items)) = stream.next() {
            if items.iter().all(Value::is_object) {
                return Some(items);
            }
        }
    }
    None
}

fn lenient_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Parse a model reply into validated items.
pub fn parse_todos(text: &str) -> std::result::Result<Vec<ParsedTodo>, String> {
    let items = extract_array(text).ok_or_else(|| "no JSON array of objects found".to_string())?;
    if items.is_empty() {
        return Err("the todo array is empty".to_string());
    }

    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let raw: RawTodo =
            serde_json::from_value(item).map_err(|e| format!("item {i}: {e}"))?;
        let description = raw
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| format!("item {i}: missing description"))?;
        let kind_raw = raw
            .kind
            .ok_or_else(|| format!("item {i}: missing type"))?;
        let kind = TodoKind::parse_lenient(&kind_raw)
            .ok_or_else(|| format!("item {i}: unknown type {kind_raw:?}"))?;
        let active_form = raw
            .active_form
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| description.clone());
        let priority = lenient_int(raw.priority.as_ref())
            .map(|p| p.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
            .unwrap_or(PRIORITY_NORMAL);
        let complexity = lenient_int(raw.complexity.as_ref())
            .map(|c| c.clamp(COMPLEXITY_MIN as i64, u8::MAX as i64) as u8)
            .unwrap_or(COMPLEXITY_MODERATE);

        parsed.push(ParsedTodo {
            description,
            active_form,
            kind,
            priority,
            complexity,
            target_files: string_list(raw.target_files.as_ref()),
            dependency_descriptions: string_list(raw.dependencies.as_ref()),
        });
    }
    Ok(parsed)
}

/// Kind-based priority bias: analysis first, documentation last.
pub fn adjusted_priority(kind: TodoKind, priority: i32, complexity: u8) -> i32 {
    match kind {
        TodoKind::Analysis => priority.saturating_add(10),
        TodoKind::Validation if complexity == COMPLEXITY_MIN => priority.saturating_add(5),
        TodoKind::Documentation => priority.saturating_sub(10),
        _ => priority,
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub fn build_prompt(intent: &str, ctx: &WorkspaceContext) -> String {
    let mut prompt = format!(
        "You are an expert software developer. Break down this user request into specific, \
         actionable todos grounded in the provided workspace context.\n\n\
         User Request: \"{intent}\"\n\n## Workspace Context\n\
         Project Type: {}\nRoot Path: {}\n",
        ctx.project_type, ctx.root_path
    );
    if !ctx.summary.is_empty() {
        prompt.push_str(&format!("Summary: {}\n", ctx.summary));
    }
    if !ctx.files.is_empty() {
        prompt.push_str("\nRelevant Files:\n");
        for file in ctx.files.iter().take(MAX_PROMPT_FILES) {
            prompt.push_str(&format!("- {} ({}", file.path, file.file_type));
            if !file.summary.is_empty() {
                prompt.push_str(&format!(": {}", file.summary));
            }
            prompt.push_str(")\n");
        }
    }
    prompt.push_str(
        r#"
Respond with a JSON array of todos. Each todo has:
- "description": a clear, actionable description (imperative)
- "active_form": present continuous form (e.g. "Creating function" for "Create function")
- "type": one of "analysis", "code_change", "validation", "documentation", "test", "configuration"
- "priority": number from 10 (low) to 100 (critical)
- "complexity": number from 1 (simple) to 4 (critical)
- "target_files": array of file paths this todo will modify (may be empty)
- "dependencies": array of the exact descriptions of other todos this one depends on (may be empty)

Example response:
[
  {
    "description": "Analyze existing code structure to understand the current implementation",
    "active_form": "Analyzing existing code structure",
    "type": "analysis",
    "priority": 80,
    "complexity": 2,
    "target_files": [],
    "dependencies": []
  },
  {
    "description": "Add new function to handle user authentication",
    "active_form": "Adding new function to handle user authentication",
    "type": "code_change",
    "priority": 70,
    "complexity": 3,
    "target_files": ["src/auth.rs"],
    "dependencies": ["Analyze existing code structure to understand the current implementation"]
  }
]
"#,
    );
    prompt
}

fn build_strict_prompt(intent: &str, ctx: &WorkspaceContext, reason: &str) -> String {
    format!(
        "{}\nYour previous reply could not be used ({reason}).\n\
         Reply with ONLY the JSON array. No prose, no markdown fences, no comments. \
         Every element must be an object with at least \"description\" and \"type\".\n",
        build_prompt(intent, ctx)
    )
}

// ---------------------------------------------------------------------------
// Decomposer
// ---------------------------------------------------------------------------

/// Turns an intent into a `TodoList` through the injected LLM provider.
pub struct Decomposer {
    llm: Arc<dyn LlmProvider>,
    config: LlmConfig,
    event_bus: Option<EventBus>,
}

impl Decomposer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self {
            llm,
            config,
            event_bus: None,
        }
    }

    /// Publish `decomposition_warning` events on this bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub async fn decompose(&self, intent: &str, ctx: &WorkspaceContext) -> Result<TodoList> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(DecomposeError::EmptyIntent);
        }

        let prompt = build_prompt(intent, ctx);
        let reply = self.llm.generate(&prompt, &self.config).await?;
        let parsed = match parse_todos(&reply) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(%reason, "decomposition reply unparseable; retrying with strict prompt");
                let strict = build_strict_prompt(intent, ctx, &reason);
                let reply = self.llm.generate(&strict, &self.config).await?;
                parse_todos(&reply).map_err(|reason| DecomposeError::Parse {
                    attempts: 2,
                    reason,
                })?
            }
        };

        let list = self.assemble(intent, parsed);
        info!(
            list_id = %list.id,
            todos = list.total_todos,
            "intent decomposed"
        );
        Ok(list)
    }

    /// Assign IDs, apply priority bias, then resolve dependency descriptions.
    fn assemble(&self, intent: &str, parsed: Vec<ParsedTodo>) -> TodoList {
        let mut todos: Vec<Todo> = parsed
            .iter()
            .map(|p| {
                Todo::new(p.description.clone(), p.kind)
                    .with_active_form(p.active_form.clone())
                    .with_complexity(p.complexity)
                    .with_priority(adjusted_priority(p.kind, p.priority, p.complexity))
                    .with_target_files(p.target_files.clone())
            })
            .collect();

        // First occurrence wins when descriptions repeat.
        let mut by_description: HashMap<&str, &str> = HashMap::new();
        for todo in &todos {
            by_description
                .entry(todo.description.as_str())
                .or_insert(todo.id.as_str());
        }

        let mut resolved: Vec<Vec<String>> = Vec::with_capacity(todos.len());
        for (todo, raw) in todos.iter().zip(&parsed) {
            let mut deps = Vec::new();
            let mut seen = HashSet::new();
            for desc in &raw.dependency_descriptions {
                match by_description.get(desc.as_str()) {
                    Some(&id) if id == todo.id => {
                        self.warn_dropped(&todo.id, desc, "references itself");
                    }
                    Some(&id) => {
                        if seen.insert(id) {
                            deps.push(id.to_string());
                        }
                    }
                    None => self.warn_dropped(&todo.id, desc, "matches no todo"),
                }
            }
            resolved.push(deps);
        }
        for (todo, deps) in todos.iter_mut().zip(resolved) {
            todo.dependencies = deps;
        }

        debug!(count = todos.len(), "todos assembled");
        TodoList::new(intent, todos)
    }

    fn warn_dropped(&self, todo_id: &str, dependency: &str, why: &str) {
        warn!(todo_id, dependency, why, "dropping unresolved dependency");
        if let Some(bus) = &self.event_bus {
            bus.emit(
                EventType::DecompositionWarning,
                format!("dependency {dependency:?} {why}; dropped"),
                json!({ "todo_id": todo_id, "dependency": dependency, "reason": why }),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::types::{PRIORITY_MAX, PRIORITY_MIN};

    #[test]
    fn extracts_array_surrounded_by_prose() {
        let text = "Sure! See [1] below.\n```json\n[{\"description\":\"a\",\"type\":\"analysis\"}]\n```\nDone.";
        let parsed = parse_todos(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].description, "a");
        assert_eq!(parsed[0].active_form, "a");
    }

    #[test]
    fn numbers_as_strings_are_accepted() {
        let text = r#"[{"description":"x","type":"test","priority":"75","complexity":"3"}]"#;
        let parsed = parse_todos(text).unwrap();
        assert_eq!(parsed[0].priority, 75);
        assert_eq!(parsed[0].complexity, 3);
    }

    #[test]
    fn missing_numbers_take_defaults() {
        let parsed = parse_todos(r#"[{"description":"x","type":"code_change"}]"#).unwrap();
        assert_eq!(parsed[0].priority, PRIORITY_NORMAL);
        assert_eq!(parsed[0].complexity, COMPLEXITY_MODERATE);
    }

    #[test]
    fn rejects_missing_description_and_unknown_type() {
        assert!(parse_todos(r#"[{"type":"analysis"}]"#).is_err());
        assert!(parse_todos(r#"[{"description":"x","type":"juggling"}]"#).is_err());
        assert!(parse_todos("no json here").is_err());
        assert!(parse_todos("[]").is_err());
    }

    #[test]
    fn priority_bias_by_kind() {
        assert_eq!(adjusted_priority(TodoKind::Analysis, 80, 2), 90);
        assert_eq!(adjusted_priority(TodoKind::Validation, 50, 1), 55);
        assert_eq!(adjusted_priority(TodoKind::Validation, 50, 2), 50);
        assert_eq!(adjusted_priority(TodoKind::Documentation, 50, 1), 40);
        assert_eq!(adjusted_priority(TodoKind::CodeChange, 50, 1), 50);
    }

    #[test]
    fn out_of_range_priority_lands_on_the_bounds() {
        let text = r#"[
            {"description":"x","type":"analysis","priority":99999999999},
            {"description":"y","type":"documentation","priority":-99999999999}
        ]"#;
        let parsed = parse_todos(text).unwrap();
        assert_eq!(parsed[0].priority, i32::MAX);
        assert_eq!(parsed[1].priority, i32::MIN);

        let high = adjusted_priority(parsed[0].kind, parsed[0].priority, parsed[0].complexity);
        let low = adjusted_priority(parsed[1].kind, parsed[1].priority, parsed[1].complexity);
        assert_eq!(high, i32::MAX);
        assert_eq!(low, i32::MIN);
        assert_eq!(Todo::new("x", TodoKind::Analysis).with_priority(high).priority, PRIORITY_MAX);
        assert_eq!(
            Todo::new("y", TodoKind::Documentation).with_priority(low).priority,
            PRIORITY_MIN
        );
    }

    #[test]
    fn prompt_lists_workspace_files() {
        let ctx = WorkspaceContext {
            root_path: "/repo".into(),
            project_type: "rust".into(),
            files: vec![ap_core::workspace::FileInfo {
                path: "src/main.rs".into(),
                file_type: "file".into(),
                language: "rust".into(),
                summary: "entry point".into(),
                relevance: 1.0,
            }],
            ..Default::default()
        };
        let prompt = build_prompt("add logging", &ctx);
        assert!(prompt.contains("User Request: \"add logging\""));
        assert!(prompt.contains("- src/main.rs (file: entry point)"));
        assert!(prompt.contains("Project Type: rust"));
    }
}
