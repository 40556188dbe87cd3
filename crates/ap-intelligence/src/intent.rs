//! Keyword heuristics classifying an intent and picking an execution strategy.

use ap_core::types::{ExecutionStrategy, IntentAnalysis, IntentType, COMPLEXITY_MODERATE};
use ap_core::workspace::WorkspaceContext;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "will", "with",
];

const QUESTION_WORDS: &[&str] = &["how", "what", "why", "where", "which", "who", "when"];

const COMPLEX_WORDS: &[&str] = &[
    "refactor",
    "restructure",
    "architecture",
    "framework",
    "migrate",
    "convert",
];
const SIMPLE_WORDS: &[&str] = &["add", "create", "fix", "update", "comment", "rename"];

/// Ordered rules; the first matching one decides the type.
const TYPE_RULES: &[(IntentType, &[&str])] = &[
    (IntentType::Orchestration, &["orchestrate", "pipeline", "workflow"]),
    (IntentType::CodeGeneration, &["add", "create", "implement", "build", "write", "generate"]),
    (IntentType::Analysis, &["analyze", "analyse", "understand", "explain", "review", "audit"]),
    (IntentType::Refactoring, &["refactor", "restructure", "clean up", "cleanup", "simplify"]),
    (IntentType::Documentation, &["document", "comment", "readme", "docs"]),
];

/// Markers of several chained steps in one request.
const MULTI_STEP_MARKERS: &[&str] = &[" then ", " and then ", " after that ", " finally "];

#[derive(Debug, Clone, Default)]
pub struct IntentAnalyzer;

impl IntentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, intent: &str, ctx: &WorkspaceContext) -> IntentAnalysis {
        let lower = intent.trim().to_lowercase();
        let words = tokenize(&lower);

        let (intent_type, matched) = classify(&lower, &words);
        let complexity = estimate_complexity(&words, intent_type);
        let target_files = mentioned_files(intent, ctx);
        let keywords = extract_keywords(&words);

        let mut confidence: f64 = if matched { 0.8 } else { 0.5 };
        if !target_files.is_empty() {
            confidence += 0.1;
        }

        let analysis = IntentAnalysis {
            intent_type,
            complexity,
            confidence: confidence.min(0.95),
            keywords,
            target_files,
            description: intent.trim().to_string(),
        };
        tracing::debug!(
            intent_type = ?analysis.intent_type,
            complexity = analysis.complexity,
            "intent analyzed"
        );
        analysis
    }
}

/// Pick how a plan should run from its analysis.
pub fn determine_strategy(analysis: &IntentAnalysis) -> ExecutionStrategy {
    match analysis.intent_type {
        IntentType::Question => ExecutionStrategy::Analyze,
        IntentType::Orchestration | IntentType::MultiStep => ExecutionStrategy::Orchestrate,
        _ if analysis.complexity >= 3 || analysis.target_files.len() > 3 => {
            ExecutionStrategy::FullEdit
        }
        IntentType::Analysis => ExecutionStrategy::Analyze,
        _ => ExecutionStrategy::QuickEdit,
    }
}

fn tokenize(lower: &str) -> Vec<&str> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/'))
        .map(|w| w.trim_matches(|c: char| c == '.' || c == '-'))
        .filter(|w| !w.is_empty())
        .collect()
}

fn has_word(words: &[&str], stems: &[&str], lower: &str) -> bool {
    stems.iter().any(|stem| {
        if stem.contains(' ') {
            lower.contains(stem)
        } else {
            words.iter().any(|w| w.starts_with(stem))
        }
    })
}

/// Returns the type and whether any rule matched (vs. the default).
fn classify(lower: &str, words: &[&str]) -> (IntentType, bool) {
    let is_question = lower.ends_with('?')
        || words
            .first()
            .is_some_and(|first| QUESTION_WORDS.contains(first));
    if is_question {
        return (IntentType::Question, true);
    }
    let padded = format!(" {lower} ");
    if MULTI_STEP_MARKERS.iter().any(|m| padded.contains(m)) {
        return (IntentType::MultiStep, true);
    }
    for (intent_type, stems) in TYPE_RULES {
        if has_word(words, stems, lower) {
            return (*intent_type, true);
        }
    }
    (IntentType::CodeGeneration, false)
}

fn estimate_complexity(words: &[&str], intent_type: IntentType) -> u8 {
    if has_word(words, COMPLEX_WORDS, "") {
        return 3;
    }
    if matches!(intent_type, IntentType::MultiStep | IntentType::Orchestration) {
        return 3;
    }
    if has_word(words, SIMPLE_WORDS, "") {
        return 1;
    }
    COMPLEXITY_MODERATE
}

fn extract_keywords(words: &[&str]) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in words {
        if word.len() > 2 && !STOP_WORDS.contains(word) && !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    keywords
}

/// Paths from the workspace that the intent names, plus path-looking tokens.
fn mentioned_files(intent: &str, ctx: &WorkspaceContext) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for token in intent.split_whitespace() {
        let token = token
            .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | ',' | ';' | ')' | '('));
        let token = token.trim_end_matches(['.', ':', '?', '!']);
        let looks_like_path = token.contains('/')
            || token.rsplit_once('.').is_some_and(|(stem, ext)| {
                !stem.is_empty()
                    && (1..=5).contains(&ext.len())
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
            });
        let known = ctx
            .files
            .iter()
            .any(|f| f.path == token || f.path.ends_with(&format!("/{token}")));
        if (looks_like_path || known) && !files.iter().any(|f| f == token) {
            files.push(token.to_string());
        }
    }
    files
}
