//! Workspace context handed to the decomposer when it builds its prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directories never descended into while scanning.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "target",
    "build",
    "dist",
    "__pycache__",
    "venv",
];

const DEFAULT_MAX_FILES: usize = 500;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceContext {
    pub root_path: String,
    pub project_type: String,
    #[serde(default)]
    pub files: Vec<FileInfo>,
    #[serde(default)]
    pub summary: String,
    /// Manifest name -> short description, e.g. `"Cargo.toml" -> "rust"`.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    /// `"file"` or `"directory"`.
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub summary: String,
    /// 0.0..=1.0 estimate of how related the file is to the intent.
    #[serde(default)]
    pub relevance: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scan task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Supplies a workspace snapshot for an intent.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn context(&self, intent: &str) -> Result<WorkspaceContext, WorkspaceError>;
}

/// A fixed context; handy for tests and for callers that already built one.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkspaceProvider {
    pub context: WorkspaceContext,
}

#[async_trait]
impl WorkspaceProvider for StaticWorkspaceProvider {
    async fn context(&self, _intent: &str) -> Result<WorkspaceContext, WorkspaceError> {
        Ok(self.context.clone())
    }
}

// ---------------------------------------------------------------------------
// Filesystem provider
// ---------------------------------------------------------------------------

/// Walks the workspace root, skipping hidden and build directories.
#[derive(Debug, Clone)]
pub struct FsWorkspaceProvider {
    root: PathBuf,
    max_files: usize,
}

impl FsWorkspaceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_files: DEFAULT_MAX_FILES,
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(root: &Path, max_files: usize, intent: &str) -> Result<WorkspaceContext, WorkspaceError> {
        if !root.is_dir() {
            return Err(WorkspaceError::NotADirectory(root.to_path_buf()));
        }

        let terms: Vec<String> = intent
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 3)
            .map(str::to_lowercase)
            .collect();

        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries: Vec<_> = std::fs::read_dir(&dir)?.flatten().collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                if files.len() >= max_files {
                    break;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    if SKIP_DIRS.contains(&name.as_str()) {
                        continue;
                    }
                    stack.push(path);
                    continue;
                }
                let lower = rel.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                let relevance = if terms.is_empty() {
                    0.0
                } else {
                    (hits as f64 / terms.len() as f64).min(1.0)
                };
                files.push(FileInfo {
                    language: language_for(&name).to_string(),
                    path: rel,
                    file_type: "file".to_string(),
                    summary: String::new(),
                    relevance,
                });
            }
        }
        files.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut dependencies = BTreeMap::new();
        for (manifest, kind) in MANIFESTS {
            if root.join(manifest).exists() {
                dependencies.insert(manifest.to_string(), kind.to_string());
            }
        }
        let project_type = MANIFESTS
            .iter()
            .find(|(manifest, _)| root.join(manifest).exists())
            .map(|(_, kind)| kind.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let summary = format!(
            "{} project with {} files{}",
            project_type,
            files.len(),
            if files.len() >= max_files {
                " (truncated)"
            } else {
                ""
            }
        );

        Ok(WorkspaceContext {
            root_path: root.to_string_lossy().to_string(),
            project_type,
            files,
            summary,
            dependencies,
        })
    }
}

#[async_trait]
impl WorkspaceProvider for FsWorkspaceProvider {
    async fn context(&self, intent: &str) -> Result<WorkspaceContext, WorkspaceError> {
        let root = self.root.clone();
        let max_files = self.max_files;
        let intent = intent.to_string();
        tokio::task::spawn_blocking(move || Self::scan(&root, max_files, &intent))
            .await
            .map_err(|e| WorkspaceError::Join(e.to_string()))?
    }
}

const MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("go.mod", "go"),
    ("package.json", "node"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
];

fn language_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("rs") => "rust",
        Some("go") => "go",
        Some("py") => "python",
        Some("ts") | Some("tsx") => "typescript",
        Some("js") | Some("jsx") | Some("mjs") => "javascript",
        Some("java") => "java",
        Some("md") => "markdown",
        Some("toml") => "toml",
        Some("json") => "json",
        Some("yaml") | Some("yml") => "yaml",
        Some("sh") => "shell",
        _ => "",
    }
}
