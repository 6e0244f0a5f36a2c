//! On-disk persistence for workflow artifacts.
//!
//! Each workflow that produces at least one artifact gets its own project
//! directory under a configured base: `src/` for production code, `tests/`
//! for test code, documentation at the root, and a `.project.json` metadata
//! file recording the workflow id, the task, and the cumulative file list.
//!
//! # Write discipline
//!
//! - Writes are atomic: contents go to a temporary file in the target
//!   directory, are fsynced, and are renamed over the destination.
//! - Writes within a project are serialized by a per-project lock; projects
//!   proceed in parallel with each other.
//! - A later write to the same relative path replaces the earlier content;
//!   the metadata file list records the last write's size and timestamp.
//! - Paths are re-validated here even though the extractor already sanitized
//!   them; a path that would escape the project root is refused.
//!
//! Directories are created with owner-only permissions on Unix hosts.

use crate::crewforge::extractor::{sanitize_relative_path, ArtifactKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors raised by the project store.
#[derive(Debug, Clone)]
pub enum ProjectStoreError {
    /// The relative path escapes the project root.
    PathEscape(String),
    /// Filesystem failure with context.
    Io(String),
}

impl fmt::Display for ProjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectStoreError::PathEscape(path) => {
                write!(f, "path escapes project root: {}", path)
            }
            ProjectStoreError::Io(msg) => write!(f, "project store IO error: {}", msg),
        }
    }
}

impl Error for ProjectStoreError {}

/// One entry in a project's cumulative file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the project root.
    pub relative_path: String,
    /// Whether the file was classified as test code.
    pub is_test: bool,
    /// Size of the last successful write.
    pub bytes: u64,
    /// Timestamp of the last successful write.
    pub written_at: DateTime<Utc>,
}

/// The `.project.json` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    /// Directory name of the project.
    pub project_name: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// The user's original task.
    pub task: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Cumulative file list, last-writer-wins per path.
    pub files: Vec<FileRecord>,
}

/// A single project directory plus its serialized metadata.
///
/// The metadata mutex doubles as the per-project write lock.
pub struct Project {
    name: String,
    root: PathBuf,
    meta: Mutex<ProjectMeta>,
}

/// Cheap, cloneable reference to an open project.
pub type ProjectHandle = Arc<Project>;

impl Project {
    /// Directory name, e.g. `build_a_calculator_3fa9c1d2`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute path of the project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The task this project was created for.
    pub async fn task(&self) -> String {
        self.meta.lock().await.task.clone()
    }
}

/// Factory and registry for [`Project`]s under one base directory.
pub struct ProjectStore {
    base_dir: PathBuf,
    open_projects: Mutex<HashMap<String, ProjectHandle>>,
}

impl ProjectStore {
    /// Create a store rooted at `base_dir`.  The directory itself is created
    /// lazily on the first `open_or_create`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        ProjectStore {
            base_dir: base_dir.into(),
            open_projects: Mutex::new(HashMap::new()),
        }
    }

    /// Open the project for `workflow_id`, creating the directory tree,
    /// metadata file, and initial README on first use.
    pub async fn open_or_create(
        &self,
        workflow_id: &str,
        task: &str,
    ) -> Result<ProjectHandle, ProjectStoreError> {
        let mut open = self.open_projects.lock().await;
        if let Some(handle) = open.get(workflow_id) {
            return Ok(handle.clone());
        }

        create_dir_restricted(&self.base_dir)?;
        let name = format!("{}_{}", sanitize_task_prefix(task), short_random());
        let root = self.base_dir.join(&name);
        create_dir_restricted(&root)?;
        create_dir_restricted(&root.join("src"))?;
        create_dir_restricted(&root.join("tests"))?;

        let meta = ProjectMeta {
            project_name: name.clone(),
            workflow_id: workflow_id.to_string(),
            task: task.to_string(),
            created_at: Utc::now(),
            files: Vec::new(),
        };
        write_atomic(&root.join(".project.json"), render_meta(&meta)?.as_bytes())?;
        write_atomic(
            &root.join("README.md"),
            initial_readme(&name, task).as_bytes(),
        )?;

        let handle: ProjectHandle = Arc::new(Project {
            name,
            root,
            meta: Mutex::new(meta),
        });
        open.insert(workflow_id.to_string(), handle.clone());
        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "crewforge::project_store: created project '{}' for workflow {}",
                handle.name,
                workflow_id
            );
        }
        Ok(handle)
    }

    /// Write one artifact into the project, routed by kind: `src/` for
    /// source, `tests/` for tests, the root for documentation.
    pub async fn write(
        &self,
        project: &ProjectHandle,
        relative_path: &str,
        contents: &str,
        kind: ArtifactKind,
    ) -> Result<FileRecord, ProjectStoreError> {
        let safe = sanitize_relative_path(relative_path)
            .ok_or_else(|| ProjectStoreError::PathEscape(relative_path.to_string()))?;
        let placed = place_path(&safe, kind);

        // The metadata lock serializes all writes within this project.
        let mut meta = project.meta.lock().await;

        let target = project.root.join(&placed);
        if let Some(parent) = target.parent() {
            create_dir_restricted(parent)?;
        }
        write_atomic(&target, contents.as_bytes())?;

        let record = FileRecord {
            relative_path: placed.clone(),
            is_test: kind == ArtifactKind::Test,
            bytes: contents.len() as u64,
            written_at: Utc::now(),
        };
        meta.files.retain(|f| f.relative_path != placed);
        meta.files.push(record.clone());
        write_atomic(
            &project.root.join(".project.json"),
            render_meta(&meta)?.as_bytes(),
        )?;
        Ok(record)
    }

    /// The current file list, reflecting the last successful write per path.
    pub async fn snapshot(&self, project: &ProjectHandle) -> Vec<FileRecord> {
        project.meta.lock().await.files.clone()
    }

    /// Rewrite the README to include the discovered file list.  Called at
    /// publication time.
    pub async fn rewrite_readme(&self, project: &ProjectHandle) -> Result<(), ProjectStoreError> {
        let meta = project.meta.lock().await;
        let readme = final_readme(&meta);
        write_atomic(&project.root.join("README.md"), readme.as_bytes())
    }

    /// Release the in-memory handle for `workflow_id`.  The on-disk project
    /// outlives the workflow.
    pub async fn close(&self, workflow_id: &str) {
        self.open_projects.lock().await.remove(workflow_id);
    }
}

/// Prefix of a project directory name derived from the task text.
fn sanitize_task_prefix(task: &str) -> String {
    let mut prefix = String::new();
    let mut last_was_sep = true;
    for c in task.chars() {
        if prefix.len() >= 32 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            prefix.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            prefix.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = prefix.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed
    }
}

fn short_random() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Route an artifact beneath the project root by kind, keeping explicit
/// `src/`/`tests/` prefixes supplied by the agent.
fn place_path(relative_path: &str, kind: ArtifactKind) -> String {
    match kind {
        ArtifactKind::Doc => relative_path.to_string(),
        ArtifactKind::Src => {
            if relative_path.starts_with("src/") {
                relative_path.to_string()
            } else {
                format!("src/{}", relative_path)
            }
        }
        ArtifactKind::Test => {
            if relative_path.starts_with("tests/") {
                relative_path.to_string()
            } else {
                format!("tests/{}", relative_path)
            }
        }
    }
}

fn render_meta(meta: &ProjectMeta) -> Result<String, ProjectStoreError> {
    serde_json::to_string_pretty(meta).map_err(|e| ProjectStoreError::Io(e.to_string()))
}

fn initial_readme(project_name: &str, task: &str) -> String {
    format!(
        "# {}\n\nGenerated by a multi-agent workflow.\n\n## Task\n\n{}\n\n## Layout\n\n\
         - `src/` — production source files\n\
         - `tests/` — test files\n",
        project_name, task
    )
}

fn final_readme(meta: &ProjectMeta) -> String {
    let mut readme = initial_readme(&meta.project_name, &meta.task);
    readme.push_str("\n## Files\n\n");
    let mut files = meta.files.clone();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for file in files {
        readme.push_str(&format!("- `{}` ({} bytes)\n", file.relative_path, file.bytes));
    }
    readme
}

/// Create a directory (and parents) with owner-only permissions on Unix.
/// Idempotent and safe to race.
fn create_dir_restricted(path: &Path) -> Result<(), ProjectStoreError> {
    if path.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| ProjectStoreError::Io(format!("{}: {}", path.display(), e)))
}

/// Write contents to a temporary sibling, fsync, then rename over `target`.
fn write_atomic(target: &Path, contents: &[u8]) -> Result<(), ProjectStoreError> {
    let dir = target
        .parent()
        .ok_or_else(|| ProjectStoreError::Io(format!("{}: no parent", target.display())))?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = dir.join(format!(".{}.tmp-{}", file_name, short_random()));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(ProjectStoreError::Io(format!(
            "{}: {}",
            target.display(),
            e
        )));
    }
    Ok(())
}
