//! Local task store
//!
//! Tasks are materialized as one directory per task inside each registered
//! project:
//!
//! ```text
//! <project>/.tasks/specs/
//!   001-add-login/
//!     requirements.json   # title, description, priority (primary document)
//!     plan.json           # status, phases, progress
//!     metadata.json       # free-form map (optional)
//!     logs.json           # array of log lines (optional)
//! ```
//!
//! A directory without `requirements.json` is not a task. Optional documents
//! that fail to parse degrade to their defaults instead of failing the read.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProjectConfig;
use crate::error::{Error, Result};
use crate::lock::write_atomic_async;
use crate::task::{
    Progress, Subtask, SubtaskStatus, Task, TaskDraft, TaskPriority, TaskStatus, TaskUpdate,
};

const TASKS_DIR: &str = ".tasks";
const SPECS_DIR: &str = "specs";
const REQUIREMENTS_FILE: &str = "requirements.json";
const PLAN_FILE: &str = "plan.json";
const METADATA_FILE: &str = "metadata.json";
const LOGS_FILE: &str = "logs.json";
const MAX_SLUG_LEN: usize = 48;
const MAX_ID_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequirementsDoc {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<TaskPriority>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PlanDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default)]
    phases: Vec<PlanPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanPhase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(alias = "title")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    started: bool,
}

impl PlanDoc {
    fn status(&self, dir: &Path) -> TaskStatus {
        match self.status.as_deref() {
            None => TaskStatus::Backlog,
            Some(raw) => TaskStatus::parse_any(raw).unwrap_or_else(|_| {
                warn!(path = %dir.display(), status = raw, "unrecognized plan status; using backlog");
                TaskStatus::Backlog
            }),
        }
    }

    fn subtasks(&self) -> Vec<Subtask> {
        self.phases
            .iter()
            .enumerate()
            .map(|(idx, phase)| Subtask {
                id: phase
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("phase-{}", idx + 1)),
                title: phase.name.clone(),
                description: phase.description.clone(),
                status: SubtaskStatus::from_flags(phase.completed, phase.started),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TaskLocation {
    project_id: String,
    dir: PathBuf,
}

/// File-backed task store scoped to the registered projects.
#[derive(Debug)]
pub struct LocalTaskStore {
    projects: Vec<ProjectConfig>,
    /// task id -> owning project and directory, filled by list/get/create
    index: RwLock<HashMap<String, TaskLocation>>,
    create_lock: Mutex<()>,
}

impl LocalTaskStore {
    pub fn new(projects: Vec<ProjectConfig>) -> Self {
        Self {
            projects,
            index: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn projects(&self) -> &[ProjectConfig] {
        &self.projects
    }

    /// Directory holding one subdirectory per task for `project_id`
    pub fn specs_dir(&self, project_id: &str) -> Result<PathBuf> {
        self.projects
            .iter()
            .find(|project| project.id == project_id)
            .map(|project| project.path.join(TASKS_DIR).join(SPECS_DIR))
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    /// Project owning `task_id`, if a previous list/get/create has seen it.
    pub async fn project_of(&self, task_id: &str) -> Option<String> {
        self.index
            .read()
            .await
            .get(task_id)
            .map(|location| location.project_id.clone())
    }

    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let specs_dir = self.specs_dir(project_id)?;
        let mut entries = match tokio::fs::read_dir(&specs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut tasks = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match read_task_dir(project_id, &dir).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {
                    debug!(path = %dir.display(), "skipping directory without requirements");
                }
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable task");
                }
            }
        }

        let mut index = self.index.write().await;
        for task in &tasks {
            index.insert(
                task.id.clone(),
                TaskLocation {
                    project_id: project_id.to_string(),
                    dir: specs_dir.join(&task.id),
                },
            );
        }

        Ok(tasks)
    }

    pub async fn list_all_tasks(&self) -> Result<Vec<Task>> {
        let mut all = Vec::new();
        for project in &self.projects {
            all.extend(self.list_tasks(&project.id).await?);
        }
        Ok(all)
    }

    pub async fn get_task(&self, project_id: &str, task_id: &str) -> Result<Task> {
        validate_task_id(task_id)?;
        let dir = self.specs_dir(project_id)?.join(task_id);
        let task = read_task_dir(project_id, &dir)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                project_id: project_id.to_string(),
                task_id: task_id.to_string(),
            })?;

        self.remember(&task.id, project_id, dir).await;
        Ok(task)
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidArgument("task title cannot be empty".to_string()));
        }
        let specs_dir = self.specs_dir(&draft.project_id)?;
        tokio::fs::create_dir_all(&specs_dir).await?;

        let _guard = self.create_lock.lock().await;
        let slug = slugify(title);
        let mut number = next_task_number(&specs_dir).await?;
        let (task_id, dir) = {
            let mut attempts = 0;
            loop {
                let candidate = format!("{number:03}-{slug}");
                let dir = specs_dir.join(&candidate);
                match tokio::fs::create_dir(&dir).await {
                    Ok(()) => break (candidate, dir),
                    // Another process took this number between the scan and now.
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        attempts += 1;
                        if attempts >= MAX_ID_ATTEMPTS {
                            return Err(Error::OperationFailed(format!(
                                "could not allocate a task id in {}",
                                specs_dir.display()
                            )));
                        }
                        number = following(number, &specs_dir)?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let now = Utc::now();
        let plan = PlanDoc {
            status: Some(TaskStatus::Backlog.as_str().to_string()),
            updated_at: Some(now),
            ..PlanDoc::default()
        };
        let requirements = RequirementsDoc {
            title: title.to_string(),
            description: draft.description,
            priority: draft.priority,
            created_at: now,
        };

        // Plan before requirements: a reader that finds requirements always
        // finds the plan next to it.
        write_doc(&dir.join(PLAN_FILE), &plan).await?;
        if !draft.metadata.is_empty() {
            write_doc(&dir.join(METADATA_FILE), &draft.metadata).await?;
        }
        write_doc(&dir.join(REQUIREMENTS_FILE), &requirements).await?;

        debug!(task_id = %task_id, project_id = %draft.project_id, "created task");
        self.remember(&task_id, &draft.project_id, dir.clone()).await;

        read_task_dir(&draft.project_id, &dir)
            .await?
            .ok_or_else(|| Error::OperationFailed(format!("task {task_id} vanished after create")))
    }

    pub async fn update_task(&self, task_id: &str, updates: &TaskUpdate) -> Result<Task> {
        let location = self.locate(task_id).await?;
        let requirements_path = location.dir.join(REQUIREMENTS_FILE);
        let mut requirements: RequirementsDoc = read_required_doc(&location, task_id).await?;

        if let Some(title) = &updates.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(Error::InvalidArgument("task title cannot be empty".to_string()));
            }
            requirements.title = title.to_string();
        }
        if let Some(description) = &updates.description {
            requirements.description = description.clone();
        }
        if let Some(priority) = updates.priority {
            requirements.priority = Some(priority);
        }
        if updates.title.is_some() || updates.description.is_some() || updates.priority.is_some()
        {
            write_doc(&requirements_path, &requirements).await?;
        }

        if let Some(patch) = &updates.metadata {
            let metadata_path = location.dir.join(METADATA_FILE);
            let mut metadata: Map<String, Value> = read_optional_doc(&metadata_path).await;
            for (key, value) in patch {
                metadata.insert(key.clone(), value.clone());
            }
            write_doc(&metadata_path, &metadata).await?;
        }

        self.touch_plan(&location, task_id, |_| {}).await?;
        self.reload(&location, task_id).await
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        let location = self.locate(task_id).await?;
        self.touch_plan(&location, task_id, |plan| {
            plan.status = Some(status.as_str().to_string());
        })
        .await?;
        self.reload(&location, task_id).await
    }

    /// Remove the task directory. Missing directories are not an error.
    pub async fn delete_task(&self, project_id: &str, task_id: &str) -> Result<()> {
        validate_task_id(task_id)?;
        let dir = self.specs_dir(project_id)?.join(task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(task_id, project_id, "deleted task"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.index.write().await.remove(task_id);
        Ok(())
    }

    /// Local stand-in for execution: marks the task in progress and returns
    /// a locally generated session id.
    pub async fn execute_task(&self, task_id: &str) -> Result<String> {
        self.update_task_status(task_id, TaskStatus::InProgress).await?;
        Ok(format!("local-{}", Uuid::new_v4()))
    }

    /// Append a timestamped line to the task's log document.
    pub async fn append_log(&self, task_id: &str, line: &str) -> Result<()> {
        let location = self.locate(task_id).await?;
        ensure_present(&location, task_id).await?;
        let path = location.dir.join(LOGS_FILE);
        let mut logs: Vec<String> = read_optional_doc(&path).await;
        logs.push(format!("[{}] {}", Utc::now().to_rfc3339(), line));
        write_doc(&path, &logs).await
    }

    /// Record the execution progress snapshot; `percent` is clamped to 100.
    pub async fn record_progress(
        &self,
        task_id: &str,
        phase: Option<String>,
        percent: u8,
    ) -> Result<Task> {
        let location = self.locate(task_id).await?;
        self.touch_plan(&location, task_id, |plan| {
            plan.progress = Some(Progress {
                phase,
                percent: percent.min(100),
            });
        })
        .await?;
        self.reload(&location, task_id).await
    }

    async fn remember(&self, task_id: &str, project_id: &str, dir: PathBuf) {
        self.index.write().await.insert(
            task_id.to_string(),
            TaskLocation {
                project_id: project_id.to_string(),
                dir,
            },
        );
    }

    async fn locate(&self, task_id: &str) -> Result<TaskLocation> {
        self.index
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))
    }

    async fn touch_plan<F>(&self, location: &TaskLocation, task_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut PlanDoc),
    {
        ensure_present(location, task_id).await?;
        let path = location.dir.join(PLAN_FILE);
        let mut plan: PlanDoc = read_optional_doc(&path).await;
        mutate(&mut plan);
        plan.updated_at = Some(Utc::now());
        write_doc(&path, &plan).await
    }

    async fn reload(&self, location: &TaskLocation, task_id: &str) -> Result<Task> {
        read_task_dir(&location.project_id, &location.dir)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                project_id: location.project_id.clone(),
                task_id: task_id.to_string(),
            })
    }
}

/// Lowercase ASCII slug; runs of anything else collapse to a single `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty()
        || task_id == "."
        || task_id == ".."
        || task_id.contains('/')
        || task_id.contains('\\')
    {
        return Err(Error::InvalidArgument(format!("invalid task id '{task_id}'")));
    }
    Ok(())
}

/// Numeric prefix of a task directory name, e.g. `12` for `012-fix-bug`.
fn task_number(name: &str) -> Option<u32> {
    let digits: String = name.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

async fn next_task_number(specs_dir: &Path) -> Result<u32> {
    let mut max = 0;
    let mut entries = tokio::fs::read_dir(specs_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(number) = task_number(&entry.file_name().to_string_lossy()) {
            max = max.max(number);
        }
    }
    following(max, specs_dir)
}

fn following(number: u32, specs_dir: &Path) -> Result<u32> {
    number.checked_add(1).ok_or_else(|| {
        Error::OperationFailed(format!(
            "task numbers exhausted in {}",
            specs_dir.display()
        ))
    })
}

async fn read_task_dir(project_id: &str, dir: &Path) -> Result<Option<Task>> {
    let requirements_path = dir.join(REQUIREMENTS_FILE);
    let content = match tokio::fs::read_to_string(&requirements_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let requirements: RequirementsDoc = serde_json::from_str(&content)?;

    let plan: PlanDoc = read_optional_doc(&dir.join(PLAN_FILE)).await;
    let metadata: Map<String, Value> = read_optional_doc(&dir.join(METADATA_FILE)).await;
    let logs: Vec<String> = read_optional_doc(&dir.join(LOGS_FILE)).await;

    let id = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Some(Task {
        id,
        project_id: project_id.to_string(),
        title: requirements.title,
        description: requirements.description,
        status: plan.status(dir),
        priority: requirements.priority,
        subtasks: plan.subtasks(),
        progress: plan.progress.clone(),
        metadata,
        logs,
        created_at: requirements.created_at,
        updated_at: plan.updated_at.unwrap_or(requirements.created_at),
    }))
}

/// `TaskNotFound` once the indexed directory has been removed.
async fn ensure_present(location: &TaskLocation, task_id: &str) -> Result<()> {
    if tokio::fs::try_exists(location.dir.join(REQUIREMENTS_FILE)).await? {
        Ok(())
    } else {
        Err(Error::TaskNotFound {
            project_id: location.project_id.clone(),
            task_id: task_id.to_string(),
        })
    }
}

async fn read_required_doc<T: DeserializeOwned>(
    location: &TaskLocation,
    task_id: &str,
) -> Result<T> {
    let path = location.dir.join(REQUIREMENTS_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::TaskNotFound {
                project_id: location.project_id.clone(),
                task_id: task_id.to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_str(&content)?)
}

/// Read an optional document; absence or corruption yields the default.
async fn read_optional_doc<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable document; using default");
            return T::default();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "corrupt document; using default");
        T::default()
    })
}

async fn write_doc<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic_async(path, json.as_bytes()).await
}
