//! hubsync task command implementations.

use crate::cli::{Context, TaskCommands};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::repository::TaskRepository;
use crate::task::{HubTask, TaskDraft, TaskPriority, TaskStatus, TaskUpdate};

pub(crate) async fn run(ctx: &Context, cmd: TaskCommands) -> Result<()> {
    let repo = ctx.repository();
    let result = dispatch(ctx, &repo, cmd).await;
    // Give background mirrors a chance to finish or defer before exit.
    repo.flush_mirrors().await;
    result
}

async fn dispatch(ctx: &Context, repo: &TaskRepository, cmd: TaskCommands) -> Result<()> {
    match cmd {
        TaskCommands::List { project } => {
            let tasks = repo.list_tasks(project.as_deref()).await?;
            let mut human = HumanOutput::new(format!("{} task(s)", tasks.len()));
            for task in &tasks {
                human.push_detail(format!(
                    "{}/{} [{}] {}",
                    task.project_id, task.id, task.status, task.title
                ));
            }
            emit_success(ctx.output, "task list", &tasks, Some(&human))
        }
        TaskCommands::Show { project, task_id } => {
            let task = repo.get_task(&project, &task_id).await?;
            emit_success(ctx.output, "task show", &task, Some(&describe(&task)))
        }
        TaskCommands::Create {
            project,
            title,
            description,
            priority,
        } => {
            let priority = priority
                .as_deref()
                .map(str::parse::<TaskPriority>)
                .transpose()?;
            let task = repo
                .create_task(TaskDraft {
                    project_id: project,
                    title,
                    description,
                    priority,
                    ..TaskDraft::default()
                })
                .await?;
            let mut human = describe(&task);
            human.push_next_step(format!("hubsync task execute {}", task.id));
            emit_success(ctx.output, "task create", &task, Some(&human))
        }
        TaskCommands::Update {
            task_id,
            title,
            description,
            priority,
        } => {
            let priority = priority
                .as_deref()
                .map(str::parse::<TaskPriority>)
                .transpose()?;
            repo.list_tasks(None).await?;
            let task = repo
                .update_task(
                    &task_id,
                    TaskUpdate {
                        title,
                        description,
                        priority,
                        metadata: None,
                    },
                )
                .await?;
            emit_success(ctx.output, "task update", &task, Some(&describe(&task)))
        }
        TaskCommands::Status { task_id, status } => {
            let status = TaskStatus::parse_any(&status)?;
            repo.list_tasks(None).await?;
            let task = repo.update_task_status(&task_id, status).await?;
            emit_success(ctx.output, "task status", &task, Some(&describe(&task)))
        }
        TaskCommands::Delete { task_id } => {
            repo.list_tasks(None).await?;
            repo.delete_task(&task_id).await?;
            let human = HumanOutput::new(format!("Deleted {task_id}"));
            emit_success(
                ctx.output,
                "task delete",
                &serde_json::json!({ "id": task_id }),
                Some(&human),
            )
        }
        TaskCommands::Execute { task_id } => {
            let response = repo.execute_task(&task_id).await?;
            let mut human = HumanOutput::new(format!("Execution started for {task_id}"));
            if let Some(session_id) = &response.session_id {
                human.push_summary("session", session_id.clone());
            }
            emit_success(ctx.output, "task execute", &response, Some(&human))
        }
        TaskCommands::Cancel { task_id } => {
            let response = repo.cancel_task(&task_id).await?;
            let human = HumanOutput::new(format!("Cancellation requested for {task_id}"));
            emit_success(ctx.output, "task cancel", &response, Some(&human))
        }
        TaskCommands::Log { task_id, line } => {
            repo.list_tasks(None).await?;
            repo.append_log(&task_id, &line).await?;
            let human = HumanOutput::new(format!("Logged to {task_id}"));
            emit_success(
                ctx.output,
                "task log",
                &serde_json::json!({ "id": task_id, "line": line }),
                Some(&human),
            )
        }
        TaskCommands::Progress {
            task_id,
            percent,
            phase,
        } => {
            repo.list_tasks(None).await?;
            let task = repo.record_progress(&task_id, phase, percent).await?;
            emit_success(ctx.output, "task progress", &task, Some(&describe(&task)))
        }
    }
}

fn describe(task: &HubTask) -> HumanOutput {
    let mut human = HumanOutput::new(format!("{}: {}", task.id, task.title));
    human.push_summary("project", task.project_id.clone());
    human.push_summary("status", task.status.clone());
    if let Some(priority) = task.priority {
        human.push_summary("priority", priority.as_str());
    }
    if let Some(progress) = &task.progress {
        let phase = progress.phase.as_deref().unwrap_or("-");
        human.push_summary("progress", format!("{}% ({phase})", progress.percent));
    }
    if !task.description.is_empty() {
        human.push_detail(task.description.clone());
    }
    for subtask in &task.subtasks {
        human.push_detail(format!("{} [{:?}] {}", subtask.id, subtask.status, subtask.title));
    }
    human
}
