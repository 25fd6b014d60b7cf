//! hubsync queue command implementations.

use crate::cli::{Context, QueueCommands};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::queue::MutationAction;

pub(crate) async fn run(ctx: &Context, cmd: QueueCommands) -> Result<()> {
    let queue = ctx.queue();
    match cmd {
        QueueCommands::Status => {
            let status = queue.status();
            let mut human = HumanOutput::new("Sync queue");
            human.push_summary("pending", status.pending.to_string());
            human.push_summary("hub", if status.available { "connected" } else { "offline" });
            human.push_summary("file", status.path.display().to_string());
            if let Some(oldest) = status.oldest {
                human.push_summary("oldest", oldest.to_rfc3339());
            }
            if queue.should_sync() {
                human.push_next_step("hubsync queue sync");
            }
            emit_success(ctx.output, "queue status", &status, Some(&human))
        }
        QueueCommands::List => {
            let pending = queue.pending();
            let mut human = HumanOutput::new(format!("{} pending mutation(s)", pending.len()));
            for mutation in &pending {
                let mut line = format!(
                    "{} {} {} (attempts: {})",
                    mutation.id, mutation.entity, mutation.action, mutation.attempts
                );
                if let Some(err) = &mutation.last_error {
                    line.push_str(&format!(" last error: {err}"));
                }
                human.push_detail(line);
            }
            emit_success(ctx.output, "queue list", &pending, Some(&human))
        }
        QueueCommands::Add {
            entity,
            action,
            data,
        } => {
            let action: MutationAction = action.parse()?;
            let data: serde_json::Value = serde_json::from_str(&data)
                .map_err(|e| Error::InvalidArgument(format!("payload is not valid JSON: {e}")))?;
            let mutation = queue.queue_mutation(entity.trim(), action, data);
            let mut human = HumanOutput::new(format!("Queued {}", mutation.id));
            human.push_summary("pending", queue.pending_count().to_string());
            emit_success(ctx.output, "queue add", &mutation, Some(&human))
        }
        QueueCommands::Sync => {
            if !ctx.hub.is_configured() {
                return Err(Error::NotConfigured("hub.url and hub.token"));
            }
            let synced = queue.sync_pending().await;
            let remaining = queue.pending_count();
            let mut human = HumanOutput::new("Sync pass complete");
            human.push_summary("synced", synced.to_string());
            human.push_summary("remaining", remaining.to_string());
            if remaining > 0 {
                human.push_warning(format!("{remaining} mutation(s) still pending"));
                human.push_next_step("hubsync queue list");
            }
            emit_success(
                ctx.output,
                "queue sync",
                &serde_json::json!({ "synced": synced, "remaining": remaining }),
                Some(&human),
            )
        }
        QueueCommands::Clear => {
            let dropped = queue.pending_count();
            queue.clear_pending();
            let human = HumanOutput::new(format!("Dropped {dropped} pending mutation(s)"));
            emit_success(
                ctx.output,
                "queue clear",
                &serde_json::json!({ "dropped": dropped }),
                Some(&human),
            )
        }
    }
}
