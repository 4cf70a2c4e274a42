use super::open_store;
use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use ralph_core::prompts::validate_task_params;
use ralph_core::task::{Task, TaskAction, TaskFilter, KEEP_FINISHED_TASKS};
use ralph_core::types::{TaskKind, TaskStatus};
use ralph_server::routes::run::resolve_version;
use std::path::Path;

#[derive(Subcommand)]
pub enum TasksSubcommand {
    /// List tasks, newest first
    List {
        /// refine, generate, story-edit or align
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Only queued or running tasks
        #[arg(long)]
        active: bool,
        /// Include soft-deleted tasks
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one task with its result
    Show { id: String },
    /// Queue a task for the server's worker
    #[command(disable_version_flag = true)]
    Add {
        /// refine, generate, story-edit or align
        kind: String,
        #[arg(long)]
        version: Option<String>,
        /// Task parameter as key=value (repeatable), e.g. description="..."
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
    /// Mark a task read
    Read { id: String },
    /// Mark every finished task read
    ReadAll,
    /// Soft-delete a task (or remove it with --purge)
    Delete {
        id: String,
        #[arg(long)]
        purge: bool,
    },
    /// Restore a soft-deleted task
    Restore { id: String },
    /// Drop finished tasks beyond the newest `keep`
    Cleanup {
        #[arg(long, default_value_t = KEEP_FINISHED_TASKS)]
        keep: usize,
    },
}

pub fn run(root: &Path, subcmd: TasksSubcommand, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    match subcmd {
        TasksSubcommand::List {
            kind,
            status,
            active,
            all,
            limit,
        } => {
            let filter = TaskFilter {
                kind: kind.as_deref().map(str::parse::<TaskKind>).transpose()?,
                status: status.as_deref().map(str::parse::<TaskStatus>).transpose()?,
                active,
                include_deleted: all,
                limit,
            };
            let tasks = store.list_tasks(&filter)?;
            let unread = store.unread_task_count()?;
            if json {
                return print_json(&serde_json::json!({ "tasks": tasks, "unread": unread }));
            }
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            let rows = tasks.iter().map(row).collect();
            print_table(&["ID", "TYPE", "STATUS", "VERSION", "CREATED", "NOTE"], rows);
            if unread > 0 {
                println!("\n{unread} unread");
            }
            Ok(())
        }
        TasksSubcommand::Show { id } => {
            let task = store.get_task(&id)?;
            if json {
                return print_json(&task);
            }
            println!("{} [{}] {}", task.id, task.kind, task.status);
            if let Some(v) = &task.version {
                println!("Version: {v}");
            }
            println!("Params:  {}", task.params);
            if let Some(err) = &task.error {
                println!("Error:   {err}");
            }
            if let Some(result) = &task.result {
                println!("\n{}", serde_json::to_string_pretty(result)?);
            }
            Ok(())
        }
        TasksSubcommand::Add {
            kind,
            version,
            params,
        } => {
            let kind: TaskKind = kind.parse()?;
            let params = parse_params(&params)?;
            validate_task_params(kind, &params)?;
            let state = store.run_state()?;
            let version = match (kind, params.get("storyId").and_then(|v| v.as_str())) {
                (TaskKind::StoryEdit, Some(id)) if version.is_none() => {
                    store.get_story(id)?.version
                }
                _ => resolve_version(&store, version.as_deref(), &state)?,
            };
            let task = store.create_task(kind, Some(&version), params)?;
            if json {
                return print_json(&serde_json::json!({ "task": task }));
            }
            println!("Queued {} task {} for {version}", task.kind, task.id);
            println!("A running `ralph serve` picks it up.");
            Ok(())
        }
        TasksSubcommand::Read { id } => action(&store, &id, TaskAction::Read, json),
        TasksSubcommand::ReadAll => {
            let updated = store.mark_all_tasks_read()?;
            if json {
                return print_json(&serde_json::json!({ "updated": updated }));
            }
            println!("Marked {updated} task(s) read");
            Ok(())
        }
        TasksSubcommand::Delete { id, purge: false } => {
            action(&store, &id, TaskAction::Delete, json)
        }
        TasksSubcommand::Delete { id, purge: true } => {
            store.delete_task(&id)?;
            if json {
                return print_json(&serde_json::json!({ "deleted": true, "id": id }));
            }
            println!("Task {id} removed");
            Ok(())
        }
        TasksSubcommand::Restore { id } => action(&store, &id, TaskAction::Restore, json),
        TasksSubcommand::Cleanup { keep } => {
            let removed = store.cleanup_tasks(keep)?;
            if json {
                return print_json(&serde_json::json!({ "removed": removed }));
            }
            println!("Removed {removed} finished task(s)");
            Ok(())
        }
    }
}

fn action(
    store: &ralph_core::Store,
    id: &str,
    action: TaskAction,
    json: bool,
) -> anyhow::Result<()> {
    let task = store.apply_task_action(id, action)?;
    if json {
        return print_json(&task);
    }
    let verb = match action {
        TaskAction::Read => "marked read",
        TaskAction::Delete => "deleted",
        TaskAction::Restore => "restored",
    };
    println!("Task {} {verb}", task.id);
    Ok(())
}

fn row(task: &Task) -> Vec<String> {
    let note = task
        .error
        .as_deref()
        .or_else(|| task.deleted_at.map(|_| "deleted"))
        .unwrap_or_default();
    vec![
        task.id.clone(),
        task.kind.to_string(),
        task.status.to_string(),
        task.version.clone().unwrap_or_default(),
        task.created_at.format("%Y-%m-%d %H:%M").to_string(),
        truncate(note, 40),
    ]
}

/// `key=value` pairs into a JSON object of strings.
fn parse_params(pairs: &[String]) -> anyhow::Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("parameter '{pair}' is not key=value"))?;
        map.insert(
            key.trim().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }
    Ok(serde_json::Value::Object(map))
}
