//! Built-in task tools.
//!
//! Seven tools are registered at startup: `create_task`, `list_tasks`,
//! `complete_task`, `delete_task`, `get_tasks_by_date`,
//! `get_completed_tasks` and `list_projects`. Each wraps one [`TaskClient`]
//! call (the date and completed filters post-process the listing) and
//! returns a JSON payload the model can narrate. None of them is
//! idempotent, so the dispatcher never retries them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::tasks::client::{NewTask, Project, Task, TaskClient};
use crate::core::tools::registry::{ToolHandler, ToolRegistry};
use crate::errors::BridgeError;

/// Project used when the model does not name one.
const DEFAULT_PROJECT: &str = "inbox";

/// Priority levels the service accepts.
const VALID_PRIORITIES: [i64; 4] = [0, 1, 3, 5];

/// Build the registry with all built-in task tools.
pub fn task_tool_registry(client: TaskClient) -> Arc<ToolRegistry> {
    let client = Arc::new(client);
    ToolRegistry::builder()
        .register(
            "create_task",
            "Create a task. Dates use YYYY-MM-DD; priority is 0 (none), 1 (low), 3 (medium) or 5 (high).",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Task title"},
                    "content": {"type": "string", "description": "Task notes"},
                    "project_id": {"type": "string", "description": "Target project, defaults to the inbox"},
                    "due_date": {"type": "string", "description": "Due date, YYYY-MM-DD"},
                    "start_date": {"type": "string", "description": "Start date, YYYY-MM-DD"},
                    "is_all_day": {"type": "boolean"},
                    "priority": {"type": "integer", "description": "0, 1, 3 or 5"}
                },
                "required": ["title"]
            }),
            Arc::new(CreateTask {
                client: client.clone(),
            }),
        )
        .register(
            "list_tasks",
            "List tasks in a project as a markdown digest.",
            json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string", "description": "Project to list, defaults to the inbox"}
                }
            }),
            Arc::new(ListTasks {
                client: client.clone(),
            }),
        )
        .register(
            "complete_task",
            "Mark a task as completed.",
            json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "task_id": {"type": "string"}
                },
                "required": ["project_id", "task_id"]
            }),
            Arc::new(CompleteTask {
                client: client.clone(),
            }),
        )
        .register(
            "delete_task",
            "Delete a task permanently.",
            json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "task_id": {"type": "string"}
                },
                "required": ["project_id", "task_id"]
            }),
            Arc::new(DeleteTask {
                client: client.clone(),
            }),
        )
        .register(
            "get_tasks_by_date",
            "List tasks due in a date range. Without end_date, only the start date is covered.",
            json!({
                "type": "object",
                "properties": {
                    "start_date": {"type": "string", "description": "First due date, YYYY-MM-DD"},
                    "end_date": {"type": "string", "description": "Last due date, YYYY-MM-DD; defaults to start_date"},
                    "project_id": {"type": "string", "description": "Project to search, defaults to the inbox"}
                },
                "required": ["start_date"]
            }),
            Arc::new(TasksByDate {
                client: client.clone(),
            }),
        )
        .register(
            "get_completed_tasks",
            "List only the completed tasks in a project.",
            json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string", "description": "Project to search, defaults to the inbox"}
                }
            }),
            Arc::new(CompletedTasks {
                client: client.clone(),
            }),
        )
        .register(
            "list_projects",
            "List the user's projects with their ids.",
            json!({"type": "object", "properties": {}}),
            Arc::new(ListProjects { client }),
        )
        .build()
}

fn str_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

fn required_str(args: &Map<String, Value>, name: &str) -> Result<String, BridgeError> {
    str_arg(args, name)
        .ok_or_else(|| BridgeError::InvalidArguments(format!("missing required field '{name}'")))
}

struct CreateTask {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for CreateTask {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let priority = args.get("priority").and_then(Value::as_i64);
        if let Some(p) = priority {
            if !VALID_PRIORITIES.contains(&p) {
                return Err(BridgeError::InvalidArguments(format!(
                    "priority must be one of 0, 1, 3, 5 (got {p})"
                )));
            }
        }
        let task = self
            .client
            .create_task(&NewTask {
                title: required_str(&args, "title")?,
                content: str_arg(&args, "content"),
                project_id: str_arg(&args, "project_id"),
                due_date: str_arg(&args, "due_date"),
                start_date: str_arg(&args, "start_date"),
                is_all_day: args.get("is_all_day").and_then(Value::as_bool),
                priority,
            })
            .await?;
        Ok(json!({
            "status": "created",
            "task_id": task.id,
            "title": task.title,
            "project_id": task.project_id,
        }))
    }
}

struct ListTasks {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for ListTasks {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let project_id = str_arg(&args, "project_id").unwrap_or_else(|| DEFAULT_PROJECT.into());
        let tasks = self.client.list_tasks(&project_id).await?;
        Ok(json!({
            "project_id": project_id,
            "count": tasks.len(),
            "digest": render_digest(&tasks),
        }))
    }
}

struct CompleteTask {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for CompleteTask {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let project_id = required_str(&args, "project_id")?;
        let task_id = required_str(&args, "task_id")?;
        self.client.complete_task(&project_id, &task_id).await?;
        Ok(json!({"status": "completed", "task_id": task_id}))
    }
}

struct DeleteTask {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for DeleteTask {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let project_id = required_str(&args, "project_id")?;
        let task_id = required_str(&args, "task_id")?;
        self.client.delete_task(&project_id, &task_id).await?;
        Ok(json!({"status": "deleted", "task_id": task_id}))
    }
}

struct TasksByDate {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for TasksByDate {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let start_date = required_str(&args, "start_date")?;
        let end_date = str_arg(&args, "end_date").unwrap_or_else(|| start_date.clone());
        if end_date < start_date {
            return Err(BridgeError::InvalidArguments(format!(
                "end_date {end_date} is before start_date {start_date}"
            )));
        }
        let project_id = str_arg(&args, "project_id").unwrap_or_else(|| DEFAULT_PROJECT.into());
        let mut tasks = self.client.list_tasks(&project_id).await?;
        tasks.retain(|t| due_within(t, &start_date, &end_date));
        Ok(json!({
            "project_id": project_id,
            "start_date": start_date,
            "end_date": end_date,
            "count": tasks.len(),
            "digest": render_digest(&tasks),
        }))
    }
}

struct CompletedTasks {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for CompletedTasks {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let project_id = str_arg(&args, "project_id").unwrap_or_else(|| DEFAULT_PROJECT.into());
        let mut tasks = self.client.list_tasks(&project_id).await?;
        tasks.retain(Task::is_completed);
        Ok(json!({
            "project_id": project_id,
            "count": tasks.len(),
            "digest": render_digest(&tasks),
        }))
    }
}

struct ListProjects {
    client: Arc<TaskClient>,
}

#[async_trait]
impl ToolHandler for ListProjects {
    async fn call(&self, _args: Map<String, Value>) -> Result<Value, BridgeError> {
        let projects = self.client.list_projects().await?;
        let listing: Vec<Value> = projects
            .iter()
            .map(|Project { id, name }| json!({"id": id, "name": name}))
            .collect();
        Ok(json!({"count": listing.len(), "projects": listing}))
    }
}

/// Whether a task's due date (date part only) falls inside the inclusive
/// range. Tasks without a due date never match.
fn due_within(task: &Task, start_date: &str, end_date: &str) -> bool {
    // Dates are ISO-formatted, so the YYYY-MM-DD prefix compares
    // lexicographically.
    match &task.due_date {
        Some(due) => {
            let day = &due[..due.len().min(10)];
            day >= start_date && day <= end_date
        }
        None => false,
    }
}

/// Render tasks as a markdown checklist the model can read aloud.
fn render_digest(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks in this project.".to_string();
    }
    let open = tasks.iter().filter(|t| !t.is_completed()).count();
    let mut out = format!(
        "## Tasks ({open} open, {} completed)\n",
        tasks.len() - open
    );
    for task in tasks {
        let marker = if task.is_completed() { "x" } else { " " };
        out.push_str(&format!("- [{marker}] {}", task.title));
        let mut extras = Vec::new();
        if let Some(due) = &task.due_date {
            extras.push(format!("due {due}"));
        }
        if let Some(label) = priority_label(task.priority) {
            extras.push(format!("priority {label}"));
        }
        if !extras.is_empty() {
            out.push_str(&format!(" ({})", extras.join(", ")));
        }
        out.push('\n');
    }
    out
}

fn priority_label(priority: i64) -> Option<&'static str> {
    match priority {
        1 => Some("low"),
        3 => Some("medium"),
        5 => Some("high"),
        _ => None,
    }
}
