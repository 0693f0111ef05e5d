//! The `todo` tool: read and update the run's [`TodoList`](crate::agent::todo::TodoList).

use schemars::JsonSchema;
use serde::Deserialize;

use super::core::{Tool, ToolFuture, parse_tool_args};
use crate::ToolDef;
use crate::agent::job::JobHandle;
use crate::agent::todo::{TodoError, TodoList};

/// Action for the todo tool.
#[derive(Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoAction {
    Add,
    Start,
    Complete,
    Fail,
    Skip,
    Cancel,
    List,
}

/// Typed arguments for the `todo` tool.
#[derive(Deserialize, JsonSchema)]
pub struct TodoArgs {
    /// The action to perform on the todo list.
    pub action: TodoAction,
    /// The task description (required for 'add').
    #[serde(default)]
    pub task: Option<String>,
    /// The task number (1-indexed) for every action except 'add' and 'list'.
    #[serde(default)]
    pub number: Option<usize>,
    /// Artifact references produced by the task (for 'complete').
    #[serde(default)]
    pub outputs: Vec<String>,
    /// What went wrong (for 'fail').
    #[serde(default)]
    pub error: Option<String>,
}

/// Status-checked checklist tool backed by the run's [`JobHandle`].
pub struct TodoTool {
    job: JobHandle,
}

impl TodoTool {
    pub fn new(job: JobHandle) -> Self {
        Self { job }
    }

    fn apply(list: &mut TodoList, args: TodoArgs) -> String {
        if args.action == TodoAction::Add {
            return match args.task {
                Some(task) if !task.trim().is_empty() => {
                    list.add_item(task);
                    list.format_checklist()
                }
                _ => "Error: 'task' is required for 'add'.".into(),
            };
        }
        if args.action == TodoAction::List {
            return list.format_checklist();
        }

        let Some(id) = args
            .number
            .and_then(|n| list.item_at(n))
            .map(|item| item.id.clone())
        else {
            return format!("Error: invalid task number.\n{}", list.format_checklist());
        };
        let outcome: Result<(), TodoError> = match args.action {
            TodoAction::Start => list.start(&id),
            TodoAction::Complete => list.complete(&id, args.outputs),
            TodoAction::Fail => list.fail(
                &id,
                args.error.unwrap_or_else(|| "failed without a reason".into()),
            ),
            TodoAction::Skip => list.skip(&id),
            TodoAction::Cancel => list.cancel(&id),
            TodoAction::Add | TodoAction::List => Ok(()),
        };
        match outcome {
            Ok(()) => list.format_checklist(),
            Err(e) => format!("Error: {e}\n{}", list.format_checklist()),
        }
    }
}

impl Tool for TodoTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "todo",
            "Track this run's tasks. Actions: 'add' (new task), 'start', \
             'complete' (optionally with outputs), 'fail' (with error), 'skip', \
             'cancel' (by task number), 'list'. Status changes that the task's \
             current state does not allow are refused.",
            crate::json_schema_for::<TodoArgs>(),
        )
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let parsed = parse_tool_args::<TodoArgs>(arguments);
        Box::pin(async move {
            Ok(match parsed {
                Ok(args) => self.job.with_todo(|list| Self::apply(list, args)),
                Err(e) => e,
            })
        })
    }
}
