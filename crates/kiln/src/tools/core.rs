//! Tool abstraction for run steps.
//!
//! The [`Tool`] trait defines the interface every tool implements: a static
//! definition (name, description, JSON schema) and an async `execute`.
//! Tool-local failures come back as `Ok("Error: ...")` strings. Only an
//! operator interrupt travels as `Err`, so it reaches the run loop intact.

use crate::ToolDef;
use crate::agent::interrupt::Interrupted;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Result of running a tool: output text, or the interrupt that aborted it.
pub type ToolResult = Result<String, Interrupted>;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>>;

/// A unit of work a run can invoke by name.
///
/// # Example
///
/// ```ignore
/// struct Describe;
///
/// impl Tool for Describe {
///     fn definition(&self) -> ToolDef { /* ... */ }
///
///     fn execute(&self, arguments: &str) -> ToolFuture<'_> {
///         let arguments = arguments.to_string();
///         Box::pin(async move { Ok(format!("described {arguments}")) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDef;

    /// Execute with the raw JSON arguments string.
    ///
    /// Errors are returned as `Ok("Error: ...")`. Return `Err` only for an
    /// [`Interrupted`] observed at a safe point; never swallow one.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    /// The tool's name (delegates to the definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }
}

impl<T: Tool + ?Sized> Tool for Box<T> {
    fn definition(&self) -> ToolDef {
        (**self).definition()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (**self).execute(arguments)
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// Tools dispatched by name.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with(TodoTool::new(job.clone()))
///     .with(approval_required(GenerateTool::new(pool, job.clone()), gate, Some(job)));
/// let out = tools.execute("todo", r#"{"action":"list"}"#).await?;
/// ```
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .field("max_result_bytes", &self.max_result_bytes)
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Register `tool` only when `condition` holds.
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Definitions of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run the named tool. Unknown names yield an `"Error: ..."` result.
    pub async fn execute(&self, name: &str, arguments: &str) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return Ok(format!("Error: unknown tool '{name}'"));
        };

        log_tool_call(name, arguments);
        let start = std::time::Instant::now();
        let result = tool.execute(arguments).await;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                debug!("Tool {name} completed in {elapsed:.0}ms ({} bytes)", output.len());
                Ok(truncate_result(output, self.max_result_bytes))
            }
            Err(interrupt) => {
                info!("Tool {name} interrupted after {elapsed:.0}ms: {interrupt}");
                Err(interrupt)
            }
        }
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

type ErasedToolHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = ToolResult> + Send>> + Send + Sync>;

/// A closure-based tool that auto-parses its arguments.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct EchoArgs { text: String }
///
/// let tool = FnTool::new(
///     ToolDef::new("echo", "Echo text", json_schema_for::<EchoArgs>()),
///     |args: EchoArgs| async move { Ok(args.text) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
}

impl FnTool {
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        let erased = move |raw: String| -> Pin<Box<dyn Future<Output = ToolResult> + Send>> {
            match parse_tool_args::<A>(&raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => Box::pin(async move { Ok(e) }),
            }
        };
        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (self.handler)(arguments.to_string())
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    let ellipsis = if arguments.chars().count() > 120 { "..." } else { "" };
    info!("[tool] {name}({args_preview}{ellipsis})");
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate to at most `max` bytes on a char boundary, noting the cut.
pub fn truncate_result(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let total = s.len();
    s.truncate(s.floor_char_boundary(max));
    format!("{s}...\n[truncated: {total} bytes total]")
}

/// Parse raw JSON arguments, or an `"Error: ..."` string to return as-is.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| {
        format!(
            "Error: invalid tool arguments: {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )
    })
}
