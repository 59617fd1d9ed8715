//! **ToolExecutor** — the seam to whatever executes function calls.
//!
//! When a completed response carries `function_call` items, the session runs
//! each through the executor and sends the serialized result back so the
//! model can produce its follow-up answer. Tool logic itself lives elsewhere.

/// Executes one named tool with JSON-encoded arguments, returning a
/// serialized result string. Implementations should catch their own failures
/// and encode them as `{"error": ...}` results; the session does the same for
/// panicking or absent tools.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, name: &str, arguments: &str) -> String;
}

/// Executor that knows no tools. Every call reports an error result, which
/// the model can relay to the user.
#[derive(Debug, Default)]
pub struct PlaceholderToolExecutor;

impl ToolExecutor for PlaceholderToolExecutor {
    fn execute(&self, name: &str, _arguments: &str) -> String {
        format!(r#"{{"error":"no executor configured for tool: {}"}}"#, name)
    }
}
