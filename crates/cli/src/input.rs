// Task input for the engine

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use recalc_dispatch::Task;

/// Read the raw task document from the inline argument, a file, or stdin
pub fn read(inline: Option<&str>, path: Option<&Path>) -> Result<String> {
    match (inline, path) {
        (Some(json), _) => Ok(json.to_string()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tasks from {}", path.display())),
        (None, None) => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read tasks from stdin")?;
            Ok(buf)
        }
    }
}

/// Parse a JSON array of tasks; dates are validated here, before any work starts
pub fn parse_tasks(raw: &str) -> Result<Vec<Task>> {
    let tasks: Vec<Task> = serde_json::from_str(raw.trim()).context("invalid task list")?;
    if tasks.is_empty() {
        bail!("task list is empty");
    }
    Ok(tasks)
}
