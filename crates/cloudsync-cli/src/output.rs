//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

use cloudsync_core::SyncStatusState;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print the persisted sync status
    pub fn print_status(&self, state: &SyncStatusState) {
        match self.format {
            OutputFormat::Human => {
                println!("Cloud Sync Status");
                println!("=================");
                println!();
                println!("  Enabled:     {}", if state.enabled { "yes" } else { "no" });
                println!("  Status:      {}", state.status);
                if state.blocked_reason.is_blocked() {
                    println!("  Blocked:     {}", state.blocked_reason.as_str());
                }
                println!("  Cursor:      {}", state.cursor);
                println!("  Op seq:      {}", state.op_seq);
                println!("  Queue depth: {}", state.queue_depth);
                if state.consecutive_failures > 0 {
                    println!("  Failures:    {}", state.consecutive_failures);
                }
                println!();
                println!("  Last pull:   {}", format_time(state.last_pull_at));
                println!("  Last push:   {}", format_time(state.last_push_at));
                println!("  Next pull:   {}", format_time(state.next_pull_at));
                if let Some(at) = state.last_conflict_at {
                    println!(
                        "  Conflicts:   {} at {}",
                        state.last_conflict_count,
                        at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                if let Some(ref error) = state.last_error {
                    println!();
                    println!("  Last error:  {}", truncate(error, 120));
                }
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!(state));
            }
            OutputFormat::Quiet => {
                println!("{}", state.status);
            }
        }
    }

    /// Print a list of store names
    pub fn print_store_names(&self, names: &[String]) {
        match self.format {
            OutputFormat::Human => {
                if names.is_empty() {
                    println!("No stores found.");
                    return;
                }
                for name in names {
                    println!("{}", name);
                }
                println!("\n{} store(s)", names.len());
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!(names));
            }
            OutputFormat::Quiet => {
                for name in names {
                    println!("{}", name);
                }
            }
        }
    }

    /// Print a JSON value; compact in quiet mode
    pub fn print_value(&self, value: &Value) {
        match self.format {
            OutputFormat::Human | OutputFormat::Json => self.print_json(value),
            OutputFormat::Quiet => println!("{}", value),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }

    fn print_json(&self, value: &Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", value),
        }
    }
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| {
        t.with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    })
    .unwrap_or_else(|| "never".to_string())
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
