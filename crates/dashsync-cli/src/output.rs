//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag), one object per line
//! - Quiet mode for scripting (--quiet flag)

use dashsync_core::{CacheEntry, ConnectionState, SyncStatus};

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

    /// Print one entity update
    pub fn print_update(&self, kind: &str, entry: &CacheEntry, has_conflict: bool) {
        match self.format {
            OutputFormat::Human => {
                let marker = if has_conflict { " (conflict)" } else { "" };
                println!(
                    "{} {}{} {}",
                    entry.last_modified.format("%Y-%m-%d %H:%M:%S"),
                    entry.key,
                    marker,
                    truncate(&entry.data.to_string(), 80)
                );
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": format!("{}_updated", kind),
                        "key": entry.key,
                        "data": entry.data,
                        "lastModified": entry.last_modified,
                        "hasConflict": has_conflict,
                    })
                );
            }
            OutputFormat::Quiet => {
                println!("{}", entry.key);
            }
        }
    }

    /// Print a sync status change
    pub fn print_status(&self, status: SyncStatus) {
        match self.format {
            OutputFormat::Human => println!("-- {}", status),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"event": "sync_status_changed", "status": status.as_str()})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a connection state change
    pub fn print_connection(&self, state: ConnectionState, detail: &str) {
        match self.format {
            OutputFormat::Human => {
                if detail.is_empty() {
                    println!("-- connection {}", state);
                } else {
                    println!("-- connection {} ({})", state, detail);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"event": "state_change", "state": state.as_str(), "detail": detail})
                );
            }
            OutputFormat::Quiet => {}
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

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => eprintln!("⚠ {}", msg),
            OutputFormat::Json => {
                eprintln!("{}", serde_json::json!({"warning": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
