//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::ResourceGraph;
use crate::planner::{OperationKind, Plan, ProgressEvent};
use crate::reconciler::{DriftReport, ReconciliationResult, RefreshReport};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Input hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Operation result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true if output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Recorded state matches the stack.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan (stack {})\n\n", short(&plan.stack_hash));

        let rows: Vec<PlanRow> = plan
            .changes()
            .enumerate()
            .map(|(i, op)| PlanRow {
                index: i + 1,
                action: Self::format_kind(op.kind),
                resource: op.id.to_string(),
                changes: Self::truncate(
                    &op.diff
                        .changes
                        .iter()
                        .filter(|_| matches!(op.kind, OperationKind::Update | OperationKind::Replace))
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                    60,
                ),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(OperationKind::Create).to_string().green(),
            plan.count(OperationKind::Update).to_string().yellow(),
            plan.count(OperationKind::Replace).to_string().magenta(),
            plan.count(OperationKind::Delete).to_string().red()
        );
        output
    }

    /// Formats a graph in topological order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<serde_json::Value> = graph
                    .topological_order()
                    .iter()
                    .filter_map(|&idx| graph.node(idx))
                    .map(|node| {
                        serde_json::json!({
                            "id": node.declaration.id.key(),
                            "depends_on": node
                                .dependencies
                                .iter()
                                .filter_map(|&d| graph.node(d))
                                .map(|d| d.declaration.name().to_string())
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&nodes).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("\nResources in dependency order ({}):\n\n", graph.len());
                for (position, &idx) in graph.topological_order().iter().enumerate() {
                    let Some(node) = graph.node(idx) else {
                        continue;
                    };
                    let deps: Vec<&str> = node
                        .dependencies
                        .iter()
                        .filter_map(|&d| graph.node(d))
                        .map(|d| d.declaration.name())
                        .collect();
                    let _ = write!(output, "  {:>3}. {}", position + 1, node.declaration.id);
                    if !deps.is_empty() {
                        let _ = write!(output, " {} {}", "<-".dimmed(), deps.join(", "));
                    }
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                for error in &result.errors {
                    let _ = writeln!(output, "{} {error}", "✗".red());
                }
                if show_warnings {
                    for warning in &result.warnings {
                        let _ = writeln!(output, "{} {warning}", "⚠".yellow());
                    }
                }
                if result.is_valid() {
                    let _ = writeln!(
                        output,
                        "{} Stack is valid ({} warnings)",
                        "✓".green(),
                        result.warning_count()
                    );
                }
                output
            }
        }
    }

    /// Formats an apply or destroy result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} {} successful", "✓".green(), result.operation)
                } else if result.cancelled {
                    format!("{} {} cancelled", "⚠".yellow(), result.operation)
                } else if result.timed_out {
                    format!("{} {} timed out", "⚠".yellow(), result.operation)
                } else {
                    format!("{} {} incomplete", "✗".red(), result.operation)
                };

                let mut output = format!("\n{status} ({} ms)\n\n", result.duration_ms);

                let rows: Vec<ResultRow> = result
                    .results
                    .iter()
                    .filter(|r| r.kind.is_change() || r.error.is_some())
                    .map(|r| ResultRow {
                        resource: r.id.to_string(),
                        action: Self::format_kind(r.kind),
                        status: r.status.to_string(),
                        attempts: r.attempts,
                        detail: Self::truncate(
                            r.error.as_deref().or(r.warning.as_deref()).unwrap_or(""),
                            60,
                        ),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = writeln!(output, "\n{}", result.counts);

                if !result.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for (name, value) in &result.outputs {
                        let _ = writeln!(output, "   {name} = {value}");
                    }
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!(
                        "{} No drift detected - {} resources match recorded state.\n",
                        "✓".green(),
                        report.checked
                    )
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted {
                        if resource.missing {
                            let _ = writeln!(output, "   - {} {}", resource.id, "(missing)".red());
                        } else {
                            let _ = writeln!(
                                output,
                                "   - {} (changed: {})",
                                resource.id,
                                resource.changed_outputs.join(", ")
                            );
                        }
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted.len(),
                        report.checked
                    );
                    output
                }
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} {report}\n", "✓".green());
                for id in &report.removed {
                    let _ = writeln!(output, "   - {id} no longer exists");
                }
                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "state": snapshot,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    snapshot.stack, snapshot.environment
                );
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}", snapshot.resources.len());
                if !snapshot.pending_deletes.is_empty() {
                    let _ = writeln!(
                        output,
                        "   Pending deletes: {}",
                        snapshot.pending_deletes.len().to_string().yellow()
                    );
                }
                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Lock: held by {} ({}s remaining)",
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    None => {
                        let _ = writeln!(output, "   Lock: none");
                    }
                }

                if !snapshot.resources.is_empty() {
                    let rows: Vec<ResourceRow> = snapshot
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            resource: r.id.to_string(),
                            provider_id: Self::truncate(&r.provider_id, 40),
                            hash: short(&r.input_hash).to_string(),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.outputs.is_empty() {
                    output.push_str("\n   Outputs:\n");
                    for (name, value) in &snapshot.outputs {
                        let _ = writeln!(output, "     {name} = {value}");
                    }
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.counts
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a progress event as a single line.
    #[must_use]
    pub fn format_event(&self, event: &ProgressEvent) -> String {
        match event {
            ProgressEvent::Started { id, kind } => {
                format!("{} {id}", Self::format_kind(*kind))
            }
            ProgressEvent::Retrying { id, attempt } => {
                format!("{} {id} (attempt {attempt})", "retry".yellow())
            }
            ProgressEvent::Finished { id, kind, lifecycle } => {
                format!("{} {id}: {kind} -> {lifecycle}", "✓".green())
            }
            ProgressEvent::Failed { id, error } => format!("{} {id}: {error}", "✗".red()),
            ProgressEvent::Skipped { id, reason } => {
                format!("{} {id}: skipped ({reason})", "-".dimmed())
            }
            ProgressEvent::Cancelled { id } => format!("{} {id}: cancelled", "-".dimmed()),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => text.to_string(),
        }
    }

    /// Formats an operation kind with color.
    fn format_kind(kind: OperationKind) -> String {
        let label = format!("{}{kind}", kind.symbol().trim());
        match kind {
            OperationKind::Create => label.green().to_string(),
            OperationKind::Update => label.yellow().to_string(),
            OperationKind::Replace => label.magenta().to_string(),
            OperationKind::Delete => label.red().to_string(),
            OperationKind::NoOp => label.dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
