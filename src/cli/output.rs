//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! plans, run reports, drift and status in text or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{ActionType, DeploymentPlan, DiffDetail, NodeOutcome};
use crate::reconciler::{DriftReport, RunOutcome, RunReport, StatusReport};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "ID")]
    id: String,
}

/// Live resource row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Declared")]
    declared: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &DeploymentPlan, detailed: bool) -> String {
        if plan.is_converged() {
            return format!("{} No changes required - infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan ({})", plan.mode);
        let _ = writeln!(output, "   Config hash: {}\n", short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type != ActionType::Noop)
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.key.to_string(),
                after: a
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: a.blocked.as_ref().map_or_else(
                    || Self::truncate(&a.reason, 48),
                    |e| format!("{} {}", "blocked:".red(), Self::truncate(&e.to_string(), 40)),
                ),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.details.is_empty()) {
                let _ = writeln!(output, "\n  {}", action.key);
                Self::write_details(&mut output, &action.details);
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red()
        );

        if !plan.passes_guardrails {
            let _ = write!(output, "\n{} Guardrail violations:\n", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats the result of an executed run.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let headline = match report.outcome {
                    RunOutcome::Success => format!("{} Run succeeded", "✓".green()),
                    RunOutcome::PartialFailure => format!("{} Run partially failed", "⚠".yellow()),
                    RunOutcome::TotalFailure => format!("{} Run failed", "✗".red()),
                    RunOutcome::Cancelled => format!("{} Run cancelled", "⚠".yellow()),
                };
                let mut output = format!("{headline} ({}, run {})\n\n", report.mode, short(&report.run_id));

                let rows: Vec<ResultRow> = report
                    .execution
                    .results
                    .iter()
                    .filter(|r| r.action_type != ActionType::Noop)
                    .map(|r| ResultRow {
                        action: Self::format_action_type(r.action_type),
                        resource: r.key.to_string(),
                        outcome: Self::format_outcome(&r.outcome),
                        attempts: r.attempts,
                        id: r.remote_id.clone().unwrap_or_default(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let execution = &report.execution;
                let _ = write!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped, {} cancelled\n",
                    execution.successful, execution.failed, execution.skipped, execution.cancelled
                );
                if let Some(root) = &execution.root_failure {
                    let _ = writeln!(output, "Root failure: {}", root.to_string().red());
                }
                for (kind, error) in &report.unavailable {
                    let _ = writeln!(output, "{} {kind} could not be listed: {error}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in &report.entries {
                    let _ = writeln!(output, "   - {} ({})", entry.key, entry.status);
                    Self::write_details(&mut output, &entry.details);
                }
                let _ = write!(
                    output,
                    "\n{} drifted ({} declared, {} live).\n",
                    report.entries.len(),
                    report.declared,
                    report.live
                );
                for kind in &report.unavailable {
                    let _ = writeln!(output, "{} {kind} could not be listed", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats the owned resource inventory.
    #[must_use]
    pub fn format_status(&self, status: &StatusReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(status),
            OutputFormat::Text => {
                let mut output = format!("\nEnvironment: {}\n\n", status.environment);
                if status.resources.is_empty() {
                    output.push_str("   No resources found.\n");
                } else {
                    let rows: Vec<StatusRow> = status
                        .resources
                        .iter()
                        .map(|r| StatusRow {
                            kind: r.key.kind.to_string(),
                            name: r.key.name.clone(),
                            id: r.remote_id.clone(),
                            declared: if r.declared {
                                "yes".green().to_string()
                            } else {
                                "no".yellow().to_string()
                            },
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                for (kind, ids) in &status.untracked {
                    let _ = writeln!(output, "\nUntracked {kind}: {}", ids.join(", "));
                }
                for kind in &status.unavailable {
                    let _ = writeln!(output, "{} {kind} could not be listed", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, resources: usize, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "resources": resources,
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid ({resources} resources).\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                output
            }
        }
    }

    fn write_details(output: &mut String, details: &[DiffDetail]) {
        for detail in details {
            let marker = if detail.mutable {
                String::new()
            } else {
                format!(" {}", "(immutable)".red())
            };
            let _ = writeln!(
                output,
                "      {}: {} -> {}{marker}",
                detail.field,
                detail.old_value.as_deref().unwrap_or("-"),
                detail.new_value.as_deref().unwrap_or("-")
            );
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::Noop => "noop".dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: &NodeOutcome) -> String {
        match outcome {
            NodeOutcome::Succeeded => "ok".green().to_string(),
            NodeOutcome::Failed { error } => format!("{} {}", "failed:".red(), Self::truncate(error, 40)),
            NodeOutcome::Skipped { cause } => format!("{} {cause}", "skipped:".yellow()),
            NodeOutcome::Cancelled => "cancelled".dimmed().to_string(),
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

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    mode: String,
    config_hash: String,
    converged: bool,
    creates: usize,
    updates: usize,
    deletes: usize,
    passes_guardrails: bool,
    guardrail_violations: Vec<String>,
    actions: Vec<ActionJson>,
}

#[derive(Serialize)]
struct ActionJson {
    index: usize,
    action_type: ActionType,
    resource: String,
    remote_id: Option<String>,
    reason: String,
    dependencies: Vec<usize>,
    details: Vec<DiffDetail>,
    blocked: Option<String>,
}

impl From<&DeploymentPlan> for PlanJson {
    fn from(plan: &DeploymentPlan) -> Self {
        Self {
            mode: plan.mode.to_string(),
            config_hash: plan.config_hash.clone(),
            converged: plan.is_converged(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            deletes: plan.delete_count(),
            passes_guardrails: plan.passes_guardrails,
            guardrail_violations: plan.guardrail_violations.clone(),
            actions: plan
                .actions
                .iter()
                .enumerate()
                .map(|(index, a)| ActionJson {
                    index,
                    action_type: a.action_type,
                    resource: a.key.to_string(),
                    remote_id: a.remote_id.clone(),
                    reason: a.reason.clone(),
                    dependencies: a.dependencies.clone(),
                    details: a.details.clone(),
                    blocked: a.blocked.as_ref().map(ToString::to_string),
                })
                .collect(),
        }
    }
}
