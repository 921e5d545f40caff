//! Subcommand implementations and text rendering.

use std::fmt::Write;

use carousel_core::{
    HealthStatus, InstanceRole, PlanOutcome, RotationPlan, StatusView, TelemetrySnapshot,
};
use serde::de::DeserializeOwned;

use crate::Format;
use crate::client::ApiClient;

/// Fetch `path`, print JSON as-is or the typed value through `render`.
async fn show<T, F>(client: &ApiClient, format: Format, path: &str, render: F) -> anyhow::Result<()>
where
    T: DeserializeOwned,
    F: FnOnce(&T) -> String,
{
    match format {
        Format::Json => {
            let value: serde_json::Value = client.get(path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Format::Text => {
            let value: T = client.get(path).await?;
            print!("{}", render(&value));
        }
    }
    Ok(())
}

pub async fn status(client: &ApiClient, format: Format) -> anyhow::Result<()> {
    show(client, format, "/api/v1/status", render_status).await
}

pub async fn telemetry(client: &ApiClient, format: Format) -> anyhow::Result<()> {
    show(client, format, "/api/v1/telemetry", render_telemetry).await
}

pub async fn history(client: &ApiClient, format: Format, limit: usize) -> anyhow::Result<()> {
    let path = format!("/api/v1/history?limit={limit}");
    show(client, format, &path, |plans: &Vec<RotationPlan>| render_history(plans)).await
}

pub async fn rotate(client: &ApiClient, format: Format) -> anyhow::Result<()> {
    let value: serde_json::Value = client.post("/api/v1/rotate").await?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        Format::Text => println!("✓ Rotation accepted (plan {})", value["plan_id"]),
    }
    Ok(())
}

pub async fn unquarantine(client: &ApiClient, format: Format, name: &str) -> anyhow::Result<()> {
    let value: serde_json::Value = client
        .post(&format!("/api/v1/instances/{name}/unquarantine"))
        .await?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        Format::Text => println!("✓ {name} returned to standby"),
    }
    Ok(())
}

fn role_label(role: InstanceRole) -> &'static str {
    match role {
        InstanceRole::Active => "active",
        InstanceRole::Standby => "standby",
        InstanceRole::Transitioning => "transitioning",
        InstanceRole::Quarantined => "quarantined",
    }
}

fn health_label(health: HealthStatus) -> &'static str {
    match health {
        HealthStatus::Unknown => "unknown",
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
    }
}

fn outcome_label(plan: &RotationPlan) -> &'static str {
    match plan.outcome {
        Some(PlanOutcome::Success) => "success",
        Some(PlanOutcome::RolledBack) => "rolled_back",
        Some(PlanOutcome::Failed) => "failed",
        None => "in_flight",
    }
}

fn plan_line(plan: &RotationPlan) -> String {
    let mut line = format!(
        "#{:<5} {:<9} {:<11} {:>7}ms  {} -> {}",
        plan.id,
        format!("{:?}", plan.trigger).to_lowercase(),
        outcome_label(plan),
        plan.duration_ms().unwrap_or(0),
        plan.retiring.as_deref().unwrap_or("-"),
        plan.candidate.as_deref().unwrap_or("-"),
    );
    if let Some(reason) = plan.reason {
        let _ = write!(line, "  ({reason})");
    }
    line
}

pub fn render_status(status: &StatusView) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "serving {}/{} (floor {}), interval {}s..{}s{}",
        status.serving,
        status.active_target,
        status.min_healthy,
        status.interval_min_ms / 1000,
        status.interval_max_ms / 1000,
        if status.runtime_paused { ", PAUSED: runtime unreachable" } else { "" },
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "{:<16} {:<14} {:<10} {:>8}  ADDRESS", "INSTANCE", "ROLE", "HEALTH", "FAILURES");
    for inst in &status.instances {
        let _ = writeln!(
            out,
            "{:<16} {:<14} {:<10} {:>8}  {}",
            inst.name,
            role_label(inst.role),
            health_label(inst.health),
            inst.rotation_failures,
            inst.address,
        );
    }

    if let Some(plan) = &status.current_plan {
        let _ = writeln!(out, "\nin flight: plan #{} at {:?}", plan.id, plan.phase);
    }
    if let Some(plan) = &status.last_plan {
        let _ = writeln!(out, "\nlast: {}", plan_line(plan));
    }
    if !status.alerts.is_empty() {
        let _ = writeln!(out, "\nalerts:");
        for alert in &status.alerts {
            let _ = writeln!(out, "  ! {}", alert.message);
        }
    }
    out
}

pub fn render_telemetry(snapshot: &TelemetrySnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "uptime          {:.2}%", snapshot.uptime_percent);
    let _ = writeln!(out, "rotations       {}", snapshot.total_rotations);
    let _ = writeln!(out, "failed          {}", snapshot.failed_rotations);
    let _ = writeln!(out, "rolled back     {}", snapshot.rolled_back_rotations);
    let _ = writeln!(out, "mean duration   {:.0}ms", snapshot.mean_duration_ms);
    out
}

pub fn render_history(plans: &[RotationPlan]) -> String {
    if plans.is_empty() {
        return "no rotations recorded\n".to_string();
    }
    plans.iter().map(|p| plan_line(p) + "\n").collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use carousel_core::{Alert, FailureReason, Instance, Trigger};

    use super::*;

    fn plan(id: u64, outcome: PlanOutcome, reason: Option<FailureReason>) -> RotationPlan {
        let from: BTreeSet<String> = ["web1".to_string()].into();
        let mut plan = RotationPlan::begin(id, Trigger::Manual, from, 1_000);
        plan.candidate = Some("web2".to_string());
        plan.retiring = Some("web1".to_string());
        plan.finish(outcome, reason, None, 1_250);
        plan
    }

    #[test]
    fn status_table_lists_instances() {
        let mut web1 = Instance::new("web1", "web1:8080", 0);
        web1.role = InstanceRole::Active;
        web1.health = HealthStatus::Healthy;
        let mut web2 = Instance::new("web2", "web2:8080", 0);
        web2.role = InstanceRole::Quarantined;
        web2.rotation_failures = 3;

        let status = StatusView {
            instances: vec![web1, web2],
            current_plan: None,
            last_plan: Some(plan(4, PlanOutcome::Success, None)),
            min_healthy: 1,
            active_target: 1,
            serving: 1,
            interval_min_ms: 60_000,
            interval_max_ms: 300_000,
            runtime_paused: true,
            alerts: vec![Alert {
                at: 0,
                plan_id: Some(3),
                reason: Some(FailureReason::ProxyReloadFailure),
                message: "reload failed".to_string(),
            }],
            updated_at: 0,
        };

        let text = render_status(&status);
        assert!(text.starts_with("serving 1/1 (floor 1), interval 60s..300s, PAUSED"));
        assert!(text.contains("web1             active         healthy"));
        assert!(text.contains("web2             quarantined    unknown           3"));
        assert!(text.contains("last: #4"));
        assert!(text.contains("! reload failed"));
    }

    #[test]
    fn history_lines_show_reason() {
        let text = render_history(&[
            plan(2, PlanOutcome::RolledBack, Some(FailureReason::HealthCheckTimeout)),
            plan(1, PlanOutcome::Success, None),
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("#2"));
        assert!(lines[0].contains("rolled_back"));
        assert!(lines[0].ends_with("(health_check_timeout)"));
        assert!(lines[1].contains("250ms  web1 -> web2"));
    }

    #[test]
    fn empty_history() {
        assert_eq!(render_history(&[]), "no rotations recorded\n");
    }

    #[test]
    fn telemetry_summary() {
        let snapshot = TelemetrySnapshot {
            window_start: 0,
            uptime_percent: 99.5,
            total_rotations: 10,
            failed_rotations: 2,
            rolled_back_rotations: 1,
            mean_duration_ms: 1234.4,
            cached_at: 0,
        };
        let text = render_telemetry(&snapshot);
        assert!(text.contains("uptime          99.50%"));
        assert!(text.contains("mean duration   1234ms"));
    }
}
