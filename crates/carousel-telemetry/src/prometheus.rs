//! Prometheus text exposition format.
//!
//! Renders the telemetry snapshot and the current status view for
//! scraping by a Prometheus server or compatible agent.

use carousel_core::{HealthStatus, InstanceRole, StatusView, TelemetrySnapshot};

const ROLES: [(InstanceRole, &str); 4] = [
    (InstanceRole::Active, "active"),
    (InstanceRole::Standby, "standby"),
    (InstanceRole::Transitioning, "transitioning"),
    (InstanceRole::Quarantined, "quarantined"),
];

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

/// Render rotation metrics and per-instance gauges.
pub fn render_prometheus(snapshot: &TelemetrySnapshot, status: &StatusView) -> String {
    let mut out = String::new();

    header(&mut out, "carousel_rotations_total", "Rotation cycles within the retention window.", "gauge");
    out.push_str(&format!("carousel_rotations_total {}\n", snapshot.total_rotations));

    header(&mut out, "carousel_rotations_failed", "Rotation cycles that did not succeed.", "gauge");
    out.push_str(&format!("carousel_rotations_failed {}\n", snapshot.failed_rotations));

    header(&mut out, "carousel_rotations_rolled_back", "Rotation cycles that were rolled back.", "gauge");
    out.push_str(&format!(
        "carousel_rotations_rolled_back {}\n",
        snapshot.rolled_back_rotations
    ));

    header(&mut out, "carousel_rotation_duration_mean_ms", "Mean rotation duration in milliseconds.", "gauge");
    out.push_str(&format!(
        "carousel_rotation_duration_mean_ms {:.2}\n",
        snapshot.mean_duration_ms
    ));

    header(&mut out, "carousel_uptime_percent", "Share of the window with the serving floor met.", "gauge");
    out.push_str(&format!("carousel_uptime_percent {:.4}\n", snapshot.uptime_percent));

    header(&mut out, "carousel_serving_instances", "Instances that are Active and Healthy.", "gauge");
    out.push_str(&format!("carousel_serving_instances {}\n", status.serving));

    header(&mut out, "carousel_min_healthy", "Configured serving floor.", "gauge");
    out.push_str(&format!("carousel_min_healthy {}\n", status.min_healthy));

    header(&mut out, "carousel_runtime_paused", "1 while the container runtime is unreachable.", "gauge");
    out.push_str(&format!("carousel_runtime_paused {}\n", u8::from(status.runtime_paused)));

    header(&mut out, "carousel_instance_role", "1 for the instance's current role.", "gauge");
    for inst in &status.instances {
        for (role, label) in ROLES {
            out.push_str(&format!(
                "carousel_instance_role{{instance=\"{}\",role=\"{label}\"}} {}\n",
                inst.name,
                u8::from(inst.role == role)
            ));
        }
    }

    header(&mut out, "carousel_instance_healthy", "1 if the instance is Healthy.", "gauge");
    for inst in &status.instances {
        out.push_str(&format!(
            "carousel_instance_healthy{{instance=\"{}\"}} {}\n",
            inst.name,
            u8::from(inst.health == HealthStatus::Healthy)
        ));
    }

    header(&mut out, "carousel_instance_rotation_failures", "Candidate start or verify failures.", "gauge");
    for inst in &status.instances {
        out.push_str(&format!(
            "carousel_instance_rotation_failures{{instance=\"{}\"}} {}\n",
            inst.name, inst.rotation_failures
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use carousel_core::Instance;

    use super::*;

    fn status() -> StatusView {
        let mut web1 = Instance::new("web1", "web1:8080", 0);
        web1.role = InstanceRole::Active;
        web1.health = HealthStatus::Healthy;
        let web2 = Instance::new("web2", "web2:8080", 0);
        StatusView {
            instances: vec![web1, web2],
            current_plan: None,
            last_plan: None,
            min_healthy: 1,
            active_target: 1,
            serving: 1,
            interval_min_ms: 60_000,
            interval_max_ms: 300_000,
            runtime_paused: false,
            alerts: Vec::new(),
            updated_at: 0,
        }
    }

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            window_start: 0,
            uptime_percent: 99.5,
            total_rotations: 12,
            failed_rotations: 2,
            rolled_back_rotations: 1,
            mean_duration_ms: 1234.5,
            cached_at: 0,
        }
    }

    #[test]
    fn renders_rotation_counters() {
        let text = render_prometheus(&snapshot(), &status());
        assert!(text.contains("# TYPE carousel_rotations_total gauge\n"));
        assert!(text.contains("carousel_rotations_total 12\n"));
        assert!(text.contains("carousel_rotations_failed 2\n"));
        assert!(text.contains("carousel_rotation_duration_mean_ms 1234.50\n"));
        assert!(text.contains("carousel_uptime_percent 99.5000\n"));
        assert!(text.contains("carousel_serving_instances 1\n"));
    }

    #[test]
    fn renders_instance_gauges() {
        let text = render_prometheus(&snapshot(), &status());
        assert!(text.contains("carousel_instance_role{instance=\"web1\",role=\"active\"} 1\n"));
        assert!(text.contains("carousel_instance_role{instance=\"web1\",role=\"standby\"} 0\n"));
        assert!(text.contains("carousel_instance_role{instance=\"web2\",role=\"standby\"} 1\n"));
        assert!(text.contains("carousel_instance_healthy{instance=\"web2\"} 0\n"));
    }
}
