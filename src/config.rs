//! Operator process configuration.

use std::time::Duration;

use clap::Parser;

use crate::duration::parse_duration;

/// Command-line and environment configuration for the operator process.
#[derive(Debug, Clone, Parser)]
#[command(name = "devserver-operator", author, version, about)]
pub struct OperatorConfig {
    /// Maximum number of concurrent reconciles per controller.
    #[arg(long, env = "DEVSERVER_WORKER_COUNT", default_value_t = 4)]
    pub worker_count: u16,

    /// Deadline for a single reconcile, e.g. "2m".
    #[arg(long, env = "DEVSERVER_RECONCILE_DEADLINE", default_value = "2m", value_parser = duration_arg)]
    pub reconcile_deadline: Duration,

    /// Steady-state requeue for user and flavor reconciles, e.g. "10m".
    #[arg(long, env = "DEVSERVER_RESYNC_PERIOD", default_value = "10m", value_parser = duration_arg)]
    pub resync_period: Duration,

    /// Upper bound on the DevServer requeue interval, e.g. "30m".
    #[arg(long, env = "DEVSERVER_DEFAULT_REQUEUE", default_value = "30m", value_parser = duration_arg)]
    pub default_requeue: Duration,

    /// Take a coordination lease before reconciling; standby otherwise.
    #[arg(long, env = "DEVSERVER_LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub leader_election: bool,

    /// Restrict DevServer watches to one namespace; empty for cluster-wide.
    #[arg(long, env = "DEVSERVER_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Print the CRD schemas as YAML and exit.
    #[arg(long)]
    pub generate_crds: bool,
}

fn duration_arg(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            reconcile_deadline: Duration::from_secs(120),
            resync_period: Duration::from_secs(600),
            default_requeue: Duration::from_secs(1800),
            leader_election: true,
            watch_namespace: None,
            generate_crds: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = OperatorConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.reconcile_deadline, Duration::from_secs(120));
        assert_eq!(config.resync_period, Duration::from_secs(600));
        assert_eq!(config.default_requeue, Duration::from_secs(1800));
        assert!(config.leader_election);
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn flags_parse_durations() {
        let config = OperatorConfig::parse_from([
            "devserver-operator",
            "--worker-count",
            "8",
            "--reconcile-deadline",
            "90s",
            "--default-requeue",
            "15m",
            "--leader-election",
            "false",
            "--watch-namespace",
            "dev-alice",
        ]);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.reconcile_deadline, Duration::from_secs(90));
        assert_eq!(config.default_requeue, Duration::from_secs(900));
        assert!(!config.leader_election);
        assert_eq!(config.watch_namespace.as_deref(), Some("dev-alice"));
    }

    #[test]
    fn malformed_durations_are_rejected() {
        let result = OperatorConfig::try_parse_from([
            "devserver-operator",
            "--reconcile-deadline",
            "2.5m",
        ]);
        assert!(result.is_err());
    }
}
