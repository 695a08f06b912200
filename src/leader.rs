//! Lease-based leader election.
//!
//! At most one operator process reconciles at a time. The leader holds a
//! coordination/v1 Lease and renews it at a third of the lease duration;
//! standbys poll until the lease expires or is released. Losing the lease
//! is fatal: the process exits and the orchestrator restarts it.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;

use crate::error::{OperatorError, OperatorResult};

/// Name of the operator's lease object.
pub const LEASE_NAME: &str = "devserver-operator";

/// How long a held lease stays valid without renewal.
const LEASE_DURATION: Duration = Duration::from_secs(15);

/// Consecutive renewal failures tolerated before giving up leadership.
const RENEW_FAILURE_BUDGET: u32 = 3;

/// Manages acquisition and renewal of the operator lease.
pub struct LeaseManager {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaseManager {
    /// Create a lease manager for this process.
    pub fn new(client: Client, namespace: String) -> Self {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("devserver-operator-{}", std::process::id()));
        Self {
            client,
            namespace,
            identity,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until this process holds the lease.
    pub async fn acquire(&self) -> OperatorResult<()> {
        let poll = LEASE_DURATION / 3;
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    tracing::info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::debug!(identity = %self.identity, "Standing by for leader lease");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Error while acquiring leader lease");
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Renew the lease until renewal fails persistently. Returning an
    /// error means leadership is lost.
    pub async fn run(self) -> OperatorResult<()> {
        let interval = LEASE_DURATION / 3;
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            match self.try_acquire().await {
                Ok(true) => failures = 0,
                Ok(false) => {
                    return Err(OperatorError::LeaseError(format!(
                        "lease is no longer held by {}",
                        self.identity
                    )));
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(error = %err, failures, "Lease renewal failed");
                    if failures >= RENEW_FAILURE_BUDGET {
                        return Err(OperatorError::LeaseError(format!(
                            "lease renewal failed {failures} times: {err}"
                        )));
                    }
                }
            }
        }
    }

    /// Take or renew the lease. Returns false when another live holder
    /// owns it.
    async fn try_acquire(&self) -> OperatorResult<bool> {
        let api = self.api();
        let now = MicroTime(Utc::now());

        let Some(lease) = api.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Someone else created it first.
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());

        if held_by_us {
            let patch = serde_json::json!({"spec": {"renewTime": now}});
            api.patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            return Ok(true);
        }

        if !lease_expired(&spec, Utc::now()) {
            return Ok(false);
        }

        // Expired: take over and bump the transition counter.
        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "acquireTime": now,
                "renewTime": now,
                "leaseTransitions": transitions,
            }
        });
        api.patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!(
            identity = %self.identity,
            previous = spec.holder_identity.as_deref().unwrap_or("<none>"),
            "Took over expired leader lease"
        );
        Ok(true)
    }
}

/// A lease is expired when its last renewal plus its duration is in the
/// past. A lease without a renewal timestamp counts as expired.
fn lease_expired(spec: &LeaseSpec, now: chrono::DateTime<Utc>) -> bool {
    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION.as_secs() as i32) as i64;
    match spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) {
        Some(renewed) => renewed.0 + chrono::Duration::seconds(duration) < now,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!lease_expired(&spec(5), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(&spec(30), Utc::now()));
    }

    #[test]
    fn lease_without_timestamps_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            ..Default::default()
        };
        assert!(lease_expired(&spec, Utc::now()));
    }

    #[test]
    fn acquire_time_is_used_when_never_renewed() {
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(15),
            acquire_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(3))),
            ..Default::default()
        };
        assert!(!lease_expired(&spec, Utc::now()));
    }
}
