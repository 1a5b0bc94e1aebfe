//! Lease registry: tenant/run-scoped admission for the simulator backend.
//!
//! Purely in-memory. A single mutex serializes all operations; every one
//! of them is O(1) over small maps. Expiry is lazy: expired leases are
//! swept at the start of whichever operation touches the registry next.

use agent_device_config::LeaseSettings;
use agent_device_protocol::DaemonError;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::util;

/// The only backend leases exist for today.
pub const SIMULATOR_BACKEND: &str = "ios-simulator";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub lease_id: String,
    pub tenant_id: String,
    pub run_id: String,
    pub backend: String,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub heartbeat_at: u64,
    pub expires_at: u64,
}

#[derive(Default)]
struct LeaseState {
    leases: HashMap<String, Lease>,
    /// `(tenant, run, backend)` → active lease id. Guarantees allocation
    /// idempotence per run.
    bindings: HashMap<(String, String, String), String>,
}

pub struct LeaseRegistry {
    settings: LeaseSettings,
    inner: Mutex<LeaseState>,
}

/// Tenant and run ids: `[A-Za-z0-9._-]{1,128}`.
pub fn valid_scope_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Lease ids: 16–128 hex characters.
pub fn valid_lease_id(value: &str) -> bool {
    (16..=128).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn lease_not_found() -> DaemonError {
    DaemonError::unauthorized("lease not found or expired")
        .with_details(json!({"reason": "LEASE_NOT_FOUND"}))
}

fn lease_scope_mismatch() -> DaemonError {
    DaemonError::unauthorized("lease does not belong to the supplied tenant/run scope")
        .with_details(json!({"reason": "LEASE_SCOPE_MISMATCH"}))
}

impl LeaseRegistry {
    pub fn new(settings: LeaseSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(LeaseState::default()),
        }
    }

    fn clamp_ttl(&self, ttl_ms: Option<u64>) -> u64 {
        ttl_ms
            .unwrap_or(self.settings.default_ttl_ms)
            .clamp(self.settings.min_ttl_ms, self.settings.max_ttl_ms)
    }

    fn sweep(state: &mut LeaseState, now: u64) {
        let expired: Vec<String> = state
            .leases
            .values()
            .filter(|lease| now >= lease.expires_at)
            .map(|lease| lease.lease_id.clone())
            .collect();
        for id in expired {
            if let Some(lease) = state.leases.remove(&id) {
                state
                    .bindings
                    .remove(&(lease.tenant_id, lease.run_id, lease.backend));
            }
        }
    }

    /// Allocate (or refresh) the lease for `(tenant, run, backend)`.
    pub fn allocate(
        &self,
        tenant_id: &str,
        run_id: &str,
        backend: Option<&str>,
        ttl_ms: Option<u64>,
    ) -> Result<Lease, DaemonError> {
        if !valid_scope_id(tenant_id) {
            return Err(DaemonError::invalid_args(format!(
                "invalid tenant id `{tenant_id}` (expected [A-Za-z0-9._-]{{1,128}})"
            )));
        }
        if !valid_scope_id(run_id) {
            return Err(DaemonError::invalid_args(format!(
                "invalid run id `{run_id}` (expected [A-Za-z0-9._-]{{1,128}})"
            )));
        }
        let backend = backend.unwrap_or(SIMULATOR_BACKEND);
        if backend != SIMULATOR_BACKEND {
            return Err(DaemonError::invalid_args(format!(
                "unsupported lease backend `{backend}`"
            )));
        }

        let now = util::current_timestamp_ms();
        let ttl = self.clamp_ttl(ttl_ms);
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, now);

        let binding_key = (
            tenant_id.to_string(),
            run_id.to_string(),
            backend.to_string(),
        );
        if let Some(existing_id) = state.bindings.get(&binding_key).cloned() {
            if let Some(lease) = state.leases.get_mut(&existing_id) {
                lease.heartbeat_at = now;
                lease.expires_at = now + ttl;
                return Ok(lease.clone());
            }
        }

        if let Some(cap) = self.settings.max_simulator_leases {
            let active = state.leases.values().filter(|l| l.backend == backend).count();
            if active >= cap {
                return Err(DaemonError::command_failed(format!(
                    "simulator lease capacity reached ({cap} active)"
                ))
                .with_hint("Release an existing lease or raise AGENT_DEVICE_MAX_SIMULATOR_LEASES."));
            }
        }

        let lease = Lease {
            lease_id: util::random_hex(16),
            tenant_id: tenant_id.to_string(),
            run_id: run_id.to_string(),
            backend: backend.to_string(),
            created_at: now,
            heartbeat_at: now,
            expires_at: now + ttl,
        };
        state
            .bindings
            .insert(binding_key, lease.lease_id.clone());
        state.leases.insert(lease.lease_id.clone(), lease.clone());
        Ok(lease)
    }

    /// Refresh a lease TTL. Optional scope parameters must match when
    /// supplied.
    pub fn heartbeat(
        &self,
        lease_id: &str,
        tenant_id: Option<&str>,
        run_id: Option<&str>,
        ttl_ms: Option<u64>,
    ) -> Result<Lease, DaemonError> {
        if !valid_lease_id(lease_id) {
            return Err(DaemonError::invalid_args("malformed lease id"));
        }
        let now = util::current_timestamp_ms();
        let ttl = self.clamp_ttl(ttl_ms);
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, now);

        let Some(lease) = state.leases.get(lease_id) else {
            return Err(lease_not_found());
        };
        if scope_mismatch(lease, tenant_id, run_id) {
            return Err(lease_scope_mismatch());
        }

        let lease = state.leases.get_mut(lease_id).expect("present above");
        lease.heartbeat_at = now;
        lease.expires_at = now + ttl;
        Ok(lease.clone())
    }

    /// Release a lease. Idempotent: releasing an unknown or expired lease
    /// reports `released: false`.
    pub fn release(
        &self,
        lease_id: &str,
        tenant_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Result<bool, DaemonError> {
        if !valid_lease_id(lease_id) {
            return Err(DaemonError::invalid_args("malformed lease id"));
        }
        let now = util::current_timestamp_ms();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, now);

        let Some(lease) = state.leases.get(lease_id) else {
            return Ok(false);
        };
        if scope_mismatch(lease, tenant_id, run_id) {
            return Err(lease_scope_mismatch());
        }

        let lease = state.leases.remove(lease_id).expect("present above");
        state
            .bindings
            .remove(&(lease.tenant_id, lease.run_id, lease.backend));
        Ok(true)
    }

    /// Admission gate for tenant-isolated commands other than the lease
    /// operations themselves: tenant, run, and lease id must all be
    /// present and must match an active lease on the backend.
    pub fn assert_admission(
        &self,
        tenant_id: Option<&str>,
        run_id: Option<&str>,
        lease_id: Option<&str>,
        backend: &str,
    ) -> Result<(), DaemonError> {
        let mut missing = Vec::new();
        if tenant_id.is_none() {
            missing.push("tenant");
        }
        if run_id.is_none() {
            missing.push("runId");
        }
        if lease_id.is_none() {
            missing.push("leaseId");
        }
        if !missing.is_empty() {
            return Err(DaemonError::invalid_args(format!(
                "tenant-isolated commands require {}",
                missing.join(", ")
            ))
            .with_details(json!({"missing": missing})));
        }
        let (tenant_id, run_id, lease_id) =
            (tenant_id.unwrap(), run_id.unwrap(), lease_id.unwrap());
        if !valid_lease_id(lease_id) {
            return Err(DaemonError::invalid_args("malformed lease id"));
        }

        let now = util::current_timestamp_ms();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, now);

        let Some(lease) = state.leases.get(lease_id) else {
            return Err(lease_not_found());
        };
        if lease.tenant_id != tenant_id || lease.run_id != run_id || lease.backend != backend {
            return Err(lease_scope_mismatch());
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        let now = util::current_timestamp_ms();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut state, now);
        state.leases.len()
    }
}

fn scope_mismatch(lease: &Lease, tenant_id: Option<&str>, run_id: Option<&str>) -> bool {
    if let Some(tenant) = tenant_id {
        if lease.tenant_id != tenant {
            return true;
        }
    }
    if let Some(run) = run_id {
        if lease.run_id != run {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_device_protocol::ErrorCode;

    fn registry() -> LeaseRegistry {
        LeaseRegistry::new(LeaseSettings::default())
    }

    fn fast_registry() -> LeaseRegistry {
        LeaseRegistry::new(LeaseSettings {
            default_ttl_ms: 40,
            min_ttl_ms: 10,
            max_ttl_ms: 200,
            max_simulator_leases: None,
        })
    }

    fn reason_of(err: &DaemonError) -> String {
        err.details.as_ref().unwrap()["reason"]
            .as_str()
            .unwrap()
            .to_string()
    }

    // ===== Validation Tests =====

    #[test]
    fn test_valid_scope_id() {
        assert!(valid_scope_id("acme"));
        assert!(valid_scope_id("run-1.2_b"));
        assert!(!valid_scope_id(""));
        assert!(!valid_scope_id("has space"));
        assert!(!valid_scope_id(&"x".repeat(129)));
    }

    #[test]
    fn test_valid_lease_id() {
        assert!(valid_lease_id(&"a".repeat(16)));
        assert!(valid_lease_id(&"0123456789abcdef".repeat(2)));
        assert!(!valid_lease_id("short"));
        assert!(!valid_lease_id(&"g".repeat(16)));
        assert!(!valid_lease_id(&"a".repeat(129)));
    }

    #[test]
    fn test_allocate_rejects_bad_ids() {
        let reg = registry();
        assert_eq!(
            reg.allocate("bad tenant", "run-1", None, None)
                .unwrap_err()
                .code,
            ErrorCode::InvalidArgs
        );
        assert_eq!(
            reg.allocate("acme", "bad run", None, None).unwrap_err().code,
            ErrorCode::InvalidArgs
        );
        assert_eq!(
            reg.allocate("acme", "run-1", Some("android"), None)
                .unwrap_err()
                .code,
            ErrorCode::InvalidArgs
        );
    }

    // ===== Allocation Tests =====

    #[test]
    fn test_allocate_mints_valid_lease() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, Some(60_000)).unwrap();
        assert!(valid_lease_id(&lease.lease_id));
        assert_eq!(lease.tenant_id, "acme");
        assert_eq!(lease.run_id, "run-1");
        assert_eq!(lease.backend, SIMULATOR_BACKEND);
        assert!(lease.expires_at > lease.created_at);
    }

    #[test]
    fn test_allocate_is_idempotent_per_run() {
        let reg = registry();
        let first = reg.allocate("acme", "run-1", None, None).unwrap();
        let second = reg.allocate("acme", "run-1", None, None).unwrap();
        assert_eq!(first.lease_id, second.lease_id);
        assert_eq!(reg.active_count(), 1);

        let other = reg.allocate("acme", "run-2", None, None).unwrap();
        assert_ne!(first.lease_id, other.lease_id);
        assert_eq!(reg.active_count(), 2);
    }

    #[test]
    fn test_allocate_refresh_extends_expiry() {
        let reg = registry();
        let first = reg.allocate("acme", "run-1", None, Some(5_000)).unwrap();
        let second = reg.allocate("acme", "run-1", None, Some(600_000)).unwrap();
        assert_eq!(first.lease_id, second.lease_id);
        assert!(second.expires_at >= first.expires_at);
    }

    #[test]
    fn test_ttl_clamped_to_bounds() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, Some(1)).unwrap();
        // min clamp 5s
        assert!(lease.expires_at - lease.created_at >= 5_000);

        let lease = reg
            .allocate("acme", "run-2", None, Some(10_000_000))
            .unwrap();
        // max clamp 600s
        assert!(lease.expires_at - lease.created_at <= 600_000);
    }

    #[test]
    fn test_capacity_cap() {
        let reg = LeaseRegistry::new(LeaseSettings {
            max_simulator_leases: Some(2),
            ..LeaseSettings::default()
        });
        reg.allocate("acme", "run-1", None, None).unwrap();
        reg.allocate("acme", "run-2", None, None).unwrap();
        let err = reg.allocate("acme", "run-3", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);

        // Refreshing an existing binding is not a new allocation.
        assert!(reg.allocate("acme", "run-1", None, None).is_ok());
    }

    // ===== Heartbeat Tests =====

    #[test]
    fn test_heartbeat_refreshes() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        let refreshed = reg
            .heartbeat(&lease.lease_id, Some("acme"), Some("run-1"), Some(60_000))
            .unwrap();
        assert_eq!(refreshed.lease_id, lease.lease_id);
        assert!(refreshed.heartbeat_at >= lease.heartbeat_at);
    }

    #[test]
    fn test_heartbeat_unknown_lease() {
        let reg = registry();
        let err = reg.heartbeat(&"a".repeat(32), None, None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(reason_of(&err), "LEASE_NOT_FOUND");
    }

    #[test]
    fn test_heartbeat_scope_mismatch_does_not_mutate() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();

        let err = reg
            .heartbeat(&lease.lease_id, Some("other"), None, Some(600_000))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(reason_of(&err), "LEASE_SCOPE_MISMATCH");

        // Expiry unchanged by the rejected heartbeat.
        let current = reg
            .heartbeat(&lease.lease_id, Some("acme"), Some("run-1"), None)
            .unwrap();
        assert_eq!(current.lease_id, lease.lease_id);
    }

    #[test]
    fn test_heartbeat_malformed_id() {
        let reg = registry();
        let err = reg.heartbeat("zz", None, None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
    }

    // ===== Release Tests =====

    #[test]
    fn test_release_idempotent() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        assert!(reg.release(&lease.lease_id, None, None).unwrap());
        assert!(!reg.release(&lease.lease_id, None, None).unwrap());
        assert!(!reg.release(&"b".repeat(32), None, None).unwrap());
    }

    #[test]
    fn test_release_scope_mismatch() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        let err = reg
            .release(&lease.lease_id, Some("acme"), Some("run-2"))
            .unwrap_err();
        assert_eq!(reason_of(&err), "LEASE_SCOPE_MISMATCH");
        // Lease still active after the rejected release.
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn test_release_frees_binding_for_reallocation() {
        let reg = registry();
        let first = reg.allocate("acme", "run-1", None, None).unwrap();
        reg.release(&first.lease_id, None, None).unwrap();
        let second = reg.allocate("acme", "run-1", None, None).unwrap();
        assert_ne!(first.lease_id, second.lease_id);
    }

    // ===== TTL Expiry Tests =====

    #[test]
    fn test_expired_lease_observed_absent() {
        let reg = fast_registry();
        let lease = reg.allocate("acme", "run-1", None, Some(10)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(40));

        let err = reg
            .heartbeat(&lease.lease_id, None, None, None)
            .unwrap_err();
        assert_eq!(reason_of(&err), "LEASE_NOT_FOUND");
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn test_expiry_frees_binding() {
        let reg = fast_registry();
        let first = reg.allocate("acme", "run-1", None, Some(10)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(40));
        let second = reg.allocate("acme", "run-1", None, Some(200)).unwrap();
        assert_ne!(first.lease_id, second.lease_id);
    }

    // ===== Admission Tests =====

    #[test]
    fn test_assert_admission_requires_all_parts() {
        let reg = registry();
        let err = reg
            .assert_admission(Some("acme"), Some("run-1"), None, SIMULATOR_BACKEND)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgs);
        assert!(err.message.contains("leaseId"));
    }

    #[test]
    fn test_assert_admission_happy_path() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        reg.assert_admission(
            Some("acme"),
            Some("run-1"),
            Some(&lease.lease_id),
            SIMULATOR_BACKEND,
        )
        .unwrap();
    }

    #[test]
    fn test_assert_admission_released_lease_rejected() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        reg.release(&lease.lease_id, None, None).unwrap();
        let err = reg
            .assert_admission(
                Some("acme"),
                Some("run-1"),
                Some(&lease.lease_id),
                SIMULATOR_BACKEND,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(reason_of(&err), "LEASE_NOT_FOUND");
    }

    #[test]
    fn test_assert_admission_scope_mismatch() {
        let reg = registry();
        let lease = reg.allocate("acme", "run-1", None, None).unwrap();
        let err = reg
            .assert_admission(
                Some("evil"),
                Some("run-1"),
                Some(&lease.lease_id),
                SIMULATOR_BACKEND,
            )
            .unwrap_err();
        assert_eq!(reason_of(&err), "LEASE_SCOPE_MISMATCH");
    }
}
