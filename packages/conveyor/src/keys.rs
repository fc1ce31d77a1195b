//! Canonical store key layout.
//!
//! All durable state lives under a fixed namespace: one hash per job plus
//! three indices that mirror the non-terminal states.

/// Key of the hash holding the authoritative record for `id`.
pub fn job_key(id: &str) -> String {
    format!("job:{id}")
}

/// Sorted set of jobs awaiting a future run time, scored by `run_at_ms`.
pub const JOBS_SCHEDULED: &str = "jobs:scheduled";

/// Set of jobs eligible for immediate worker claim.
pub const JOBS_READY: &str = "jobs:ready";

/// Sorted set of running jobs, scored by lease expiry.
pub const JOBS_LEASE: &str = "jobs:lease";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_uses_fixed_namespace() {
        assert_eq!(job_key("abc-1"), "job:abc-1");
    }
}
