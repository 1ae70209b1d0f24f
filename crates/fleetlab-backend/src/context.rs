//! Per-invocation execution context

use crate::executor::DEFAULT_PARALLEL_THREADS;
use crate::model::Expiry;
use crate::provider::BackendKind;
use chrono::{DateTime, Duration, Utc};

/// Lifetime of cloud nodes created without an explicit expiry
pub const DEFAULT_CLOUD_TTL_HOURS: i64 = 30;

/// Identity and limits of the current command, passed to every core call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub backend: BackendKind,
    /// Written to the owner tag of new resources
    pub owner: String,
    /// Scopes inventory to resources tagged with this project
    pub project: Option<String>,
    pub parallel_threads: usize,
    /// Expiry of new groups that do not ask for one; zero never expires
    pub default_ttl: Duration,
}

impl ExecutionContext {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            owner: default_owner(),
            project: None,
            parallel_threads: DEFAULT_PARALLEL_THREADS,
            default_ttl: default_ttl(backend),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project.filter(|p| !p.is_empty());
        self
    }

    pub fn with_parallel_threads(mut self, threads: usize) -> Self {
        self.parallel_threads = threads.max(1);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Expiry given to a new group created at `now` without one
    pub fn default_expiry(&self, now: DateTime<Utc>) -> Expiry {
        Expiry::after(self.default_ttl, now)
    }
}

/// Containers are local and never expire unless asked to
fn default_ttl(backend: BackendKind) -> Duration {
    match backend {
        BackendKind::Docker => Duration::zero(),
        BackendKind::Aws | BackendKind::Gcp => Duration::hours(DEFAULT_CLOUD_TTL_HOURS),
    }
}

/// The invoking OS user, or "unknown"
pub fn default_owner() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let ctx = ExecutionContext::new(BackendKind::Aws)
            .with_owner("bob")
            .with_project(Some(String::new()))
            .with_parallel_threads(0);
        assert_eq!(ctx.owner, "bob");
        assert_eq!(ctx.project, None);
        assert_eq!(ctx.parallel_threads, 1);

        let ctx = ctx.with_project(Some("demo".to_string()));
        assert_eq!(ctx.project.as_deref(), Some("demo"));
    }

    #[test]
    fn test_default_expiry_per_backend() {
        let now = Utc::now();
        let docker = ExecutionContext::new(BackendKind::Docker);
        assert_eq!(docker.default_expiry(now), Expiry::Never);

        for backend in [BackendKind::Aws, BackendKind::Gcp] {
            let ctx = ExecutionContext::new(backend);
            assert_eq!(ctx.default_expiry(now), Expiry::At(now + Duration::hours(30)));
        }

        let forever = ExecutionContext::new(BackendKind::Aws).with_default_ttl(Duration::zero());
        assert_eq!(forever.default_expiry(now), Expiry::Never);
    }
}
