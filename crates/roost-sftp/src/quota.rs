//! Cached disk-quota checks.
//!
//! Computing a tenant's disk usage means walking its whole data directory,
//! so both halves of the check are cached per tenant with independent TTLs:
//! the configured limit (from the tenant's `server.json` on the control
//! plane's shared storage) and the measured usage (from a parallel walk).
//! The cache is process-wide and shared by every session of every tenant.
//!
//! The check is deliberately fail-open: if the tenant configuration cannot
//! be read, writes are allowed and the error is logged. A control-plane
//! hiccup must not lock every tenant out of their files.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// How long a cached limit or usage value stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// How often the sweeper drops expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// The only field consumed from a tenant's `server.json`.
#[derive(Debug, Default, Deserialize)]
struct ServerRecord {
    #[serde(default)]
    build: BuildRecord,
}

#[derive(Debug, Default, Deserialize)]
struct BuildRecord {
    /// Disk allowance in mebibytes. Zero or negative means unlimited.
    #[serde(default)]
    disk: i64,
}

#[derive(Debug, Clone, Copy)]
struct Expiring<T> {
    value: T,
    stored_at: Instant,
}

impl<T: Copy> Expiring<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    fn get(&self, ttl: Duration) -> Option<T> {
        (self.stored_at.elapsed() < ttl).then_some(self.value)
    }
}

/// Process-wide quota cache.
///
/// Entry-level atomicity comes from the interior mutexes; a missing entry
/// (not a zero value) is what triggers recomputation, so genuinely empty
/// tenants are not re-walked on every write.
pub struct QuotaCache {
    ttl: Duration,
    disable_disk_check: bool,
    limits: Mutex<HashMap<String, Expiring<i64>>>,
    usage: Mutex<HashMap<String, Expiring<u64>>>,
}

impl QuotaCache {
    pub fn new(disable_disk_check: bool) -> Self {
        Self::with_ttl(DEFAULT_TTL, disable_disk_check)
    }

    pub fn with_ttl(ttl: Duration, disable_disk_check: bool) -> Self {
        Self {
            ttl,
            disable_disk_check,
            limits: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `tenant` may write more data.
    ///
    /// Allows when the check is disabled, the limit is unlimited (`<= 0`),
    /// the tenant configuration is unreadable, or the measured usage fits
    /// the limit. The usage comparison is fractional so a single byte over
    /// the allowance already denies.
    pub async fn has_space(&self, tenant: &str, tenant_root: &Path, server_config: &Path) -> bool {
        if self.disable_disk_check {
            return true;
        }

        let limit_mib = match self.limit_mib(tenant, server_config).await {
            Some(limit) => limit,
            // Unreadable configuration: allow, already logged.
            None => return true,
        };

        if limit_mib <= 0 {
            debug!(
                event = "quota_unlimited",
                tenant, "tenant has no disk limit"
            );
            return true;
        }

        let used_bytes = self.used_bytes(tenant, tenant_root).await;

        (used_bytes as f64) / 1_048_576.0 <= limit_mib as f64
    }

    /// Drop every expired entry. Runs from the background sweeper so the
    /// maps do not grow with tenants that disconnected long ago.
    pub async fn sweep(&self) {
        let ttl = self.ttl;

        let mut limits = self.limits.lock().await;
        limits.retain(|_, e| e.get(ttl).is_some());
        drop(limits);

        let mut usage = self.usage.lock().await;
        usage.retain(|_, e| e.get(ttl).is_some());
    }

    /// Spawn the periodic sweep task. The task runs for the lifetime of the
    /// process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }

    async fn limit_mib(&self, tenant: &str, server_config: &Path) -> Option<i64> {
        let mut limits = self.limits.lock().await;
        if let Some(limit) = limits.get(tenant).and_then(|e| e.get(self.ttl)) {
            return Some(limit);
        }

        let raw = match fs::read(server_config).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    event = "quota_config_unreadable",
                    tenant,
                    path = ?server_config,
                    error = %e,
                    "cannot determine disk limit, allowing write"
                );
                return None;
            }
        };

        // An unparseable record degrades to "unlimited" rather than locking
        // the tenant out.
        let limit = match serde_json::from_slice::<ServerRecord>(&raw) {
            Ok(record) => record.build.disk,
            Err(e) => {
                warn!(
                    event = "quota_config_unparseable",
                    tenant,
                    error = %e,
                    "treating disk limit as unlimited"
                );
                0
            }
        };

        limits.insert(tenant.to_string(), Expiring::now(limit));
        Some(limit)
    }

    async fn used_bytes(&self, tenant: &str, tenant_root: &Path) -> u64 {
        let mut usage = self.usage.lock().await;
        if let Some(used) = usage.get(tenant).and_then(|e| e.get(self.ttl)) {
            return used;
        }

        let used = directory_size(tenant_root).await;
        debug!(
            event = "quota_usage_computed",
            tenant, used_bytes = used, "walked tenant data directory"
        );
        usage.insert(tenant.to_string(), Expiring::now(used));

        used
    }
}

/// Total size in bytes of the regular files under `path`.
///
/// Subdirectories are walked on their own tasks; each task returns its own
/// subtotal and the caller sums them at join, so no counter is ever shared
/// between workers. Unreadable directories contribute zero and are logged.
pub async fn directory_size(path: &Path) -> u64 {
    directory_size_task(path.to_path_buf()).await
}

fn directory_size_task(path: PathBuf) -> Pin<Box<dyn Future<Output = u64> + Send>> {
    Box::pin(async move {
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    event = "directory_walk_failed",
                    directory = ?path,
                    error = %e,
                    "skipping unreadable directory"
                );
                return 0;
            }
        };

        let mut total = 0u64;
        let mut workers = JoinSet::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => {
                    workers.spawn(directory_size_task(entry.path()));
                }
                Ok(ft) if ft.is_file() => {
                    if let Ok(metadata) = entry.metadata().await {
                        total += metadata.len();
                    }
                }
                // Symlinks and special files do not count against the quota.
                _ => {}
            }
        }

        while let Some(subtotal) = workers.join_next().await {
            total += subtotal.unwrap_or(0);
        }

        total
    })
}
