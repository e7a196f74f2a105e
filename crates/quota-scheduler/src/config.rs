//! CLI-exposed tunables for the quota plugin (spec.md §6 "Plugin
//! configuration"), following `RunArguments`'s `#[arg(long, env,
//! default_value = "...")]` style so every knob is also an environment
//! variable.

use std::time::Duration;

use clap::Args;
use quota_core::resources::ResourceAmount;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PluginConfig {
    /// Namespace that holds the auto-created `default`/`system` quotas.
    #[arg(long, env, default_value = "kube-system")]
    pub quota_group_namespace: String,

    #[arg(long, env, default_value_t = 0)]
    pub system_quota_group_cpu_millis: i64,

    #[arg(long, env, default_value_t = 0)]
    pub system_quota_group_memory_bytes: i64,

    #[arg(long, env, default_value_t = 0)]
    pub default_quota_group_cpu_millis: i64,

    #[arg(long, env, default_value_t = 0)]
    pub default_quota_group_memory_bytes: i64,

    /// Enables elastic redistribution of runtime share. When disabled,
    /// `Runtime := Max` for every group.
    #[arg(long, env, default_value_t = true)]
    pub enable_runtime_quota: bool,

    /// Enforces admission against every ancestor, not just the target group.
    #[arg(long, env, default_value_t = false)]
    pub enable_check_parent_quota: bool,

    /// Grace period before a mis-routed `default`-group pod is considered
    /// stable enough to migrate.
    #[arg(long, env, value_parser = humantime::parse_duration, default_value = "30s")]
    pub delay_evict_time: Duration,

    /// Interval between migrator passes over the `default` group.
    #[arg(long, env, value_parser = humantime::parse_duration, default_value = "10s")]
    pub revoke_pod_interval: Duration,

    /// Whether child-Min sums are strictly enforced against parent Min.
    #[arg(long, env, default_value_t = true)]
    pub strict_child_min: bool,
}

impl PluginConfig {
    pub fn system_quota_group_max(&self) -> ResourceAmount {
        ResourceAmount::cpu_mem(self.system_quota_group_cpu_millis, self.system_quota_group_memory_bytes)
    }

    pub fn default_quota_group_max(&self) -> ResourceAmount {
        ResourceAmount::cpu_mem(self.default_quota_group_cpu_millis, self.default_quota_group_memory_bytes)
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            quota_group_namespace: "kube-system".to_string(),
            system_quota_group_cpu_millis: 0,
            system_quota_group_memory_bytes: 0,
            default_quota_group_cpu_millis: 0,
            default_quota_group_memory_bytes: 0,
            enable_runtime_quota: true,
            enable_check_parent_quota: false,
            delay_evict_time: Duration::from_secs(30),
            revoke_pod_interval: Duration::from_secs(10),
            strict_child_min: true,
        }
    }
}
