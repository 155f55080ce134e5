//! Daemon configuration. Hot-updatable knobs apply immediately through
//! the config manager; everything else requires a restart.

use ferrofs_config::{Config, ConfigError};

use crate::clog::ClogRouting;

#[derive(Debug, Clone, PartialEq)]
pub struct MdsConfig {
    /// Daemon name registered with the monitor.
    pub name: String,

    /// Interval between maintenance ticks.
    pub tick_interval_ms: u64,

    /// Interval between beacons to the monitor.
    pub beacon_interval_ms: u64,

    /// Un-acked beacon age after which the daemon considers itself laggy.
    pub beacon_grace_ms: u64,

    /// How long a damaged-state beacon may wait for the monitor.
    pub mon_shutdown_timeout_ms: u64,

    /// Age at which an in-flight op draws an operator warning.
    pub op_complaint_time_ms: u64,

    /// Size of the recent-slow-op ring buffer.
    pub op_history_size: usize,

    /// Journal segments retained before periodic trim kicks in.
    pub max_log_segments: usize,

    /// Prefer standby-replay when sent to standby.
    pub standby_replay: bool,

    /// Follow a specific rank when standby; -1 for any.
    pub standby_for_rank: i32,

    /// Follow a specific daemon name when standby.
    pub standby_for_name: String,

    /// Replay once and exit.
    pub oneshot_replay: bool,

    /// Suicide rather than respawn when a fresher instance owns our name.
    pub enforce_unique_name: bool,

    /// Dump the cache on every accepted cluster map (debug aid).
    pub dump_cache_on_map: bool,

    // Operator log routing.
    pub clog_to_monitors: bool,
    pub clog_to_syslog: bool,
    pub clog_channel: String,
    pub clog_priority: String,

    /// Backoff between object-server compatibility polls at boot.
    pub boot_retry_interval_ms: u64,

    /// Keys accepted by the shared-key authorizer handlers.
    pub auth_shared_keys: Vec<String>,
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            name: "mds-a".into(),
            tick_interval_ms: 5000,
            beacon_interval_ms: 4000,
            beacon_grace_ms: 15_000,
            mon_shutdown_timeout_ms: 5000,
            op_complaint_time_ms: 30_000,
            op_history_size: 20,
            max_log_segments: 30,
            standby_replay: false,
            standby_for_rank: -1,
            standby_for_name: String::new(),
            oneshot_replay: false,
            enforce_unique_name: true,
            dump_cache_on_map: false,
            clog_to_monitors: true,
            clog_to_syslog: false,
            clog_channel: "cluster".into(),
            clog_priority: "info".into(),
            boot_retry_interval_ms: 10_000,
            auth_shared_keys: Vec::new(),
        }
    }
}

impl MdsConfig {
    pub fn clog_routing(&self) -> ClogRouting {
        ClogRouting {
            to_monitors: self.clog_to_monitors,
            to_syslog: self.clog_to_syslog,
            channel: self.clog_channel.clone(),
            priority: self.clog_priority.clone(),
        }
    }
}

fn get_u64(value: &toml::Value, field: &str, out: &mut u64) -> Result<(), ConfigError> {
    if let Some(v) = value.get(field) {
        *out = v.as_integer().ok_or_else(|| ConfigError::TypeMismatch {
            field: field.into(),
            expected: "integer".into(),
        })? as u64;
    }
    Ok(())
}

fn get_usize(value: &toml::Value, field: &str, out: &mut usize) -> Result<(), ConfigError> {
    if let Some(v) = value.get(field) {
        *out = v.as_integer().ok_or_else(|| ConfigError::TypeMismatch {
            field: field.into(),
            expected: "integer".into(),
        })? as usize;
    }
    Ok(())
}

fn get_i32(value: &toml::Value, field: &str, out: &mut i32) -> Result<(), ConfigError> {
    if let Some(v) = value.get(field) {
        *out = v.as_integer().ok_or_else(|| ConfigError::TypeMismatch {
            field: field.into(),
            expected: "integer".into(),
        })? as i32;
    }
    Ok(())
}

fn get_bool(value: &toml::Value, field: &str, out: &mut bool) -> Result<(), ConfigError> {
    if let Some(v) = value.get(field) {
        *out = v.as_bool().ok_or_else(|| ConfigError::TypeMismatch {
            field: field.into(),
            expected: "boolean".into(),
        })?;
    }
    Ok(())
}

fn get_string(value: &toml::Value, field: &str, out: &mut String) -> Result<(), ConfigError> {
    if let Some(v) = value.get(field) {
        *out = v
            .as_str()
            .ok_or_else(|| ConfigError::TypeMismatch {
                field: field.into(),
                expected: "string".into(),
            })?
            .to_string();
    }
    Ok(())
}

impl Config for MdsConfig {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        get_string(value, "name", &mut cfg.name)?;
        get_u64(value, "tick_interval_ms", &mut cfg.tick_interval_ms)?;
        get_u64(value, "beacon_interval_ms", &mut cfg.beacon_interval_ms)?;
        get_u64(value, "beacon_grace_ms", &mut cfg.beacon_grace_ms)?;
        get_u64(value, "mon_shutdown_timeout_ms", &mut cfg.mon_shutdown_timeout_ms)?;
        get_u64(value, "op_complaint_time_ms", &mut cfg.op_complaint_time_ms)?;
        get_usize(value, "op_history_size", &mut cfg.op_history_size)?;
        get_usize(value, "max_log_segments", &mut cfg.max_log_segments)?;
        get_bool(value, "standby_replay", &mut cfg.standby_replay)?;
        get_i32(value, "standby_for_rank", &mut cfg.standby_for_rank)?;
        get_string(value, "standby_for_name", &mut cfg.standby_for_name)?;
        get_bool(value, "oneshot_replay", &mut cfg.oneshot_replay)?;
        get_bool(value, "enforce_unique_name", &mut cfg.enforce_unique_name)?;
        get_bool(value, "dump_cache_on_map", &mut cfg.dump_cache_on_map)?;
        get_bool(value, "clog_to_monitors", &mut cfg.clog_to_monitors)?;
        get_bool(value, "clog_to_syslog", &mut cfg.clog_to_syslog)?;
        get_string(value, "clog_channel", &mut cfg.clog_channel)?;
        get_string(value, "clog_priority", &mut cfg.clog_priority)?;
        get_u64(value, "boot_retry_interval_ms", &mut cfg.boot_retry_interval_ms)?;
        if let Some(v) = value.get("auth_shared_keys") {
            let arr = v.as_array().ok_or_else(|| ConfigError::TypeMismatch {
                field: "auth_shared_keys".into(),
                expected: "array of strings".into(),
            })?;
            cfg.auth_shared_keys = arr
                .iter()
                .map(|e| {
                    e.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ConfigError::TypeMismatch {
                            field: "auth_shared_keys".into(),
                            expected: "array of strings".into(),
                        })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(cfg)
    }

    fn hot_update(&mut self, other: &Self) {
        self.tick_interval_ms = other.tick_interval_ms;
        self.op_complaint_time_ms = other.op_complaint_time_ms;
        self.op_history_size = other.op_history_size;
        self.enforce_unique_name = other.enforce_unique_name;
        self.dump_cache_on_map = other.dump_cache_on_map;
        self.clog_to_monitors = other.clog_to_monitors;
        self.clog_to_syslog = other.clog_to_syslog;
        self.clog_channel = other.clog_channel.clone();
        self.clog_priority = other.clog_priority.clone();
    }

    fn render(&self) -> String {
        let keys = self
            .auth_shared_keys
            .iter()
            .map(|k| format!("\"{}\"", k))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            concat!(
                "name = \"{}\"\n",
                "tick_interval_ms = {}\n",
                "beacon_interval_ms = {}\n",
                "beacon_grace_ms = {}\n",
                "mon_shutdown_timeout_ms = {}\n",
                "op_complaint_time_ms = {}\n",
                "op_history_size = {}\n",
                "max_log_segments = {}\n",
                "standby_replay = {}\n",
                "standby_for_rank = {}\n",
                "standby_for_name = \"{}\"\n",
                "oneshot_replay = {}\n",
                "enforce_unique_name = {}\n",
                "dump_cache_on_map = {}\n",
                "clog_to_monitors = {}\n",
                "clog_to_syslog = {}\n",
                "clog_channel = \"{}\"\n",
                "clog_priority = \"{}\"\n",
                "boot_retry_interval_ms = {}\n",
                "auth_shared_keys = [{}]\n",
            ),
            self.name,
            self.tick_interval_ms,
            self.beacon_interval_ms,
            self.beacon_grace_ms,
            self.mon_shutdown_timeout_ms,
            self.op_complaint_time_ms,
            self.op_history_size,
            self.max_log_segments,
            self.standby_replay,
            self.standby_for_rank,
            self.standby_for_name,
            self.oneshot_replay,
            self.enforce_unique_name,
            self.dump_cache_on_map,
            self.clog_to_monitors,
            self.clog_to_syslog,
            self.clog_channel,
            self.clog_priority,
            self.boot_retry_interval_ms,
            keys,
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "tick_interval_ms".into(),
                value: "0".into(),
                min: Some("1".into()),
                max: None,
            });
        }
        if self.beacon_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "beacon_interval_ms".into(),
                value: "0".into(),
                min: Some("1".into()),
                max: None,
            });
        }
        if self.beacon_grace_ms <= self.beacon_interval_ms {
            return Err(ConfigError::Invalid(
                "beacon_grace_ms must exceed beacon_interval_ms".into(),
            ));
        }
        if self.oneshot_replay && self.standby_for_rank < 0 && self.standby_for_name.is_empty() {
            return Err(ConfigError::Invalid(
                "oneshot_replay requires standby_for_rank or standby_for_name".into(),
            ));
        }
        Ok(())
    }
}
