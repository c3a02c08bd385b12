//! Named tunables.
//!
//! Each tunable has a name, a textual default and a flag saying whether it
//! may change while the layer is running. [`set`] and [`get`] translate
//! between the text form and the fields of [`DbLayerConfig`]; sizes accept
//! the suffixes understood by [`db_strtoull`].

use std::path::PathBuf;

use crate::config::{DbLayerConfig, LOCKS_THRESHOLD_RANGE, MIN_LOCKS};
use crate::engine::DeadlockPolicy;
use crate::error::{DbError, DbResult};
use crate::strtoul::{db_atol, db_strtoul, db_strtoull};

/// When a tunable is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Configuration is being read before the layer starts.
    Startup,
    /// The layer is running.
    Running,
}

/// Description of one tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunable {
    /// Attribute name.
    pub name: &'static str,
    /// Value applied by [`setup_default`].
    pub default: &'static str,
    /// May be changed in [`Phase::Running`].
    pub running_change: bool,
}

const fn tunable(name: &'static str, default: &'static str, running_change: bool) -> Tunable {
    Tunable {
        name,
        default,
        running_change,
    }
}

/// Database cache size in bytes.
pub const CACHESIZE: &str = "nsslapd-dbcachesize";
/// Number of cache chunks; 0 lets the layer decide.
pub const NCACHE: &str = "nsslapd-dbncache";
/// Lock table size.
pub const LOCKS: &str = "nsslapd-db-locks";
/// Transaction log directory.
pub const LOG_DIRECTORY: &str = "nsslapd-db-logdirectory";
/// Environment home when it differs from the database directory.
pub const HOME_DIRECTORY: &str = "nsslapd-db-home-directory";
/// Parent directory of the instance directories.
pub const DIRECTORY: &str = "nsslapd-directory";
/// Flush the log on every commit.
pub const DURABLE_TRANSACTION: &str = "nsslapd-db-durable-transaction";
/// Delete log files once they are not needed for recovery.
pub const CIRCULAR_LOGGING: &str = "nsslapd-db-circular-logging";
/// Use transactions at all.
pub const TRANSACTION_LOGGING: &str = "nsslapd-db-transaction-logging";
/// Wait for locks instead of failing fast.
pub const TRANSACTION_WAIT: &str = "nsslapd-db-transaction-wait";
/// Seconds between checkpoints.
pub const CHECKPOINT_INTERVAL: &str = "nsslapd-db-checkpoint-interval";
/// Group commit size; 0 disables it.
pub const BATCH_VAL: &str = "nsslapd-db-transaction-batch-val";
/// Shortest group commit wait in milliseconds.
pub const BATCH_MIN_WAIT: &str = "nsslapd-db-transaction-batch-min-wait";
/// Longest group commit wait in milliseconds.
pub const BATCH_MAX_WAIT: &str = "nsslapd-db-transaction-batch-max-wait";
/// Log buffer size.
pub const LOGBUF_SIZE: &str = "nsslapd-db-logbuf-size";
/// Database page size.
pub const PAGE_SIZE: &str = "nsslapd-db-page-size";
/// Largest log file.
pub const LOGFILE_SIZE: &str = "nsslapd-db-logfile-size";
/// Share of the cache kept clean by the trickle thread.
pub const TRICKLE_PERCENTAGE: &str = "nsslapd-db-trickle-percentage";
/// Keep the environment regions in process memory.
pub const PRIVATE_MEM: &str = "nsslapd-db-private-mem";
/// Private regions during import.
pub const PRIVATE_IMPORT_MEM: &str = "nsslapd-db-private-import-mem";
/// Lock the regions into physical memory.
pub const LOCKDOWN: &str = "nsslapd-db-lockdown";
/// Most concurrent transactions.
pub const TX_MAX: &str = "nsslapd-db-tx-max";
/// Serialize write transactions per instance.
pub const SERIAL_LOCK: &str = "nsslapd-serial-lock";
/// Victim selection of the deadlock detector.
pub const DEADLOCK_POLICY: &str = "nsslapd-db-deadlock-policy";
/// Refuse new write transactions when the lock table runs full.
pub const LOCKS_MONITORING_ENABLED: &str = "nsslapd-db-locks-monitoring-enabled";
/// Lock table use, in percent, that counts as full.
pub const LOCKS_MONITORING_THRESHOLD: &str = "nsslapd-db-locks-monitoring-threshold";
/// Milliseconds between lock table checks.
pub const LOCKS_MONITORING_PAUSE: &str = "nsslapd-db-locks-monitoring-pause";
/// Log every checkpoint decision.
pub const DEBUG_CHECKPOINTING: &str = "nsslapd-db-debug-checkpointing";

/// Every tunable, in display order.
pub const TUNABLES: &[Tunable] = &[
    tunable(CACHESIZE, "0", true),
    tunable(NCACHE, "0", true),
    tunable(LOCKS, "10000", true),
    tunable(LOG_DIRECTORY, "", false),
    tunable(HOME_DIRECTORY, "", false),
    tunable(DIRECTORY, "", false),
    tunable(DURABLE_TRANSACTION, "on", false),
    tunable(CIRCULAR_LOGGING, "on", false),
    tunable(TRANSACTION_LOGGING, "on", false),
    tunable(TRANSACTION_WAIT, "off", true),
    tunable(CHECKPOINT_INTERVAL, "60", true),
    tunable(BATCH_VAL, "0", true),
    tunable(BATCH_MIN_WAIT, "50", true),
    tunable(BATCH_MAX_WAIT, "50", true),
    tunable(LOGBUF_SIZE, "0", false),
    tunable(PAGE_SIZE, "0", false),
    tunable(LOGFILE_SIZE, "0", false),
    tunable(TRICKLE_PERCENTAGE, "5", false),
    tunable(PRIVATE_MEM, "off", false),
    tunable(PRIVATE_IMPORT_MEM, "on", false),
    tunable(LOCKDOWN, "off", false),
    tunable(TX_MAX, "200", false),
    tunable(SERIAL_LOCK, "on", true),
    tunable(DEADLOCK_POLICY, "9", true),
    tunable(LOCKS_MONITORING_ENABLED, "on", true),
    tunable(LOCKS_MONITORING_THRESHOLD, "90", true),
    tunable(LOCKS_MONITORING_PAUSE, "500", true),
    tunable(DEBUG_CHECKPOINTING, "off", false),
];

/// Looks a tunable up by name, ignoring case.
#[must_use]
pub fn find(name: &str) -> Option<&'static Tunable> {
    TUNABLES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

fn unknown(name: &str) -> DbError {
    DbError::config(format!("unknown tunable {name}"))
}

fn invalid(name: &str, value: &str, why: impl std::fmt::Display) -> DbError {
    DbError::config(format!("invalid value {value:?} for {name}: {why}"))
}

fn parse_bool(name: &str, value: &str) -> DbResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(name, value, "expected on or off")),
    }
}

fn parse_u32(name: &str, value: &str) -> DbResult<u32> {
    db_strtoul(value).map_err(|err| invalid(name, value, err))
}

fn parse_u64(name: &str, value: &str) -> DbResult<u64> {
    db_strtoull(value).map_err(|err| invalid(name, value, err))
}

fn parse_dir(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

fn on_off(flag: bool) -> String {
    if flag { "on" } else { "off" }.to_string()
}

fn dir_text(dir: Option<&PathBuf>) -> String {
    dir.map(|d| d.display().to_string()).unwrap_or_default()
}

/// Current value of `name` in text form.
///
/// # Errors
///
/// [`DbError::Config`] for an unknown name.
pub fn get(config: &DbLayerConfig, name: &str) -> DbResult<String> {
    let tunable = find(name).ok_or_else(|| unknown(name))?;
    Ok(match tunable.name {
        CACHESIZE => config.cachesize.to_string(),
        NCACHE => config.ncache.to_string(),
        LOCKS => config.locks.to_string(),
        LOG_DIRECTORY => dir_text(config.log_directory.as_ref()),
        HOME_DIRECTORY => dir_text(config.db_home_directory.as_ref()),
        DIRECTORY => config.directory.display().to_string(),
        DURABLE_TRANSACTION => on_off(config.durable_transactions),
        CIRCULAR_LOGGING => on_off(config.circular_logging),
        TRANSACTION_LOGGING => on_off(config.enable_transactions),
        TRANSACTION_WAIT => on_off(config.txn_wait),
        CHECKPOINT_INTERVAL => config.checkpoint_interval.to_string(),
        BATCH_VAL => config.txn_batch_val.to_string(),
        BATCH_MIN_WAIT => config.txn_batch_min_wait.to_string(),
        BATCH_MAX_WAIT => config.txn_batch_max_wait.to_string(),
        LOGBUF_SIZE => config.logbuf_size.to_string(),
        PAGE_SIZE => config.page_size.to_string(),
        LOGFILE_SIZE => config.logfile_size.to_string(),
        TRICKLE_PERCENTAGE => config.trickle_percentage.to_string(),
        PRIVATE_MEM => on_off(config.private_mem),
        PRIVATE_IMPORT_MEM => on_off(config.private_import_mem),
        LOCKDOWN => on_off(config.lockdown),
        TX_MAX => config.tx_max.to_string(),
        SERIAL_LOCK => on_off(config.serial_lock),
        DEADLOCK_POLICY => config.deadlock_policy.to_string(),
        LOCKS_MONITORING_ENABLED => on_off(config.locks_monitoring_enabled),
        LOCKS_MONITORING_THRESHOLD => config.locks_monitoring_threshold.to_string(),
        LOCKS_MONITORING_PAUSE => config.locks_monitoring_pause.to_string(),
        DEBUG_CHECKPOINTING => on_off(config.debug_checkpointing),
        other => return Err(unknown(other)),
    })
}

/// Applies `value` to the tunable `name`.
///
/// # Errors
///
/// [`DbError::Config`] for an unknown name, a malformed or out of range
/// value, or a tunable that cannot change in `phase`.
pub fn set(config: &mut DbLayerConfig, name: &str, value: &str, phase: Phase) -> DbResult<()> {
    let tunable = find(name).ok_or_else(|| unknown(name))?;
    if phase == Phase::Running && !tunable.running_change {
        return Err(DbError::config(format!(
            "{} cannot be changed while the server is running",
            tunable.name
        )));
    }
    let name = tunable.name;
    match name {
        CACHESIZE => config.cachesize = parse_u64(name, value)?,
        NCACHE => config.ncache = parse_u32(name, value)?,
        LOCKS => {
            let locks = parse_u32(name, value)?;
            if locks < MIN_LOCKS {
                return Err(invalid(name, value, format!("must be at least {MIN_LOCKS}")));
            }
            if phase == Phase::Running {
                tracing::info!(locks, "new lock table size takes effect after a restart");
            }
            config.locks = locks;
        }
        LOG_DIRECTORY => config.log_directory = parse_dir(value),
        HOME_DIRECTORY => config.db_home_directory = parse_dir(value),
        DIRECTORY => config.directory = parse_dir(value).unwrap_or_default(),
        DURABLE_TRANSACTION => config.durable_transactions = parse_bool(name, value)?,
        CIRCULAR_LOGGING => config.circular_logging = parse_bool(name, value)?,
        TRANSACTION_LOGGING => config.enable_transactions = parse_bool(name, value)?,
        TRANSACTION_WAIT => config.txn_wait = parse_bool(name, value)?,
        CHECKPOINT_INTERVAL => config.checkpoint_interval = parse_u64(name, value)?,
        BATCH_VAL => {
            let val = db_atol(value).map_err(|err| invalid(name, value, err))?;
            config.txn_batch_val = i32::try_from(val)
                .ok()
                .filter(|v| *v >= -1)
                .ok_or_else(|| invalid(name, value, "must be -1 or more"))?;
        }
        BATCH_MIN_WAIT => config.txn_batch_min_wait = parse_u64(name, value)?,
        BATCH_MAX_WAIT => config.txn_batch_max_wait = parse_u64(name, value)?,
        LOGBUF_SIZE => config.logbuf_size = parse_u32(name, value)?,
        PAGE_SIZE => config.page_size = parse_u32(name, value)?,
        LOGFILE_SIZE => config.logfile_size = parse_u32(name, value)?,
        TRICKLE_PERCENTAGE => {
            let pct = parse_u32(name, value)?;
            if pct > 100 {
                return Err(invalid(name, value, "must be 0..=100"));
            }
            config.trickle_percentage = pct;
        }
        PRIVATE_MEM => config.private_mem = parse_bool(name, value)?,
        PRIVATE_IMPORT_MEM => config.private_import_mem = parse_bool(name, value)?,
        LOCKDOWN => config.lockdown = parse_bool(name, value)?,
        TX_MAX => config.tx_max = parse_u32(name, value)?,
        SERIAL_LOCK => config.serial_lock = parse_bool(name, value)?,
        DEADLOCK_POLICY => {
            let code = parse_u32(name, value)?;
            DeadlockPolicy::from_code(code)?;
            config.deadlock_policy = code;
        }
        LOCKS_MONITORING_ENABLED => config.locks_monitoring_enabled = parse_bool(name, value)?,
        LOCKS_MONITORING_THRESHOLD => {
            let pct = parse_u32(name, value)?;
            if !LOCKS_THRESHOLD_RANGE.contains(&pct) {
                return Err(invalid(
                    name,
                    value,
                    format!(
                        "must be {}..={}",
                        LOCKS_THRESHOLD_RANGE.start(),
                        LOCKS_THRESHOLD_RANGE.end()
                    ),
                ));
            }
            config.locks_monitoring_threshold = pct;
        }
        LOCKS_MONITORING_PAUSE => config.locks_monitoring_pause = parse_u64(name, value)?,
        DEBUG_CHECKPOINTING => config.debug_checkpointing = parse_bool(name, value)?,
        other => return Err(unknown(other)),
    }
    Ok(())
}

/// Applies every default, as at first startup.
///
/// The directories are left alone: their defaults are empty and the
/// configuration is useless without them.
///
/// # Errors
///
/// Only if a built-in default fails to parse.
pub fn setup_default(config: &mut DbLayerConfig) -> DbResult<()> {
    for tunable in TUNABLES {
        if matches!(tunable.name, LOG_DIRECTORY | HOME_DIRECTORY | DIRECTORY) {
            continue;
        }
        set(config, tunable.name, tunable.default, Phase::Startup)?;
    }
    Ok(())
}

/// Every tunable with its current value.
#[must_use]
pub fn snapshot(config: &DbLayerConfig) -> Vec<(&'static str, String)> {
    TUNABLES
        .iter()
        .filter_map(|t| get(config, t.name).ok().map(|v| (t.name, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_agree_with_the_config_defaults() {
        let mut config = DbLayerConfig::new("/db");
        config.cachesize = 1 << 30;
        config.serial_lock = false;
        setup_default(&mut config).unwrap();
        assert_eq!(config, DbLayerConfig::new("/db"));
    }

    #[test]
    fn sizes_take_suffixes() {
        let mut config = DbLayerConfig::default();
        set(&mut config, CACHESIZE, "32k", Phase::Startup).unwrap();
        assert_eq!(config.cachesize, 32 * 1024);
        set(&mut config, "NSSLAPD-DBCACHESIZE", "2g", Phase::Running).unwrap();
        assert_eq!(get(&config, CACHESIZE).unwrap(), (2u64 << 30).to_string());
        assert!(set(&mut config, CACHESIZE, "-5", Phase::Startup).is_err());
    }

    #[test]
    fn startup_only_tunables_are_refused_while_running() {
        let mut config = DbLayerConfig::default();
        let err = set(&mut config, LOGBUF_SIZE, "64k", Phase::Running).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
        set(&mut config, LOGBUF_SIZE, "64k", Phase::Startup).unwrap();
        assert_eq!(config.logbuf_size, 64 * 1024);
    }

    #[test]
    fn range_checks() {
        let mut config = DbLayerConfig::default();
        assert!(set(&mut config, LOCKS, "500", Phase::Startup).is_err());
        assert!(set(&mut config, LOCKS_MONITORING_THRESHOLD, "50", Phase::Running).is_err());
        assert!(set(&mut config, DEADLOCK_POLICY, "12", Phase::Running).is_err());
        assert!(set(&mut config, TRICKLE_PERCENTAGE, "101", Phase::Startup).is_err());
        assert!(set(&mut config, BATCH_VAL, "-2", Phase::Running).is_err());
        set(&mut config, BATCH_VAL, "-1", Phase::Running).unwrap();
        assert_eq!(config.txn_batch_val, -1);
        assert!(set(&mut config, DURABLE_TRANSACTION, "maybe", Phase::Startup).is_err());
        assert!(get(&config, "nsslapd-nonsense").is_err());
    }

    #[test]
    fn snapshot_lists_every_tunable() {
        let config = DbLayerConfig::new("/db").with_log_directory("/logs");
        let values = snapshot(&config);
        assert_eq!(values.len(), TUNABLES.len());
        assert!(values.contains(&(LOG_DIRECTORY, "/logs".to_string())));
        assert!(values.contains(&(SERIAL_LOCK, "on".to_string())));
    }
}
