//! Runtime-configurable tuning parameters for rmacoll.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `RMACOLL_`) or by constructing a custom `RmaCollConfig`.

use crate::collective::AlltoallvAlgorithm;
use crate::types::Tag;
use std::fmt::Display;
use std::str::FromStr;

/// First tag handed out to nonblocking requests on a communicator.
pub const DEFAULT_TAG_BASE: Tag = -26;

/// Last tag before the counter wraps back to [`DEFAULT_TAG_BASE`].
pub const DEFAULT_TAG_END: Tag = -(i32::MAX / 2) + 1;

/// Tuning parameters for schedules, requests and drivers.
#[derive(Debug, Clone)]
pub struct RmaCollConfig {
    /// Algorithm used by the all-to-all-variable driver.
    pub a2av_algorithm: AlltoallvAlgorithm,

    /// Tag counter start value. Tags count down from here.
    pub tag_base: Tag,

    /// Tag counter wrap point (inclusive). Must be below `tag_base`.
    pub tag_end: Tag,

    /// Initial byte capacity reserved for a new schedule arena.
    pub schedule_capacity: usize,

    /// Hard cap on a schedule arena. Growth past this is `ResourceExhausted`.
    pub max_schedule_bytes: usize,

    /// Number of polls `wait()` performs before yielding to the scheduler.
    pub wait_spin: u32,
}

impl Default for RmaCollConfig {
    fn default() -> Self {
        Self {
            a2av_algorithm: AlltoallvAlgorithm::TriggerPush,
            tag_base: DEFAULT_TAG_BASE,
            tag_end: DEFAULT_TAG_END,
            schedule_capacity: 256,
            max_schedule_bytes: 64 * 1024 * 1024, // 64 MiB
            wait_spin: 64,
        }
    }
}

impl RmaCollConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RMACOLL_A2AV_ALGO` (`linear_rput`, `linear_rget`, `trigger_pull`, `trigger_push`)
    /// - `RMACOLL_TAG_BASE`
    /// - `RMACOLL_TAG_END`
    /// - `RMACOLL_SCHEDULE_CAPACITY`
    /// - `RMACOLL_MAX_SCHEDULE_BYTES`
    /// - `RMACOLL_WAIT_SPIN`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with variables read through
    /// `lookup`. Unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(algo) = parse_var("RMACOLL_A2AV_ALGO", &lookup) {
            cfg.a2av_algorithm = algo;
        }
        if let Some(t) = parse_var("RMACOLL_TAG_BASE", &lookup) {
            cfg.tag_base = t;
        }
        if let Some(t) = parse_var("RMACOLL_TAG_END", &lookup) {
            cfg.tag_end = t;
        }
        if let Some(n) = parse_var("RMACOLL_SCHEDULE_CAPACITY", &lookup) {
            cfg.schedule_capacity = n;
        }
        if let Some(n) = parse_var("RMACOLL_MAX_SCHEDULE_BYTES", &lookup) {
            cfg.max_schedule_bytes = n;
        }
        if let Some(n) = parse_var("RMACOLL_WAIT_SPIN", &lookup) {
            cfg.wait_spin = n;
        }

        if cfg.tag_end >= cfg.tag_base {
            tracing::warn!(
                tag_base = cfg.tag_base,
                tag_end = cfg.tag_end,
                "tag range is empty, falling back to defaults"
            );
            cfg.tag_base = DEFAULT_TAG_BASE;
            cfg.tag_end = DEFAULT_TAG_END;
        }

        cfg
    }
}

fn parse_var<T>(name: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable value: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RmaCollConfig::default();
        assert_eq!(cfg.a2av_algorithm, AlltoallvAlgorithm::TriggerPush);
        assert!(cfg.tag_end < cfg.tag_base);
        assert!(cfg.schedule_capacity <= cfg.max_schedule_bytes);
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_lookup_overrides() {
        let cfg = RmaCollConfig::from_lookup(lookup_from(&[
            ("RMACOLL_A2AV_ALGO", "linear_rget"),
            ("RMACOLL_TAG_BASE", "-100"),
            ("RMACOLL_TAG_END", "-200"),
            ("RMACOLL_SCHEDULE_CAPACITY", "1024"),
            ("RMACOLL_MAX_SCHEDULE_BYTES", "4096"),
            ("RMACOLL_WAIT_SPIN", " 8 "),
        ]));
        assert_eq!(cfg.a2av_algorithm, AlltoallvAlgorithm::LinearGet);
        assert_eq!((cfg.tag_base, cfg.tag_end), (-100, -200));
        assert_eq!(cfg.schedule_capacity, 1024);
        assert_eq!(cfg.max_schedule_bytes, 4096);
        assert_eq!(cfg.wait_spin, 8);
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let cfg = RmaCollConfig::from_lookup(lookup_from(&[
            ("RMACOLL_A2AV_ALGO", "bruck"),
            ("RMACOLL_TAG_BASE", "minus one"),
            ("RMACOLL_TAG_END", "-1.5"),
            ("RMACOLL_SCHEDULE_CAPACITY", "-4"),
            ("RMACOLL_MAX_SCHEDULE_BYTES", "64MiB"),
            ("RMACOLL_WAIT_SPIN", "abc"),
        ]));
        let def = RmaCollConfig::default();
        assert_eq!(cfg.a2av_algorithm, def.a2av_algorithm);
        assert_eq!((cfg.tag_base, cfg.tag_end), (def.tag_base, def.tag_end));
        assert_eq!(cfg.schedule_capacity, def.schedule_capacity);
        assert_eq!(cfg.max_schedule_bytes, def.max_schedule_bytes);
        assert_eq!(cfg.wait_spin, def.wait_spin);
    }

    #[test]
    fn test_empty_tag_range_falls_back() {
        let cfg = RmaCollConfig::from_lookup(lookup_from(&[
            ("RMACOLL_TAG_BASE", "-300"),
            ("RMACOLL_TAG_END", "-100"),
        ]));
        assert_eq!((cfg.tag_base, cfg.tag_end), (DEFAULT_TAG_BASE, DEFAULT_TAG_END));
    }
}
