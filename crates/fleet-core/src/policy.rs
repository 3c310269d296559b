//! Rollout policy — canaries, max-in-flight, watch windows, serial groups.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An instance quota given either as an absolute count or as a percentage
/// of the group size (`3` or `"30%"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuotaRepr", into = "QuotaRepr")]
pub enum Quota {
    Count(u32),
    Percent(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QuotaRepr {
    Count(u32),
    Text(String),
}

impl Quota {
    /// Resolve against a group of `total` instances. Percentages round down.
    pub fn resolve(&self, total: u32) -> u32 {
        match *self {
            Quota::Count(n) => n.min(total),
            Quota::Percent(p) => (u64::from(total) * u64::from(p) / 100) as u32,
        }
    }

    /// Like [`Quota::resolve`], but never below one.
    pub fn resolve_at_least_one(&self, total: u32) -> u32 {
        self.resolve(total).max(1)
    }
}

impl FromStr for Quota {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: u32 = pct
                .trim()
                .parse()
                .map_err(|_| format!("invalid percentage {s:?}"))?;
            if p > 100 {
                return Err(format!("percentage {s:?} exceeds 100%"));
            }
            Ok(Quota::Percent(p))
        } else {
            s.parse()
                .map(Quota::Count)
                .map_err(|_| format!("invalid count {s:?}"))
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Count(n) => write!(f, "{n}"),
            Quota::Percent(p) => write!(f, "{p}%"),
        }
    }
}

impl TryFrom<QuotaRepr> for Quota {
    type Error = String;

    fn try_from(repr: QuotaRepr) -> Result<Self, Self::Error> {
        match repr {
            QuotaRepr::Count(n) => Ok(Quota::Count(n)),
            QuotaRepr::Text(s) => s.parse(),
        }
    }
}

impl From<Quota> for QuotaRepr {
    fn from(q: Quota) -> Self {
        match q {
            Quota::Count(n) => QuotaRepr::Count(n),
            Quota::Percent(_) => QuotaRepr::Text(q.to_string()),
        }
    }
}

/// How a deployment (or a single instance group) rolls out changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Instances updated first, alone, to validate the change.
    #[serde(default = "default_canaries")]
    pub canaries: Quota,
    /// Upper bound on concurrently updating instances within a group.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: Quota,
    /// Window a canary must stay `running` for.
    #[serde(default = "default_watch_time_ms")]
    pub canary_watch_time_ms: u64,
    /// Window a non-canary instance must stay `running` for.
    #[serde(default = "default_watch_time_ms")]
    pub update_watch_time_ms: u64,
    /// Whether this group waits for the previous group to finish.
    #[serde(default = "default_serial")]
    pub serial: bool,
}

fn default_canaries() -> Quota {
    Quota::Count(1)
}

fn default_max_in_flight() -> Quota {
    Quota::Count(1)
}

fn default_watch_time_ms() -> u64 {
    1_000
}

fn default_serial() -> bool {
    true
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            canaries: default_canaries(),
            max_in_flight: default_max_in_flight(),
            canary_watch_time_ms: default_watch_time_ms(),
            update_watch_time_ms: default_watch_time_ms(),
            serial: default_serial(),
        }
    }
}

impl UpdatePolicy {
    /// Number of canaries for a group of `total` instances.
    pub fn canary_count(&self, total: u32) -> u32 {
        self.canaries.resolve(total)
    }

    /// Concurrency bound for a group of `total` instances.
    pub fn max_in_flight_for(&self, total: u32) -> u32 {
        self.max_in_flight.resolve_at_least_one(total)
    }

    pub fn canary_watch_time(&self) -> Duration {
        Duration::from_millis(self.canary_watch_time_ms)
    }

    pub fn update_watch_time(&self) -> Duration {
        Duration::from_millis(self.update_watch_time_ms)
    }

    /// Reject policies that could never make progress.
    pub fn validate(&self) -> Result<(), String> {
        match self.max_in_flight {
            Quota::Count(0) | Quota::Percent(0) => {
                Err("max_in_flight must be greater than zero".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_parses_counts_and_percentages() {
        assert_eq!("3".parse::<Quota>().unwrap(), Quota::Count(3));
        assert_eq!("30%".parse::<Quota>().unwrap(), Quota::Percent(30));
        assert_eq!(" 5 % ".parse::<Quota>().unwrap(), Quota::Percent(5));
        assert!("150%".parse::<Quota>().is_err());
        assert!("many".parse::<Quota>().is_err());
    }

    #[test]
    fn percentages_round_down() {
        assert_eq!(Quota::Percent(30).resolve(10), 3);
        assert_eq!(Quota::Percent(30).resolve(4), 1);
        assert_eq!(Quota::Percent(10).resolve(5), 0);
        assert_eq!(Quota::Percent(10).resolve_at_least_one(5), 1);
    }

    #[test]
    fn counts_are_capped_by_group_size() {
        assert_eq!(Quota::Count(5).resolve(3), 3);
        assert_eq!(Quota::Count(0).resolve_at_least_one(3), 1);
    }

    #[test]
    fn policy_from_toml_accepts_both_forms() {
        let policy: UpdatePolicy = toml::from_str(
            r#"
canaries = 2
max_in_flight = "25%"
canary_watch_time_ms = 500
serial = false
"#,
        )
        .unwrap();
        assert_eq!(policy.canaries, Quota::Count(2));
        assert_eq!(policy.max_in_flight, Quota::Percent(25));
        assert_eq!(policy.canary_watch_time(), Duration::from_millis(500));
        assert_eq!(policy.update_watch_time_ms, 1_000);
        assert!(!policy.serial);
        assert_eq!(policy.max_in_flight_for(8), 2);
    }

    #[test]
    fn quota_json_keeps_representation() {
        let json = serde_json::to_string(&Quota::Percent(40)).unwrap();
        assert_eq!(json, "\"40%\"");
        let json = serde_json::to_string(&Quota::Count(4)).unwrap();
        assert_eq!(json, "4");
    }

    #[test]
    fn zero_max_in_flight_is_rejected() {
        let policy = UpdatePolicy {
            max_in_flight: Quota::Count(0),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(UpdatePolicy::default().validate().is_ok());
    }
}
