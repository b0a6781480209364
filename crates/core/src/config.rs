//! Runtime knobs read from `MERIDIAN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeridianConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Applied to webhooks that do not declare `timeoutSeconds`.
    pub webhook_timeout_secs: u64,
    /// Length of the random suffix appended to `namePrefix`.
    pub name_suffix_len: usize,
}

impl Default for MeridianConfig {
    fn default() -> Self {
        Self { default_page_size: 50, max_page_size: 500, webhook_timeout_secs: 10, name_suffix_len: 5 }
    }
}

impl MeridianConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_page_size = env_parse("MERIDIAN_MAX_PAGE_SIZE").filter(|v: &usize| *v > 0).unwrap_or(d.max_page_size);
        Self {
            default_page_size: env_parse("MERIDIAN_DEFAULT_PAGE_SIZE").filter(|v: &usize| *v > 0).unwrap_or(d.default_page_size).min(max_page_size),
            max_page_size,
            webhook_timeout_secs: env_parse("MERIDIAN_WEBHOOK_TIMEOUT_SECS").unwrap_or(d.webhook_timeout_secs),
            name_suffix_len: env_parse("MERIDIAN_NAME_SUFFIX_LEN").filter(|v: &usize| (1..=32).contains(v)).unwrap_or(d.name_suffix_len),
        }
    }

    pub fn webhook_timeout(&self) -> Duration { Duration::from_secs(self.webhook_timeout_secs.max(1)) }

    /// Clamp a requested page size into `1..=max_page_size`, defaulting when absent or zero.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(0) | None => self.default_page_size,
            Some(n) => n.min(self.max_page_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped() {
        let c = MeridianConfig::default();
        assert_eq!(c.page_size(None), 50);
        assert_eq!(c.page_size(Some(0)), 50);
        assert_eq!(c.page_size(Some(7)), 7);
        assert_eq!(c.page_size(Some(10_000)), 500);
    }
}
