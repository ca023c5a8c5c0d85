use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};

use crate::drain::DrainSettings;
use crate::retry::RetryPolicy;

const TIME_FORMAT: &str = "%H:%M";

/// Run configuration, loaded once per process and passed down by reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub sender_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Link to the ledger included in contact emails.
    #[serde(default)]
    pub ledger_url: String,
    #[serde(deserialize_with = "hours_minutes")]
    pub detention_start: NaiveTime,
    #[serde(deserialize_with = "hours_minutes")]
    pub detention_end: NaiveTime,
    /// Redirects every notification here and disables calendar sync.
    #[serde(default)]
    pub debug_recipient_email: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub drain: DrainSettings,
    #[serde(default)]
    pub outbox_dir: Option<PathBuf>,
}

fn default_from_name() -> String {
    "WPS Behaviour".to_string()
}

fn hours_minutes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
    let text = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(text.trim(), TIME_FORMAT).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.detention_end > self.detention_start,
            "detentionEnd must be after detentionStart"
        );
        anyhow::ensure!(!self.sender_email.trim().is_empty(), "senderEmail must be set");
        anyhow::ensure!(self.retry.max_attempts > 0, "retry.maxAttempts must be positive");
        Ok(())
    }

    /// Recipient after applying the debug override.
    pub fn recipient<'a>(&'a self, intended: &'a str) -> &'a str {
        self.debug_recipient_email.as_deref().unwrap_or(intended)
    }

    pub fn calendar_enabled(&self) -> bool {
        self.debug_recipient_email.is_none()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        sender_email: "behaviour@school.test".to_string(),
        from_name: default_from_name(),
        ledger_url: "https://ledger.school.test/behaviour".to_string(),
        detention_start: NaiveTime::from_hms_opt(12, 40, 0).unwrap(),
        detention_end: NaiveTime::from_hms_opt(13, 10, 0).unwrap(),
        debug_recipient_email: None,
        retry: RetryPolicy::immediate(2),
        drain: DrainSettings::immediate(),
        outbox_dir: None,
    }
}
