//! Account and link metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Account details returned by `userinfo`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "userid")]
    pub user_id: u64,
    pub email: String,
    #[serde(rename = "emailverified", default)]
    pub email_verified: bool,
    /// Total quota in bytes
    pub quota: u64,
    #[serde(rename = "usedquota")]
    pub used_quota: u64,
    #[serde(default)]
    pub premium: bool,
}

impl UserInfo {
    pub fn free_quota(&self) -> u64 {
        self.quota.saturating_sub(self.used_quota)
    }
}

/// Time-limited download link for a file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileLink {
    pub hosts: Vec<String>,
    pub path: String,
    #[serde(deserialize_with = "timestamp::required")]
    pub expires: DateTime<Utc>,
}

impl FileLink {
    /// All download URLs, best host first.
    pub fn urls(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|host| format!("https://{}{}", host, self.path))
            .collect()
    }

    pub fn best_url(&self) -> Option<String> {
        self.hosts
            .first()
            .map(|host| format!("https://{}{}", host, self.path))
    }

    pub fn is_expired(&self) -> bool {
        self.expires <= Utc::now()
    }
}

/// Options for generating a [`FileLink`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Serve with `Content-Disposition: attachment`.
    pub force_download: bool,
    /// Leave the file name out of the link path.
    pub skip_filename: bool,
    /// Override the served content type.
    pub content_type: Option<String>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    pub fn skip_filename(mut self, skip: bool) -> Self {
        self.skip_filename = skip;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// RFC 2822 timestamps as used by the API (`Thu, 21 Mar 2013 18:31:45 +0000`)
pub(crate) mod timestamp {
    use super::*;
    use serde::de::Error;

    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc2822(value).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc2822()
    }

    pub fn required<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse(&raw).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

pub use timestamp::format as format_timestamp;
