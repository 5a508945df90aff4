//! Persisted repository records and transient preview records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::index::fingerprint::fingerprint_of_hex;
use crate::index::localized;
use crate::index::model::{
    AttributeV2, FileV2, LocalizedFile, LocalizedText, MetadataV2, MirrorV2, RepoV2,
};

static REPO_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new("repo/?$").expect("static regex")
});

/// Index format a repository was last read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormatVersion {
    One,
    Two,
}

impl IndexFormatVersion {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::One => "ONE",
            Self::Two => "TWO",
        }
    }
}

impl fmt::Display for IndexFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexFormatVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE" => Ok(Self::One),
            "TWO" => Ok(Self::Two),
            other => Err(format!("unknown index format version: {other}")),
        }
    }
}

/// Per-user settings of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPreferences {
    /// Higher weights are listed and preferred first.
    pub weight: i64,
    pub enabled: bool,
    pub last_updated: Option<i64>,
    pub last_etag: Option<String>,
    /// Mirrors added by the user, not announced by the repository.
    pub user_mirrors: Vec<String>,
    pub disabled_mirrors: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RepositoryPreferences {
    fn default() -> Self {
        Self {
            weight: 0,
            enabled: true,
            last_updated: None,
            last_etag: None,
            user_mirrors: Vec::new(),
            disabled_mirrors: Vec::new(),
            username: None,
            password: None,
        }
    }
}

/// A repository, either stored or previewed during a fetch.
///
/// Repositories are identified by their signing certificate: two addresses
/// served with the same certificate are the same repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Row id; 0 for previews that were never stored.
    pub repo_id: i64,
    pub address: String,
    pub web_base_url: Option<String>,
    pub timestamp: i64,
    pub version: i64,
    pub format_version: Option<IndexFormatVersion>,
    pub max_age: Option<i32>,
    pub name: LocalizedText,
    pub description: LocalizedText,
    pub icon: Option<LocalizedFile>,
    /// Lowercase hex of the signing certificate.
    pub certificate: Option<String>,
    pub mirrors: Vec<MirrorV2>,
    pub anti_features: BTreeMap<String, AttributeV2>,
    pub categories: BTreeMap<String, AttributeV2>,
    pub release_channels: BTreeMap<String, AttributeV2>,
    pub preferences: RepositoryPreferences,
}

impl Repository {
    /// Builds a preview from a verified index.
    #[must_use]
    pub fn from_index(
        repo: RepoV2,
        version: i64,
        format_version: IndexFormatVersion,
        certificate: &str,
    ) -> Self {
        Self {
            repo_id: 0,
            address: repo.address,
            web_base_url: repo.web_base_url,
            timestamp: repo.timestamp,
            version,
            format_version: Some(format_version),
            max_age: None,
            name: repo.name,
            description: repo.description,
            icon: repo.icon,
            certificate: Some(certificate.to_ascii_lowercase()),
            mirrors: repo.mirrors,
            anti_features: repo.anti_features,
            categories: repo.categories,
            release_channels: repo.release_channels,
            preferences: RepositoryPreferences::default(),
        }
    }

    /// Name in `locale`, falling back through the usual locale chain.
    #[must_use]
    pub fn name(&self, locale: &str) -> Option<&str> {
        localized(&self.name, locale).map(String::as_str)
    }

    #[must_use]
    pub fn description(&self, locale: &str) -> Option<&str> {
        localized(&self.description, locale).map(String::as_str)
    }

    /// Fingerprint of the certificate, if the repository has been verified.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.certificate.as_deref().and_then(fingerprint_of_hex)
    }

    #[must_use]
    pub fn is_archive_repo(&self) -> bool {
        self.address.trim_end_matches('/').ends_with("/archive")
    }

    /// Address of the companion archive repository.
    #[must_use]
    pub fn archive_address(&self) -> String {
        REPO_SUFFIX.replace(&self.address, "archive").into_owned()
    }

    /// Official mirror URLs, which always include the canonical address.
    #[must_use]
    pub fn official_mirror_urls(&self) -> Vec<String> {
        let mut urls = vec![self.address.clone()];
        for mirror in &self.mirrors {
            if !urls.contains(&mirror.url) {
                urls.push(mirror.url.clone());
            }
        }
        urls
    }

    /// Whether `url` is the address, an official mirror or a user mirror.
    #[must_use]
    pub fn knows_url(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        let same = |other: &str| other.trim_end_matches('/') == url;
        same(&self.address)
            || self.mirrors.iter().any(|mirror| same(&mirror.url))
            || self.preferences.user_mirrors.iter().any(|mirror| same(mirror))
    }
}

/// App record shown while previewing a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimalApp {
    pub repo_id: i64,
    pub package_name: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub icon: Option<FileV2>,
}

impl MinimalApp {
    /// Resolves the texts of `metadata` for `locale`.
    #[must_use]
    pub fn from_metadata(
        repo_id: i64,
        package_name: String,
        metadata: &MetadataV2,
        locale: &str,
    ) -> Self {
        Self {
            repo_id,
            package_name,
            name: localized(&metadata.name, locale).cloned(),
            summary: localized(&metadata.summary, locale).cloned(),
            icon: metadata
                .icon
                .as_ref()
                .and_then(|icon| localized(icon, locale))
                .cloned(),
        }
    }
}

/// Fields of a repository row created by the add flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub address: String,
    pub format_version: Option<IndexFormatVersion>,
    pub name: LocalizedText,
    pub description: LocalizedText,
    pub icon: Option<LocalizedFile>,
    pub certificate: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl NewRepository {
    /// Takes everything that identifies the repository from a preview.
    #[must_use]
    pub fn from_preview(
        repo: &Repository,
        username: Option<String>,
        password: Option<String>,
    ) -> Option<Self> {
        Some(Self {
            address: repo.address.clone(),
            format_version: repo.format_version,
            name: repo.name.clone(),
            description: repo.description.clone(),
            icon: repo.icon.clone(),
            certificate: repo.certificate.clone()?,
            username,
            password,
        })
    }
}

/// Outcome of applying an index to a stored repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexUpdateResult {
    /// The stored repository is already at this index's timestamp.
    Unchanged,
    Processed { app_count: u64 },
    /// The repository was stored but its index could not be applied; the next
    /// update will retry.
    Failed { reason: String },
}
