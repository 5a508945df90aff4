//! Wire types for `entry.json`, `index-v2.json` and `index-v1.json`.
//!
//! Unknown fields are ignored everywhere so newer index producers stay
//! readable. V1 records are converted into the V2 model before they are
//! emitted, so consumers only ever see V2 types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Locale used when a document does not localize a value.
pub const DEFAULT_LOCALE: &str = "en-US";

/// Locale → text.
pub type LocalizedText = BTreeMap<String, String>;

/// Locale → file.
pub type LocalizedFile = BTreeMap<String, FileV2>;

/// Picks the best value for `locale`: exact match, same language, the
/// default locale, any English variant, then whatever comes first.
#[must_use]
pub fn localized<'a, T>(values: &'a BTreeMap<String, T>, locale: &str) -> Option<&'a T> {
    if let Some(value) = values.get(locale) {
        return Some(value);
    }
    let language = locale.split(['-', '_']).next().unwrap_or(locale);
    values
        .iter()
        .find(|(key, _)| key.split(['-', '_']).next() == Some(language))
        .map(|(_, value)| value)
        .or_else(|| values.get(DEFAULT_LOCALE))
        .or_else(|| {
            values
                .iter()
                .find(|(key, _)| key.starts_with("en"))
                .map(|(_, value)| value)
        })
        .or_else(|| values.values().next())
}

/// A file referenced from an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileV2 {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs_cid_v1: Option<String>,
}

impl FileV2 {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: None,
            size: None,
            ipfs_cid_v1: None,
        }
    }
}

/// An index file described by the signed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFileV2 {
    pub name: String,
    pub sha256: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs_cid_v1: Option<String>,
    #[serde(default)]
    pub num_packages: u64,
}

/// Contents of `entry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub timestamp: i64,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i32>,
    pub index: EntryFileV2,
    #[serde(default)]
    pub diffs: BTreeMap<String, EntryFileV2>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorV2 {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

/// An anti-feature, category or release channel declared by a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeV2 {
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub description: LocalizedText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<LocalizedFile>,
}

/// The `repo` object of `index-v2.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoV2 {
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<LocalizedFile>,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_base_url: Option<String>,
    #[serde(default)]
    pub description: LocalizedText,
    #[serde(default)]
    pub mirrors: Vec<MirrorV2>,
    pub timestamp: i64,
    #[serde(default)]
    pub anti_features: BTreeMap<String, AttributeV2>,
    #[serde(default)]
    pub categories: BTreeMap<String, AttributeV2>,
    #[serde(default)]
    pub release_channels: BTreeMap<String, AttributeV2>,
}

/// App metadata shared by all versions of a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataV2 {
    #[serde(default)]
    pub name: LocalizedText,
    #[serde(default)]
    pub summary: LocalizedText,
    #[serde(default)]
    pub description: LocalizedText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<LocalizedFile>,
    #[serde(default)]
    pub added: i64,
    #[serde(default)]
    pub last_updated: i64,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

/// One entry of the `packages` object. Versions are not needed for previews or
/// app listings and are skipped while parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageV2 {
    pub metadata: MetadataV2,
}

/// The `repo` object of `index-v1.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoV1 {
    pub timestamp: i64,
    pub version: i64,
    #[serde(default, rename = "maxage", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i32>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl RepoV1 {
    /// Converts into the V2 model. Texts land in [`DEFAULT_LOCALE`].
    #[must_use]
    pub fn to_v2(&self) -> RepoV2 {
        RepoV2 {
            name: single_locale(&self.name),
            icon: self.icon.as_ref().map(|icon| {
                BTreeMap::from([(DEFAULT_LOCALE.to_string(), FileV2::named(format!("/icons/{icon}")))])
            }),
            address: self.address.clone(),
            web_base_url: None,
            description: single_locale(&self.description),
            mirrors: self
                .mirrors
                .iter()
                .map(|url| MirrorV2 {
                    url: url.clone(),
                    country_code: None,
                })
                .collect(),
            timestamp: self.timestamp,
            anti_features: BTreeMap::new(),
            categories: BTreeMap::new(),
            release_channels: BTreeMap::new(),
        }
    }
}

/// Per-locale fields of a V1 app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// One element of the `apps` array of `index-v1.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppV1 {
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub localized: BTreeMap<String, LocalizedV1>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

impl AppV1 {
    /// Converts into V2 metadata. Top-level texts land in [`DEFAULT_LOCALE`];
    /// `localized` entries override them per locale.
    #[must_use]
    pub fn to_metadata_v2(&self) -> MetadataV2 {
        let mut name = self.name.as_deref().map(single_locale).unwrap_or_default();
        let mut summary = self.summary.as_deref().map(single_locale).unwrap_or_default();
        let mut description = self
            .description
            .as_deref()
            .map(single_locale)
            .unwrap_or_default();
        let mut icon: LocalizedFile = self
            .icon
            .as_ref()
            .map(|icon| {
                BTreeMap::from([(DEFAULT_LOCALE.to_string(), FileV2::named(format!("/icons/{icon}")))])
            })
            .unwrap_or_default();

        for (locale, values) in &self.localized {
            if let Some(value) = &values.name {
                name.insert(locale.clone(), value.clone());
            }
            if let Some(value) = &values.summary {
                summary.insert(locale.clone(), value.clone());
            }
            if let Some(value) = &values.description {
                description.insert(locale.clone(), value.clone());
            }
            if let Some(value) = &values.icon {
                icon.insert(
                    locale.clone(),
                    FileV2::named(format!("/{}/{locale}/{value}", self.package_name)),
                );
            }
        }

        MetadataV2 {
            name,
            summary,
            description,
            icon: (!icon.is_empty()).then_some(icon),
            added: self.added.unwrap_or_default(),
            last_updated: self.last_updated.or(self.added).unwrap_or_default(),
            categories: self.categories.clone(),
            license: self.license.clone(),
            web_site: self.web_site.clone(),
            source_code: self.source_code.clone(),
        }
    }
}

fn single_locale(text: &str) -> LocalizedText {
    if text.is_empty() {
        return LocalizedText::new();
    }
    BTreeMap::from([(DEFAULT_LOCALE.to_string(), text.to_string())])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_localized_fallback_order() {
        let values = BTreeMap::from([
            ("de".to_string(), "Hallo".to_string()),
            ("en-US".to_string(), "Hello".to_string()),
            ("fr-FR".to_string(), "Bonjour".to_string()),
        ]);
        assert_eq!(localized(&values, "de").unwrap(), "Hallo");
        assert_eq!(localized(&values, "de-AT").unwrap(), "Hallo");
        assert_eq!(localized(&values, "fr").unwrap(), "Bonjour");
        assert_eq!(localized(&values, "ja").unwrap(), "Hello");
        assert!(localized(&BTreeMap::<String, String>::new(), "en-US").is_none());
    }

    #[test]
    fn test_entry_deserializes_and_ignores_unknown_fields() {
        let json = r#"{
            "timestamp": 1700000000000,
            "version": 20002,
            "index": {"name": "/index-v2.json", "sha256": "ab", "size": 12, "numPackages": 3},
            "diffs": {},
            "somethingNew": true
        }"#;
        let entry: Entry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.version, 20002);
        assert_eq!(entry.index.name, "/index-v2.json");
        assert_eq!(entry.index.num_packages, 3);
        assert_eq!(entry.max_age, None);
    }

    #[test]
    fn test_repo_v1_to_v2() {
        let json = r#"{"timestamp": 5, "version": 21, "name": "Test", "icon": "icon.png",
            "address": "https://example.org/fdroid/repo", "description": "Desc",
            "mirrors": ["https://mirror.example.org/fdroid/repo"]}"#;
        let v1: RepoV1 = serde_json::from_str(json).unwrap();
        let v2 = v1.to_v2();
        assert_eq!(v2.name.get(DEFAULT_LOCALE).unwrap(), "Test");
        assert_eq!(
            v2.icon.unwrap().get(DEFAULT_LOCALE).unwrap().name,
            "/icons/icon.png"
        );
        assert_eq!(v2.mirrors[0].url, "https://mirror.example.org/fdroid/repo");
        assert_eq!(v2.timestamp, 5);
    }

    #[test]
    fn test_app_v1_localized_overrides() {
        let json = r#"{"packageName": "org.example.app", "name": "App", "summary": "Sum",
            "added": 10, "localized": {"de": {"name": "Anwendung", "icon": "icon.png"}}}"#;
        let app: AppV1 = serde_json::from_str(json).unwrap();
        let metadata = app.to_metadata_v2();
        assert_eq!(metadata.name.get(DEFAULT_LOCALE).unwrap(), "App");
        assert_eq!(metadata.name.get("de").unwrap(), "Anwendung");
        assert_eq!(metadata.summary.get(DEFAULT_LOCALE).unwrap(), "Sum");
        assert_eq!(metadata.last_updated, 10);
        assert_eq!(
            metadata.icon.unwrap().get("de").unwrap().name,
            "/org.example.app/de/icon.png"
        );
    }
}
