//! Incremental processor for `index-v2.json`.

use std::fmt;
use std::io::Read;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, Visitor};

use super::error::IndexError;
use super::model::{PackageV2, RepoV2};
use super::stream::{Emitter, IndexStreamReceiver};

/// Name of the signed entry container.
pub const ENTRY_JAR: &str = "entry.jar";
/// Name of the payload inside [`ENTRY_JAR`].
pub const ENTRY_JSON: &str = "entry.json";

/// Streams the `repo` object and then each package of a V2 index into a
/// receiver without holding the document in memory. The `repo` object must
/// precede `packages`.
#[derive(Debug, Clone, Copy)]
pub struct IndexV2StreamProcessor {
    version: i64,
}

impl IndexV2StreamProcessor {
    /// `version` is the repository version announced by the signed entry.
    #[must_use]
    pub fn new(version: i64) -> Self {
        Self { version }
    }

    /// Parses `reader` to the end.
    ///
    /// # Errors
    ///
    /// [`IndexError::Parse`] for malformed documents,
    /// [`IndexError::MissingRepository`] when no `repo` object was found, or
    /// the receiver's own error.
    pub fn process<R: Read>(
        &self,
        reader: R,
        receiver: &mut dyn IndexStreamReceiver,
    ) -> Result<(), IndexError> {
        let mut emitter = Emitter::new(receiver);
        let mut deserializer = serde_json::Deserializer::from_reader(reader);
        let result = IndexSeed {
            emitter: &mut emitter,
            version: self.version,
        }
        .deserialize(&mut deserializer)
        .and_then(|()| deserializer.end());
        emitter.finish(result)
    }
}

struct IndexSeed<'a, 'r> {
    emitter: &'a mut Emitter<'r>,
    version: i64,
}

impl<'de> DeserializeSeed<'de> for IndexSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for IndexSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an index-v2 object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "repo" => {
                    let repo: RepoV2 = map.next_value()?;
                    self.emitter.repo::<A::Error>(repo, self.version)?;
                }
                "packages" => {
                    if !self.emitter.repo_seen() {
                        return Err(de::Error::custom("packages before repo object"));
                    }
                    map.next_value_seed(PackagesSeed {
                        emitter: &mut *self.emitter,
                    })?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct PackagesSeed<'a, 'r> {
    emitter: &'a mut Emitter<'r>,
}

impl<'de> DeserializeSeed<'de> for PackagesSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for PackagesSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of packages")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(package_name) = map.next_key::<String>()? {
            let package: PackageV2 = map.next_value()?;
            self.emitter.package::<A::Error>(package_name, package)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        fail_after: Option<usize>,
    }

    impl IndexStreamReceiver for Recorder {
        fn receive_repo(&mut self, repo: RepoV2, version: i64) -> Result<(), IndexError> {
            self.events.push(format!("repo {} {version}", repo.address));
            Ok(())
        }

        fn receive_package(&mut self, name: String, _: PackageV2) -> Result<(), IndexError> {
            if self.fail_after == Some(self.events.len() - 1) {
                return Err(IndexError::ReceiverClosed);
            }
            self.events.push(format!("package {name}"));
            Ok(())
        }

        fn on_stream_ended(&mut self) -> Result<(), IndexError> {
            self.events.push("end".to_string());
            Ok(())
        }
    }

    const INDEX: &str = r#"{
        "repo": {"name": {"en-US": "Test"}, "address": "https://example.org/fdroid/repo", "timestamp": 1},
        "packages": {
            "org.example.a": {"metadata": {"name": {"en-US": "A"}, "added": 1, "lastUpdated": 2}, "versions": {"x": {}}},
            "org.example.b": {"metadata": {"added": 3, "lastUpdated": 4}}
        }
    }"#;

    #[test]
    fn test_v2_emits_repo_then_packages_then_end() {
        let mut recorder = Recorder::default();
        IndexV2StreamProcessor::new(20001)
            .process(INDEX.as_bytes(), &mut recorder)
            .unwrap();
        assert_eq!(
            recorder.events,
            vec![
                "repo https://example.org/fdroid/repo 20001",
                "package org.example.a",
                "package org.example.b",
                "end"
            ]
        );
    }

    #[test]
    fn test_v2_receiver_error_is_returned_unchanged() {
        let mut recorder = Recorder {
            fail_after: Some(1),
            ..Recorder::default()
        };
        let err = IndexV2StreamProcessor::new(1)
            .process(INDEX.as_bytes(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, IndexError::ReceiverClosed), "{err}");
        assert_eq!(recorder.events.len(), 2);
    }

    #[test]
    fn test_v2_packages_before_repo_rejected() {
        let json = r#"{"packages": {}, "repo": {"address": "a", "timestamp": 1}}"#;
        let err = IndexV2StreamProcessor::new(1)
            .process(json.as_bytes(), &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, IndexError::Parse(_)), "{err}");
    }

    #[test]
    fn test_v2_missing_repo() {
        let err = IndexV2StreamProcessor::new(1)
            .process(r#"{"other": 1}"#.as_bytes(), &mut Recorder::default())
            .unwrap_err();
        assert!(matches!(err, IndexError::MissingRepository), "{err}");
    }

    #[test]
    fn test_v2_truncated_document_fails_after_partial_emission() {
        let truncated = &INDEX[..INDEX.find("org.example.b").unwrap()];
        let mut recorder = Recorder::default();
        let err = IndexV2StreamProcessor::new(1)
            .process(truncated.as_bytes(), &mut recorder)
            .unwrap_err();
        assert!(matches!(err, IndexError::Parse(_)), "{err}");
        assert!(!recorder.events.contains(&"end".to_string()));
    }
}
