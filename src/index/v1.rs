//! Incremental processor for the legacy `index-v1.json`.
//!
//! V1 records are converted into the V2 model as they are parsed, so
//! receivers are shared between both formats.

use std::fmt;
use std::io::Read;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};

use super::error::IndexError;
use super::model::{AppV1, PackageV2, RepoV1};
use super::stream::{Emitter, IndexStreamReceiver};

/// Name of the signed V1 container.
pub const INDEX_V1_JAR: &str = "index-v1.jar";
/// Name of the payload inside [`INDEX_V1_JAR`].
pub const INDEX_V1_JSON: &str = "index-v1.json";

/// Streams the `repo` object and then each element of `apps` into a receiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexV1StreamProcessor;

impl IndexV1StreamProcessor {
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
        }
        .deserialize(&mut deserializer)
        .and_then(|()| deserializer.end());
        emitter.finish(result)
    }
}

struct IndexSeed<'a, 'r> {
    emitter: &'a mut Emitter<'r>,
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
        f.write_str("an index-v1 object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "repo" => {
                    let repo: RepoV1 = map.next_value()?;
                    self.emitter.repo::<A::Error>(repo.to_v2(), repo.version)?;
                }
                "apps" => {
                    if !self.emitter.repo_seen() {
                        return Err(de::Error::custom("apps before repo object"));
                    }
                    map.next_value_seed(AppsSeed {
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

struct AppsSeed<'a, 'r> {
    emitter: &'a mut Emitter<'r>,
}

impl<'de> DeserializeSeed<'de> for AppsSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for AppsSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of apps")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(app) = seq.next_element::<AppV1>()? {
            let package = PackageV2 {
                metadata: app.to_metadata_v2(),
            };
            self.emitter.package::<A::Error>(app.package_name, package)?;
        }
        Ok(())
    }
}
