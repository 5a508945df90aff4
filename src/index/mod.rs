//! Signed index verification and incremental parsing.
//!
//! # Overview
//!
//! Two index formats exist:
//!
//! - **V2**: a small signed [`ENTRY_JAR`] names the real index file with its
//!   SHA-256 and size. The index itself is unsigned; its integrity comes from
//!   the digest in the signed entry.
//! - **V1**: a single signed [`INDEX_V1_JAR`] containing the whole index.
//!
//! [`jar`] verifies signed containers, [`fingerprint`] pins certificates, and
//! [`IndexV2StreamProcessor`] / [`IndexV1StreamProcessor`] stream records into
//! an [`IndexStreamReceiver`] without materializing the document.

mod error;
pub mod fingerprint;
pub mod jar;
pub mod model;
mod stream;
mod v1;
mod v2;

pub use error::IndexError;
pub use fingerprint::{check_fingerprint, fingerprint_of, known_fingerprint};
pub use jar::{JarSigner, VerifiedJar, verify_jar, write_signed_jar};
pub use model::{
    DEFAULT_LOCALE, Entry, EntryFileV2, FileV2, MetadataV2, MirrorV2, PackageV2, RepoV2, localized,
};
pub use stream::{
    ChannelIndexReceiver, HashingReader, IndexEvent, IndexStreamReceiver, join_index_processor,
    spawn_index_processor,
};
pub use v1::{INDEX_V1_JAR, INDEX_V1_JSON, IndexV1StreamProcessor};
pub use v2::{ENTRY_JAR, ENTRY_JSON, IndexV2StreamProcessor};
