//! Signed index containers.
//!
//! `entry.jar` and `index-v1.jar` are JAR-signed ZIP archives:
//!
//! - `META-INF/MANIFEST.MF` lists a digest of every entry, in a `Name:`
//!   section per entry
//! - `META-INF/<SIGNER>.SF` holds a digest of the whole manifest and of each
//!   manifest section
//! - `META-INF/<SIGNER>.RSA` (or `.DSA`, `.EC`) is a detached PKCS#7 signature
//!   over the `.SF` file that carries the signer's X.509 certificate
//!
//! The repository certificate is the DER encoding of that X.509 certificate.
//! The chain `signature block → .SF → manifest → payload` is checked link by
//! link. The certificate is self-signed, so its chain of trust is never
//! checked; pinning happens through the fingerprint.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509NameBuilder};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use zip::ZipArchive;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use super::error::IndexError;
use super::fingerprint::{check_fingerprint, fingerprint_of};

pub const MANIFEST: &str = "META-INF/MANIFEST.MF";

const SIGNER_NAME: &str = "META-INF/SIGNER";
const SIGNATURE_BLOCK_SUFFIXES: [&str; 3] = [".RSA", ".DSA", ".EC"];
const MANIFEST_LINE_LIMIT: usize = 72;

/// Identity of a successfully verified container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedJar {
    /// Lowercase hex of the DER-encoded signer certificate.
    pub certificate: String,
    /// Lowercase hex SHA-256 of the DER-encoded signer certificate.
    pub fingerprint: String,
}

/// Entry digests a JAR may carry, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
    Sha256,
    Sha1,
}

impl DigestAlgorithm {
    const ALL: [Self; 2] = [Self::Sha256, Self::Sha1];

    fn attribute(self, suffix: &str) -> String {
        let name = match self {
            Self::Sha256 => "SHA-256",
            Self::Sha1 => "SHA1",
        };
        format!("{name}{suffix}")
    }

    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha1 => Sha1::digest(bytes).to_vec(),
        }
    }

    fn digest_reader(self, reader: &mut dyn Read) -> io::Result<Vec<u8>> {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                io::copy(reader, &mut hasher)?;
                Ok(hasher.finalize().to_vec())
            }
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                io::copy(reader, &mut hasher)?;
                Ok(hasher.finalize().to_vec())
            }
        }
    }
}

/// One section of a manifest or signature file.
#[derive(Debug)]
struct Section<'a> {
    /// Bytes of the section including its terminating blank line.
    raw: &'a [u8],
    attributes: Vec<(String, String)>,
}

impl Section<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn name(&self) -> Option<&str> {
        self.get("Name")
    }

    /// The strongest `<algorithm><suffix>` attribute, decoded.
    fn digest(&self, suffix: &str) -> Result<Option<(DigestAlgorithm, Vec<u8>)>, IndexError> {
        for algorithm in DigestAlgorithm::ALL {
            if let Some(value) = self.get(&algorithm.attribute(suffix)) {
                let decoded = BASE64
                    .decode(value.trim())
                    .map_err(|e| IndexError::signing(format!("invalid digest encoding: {e}")))?;
                return Ok(Some((algorithm, decoded)));
            }
        }
        Ok(None)
    }
}

/// Returns the line starting at `pos` without its terminator, and the
/// position after the terminator.
fn next_line(bytes: &[u8], pos: usize) -> (&[u8], usize) {
    let rest = &bytes[pos..];
    match rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
        Some(end) => {
            let crlf = rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n');
            (&rest[..end], pos + end + if crlf { 2 } else { 1 })
        }
        None => (rest, bytes.len()),
    }
}

/// Splits a manifest or signature file into sections. The first section is
/// the main section.
fn parse_sections(bytes: &[u8]) -> Vec<Section<'_>> {
    let mut sections = Vec::new();
    let mut attributes: Vec<(String, String)> = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        let (line, next) = next_line(bytes, pos);
        if line.is_empty() {
            if !attributes.is_empty() {
                sections.push(Section {
                    raw: &bytes[start..next],
                    attributes: std::mem::take(&mut attributes),
                });
            }
            start = next;
        } else if let Some(continuation) = line.strip_prefix(b" ") {
            if let Some((_, value)) = attributes.last_mut() {
                value.push_str(&String::from_utf8_lossy(continuation));
            }
        } else if let Some((key, value)) = String::from_utf8_lossy(line).split_once(": ") {
            attributes.push((key.to_string(), value.to_string()));
        }
        pos = next;
    }
    if !attributes.is_empty() {
        sections.push(Section {
            raw: &bytes[start..],
            attributes,
        });
    }
    sections
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, IndexError> {
    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|source| IndexError::Container {
        path: path.to_path_buf(),
        source,
    })
}

fn entry_error(path: &Path, entry: &str, source: ZipError) -> IndexError {
    match source {
        ZipError::FileNotFound => IndexError::MissingEntry {
            path: path.to_path_buf(),
            entry: entry.to_string(),
        },
        source => IndexError::Container {
            path: path.to_path_buf(),
            source,
        },
    }
}

fn read_small_entry(
    archive: &mut ZipArchive<BufReader<File>>,
    path: &Path,
    entry: &str,
) -> Result<Vec<u8>, IndexError> {
    let mut file = archive
        .by_name(entry)
        .map_err(|e| entry_error(path, entry, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| IndexError::io(path, e))?;
    Ok(bytes)
}

fn is_signature_block(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    let upper = file.to_ascii_uppercase();
    !file.contains('/')
        && SIGNATURE_BLOCK_SUFFIXES
            .iter()
            .any(|suffix| upper.ends_with(suffix))
}

/// Name of the single signature block; containers with several signers are
/// rejected.
fn signature_block_name(archive: &ZipArchive<BufReader<File>>) -> Result<String, IndexError> {
    let mut blocks = archive.file_names().filter(|name| is_signature_block(name));
    let first = blocks
        .next()
        .ok_or_else(|| IndexError::signing("no signature block"))?
        .to_string();
    if blocks.next().is_some() {
        return Err(IndexError::signing("more than one signer"));
    }
    Ok(first)
}

/// Checks the PKCS#7 signature over the `.SF` file and returns the DER
/// certificate of its only signer.
fn verify_signature_block(block: &[u8], signature_file: &[u8]) -> Result<Vec<u8>, IndexError> {
    let signing = |context: &str| {
        let context = context.to_string();
        move |e: ErrorStack| IndexError::signing(format!("{context}: {e}"))
    };
    let pkcs7 = Pkcs7::from_der(block).map_err(signing("unreadable signature block"))?;
    let no_certificates = Stack::<X509>::new().map_err(signing("signature block"))?;
    let signers = pkcs7
        .signers(&no_certificates, Pkcs7Flags::empty())
        .map_err(signing("no signer certificate"))?;
    if signers.len() != 1 {
        return Err(IndexError::signing(format!(
            "expected one signer certificate, found {}",
            signers.len()
        )));
    }
    let certificate = signers
        .get(0)
        .ok_or_else(|| IndexError::signing("no signer certificate"))?
        .to_der()
        .map_err(signing("signer certificate"))?;

    let store = X509StoreBuilder::new()
        .map_err(signing("signature block"))?
        .build();
    pkcs7
        .verify(
            &no_certificates,
            &store,
            Some(signature_file),
            None,
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )
        .map_err(signing("bad signature"))?;
    Ok(certificate)
}

/// Checks that the `.SF` file covers the manifest, either as a whole or the
/// section of `payload_entry`.
fn verify_signature_file(
    signature_file: &[u8],
    manifest: &[u8],
    payload_entry: &str,
) -> Result<(), IndexError> {
    let sf_sections = parse_sections(signature_file);
    let main = sf_sections
        .first()
        .ok_or_else(|| IndexError::signing("empty signature file"))?;
    if let Some((algorithm, expected)) = main.digest("-Digest-Manifest")?
        && algorithm.digest(manifest) == expected
    {
        return Ok(());
    }

    let manifest_sections = parse_sections(manifest);
    let manifest_section = manifest_sections
        .iter()
        .find(|section| section.name() == Some(payload_entry))
        .ok_or_else(|| IndexError::signing(format!("{payload_entry} is not in the manifest")))?;
    let (algorithm, expected) = sf_sections
        .iter()
        .skip(1)
        .find(|section| section.name() == Some(payload_entry))
        .map(|section| section.digest("-Digest"))
        .transpose()?
        .flatten()
        .ok_or_else(|| IndexError::signing(format!("{payload_entry} is not signed")))?;
    if algorithm.digest(manifest_section.raw) != expected {
        return Err(IndexError::signing("manifest does not match signature file"));
    }
    Ok(())
}

/// Digest the manifest records for `payload_entry`.
fn manifest_digest(
    manifest: &[u8],
    payload_entry: &str,
) -> Result<(DigestAlgorithm, Vec<u8>), IndexError> {
    parse_sections(manifest)
        .iter()
        .skip(1)
        .find(|section| section.name() == Some(payload_entry))
        .map(|section| section.digest("-Digest"))
        .transpose()?
        .flatten()
        .ok_or_else(|| IndexError::signing(format!("no manifest digest for {payload_entry}")))
}

/// Verifies the JAR signature of `payload_entry` and pins the certificate.
///
/// With `expected_fingerprint` set, the certificate must match it; without it
/// the embedded certificate is trusted on first use.
///
/// # Errors
///
/// [`IndexError::Signing`] for a missing or invalid signature,
/// [`IndexError::FingerprintMismatch`] for a valid signature by the wrong key.
#[instrument(skip(path, expected_fingerprint), fields(path = %path.display()))]
pub fn verify_jar(
    path: &Path,
    payload_entry: &str,
    expected_fingerprint: Option<&str>,
) -> Result<VerifiedJar, IndexError> {
    let mut archive = open_archive(path)?;
    if archive.index_for_name(payload_entry).is_none() {
        return Err(entry_error(path, payload_entry, ZipError::FileNotFound));
    }

    let block_name = signature_block_name(&archive)?;
    let stem = block_name
        .rsplit_once('.')
        .map_or(block_name.as_str(), |(stem, _)| stem);
    let sf_name = format!("{stem}.SF");
    let block = read_small_entry(&mut archive, path, &block_name)?;
    let signature_file = read_small_entry(&mut archive, path, &sf_name)
        .map_err(|e| IndexError::signing(format!("no signature file: {e}")))?;
    let manifest = read_small_entry(&mut archive, path, MANIFEST)
        .map_err(|e| IndexError::signing(format!("no manifest: {e}")))?;

    let certificate = verify_signature_block(&block, &signature_file)?;
    verify_signature_file(&signature_file, &manifest, payload_entry)?;

    let (algorithm, expected) = manifest_digest(&manifest, payload_entry)?;
    let actual = {
        let mut payload = archive
            .by_name(payload_entry)
            .map_err(|e| entry_error(path, payload_entry, e))?;
        algorithm
            .digest_reader(&mut payload)
            .map_err(|e| IndexError::io(path, e))?
    };
    if actual != expected {
        return Err(IndexError::signing(format!(
            "{payload_entry} does not match its manifest digest"
        )));
    }

    let fingerprint = fingerprint_of(&certificate);
    check_fingerprint(expected_fingerprint, &[], &fingerprint)?;
    debug!(fingerprint = %fingerprint, "signed container verified");

    Ok(VerifiedJar {
        certificate: hex::encode(certificate),
        fingerprint,
    })
}

/// Reads a whole entry into memory. Use for small payloads such as `entry.json`.
///
/// # Errors
///
/// Returns an error if the archive or entry cannot be read.
pub fn read_entry(path: &Path, entry: &str) -> Result<Vec<u8>, IndexError> {
    let mut archive = open_archive(path)?;
    read_small_entry(&mut archive, path, entry)
}

/// Runs `f` with a streaming reader over one entry.
///
/// # Errors
///
/// Returns an error if the archive or entry cannot be opened, or whatever `f` returns.
pub fn with_entry<T>(
    path: &Path,
    entry: &str,
    f: impl FnOnce(&mut dyn Read) -> Result<T, IndexError>,
) -> Result<T, IndexError> {
    let mut archive = open_archive(path)?;
    let mut file = archive
        .by_name(entry)
        .map_err(|e| entry_error(path, entry, e))?;
    f(&mut file)
}

/// A key and self-signed certificate for signing local repositories.
pub struct JarSigner {
    key: PKey<Private>,
    certificate: X509,
}

impl std::fmt::Debug for JarSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JarSigner").finish_non_exhaustive()
    }
}

impl JarSigner {
    /// Generates an RSA key with a self-signed certificate for `common_name`.
    ///
    /// # Errors
    ///
    /// [`IndexError::Crypto`] if key generation or certificate signing fails.
    pub fn generate(common_name: &str) -> Result<Self, IndexError> {
        let key = PKey::from_rsa(Rsa::generate(2048)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let serial_number = BigNum::from_u32(1)?.to_asn1_integer()?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(10_000)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            key,
            certificate: builder.build(),
        })
    }

    /// DER encoding of the certificate, the form repositories are pinned by.
    ///
    /// # Errors
    ///
    /// [`IndexError::Crypto`] if the certificate cannot be encoded.
    pub fn certificate_der(&self) -> Result<Vec<u8>, IndexError> {
        Ok(self.certificate.to_der()?)
    }

    fn sign(&self, signature_file: &[u8]) -> Result<Vec<u8>, IndexError> {
        let no_certificates = Stack::<X509>::new()?;
        let pkcs7 = Pkcs7::sign(
            &self.certificate,
            &self.key,
            &no_certificates,
            signature_file,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOSMIMECAP,
        )?;
        Ok(pkcs7.to_der()?)
    }
}

/// Appends `key: value` wrapped at the manifest line limit.
fn push_attribute(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{key}: {value}");
    let bytes = line.as_bytes();
    let (first, mut rest) = bytes.split_at(bytes.len().min(MANIFEST_LINE_LIMIT));
    out.extend_from_slice(first);
    out.extend_from_slice(b"\r\n");
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(MANIFEST_LINE_LIMIT - 1));
        out.push(b' ');
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
        rest = tail;
    }
}

/// Writes a JAR-signed container with `payload` stored as `payload_entry`.
///
/// # Errors
///
/// Returns an error if signing fails or the file cannot be written.
pub fn write_signed_jar(
    path: &Path,
    payload_entry: &str,
    payload: &[u8],
    signer: &JarSigner,
) -> Result<(), IndexError> {
    let algorithm = DigestAlgorithm::Sha256;
    let digest_key = algorithm.attribute("-Digest");

    let mut manifest = Vec::new();
    push_attribute(&mut manifest, "Manifest-Version", "1.0");
    push_attribute(&mut manifest, "Created-By", "fdroid-repo");
    manifest.extend_from_slice(b"\r\n");
    let section_start = manifest.len();
    push_attribute(&mut manifest, "Name", payload_entry);
    push_attribute(&mut manifest, &digest_key, &BASE64.encode(algorithm.digest(payload)));
    manifest.extend_from_slice(b"\r\n");

    let mut signature_file = Vec::new();
    push_attribute(&mut signature_file, "Signature-Version", "1.0");
    push_attribute(
        &mut signature_file,
        &algorithm.attribute("-Digest-Manifest"),
        &BASE64.encode(algorithm.digest(&manifest)),
    );
    push_attribute(&mut signature_file, "Created-By", "fdroid-repo");
    signature_file.extend_from_slice(b"\r\n");
    push_attribute(&mut signature_file, "Name", payload_entry);
    push_attribute(
        &mut signature_file,
        &digest_key,
        &BASE64.encode(algorithm.digest(&manifest[section_start..])),
    );
    signature_file.extend_from_slice(b"\r\n");

    let block = signer.sign(&signature_file)?;

    let file = File::create(path).map_err(|e| IndexError::io(path, e))?;
    let mut writer = zip::ZipWriter::new(file);
    let container_error = |source| IndexError::Container {
        path: path.to_path_buf(),
        source,
    };
    let sf_name = format!("{SIGNER_NAME}.SF");
    let block_name = format!("{SIGNER_NAME}.RSA");
    for (name, bytes) in [
        (MANIFEST, manifest.as_slice()),
        (sf_name.as_str(), signature_file.as_slice()),
        (block_name.as_str(), block.as_slice()),
        (payload_entry, payload),
    ] {
        writer
            .start_file(name, SimpleFileOptions::default())
            .map_err(container_error)?;
        writer.write_all(bytes).map_err(|e| IndexError::io(path, e))?;
    }
    writer.finish().map_err(container_error)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::LazyLock;

    use super::*;
    use tempfile::TempDir;

    static SIGNER: LazyLock<JarSigner> = LazyLock::new(|| JarSigner::generate("repo").unwrap());
    static OTHER_SIGNER: LazyLock<JarSigner> =
        LazyLock::new(|| JarSigner::generate("other").unwrap());

    fn repack(source: &Path, target: &Path, replace: &[(&str, &[u8])], extra: &[(&str, &[u8])]) {
        let mut archive = open_archive(source).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let mut writer = zip::ZipWriter::new(File::create(target).unwrap());
        for name in names {
            let bytes = match replace.iter().find(|(n, _)| *n == name) {
                Some((_, bytes)) => bytes.to_vec(),
                None => read_small_entry(&mut archive, source, &name).unwrap(),
            };
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(&bytes).unwrap();
        }
        for (name, bytes) in extra {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_signed_jar_verifies_and_reports_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.jar");
        write_signed_jar(&path, "entry.json", br#"{"a":1}"#, &SIGNER).unwrap();

        let verified = verify_jar(&path, "entry.json", None).unwrap();
        let der = SIGNER.certificate_der().unwrap();
        assert_eq!(verified.certificate, hex::encode(&der));
        assert_eq!(verified.fingerprint, fingerprint_of(&der));
        assert_eq!(read_entry(&path, "entry.json").unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn test_signed_jar_expected_fingerprint_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.jar");
        write_signed_jar(&path, "entry.json", b"{}", &SIGNER).unwrap();

        let other = fingerprint_of(&OTHER_SIGNER.certificate_der().unwrap());
        let err = verify_jar(&path, "entry.json", Some(&other)).unwrap_err();
        assert!(matches!(err, IndexError::FingerprintMismatch { .. }), "{err}");

        let own = fingerprint_of(&SIGNER.certificate_der().unwrap()).to_uppercase();
        verify_jar(&path, "entry.json", Some(&own)).unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_manifest_digest() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("signed.jar");
        write_signed_jar(&signed, "entry.json", b"{\"v\":1}", &SIGNER).unwrap();
        let tampered = dir.path().join("tampered.jar");
        repack(&signed, &tampered, &[("entry.json", b"{\"v\":2}")], &[]);

        let err = verify_jar(&tampered, "entry.json", None).unwrap_err();
        assert!(matches!(err, IndexError::Signing { .. }), "{err}");
    }

    #[test]
    fn test_tampered_manifest_fails_signature_file() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("signed.jar");
        write_signed_jar(&signed, "entry.json", b"{\"v\":1}", &SIGNER).unwrap();
        let digest = BASE64.encode(Sha256::digest(b"{\"v\":2}"));
        let manifest = format!(
            "Manifest-Version: 1.0\r\n\r\nName: entry.json\r\nSHA-256-Digest: {digest}\r\n\r\n"
        );
        let tampered = dir.path().join("tampered.jar");
        repack(
            &signed,
            &tampered,
            &[(MANIFEST, manifest.as_bytes()), ("entry.json", b"{\"v\":2}")],
            &[],
        );

        let err = verify_jar(&tampered, "entry.json", None).unwrap_err();
        assert!(err.to_string().contains("manifest does not match"), "{err}");
    }

    #[test]
    fn test_tampered_signature_file_fails_signature_block() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("signed.jar");
        write_signed_jar(&signed, "entry.json", b"{}", &SIGNER).unwrap();
        let mut signature_file = read_entry(&signed, "META-INF/SIGNER.SF").unwrap();
        signature_file.extend_from_slice(b"X-Extra: 1\r\n\r\n");
        let tampered = dir.path().join("tampered.jar");
        repack(&signed, &tampered, &[("META-INF/SIGNER.SF", &signature_file)], &[]);

        let err = verify_jar(&tampered, "entry.json", None).unwrap_err();
        assert!(err.to_string().contains("bad signature"), "{err}");
    }

    #[test]
    fn test_second_signer_rejected() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("signed.jar");
        write_signed_jar(&signed, "entry.json", b"{}", &SIGNER).unwrap();
        let block = read_entry(&signed, "META-INF/SIGNER.RSA").unwrap();
        let doubled = dir.path().join("doubled.jar");
        repack(&signed, &doubled, &[], &[("META-INF/OTHER.RSA", &block)]);

        let err = verify_jar(&doubled, "entry.json", None).unwrap_err();
        assert!(err.to_string().contains("more than one signer"), "{err}");
    }

    #[test]
    fn test_unsigned_zip_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.jar");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer.start_file("entry.json", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"{}").unwrap();
        writer.finish().unwrap();

        let err = verify_jar(&path, "entry.json", None).unwrap_err();
        assert!(matches!(err, IndexError::Signing { .. }), "{err}");
        assert!(err.is_signing_failure());
    }

    #[test]
    fn test_missing_payload_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.jar");
        write_signed_jar(&path, "entry.json", b"{}", &SIGNER).unwrap();
        let err = verify_jar(&path, "index-v1.json", None).unwrap_err();
        assert!(matches!(err, IndexError::MissingEntry { .. }), "{err}");
    }

    #[test]
    fn test_not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.jar");
        std::fs::write(&path, b"<html>not found</html>").unwrap();
        let err = verify_jar(&path, "entry.json", None).unwrap_err();
        assert!(matches!(err, IndexError::Container { .. }), "{err}");
    }

    #[test]
    fn test_sections_join_continuation_lines() {
        let mut manifest = Vec::new();
        push_attribute(&mut manifest, "Manifest-Version", "1.0");
        manifest.extend_from_slice(b"\r\n");
        let long_name = format!("assets/{}/index-v1.json", "x".repeat(90));
        push_attribute(&mut manifest, "Name", &long_name);
        push_attribute(&mut manifest, "SHA1-Digest", "AAAA");
        manifest.extend_from_slice(b"\r\n");

        let sections = parse_sections(&manifest);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].name(), Some(long_name.as_str()));
        let (algorithm, digest) = sections[1].digest("-Digest").unwrap().unwrap();
        assert_eq!(algorithm, DigestAlgorithm::Sha1);
        assert_eq!(digest, vec![0, 0, 0]);
        assert!(sections[1].raw.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn test_sections_accept_bare_newlines() {
        let sections = parse_sections(b"Signature-Version: 1.0\n\nName: a\nSHA-256-Digest: x\n");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].get("signature-version"), Some("1.0"));
        assert_eq!(sections[1].name(), Some("a"));
    }
}
