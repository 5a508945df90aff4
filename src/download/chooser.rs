//! Mirror ordering and fallback policy.
//!
//! # Overview
//!
//! A [`MirrorChooser`] decides the order in which a request's mirrors are
//! tried. [`plan_attempts`] applies the rules every chooser shares (try-first
//! mirror, onion filtering, IPFS gateways) and produces [`MirrorAttempts`],
//! which the HTTP client walks until one mirror succeeds.
//!
//! The fallback loop stops early when trying another mirror cannot help:
//! a 403 on a request that carried credentials, a 404 from the designated
//! try-first mirror, or any [mirror-independent](DownloadError::is_mirror_independent)
//! error. Everything else moves on to the next mirror; the last mirror's error
//! is returned when all of them failed.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use dashmap::DashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use url::Url;

use super::error::DownloadError;
use super::mirror::Mirror;
use super::request::DownloadRequest;

/// Orders the mirrors of a request.
pub trait MirrorChooser: Send + Sync + Debug {
    /// Returns the request's mirrors in the order they should be attempted.
    fn order_mirrors(&self, request: &DownloadRequest) -> Vec<Mirror>;

    /// Called by the fallback loop for every failed attempt.
    fn report_failure(&self, _mirror: &Mirror) {}
}

/// Default strategy: a uniform shuffle, spreading load across mirrors.
#[derive(Debug)]
pub struct MirrorChooserRandom {
    rng: Mutex<StdRng>,
}

impl MirrorChooserRandom {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic ordering for tests.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for MirrorChooserRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorChooser for MirrorChooserRandom {
    fn order_mirrors(&self, request: &DownloadRequest) -> Vec<Mirror> {
        let mut mirrors = request.mirrors.clone();
        mirrors.shuffle(&mut *self.rng.lock().unwrap_or_else(PoisonError::into_inner));
        mirrors
    }
}

/// Source of the parameters used by [`MirrorChooserWithParameters`].
pub trait MirrorParameterManager: Send + Sync + Debug {
    /// Number of failures recorded for this mirror base URL.
    fn mirror_error_count(&self, base_url: &str) -> u32;

    /// Records one more failure for this mirror base URL.
    fn increment_mirror_error_count(&self, base_url: &str);

    /// Prefer mirrors outside the current location.
    fn prefer_foreign(&self) -> bool;

    /// ISO country code of the current location, if known.
    fn current_location(&self) -> Option<String>;
}

/// In-process [`MirrorParameterManager`]; error counts live for the process lifetime.
#[derive(Debug, Default)]
pub struct InMemoryMirrorParameters {
    error_counts: DashMap<String, u32>,
    prefer_foreign: bool,
    location: Option<String>,
}

impl InMemoryMirrorParameters {
    #[must_use]
    pub fn new(prefer_foreign: bool, location: Option<String>) -> Self {
        Self {
            error_counts: DashMap::new(),
            prefer_foreign,
            location: location.map(|l| l.to_ascii_uppercase()),
        }
    }
}

impl MirrorParameterManager for InMemoryMirrorParameters {
    fn mirror_error_count(&self, base_url: &str) -> u32 {
        self.error_counts.get(base_url).map_or(0, |count| *count)
    }

    fn increment_mirror_error_count(&self, base_url: &str) {
        *self.error_counts.entry(base_url.to_string()).or_insert(0) += 1;
    }

    fn prefer_foreign(&self) -> bool {
        self.prefer_foreign
    }

    fn current_location(&self) -> Option<String> {
        self.location.clone()
    }
}

/// Orders by historical error count, then by location, with random tie-breaking.
#[derive(Debug)]
pub struct MirrorChooserWithParameters<P> {
    parameters: P,
    rng: Mutex<StdRng>,
}

impl<P: MirrorParameterManager> MirrorChooserWithParameters<P> {
    pub fn new(parameters: P) -> Self {
        Self {
            parameters,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(parameters: P, seed: u64) -> Self {
        Self {
            parameters,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn parameters(&self) -> &P {
        &self.parameters
    }

    /// 0 sorts first. Unknown origin always sits between domestic and foreign.
    fn location_rank(&self, mirror: &Mirror, location: Option<&str>) -> u8 {
        let Some(location) = location else {
            return 0;
        };
        let domestic_first = !self.parameters.prefer_foreign();
        match mirror.country_code() {
            None => 1,
            Some(code) if code.eq_ignore_ascii_case(location) == domestic_first => 0,
            Some(_) => 2,
        }
    }
}

impl<P: MirrorParameterManager> MirrorChooser for MirrorChooserWithParameters<P> {
    fn order_mirrors(&self, request: &DownloadRequest) -> Vec<Mirror> {
        let mut mirrors = request.mirrors.clone();
        // Shuffle first: the stable sort below keeps this order among equal keys.
        mirrors.shuffle(&mut *self.rng.lock().unwrap_or_else(PoisonError::into_inner));
        let location = self.parameters.current_location();
        mirrors.sort_by(|a, b| {
            let errors = self
                .parameters
                .mirror_error_count(a.base_url())
                .cmp(&self.parameters.mirror_error_count(b.base_url()));
            if errors != Ordering::Equal {
                return errors;
            }
            self.location_rank(a, location.as_deref())
                .cmp(&self.location_rank(b, location.as_deref()))
        });
        mirrors
    }

    fn report_failure(&self, mirror: &Mirror) {
        self.parameters.increment_mirror_error_count(mirror.base_url());
    }
}

/// One planned attempt: a mirror and the concrete URL to fetch from it.
#[derive(Debug, Clone)]
pub struct MirrorAttempt {
    pub mirror: Mirror,
    pub url: Url,
}

/// The ordered attempts for one request together with its stop policy.
#[derive(Debug)]
pub struct MirrorAttempts {
    attempts: Vec<MirrorAttempt>,
    has_credentials: bool,
    try_first: Option<Mirror>,
}

impl MirrorAttempts {
    #[must_use]
    pub fn attempts(&self) -> &[MirrorAttempt] {
        &self.attempts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Decides what to do after `attempt` (at position `index`) failed with `error`.
    ///
    /// Returns the error back when the loop must stop, `Ok(())` to try the next mirror.
    ///
    /// # Errors
    ///
    /// Returns `error` when no further mirror may be tried.
    pub fn on_error(
        &self,
        index: usize,
        attempt: &MirrorAttempt,
        error: DownloadError,
    ) -> Result<(), DownloadError> {
        if error.is_mirror_independent() {
            return Err(error);
        }
        if self.has_credentials && error.is_forbidden() {
            debug!(mirror = %attempt.mirror, "credentials rejected, not trying other mirrors");
            return Err(error);
        }
        if error.is_not_found() && self.try_first.as_ref() == Some(&attempt.mirror) {
            debug!(mirror = %attempt.mirror, "not found on try-first mirror");
            return Err(error);
        }
        if index + 1 >= self.attempts.len() {
            return Err(error);
        }
        warn!(mirror = %attempt.mirror, url = %attempt.url, error = %error, "mirror failed, trying next");
        Ok(())
    }
}

/// Builds the attempt list for `request` using `chooser` for the base order.
///
/// # Errors
///
/// Returns [`DownloadError::NoMirrors`] when the request has no mirrors and
/// [`DownloadError::IpfsGatewayWithoutCid`] when only gateways remain and the
/// file has no CID.
pub fn plan_attempts(
    chooser: &dyn MirrorChooser,
    request: &DownloadRequest,
) -> Result<MirrorAttempts, DownloadError> {
    let name = &request.index_file.name;
    if request.mirrors.is_empty() {
        return Err(DownloadError::NoMirrors { name: name.clone() });
    }

    let mut ordered = chooser.order_mirrors(request);

    if request.proxy.is_none() && !ordered.iter().all(Mirror::is_onion) {
        ordered.retain(|m| !m.is_onion());
    }

    let try_first = request
        .try_first_mirror
        .as_ref()
        .filter(|first| ordered.contains(first))
        .cloned();
    if let Some(first) = &try_first
        && let Some(position) = ordered.iter().position(|m| m == first)
    {
        let mirror = ordered.remove(position);
        ordered.insert(0, mirror);
    }

    let cid = request.index_file.ipfs_cid_v1.as_deref();
    let attempts: Vec<MirrorAttempt> = ordered
        .into_iter()
        .filter_map(|mirror| {
            let url = if mirror.is_ipfs_gateway() {
                mirror.get_url(cid?)
            } else {
                mirror.get_url(name)
            };
            Some(MirrorAttempt { mirror, url })
        })
        .collect();

    if attempts.is_empty() {
        return Err(DownloadError::IpfsGatewayWithoutCid { name: name.clone() });
    }

    Ok(MirrorAttempts {
        attempts,
        has_credentials: request.has_credentials(),
        try_first,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::request::{IndexFile, ProxyConfig};

    fn request(mirrors: &[Mirror]) -> DownloadRequest {
        DownloadRequest::new(IndexFile::named("/index-v2.json"), mirrors.to_vec())
    }

    fn bases(attempts: &MirrorAttempts) -> Vec<String> {
        attempts
            .attempts()
            .iter()
            .map(|a| a.mirror.base_url().to_string())
            .collect()
    }

    #[test]
    fn test_plan_attempts_empty_mirrors_fails_fast() {
        let chooser = MirrorChooserRandom::with_seed(1);
        let err = plan_attempts(&chooser, &request(&[])).unwrap_err();
        assert!(matches!(err, DownloadError::NoMirrors { .. }));
    }

    #[test]
    fn test_random_chooser_is_deterministic_with_seed() {
        let mirrors: Vec<Mirror> = (0..8)
            .map(|i| Mirror::new(format!("https://m{i}.example.org/repo")))
            .collect();
        let a = MirrorChooserRandom::with_seed(42).order_mirrors(&request(&mirrors));
        let b = MirrorChooserRandom::with_seed(42).order_mirrors(&request(&mirrors));
        assert_eq!(a, b);
        assert_eq!(a.len(), mirrors.len());
    }

    #[test]
    fn test_try_first_mirror_moves_to_front() {
        let mirrors: Vec<Mirror> = (0..6)
            .map(|i| Mirror::new(format!("https://m{i}.example.org/repo")))
            .collect();
        let first = mirrors[4].clone();
        for seed in 0..10 {
            let chooser = MirrorChooserRandom::with_seed(seed);
            let req = request(&mirrors).with_try_first_mirror(Some(first.clone()));
            let attempts = plan_attempts(&chooser, &req).unwrap();
            assert_eq!(attempts.attempts()[0].mirror, first);
        }
    }

    #[test]
    fn test_try_first_mirror_not_in_candidates_is_ignored() {
        let mirrors = [Mirror::new("https://a.example.org/repo")];
        let chooser = MirrorChooserRandom::with_seed(3);
        let req = request(&mirrors)
            .with_try_first_mirror(Some(Mirror::new("https://elsewhere.example.org/repo")));
        let attempts = plan_attempts(&chooser, &req).unwrap();
        assert_eq!(bases(&attempts), vec!["https://a.example.org/repo"]);
    }

    #[test]
    fn test_onion_mirrors_filtered_without_proxy() {
        let mirrors = [
            Mirror::new("http://abc.onion/repo"),
            Mirror::new("https://a.example.org/repo"),
        ];
        let chooser = MirrorChooserRandom::with_seed(5);
        let attempts = plan_attempts(&chooser, &request(&mirrors)).unwrap();
        assert_eq!(bases(&attempts), vec!["https://a.example.org/repo"]);

        let with_proxy = request(&mirrors).with_proxy(Some(ProxyConfig::socks("127.0.0.1", 9050)));
        assert_eq!(plan_attempts(&chooser, &with_proxy).unwrap().len(), 2);
    }

    #[test]
    fn test_only_onion_mirrors_are_kept() {
        let mirrors = [Mirror::new("http://abc.onion/repo")];
        let chooser = MirrorChooserRandom::with_seed(5);
        let attempts = plan_attempts(&chooser, &request(&mirrors)).unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[test]
    fn test_gateway_skipped_without_cid() {
        let mirrors = [
            Mirror::ipfs_gateway("https://ipfs.example.org/ipfs"),
            Mirror::new("https://a.example.org/repo"),
        ];
        let chooser = MirrorChooserRandom::with_seed(9);
        let attempts = plan_attempts(&chooser, &request(&mirrors)).unwrap();
        assert_eq!(bases(&attempts), vec!["https://a.example.org/repo"]);
    }

    #[test]
    fn test_gateway_only_without_cid_fails() {
        let mirrors = [Mirror::ipfs_gateway("https://ipfs.example.org/ipfs")];
        let chooser = MirrorChooserRandom::with_seed(9);
        let err = plan_attempts(&chooser, &request(&mirrors)).unwrap_err();
        assert!(err.to_string().contains("Got IPFS gateway without CID"));
    }

    #[test]
    fn test_gateway_uses_cid_path() {
        let mirrors = [Mirror::ipfs_gateway("https://ipfs.example.org/ipfs/")];
        let mut req = request(&mirrors);
        req.index_file.ipfs_cid_v1 = Some("bafybeigdyrzt".to_string());
        let chooser = MirrorChooserRandom::with_seed(9);
        let attempts = plan_attempts(&chooser, &req).unwrap();
        assert_eq!(
            attempts.attempts()[0].url.as_str(),
            "https://ipfs.example.org/ipfs/bafybeigdyrzt"
        );
    }

    #[test]
    fn test_on_error_forbidden_with_credentials_stops() {
        let mirrors = [
            Mirror::new("https://a.example.org/repo"),
            Mirror::new("https://b.example.org/repo"),
        ];
        let req = request(&mirrors).with_credentials(Some("u".into()), Some("p".into()));
        let attempts = plan_attempts(&MirrorChooserRandom::with_seed(1), &req).unwrap();
        let first = &attempts.attempts()[0];
        let result = attempts.on_error(0, first, DownloadError::http_status("x", 403));
        assert!(result.is_err());

        let no_creds = plan_attempts(&MirrorChooserRandom::with_seed(1), &request(&mirrors)).unwrap();
        let first = &no_creds.attempts()[0];
        assert!(no_creds.on_error(0, first, DownloadError::http_status("x", 403)).is_ok());
    }

    #[test]
    fn test_on_error_not_found_on_try_first_stops() {
        let mirrors = [
            Mirror::new("https://a.example.org/repo"),
            Mirror::new("https://b.example.org/repo"),
        ];
        let req = request(&mirrors).with_try_first_mirror(Some(mirrors[1].clone()));
        let attempts = plan_attempts(&MirrorChooserRandom::with_seed(1), &req).unwrap();
        let first = &attempts.attempts()[0];
        assert!(attempts.on_error(0, first, DownloadError::http_status("x", 404)).is_err());

        let plain = plan_attempts(&MirrorChooserRandom::with_seed(1), &request(&mirrors)).unwrap();
        let first = &plain.attempts()[0];
        assert!(plain.on_error(0, first, DownloadError::http_status("x", 404)).is_ok());
    }

    #[test]
    fn test_on_error_last_mirror_rethrows() {
        let mirrors = [Mirror::new("https://a.example.org/repo")];
        let attempts = plan_attempts(&MirrorChooserRandom::with_seed(1), &request(&mirrors)).unwrap();
        let only = &attempts.attempts()[0];
        let err = attempts
            .on_error(0, only, DownloadError::timeout("https://a.example.org/repo/x"))
            .unwrap_err();
        assert!(matches!(err, DownloadError::Timeout { .. }));
    }

    #[test]
    fn test_parameters_chooser_orders_by_error_count() {
        let params = InMemoryMirrorParameters::new(false, None);
        params.increment_mirror_error_count("https://a.example.org/repo");
        params.increment_mirror_error_count("https://a.example.org/repo");
        params.increment_mirror_error_count("https://b.example.org/repo");
        let chooser = MirrorChooserWithParameters::with_seed(params, 7);
        let mirrors = [
            Mirror::new("https://a.example.org/repo"),
            Mirror::new("https://b.example.org/repo"),
            Mirror::new("https://c.example.org/repo"),
        ];
        let ordered: Vec<String> = chooser
            .order_mirrors(&request(&mirrors))
            .iter()
            .map(|m| m.base_url().to_string())
            .collect();
        assert_eq!(
            ordered,
            vec![
                "https://c.example.org/repo",
                "https://b.example.org/repo",
                "https://a.example.org/repo"
            ]
        );
    }

    #[test]
    fn test_parameters_chooser_domestic_unknown_foreign() {
        let mirrors = [
            Mirror::with_country("https://fr.example.org/repo", Some("FR".into())),
            Mirror::new("https://unknown.example.org/repo"),
            Mirror::with_country("https://de.example.org/repo", Some("DE".into())),
        ];
        let domestic = MirrorChooserWithParameters::with_seed(
            InMemoryMirrorParameters::new(false, Some("de".into())),
            11,
        );
        let ordered = domestic.order_mirrors(&request(&mirrors));
        assert_eq!(ordered[0].country_code(), Some("DE"));
        assert_eq!(ordered[1].country_code(), None);
        assert_eq!(ordered[2].country_code(), Some("FR"));

        let foreign = MirrorChooserWithParameters::with_seed(
            InMemoryMirrorParameters::new(true, Some("DE".into())),
            11,
        );
        let ordered = foreign.order_mirrors(&request(&mirrors));
        assert_eq!(ordered[0].country_code(), Some("FR"));
        assert_eq!(ordered[1].country_code(), None);
        assert_eq!(ordered[2].country_code(), Some("DE"));
    }

    #[test]
    fn test_parameters_chooser_report_failure_increments() {
        let chooser =
            MirrorChooserWithParameters::with_seed(InMemoryMirrorParameters::default(), 1);
        let mirror = Mirror::new("https://a.example.org/repo");
        chooser.report_failure(&mirror);
        chooser.report_failure(&mirror);
        assert_eq!(chooser.parameters().mirror_error_count(mirror.base_url()), 2);
    }
}
