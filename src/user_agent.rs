//! Shared User-Agent string for repository HTTP traffic.

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://f-droid.org";

/// Default User-Agent for index and entry requests.
#[must_use]
pub(crate) fn default_repo_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("fdroid-repo/{version} (+{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version_and_project_url() {
        let ua = default_repo_user_agent();
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL: {ua}");
        assert_eq!(
            Some(env!("CARGO_PKG_VERSION")),
            ua.strip_prefix("fdroid-repo/")
                .and_then(|s| s.split(' ').next()),
            "UA must contain crate version"
        );
    }
}
