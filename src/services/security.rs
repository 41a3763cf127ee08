use crate::constants::{protocols::ALLOWED_HTTP, security as security_constants};
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::logger::Logger;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

fn default_max_response_bytes() -> u64 {
    security_constants::MAX_RESPONSE_BYTES
}

/// Process-wide outbound policy, loaded as the `security` section of the
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
    /// Hosts (exact match) that may resolve to loopback/private ranges.
    #[serde(default)]
    pub allow_private_hosts: Vec<String>,
    /// Hosts denied outright, exact or dot-suffix match.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: default_max_response_bytes(),
            allow_private_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityGuard {
    logger: Logger,
}

impl SecurityGuard {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("security"),
        }
    }

    /// Pre-flight check on a fully resolved target URL. Order: scheme, then
    /// private/loopback target, then block-list, then the per-API host
    /// allow-list. Any failure means the request is never sent.
    pub fn check(
        &self,
        url: &Url,
        config: &SecurityConfig,
        allowed_hosts: Option<&[String]>,
    ) -> Result<(), ToolError> {
        if !ALLOWED_HTTP.contains(&url.scheme()) {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "SCHEME_BLOCKED",
                format!("URL scheme is not allowed: {}", url.scheme()),
            )
            .with_hint("Only http and https targets are supported."));
        }

        let Some(host) = url.host() else {
            return Err(ToolError::invalid_params("URL has no host"));
        };
        let host_text = host_to_string(&host);

        if is_private_target(&host)
            && !config
                .allow_private_hosts
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&host_text))
        {
            self.logger.warn(
                "Blocked private target",
                Some(&serde_json::json!({ "host": host_text })),
            );
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "TARGET_BLOCKED",
                format!("Target host resolves to a private address: {}", host_text),
            )
            .with_hint(
                "Add the host to security.allow_private_hosts if this internal target is intended.",
            ));
        }

        if config
            .blocked_hosts
            .iter()
            .any(|blocked| domain_matches(&host_text, blocked))
        {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "HOST_BLOCKED",
                format!("Target host is on the block list: {}", host_text),
            ));
        }

        if let Some(allowed) = allowed_hosts {
            if !allowed.is_empty()
                && !allowed
                    .iter()
                    .any(|candidate| domain_matches(&host_text, candidate))
            {
                return Err(ToolError::new(
                    ToolErrorKind::Denied,
                    "HOST_NOT_ALLOWED",
                    format!("Target host is not in the API's allow list: {}", host_text),
                ));
            }
        }

        Ok(())
    }

    pub fn response_too_large(&self, limit: u64) -> ToolError {
        ToolError::new(
            ToolErrorKind::Denied,
            "RESPONSE_TOO_LARGE",
            format!("Response exceeds the configured ceiling of {} bytes", limit),
        )
        .with_hint("Raise security.max_response_bytes if this API legitimately returns more.")
    }
}

fn host_to_string(host: &Host<&str>) -> String {
    match host {
        Host::Domain(domain) => domain.to_lowercase(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    }
}

/// Exact or dot-suffix match, so `allowed_hosts: ["example.com"]` covers
/// `api.example.com` but not `notexample.com`.
fn domain_matches(host: &str, candidate: &str) -> bool {
    let candidate = candidate.trim().to_lowercase();
    if candidate.is_empty() {
        return false;
    }
    host == candidate || host.ends_with(&format!(".{}", candidate))
}

fn is_private_target(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let lowered = domain.to_lowercase();
            lowered == "localhost" || lowered.ends_with(".localhost")
        }
        Host::Ipv4(addr) => ipv4_is_private(*addr),
        Host::Ipv6(addr) => ipv6_is_private(*addr),
    }
}

fn ipv4_is_private(addr: Ipv4Addr) -> bool {
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
}

fn ipv6_is_private(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    if let Some(mapped) = addr.to_ipv4() {
        if ipv4_is_private(mapped) {
            return true;
        }
    }
    let first = addr.segments()[0];
    // fc00::/7 unique-local, fe80::/10 link-local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SecurityGuard {
        SecurityGuard::new(Logger::new("test"))
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("test url")
    }

    #[test]
    fn loopback_and_metadata_targets_are_blocked_by_default() {
        let config = SecurityConfig::default();
        for target in [
            "http://127.0.0.1/latest",
            "http://169.254.169.254/latest/meta-data",
            "http://localhost:8080/",
            "http://10.0.0.4/internal",
            "http://[::1]/",
        ] {
            let err = guard().check(&url(target), &config, None).unwrap_err();
            assert_eq!(err.code, "TARGET_BLOCKED", "target: {}", target);
        }
    }

    #[test]
    fn allow_listed_private_host_passes() {
        let config = SecurityConfig {
            allow_private_hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        };
        assert!(guard()
            .check(&url("http://127.0.0.1:9000/x"), &config, None)
            .is_ok());
        assert!(guard()
            .check(&url("http://169.254.169.254/"), &config, None)
            .is_err());
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let config = SecurityConfig::default();
        let err = guard()
            .check(&url("ftp://example.com/file"), &config, None)
            .unwrap_err();
        assert_eq!(err.code, "SCHEME_BLOCKED");
    }

    #[test]
    fn api_allow_list_matches_exact_and_subdomains() {
        let config = SecurityConfig::default();
        let allowed = vec!["example.com".to_string()];
        assert!(guard()
            .check(&url("https://example.com/v1"), &config, Some(&allowed))
            .is_ok());
        assert!(guard()
            .check(&url("https://api.example.com/v1"), &config, Some(&allowed))
            .is_ok());
        let err = guard()
            .check(&url("https://notexample.com/v1"), &config, Some(&allowed))
            .unwrap_err();
        assert_eq!(err.code, "HOST_NOT_ALLOWED");
    }

    #[test]
    fn blocked_hosts_take_precedence_over_allow_list() {
        let config = SecurityConfig {
            blocked_hosts: vec!["bad.example.com".to_string()],
            ..Default::default()
        };
        let allowed = vec!["example.com".to_string()];
        let err = guard()
            .check(
                &url("https://bad.example.com/v1"),
                &config,
                Some(&allowed),
            )
            .unwrap_err();
        assert_eq!(err.code, "HOST_BLOCKED");
    }
}
