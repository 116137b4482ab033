//! Domain policy: restricted-domain rules, the explicit allow-list, SSRF
//! protection, and URL categorisation.

use std::net::IpAddr;
use std::sync::LazyLock;

use citeflow_shared::{CiteflowError, DocumentCategory, Result, SamplerConfig};
use regex::Regex;
use url::Url;

static ACADEMIC_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(^|\.)(edu|ac\.[a-z]{2}|edu\.[a-z]{2}|doi\.org|arxiv\.org|jstor\.org|ssrn\.com|semanticscholar\.org|researchgate\.net|scholar\.google\.com|springer\.com|wiley\.com|sciencedirect\.com)$",
    )
    .expect("static regex")
});

static REPORT_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\.pdf$|/reports?/|/publications?/|white-?paper|working-?paper)")
        .expect("static regex")
});

/// Outcome of checking a URL against the policy, before any network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerdict {
    /// Not restricted; may be fetched.
    Open,
    /// Restricted domain that is explicitly allow-listed; may be fetched.
    AllowListed,
    /// Restricted domain not on the allow-list; skip without fetching.
    Restricted,
    /// Non-HTTP scheme or private/loopback target; skip without fetching.
    Unsafe,
}

impl DomainVerdict {
    pub fn may_fetch(&self) -> bool {
        matches!(self, Self::Open | Self::AllowListed)
    }
}

/// Restricted-domain patterns plus an explicit allow-list.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    restricted: Vec<Regex>,
    allowed: Vec<String>,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_private_hosts: bool,
}

impl DomainPolicy {
    /// Compile the restricted patterns. Allow-list entries are host names,
    /// matched exactly or as a parent domain.
    pub fn new(restricted_patterns: &[String], allowed_domains: &[String]) -> Result<Self> {
        let restricted = restricted_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    CiteflowError::config(format!("invalid restricted domain pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let allowed = allowed_domains
            .iter()
            .map(|d| d.trim().trim_start_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(Self {
            restricted,
            allowed,
            allow_private_hosts: false,
        })
    }

    pub fn from_config(config: &SamplerConfig) -> Result<Self> {
        Self::new(
            &config.restricted_domain_patterns,
            &config.allowed_restricted_domains,
        )
    }

    /// Allow crawling localhost/private IPs.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub fn evaluate(&self, url: &Url) -> DomainVerdict {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            return DomainVerdict::Unsafe;
        }
        if !matches!(url.scheme(), "http" | "https") {
            return DomainVerdict::Unsafe;
        }

        let host = host_of(url);
        if !self.is_restricted_host(&host) {
            DomainVerdict::Open
        } else if self.is_allow_listed(&host) {
            DomainVerdict::AllowListed
        } else {
            DomainVerdict::Restricted
        }
    }

    pub fn is_restricted_host(&self, host: &str) -> bool {
        self.restricted.iter().any(|re| re.is_match(host))
    }

    pub fn is_allow_listed(&self, host: &str) -> bool {
        self.allowed
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }

    /// Coarse category from domain and path cues.
    pub fn categorize(&self, url: &Url) -> DocumentCategory {
        let host = host_of(url);
        if self.is_restricted_host(&host) {
            DocumentCategory::Government
        } else if ACADEMIC_HOST.is_match(&host) {
            DocumentCategory::Academic
        } else if REPORT_PATH.is_match(url.path()) {
            DocumentCategory::Report
        } else {
            DocumentCategory::Web
        }
    }
}

fn host_of(url: &Url) -> String {
    url.host_str()
        .unwrap_or("")
        .trim_end_matches('.')
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: &[&str]) -> DomainPolicy {
        let config = SamplerConfig::default();
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        DomainPolicy::new(&config.restricted_domain_patterns, &allowed).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn government_domains_are_restricted() {
        let p = policy(&[]);
        assert_eq!(p.evaluate(&url("https://ministry.gov/doc")), DomainVerdict::Restricted);
        assert_eq!(p.evaluate(&url("https://stats.gov.uk/x")), DomainVerdict::Restricted);
        assert_eq!(p.evaluate(&url("https://army.mil/")), DomainVerdict::Restricted);
        assert_eq!(
            p.evaluate(&url("https://www.interieur.gouv.fr/")),
            DomainVerdict::Restricted
        );
        assert_eq!(p.evaluate(&url("https://governance.org/")), DomainVerdict::Open);
        assert_eq!(p.evaluate(&url("https://example.com/gov")), DomainVerdict::Open);
    }

    #[test]
    fn allow_list_matches_host_and_subdomains() {
        let p = policy(&["census.gov"]);
        assert_eq!(
            p.evaluate(&url("https://census.gov/data")),
            DomainVerdict::AllowListed
        );
        assert_eq!(
            p.evaluate(&url("https://www.census.gov/data")),
            DomainVerdict::AllowListed
        );
        assert_eq!(
            p.evaluate(&url("https://notcensus.gov/data")),
            DomainVerdict::Restricted
        );
    }

    #[test]
    fn private_targets_are_unsafe() {
        let p = policy(&[]);
        assert_eq!(p.evaluate(&url("file:///etc/passwd")), DomainVerdict::Unsafe);
        assert_eq!(p.evaluate(&url("http://127.0.0.1:8080/")), DomainVerdict::Unsafe);
        assert_eq!(p.evaluate(&url("http://10.0.0.1/")), DomainVerdict::Unsafe);
        assert_eq!(p.evaluate(&url("http://localhost:3000/")), DomainVerdict::Unsafe);
        assert_eq!(p.evaluate(&url("http://[::1]/")), DomainVerdict::Unsafe);

        let p = p.allow_private_hosts();
        assert_eq!(p.evaluate(&url("http://127.0.0.1:8080/")), DomainVerdict::Open);
        assert_eq!(p.evaluate(&url("ftp://example.com/")), DomainVerdict::Unsafe);
    }

    #[test]
    fn categorize_by_domain_and_path() {
        let p = policy(&[]);
        assert_eq!(
            p.categorize(&url("https://www.ons.gov.uk/report.pdf")),
            DocumentCategory::Government
        );
        assert_eq!(
            p.categorize(&url("https://doi.org/10.1000/182")),
            DocumentCategory::Academic
        );
        assert_eq!(
            p.categorize(&url("https://www.ox.ac.uk/research")),
            DocumentCategory::Academic
        );
        assert_eq!(
            p.categorize(&url("https://think.example.org/publications/housing")),
            DocumentCategory::Report
        );
        assert_eq!(
            p.categorize(&url("https://news.example.com/story")),
            DocumentCategory::Web
        );
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = DomainPolicy::new(&["(unclosed".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("invalid restricted domain pattern"));
    }
}
