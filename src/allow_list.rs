//! Allow-list of base domains with subdomain inheritance.

use std::collections::BTreeSet;

/// Set of normalized base domains. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowSet {
    domains: BTreeSet<String>,
}

impl AllowSet {
    /// Build from raw domain strings; entries that normalize to nothing are dropped.
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn to_set(&self) -> BTreeSet<String> {
        self.domains.clone()
    }
}

/// Lowercase and trim a domain, dropping a URL scheme, trailing slashes and
/// the root dot. Returns `None` if nothing is left.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut domain = raw.trim().to_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = domain.strip_prefix(scheme) {
            domain = rest.to_string();
            break;
        }
    }

    let domain = domain.trim_end_matches('/').trim_end_matches('.').trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

/// True if `hostname` equals an allowed entry or is a subdomain of one.
pub fn is_allowed(hostname: &str, allow_set: &AllowSet) -> bool {
    let host = hostname.trim().to_lowercase();
    if host.is_empty() {
        return false;
    }
    if allow_set.contains(&host) {
        return true;
    }

    allow_set
        .iter()
        .any(|domain| host.ends_with(&format!(".{}", domain)))
}
