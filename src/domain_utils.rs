//! Registrable-domain comparison and URL canonicalization helpers.
//!
//! Same-site decisions use the public suffix list, not naive label counting:
//! `www.example.co.uk` and `example.co.uk` are the same site, `a.github.io`
//! and `b.github.io` are not.

use url::Url;

/// Extract the registrable domain (effective TLD + one label) for a host.
///
/// Hosts the public suffix list cannot classify (IP literals, `localhost`)
/// are returned unchanged so comparisons still work for them.
pub fn registrable_domain(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    match psl::domain_str(&host) {
        Some(domain) => Some(domain.to_string()),
        None => Some(host),
    }
}

/// Registrable domain of a parsed URL's host, if it has one.
pub fn registrable_domain_of(url: &Url) -> Option<String> {
    url.host_str().and_then(registrable_domain)
}

/// Whether two URLs point at the same registrable domain.
pub fn same_registrable_domain(lhs: &Url, rhs: &Url) -> bool {
    match (registrable_domain_of(lhs), registrable_domain_of(rhs)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// String-typed variant used where the final URL comes straight from the
/// browser and may not be worth a hard parse failure.
pub fn same_registrable_domain_str(lhs: &str, rhs: &str) -> bool {
    match (Url::parse(lhs), Url::parse(rhs)) {
        (Ok(a), Ok(b)) => same_registrable_domain(&a, &b),
        _ => false,
    }
}

/// Canonical form of a URL: scheme + host(+port) + path, no query, no
/// fragment. Used as the stable per-page identity during a crawl.
pub fn canonical_form(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}

/// First path segment of a pathname, e.g. `/blog/post-1` -> `/blog`.
/// A single-segment path is returned whole.
pub fn base_path(pathname: &str) -> String {
    match pathname[1.min(pathname.len())..].find('/') {
        Some(idx) => pathname[..idx + 1].to_string(),
        None => pathname.to_string(),
    }
}

/// Number of slashes in a pathname; shallower paths sort first when
/// scheduling the next crawl depth.
pub fn slashes_count(pathname: &str) -> usize {
    pathname.matches('/').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registrable_domain_strips_subdomains() {
        assert_eq!(registrable_domain("www.example.com").as_deref(), Some("example.com"));
        assert_eq!(registrable_domain("a.b.example.com").as_deref(), Some("example.com"));
        assert_eq!(registrable_domain("example.com").as_deref(), Some("example.com"));
    }

    #[test]
    fn test_registrable_domain_honors_public_suffixes() {
        assert_eq!(
            registrable_domain("www.example.co.uk").as_deref(),
            Some("example.co.uk")
        );
        // github.io is a public suffix: different users are different sites
        assert_eq!(
            registrable_domain("alice.github.io").as_deref(),
            Some("alice.github.io")
        );
    }

    #[test]
    fn test_same_registrable_domain() {
        let a = Url::parse("https://www.example.com/about").unwrap();
        let b = Url::parse("https://example.com/").unwrap();
        let c = Url::parse("https://other.org/").unwrap();
        assert!(same_registrable_domain(&a, &b));
        assert!(!same_registrable_domain(&a, &c));
    }

    #[test]
    fn test_canonical_form_drops_query_and_fragment() {
        let url = Url::parse("https://example.com/a/b?q=1#frag").unwrap();
        assert_eq!(canonical_form(&url), "https://example.com/a/b");

        let with_port = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(canonical_form(&with_port), "http://example.com:8080/x");
    }

    #[test]
    fn test_base_path() {
        assert_eq!(base_path("/blog/post-1"), "/blog");
        assert_eq!(base_path("/blog"), "/blog");
        assert_eq!(base_path("/"), "/");
    }

    #[test]
    fn test_slashes_count_orders_shallow_first() {
        assert!(slashes_count("/a") < slashes_count("/a/b"));
        assert_eq!(slashes_count("/a/b/c"), 3);
    }
}
