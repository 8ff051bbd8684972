//! In-memory cookie jar.
//!
//! The jar is keyed by `(domain, path, name)` and applies RFC 6265
//! matching: domain-match (with host-only cookies pinned to their exact
//! host), path-match, the `Secure` attribute, and expiration. Parsing and
//! serialization of individual cookies is delegated to the `cookie`
//! crate; persistence across processes is out of scope.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use cookie::Cookie;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JarKey {
    domain: String,
    path: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    secure: bool,
    /// No `Domain` attribute was present; only the exact host matches.
    host_only: bool,
    expires_at: Option<SystemTime>,
}

impl StoredCookie {
    fn expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Thread-safe cookie store shared between requests.
#[derive(Debug, Default)]
pub struct CookieJar {
    store: Mutex<HashMap<JarKey, StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        CookieJar::default()
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.store.lock().unwrap().clear();
    }

    /// Record one `Set-Cookie` header value received from `url`.
    /// Malformed values are ignored.
    pub fn learn(&self, url: &Url, set_cookie: &str) {
        let Ok(parsed) = Cookie::parse(set_cookie.to_string()) else {
            tracing::debug!(value = set_cookie, "cookie: ignoring unparseable Set-Cookie");
            return;
        };
        let Some(host) = url.host_str() else { return };
        let host = host.to_ascii_lowercase();

        let (domain, host_only) = match parsed.domain() {
            Some(d) => {
                let d = d.trim_start_matches('.').to_ascii_lowercase();
                // A Domain attribute must cover the responding host.
                if !domain_match(&host, &d) {
                    tracing::debug!(domain = d, host = host, "cookie: domain attribute rejected");
                    return;
                }
                (d, false)
            }
            None => (host.clone(), true),
        };

        let path = match parsed.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_path(url),
        };

        let now = SystemTime::now();
        // Max-Age takes precedence over Expires.
        let expires_at = if let Some(max_age) = parsed.max_age() {
            let secs = max_age.whole_seconds();
            if secs <= 0 {
                Some(now)
            } else {
                Some(now + Duration::from_secs(secs as u64))
            }
        } else {
            match parsed.expires() {
                Some(cookie::Expiration::DateTime(dt)) => {
                    let unix = dt.unix_timestamp();
                    if unix <= 0 {
                        Some(SystemTime::UNIX_EPOCH)
                    } else {
                        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(unix as u64))
                    }
                }
                _ => None,
            }
        };

        let key = JarKey {
            domain,
            path,
            name: parsed.name().to_string(),
        };

        let mut store = self.store.lock().unwrap();
        // An already-expired cookie is a deletion request.
        if matches!(expires_at, Some(at) if at <= now) {
            store.remove(&key);
            return;
        }
        store.insert(
            key,
            StoredCookie {
                value: parsed.value().to_string(),
                secure: parsed.secure().unwrap_or(false),
                host_only,
                expires_at,
            },
        );
    }

    /// `Cookie` header value for a request to `url`, or `None` when no
    /// stored cookie matches.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let req_path = if url.path().is_empty() { "/" } else { url.path() };
        let secure_transport = url.scheme() == "https";
        let now = SystemTime::now();

        let mut store = self.store.lock().unwrap();
        store.retain(|_, c| !c.expired(now));

        let mut matched: Vec<(&JarKey, &StoredCookie)> = store
            .iter()
            .filter(|(key, c)| {
                let domain_ok = if c.host_only {
                    host == key.domain
                } else {
                    domain_match(&host, &key.domain)
                };
                domain_ok
                    && path_match(req_path, &key.path)
                    && (!c.secure || secure_transport)
            })
            .collect();

        if matched.is_empty() {
            return None;
        }
        // Longer paths first, per RFC 6265 §5.4; name order is tied by key.
        matched.sort_by(|a, b| b.0.path.len().cmp(&a.0.path.len()).then(a.0.name.cmp(&b.0.name)));

        let header = matched
            .iter()
            .map(|(key, c)| format!("{}={}", key.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        Some(header)
    }
}

/// RFC 6265 §5.1.3 domain matching: exact match, or `host` is a
/// dot-separated suffix of `domain`.
fn domain_match(host: &str, domain: &str) -> bool {
    host == domain || (host.ends_with(domain) && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 6265 §5.1.4 path matching.
fn path_match(req_path: &str, cookie_path: &str) -> bool {
    req_path == cookie_path
        || (req_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || req_path.as_bytes()[cookie_path.len()] == b'/'))
}

/// Default cookie path derived from the request URL (§5.1.4).
fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') || path.matches('/').count() == 1 {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}
