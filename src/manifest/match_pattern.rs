//! Chrome match patterns (`<scheme>://<host>/<path>`).
//!
//! Used to validate `content_scripts[].matches` and to decide which open
//! pages a content-script update reaches.

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

/// Schemes matched by `*` in the scheme position.
const WILDCARD_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];

/// Schemes matched by `<all_urls>`.
const ALL_URL_SCHEMES: &[&str] = &["http", "https", "ws", "wss", "ftp", "file"];

const KNOWN_SCHEMES: &[&str] = &["http", "https", "ws", "wss", "ftp", "file", "urn"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemePattern {
    Any,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    /// `*.example.com`, which also matches `example.com` itself.
    Subdomains(String),
    Exact(String),
}

/// A parsed match pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    raw: String,
    kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    AllUrls,
    Pattern {
        scheme: SchemePattern,
        host: HostPattern,
        path: String,
    },
}

impl MatchPattern {
    /// Parse a pattern, returning a human-readable reason on failure.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw == "<all_urls>" {
            return Ok(Self {
                raw: raw.to_string(),
                kind: PatternKind::AllUrls,
            });
        }

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| format!("'{}' is missing '://'", raw))?;

        let scheme = match scheme {
            "*" => SchemePattern::Any,
            s if KNOWN_SCHEMES.contains(&s) => SchemePattern::Exact(s.to_string()),
            s => return Err(format!("unsupported scheme '{}'", s)),
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| format!("'{}' is missing a path", raw))?;
        let (host, path) = rest.split_at(slash);

        let is_file = scheme == SchemePattern::Exact("file".to_string());
        if host.is_empty() && !is_file {
            return Err(format!("'{}' is missing a host", raw));
        }

        let host = strip_port(host);
        let host = if host == "*" {
            HostPattern::Any
        } else if let Some(domain) = host.strip_prefix("*.") {
            if domain.contains('*') {
                return Err(format!("'{}' has a wildcard inside the host", raw));
            }
            HostPattern::Subdomains(normalize_host(domain, raw)?)
        } else if host.contains('*') {
            return Err(format!(
                "'{}' may only use '*' as the whole host or as a '*.' prefix",
                raw
            ));
        } else if host.is_empty() {
            HostPattern::Exact(String::new())
        } else {
            HostPattern::Exact(normalize_host(host, raw)?)
        };

        Ok(Self {
            raw: raw.to_string(),
            kind: PatternKind::Pattern {
                scheme,
                host,
                path: path.to_string(),
            },
        })
    }

    /// Check whether `url` is matched by this pattern.
    pub fn matches(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        self.matches_url(&url)
    }

    /// Match an already parsed URL. Ports, userinfo and fragments are ignored.
    pub fn matches_url(&self, url: &Url) -> bool {
        match &self.kind {
            PatternKind::AllUrls => ALL_URL_SCHEMES.contains(&url.scheme()),
            PatternKind::Pattern { scheme, host, path } => {
                let scheme_ok = match scheme {
                    SchemePattern::Any => WILDCARD_SCHEMES.contains(&url.scheme()),
                    SchemePattern::Exact(s) => s == url.scheme(),
                };

                let url_host = url.host_str().unwrap_or_default();
                let host_ok = match host {
                    HostPattern::Any => true,
                    HostPattern::Exact(h) => h == url_host,
                    HostPattern::Subdomains(domain) => {
                        url_host == domain || url_host.ends_with(&format!(".{}", domain))
                    }
                };

                // Chrome matches the path together with the query
                let target = match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                };

                scheme_ok && host_ok && glob_match(path, &target)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for MatchPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Lowercase and punycode a pattern host the way `Url` normalizes page hosts.
fn normalize_host(host: &str, raw: &str) -> Result<String, String> {
    Host::parse(host)
        .map(|h| h.to_string())
        .map_err(|e| format!("'{}' has an invalid host: {}", raw, e))
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port)) if port == "*" || port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Glob match where `*` matches any run of characters (including none).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_ti = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
