//! Host classification against live-mutable include/exclude pattern lists

use arc_swap::ArcSwap;
use std::sync::Arc;

/// What the dispatcher should do with a request for a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Terminate TLS / replay upstream and capture the exchange
  Intercept,
  /// Pass bytes through untouched
  Forward,
}

/// Ordered include/exclude glob lists, mutable while the proxy serves.
///
/// Writers publish a fresh immutable snapshot; readers load the current
/// snapshot, so a classification never observes a half-updated list.
#[derive(Debug)]
pub struct HostFilter {
  include: ArcSwap<Vec<String>>,
  exclude: ArcSwap<Vec<String>>,
}

impl HostFilter {
  /// Build a filter from `;`-separated pattern strings.
  pub fn new(include: &str, exclude: &str) -> Self {
    Self {
      include: ArcSwap::from_pointee(parse_patterns(include)),
      exclude: ArcSwap::from_pointee(parse_patterns(exclude)),
    }
  }

  /// Classify a host (port already stripped).
  ///
  /// Exclude match wins; otherwise an empty include list means
  /// "intercept everything", a non-empty one requires a match.
  pub fn route(&self, host: &str) -> Route {
    let exclude = self.exclude.load();
    if exclude.iter().any(|p| glob_match(p, host)) {
      return Route::Forward;
    }
    let include = self.include.load();
    if include.is_empty() || include.iter().any(|p| glob_match(p, host)) {
      Route::Intercept
    } else {
      Route::Forward
    }
  }

  /// Current include patterns.
  pub fn include(&self) -> Vec<String> {
    self.include.load().as_ref().clone()
  }

  /// Replace the include list; returns the parsed patterns.
  pub fn set_include(&self, patterns: &str) -> Vec<String> {
    let parsed = parse_patterns(patterns);
    self.include.store(Arc::new(parsed.clone()));
    parsed
  }

  /// Empty the include list; returns the (empty) list.
  pub fn clear_include(&self) -> Vec<String> {
    self.include.store(Arc::new(Vec::new()));
    Vec::new()
  }

  /// Current exclude patterns.
  pub fn exclude(&self) -> Vec<String> {
    self.exclude.load().as_ref().clone()
  }

  /// Replace the exclude list; returns the parsed patterns.
  pub fn set_exclude(&self, patterns: &str) -> Vec<String> {
    let parsed = parse_patterns(patterns);
    self.exclude.store(Arc::new(parsed.clone()));
    parsed
  }

  /// Empty the exclude list; returns the (empty) list.
  pub fn clear_exclude(&self) -> Vec<String> {
    self.exclude.store(Arc::new(Vec::new()));
    Vec::new()
  }
}

/// Split a `;`-separated pattern string, trimming and dropping empties.
fn parse_patterns(patterns: &str) -> Vec<String> {
  patterns
    .split(';')
    .map(str::trim)
    .filter(|p| !p.is_empty())
    .map(str::to_owned)
    .collect()
}

/// Strip a `:port` suffix from a request host.
///
/// Bracketed IPv6 authorities keep the address inside the brackets; a bare
/// IPv6 literal (more than one colon, no brackets) is returned untouched.
pub(crate) fn strip_port(host: &str) -> &str {
  if let Some(rest) = host.strip_prefix('[') {
    return rest.split(']').next().unwrap_or(rest);
  }
  match host.find(':') {
    Some(idx) if host[idx + 1..].find(':').is_none() => &host[..idx],
    _ => host,
  }
}

/// Shell-style glob match over a bare hostname: `*` matches any run of
/// characters, `?` matches exactly one. Case-sensitive.
fn glob_match(pattern: &str, host: &str) -> bool {
  let p = pattern.as_bytes();
  let h = host.as_bytes();
  let (mut pi, mut hi) = (0usize, 0usize);
  let mut star: Option<(usize, usize)> = None;
  while hi < h.len() {
    if pi < p.len() && (p[pi] == b'?' || p[pi] == h[hi]) {
      pi += 1;
      hi += 1;
    } else if pi < p.len() && p[pi] == b'*' {
      star = Some((pi, hi));
      pi += 1;
    } else if let Some((star_pi, star_hi)) = star {
      // Backtrack: let the last `*` swallow one more host byte.
      pi = star_pi + 1;
      hi = star_hi + 1;
      star = Some((star_pi, star_hi + 1));
    } else {
      return false;
    }
  }
  while pi < p.len() && p[pi] == b'*' {
    pi += 1;
  }
  pi == p.len()
}
