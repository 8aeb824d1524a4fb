use reqwest::Method;
use url::Url;

use crate::net::Request;

/// How an incoming request is treated, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Method other than GET
  NonGet,
  /// Different scheme, host or port than the agent's origin
  CrossOrigin,
  /// URL contains an exclusion pattern
  Excluded,
  /// Handled by the network-first strategy
  Cacheable,
}

impl Classification {
  pub fn is_cacheable(self) -> bool {
    self == Self::Cacheable
  }
}

/// URL substrings that bypass the cache entirely.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
  patterns: Vec<String>,
}

impl ExclusionSet {
  pub fn new<I, P>(patterns: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    let patterns = patterns
      .into_iter()
      .map(Into::into)
      .filter(|p: &String| !p.is_empty())
      .collect();
    Self { patterns }
  }

  /// Whether any pattern occurs anywhere in the full URL.
  pub fn matches(&self, url: &Url) -> bool {
    let url = url.as_str();
    self.patterns.iter().any(|p| url.contains(p.as_str()))
  }
}

pub fn classify(request: &Request, origin: &Url, exclusions: &ExclusionSet) -> Classification {
  if request.method != Method::GET {
    return Classification::NonGet;
  }
  if request.url.origin() != origin.origin() {
    return Classification::CrossOrigin;
  }
  if exclusions.matches(&request.url) {
    return Classification::Excluded;
  }
  Classification::Cacheable
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://prep.example.org/").unwrap()
  }

  fn request(method: Method, url: &str) -> Request {
    let mut request = Request::get(Url::parse(url).unwrap());
    request.method = method;
    request
  }

  fn exclusions() -> ExclusionSet {
    ExclusionSet::new(["/rest/", "/auth/", "supabase"])
  }

  #[test]
  fn test_non_get_is_checked_first() {
    let r = request(Method::POST, "https://other.example.org/rest/v1/goals");
    assert_eq!(classify(&r, &origin(), &exclusions()), Classification::NonGet);
  }

  #[test]
  fn test_cross_origin() {
    for url in [
      "https://cdn.example.org/app.js",
      "http://prep.example.org/app.js",
      "https://prep.example.org:8443/app.js",
    ] {
      let r = request(Method::GET, url);
      assert_eq!(
        classify(&r, &origin(), &exclusions()),
        Classification::CrossOrigin,
        "{}",
        url
      );
    }
  }

  #[test]
  fn test_exclusions_match_anywhere_in_url() {
    for url in [
      "https://prep.example.org/rest/v1/questions",
      "https://prep.example.org/auth/v1/token?grant_type=refresh",
      "https://prep.example.org/proxy?target=supabase",
    ] {
      let r = request(Method::GET, url);
      assert_eq!(
        classify(&r, &origin(), &exclusions()),
        Classification::Excluded,
        "{}",
        url
      );
    }
  }

  #[test]
  fn test_custom_exclusion_pattern() {
    let set = ExclusionSet::new(["/dashboard-data"]);
    let r = request(Method::GET, "https://prep.example.org/dashboard-data");
    assert_eq!(classify(&r, &origin(), &set), Classification::Excluded);
  }

  #[test]
  fn test_cacheable() {
    let r = request(Method::GET, "https://prep.example.org/assets/index-3f2a.js");
    assert!(classify(&r, &origin(), &exclusions()).is_cacheable());
  }

  #[test]
  fn test_empty_patterns_are_ignored() {
    let set = ExclusionSet::new(["", "/rest/"]);
    let r = request(Method::GET, "https://prep.example.org/");
    assert_eq!(classify(&r, &origin(), &set), Classification::Cacheable);
  }
}
