//! The watch list: DNS name patterns the operator wants to hear
//! about.

use std::collections::BTreeSet;
use std::fmt;

/// A set of DNS name patterns. A pattern matches a name when the name
/// equals it or is a subdomain of it. Comparison is case-insensitive
/// on the ASCII (A-label) form, so internationalized names are
/// normalized before matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchList {
    patterns: BTreeSet<String>,
}

impl WatchList {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| normalize(&p)).collect(),
        }
    }

    /// Parses the watch list file format: one pattern per line, `#`
    /// comments and blank lines ignored.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// Finds the pattern matching `name`, if any.
    ///
    /// A wildcard name matches a pattern when the wildcard could
    /// expand to a name the pattern covers, so `*.example.com`
    /// matches the pattern `example.com` but also the more specific
    /// `www.example.com`.
    pub fn find_match(&self, name: &str) -> Option<&str> {
        let name = normalize(name);
        let (wildcard, base) = match name.strip_prefix("*.") {
            Some(base) => (true, base),
            None => (false, name.as_str()),
        };

        // Walk the name's own suffixes: a pattern equal to any suffix
        // along label boundaries covers the name.
        let mut suffix = base;
        loop {
            if let Some(pattern) = self.patterns.get(suffix) {
                return Some(pattern);
            }
            match suffix.split_once('.') {
                Some((_, rest)) => suffix = rest,
                None => break,
            }
        }

        if wildcard {
            // `*.base` additionally matches any pattern exactly one
            // label below `base`.
            return self
                .patterns
                .iter()
                .find(|pattern| {
                    pattern
                        .strip_suffix(base)
                        .and_then(|head| head.strip_suffix('.'))
                        .is_some_and(|label| !label.is_empty() && !label.contains('.'))
                })
                .map(String::as_str);
        }

        None
    }

    /// Finds the first matching identity among `identities`, returning
    /// `(identity, pattern)`.
    pub fn find_first_match<'a, 'b>(
        &'a self,
        identities: impl IntoIterator<Item = &'b str>,
    ) -> Option<(&'b str, &'a str)> {
        identities
            .into_iter()
            .find_map(|identity| self.find_match(identity).map(|pattern| (identity, pattern)))
    }
}

impl fmt::Display for WatchList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for pattern in &self.patterns {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(pattern)?;
            first = false;
        }
        Ok(())
    }
}

/// Lowercases a DNS name and converts U-labels to their A-label form.
/// Names that fail IDNA processing are matched on their lowercased
/// raw form instead of being dropped.
pub fn normalize(name: &str) -> String {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_ascii() {
        return name;
    }
    match idna::domain_to_ascii(&name) {
        Ok(ascii) => ascii,
        Err(_) => name,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn list(patterns: &[&str]) -> WatchList {
        WatchList::new(patterns.iter().map(|p| p.to_string()))
    }

    #[test]
    fn test_exact_and_subdomain_match() {
        let watch = list(&["example.com"]);
        assert_eq!(watch.find_match("example.com"), Some("example.com"));
        assert_eq!(watch.find_match("foo.example.com"), Some("example.com"));
        assert_eq!(watch.find_match("a.b.example.com"), Some("example.com"));
        assert_eq!(watch.find_match("badexample.com"), None);
        assert_eq!(watch.find_match("example.org"), None);
        assert_eq!(watch.find_match("com"), None);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let watch = list(&["Example.COM"]);
        assert_eq!(watch.find_match("FOO.EXAMPLE.com"), Some("example.com"));
    }

    #[test]
    fn test_wildcard_names() {
        let watch = list(&["example.com"]);
        assert_eq!(watch.find_match("*.example.com"), Some("example.com"));

        let specific = list(&["www.example.com"]);
        assert_eq!(specific.find_match("*.example.com"), Some("www.example.com"));
        assert_eq!(specific.find_match("*.b.example.com"), None);
    }

    #[test]
    fn test_idn_normalization() {
        let watch = list(&["bücher.example"]);
        assert_eq!(
            watch.find_match("shop.xn--bcher-kva.example"),
            Some("xn--bcher-kva.example")
        );
        assert_eq!(watch.find_match("BÜCHER.example"), Some("xn--bcher-kva.example"));
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let watch = WatchList::parse("# watched domains\n\nexample.com\n  example.org  \n");
        assert_eq!(watch.len(), 2);
        assert_eq!(watch.find_match("example.org"), Some("example.org"));
    }

    #[test]
    fn test_first_match_among_identities() {
        let watch = list(&["example.org"]);
        let identities = ["unrelated.net", "www.example.org", "example.org"];
        assert_eq!(
            watch.find_first_match(identities),
            Some(("www.example.org", "example.org"))
        );
    }
}
