//! Host matching for deciding which CONNECT tunnels get intercepted

use crate::error::{ProxyError, Result};
use wildmatch::WildMatch;

/// Matcher for CONNECT target hosts
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    patterns: Vec<WildMatch>,
}

impl HostMatcher {
    /// Create a new empty matcher
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Build a matcher from wildcard patterns such as `*.roblox.com`
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut matcher = Self::new();
        for pattern in patterns {
            matcher.add_pattern(pattern.as_ref())?;
        }
        Ok(matcher)
    }

    /// Add a wildcard pattern for host matching
    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        // Basic validation: no empty patterns, no double wildcards
        if pattern.trim().is_empty() || pattern.contains("**") {
            return Err(ProxyError::InvalidPattern {
                pattern: pattern.to_string(),
            });
        }
        self.patterns.push(WildMatch::new(&pattern.to_ascii_lowercase()));
        Ok(())
    }

    /// Check if a hostname matches any pattern (case-insensitive)
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matching() {
        let matcher = HostMatcher::from_patterns(&["*.roblox.com", "roblox.com"]).unwrap();

        assert!(matcher.matches_host("gamejoin.roblox.com"));
        assert!(matcher.matches_host("roblox.com"));
        assert!(!matcher.matches_host("roblox.com.evil.org"));
        assert!(!matcher.matches_host("example.com"));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let matcher = HostMatcher::from_patterns(&["*.Roblox.com"]).unwrap();
        assert!(matcher.matches_host("GameJoin.ROBLOX.com."));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(HostMatcher::from_patterns(&["**.roblox.com"]).is_err());
        assert!(HostMatcher::from_patterns(&[" "]).is_err());
    }

    #[test]
    fn test_empty_matcher() {
        let matcher = HostMatcher::new();
        assert!(matcher.is_empty());
        assert!(!matcher.matches_host("roblox.com"));
    }
}
