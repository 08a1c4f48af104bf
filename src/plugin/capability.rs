//! Resource-type capability patterns
//!
//! A capability is a glob over resource types such as `aws:ec2/instance:Instance`.
//! `*` matches any run of characters, everything else is literal.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Clone)]
pub struct CapabilityPattern {
    raw: String,
    matcher: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid capability pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

impl CapabilityPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError {
                pattern: raw.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(PatternError {
                pattern: raw.to_string(),
                reason: "pattern contains whitespace".to_string(),
            });
        }

        let body = trimmed
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let matcher = Regex::new(&format!("^{body}$")).map_err(|err| PatternError {
            pattern: raw.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            raw: trimmed.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, resource_type: &str) -> bool {
        self.matcher.is_match(resource_type)
    }
}

impl PartialEq for CapabilityPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CapabilityPattern {}

impl fmt::Debug for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityPattern({:?})", self.raw)
    }
}

impl fmt::Display for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for CapabilityPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for CapabilityPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CapabilityPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A set of patterns; a resource type is covered when any pattern matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    patterns: Vec<CapabilityPattern>,
}

impl CapabilitySet {
    pub fn new(patterns: Vec<CapabilityPattern>) -> Self {
        Self { patterns }
    }

    pub fn parse<I, S>(raw: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = raw
            .into_iter()
            .map(|p| CapabilityPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[CapabilityPattern] {
        &self.patterns
    }

    pub fn covers(&self, resource_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(resource_type))
    }
}

/// What a negotiated instance may actually be routed.
///
/// The plugin's advertised patterns are only honoured where the registry
/// declaration also covers the resource type, so a plugin cannot widen its
/// own eligibility at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveCapabilities {
    declared: CapabilitySet,
    advertised: CapabilitySet,
}

impl EffectiveCapabilities {
    pub fn intersect(declared: CapabilitySet, advertised: CapabilitySet) -> Self {
        Self {
            declared,
            advertised,
        }
    }

    pub fn covers(&self, resource_type: &str) -> bool {
        self.declared.covers(resource_type) && self.advertised.covers(resource_type)
    }

    /// True when no resource type can satisfy both sides.
    ///
    /// Exact for literal patterns; wildcard pairs are treated as overlapping
    /// when either side's literal prefix could reach the other.
    pub fn is_disjoint(&self) -> bool {
        !self.declared.patterns().iter().any(|declared| {
            self.advertised
                .patterns()
                .iter()
                .any(|advertised| patterns_overlap(declared, advertised))
        })
    }
}

fn patterns_overlap(a: &CapabilityPattern, b: &CapabilityPattern) -> bool {
    let a_wild = a.as_str().contains('*');
    let b_wild = b.as_str().contains('*');
    match (a_wild, b_wild) {
        (false, false) => a.as_str() == b.as_str(),
        (true, false) => a.matches(b.as_str()),
        (false, true) => b.matches(a.as_str()),
        (true, true) => {
            let a_prefix = literal_prefix(a.as_str());
            let b_prefix = literal_prefix(b.as_str());
            a_prefix.starts_with(b_prefix) || b_prefix.starts_with(a_prefix)
        }
    }
}

fn literal_prefix(pattern: &str) -> &str {
    pattern.split('*').next().unwrap_or_default()
}

/// Provider prefix of a resource type: `aws` for `aws:ec2/instance:Instance`.
pub fn provider_of(resource_type: &str) -> &str {
    resource_type
        .split_once(':')
        .map(|(provider, _)| provider)
        .unwrap_or(resource_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_matches_only_itself() {
        let pattern = CapabilityPattern::parse("aws:ec2/instance:Instance").unwrap();
        assert!(pattern.matches("aws:ec2/instance:Instance"));
        assert!(!pattern.matches("aws:ec2/instance:InstanceX"));
        assert!(!pattern.matches("gcp:compute/instance:Instance"));
    }

    #[test]
    fn test_wildcard_pattern() {
        let pattern = CapabilityPattern::parse("aws:ec2/*").unwrap();
        assert!(pattern.matches("aws:ec2/instance:Instance"));
        assert!(pattern.matches("aws:ec2/volume:Volume"));
        assert!(!pattern.matches("aws:s3/bucket:Bucket"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = CapabilityPattern::parse("azure:compute.v2/*").unwrap();
        assert!(pattern.matches("azure:compute.v2/vm"));
        assert!(!pattern.matches("azure:computeXv2/vm"));
    }

    #[test]
    fn test_empty_and_whitespace_patterns_rejected() {
        assert!(CapabilityPattern::parse("").is_err());
        assert!(CapabilityPattern::parse("aws: ec2").is_err());
    }

    #[test]
    fn test_effective_capabilities_require_both_sides() {
        let declared = CapabilitySet::parse(["aws:ec2/*"]).unwrap();
        let advertised = CapabilitySet::parse(["aws:*"]).unwrap();
        let effective = EffectiveCapabilities::intersect(declared, advertised);

        assert!(effective.covers("aws:ec2/instance:Instance"));
        // Plugin over-claims S3, registry never declared it
        assert!(!effective.covers("aws:s3/bucket:Bucket"));
    }

    #[test]
    fn test_disjoint_detection() {
        let effective = EffectiveCapabilities::intersect(
            CapabilitySet::parse(["aws:*"]).unwrap(),
            CapabilitySet::parse(["gcp:*"]).unwrap(),
        );
        assert!(effective.is_disjoint());

        let overlapping = EffectiveCapabilities::intersect(
            CapabilitySet::parse(["aws:ec2/*"]).unwrap(),
            CapabilitySet::parse(["aws:*"]).unwrap(),
        );
        assert!(!overlapping.is_disjoint());
    }

    #[test]
    fn test_provider_of() {
        assert_eq!(provider_of("aws:ec2/instance:Instance"), "aws");
        assert_eq!(provider_of("kubernetes"), "kubernetes");
    }

    #[test]
    fn test_capability_set_deserializes_from_yaml_list() {
        let set: CapabilitySet = serde_yaml::from_str("- aws:*\n- gcp:compute/*\n").unwrap();
        assert!(set.covers("gcp:compute/instance:Instance"));
        assert_eq!(set.patterns().len(), 2);
    }
}
