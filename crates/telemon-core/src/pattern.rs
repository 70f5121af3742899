//! Byte-pattern templates and bind-time compilation.
//!
//! A template is a whitespace-separated token string: `"A3"` matches one
//! fixed byte, `"??"` (or `"?"`) matches any byte, and `"<name>"` is a
//! placeholder replaced at bind time by the 4-byte little-endian encoding of
//! a runtime scalar. Compiling the same template with the same bindings is
//! deterministic down to the byte.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::scan::RuleSet;

/// Runtime values substituted for `<name>` placeholders.
pub type Bindings = BTreeMap<String, u32>;

/// Number of leading concrete bytes used for liveness checks.
const LIVENESS_PREFIX_MAX: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternToken {
    Byte(u8),
    Any,
    Placeholder(String),
}

/// A parsed but unbound pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternTemplate {
    tokens: Vec<PatternToken>,
}

impl PatternTemplate {
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for token in text.split_whitespace() {
            if token == "??" || token == "?" {
                tokens.push(PatternToken::Any);
                continue;
            }
            if let Some(name) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(Error::InvalidPattern(format!(
                        "invalid placeholder name '{token}'"
                    )));
                }
                tokens.push(PatternToken::Placeholder(name.to_string()));
                continue;
            }
            let value = u8::from_str_radix(token, 16).map_err(|e| {
                Error::InvalidPattern(format!("invalid pattern token '{token}': {e}"))
            })?;
            tokens.push(PatternToken::Byte(value));
        }

        if tokens.is_empty() {
            return Err(Error::InvalidPattern("pattern is empty".to_string()));
        }
        if tokens[0] == PatternToken::Any {
            // The leading bytes anchor liveness checks and must be concrete.
            return Err(Error::InvalidPattern(
                "pattern must not begin with a wildcard".to_string(),
            ));
        }

        Ok(Self { tokens })
    }

    /// Placeholder names referenced by this template.
    pub fn placeholders(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                PatternToken::Placeholder(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Substitute placeholders and produce a concrete matcher.
    pub fn compile(&self, bindings: &Bindings) -> Result<ConcretePattern> {
        let mut bytes = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            match token {
                PatternToken::Byte(b) => bytes.push(Some(*b)),
                PatternToken::Any => bytes.push(None),
                PatternToken::Placeholder(name) => {
                    let value = bindings.get(name).ok_or_else(|| {
                        Error::InvalidPattern(format!("no binding for placeholder <{name}>"))
                    })?;
                    bytes.extend(value.to_le_bytes().map(Some));
                }
            }
        }
        Ok(ConcretePattern::new(bytes))
    }
}

/// A fully-bound pattern: fixed bytes and wildcards only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcretePattern {
    bytes: Vec<Option<u8>>,
    leading: Vec<u8>,
}

impl ConcretePattern {
    fn new(bytes: Vec<Option<u8>>) -> Self {
        let leading = bytes
            .iter()
            .map_while(|b| *b)
            .take(LIVENESS_PREFIX_MAX)
            .collect();
        Self { bytes, leading }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First byte of the pattern. Guaranteed concrete by construction.
    pub fn first_byte(&self) -> u8 {
        self.leading[0]
    }

    /// Leading concrete bytes, read back from memory to verify that a
    /// resolved address is still live.
    pub fn leading_concrete(&self) -> &[u8] {
        &self.leading
    }

    /// Whether a window of bytes matches, wildcards matching anything.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(window)
                .all(|(p, b)| p.is_none_or(|expected| expected == *b))
    }

    /// Canonical display form, e.g. `48 8D ?? FF`.
    pub fn display(&self) -> String {
        self.bytes
            .iter()
            .map(|b| match b {
                Some(value) => format!("{value:02X}"),
                None => "??".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Digest of the compiled byte form plus the bound rule set.
    ///
    /// Keyed on the compiled form (not the template) so the same template
    /// bound to different runtime values never collides in the cache.
    pub fn identity(&self, rules: &RuleSet) -> PatternIdentity {
        let mut hasher = Sha256::new();
        for byte in &self.bytes {
            match byte {
                Some(b) => hasher.update([0u8, *b]),
                None => hasher.update([1u8, 0]),
            }
        }
        if let Ok(rule_json) = serde_json::to_vec(rules) {
            hasher.update(&rule_json);
        }
        let digest = hasher.finalize();
        PatternIdentity(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Hex digest identifying one compiled pattern + rule set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternIdentity(String);

impl PatternIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PatternIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, u32)]) -> Bindings {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parse_tokens() {
        let template = PatternTemplate::parse("48 8D ?? <rider> FF").unwrap();
        assert_eq!(template.tokens.len(), 5);
        assert_eq!(template.tokens[0], PatternToken::Byte(0x48));
        assert_eq!(template.tokens[2], PatternToken::Any);
        assert_eq!(
            template.tokens[3],
            PatternToken::Placeholder("rider".to_string())
        );
        assert_eq!(template.placeholders(), vec!["rider"]);
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert!(PatternTemplate::parse("").is_err());
        assert!(PatternTemplate::parse("GG").is_err());
        assert!(PatternTemplate::parse("<bad name>").is_err());
        assert!(PatternTemplate::parse("?? 48").is_err());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let template = PatternTemplate::parse("<rider> 00 ?? 11").unwrap();
        let b = bindings(&[("rider", 0x01020304)]);
        let first = template.compile(&b).unwrap();
        let second = template.compile(&b).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.display(),
            "04 03 02 01 00 ?? 11" // little-endian placeholder expansion
        );
    }

    #[test]
    fn test_compile_missing_binding() {
        let template = PatternTemplate::parse("<rider> 00").unwrap();
        let err = template.compile(&Bindings::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern(_)));
    }

    #[test]
    fn test_leading_concrete_stops_at_wildcard() {
        let template = PatternTemplate::parse("AA BB ?? CC").unwrap();
        let pattern = template.compile(&Bindings::new()).unwrap();
        assert_eq!(pattern.leading_concrete(), &[0xAA, 0xBB]);
        assert_eq!(pattern.first_byte(), 0xAA);
    }

    #[test]
    fn test_leading_concrete_is_capped() {
        let template =
            PatternTemplate::parse("01 02 03 04 05 06 07 08 09 0A").unwrap();
        let pattern = template.compile(&Bindings::new()).unwrap();
        assert_eq!(pattern.leading_concrete().len(), 8);
    }

    #[test]
    fn test_matches_with_wildcards() {
        let pattern = PatternTemplate::parse("AA ?? CC")
            .unwrap()
            .compile(&Bindings::new())
            .unwrap();
        assert!(pattern.matches(&[0xAA, 0x00, 0xCC]));
        assert!(pattern.matches(&[0xAA, 0xFF, 0xCC]));
        assert!(!pattern.matches(&[0xAB, 0x00, 0xCC]));
        assert!(!pattern.matches(&[0xAA, 0x00]));
    }

    #[test]
    fn test_identity_depends_on_bindings() {
        let template = PatternTemplate::parse("<rider> 00 00 00").unwrap();
        let rules = RuleSet::default();
        let a = template
            .compile(&bindings(&[("rider", 100)]))
            .unwrap()
            .identity(&rules);
        let b = template
            .compile(&bindings(&[("rider", 200)]))
            .unwrap()
            .identity(&rules);
        let a_again = template
            .compile(&bindings(&[("rider", 100)]))
            .unwrap()
            .identity(&rules);
        assert_ne!(a, b);
        assert_eq!(a, a_again);
        assert_eq!(a.as_str().len(), 64);
    }
}
