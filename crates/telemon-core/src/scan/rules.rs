//! Declarative disambiguation rules for scan candidates.
//!
//! A byte signature alone usually recurs at several addresses, including
//! decoy structures with a similar layout. The rule set encodes structural
//! knowledge about the surrounding records so a single candidate can be
//! picked without a second unique signature. Selection is strictly
//! first-match in ascending address order; per-version rule sets are tuned
//! against that order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fields::ScalarType;
use crate::memory::MemoryAccessor;
use crate::pattern::Bindings;

/// Constraint on the delta between repeated occurrences of the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpacingRule {
    pub min: u64,
    pub max: u64,
    #[serde(default = "default_stride")]
    pub stride: u64,
}

fn default_stride() -> u64 {
    4
}

/// Expected value of a rule comparison: a literal, or a `<name>` placeholder
/// bound at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Binding(String),
}

/// `(offset, type, expected)`: the field at the offset must equal a
/// runtime-bound scalar. Serialized as a 3-element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRule(pub u64, pub ScalarType, pub RuleValue);

/// `(offset, type, bound)`: sanity bound on a named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundRule(pub u64, pub ScalarType, pub f64);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleSet {
    pub spacing: Option<SpacingRule>,
    /// Offsets whose u32 value must repeat between the previous occurrence
    /// and this one (the field is constant across adjacent records).
    pub must_match: Vec<u64>,
    /// Offsets whose u32 value must differ between the previous occurrence
    /// and this one (the field varies tick-to-tick, so it cannot be a
    /// structural constant).
    pub must_differ: Vec<u64>,
    pub must_be_variable: Vec<VariableRule>,
    pub must_be_greater_than_equal: BTreeMap<String, BoundRule>,
    pub must_be_less_than_equal: BTreeMap<String, BoundRule>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.spacing.is_none()
            && self.must_match.is_empty()
            && self.must_differ.is_empty()
            && self.must_be_variable.is_empty()
            && self.must_be_greater_than_equal.is_empty()
            && self.must_be_less_than_equal.is_empty()
    }

    /// Placeholder names referenced by `mustBeVariable` entries.
    pub fn placeholders(&self) -> Vec<&str> {
        self.must_be_variable
            .iter()
            .filter_map(|rule| match &rule.2 {
                RuleValue::Binding(name) => Some(name.as_str()),
                RuleValue::Number(_) => None,
            })
            .collect()
    }

    /// Substitute placeholder expected-values with bound runtime scalars.
    pub fn bind(&self, bindings: &Bindings) -> Result<RuleSet> {
        let mut bound = self.clone();
        for rule in &mut bound.must_be_variable {
            if let RuleValue::Binding(name) = &rule.2 {
                let value = bindings.get(name.as_str()).ok_or_else(|| {
                    Error::InvalidPattern(format!("no binding for placeholder <{name}>"))
                })?;
                rule.2 = RuleValue::Number(*value as f64);
            }
        }
        Ok(bound)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(spacing) = &self.spacing {
            if spacing.min > spacing.max {
                return Err(Error::Configuration(format!(
                    "spacing min {} exceeds max {}",
                    spacing.min, spacing.max
                )));
            }
            if spacing.stride == 0 {
                return Err(Error::Configuration("spacing stride must be non-zero".into()));
            }
        }
        Ok(())
    }
}

/// Pick the single base address among candidates, first-match wins.
///
/// Candidates must be in ascending address order. The spacing of each
/// candidate is its delta from the previous candidate in the list (the first
/// candidate's delta is measured from address zero, so a spacing rule
/// effectively anchors on the second occurrence of a repeated record).
/// Returns `Ok(None)` when no candidate satisfies every declared rule.
pub fn select<A: MemoryAccessor + ?Sized>(
    accessor: &A,
    candidates: &[u64],
    rules: &RuleSet,
) -> Result<Option<u64>> {
    for rule in &rules.must_be_variable {
        if let RuleValue::Binding(name) = &rule.2 {
            return Err(Error::InvalidPattern(format!(
                "rule set still references unbound placeholder <{name}>"
            )));
        }
    }

    let mut previous: u64 = 0;
    for &address in candidates {
        let spacing = address.wrapping_sub(previous);
        previous = address;

        if passes(accessor, address, spacing, rules) {
            debug!("Selected candidate {address:#x} (spacing {spacing})");
            return Ok(Some(address));
        }
    }
    Ok(None)
}

fn passes<A: MemoryAccessor + ?Sized>(
    accessor: &A,
    address: u64,
    spacing: u64,
    rules: &RuleSet,
) -> bool {
    if let Some(rule) = &rules.spacing {
        if spacing < rule.min || spacing > rule.max || spacing % rule.stride != 0 {
            debug!("Candidate {address:#x} rejected: spacing {spacing} out of bounds");
            return false;
        }
    }

    for VariableRule(offset, scalar_type, expected) in &rules.must_be_variable {
        let RuleValue::Number(expected) = expected else {
            return false;
        };
        match accessor.read_scalar(address + offset, *scalar_type) {
            Ok(value) if value.as_f64() == *expected => {}
            Ok(value) => {
                debug!(
                    "Candidate {address:#x} rejected: field at +{offset:#x} is {:?}, expected {expected}",
                    value
                );
                return false;
            }
            Err(e) => {
                debug!("Candidate {address:#x} rejected: {e}");
                return false;
            }
        }
    }

    let prior = address.wrapping_sub(spacing);
    for &offset in &rules.must_match {
        match (
            accessor.read_u32(prior + offset),
            accessor.read_u32(address + offset),
        ) {
            (Ok(a), Ok(b)) if a == b => {}
            _ => {
                debug!("Candidate {address:#x} rejected: mustMatch at +{offset:#x}");
                return false;
            }
        }
    }

    for &offset in &rules.must_differ {
        match (
            accessor.read_u32(prior + offset),
            accessor.read_u32(address + offset),
        ) {
            (Ok(a), Ok(b)) if a != b => {}
            _ => {
                debug!("Candidate {address:#x} rejected: mustDiffer at +{offset:#x}");
                return false;
            }
        }
    }

    for (name, BoundRule(offset, scalar_type, bound)) in &rules.must_be_greater_than_equal {
        match accessor.read_scalar(address + offset, *scalar_type) {
            Ok(value) if value.as_f64() >= *bound => {}
            _ => {
                debug!("Candidate {address:#x} rejected: {name} below {bound}");
                return false;
            }
        }
    }

    for (name, BoundRule(offset, scalar_type, bound)) in &rules.must_be_less_than_equal {
        match accessor.read_scalar(address + offset, *scalar_type) {
            Ok(value) if value.as_f64() <= *bound => {}
            _ => {
                debug!("Candidate {address:#x} rejected: {name} above {bound}");
                return false;
            }
        }
    }

    true
}
