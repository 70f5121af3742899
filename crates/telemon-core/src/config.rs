//! Version-keyed lookup tables: which pattern variants and field offsets
//! apply to which release of the target.
//!
//! Each telemetry kind maps to an ordered list of entries; the first entry
//! whose version requirement matches the resolved schema version wins.
//! Signatures within an entry are tried in priority order during
//! resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fields::{DerivedField, FieldDef, FieldOffsetTable, FieldOp, ScalarType};
use crate::pattern::PatternTemplate;
use crate::scan::{BoundRule, RuleSet, RuleValue, SpacingRule, VariableRule};

/// One pattern variant with its disambiguation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Pattern template: hex bytes, `??` wildcards, `<name>` placeholders.
    pub pattern: String,
    /// Added to the selected candidate address to form the base address.
    #[serde(default)]
    pub address_offset: i64,
    #[serde(default)]
    pub rules: RuleSet,
}

/// Configuration for one telemetry kind at a range of schema versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupEntry {
    /// Semver requirement the schema version must satisfy, e.g. `>=1.31.0`
    /// or `*`.
    pub versions: String,
    pub offsets: FieldOffsetTable,
    pub signatures: Vec<SignatureSpec>,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

impl LookupEntry {
    /// Every placeholder name referenced by this entry's patterns or rules.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for signature in &self.signatures {
            if let Ok(template) = PatternTemplate::parse(&signature.pattern) {
                names.extend(template.placeholders().iter().map(|s| s.to_string()));
            }
            names.extend(
                signature
                    .rules
                    .placeholders()
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        names
    }
}

/// All telemetry kinds this tool knows how to locate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LookupTable {
    pub kinds: BTreeMap<String, Vec<LookupEntry>>,
}

impl LookupTable {
    pub fn kind_names(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    /// Pick the entry for a kind at a schema version: first match wins.
    pub fn select(&self, kind: &str, schema_version: &str) -> Result<&LookupEntry> {
        let entries = self
            .kinds
            .get(kind)
            .ok_or_else(|| Error::Configuration(format!("unknown telemetry kind '{kind}'")))?;

        let version = parse_version(schema_version)?;
        for entry in entries {
            let requirement = VersionReq::parse(&entry.versions).map_err(|e| {
                Error::Configuration(format!("bad version requirement '{}': {e}", entry.versions))
            })?;
            if requirement.matches(&version) {
                return Ok(entry);
            }
        }
        Err(Error::Configuration(format!(
            "no lookup entry for kind '{kind}' matches schema version {schema_version}"
        )))
    }

    /// Check every entry up front so a bad table fails at load, not at
    /// resolve time.
    pub fn validate(&self) -> Result<()> {
        for (kind, entries) in &self.kinds {
            if entries.is_empty() {
                return Err(Error::Configuration(format!(
                    "kind '{kind}' has no lookup entries"
                )));
            }
            for entry in entries {
                VersionReq::parse(&entry.versions).map_err(|e| {
                    Error::Configuration(format!(
                        "kind '{kind}': bad version requirement '{}': {e}",
                        entry.versions
                    ))
                })?;
                if entry.signatures.is_empty() {
                    return Err(Error::Configuration(format!(
                        "kind '{kind}': entry '{}' has no signatures",
                        entry.versions
                    )));
                }
                if entry.offsets.is_empty() {
                    return Err(Error::Configuration(format!(
                        "kind '{kind}': entry '{}' has an empty offset table",
                        entry.versions
                    )));
                }
                for signature in &entry.signatures {
                    PatternTemplate::parse(&signature.pattern)?;
                    signature.rules.validate()?;
                }
                for derived in &entry.derived {
                    if entry.offsets.get(&derived.source).is_none() {
                        return Err(Error::Configuration(format!(
                            "kind '{kind}': derived field '{}' references unknown source '{}'",
                            derived.name, derived.source
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let table: LookupTable = serde_json::from_str(&content)?;
        table.validate()?;
        Ok(table)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Schema versions are not always full semver ("1.42" is common in target
/// logs); pad missing components instead of rejecting.
fn parse_version(text: &str) -> Result<Version> {
    let mut attempt = text.to_string();
    for _ in 0..2 {
        if let Ok(version) = Version::parse(&attempt) {
            return Ok(version);
        }
        attempt.push_str(".0");
    }
    Version::parse(&attempt)
        .map_err(|e| Error::Configuration(format!("bad schema version '{text}': {e}")))
}

/// Built-in lookup table for the rider-telemetry target.
pub fn builtin_lookup() -> LookupTable {
    let mut kinds = BTreeMap::new();
    kinds.insert("rider_state".to_string(), rider_state_entries());
    kinds.insert("rider_profile".to_string(), rider_profile_entries());
    LookupTable { kinds }
}

fn offsets(defs: &[(&str, u64, ScalarType)]) -> FieldOffsetTable {
    FieldOffsetTable(
        defs.iter()
            .map(|(name, offset, ty)| (name.to_string(), FieldDef(*offset, *ty)))
            .collect(),
    )
}

fn rider_state_offsets() -> FieldOffsetTable {
    offsets(&[
        ("rider", 0x00, ScalarType::Uint32),
        ("distance", 0x10, ScalarType::Uint32),
        ("speed", 0x1C, ScalarType::Uint32),
        ("cadence_uhz", 0x28, ScalarType::Uint32),
        ("heartrate", 0x30, ScalarType::Uint32),
        ("power", 0x34, ScalarType::Uint32),
        ("climbing", 0x40, ScalarType::Uint32),
        ("time", 0x44, ScalarType::Uint32),
        ("work", 0x64, ScalarType::Uint32),
        ("x", 0x68, ScalarType::Float32),
        ("altitude", 0x6C, ScalarType::Float32),
        ("watching", 0x70, ScalarType::Uint32),
        ("y", 0x80, ScalarType::Float32),
        ("flags", 0x98, ScalarType::Uint32),
        ("route_bits", 0x9C, ScalarType::Uint32),
        ("world", 0xF0, ScalarType::Uint32),
    ])
}

fn rider_state_derived() -> Vec<DerivedField> {
    vec![
        DerivedField {
            name: "cadence".to_string(),
            source: "cadence_uhz".to_string(),
            // Stored in uHz, reported in rpm.
            op: FieldOp::Linear {
                factor: 60.0 / 1_000_000.0,
                offset: 0.0,
            },
        },
        DerivedField {
            name: "calories".to_string(),
            source: "work".to_string(),
            // mWh of work to kcal burned at 25% efficiency.
            op: FieldOp::Linear {
                factor: 3600.0 / (1000.0 * 4.184 * 0.25 * 1000.0),
                offset: 0.0,
            },
        },
        DerivedField {
            name: "road_id".to_string(),
            source: "route_bits".to_string(),
            op: FieldOp::Bits {
                shift: 8,
                mask: 0xFFFF,
            },
        },
        DerivedField {
            name: "power_meter".to_string(),
            source: "flags".to_string(),
            op: FieldOp::Flag { mask: 0x1 },
        },
    ]
}

fn rider_state_entries() -> Vec<LookupEntry> {
    let spacing = Some(SpacingRule {
        min: 80,
        max: 160,
        stride: 4,
    });
    let sanity_lower: BTreeMap<String, BoundRule> = [
        (
            "power".to_string(),
            BoundRule(0x34, ScalarType::Uint32, 0.0),
        ),
        (
            "heartrate".to_string(),
            BoundRule(0x30, ScalarType::Uint32, 0.0),
        ),
    ]
    .into();
    let sanity_upper: BTreeMap<String, BoundRule> = [(
        "heartrate".to_string(),
        BoundRule(0x30, ScalarType::Uint32, 240.0),
    )]
    .into();

    vec![
        LookupEntry {
            versions: ">=1.31.0".to_string(),
            offsets: rider_state_offsets(),
            signatures: vec![SignatureSpec {
                pattern: "<rider> 00 00 00 00 00 00 00 00 00 00 00".to_string(),
                address_offset: 0,
                rules: RuleSet {
                    spacing,
                    must_match: vec![0x00],
                    must_differ: vec![0x44],
                    must_be_variable: vec![VariableRule(
                        0xF0,
                        ScalarType::Uint32,
                        RuleValue::Binding("world".to_string()),
                    )],
                    must_be_greater_than_equal: sanity_lower.clone(),
                    must_be_less_than_equal: sanity_upper.clone(),
                },
            }],
            derived: rider_state_derived(),
        },
        // Older releases lack the world id next to the record, so the
        // fallback entry drops that rule and tolerates padding bytes.
        LookupEntry {
            versions: "*".to_string(),
            offsets: rider_state_offsets(),
            signatures: vec![SignatureSpec {
                pattern: "<rider> 00 00 00 00 ?? ?? ?? ?? 00 00 00 00".to_string(),
                address_offset: 0,
                rules: RuleSet {
                    spacing,
                    must_differ: vec![0x44],
                    must_be_greater_than_equal: sanity_lower,
                    must_be_less_than_equal: sanity_upper,
                    ..Default::default()
                },
            }],
            derived: rider_state_derived(),
        },
    ]
}

fn rider_profile_entries() -> Vec<LookupEntry> {
    vec![LookupEntry {
        versions: "*".to_string(),
        offsets: offsets(&[
            ("weight", 0x10, ScalarType::Uint32),
            ("ftp", 0x14, ScalarType::Uint32),
            ("body_type", 0x1C, ScalarType::Uint32),
            ("height", 0xA8, ScalarType::Uint32),
            ("maxhr", 0xAC, ScalarType::Uint32),
            ("drops", 0xB4, ScalarType::Uint32),
            ("achievement_level", 0xB8, ScalarType::Uint32),
            ("age", 0xCC, ScalarType::Uint32),
        ]),
        signatures: vec![SignatureSpec {
            pattern: "<rider> 00 00 00 00 00 00 00 00".to_string(),
            // The profile block starts one pointer past the id header.
            address_offset: 8,
            // Rule offsets are relative to the match address, which sits 8
            // bytes before the base the offset table is measured from.
            rules: RuleSet {
                must_be_greater_than_equal: [(
                    "age".to_string(),
                    BoundRule(0xD4, ScalarType::Uint32, 1.0),
                )]
                .into(),
                must_be_less_than_equal: [
                    (
                        "age".to_string(),
                        BoundRule(0xD4, ScalarType::Uint32, 120.0),
                    ),
                    (
                        "maxhr".to_string(),
                        BoundRule(0xB4, ScalarType::Uint32, 230.0),
                    ),
                ]
                .into(),
                ..Default::default()
            },
        }],
        derived: Vec::new(),
    }]
}
