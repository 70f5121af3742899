mod rules;
mod scanner;

pub use rules::{BoundRule, RuleSet, RuleValue, SpacingRule, VariableRule, select};
pub use scanner::{RegionScanner, SCAN_CHUNK_SIZE, ScanMemo};
