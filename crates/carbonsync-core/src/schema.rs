//! Storage schemas and aggregation policies.
//!
//! Both files are INI-style, one section per policy:
//!
//! ```text
//! [access]
//! pattern = ^test\.access-
//! retentions = 1s:5s,5s:20s,20s:60s
//!
//! [access]
//! pattern = ^test\.access-
//! xFilesFactor = 0.0
//! aggregationMethod = sum
//! ```
//!
//! Retentions accept both `step:count` (`60:1440`) and duration forms
//! (`1m:1d`, with units s, m, h, d, w, y). A metric resolves to the first
//! matching section in priority order; sections without a `priority` key
//! keep file order. Any malformed section rejects the whole file.

use std::cmp::Reverse;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SchemaError;
use crate::ini::{self, IniSection};
use crate::model::{AggregationMethod, RetentionTier};

static UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+)(s|secs?|seconds?|m|mins?|minutes?|h|hours?|d|days?|w|weeks?|y|years?)$",
    )
    .unwrap()
});

/// One `[name]` block of storage-schemas.conf.
#[derive(Debug, Clone)]
pub struct StorageSchema {
    pub name: String,
    pub pattern: Regex,
    pub retentions: Vec<RetentionTier>,
    pub priority: i64,
}

/// Parsed storage-schemas.conf in match order.
#[derive(Debug, Clone, Default)]
pub struct StorageSchemas {
    schemas: Vec<StorageSchema>,
}

impl StorageSchemas {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut schemas = Vec::new();
        for section in ini::parse(text)? {
            schemas.push(parse_schema_section(&section)?);
        }
        // Stable: equal priorities keep declaration order.
        schemas.sort_by_key(|s: &StorageSchema| Reverse(s.priority));
        Ok(Self { schemas })
    }

    /// First schema whose pattern matches `metric`.
    #[must_use]
    pub fn match_schema(&self, metric: &str) -> Option<&StorageSchema> {
        self.schemas.iter().find(|s| s.pattern.is_match(metric))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageSchema> {
        self.schemas.iter()
    }
}

fn parse_schema_section(section: &IniSection) -> Result<StorageSchema, SchemaError> {
    let name = section.name.clone();
    let pattern_src = section.get("pattern").unwrap_or_default();
    if pattern_src.is_empty() {
        return Err(SchemaError::EmptyPattern { section: name });
    }
    let pattern = compile_pattern(&name, pattern_src)?;

    let spec = section.get("retentions").unwrap_or_default();
    let retentions = parse_retention_defs(spec).map_err(|message| SchemaError::Retentions {
        section: name.clone(),
        spec: spec.to_string(),
        message,
    })?;

    let priority = match section.get("priority") {
        None | Some("") => 0,
        Some(value) => value.parse::<i64>().map_err(|_| SchemaError::Priority {
            section: name.clone(),
            value: value.to_string(),
        })?,
    };

    Ok(StorageSchema {
        name,
        pattern,
        retentions,
        priority,
    })
}

fn compile_pattern(section: &str, pattern: &str) -> Result<Regex, SchemaError> {
    Regex::new(pattern).map_err(|source| SchemaError::Pattern {
        section: section.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

/// Parse a comma-separated retention list such as `1s:5s,5s:20s` or
/// `60:1440,900:8`.
pub fn parse_retention_defs(spec: &str) -> Result<Vec<RetentionTier>, String> {
    if spec.trim().is_empty() {
        return Err("no retentions given".to_string());
    }
    spec.split(',').map(|def| parse_retention_def(def.trim())).collect()
}

fn parse_retention_def(def: &str) -> Result<RetentionTier, String> {
    let (precision, points) = def
        .split_once(':')
        .filter(|(_, rest)| !rest.contains(':'))
        .ok_or_else(|| format!("bad retentions spec {def:?}"))?;

    let (seconds_per_point, _) = parse_retention_part(precision)?;
    let (amount, is_duration) = parse_retention_part(points)?;
    if seconds_per_point == 0 {
        return Err(format!("zero precision in {def:?}"));
    }
    let number_of_points = if is_duration {
        amount / seconds_per_point
    } else {
        amount
    };
    if number_of_points == 0 {
        return Err(format!("retention {def:?} holds no points"));
    }
    Ok(RetentionTier::new(seconds_per_point, number_of_points))
}

/// Bare integers are returned as-is; `<n><unit>` is converted to seconds.
/// The flag reports whether a unit was present.
fn parse_retention_part(part: &str) -> Result<(u32, bool), String> {
    if let Ok(n) = part.parse::<u32>() {
        return Ok((n, false));
    }
    let caps = UNIT_RE
        .captures(part)
        .ok_or_else(|| format!("invalid retention part {part:?}"))?;
    let value: u32 = caps[1]
        .parse()
        .map_err(|_| format!("retention value out of range in {part:?}"))?;
    let multiplier: u32 = match caps[2].as_bytes()[0] {
        b's' => 1,
        b'm' => 60,
        b'h' => 3_600,
        b'd' => 86_400,
        b'w' => 604_800,
        b'y' => 31_536_000,
        _ => return Err(format!("unknown unit in {part:?}")),
    };
    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("retention {part:?} overflows"))?;
    Ok((seconds, true))
}

/// One `[name]` block of storage-aggregation.conf.
#[derive(Debug, Clone)]
pub struct AggregationPolicy {
    pub name: String,
    /// `None` only for the built-in default.
    pub pattern: Option<Regex>,
    pub x_files_factor: f32,
    pub method: AggregationMethod,
}

impl AggregationPolicy {
    /// `average` with xFilesFactor 0.5.
    #[must_use]
    pub fn builtin_default() -> Self {
        Self {
            name: "default".to_string(),
            pattern: None,
            x_files_factor: 0.5,
            method: AggregationMethod::Average,
        }
    }
}

/// Parsed storage-aggregation.conf plus the built-in default.
#[derive(Debug, Clone)]
pub struct AggregationRules {
    rules: Vec<AggregationPolicy>,
    default: AggregationPolicy,
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: AggregationPolicy::builtin_default(),
        }
    }
}

impl AggregationRules {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut rules = Self::default();
        for section in ini::parse(text)? {
            rules.rules.push(parse_aggregation_section(&section)?);
        }
        Ok(rules)
    }

    /// First declared rule matching `metric`, without defaulting.
    #[must_use]
    pub fn match_rule(&self, metric: &str) -> Option<&AggregationPolicy> {
        self.rules
            .iter()
            .find(|r| r.pattern.as_ref().is_some_and(|p| p.is_match(metric)))
    }

    /// First declared rule matching `metric`, else the built-in default.
    #[must_use]
    pub fn match_aggregation(&self, metric: &str) -> &AggregationPolicy {
        self.match_rule(metric).unwrap_or(&self.default)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_aggregation_section(section: &IniSection) -> Result<AggregationPolicy, SchemaError> {
    let name = section.name.clone();
    let pattern = compile_pattern(&name, section.get("pattern").unwrap_or_default())?;

    let xff_src = section.get("xfilesfactor").unwrap_or_default();
    let x_files_factor = xff_src
        .parse::<f32>()
        .ok()
        .filter(|x| (0.0..=1.0).contains(x))
        .ok_or_else(|| SchemaError::XFilesFactor {
            section: name.clone(),
            value: xff_src.to_string(),
        })?;

    let method_src = section.get("aggregationmethod").unwrap_or_default();
    let method = method_src
        .parse::<AggregationMethod>()
        .map_err(|_| SchemaError::AggregationMethod {
            section: name.clone(),
            value: method_src.to_string(),
        })?;

    Ok(AggregationPolicy {
        name,
        pattern: Some(pattern),
        x_files_factor,
        method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMAS: &str = "\
[test]
pattern = ^test\\.
retentions = 1s:5s,5s:20s,20s:60s

[catchall]
pattern = .*
retentions = 60:1440
";

    #[test]
    fn both_retention_formats() {
        assert_eq!(
            parse_retention_defs("1s:5s,5s:20s,20s:60s").unwrap(),
            vec![
                RetentionTier::new(1, 5),
                RetentionTier::new(5, 4),
                RetentionTier::new(20, 3)
            ]
        );
        assert_eq!(
            parse_retention_defs("60:1440, 900:8").unwrap(),
            vec![RetentionTier::new(60, 1440), RetentionTier::new(900, 8)]
        );
        assert_eq!(
            parse_retention_defs("10s:14d,1m:2y").unwrap(),
            vec![
                RetentionTier::new(10, 120_960),
                RetentionTier::new(60, 1_051_200)
            ]
        );
        // duration precision with a plain point count
        assert_eq!(
            parse_retention_defs("1min:30").unwrap(),
            vec![RetentionTier::new(60, 30)]
        );
    }

    #[test]
    fn bad_retentions() {
        for spec in ["", "60", "60:1440:3", "abc:10", "0:10", "10s:5s", "10x:1d", "60:"] {
            assert!(parse_retention_defs(spec).is_err(), "{spec:?} should fail");
        }
    }

    #[test]
    fn unit_spellings_are_exact() {
        assert_eq!(
            parse_retention_defs("1sec:5min,1hour:2days,1w:1years").unwrap(),
            vec![
                RetentionTier::new(1, 300),
                RetentionTier::new(3_600, 48),
                RetentionTier::new(604_800, 52),
            ]
        );
        for spec in ["5monkeys:1d", "1s:3dz", "1s:2hrs", "1mo:1y"] {
            assert!(parse_retention_defs(spec).is_err(), "{spec:?} should fail");
        }
    }

    #[test]
    fn first_matching_schema_wins() {
        let schemas = StorageSchemas::parse(SCHEMAS).unwrap();
        assert_eq!(schemas.len(), 2);
        let s = schemas.match_schema("test.access-count").unwrap();
        assert_eq!(s.name, "test");
        assert_eq!(s.retentions.len(), 3);
        assert_eq!(schemas.match_schema("other.metric").unwrap().name, "catchall");
    }

    #[test]
    fn priority_reorders_matching() {
        let text = "\
[first]
pattern = .*
retentions = 60:10

[urgent]
pattern = ^test\\.
retentions = 1:10
priority = 10
";
        let schemas = StorageSchemas::parse(text).unwrap();
        assert_eq!(schemas.match_schema("test.x").unwrap().name, "urgent");
        assert_eq!(schemas.match_schema("prod.x").unwrap().name, "first");
    }

    #[test]
    fn no_match_is_not_found() {
        let schemas = StorageSchemas::parse("[only]\npattern = ^a$\nretentions = 1:1\n").unwrap();
        assert!(schemas.match_schema("b").is_none());
    }

    #[test]
    fn one_bad_section_rejects_the_file() {
        let text = format!("{SCHEMAS}\n[broken]\npattern = (\nretentions = 1:1\n");
        assert!(matches!(
            StorageSchemas::parse(&text),
            Err(SchemaError::Pattern { .. })
        ));

        let text = format!("{SCHEMAS}\n[broken]\npattern = x\nretentions = 1:z\n");
        assert!(matches!(
            StorageSchemas::parse(&text),
            Err(SchemaError::Retentions { .. })
        ));

        let text = "[nopattern]\nretentions = 1:1\n";
        assert!(matches!(
            StorageSchemas::parse(text),
            Err(SchemaError::EmptyPattern { .. })
        ));

        let text = "[p]\npattern = x\nretentions = 1:1\npriority = high\n";
        assert!(matches!(
            StorageSchemas::parse(text),
            Err(SchemaError::Priority { .. })
        ));
    }

    #[test]
    fn aggregation_falls_back_to_default() {
        let rules = AggregationRules::parse(
            "[counts]\npattern = count$\nxFilesFactor = 0\naggregationMethod = sum\n",
        )
        .unwrap();
        let p = rules.match_aggregation("test.access-count");
        assert_eq!(p.name, "counts");
        assert_eq!(p.method, AggregationMethod::Sum);
        assert_eq!(p.x_files_factor, 0.0);

        assert!(rules.match_rule("test.latency").is_none());
        let d = rules.match_aggregation("test.latency");
        assert_eq!(d.method, AggregationMethod::Average);
        assert_eq!(d.x_files_factor, 0.5);
    }

    #[test]
    fn aggregation_first_declared_wins() {
        let rules = AggregationRules::parse(
            "[a]\npattern = ^test\nxfilesfactor = 0.1\naggregationmethod = max\n\
             [b]\npattern = .*\nxfilesfactor = 0.9\naggregationmethod = min\n",
        )
        .unwrap();
        assert_eq!(rules.match_aggregation("test.x").method, AggregationMethod::Max);
        assert_eq!(rules.match_aggregation("prod.x").method, AggregationMethod::Min);
    }

    #[test]
    fn aggregation_parse_failures() {
        assert!(matches!(
            AggregationRules::parse("[a]\npattern = .*\nxfilesfactor = lots\naggregationmethod = sum\n"),
            Err(SchemaError::XFilesFactor { .. })
        ));
        assert!(matches!(
            AggregationRules::parse("[a]\npattern = .*\nxfilesfactor = 1.5\naggregationmethod = sum\n"),
            Err(SchemaError::XFilesFactor { .. })
        ));
        assert!(matches!(
            AggregationRules::parse("[a]\npattern = .*\nxfilesfactor = 0.5\naggregationmethod = median\n"),
            Err(SchemaError::AggregationMethod { .. })
        ));
        assert!(matches!(
            AggregationRules::parse("[a]\npattern = [\nxfilesfactor = 0.5\naggregationmethod = sum\n"),
            Err(SchemaError::Pattern { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = StorageSchemas::load(Path::new("/nonexistent/storage-schemas.conf")).unwrap_err();
        assert!(matches!(err, SchemaError::Read { .. }));
    }
}
