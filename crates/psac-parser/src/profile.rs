//! Parsing profiles: ordered `(field, pattern)` rules scoped to a channel.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RuleError;

pub const DEFAULT_PROFILE: &str = "default";

const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    PricePs4,
    PricePs5,
    Region,
    SoldStatus,
    Capacity,
    GamesStart,
    GamesEnd,
    OriginalMail,
    Guarantee,
    SellerInfo,
    AdditionalInfo,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldKind::PricePs4 => "price_ps4",
            FieldKind::PricePs5 => "price_ps5",
            FieldKind::Region => "region",
            FieldKind::SoldStatus => "sold_status",
            FieldKind::Capacity => "capacity",
            FieldKind::GamesStart => "games_start",
            FieldKind::GamesEnd => "games_end",
            FieldKind::OriginalMail => "original_mail",
            FieldKind::Guarantee => "guarantee",
            FieldKind::SellerInfo => "seller_info",
            FieldKind::AdditionalInfo => "additional_info",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingRule {
    pub field: FieldKind,
    pub pattern: String,
}

impl ParsingRule {
    pub fn new(field: FieldKind, pattern: impl Into<String>) -> Self {
        Self {
            field,
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingProfile {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ParsingRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<ParsingProfile>,
}

/// A compiled profile. Rule order is preserved; for single-valued fields the
/// first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: String,
    rules: Vec<(FieldKind, Regex)>,
    skipped: usize,
}

impl RuleSet {
    /// Compile every rule; invalid patterns are logged and left out.
    pub fn compile(profile: &ParsingProfile) -> Self {
        let mut rules = Vec::with_capacity(profile.rules.len());
        let mut skipped = 0;
        for rule in &profile.rules {
            match compile_pattern(&rule.pattern) {
                Ok(regex) => rules.push((rule.field, regex)),
                Err(err) => {
                    skipped += 1;
                    warn!(profile = %profile.name, field = %rule.field, error = %err, "skipping invalid parsing rule");
                }
            }
        }
        Self {
            name: profile.name.clone(),
            rules,
            skipped,
        }
    }

    /// Compile every rule, failing on the first invalid pattern.
    pub fn compile_strict(profile: &ParsingProfile) -> Result<Self, RuleError> {
        let mut rules = Vec::with_capacity(profile.rules.len());
        for rule in &profile.rules {
            let regex = compile_pattern(&rule.pattern).map_err(|source| RuleError::InvalidPattern {
                profile: profile.name.clone(),
                field: rule.field,
                source,
            })?;
            rules.push((rule.field, regex));
        }
        Ok(Self {
            name: profile.name.clone(),
            rules,
            skipped: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules dropped by [`RuleSet::compile`].
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn has(&self, field: FieldKind) -> bool {
        self.rules.iter().any(|(kind, _)| *kind == field)
    }

    pub fn patterns(&self, field: FieldKind) -> impl Iterator<Item = &Regex> {
        self.rules
            .iter()
            .filter(move |(kind, _)| *kind == field)
            .map(|(_, regex)| regex)
    }

    /// Value of the first rule for `field` that matches: capture group 1 when
    /// the pattern has one, else the whole match.
    pub fn first_value(&self, field: FieldKind, text: &str) -> Option<String> {
        self.patterns(field).find_map(|regex| {
            let caps = regex.captures(text)?;
            let found = caps.get(1).or_else(|| caps.get(0))?;
            let value = found.as_str().trim();
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        })
    }

    pub fn any_match(&self, field: FieldKind, text: &str) -> bool {
        self.patterns(field).any(|regex| regex.is_match(text))
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

/// Named rule sets with a built-in fallback.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, RuleSet>,
    fallback: RuleSet,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            fallback: RuleSet::compile(&default_profile()),
        }
    }
}

impl ProfileRegistry {
    pub fn from_profiles(profiles: impl IntoIterator<Item = ParsingProfile>) -> Self {
        let mut registry = Self::default();
        for profile in profiles {
            registry.insert(&profile);
        }
        registry
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: ProfilesFile = serde_yaml::from_str(text)?;
        Ok(Self::from_profiles(file.profiles))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn insert(&mut self, profile: &ParsingProfile) {
        let compiled = RuleSet::compile(profile);
        if profile.name == DEFAULT_PROFILE {
            self.fallback = compiled.clone();
        }
        self.profiles.insert(profile.name.clone(), compiled);
    }

    /// Rule set for a channel's profile name; unknown names get the default.
    pub fn rules_for(&self, name: &str) -> &RuleSet {
        match self.profiles.get(name) {
            Some(rules) => rules,
            None => {
                if name != DEFAULT_PROFILE {
                    warn!(profile = name, "unknown parsing profile; using default rules");
                }
                &self.fallback
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names = self.profiles.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

/// Built-in rules for Russian/English PlayStation account sale posts.
pub fn default_profile() -> ParsingProfile {
    use FieldKind::*;

    let sep = r"[ \t]*[:\-–—=][ \t]*";
    let amount = r"(\d[\d \u{a0}\u{202f}.,]*)";
    ParsingProfile {
        name: DEFAULT_PROFILE.to_string(),
        rules: vec![
            ParsingRule::new(PricePs4, format!(r"(?:цена|price)[ \t]*(?:п|p)s?[ \t]*4{sep}{amount}")),
            ParsingRule::new(PricePs4, format!(r"(?:п|p)s?[ \t]*4{sep}{amount}")),
            ParsingRule::new(PricePs5, format!(r"(?:цена|price)[ \t]*(?:п|p)s?[ \t]*5{sep}{amount}")),
            ParsingRule::new(PricePs5, format!(r"(?:п|p)s?[ \t]*5{sep}{amount}")),
            ParsingRule::new(Region, format!(r"(?:регион|region){sep}([^\n]+)")),
            ParsingRule::new(SoldStatus, r"продан[оа]?\b"),
            ParsingRule::new(SoldStatus, r"\bsold(?:[ \t]+out)?\b"),
            ParsingRule::new(SoldStatus, r"\bнет в наличии\b"),
            ParsingRule::new(Capacity, format!(r"(?:тип|type|активация|activation){sep}([^\n]+)")),
            ParsingRule::new(Capacity, r"\b([пp][123])\b"),
            ParsingRule::new(GamesStart, r"(?:список игр|игры на аккаунте|игры|games(?:[ \t]+list)?)[ \t]*:"),
            ParsingRule::new(
                GamesEnd,
                r"(?m)^[ \t]*(?:цена|price|стоимость|гарантия|guarantee|регион|region|продавец|seller)\b",
            ),
            ParsingRule::new(OriginalMail, r"(?:родная|оригинальная|original)[ \t]+(?:почта|mail|e-?mail)"),
            ParsingRule::new(Guarantee, format!(r"(?:гарантия|guarantee|warranty){sep}([^\n]+)")),
            ParsingRule::new(SellerInfo, format!(r"(?:продавец|seller|контакты?|contacts?){sep}([^\n]+)")),
            ParsingRule::new(
                AdditionalInfo,
                format!(r"(?:дополнительно|доп\. ?инфо|additional(?:[ \t]+info)?|notes?){sep}([^\n]+)"),
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_profile_compiles_cleanly() {
        let rules = RuleSet::compile_strict(&default_profile()).expect("default rules compile");
        assert_eq!(rules.len(), default_profile().rules.len());
        assert!(rules.has(FieldKind::GamesStart));
    }

    #[test]
    fn invalid_patterns_are_skipped_not_fatal() {
        let profile = ParsingProfile {
            name: "broken".into(),
            rules: vec![
                ParsingRule::new(FieldKind::Region, r"region: ([a-z"),
                ParsingRule::new(FieldKind::Region, r"region: (\w+)"),
            ],
        };
        let rules = RuleSet::compile(&profile);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.skipped(), 1);
        assert_eq!(rules.first_value(FieldKind::Region, "Region: Turkey"), Some("Turkey".into()));
        assert!(RuleSet::compile_strict(&profile).is_err());
    }

    #[test]
    fn first_matching_rule_wins() {
        let profile = ParsingProfile {
            name: "ordered".into(),
            rules: vec![
                ParsingRule::new(FieldKind::SellerInfo, r"seller: (\w+)"),
                ParsingRule::new(FieldKind::SellerInfo, r"contact: (\w+)"),
            ],
        };
        let rules = RuleSet::compile(&profile);
        let text = "contact: bob\nseller: alice";
        assert_eq!(rules.first_value(FieldKind::SellerInfo, text), Some("alice".into()));
    }

    #[test]
    fn registry_loads_yaml_and_falls_back_to_default() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "profiles:\n  - name: turkish\n    rules:\n      - field: region\n        pattern: 'bölge: (\\w+)'\n"
        )
        .expect("write yaml");

        let registry = ProfileRegistry::from_path(file.path()).expect("load yaml");
        assert_eq!(registry.names(), vec!["turkish"]);
        let turkish = registry.rules_for("turkish");
        assert_eq!(turkish.first_value(FieldKind::Region, "Bölge: TR"), Some("TR".into()));

        let fallback = registry.rules_for("missing");
        assert_eq!(fallback.name(), DEFAULT_PROFILE);
    }

    #[test]
    fn missing_yaml_file_is_an_io_error() {
        let err = ProfileRegistry::from_path("/nonexistent/profiles.yaml").unwrap_err();
        assert!(matches!(err, RuleError::Io { .. }));
    }
}
