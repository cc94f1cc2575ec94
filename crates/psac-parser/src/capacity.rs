use std::sync::LazyLock;

use psac_core::CapacityTier;
use regex::Regex;

static VOCABULARY: LazyLock<Vec<(CapacityTier, Regex)>> = LazyLock::new(|| {
    [
        (CapacityTier::OfflineOnly, r"(?i)\b(?:[пp][ \t]?1|offline|оф+лайн|tier[ \t-]?1)\b"),
        (CapacityTier::Hybrid, r"(?i)\b(?:[пp][ \t]?2|hybrid|гибрид\w*|tier[ \t-]?2)\b"),
        (CapacityTier::OnlineOnly, r"(?i)\b(?:[пp][ \t]?3|online|онлайн|full|полн\w*|tier[ \t-]?3)\b"),
    ]
    .into_iter()
    .map(|(tier, pattern)| (tier, Regex::new(pattern).expect("static regex")))
    .collect()
});

/// Map free-text capacity info onto a tier. Tiers are checked lowest first;
/// no keyword means [`CapacityTier::Unknown`].
pub fn classify_capacity(info: Option<&str>) -> CapacityTier {
    let Some(info) = info else {
        return CapacityTier::Unknown;
    };
    VOCABULARY
        .iter()
        .find(|(_, regex)| regex.is_match(info))
        .map(|(tier, _)| *tier)
        .unwrap_or(CapacityTier::Unknown)
}
