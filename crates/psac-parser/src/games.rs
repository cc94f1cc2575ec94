//! Games-block extraction.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::profile::{FieldKind, RuleSet};
use crate::strip_decorations;

const MIN_TITLE_CHARS: usize = 3;
const MAX_TITLE_CHARS: usize = 100;

static LEADING_DECORATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s\-–—•·*▪►▶➤✓✔☑+>#|]*(?:\d{1,3}[.)\]:][\s\-–—]*)?").expect("static regex")
});

static PLATFORM_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s\-–—,/|(\[]+)(?:ps4[ \t]*(?:/|&|\+|,|и|and)[ \t]*ps5|ps5[ \t]*(?:/|&|\+|,|и|and)[ \t]*ps4|p4[ \t]*(?:/|&|\+|и|and)[ \t]*p5|ps4|ps5|p4|p5)[\s)\]]*$",
    )
    .expect("static regex")
});

static PLATFORM_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:ps4|ps5|p4|p5|ps4[ \t]*[/&+][ \t]*ps5|ps5[ \t]*[/&+][ \t]*ps4|p4[ \t]*[/&+][ \t]*p5)$")
        .expect("static regex")
});

/// Cut the games block out of `text` and return its cleaned titles.
///
/// The end boundary is located and truncated first, then the start boundary is
/// searched only inside what remains. Without a start rule, or when it does not
/// match, there is no block.
pub fn extract_games(text: &str, rules: &RuleSet) -> Vec<String> {
    let mut block = text;

    if let Some(end) = rules
        .patterns(FieldKind::GamesEnd)
        .filter_map(|regex| regex.find(block))
        .map(|m| m.start())
        .min()
    {
        block = &block[..end];
    }

    let Some(start) = rules
        .patterns(FieldKind::GamesStart)
        .find_map(|regex| regex.find(block))
        .map(|m| m.end())
    else {
        return Vec::new();
    };
    block = &block[start..];

    clean_title_lines(block)
}

/// Split a block into titles: strip bullets, numbering and platform suffixes,
/// drop noise lines, dedupe case-insensitively keeping first-seen order.
pub fn clean_title_lines(block: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut titles = Vec::new();

    for line in block.split(['\n', '\r', '\u{2028}', '\u{2029}', '\u{85}']) {
        let Some(title) = clean_title(line) else {
            continue;
        };
        if seen.insert(title.to_lowercase()) {
            titles.push(title);
        }
    }
    titles
}

fn clean_title(line: &str) -> Option<String> {
    let line = strip_decorations(line);
    let line = LEADING_DECORATION.replace(line.trim(), "");
    let line = line.trim();
    if line.is_empty() || PLATFORM_TOKEN.is_match(line) {
        return None;
    }

    let line = PLATFORM_SUFFIX.replace(line, "");
    let line = line.trim().trim_end_matches([',', ';', '-', '–', '—']).trim_end();

    let chars = line.chars().count();
    if !(MIN_TITLE_CHARS..=MAX_TITLE_CHARS).contains(&chars) {
        return None;
    }
    if is_purely_numeric(line) {
        return None;
    }
    Some(line.to_string())
}

fn is_purely_numeric(line: &str) -> bool {
    line.chars().any(|c| c.is_ascii_digit())
        && line
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || c.is_ascii_punctuation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ParsingProfile, ParsingRule};

    fn marker_rules() -> RuleSet {
        RuleSet::compile(&ParsingProfile {
            name: "markers".into(),
            rules: vec![
                ParsingRule::new(FieldKind::GamesStart, r"games:"),
                ParsingRule::new(FieldKind::GamesEnd, r"price"),
            ],
        })
    }

    #[test]
    fn block_between_markers_is_cleaned() {
        let text = "Account for sale\nGames:\n- God of War\n12345\n2) Spider-Man PS4\nPrice: 1500";
        let games = extract_games(text, &marker_rules());
        assert_eq!(games, vec!["God of War".to_string(), "Spider-Man".to_string()]);
    }

    #[test]
    fn end_marker_is_applied_before_start_marker() {
        // The second "games:" sits after the end marker and must not open a block.
        let text = "Price: 1500\nGames: none here\nsomething";
        assert!(extract_games(text, &marker_rules()).is_empty());
    }

    #[test]
    fn no_start_match_means_no_games() {
        let text = "Just a listing\n- God of War";
        assert!(extract_games(text, &marker_rules()).is_empty());
    }

    #[test]
    fn titles_dedupe_case_insensitively_in_first_seen_order() {
        let titles = clean_title_lines("• Uncharted 4\n• The Last of Us\n• uncharted 4 PS5\n");
        assert_eq!(titles, vec!["Uncharted 4".to_string(), "The Last of Us".to_string()]);
    }

    #[test]
    fn noise_lines_are_dropped() {
        let long = "x".repeat(101);
        let block = format!("PS5\nP4 & P5\nab\n{long}\n— 2 —\n1. Ghost of Tsushima (P4 & P5)\n");
        assert_eq!(clean_title_lines(&block), vec!["Ghost of Tsushima".to_string()]);
    }

    #[test]
    fn non_latin_titles_survive() {
        let titles = clean_title_lines("🎮 Ведьмак 3: Дикая Охота PS4\r\n⭐️ ファイナルファンタジーVII\n");
        assert_eq!(
            titles,
            vec!["Ведьмак 3: Дикая Охота".to_string(), "ファイナルファンタジーVII".to_string()]
        );
    }
}
