use psac_core::ParsedResult;
use tracing::{debug, warn};

use crate::capacity::classify_capacity;
use crate::games::extract_games;
use crate::profile::{FieldKind, RuleSet};
use crate::{strip_decorations, ParseError};

/// Upper bound on the message size the parser will look at.
pub const MAX_INPUT_BYTES: usize = 64 * 1024;

const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct MessageParser {
    max_input_bytes: usize,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self {
            max_input_bytes: MAX_INPUT_BYTES,
        }
    }
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_input_bytes(mut self, max: usize) -> Self {
        self.max_input_bytes = max;
        self
    }

    /// Parse a listing post. Empty input yields `None` without touching the
    /// rules; internal failures are logged and also yield `None`. A post that
    /// matches no rule still parses, with every field at its default.
    pub fn parse(&self, raw_text: &str, message_key: &str, rules: &RuleSet) -> Option<ParsedResult> {
        if raw_text.trim().is_empty() {
            return None;
        }
        match self.try_parse(raw_text, message_key, rules) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(message_key, profile = rules.name(), error = %err, "message parse failed");
                None
            }
        }
    }

    pub fn try_parse(&self, raw_text: &str, message_key: &str, rules: &RuleSet) -> Result<ParsedResult, ParseError> {
        if raw_text.len() > self.max_input_bytes {
            return Err(ParseError::InputTooLarge {
                len: raw_text.len(),
                max: self.max_input_bytes,
            });
        }

        let stripped = strip_decorations(raw_text);
        let games = extract_games(raw_text, rules);

        let capacity_info = rules.first_value(FieldKind::Capacity, &stripped);
        let capacity = classify_capacity(capacity_info.as_deref());

        let title = games
            .first()
            .cloned()
            .or_else(|| first_meaningful_line(&stripped))
            .map(|t| truncate_chars(&t, MAX_TITLE_CHARS));

        let parsed = ParsedResult {
            external_id: Some(message_key.to_string()).filter(|k| !k.trim().is_empty()),
            title,
            price_ps4: rules
                .first_value(FieldKind::PricePs4, &stripped)
                .and_then(|v| parse_price(&v)),
            price_ps5: rules
                .first_value(FieldKind::PricePs5, &stripped)
                .and_then(|v| parse_price(&v)),
            region: rules.first_value(FieldKind::Region, &stripped),
            capacity_info,
            capacity,
            has_original_mail: rules.any_match(FieldKind::OriginalMail, &stripped),
            guarantee: rules.first_value(FieldKind::Guarantee, &stripped),
            seller_info: rules.first_value(FieldKind::SellerInfo, &stripped),
            additional_info: rules.first_value(FieldKind::AdditionalInfo, &stripped),
            games,
            is_sold: rules.any_match(FieldKind::SoldStatus, &stripped),
        };
        debug!(
            message_key,
            games = parsed.games.len(),
            sold = parsed.is_sold,
            "parsed listing"
        );
        Ok(parsed)
    }
}

/// Parse a captured amount such as `1 500`, `1,500`, `10,50` or `2.999`.
///
/// A single separator followed by exactly three trailing digits is read as a
/// thousands separator; otherwise `,` and `.` are decimal points.
pub fn parse_price(raw: &str) -> Option<f64> {
    let compact = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .collect::<String>();
    let compact = compact.trim_end_matches(['.', ',']);
    if compact.is_empty() {
        return None;
    }

    let separators = compact.chars().filter(|c| *c == '.' || *c == ',').count();
    let normalized = if separators == 0 {
        compact.to_string()
    } else if separators == 1 {
        let pos = compact.rfind(['.', ',']).unwrap_or(0);
        let fraction = &compact[pos + 1..];
        if fraction.len() == 3 {
            compact.replace(['.', ','], "")
        } else {
            compact.replace(',', ".")
        }
    } else {
        // Several separators: the last one is decimal only if it is followed by
        // fewer than three digits.
        let pos = compact.rfind(['.', ',']).unwrap_or(0);
        let (int_part, fraction) = compact.split_at(pos);
        let int_part = int_part.replace(['.', ','], "");
        let fraction = &fraction[1..];
        if fraction.len() == 3 {
            format!("{int_part}{fraction}")
        } else {
            format!("{int_part}.{fraction}")
        }
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn first_meaningful_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| line.chars().count() >= 3 && line.chars().any(char::is_alphabetic))
        .map(ToString::to_string)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{default_profile, ParsingProfile};
    use psac_core::CapacityTier;

    fn default_rules() -> RuleSet {
        RuleSet::compile(&default_profile())
    }

    const LISTING: &str = "🔥 Аккаунт PS4/PS5 🔥\n\
        Игры:\n\
        1. God of War Ragnarök PS5\n\
        2. Spider-Man 2\n\
        3. Gran Turismo 7 (P4 & P5)\n\
        Цена PS4: 1 500 ₽\n\
        Цена PS5: 2 300₽\n\
        Регион: Турция\n\
        Тип: П2\n\
        Родная почта в комплекте\n\
        Гарантия: 30 дней\n\
        Продавец: @seller_bot";

    #[test]
    fn full_listing_is_extracted() {
        let parsed = MessageParser::new()
            .parse(LISTING, "4821", &default_rules())
            .expect("parsed");

        assert_eq!(parsed.external_id.as_deref(), Some("4821"));
        assert_eq!(
            parsed.games,
            vec![
                "God of War Ragnarök".to_string(),
                "Spider-Man 2".to_string(),
                "Gran Turismo 7".to_string()
            ]
        );
        assert_eq!(parsed.title.as_deref(), Some("God of War Ragnarök"));
        assert_eq!(parsed.price_ps4, Some(1500.0));
        assert_eq!(parsed.price_ps5, Some(2300.0));
        assert_eq!(parsed.region.as_deref(), Some("Турция"));
        assert_eq!(parsed.capacity, CapacityTier::Hybrid);
        assert!(parsed.has_original_mail);
        assert_eq!(parsed.guarantee.as_deref(), Some("30 дней"));
        assert_eq!(parsed.seller_info.as_deref(), Some("@seller_bot"));
        assert!(!parsed.is_sold);
    }

    #[test]
    fn sold_marker_in_any_language_is_detected() {
        let parser = MessageParser::new();
        let rules = default_rules();
        let ru = parser.parse("✅ ПРОДАНО ✅\nИгры:\n- Elden Ring", "1", &rules).unwrap();
        let en = parser.parse("SOLD OUT - Elden Ring account", "2", &rules).unwrap();
        assert!(ru.is_sold);
        assert!(en.is_sold);
    }

    #[test]
    fn empty_input_is_not_parsed() {
        let parser = MessageParser::new();
        assert_eq!(parser.parse("", "1", &default_rules()), None);
        assert_eq!(parser.parse("   \n ", "1", &default_rules()), None);
    }

    #[test]
    fn unmatched_text_yields_default_fields() {
        let empty_rules = RuleSet::compile(&ParsingProfile {
            name: "empty".into(),
            rules: Vec::new(),
        });
        let parsed = MessageParser::new()
            .parse("hello there", "9", &empty_rules)
            .expect("parsed");
        assert_eq!(parsed.title.as_deref(), Some("hello there"));
        assert_eq!(parsed.price_ps4, None);
        assert_eq!(parsed.capacity, CapacityTier::Unknown);
        assert!(parsed.games.is_empty());
        assert!(!parsed.is_sold);
    }

    #[test]
    fn oversized_input_degrades_to_none() {
        let parser = MessageParser::new().with_max_input_bytes(16);
        let text = "Игры:\n- a fairly long title that exceeds the limit";
        assert!(matches!(
            parser.try_parse(text, "1", &default_rules()),
            Err(ParseError::InputTooLarge { .. })
        ));
        assert_eq!(parser.parse(text, "1", &default_rules()), None);
    }

    #[test]
    fn prices_accept_common_separators() {
        assert_eq!(parse_price("1 500"), Some(1500.0));
        assert_eq!(parse_price("1,500"), Some(1500.0));
        assert_eq!(parse_price("10,50"), Some(10.5));
        assert_eq!(parse_price("2.5"), Some(2.5));
        assert_eq!(parse_price("1.234,56"), Some(1234.56));
        assert_eq!(parse_price("1 500."), Some(1500.0));
        assert_eq!(parse_price(""), None);
    }
}
