//! Rule-based extraction of structured account data from listing posts.

use thiserror::Error;

pub mod capacity;
pub mod games;
pub mod parser;
pub mod profile;

pub use capacity::classify_capacity;
pub use games::{clean_title_lines, extract_games};
pub use parser::{MessageParser, MAX_INPUT_BYTES};
pub use profile::{
    default_profile, FieldKind, ParsingProfile, ParsingRule, ProfileRegistry, RuleSet, DEFAULT_PROFILE,
};

pub const CRATE_NAME: &str = "psac-parser";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid pattern for {field} in profile {profile}: {source}")]
    InvalidPattern {
        profile: String,
        field: FieldKind,
        #[source]
        source: regex::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing profiles yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is {len} bytes, limit is {max}")]
    InputTooLarge { len: usize, max: usize },
}

/// Remove emoji and other non-ASCII symbol characters, keeping letters of any
/// script, digits, punctuation, whitespace and currency signs.
pub fn strip_decorations(text: &str) -> String {
    text.chars().filter(|c| !is_decorative(*c)).collect()
}

fn is_decorative(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF
            | 0x2190..=0x2BFF
            | 0xFE00..=0xFE0F
            | 0x200D
            | 0x20E3
            | 0xE000..=0xF8FF
            | 0xE0020..=0xE007F
    )
}
