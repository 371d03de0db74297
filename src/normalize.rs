// 🧹 Normalizer - canonical forms for names, places and identifiers
//
// Problem solved:
// - "Acme Foods, Inc.", "ACME FOODS LLC", "The Acme Foods Co" → "acme foods"
// - "12-3456789" / "123456789" → "123456789"
// - "New York" / "ny" / "N.Y." → "NY"
//
// Every function here is total (garbage in → empty string out) and
// idempotent (normalizing a normalized value is a no-op). The lookup tables
// are immutable and passed in explicitly through `Normalizer`.

use crate::config::NormalizerConfig;
use crate::entities::IdentifierKind;
use std::collections::{HashMap, HashSet};

// ============================================================================
// LOOKUP TABLES
// ============================================================================

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "llc", "llp", "lp", "ltd", "limited",
    "co", "company", "plc", "pc", "pllc", "lc", "pa", "na", "gmbh", "sa",
];

const STOPWORDS: &[&str] = &["the", "of", "and", "a", "an"];

const NAME_ABBREVIATIONS: &[(&str, &str)] = &[
    ("intl", "international"),
    ("mfg", "manufacturing"),
    ("natl", "national"),
    ("svc", "service"),
    ("svcs", "services"),
    ("assn", "association"),
    ("assoc", "association"),
    ("dept", "department"),
    ("hosp", "hospital"),
    ("univ", "university"),
    ("ctr", "center"),
    ("bros", "brothers"),
    ("mgmt", "management"),
    ("grp", "group"),
    ("hldgs", "holdings"),
];

const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("street", "st"),
    ("avenue", "ave"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("suite", "ste"),
    ("highway", "hwy"),
    ("place", "pl"),
    ("court", "ct"),
    ("parkway", "pkwy"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
];

const CITY_PREFIXES: &[(&str, &str)] = &[("st", "saint"), ("ft", "fort"), ("mt", "mount")];

const STATES: &[(&str, &str)] = &[
    ("alabama", "AL"), ("alaska", "AK"), ("arizona", "AZ"), ("arkansas", "AR"),
    ("california", "CA"), ("colorado", "CO"), ("connecticut", "CT"), ("delaware", "DE"),
    ("district of columbia", "DC"), ("florida", "FL"), ("georgia", "GA"), ("hawaii", "HI"),
    ("idaho", "ID"), ("illinois", "IL"), ("indiana", "IN"), ("iowa", "IA"),
    ("kansas", "KS"), ("kentucky", "KY"), ("louisiana", "LA"), ("maine", "ME"),
    ("maryland", "MD"), ("massachusetts", "MA"), ("michigan", "MI"), ("minnesota", "MN"),
    ("mississippi", "MS"), ("missouri", "MO"), ("montana", "MT"), ("nebraska", "NE"),
    ("nevada", "NV"), ("new hampshire", "NH"), ("new jersey", "NJ"), ("new mexico", "NM"),
    ("new york", "NY"), ("north carolina", "NC"), ("north dakota", "ND"), ("ohio", "OH"),
    ("oklahoma", "OK"), ("oregon", "OR"), ("pennsylvania", "PA"), ("puerto rico", "PR"),
    ("rhode island", "RI"), ("south carolina", "SC"), ("south dakota", "SD"),
    ("tennessee", "TN"), ("texas", "TX"), ("utah", "UT"), ("vermont", "VT"),
    ("virginia", "VA"), ("washington", "WA"), ("west virginia", "WV"),
    ("wisconsin", "WI"), ("wyoming", "WY"), ("guam", "GU"), ("virgin islands", "VI"),
];

/// Immutable lookup tables, built once at startup
#[derive(Debug, Clone)]
pub struct NormalizerTables {
    pub suffixes: HashSet<String>,
    pub stopwords: HashSet<String>,
    pub abbreviations: HashMap<String, String>,
    pub street_abbreviations: HashMap<String, String>,
    pub state_names: HashMap<String, String>,
    pub state_codes: HashSet<String>,
}

impl Default for NormalizerTables {
    fn default() -> Self {
        let to_set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        let to_map = |items: &[(&str, &str)]| {
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        NormalizerTables {
            suffixes: to_set(LEGAL_SUFFIXES),
            stopwords: to_set(STOPWORDS),
            abbreviations: to_map(NAME_ABBREVIATIONS),
            street_abbreviations: to_map(STREET_ABBREVIATIONS),
            state_names: to_map(STATES),
            state_codes: STATES.iter().map(|(_, code)| code.to_string()).collect(),
        }
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    tables: NormalizerTables,
}

impl Normalizer {
    pub fn new(tables: NormalizerTables) -> Self {
        Normalizer { tables }
    }

    /// Default tables extended with the configured extras
    ///
    /// Abbreviation expansions that would themselves be rewritten (another
    /// abbreviation key, a stopword or a suffix) are dropped so that name
    /// normalization stays idempotent.
    pub fn from_config(config: &NormalizerConfig) -> Self {
        let mut tables = NormalizerTables::default();
        tables
            .suffixes
            .extend(config.extra_suffixes.iter().map(|s| fold_token(s)));
        tables
            .stopwords
            .extend(config.extra_stopwords.iter().map(|s| fold_token(s)));
        for (short, long) in &config.abbreviations {
            tables.abbreviations.insert(fold_token(short), fold_token(long));
        }

        let keys: HashSet<String> = tables.abbreviations.keys().cloned().collect();
        let suffixes = tables.suffixes.clone();
        let stopwords = tables.stopwords.clone();
        tables.abbreviations.retain(|_, long| {
            !long.is_empty()
                && !keys.contains(long)
                && !suffixes.contains(long)
                && !stopwords.contains(long)
        });

        Normalizer { tables }
    }

    pub fn tables(&self) -> &NormalizerTables {
        &self.tables
    }

    /// Normalize an organization name
    ///
    /// Steps: fold case, `&` → "and", drop `.` and `'`, other punctuation →
    /// space, expand abbreviations, drop stopwords, strip trailing legal
    /// suffixes (repeatedly), collapse whitespace.
    pub fn normalize_name(&self, raw: &str) -> String {
        let cleaned = clean_text(&raw.to_lowercase().replace('&', " and "));

        let mut tokens: Vec<&str> = cleaned
            .split_whitespace()
            .map(|t| {
                self.tables
                    .abbreviations
                    .get(t)
                    .map(String::as_str)
                    .unwrap_or(t)
            })
            .filter(|t| !self.tables.stopwords.contains(*t))
            .collect();

        while let Some(last) = tokens.last() {
            if self.tables.suffixes.contains(*last) {
                tokens.pop();
            } else {
                break;
            }
        }

        tokens.join(" ")
    }

    /// Normalize a city name ("St. Louis" → "saint louis")
    pub fn normalize_city(&self, raw: &str) -> String {
        let cleaned = clean_text(&raw.to_lowercase());
        let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
        if let Some(first) = tokens.first_mut() {
            if let Some((_, long)) = CITY_PREFIXES.iter().find(|(short, _)| *short == *first) {
                *first = *long;
            }
        }
        tokens.join(" ")
    }

    /// Normalize a state to its two-letter code; unknown values → ""
    pub fn normalize_state(&self, raw: &str) -> String {
        let cleaned = clean_text(&raw.to_lowercase());
        let joined: String = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if joined.is_empty() {
            return String::new();
        }

        let upper = joined.replace(' ', "").to_uppercase();
        if upper.len() == 2 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
            return upper;
        }

        self.tables
            .state_names
            .get(&joined)
            .cloned()
            .unwrap_or_default()
    }

    /// Normalize a street line ("123 Main Street, Suite 4" → "123 main st ste 4")
    pub fn normalize_street(&self, raw: &str) -> String {
        let cleaned = clean_text(&raw.to_lowercase());
        cleaned
            .split_whitespace()
            .map(|t| {
                self.tables
                    .street_abbreviations
                    .get(t)
                    .map(String::as_str)
                    .unwrap_or(t)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether a code is a known USPS state/territory code
    pub fn is_known_state(&self, code: &str) -> bool {
        self.tables.state_codes.contains(code)
    }
}

// ============================================================================
// FREE FUNCTIONS
// ============================================================================

/// Canonicalize an identifier for its kind
///
/// Non-alphanumerics are stripped (numeric kinds keep digits only), letters
/// uppercased, then numeric kinds are left-padded with zeros and every kind is
/// truncated to its canonical width.
pub fn normalize_identifier(raw: &str, kind: IdentifierKind) -> String {
    let mut value: String = if kind.is_numeric() {
        raw.chars().filter(|c| c.is_ascii_digit()).collect()
    } else {
        raw.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    };

    if value.is_empty() {
        return value;
    }

    if let Some(width) = kind.width() {
        if value.len() > width {
            value.truncate(width);
        } else if kind.is_numeric() && value.len() < width {
            value = format!("{value:0>width$}");
        }
    }

    value
}

/// Five-digit postal code; fewer than 3 digits is treated as missing
pub fn normalize_zip(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        0..=2 => String::new(),
        3..=4 => format!("{digits:0>5}"),
        _ => digits[..5].to_string(),
    }
}

/// Normalized name tokens
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

/// Delete `.` and apostrophes, turn any other non-alphanumeric into a space
fn clean_text(lowered: &str) -> String {
    lowered
        .chars()
        .filter(|c| !matches!(c, '.' | '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect()
}

fn fold_token(s: &str) -> String {
    clean_text(&s.to_lowercase()).split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_strips_suffixes() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_name("Acme Foods, Inc."), "acme foods");
        assert_eq!(n.normalize_name("Acme Foods LLC"), "acme foods");
        assert_eq!(n.normalize_name("ACME FOODS CO INC"), "acme foods");
        assert_eq!(n.normalize_name("The Acme Foods Company"), "acme foods");
    }

    #[test]
    fn test_normalize_name_punctuation_and_stopwords() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_name("Bank of America, N.A."), "bank america");
        assert_eq!(n.normalize_name("Smith & Sons"), "smith sons");
        assert_eq!(n.normalize_name("O'Reilly Auto-Parts"), "oreilly auto parts");
        assert_eq!(n.normalize_name("Foods, Acme"), "foods acme");
    }

    #[test]
    fn test_normalize_name_abbreviations() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_name("Acme Intl Mfg Corp"), "acme international manufacturing");
    }

    #[test]
    fn test_normalize_name_is_total() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_name(""), "");
        assert_eq!(n.normalize_name("   "), "");
        assert_eq!(n.normalize_name("!!!"), "");
        assert_eq!(n.normalize_name("Inc."), "");
    }

    #[test]
    fn test_normalize_name_is_idempotent() {
        let n = Normalizer::default();
        let samples = [
            "Acme Foods, Inc.",
            "The Bank of New York Mellon Corp",
            "Smith & Sons Co. LLC",
            "İSTANBUL Holdings Ltd",
            "  weird -- spacing //  Co ",
            "Acme Intl Mfg",
            "",
        ];
        for raw in samples {
            let once = n.normalize_name(raw);
            assert_eq!(n.normalize_name(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_from_config_drops_unstable_abbreviations() {
        let mut config = NormalizerConfig::default();
        config.abbreviations.insert("hq".to_string(), "headquarters".to_string());
        config.abbreviations.insert("x".to_string(), "intl".to_string());
        config.abbreviations.insert("y".to_string(), "inc".to_string());
        config.extra_suffixes.push("AG".to_string());

        let n = Normalizer::from_config(&config);
        assert_eq!(n.normalize_name("Acme HQ AG"), "acme headquarters");
        assert!(!n.tables().abbreviations.contains_key("x"));
        assert!(!n.tables().abbreviations.contains_key("y"));
        let once = n.normalize_name("x y acme");
        assert_eq!(n.normalize_name(&once), once);
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("12-3456789", IdentifierKind::TaxId), "123456789");
        assert_eq!(normalize_identifier("3456789", IdentifierKind::TaxId), "003456789");
        assert_eq!(normalize_identifier("1234567890123", IdentifierKind::TaxId), "123456789");
        assert_eq!(normalize_identifier("320193", IdentifierKind::RegistryNumber), "0000320193");
        assert_eq!(normalize_identifier("brk.b", IdentifierKind::Ticker), "BRKB");
        assert_eq!(normalize_identifier("???", IdentifierKind::Lei), "");
    }

    #[test]
    fn test_normalize_identifier_is_idempotent() {
        for kind in IdentifierKind::ALL {
            for raw in ["12-3456789", "abc 123", "", "0000000000000000000000009"] {
                let once = normalize_identifier(raw, kind);
                assert_eq!(normalize_identifier(&once, kind), once);
            }
        }
    }

    #[test]
    fn test_normalize_state() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_state("NY"), "NY");
        assert_eq!(n.normalize_state("n.y."), "NY");
        assert_eq!(n.normalize_state("New York"), "NY");
        assert_eq!(n.normalize_state(" west  virginia "), "WV");
        assert_eq!(n.normalize_state("Atlantis"), "");
        assert_eq!(n.normalize_state(""), "");
        assert!(n.is_known_state("NY"));
    }

    #[test]
    fn test_normalize_city_and_street() {
        let n = Normalizer::default();
        assert_eq!(n.normalize_city("St. Louis"), "saint louis");
        assert_eq!(n.normalize_city("ROCHESTER"), "rochester");
        assert_eq!(n.normalize_street("123 Main Street, Suite 4"), "123 main st ste 4");
        let once = n.normalize_street("500 North Avenue");
        assert_eq!(n.normalize_street(&once), once);
    }

    #[test]
    fn test_normalize_zip() {
        assert_eq!(normalize_zip("14201-1234"), "14201");
        assert_eq!(normalize_zip("2134"), "02134");
        assert_eq!(normalize_zip("n/a"), "");
        assert_eq!(normalize_zip(&normalize_zip("14201-1234")), "14201");
    }
}
