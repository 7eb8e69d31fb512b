//! Free-text product grammar.
//!
//! The first non-empty line is the product name. Every following line is
//! either `label: value` (ASCII or full-width colon) or `label value`, and
//! may appear in any order. Lines that match no label are ignored unless
//! the parser is configured to reject them.

use chrono::{Datelike, Local, NaiveDate};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Twd,
    Jpy,
    Usd,
    Cny,
    Hkd,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Twd => "TWD",
            Currency::Jpy => "JPY",
            Currency::Usd => "USD",
            Currency::Cny => "CNY",
            Currency::Hkd => "HKD",
        }
    }

    /// ISO-4217 minor unit exponent.
    pub fn minor_exponent(&self) -> u32 {
        match self {
            Currency::Jpy => 0,
            _ => 2,
        }
    }

    pub fn from_code(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "TWD" | "NTD" => Some(Currency::Twd),
            "JPY" => Some(Currency::Jpy),
            "USD" => Some(Currency::Usd),
            "CNY" | "RMB" => Some(Currency::Cny),
            "HKD" => Some(Currency::Hkd),
            _ => None,
        }
    }

    /// `35000` minor units of TWD renders as `TWD 350`, `35050` as `TWD 350.50`.
    pub fn format_minor(&self, minor: u64) -> String {
        let scale = 10u64.pow(self.minor_exponent());
        let major = minor / scale;
        let fraction = minor % scale;
        if fraction == 0 {
            format!("{} {}", self.code(), major)
        } else {
            format!(
                "{} {}.{:0width$}",
                self.code(),
                major,
                fraction,
                width = self.minor_exponent() as usize
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedProduct {
    pub name: String,
    pub price_minor_units: u64,
    #[serde(rename = "currency_code")]
    pub currency: Currency,
    pub quantity: u32,
    pub arrival_date: Option<NaiveDate>,
    pub preorder_deadline: Option<NaiveDate>,
    pub media_ref: Option<String>,
}

impl ParsedProduct {
    pub fn display_price(&self) -> String {
        self.currency.format_minor(self.price_minor_units)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    Name,
    Price,
    Quantity,
}

impl MissingField {
    pub fn key(&self) -> &'static str {
        match self {
            MissingField::Name => "name",
            MissingField::Price => "price",
            MissingField::Quantity => "quantity",
        }
    }
}

/// User-facing names of the required fields.
#[derive(Debug, Clone)]
pub struct FieldLabels {
    pub name: String,
    pub price: String,
    pub quantity: String,
}

impl Default for FieldLabels {
    fn default() -> Self {
        Self {
            name: "商品名稱".to_string(),
            price: "價格".to_string(),
            quantity: "數量".to_string(),
        }
    }
}

impl FieldLabels {
    pub fn label(&self, field: MissingField) -> &str {
        match field {
            MissingField::Name => &self.name,
            MissingField::Price => &self.price,
            MissingField::Quantity => &self.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("product text rejected (missing: {missing:?}, unknown lines: {})", .unknown_lines.len())]
pub struct ValidationFailure {
    /// Always ordered name, price, quantity.
    pub missing: Vec<MissingField>,
    pub unknown_lines: Vec<String>,
}

impl ValidationFailure {
    pub fn missing_keys(&self) -> Vec<&'static str> {
        self.missing.iter().map(MissingField::key).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    pub default_currency: Currency,
    pub reject_unknown_lines: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            default_currency: Currency::Twd,
            reject_unknown_lines: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Price(Option<Currency>),
    Quantity,
    Arrival,
    Deadline,
}

const LABEL_TABLE: &[(&str, FieldKind)] = &[
    ("新台幣", FieldKind::Price(Some(Currency::Twd))),
    ("台幣", FieldKind::Price(Some(Currency::Twd))),
    ("臺幣", FieldKind::Price(Some(Currency::Twd))),
    ("twd", FieldKind::Price(Some(Currency::Twd))),
    ("ntd", FieldKind::Price(Some(Currency::Twd))),
    ("nt$", FieldKind::Price(Some(Currency::Twd))),
    ("日幣", FieldKind::Price(Some(Currency::Jpy))),
    ("日圓", FieldKind::Price(Some(Currency::Jpy))),
    ("日元", FieldKind::Price(Some(Currency::Jpy))),
    ("jpy", FieldKind::Price(Some(Currency::Jpy))),
    ("美金", FieldKind::Price(Some(Currency::Usd))),
    ("美元", FieldKind::Price(Some(Currency::Usd))),
    ("usd", FieldKind::Price(Some(Currency::Usd))),
    ("人民幣", FieldKind::Price(Some(Currency::Cny))),
    ("rmb", FieldKind::Price(Some(Currency::Cny))),
    ("cny", FieldKind::Price(Some(Currency::Cny))),
    ("港幣", FieldKind::Price(Some(Currency::Hkd))),
    ("hkd", FieldKind::Price(Some(Currency::Hkd))),
    ("價格", FieldKind::Price(None)),
    ("售價", FieldKind::Price(None)),
    ("單價", FieldKind::Price(None)),
    ("price", FieldKind::Price(None)),
    ("數量", FieldKind::Quantity),
    ("quantity", FieldKind::Quantity),
    ("qty", FieldKind::Quantity),
    ("預計到貨", FieldKind::Arrival),
    ("到貨日", FieldKind::Arrival),
    ("到貨", FieldKind::Arrival),
    ("arrival", FieldKind::Arrival),
    ("截止日", FieldKind::Deadline),
    ("收單日", FieldKind::Deadline),
    ("截止", FieldKind::Deadline),
    ("deadline", FieldKind::Deadline),
];

// Longest label first so `新台幣` wins over `台幣` in prefix matching.
static LABELS: Lazy<Vec<(&'static str, FieldKind)>> = Lazy::new(|| {
    let mut labels = LABEL_TABLE.to_vec();
    labels.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
    labels
});

const QUANTITY_UNITS: &[&str] = &["pcs", "pc", "個", "件", "組", "份", "入"];

#[derive(Debug, Clone)]
pub struct ProductTextParser {
    options: ParserOptions,
    reference_date: NaiveDate,
}

#[derive(Default)]
struct Fields {
    price: Option<Option<(u64, Currency)>>,
    quantity: Option<Option<u32>>,
    arrival: Option<NaiveDate>,
    deadline: Option<NaiveDate>,
}

impl ProductTextParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            reference_date: Local::now().date_naive(),
        }
    }

    /// Pins the date used to complete `MM/DD` shorthand.
    pub fn with_reference_date(mut self, reference_date: NaiveDate) -> Self {
        self.reference_date = reference_date;
        self
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedProduct, ValidationFailure> {
        let mut lines = raw.lines().map(str::trim).filter(|line| !line.is_empty());
        let mut fields = Fields::default();
        let mut unknown_lines = Vec::new();

        let name = match lines.next() {
            Some(first) => match self.classify(first) {
                Some((kind, value)) => {
                    self.apply(&mut fields, kind, &value);
                    None
                }
                None => Some(first.to_string()),
            },
            None => None,
        };

        for line in lines {
            match self.classify(line) {
                Some((kind, value)) => self.apply(&mut fields, kind, &value),
                None => unknown_lines.push(line.to_string()),
            }
        }

        let price = fields.price.flatten();
        let quantity = fields.quantity.flatten();

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push(MissingField::Name);
        }
        if price.is_none() {
            missing.push(MissingField::Price);
        }
        if quantity.is_none() {
            missing.push(MissingField::Quantity);
        }
        if !self.options.reject_unknown_lines {
            unknown_lines.clear();
        }

        match (name, price, quantity) {
            (Some(name), Some((price_minor_units, currency)), Some(quantity))
                if unknown_lines.is_empty() =>
            {
                Ok(ParsedProduct {
                    name,
                    price_minor_units,
                    currency,
                    quantity,
                    arrival_date: fields.arrival,
                    preorder_deadline: fields.deadline,
                    media_ref: None,
                })
            }
            _ => Err(ValidationFailure {
                missing,
                unknown_lines,
            }),
        }
    }

    // First occurrence of a field wins, even when its value was unparseable.
    fn apply(&self, fields: &mut Fields, kind: FieldKind, value: &str) {
        match kind {
            FieldKind::Price(label_currency) => {
                if fields.price.is_none() {
                    let currency = label_currency.unwrap_or(self.options.default_currency);
                    fields.price = Some(parse_amount(value, currency).map(|v| (v, currency)));
                }
            }
            FieldKind::Quantity => {
                if fields.quantity.is_none() {
                    fields.quantity = Some(parse_quantity(value));
                }
            }
            FieldKind::Arrival => {
                if fields.arrival.is_none() {
                    fields.arrival = parse_date(value, self.reference_date);
                }
            }
            FieldKind::Deadline => {
                if fields.deadline.is_none() {
                    fields.deadline = parse_date(value, self.reference_date);
                }
            }
        }
    }
}

impl ProductTextParser {
    fn classify(&self, line: &str) -> Option<(FieldKind, String)> {
        if let Some(idx) = line.find([':', '：']) {
            let label = line[..idx].trim().to_lowercase();
            let sep_len = line[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
            let value = line[idx + sep_len..].trim();
            return LABELS
                .iter()
                .find(|(candidate, _)| *candidate == label)
                .map(|(_, kind)| (*kind, value.to_string()));
        }

        // `台幣 350` / `數量20`: accept only when the remainder parses for that field.
        let lowered = line.to_lowercase();
        for (label, kind) in LABELS.iter() {
            let Some(rest) = lowered.strip_prefix(label) else {
                continue;
            };
            let value = rest.trim();
            if !value.is_empty() && self.value_parses(*kind, value) {
                return Some((*kind, value.to_string()));
            }
        }
        None
    }

    fn value_parses(&self, kind: FieldKind, value: &str) -> bool {
        match kind {
            FieldKind::Price(currency) => {
                parse_amount(value, currency.unwrap_or(self.options.default_currency)).is_some()
            }
            FieldKind::Quantity => parse_quantity(value).is_some(),
            FieldKind::Arrival | FieldKind::Deadline => {
                parse_date(value, self.reference_date).is_some()
            }
        }
    }
}

/// Folds full-width digits and the full-width `．` `／` `－` into ASCII, as
/// typed by CJK input methods.
fn ascii_digits(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '０'..='９' => char::from(b'0' + (ch as u32 - '０' as u32) as u8),
            '．' => '.',
            '／' => '/',
            '－' => '-',
            _ => ch,
        })
        .collect()
}

/// Parses a non-negative amount into minor units. Thousands separators and a
/// leading `$` or trailing `元`/`円` are tolerated.
pub fn parse_amount(value: &str, currency: Currency) -> Option<u64> {
    let value = ascii_digits(value);
    let cleaned: String = value
        .trim()
        .trim_start_matches('$')
        .trim_end_matches(['元', '円'])
        .chars()
        .filter(|ch| !matches!(ch, ',' | '，' | '_') && !ch.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (whole, fraction) = match cleaned.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (cleaned.as_str(), ""),
    };
    if whole.is_empty() || !whole.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    if !fraction.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }

    let exponent = currency.minor_exponent();
    if fraction.len() > exponent as usize {
        return None;
    }
    let scale = 10u64.pow(exponent);
    let major = whole.parse::<u64>().ok()?;
    let minor = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{fraction:0<width$}", width = exponent as usize);
        padded.parse::<u64>().ok()?
    };
    major.checked_mul(scale)?.checked_add(minor)
}

fn parse_quantity(value: &str) -> Option<u32> {
    let mut cleaned = ascii_digits(value).trim().to_lowercase();
    for unit in QUANTITY_UNITS {
        if let Some(stripped) = cleaned.strip_suffix(unit) {
            cleaned = stripped.trim().to_string();
            break;
        }
    }
    let digits: String = cleaned.chars().filter(|ch| *ch != ',').collect();
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok()
}

fn parse_date(value: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let value = ascii_digits(value);
    let value = value.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    let (month, day) = value.split_once('/')?;
    let month = month.trim().parse::<u32>().ok()?;
    let day = day.trim().parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(reference.year(), month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ProductTextParser {
        ProductTextParser::new(ParserOptions::default())
            .with_reference_date(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
    }

    #[test]
    fn parses_minimal_listing() {
        let product = parser().parse("Keychain\n台幣：350\n數量：20").unwrap();
        assert_eq!(product.name, "Keychain");
        assert_eq!(product.currency, Currency::Twd);
        assert_eq!(product.price_minor_units, 35_000);
        assert_eq!(product.quantity, 20);
        assert!(product.arrival_date.is_none());
        assert!(product.media_ref.is_none());
    }

    #[test]
    fn currency_label_selects_currency_code() {
        let cases = [
            ("台幣", Currency::Twd),
            ("新台幣", Currency::Twd),
            ("TWD", Currency::Twd),
            ("NT$", Currency::Twd),
            ("日幣", Currency::Jpy),
            ("JPY", Currency::Jpy),
            ("美金", Currency::Usd),
            ("usd", Currency::Usd),
            ("人民幣", Currency::Cny),
            ("RMB", Currency::Cny),
            ("港幣", Currency::Hkd),
            ("HKD", Currency::Hkd),
        ];
        for (label, currency) in cases {
            for (amount, major) in [("1,280", 1280u64), ("0", 0), ("35", 35), ("12,345,678", 12_345_678)] {
                let text = format!("Tote bag\n{label}：{amount}\n數量：3");
                let product = parser().parse(&text).unwrap_or_else(|e| panic!("{text}: {e}"));
                assert_eq!(product.currency, currency, "{text}");
                let scale = 10u64.pow(currency.minor_exponent());
                assert_eq!(product.price_minor_units, major * scale, "{text}");
            }
        }
    }

    #[test]
    fn generic_price_label_uses_default_currency() {
        let product = parser().parse("Mug\nprice: 99.5\nqty: 1").unwrap();
        assert_eq!(product.currency, Currency::Twd);
        assert_eq!(product.price_minor_units, 9_950);

        let yen = ProductTextParser::new(ParserOptions {
            default_currency: Currency::Jpy,
            reject_unknown_lines: false,
        })
        .parse("Mug\n價格：1,500\n數量：2")
        .unwrap();
        assert_eq!(yen.currency, Currency::Jpy);
        assert_eq!(yen.price_minor_units, 1_500);
    }

    #[test]
    fn fields_are_order_independent_and_accept_unspaced_form() {
        let product = parser()
            .parse("  Acrylic stand  \n數量20個\n\n美金 12.99\n到貨日：11/05")
            .unwrap();
        assert_eq!(product.name, "Acrylic stand");
        assert_eq!(product.quantity, 20);
        assert_eq!(product.currency, Currency::Usd);
        assert_eq!(product.price_minor_units, 1_299);
        assert_eq!(product.arrival_date, NaiveDate::from_ymd_opt(2026, 11, 5));
    }

    #[test]
    fn parses_optional_dates() {
        let product = parser()
            .parse("Plush\n日幣：2200\n數量：5\n預計到貨：2026-12-01\n截止日：2026/11/20")
            .unwrap();
        assert_eq!(product.arrival_date, NaiveDate::from_ymd_opt(2026, 12, 1));
        assert_eq!(product.preorder_deadline, NaiveDate::from_ymd_opt(2026, 11, 20));
    }

    #[test]
    fn malformed_dates_are_ignored() {
        let product = parser()
            .parse("Plush\n日幣：2200\n數量：5\n到貨日：13/45\n截止日：soon")
            .unwrap();
        assert!(product.arrival_date.is_none());
        assert!(product.preorder_deadline.is_none());
    }

    #[test]
    fn reports_missing_fields_in_fixed_order() {
        let cases: [(&str, &[&str]); 7] = [
            ("Keychain\n數量：20", &["price"]),
            ("Keychain\n台幣：350", &["quantity"]),
            ("台幣：350\n數量：20", &["name"]),
            ("Keychain", &["price", "quantity"]),
            ("數量：20", &["name", "price"]),
            ("", &["name", "price", "quantity"]),
            ("\n  \n", &["name", "price", "quantity"]),
        ];
        for (text, expected) in cases {
            let failure = parser().parse(text).expect_err(text);
            assert_eq!(failure.missing_keys(), expected.to_vec(), "{text:?}");
        }
    }

    #[test]
    fn invalid_amounts_count_as_missing_price() {
        for amount in ["-5", "abc", "3.456", "", "1.2.3"] {
            let text = format!("Keychain\n台幣：{amount}\n數量：1");
            let failure = parser().parse(&text).expect_err(&text);
            assert_eq!(failure.missing, vec![MissingField::Price], "{text}");
        }
        let failure = parser().parse("Keychain\n日幣：10.5\n數量：1").unwrap_err();
        assert_eq!(failure.missing, vec![MissingField::Price]);
    }

    #[test]
    fn negative_quantity_is_missing() {
        let failure = parser().parse("Keychain\n台幣：350\n數量：-1").unwrap_err();
        assert_eq!(failure.missing, vec![MissingField::Quantity]);
    }

    #[test]
    fn unknown_lines_are_ignored_by_default() {
        let product = parser()
            .parse("Keychain\n台幣：350\ncolour: red\n數量：20\nsee photo")
            .unwrap();
        assert_eq!(product.quantity, 20);
    }

    #[test]
    fn strict_mode_rejects_unknown_lines() {
        let strict = ProductTextParser::new(ParserOptions {
            default_currency: Currency::Twd,
            reject_unknown_lines: true,
        });
        let failure = strict
            .parse("Keychain\n台幣：350\ncolour: red\n數量：20")
            .unwrap_err();
        assert!(failure.missing.is_empty());
        assert_eq!(failure.unknown_lines, vec!["colour: red".to_string()]);
    }

    #[test]
    fn first_occurrence_wins() {
        let product = parser()
            .parse("Keychain\n台幣：350\n美金：10\n數量：20\n數量：30")
            .unwrap();
        assert_eq!(product.currency, Currency::Twd);
        assert_eq!(product.quantity, 20);
    }

    #[test]
    fn name_that_starts_like_a_label_stays_a_name() {
        let product = parser().parse("Priceless mug\nprice: 10\nqty: 2").unwrap();
        assert_eq!(product.name, "Priceless mug");
    }

    #[test]
    fn field_shaped_first_line_is_parsed_as_that_field() {
        let failure = parser().parse("價格：350\n數量：20").unwrap_err();
        assert_eq!(failure.missing_keys(), vec!["name"]);
        // a bare name line is never mistaken for a field
        let product = parser().parse("數量限定 Keychain\n價格：350\n數量：20").unwrap();
        assert_eq!(product.name, "數量限定 Keychain");
    }

    #[test]
    fn full_width_digits_are_accepted() {
        let product = parser()
            .parse("Keychain\n台幣：３５０\n數量：２０\n到貨日：２０２６／１１／０３")
            .unwrap();
        assert_eq!(product.price_minor_units, 35_000);
        assert_eq!(product.quantity, 20);
        assert_eq!(product.arrival_date, NaiveDate::from_ymd_opt(2026, 11, 3));

        let product = parser().parse("Mug\n美金 １２．５０\n數量２個").unwrap();
        assert_eq!(product.currency, Currency::Usd);
        assert_eq!(product.price_minor_units, 1_250);
        assert_eq!(product.quantity, 2);
        assert_eq!(parse_amount("１，２００", Currency::Jpy), Some(1_200));
    }

    #[test]
    fn formats_minor_units() {
        assert_eq!(Currency::Twd.format_minor(35_000), "TWD 350");
        assert_eq!(Currency::Usd.format_minor(1_299), "USD 12.99");
        assert_eq!(Currency::Usd.format_minor(1_205), "USD 12.05");
        assert_eq!(Currency::Jpy.format_minor(2_200), "JPY 2200");
    }
}
