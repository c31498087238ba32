use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// all-MiniLM-L6-v2 width; the provider decides the real value at runtime
pub const DEFAULT_DIMENSION: usize = 384;

/// Stable transaction identifier. Rendered as `TXN000042`.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
#[serde(try_from = "RawTxnId", into = "String")]
pub struct TxnId(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTxnId {
    Number(u64),
    Text(String),
}

impl TryFrom<RawTxnId> for TxnId {
    type Error = String;

    fn try_from(raw: RawTxnId) -> Result<Self, Self::Error> {
        match raw {
            RawTxnId::Number(n) => Ok(TxnId(n)),
            RawTxnId::Text(s) => s.parse(),
        }
    }
}

impl From<TxnId> for String {
    fn from(id: TxnId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TXN{:06}", self.0)
    }
}

impl FromStr for TxnId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = match trimmed.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("TXN") => &trimmed[3..],
            _ => trimmed,
        };
        digits
            .parse::<u64>()
            .map(TxnId)
            .map_err(|_| format!("invalid transaction id '{}'", s))
    }
}

/// Signed currency value in minor units (two decimal places).
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[archive(check_bytes)]
pub struct Amount(i64);

impl Amount {
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn from_major(value: f64) -> Self {
        Self((value * 100.0).round() as i64)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn as_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// One minor unit up, `None` past `i64::MAX`.
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    pub fn checked_prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = String;

    /// Parses `150`, `150.5`, `-20.25`. More than two fraction digits is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid amount '{}'", s);
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if body.ends_with('.') {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        let minor = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(cents))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -minor } else { minor }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_major())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <f64 as Deserialize>::deserialize(deserializer)?;
        if !value.is_finite() {
            return Err(serde::de::Error::custom("amount must be finite"));
        }
        Ok(Self::from_major(value))
    }
}

/// Calendar date, kept as days from the common era so it archives as a plain integer.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub struct TxDate(i32);

impl TxDate {
    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date.num_days_from_ce())
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self::from_naive)
    }

    pub fn to_naive(self) -> Option<NaiveDate> {
        NaiveDate::from_num_days_from_ce_opt(self.0)
    }

    pub fn next_day(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn prev_day(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for TxDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_naive() {
            Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            None => write!(f, "day#{}", self.0),
        }
    }
}

impl FromStr for TxDate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Self::from_naive)
            .map_err(|e| format!("invalid date '{}': {}", s, e))
    }
}

impl Serialize for TxDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as Deserialize>::deserialize(deserializer)?;
        // Accept full ISO timestamps too; only the date part matters.
        let date_part = raw.get(..10).unwrap_or(&raw);
        date_part.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[archive(check_bytes)]
pub enum Category {
    #[serde(rename = "Food & Dining")]
    FoodAndDining,
    Shopping,
    Transportation,
    Entertainment,
    #[serde(rename = "Bills & Utilities")]
    BillsAndUtilities,
    Healthcare,
    Travel,
    Education,
    Income,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::FoodAndDining,
        Category::Shopping,
        Category::Transportation,
        Category::Entertainment,
        Category::BillsAndUtilities,
        Category::Healthcare,
        Category::Travel,
        Category::Education,
        Category::Income,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::FoodAndDining => "Food & Dining",
            Category::Shopping => "Shopping",
            Category::Transportation => "Transportation",
            Category::Entertainment => "Entertainment",
            Category::BillsAndUtilities => "Bills & Utilities",
            Category::Healthcare => "Healthcare",
            Category::Travel => "Travel",
            Category::Education => "Education",
            Category::Income => "Income",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[archive(check_bytes)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    #[default]
    Debit,
    Credit,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnKind::Debit => f.write_str("debit"),
            TxnKind::Credit => f.write_str("credit"),
        }
    }
}

/// A transaction as held by the record store: metadata plus its embedding.
/// Immutable once ingested.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Transaction {
    pub id: TxnId,
    pub user_id: String,
    pub description: String,
    pub merchant: String,
    pub category: Category,
    pub kind: TxnKind,
    pub amount: Amount,
    pub date: TxDate,

    /// Computed once at ingestion from `embedding_text()`.
    #[serde(skip_serializing, default)]
    pub embedding: Vec<f32>,
}

impl Transaction {
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.description, self.category, &self.merchant, self.amount, self.kind)
    }
}

/// Ingestion-side record, before the embedding has been computed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewTransaction {
    #[serde(alias = "transaction_id")]
    pub id: TxnId,
    pub user_id: String,
    pub description: String,
    #[serde(default)]
    pub merchant: String,
    pub category: Category,
    #[serde(default, alias = "type")]
    pub kind: TxnKind,
    pub amount: Amount,
    pub date: TxDate,
}

impl NewTransaction {
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.description, self.category, &self.merchant, self.amount, self.kind)
    }

    pub fn with_embedding(self, embedding: Vec<f32>) -> Transaction {
        Transaction {
            id: self.id,
            user_id: self.user_id,
            description: self.description,
            merchant: self.merchant,
            category: self.category,
            kind: self.kind,
            amount: self.amount,
            date: self.date,
            embedding,
        }
    }
}

fn embedding_text(description: &str, category: Category, merchant: &str, amount: Amount, kind: TxnKind) -> String {
    let amount = format!("Amount: {}", amount);
    let kind = format!("Type: {}", kind);
    [description, category.name(), merchant, amount.as_str(), kind.as_str()]
        .iter()
        .filter(|part| !part.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" | ")
}
