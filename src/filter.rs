//! Structured predicates over transaction metadata.
//!
//! A [`Predicate`] is a conjunction of [`Clause`]s. Clauses are validated
//! when they are built: unknown fields, operators that make no sense for a
//! field and unparsable values are rejected up front, so evaluation itself
//! cannot fail.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RetrievalError};
use crate::model::{Amount, Category, Transaction, TxDate};
use crate::parser;
use crate::storage::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    UserId,
    Category,
    Amount,
    Date,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::UserId => "user_id",
            Field::Category => "category",
            Field::Amount => "amount",
            Field::Date => "date",
        }
    }
}

impl FromStr for Field {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user_id" | "user" => Ok(Field::UserId),
            "category" => Ok(Field::Category),
            "amount" => Ok(Field::Amount),
            "date" => Ok(Field::Date),
            _ => Err(RetrievalError::InvalidFilterField(s.trim().to_string())),
        }
    }
}

/// Operator and value(s) as written by a caller, before type checking.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOp {
    Eq(String),
    Gt(String),
    Ge(String),
    Lt(String),
    Le(String),
    Between(String, String),
    In(Vec<String>),
}

/// Untyped clause, as produced by the expression parser or request glue.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClause {
    pub field: String,
    pub op: RawOp,
}

impl RawClause {
    pub fn new(field: impl Into<String>, op: RawOp) -> Self {
        Self { field: field.into(), op }
    }
}

/// A validated, typed condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Equality is a one-element set.
    UserIn(Vec<String>),
    CategoryIn(Vec<Category>),
    /// Inclusive bounds.
    AmountRange { min: Option<Amount>, max: Option<Amount> },
    DateRange { min: Option<TxDate>, max: Option<TxDate> },
}

impl Clause {
    pub fn field(&self) -> Field {
        match self {
            Clause::UserIn(_) => Field::UserId,
            Clause::CategoryIn(_) => Field::Category,
            Clause::AmountRange { .. } => Field::Amount,
            Clause::DateRange { .. } => Field::Date,
        }
    }

    pub fn matches(&self, record: &Transaction) -> bool {
        match self {
            Clause::UserIn(users) => users.iter().any(|u| *u == record.user_id),
            Clause::CategoryIn(cats) => cats.contains(&record.category),
            Clause::AmountRange { min, max } => within(record.amount, *min, *max),
            Clause::DateRange { min, max } => within(record.date, *min, *max),
        }
    }

    pub fn from_raw(raw: RawClause) -> Result<Self> {
        let field: Field = raw.field.parse()?;
        let unsupported = |op: &str| {
            RetrievalError::invalid(format!("operator {} is not supported on '{}'", op, field.name()))
        };

        match field {
            Field::UserId => match raw.op {
                RawOp::Eq(v) => Clause::users([v]),
                RawOp::In(vs) => Clause::users(vs),
                other => Err(unsupported(op_name(&other))),
            },
            Field::Category => match raw.op {
                RawOp::Eq(v) => Ok(Clause::CategoryIn(vec![parse_value(field, &v)?])),
                RawOp::In(vs) => {
                    let cats = vs.iter().map(|v| parse_value(field, v)).collect::<Result<Vec<Category>>>()?;
                    Clause::categories(cats)
                }
                other => Err(unsupported(op_name(&other))),
            },
            Field::Amount => {
                let (min, max) = bounds(field, raw.op, Amount::checked_next, Amount::checked_prev)?;
                Clause::amount(min, max)
            }
            Field::Date => {
                let (min, max) = bounds(field, raw.op, |d: TxDate| Some(d.next_day()), |d: TxDate| Some(d.prev_day()))?;
                Clause::date(min, max)
            }
        }
    }

    pub fn users<I, S>(users: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users: Vec<String> = users.into_iter().map(|u| u.into().trim().to_string()).collect();
        if users.is_empty() || users.iter().any(String::is_empty) {
            return Err(RetrievalError::invalid("user_id filter needs at least one non-empty value"));
        }
        Ok(Clause::UserIn(users))
    }

    pub fn categories<I: IntoIterator<Item = Category>>(cats: I) -> Result<Self> {
        let cats: Vec<Category> = cats.into_iter().collect();
        if cats.is_empty() {
            return Err(RetrievalError::invalid("category filter needs at least one value"));
        }
        Ok(Clause::CategoryIn(cats))
    }

    pub fn amount(min: Option<Amount>, max: Option<Amount>) -> Result<Self> {
        check_range(Field::Amount, min, max)?;
        Ok(Clause::AmountRange { min, max })
    }

    pub fn date(min: Option<TxDate>, max: Option<TxDate>) -> Result<Self> {
        check_range(Field::Date, min, max)?;
        Ok(Clause::DateRange { min, max })
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn range<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, min: &Option<T>, max: &Option<T>) -> fmt::Result {
            match (min, max) {
                (Some(lo), Some(hi)) => write!(f, "{} BETWEEN {} AND {}", name, lo, hi),
                (Some(lo), None) => write!(f, "{} >= {}", name, lo),
                (None, Some(hi)) => write!(f, "{} <= {}", name, hi),
                (None, None) => write!(f, "{} ANY", name),
            }
        }

        match self {
            Clause::UserIn(users) => {
                let quoted: Vec<String> = users.iter().map(|u| format!("'{}'", u)).collect();
                write!(f, "user_id IN ({})", quoted.join(", "))
            }
            Clause::CategoryIn(cats) => {
                let quoted: Vec<String> = cats.iter().map(|c| format!("'{}'", c)).collect();
                write!(f, "category IN ({})", quoted.join(", "))
            }
            Clause::AmountRange { min, max } => range(f, "amount", min, max),
            Clause::DateRange { min, max } => range(f, "date", min, max),
        }
    }
}

/// Conjunction of clauses. The empty predicate matches every record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    /// Parses `amount >= 10000 AND category = 'Travel'` style expressions.
    pub fn parse(expr: &str) -> Result<Self> {
        if expr.trim().is_empty() {
            return Ok(Self::all());
        }
        let raw = parser::parse_filter(expr).map_err(|e| RetrievalError::invalid(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_raw<I: IntoIterator<Item = RawClause>>(raw: I) -> Result<Self> {
        let clauses = raw.into_iter().map(Clause::from_raw).collect::<Result<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Adds a clause given by field name; unknown names fail here, not at evaluation.
    pub fn with(self, field: &str, op: RawOp) -> Result<Self> {
        Ok(self.and(Clause::from_raw(RawClause::new(field, op))?))
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, record: &Transaction) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }

    /// Fraction of records matching, estimated over an evenly strided
    /// sample of at most `sample` records. Deterministic for a given store.
    pub fn selectivity(&self, store: &dyn RecordStore, sample: usize) -> f64 {
        let total = store.len();
        if self.is_empty() || total == 0 {
            return 1.0;
        }
        let sample = sample.clamp(1, total);
        let stride = total as f64 / sample as f64;

        let mut hits = 0usize;
        for i in 0..sample {
            let pos = ((i as f64 * stride) as usize).min(total - 1);
            if let Some(record) = store.at(pos) {
                if self.matches(record) {
                    hits += 1;
                }
            }
        }
        hits as f64 / sample as f64
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str("TRUE");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

fn within<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> bool {
    min.map_or(true, |lo| value >= lo) && max.map_or(true, |hi| value <= hi)
}

fn check_range<T: PartialOrd + fmt::Display>(field: Field, min: Option<T>, max: Option<T>) -> Result<()> {
    if let (Some(lo), Some(hi)) = (&min, &max) {
        if lo > hi {
            return Err(RetrievalError::invalid(format!("empty {} range: {} > {}", field.name(), lo, hi)));
        }
    }
    Ok(())
}

fn op_name(op: &RawOp) -> &'static str {
    match op {
        RawOp::Eq(_) => "=",
        RawOp::Gt(_) => ">",
        RawOp::Ge(_) => ">=",
        RawOp::Lt(_) => "<",
        RawOp::Le(_) => "<=",
        RawOp::Between(..) => "BETWEEN",
        RawOp::In(_) => "IN",
    }
}

fn parse_value<T: FromStr<Err = String>>(field: Field, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e: String| RetrievalError::invalid(format!("{}: {}", field.name(), e)))
}

/// Strict bounds are stored inclusive. A bound with no neighbour in the
/// value range is rejected rather than wrapped.
fn strict<T: FromStr<Err = String>>(field: Field, raw: &str, step: impl Fn(T) -> Option<T>) -> Result<T> {
    step(parse_value(field, raw)?).ok_or_else(|| {
        RetrievalError::invalid(format!("{}: strict bound {} is out of range", field.name(), raw))
    })
}

/// Turns an ordered-field operator into inclusive bounds. Strict bounds
/// step to the adjacent representable value.
fn bounds<T, U, D>(field: Field, op: RawOp, up: U, down: D) -> Result<(Option<T>, Option<T>)>
where
    T: FromStr<Err = String> + Copy,
    U: Fn(T) -> Option<T>,
    D: Fn(T) -> Option<T>,
{
    Ok(match op {
        RawOp::Eq(v) => {
            let v = parse_value(field, &v)?;
            (Some(v), Some(v))
        }
        RawOp::Ge(v) => (Some(parse_value(field, &v)?), None),
        RawOp::Gt(v) => (Some(strict(field, &v, up)?), None),
        RawOp::Le(v) => (None, Some(parse_value(field, &v)?)),
        RawOp::Lt(v) => (None, Some(strict(field, &v, down)?)),
        RawOp::Between(lo, hi) => (Some(parse_value(field, &lo)?), Some(parse_value(field, &hi)?)),
        RawOp::In(_) => {
            return Err(RetrievalError::invalid(format!("operator IN is not supported on '{}'", field.name())));
        }
    })
}
