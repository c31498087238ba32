//! Rule-based digests over a set of transactions: totals per category,
//! per user and per month, plus a couple of headline figures.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::model::{Amount, Category, Transaction, TxnKind};

pub const TOP_CATEGORIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub overview: Overview,
    pub by_category: BTreeMap<String, CategorySummary>,
    pub top_categories: Vec<TopCategory>,
    pub by_user: BTreeMap<String, Flow>,
    pub by_month: BTreeMap<String, Flow>,
    pub insights: Insights,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub total_transactions: usize,
    pub total_debit: Amount,
    pub total_credit: Amount,
    pub net_balance: Amount,
    pub average_transaction: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub count: usize,
    pub total_amount: Amount,
    pub average_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopCategory {
    pub category: Category,
    pub total_amount: Amount,
    pub transaction_count: usize,
}

/// Debits and credits of one user or one calendar month.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Flow {
    pub transaction_count: usize,
    pub total_debit: Amount,
    pub total_credit: Amount,
    pub net_balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    /// Largest non-income category by total amount.
    pub top_spending_category: Option<Category>,
    pub top_spending_amount: Amount,
    /// `(credit - debit) / credit` in percent, two decimals. Zero without credits.
    pub savings_rate: f64,
}

#[derive(Default)]
struct Tally {
    count: usize,
    debit: i64,
    credit: i64,
}

impl Tally {
    fn add(&mut self, t: &Transaction) {
        self.count += 1;
        let minor = t.amount.minor();
        match t.kind {
            TxnKind::Debit => self.debit = self.debit.saturating_add(minor),
            TxnKind::Credit => self.credit = self.credit.saturating_add(minor),
        }
    }

    fn total(&self) -> i64 {
        self.debit.saturating_add(self.credit)
    }

    fn flow(&self) -> Flow {
        Flow {
            transaction_count: self.count,
            total_debit: Amount::from_minor(self.debit),
            total_credit: Amount::from_minor(self.credit),
            net_balance: Amount::from_minor(self.credit.saturating_sub(self.debit)),
        }
    }
}

fn average(total: i64, count: usize) -> Amount {
    Amount::from_minor((total as f64 / count.max(1) as f64).round() as i64)
}

/// Summarises `records`. Returns `None` for an empty input.
pub fn summarize<'a, I>(records: I) -> Option<Summary>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    let mut all = Tally::default();
    let mut categories: BTreeMap<Category, Tally> = BTreeMap::new();
    let mut users: BTreeMap<String, Tally> = BTreeMap::new();
    let mut months: BTreeMap<String, Tally> = BTreeMap::new();

    for t in records {
        all.add(t);
        categories.entry(t.category).or_default().add(t);
        users.entry(t.user_id.clone()).or_default().add(t);
        if let Some(day) = t.date.to_naive() {
            months.entry(day.format("%Y-%m").to_string()).or_default().add(t);
        }
    }

    if all.count == 0 {
        return None;
    }

    let mut ranked: Vec<(Category, &Tally)> = categories.iter().map(|(c, tally)| (*c, tally)).collect();
    // Highest total first; equal totals keep category order.
    ranked.sort_by(|a, b| b.1.total().cmp(&a.1.total()).then(a.0.cmp(&b.0)));

    let top_spending = ranked.iter().find(|(c, _)| *c != Category::Income);

    let savings_rate = if all.credit > 0 {
        let rate = (all.credit - all.debit) as f64 / all.credit as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    } else {
        0.0
    };

    Some(Summary {
        overview: Overview {
            total_transactions: all.count,
            total_debit: Amount::from_minor(all.debit),
            total_credit: Amount::from_minor(all.credit),
            net_balance: Amount::from_minor(all.credit.saturating_sub(all.debit)),
            average_transaction: average(all.total(), all.count),
        },
        by_category: categories
            .iter()
            .map(|(c, tally)| {
                let summary = CategorySummary {
                    count: tally.count,
                    total_amount: Amount::from_minor(tally.total()),
                    average_amount: average(tally.total(), tally.count),
                };
                (c.name().to_string(), summary)
            })
            .collect(),
        top_categories: ranked
            .iter()
            .take(TOP_CATEGORIES)
            .map(|(c, tally)| TopCategory {
                category: *c,
                total_amount: Amount::from_minor(tally.total()),
                transaction_count: tally.count,
            })
            .collect(),
        by_user: users.iter().map(|(u, tally)| (u.clone(), tally.flow())).collect(),
        by_month: months.iter().map(|(m, tally)| (m.clone(), tally.flow())).collect(),
        insights: Insights {
            top_spending_category: top_spending.map(|(c, _)| *c),
            top_spending_amount: top_spending.map_or(Amount::default(), |(_, tally)| Amount::from_minor(tally.total())),
            savings_rate,
        },
    })
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.overview;
        writeln!(f, "Financial Summary")?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "Overview:")?;
        writeln!(f, "  Total transactions:  {}", o.total_transactions)?;
        writeln!(f, "  Total spent:         {}", o.total_debit)?;
        writeln!(f, "  Total earned:        {}", o.total_credit)?;
        writeln!(f, "  Net balance:         {}", o.net_balance)?;
        writeln!(f, "  Average transaction: {}", o.average_transaction)?;
        writeln!(f)?;
        writeln!(f, "Top categories:")?;
        for (i, top) in self.top_categories.iter().take(3).enumerate() {
            writeln!(f, "  {}. {}: {} ({} transactions)", i + 1, top.category, top.total_amount, top.transaction_count)?;
        }
        writeln!(f)?;
        writeln!(f, "Insights:")?;
        match self.insights.top_spending_category {
            Some(c) => writeln!(f, "  Highest spending category: {} ({})", c, self.insights.top_spending_amount)?,
            None => writeln!(f, "  Highest spending category: none")?,
        }
        write!(f, "  Savings rate: {:.2}%", self.insights.savings_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TxDate, TxnId};
    use pretty_assertions::assert_eq;

    fn txn(id: u64, user: &str, category: Category, kind: TxnKind, minor: i64, date: &str) -> Transaction {
        Transaction {
            id: TxnId(id),
            user_id: user.into(),
            description: format!("txn {}", id),
            merchant: String::new(),
            category,
            kind,
            amount: Amount::from_minor(minor),
            date: date.parse::<TxDate>().unwrap(),
            embedding: vec![],
        }
    }

    fn month_of_spending() -> Vec<Transaction> {
        vec![
            txn(1, "USER001", Category::Income, TxnKind::Credit, 5_000_000, "2024-01-31"),
            txn(2, "USER001", Category::BillsAndUtilities, TxnKind::Debit, 1_500_000, "2024-01-01"),
            txn(3, "USER001", Category::FoodAndDining, TxnKind::Debit, 15_000, "2024-01-05"),
            txn(4, "USER002", Category::FoodAndDining, TxnKind::Debit, 20_001, "2024-02-02"),
        ]
    }

    #[test]
    fn empty_input_has_no_summary() {
        assert!(summarize(&Vec::<Transaction>::new()).is_none());
    }

    #[test]
    fn overview_and_savings_rate() {
        let s = summarize(&month_of_spending()).unwrap();
        assert_eq!(s.overview.total_transactions, 4);
        assert_eq!(s.overview.total_debit, Amount::from_minor(1_535_001));
        assert_eq!(s.overview.total_credit, Amount::from_minor(5_000_000));
        assert_eq!(s.overview.net_balance, Amount::from_minor(3_464_999));
        // 6_535_001 / 4 = 1_633_750.25
        assert_eq!(s.overview.average_transaction, Amount::from_minor(1_633_750));
        assert_eq!(s.insights.savings_rate, 69.3);
    }

    #[test]
    fn categories_rank_by_total_and_income_is_not_spending() {
        let s = summarize(&month_of_spending()).unwrap();
        let order: Vec<Category> = s.top_categories.iter().map(|t| t.category).collect();
        assert_eq!(order, vec![Category::Income, Category::BillsAndUtilities, Category::FoodAndDining]);
        assert_eq!(s.insights.top_spending_category, Some(Category::BillsAndUtilities));
        assert_eq!(s.insights.top_spending_amount, Amount::from_minor(1_500_000));

        let food = &s.by_category["Food & Dining"];
        assert_eq!(food.count, 2);
        assert_eq!(food.total_amount, Amount::from_minor(35_001));
        assert_eq!(food.average_amount, Amount::from_minor(17_501));
    }

    #[test]
    fn users_and_months_split_flows() {
        let s = summarize(&month_of_spending()).unwrap();
        assert_eq!(s.by_user["USER002"].net_balance, Amount::from_minor(-20_001));
        assert_eq!(s.by_user["USER001"].transaction_count, 3);
        assert_eq!(s.by_month.keys().cloned().collect::<Vec<_>>(), vec!["2024-01", "2024-02"]);
        assert_eq!(s.by_month["2024-01"].total_credit, Amount::from_minor(5_000_000));
    }

    #[test]
    fn income_only_has_no_spending_category() {
        let only_income = vec![txn(1, "USER001", Category::Income, TxnKind::Credit, 100, "2024-01-01")];
        let s = summarize(&only_income).unwrap();
        assert_eq!(s.insights.top_spending_category, None);
        assert_eq!(s.insights.savings_rate, 100.0);
        assert!(s.to_string().contains("Highest spending category: none"));
    }

    #[test]
    fn no_credits_means_zero_savings_rate() {
        let spend = vec![txn(1, "USER001", Category::Travel, TxnKind::Debit, 100, "2024-01-01")];
        assert_eq!(summarize(&spend).unwrap().insights.savings_rate, 0.0);
    }
}
