//! Money amounts (integer cents) and fee ledger arithmetic.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount must be a number or decimal string")]
    NotANumber,
    #[error("amount must have at most two decimal places")]
    TooPrecise,
    #[error("amount must be greater than zero")]
    NotPositive,
    #[error("amount is too large")]
    TooLarge,
}

const MAX_CENTS: i64 = 1_000_000_000_000;

/// Parses `1200`, `1200.5`, `"1,200.50"` into cents. Only positive amounts.
pub fn parse_amount(v: &Value) -> Result<i64, AmountError> {
    let text = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().replace(',', ""),
        _ => return Err(AmountError::NotANumber),
    };
    let cents = parse_decimal_cents(&text)?;
    if cents <= 0 {
        return Err(AmountError::NotPositive);
    }
    if cents > MAX_CENTS {
        return Err(AmountError::TooLarge);
    }
    Ok(cents)
}

fn parse_decimal_cents(text: &str) -> Result<i64, AmountError> {
    let (neg, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::NotANumber);
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(AmountError::NotANumber);
    }
    let frac = frac.trim_end_matches('0');
    if frac.len() > 2 {
        return Err(AmountError::TooPrecise);
    }
    if whole.len() > 15 {
        return Err(AmountError::TooLarge);
    }
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| AmountError::NotANumber)?
    };
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().map_err(|_| AmountError::NotANumber)? * 10,
        _ => frac.parse().map_err(|_| AmountError::NotANumber)?,
    };
    let cents = whole * 100 + frac_cents;
    Ok(if neg { -cents } else { cents })
}

/// Cents as a JSON-friendly decimal number.
pub fn cents_to_number(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    Charge,
    Payment,
    Waiver,
}

impl EntryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "charge" => Some(Self::Charge),
            "payment" => Some(Self::Payment),
            "waiver" => Some(Self::Waiver),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Charge => "charge",
            Self::Payment => "payment",
            Self::Waiver => "waiver",
        }
    }

    /// Effect on the amount the student owes.
    pub fn signed(self, cents: i64) -> i64 {
        match self {
            Self::Charge => cents,
            Self::Payment | Self::Waiver => -cents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MonthStatus {
    Paid,
    Partial,
    Unpaid,
    Credit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub charged: i64,
    pub paid: i64,
    pub waived: i64,
}

impl Totals {
    pub fn add(&mut self, kind: EntryKind, cents: i64) {
        match kind {
            EntryKind::Charge => self.charged += cents,
            EntryKind::Payment => self.paid += cents,
            EntryKind::Waiver => self.waived += cents,
        }
    }

    pub fn balance(&self) -> i64 {
        self.charged - self.paid - self.waived
    }

    pub fn status(&self) -> MonthStatus {
        let settled = self.paid + self.waived;
        if settled > self.charged {
            MonthStatus::Credit
        } else if settled == self.charged {
            MonthStatus::Paid
        } else if settled > 0 {
            MonthStatus::Partial
        } else {
            MonthStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerLine {
    pub kind: EntryKind,
    pub cents: i64,
    pub month: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub totals: Totals,
    /// Balance after each line, in input order.
    pub running: Vec<i64>,
    pub by_month: BTreeMap<String, Totals>,
}

/// Lines must already be in posting order; entries without a month are
/// grouped under `"unassigned"`.
pub fn build_ledger<'a, I>(lines: I) -> Ledger
where
    I: IntoIterator<Item = &'a LedgerLine>,
{
    let mut ledger = Ledger::default();
    let mut balance = 0i64;
    for line in lines {
        ledger.totals.add(line.kind, line.cents);
        balance += line.kind.signed(line.cents);
        ledger.running.push(balance);
        let key = line
            .month
            .clone()
            .unwrap_or_else(|| "unassigned".to_string());
        ledger.by_month.entry(key).or_default().add(line.kind, line.cents);
    }
    ledger
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numbers_and_strings_to_cents() {
        assert_eq!(parse_amount(&json!(1200)), Ok(120_000));
        assert_eq!(parse_amount(&json!(12.5)), Ok(1_250));
        assert_eq!(parse_amount(&json!("1,200.05")), Ok(120_005));
        assert_eq!(parse_amount(&json!(".5")), Ok(50));
        assert_eq!(parse_amount(&json!("10.50")), Ok(1_050));
        assert_eq!(parse_amount(&json!("10.500")), Ok(1_050));
    }

    #[test]
    fn rejects_bad_amounts() {
        assert_eq!(parse_amount(&json!(0)), Err(AmountError::NotPositive));
        assert_eq!(parse_amount(&json!(-5)), Err(AmountError::NotPositive));
        assert_eq!(parse_amount(&json!("1.234")), Err(AmountError::TooPrecise));
        assert_eq!(parse_amount(&json!("abc")), Err(AmountError::NotANumber));
        assert_eq!(parse_amount(&json!(null)), Err(AmountError::NotANumber));
        assert_eq!(parse_amount(&json!(".")), Err(AmountError::NotANumber));
        assert_eq!(
            parse_amount(&json!("99999999999999999")),
            Err(AmountError::TooLarge)
        );
    }

    #[test]
    fn formats_cents() {
        assert_eq!(format_cents(120_005), "1200.05");
        assert_eq!(format_cents(-50), "-0.50");
        assert_eq!(cents_to_number(1_050), 10.5);
    }

    #[test]
    fn ledger_runs_balance_and_month_status() {
        let lines = vec![
            LedgerLine {
                kind: EntryKind::Charge,
                cents: 10_000,
                month: Some("2026-01".into()),
            },
            LedgerLine {
                kind: EntryKind::Payment,
                cents: 4_000,
                month: Some("2026-01".into()),
            },
            LedgerLine {
                kind: EntryKind::Charge,
                cents: 10_000,
                month: Some("2026-02".into()),
            },
            LedgerLine {
                kind: EntryKind::Waiver,
                cents: 10_000,
                month: Some("2026-02".into()),
            },
            LedgerLine {
                kind: EntryKind::Payment,
                cents: 500,
                month: None,
            },
        ];
        let l = build_ledger(&lines);
        assert_eq!(l.running, vec![10_000, 6_000, 16_000, 6_000, 5_500]);
        assert_eq!(l.totals.balance(), 5_500);
        assert_eq!(l.by_month["2026-01"].status(), MonthStatus::Partial);
        assert_eq!(l.by_month["2026-02"].status(), MonthStatus::Paid);
        assert_eq!(l.by_month["unassigned"].status(), MonthStatus::Credit);
        let unpaid = Totals {
            charged: 100,
            ..Totals::default()
        };
        assert_eq!(unpaid.status(), MonthStatus::Unpaid);
    }
}
