use crate::error::{CoreError, CoreResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Fee amounts are stored in minor units (paise) so balances add up exactly.
pub type Paise = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTitle {
    Tuition,
    Library,
    Lab,
    Infrastructure,
    Examination,
    Sports,
    Hostel,
    Other,
}

impl FeeTitle {
    pub const ALL: [FeeTitle; 8] = [
        FeeTitle::Tuition,
        FeeTitle::Library,
        FeeTitle::Lab,
        FeeTitle::Infrastructure,
        FeeTitle::Examination,
        FeeTitle::Sports,
        FeeTitle::Hostel,
        FeeTitle::Other,
    ];

    pub fn code(self) -> &'static str {
        match self {
            FeeTitle::Tuition => "tuition",
            FeeTitle::Library => "library",
            FeeTitle::Lab => "lab",
            FeeTitle::Infrastructure => "infrastructure",
            FeeTitle::Examination => "examination",
            FeeTitle::Sports => "sports",
            FeeTitle::Hostel => "hostel",
            FeeTitle::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FeeTitle::Tuition => "Tuition Fee",
            FeeTitle::Library => "Library Fee",
            FeeTitle::Lab => "Lab Fee",
            FeeTitle::Infrastructure => "Infrastructure Fee",
            FeeTitle::Examination => "Examination Fee",
            FeeTitle::Sports => "Sports Fee",
            FeeTitle::Hostel => "Hostel Fee",
            FeeTitle::Other => "Other Fee",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.code().eq_ignore_ascii_case(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentMethod {
    Cheque,
    Draft,
    #[default]
    Online,
    Cash,
}

impl PaymentMethod {
    pub fn code(self) -> &'static str {
        match self {
            PaymentMethod::Cheque => "cheque",
            PaymentMethod::Draft => "draft",
            PaymentMethod::Online => "online",
            PaymentMethod::Cash => "cash",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cheque" => Some(PaymentMethod::Cheque),
            "draft" => Some(PaymentMethod::Draft),
            "online" => Some(PaymentMethod::Online),
            "cash" => Some(PaymentMethod::Cash),
            _ => None,
        }
    }
}

/// Converts a rupee amount with at most two decimals into paise.
pub fn to_paise(amount: f64, what: &str) -> CoreResult<Paise> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(CoreError::invalid(format!(
            "{} must be a non-negative amount",
            what
        )));
    }
    let scaled = amount * 100.0;
    let paise = scaled.round();
    if (scaled - paise).abs() > 1e-6 {
        return Err(CoreError::invalid(format!(
            "{} has more than two decimals",
            what
        )));
    }
    Ok(paise as Paise)
}

pub fn to_rupees(paise: Paise) -> f64 {
    paise as f64 / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeCharge {
    pub amount: Paise,
    pub fine: Paise,
    pub rewards: Paise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeBalance {
    /// amount + fine - rewards; negative when rewards exceed the charge.
    pub total: Paise,
    pub paid: Paise,
    /// Never below zero, even when overpaid.
    pub remaining: Paise,
}

pub fn fee_balance(charge: FeeCharge, payments: &[Paise]) -> FeeBalance {
    let total = charge.amount + charge.fine - charge.rewards;
    let paid: Paise = payments.iter().sum();
    FeeBalance {
        total,
        paid,
        remaining: (total - paid).max(0),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_id: String,
    pub amount: f64,
    pub paid_on: String,
    pub transaction_id: String,
    pub payment_method: &'static str,
    pub remarks: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    pub fee_id: String,
    pub title: &'static str,
    pub title_label: &'static str,
    pub amount: f64,
    pub fine: f64,
    pub rewards: f64,
    pub total_amount: f64,
    pub amount_paid: f64,
    pub amount_remaining: f64,
    pub allocated_on: String,
    pub is_verified: bool,
    pub verified_on: Option<String>,
    pub payments: Vec<PaymentRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentLedger {
    pub student_id: String,
    pub fees: Vec<FeeRecord>,
    pub total_amount: f64,
    pub amount_paid: f64,
    pub amount_remaining: f64,
}

struct FeeRow {
    id: String,
    title: String,
    charge: FeeCharge,
    allocated_on: String,
    is_verified: bool,
    verified_on: Option<String>,
}

fn load_payments(conn: &Connection, fee_id: &str) -> CoreResult<Vec<(Paise, PaymentRecord)>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount_paise, paid_on, transaction_id, payment_method, remarks
         FROM fee_payments
         WHERE fee_id = ?
         ORDER BY paid_on, rowid",
    )?;
    let rows = stmt
        .query_map([fee_id], |r| {
            let amount: Paise = r.get(1)?;
            let method: String = r.get(4)?;
            Ok((
                amount,
                PaymentRecord {
                    payment_id: r.get(0)?,
                    amount: to_rupees(amount),
                    paid_on: r.get(2)?,
                    transaction_id: r.get(3)?,
                    payment_method: PaymentMethod::parse(&method).unwrap_or_default().code(),
                    remarks: r.get(5)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn fee_record(conn: &Connection, row: FeeRow) -> CoreResult<(FeeBalance, FeeRecord)> {
    let payments = load_payments(conn, &row.id)?;
    let amounts: Vec<Paise> = payments.iter().map(|(p, _)| *p).collect();
    let balance = fee_balance(row.charge, &amounts);
    let title = FeeTitle::parse(&row.title).unwrap_or(FeeTitle::Other);
    Ok((
        balance,
        FeeRecord {
            fee_id: row.id,
            title: title.code(),
            title_label: title.label(),
            amount: to_rupees(row.charge.amount),
            fine: to_rupees(row.charge.fine),
            rewards: to_rupees(row.charge.rewards),
            total_amount: to_rupees(balance.total),
            amount_paid: to_rupees(balance.paid),
            amount_remaining: to_rupees(balance.remaining),
            allocated_on: row.allocated_on,
            is_verified: row.is_verified,
            verified_on: row.verified_on,
            payments: payments.into_iter().map(|(_, p)| p).collect(),
        },
    ))
}

const FEE_COLUMNS: &str = "id, title, amount_paise, fine_paise, rewards_paise, allocated_on, is_verified, verified_on";

fn map_fee_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeeRow> {
    Ok(FeeRow {
        id: r.get(0)?,
        title: r.get(1)?,
        charge: FeeCharge {
            amount: r.get(2)?,
            fine: r.get(3)?,
            rewards: r.get(4)?,
        },
        allocated_on: r.get(5)?,
        is_verified: r.get::<_, i64>(6)? != 0,
        verified_on: r.get(7)?,
    })
}

pub fn load_fee(conn: &Connection, fee_id: &str) -> CoreResult<FeeRecord> {
    let sql = format!("SELECT {} FROM fees WHERE id = ?", FEE_COLUMNS);
    let row = conn
        .query_row(&sql, [fee_id], map_fee_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found("fee not found"))?;
    Ok(fee_record(conn, row)?.1)
}

pub fn fee_owner(conn: &Connection, fee_id: &str) -> CoreResult<String> {
    conn.query_row("SELECT student_id FROM fees WHERE id = ?", [fee_id], |r| {
        r.get(0)
    })
    .optional()?
    .ok_or_else(|| CoreError::not_found("fee not found"))
}

pub fn load_student_ledger(conn: &Connection, student_id: &str) -> CoreResult<StudentLedger> {
    let sql = format!(
        "SELECT {} FROM fees WHERE student_id = ? ORDER BY allocated_on, rowid",
        FEE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id], map_fee_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals = FeeBalance::default();
    let mut fees = Vec::with_capacity(rows.len());
    for row in rows {
        let (balance, record) = fee_record(conn, row)?;
        totals.total += balance.total;
        totals.paid += balance.paid;
        totals.remaining += balance.remaining;
        fees.push(record);
    }
    Ok(StudentLedger {
        student_id: student_id.to_string(),
        fees,
        total_amount: to_rupees(totals.total),
        amount_paid: to_rupees(totals.paid),
        amount_remaining: to_rupees(totals.remaining),
    })
}
