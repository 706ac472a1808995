use crate::fees::{self, FeeTitle, PaymentMethod};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    account, conn, ensure_exists, get_optional_str, get_required_str, require_admin, write_err,
};
use crate::ipc::types::{Account, AppState, Request};
use serde_json::{json, Value};
use uuid::Uuid;

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn get_optional_paise(params: &Value, key: &str) -> Result<Option<fees::Paise>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let amount = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))?;
            Ok(Some(fees::to_paise(amount, key)?))
        }
    }
}

fn get_required_paise(params: &Value, key: &str) -> Result<fees::Paise, HandlerErr> {
    get_optional_paise(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn fee_value(conn: &rusqlite::Connection, fee_id: &str) -> Result<Value, HandlerErr> {
    let record = fees::load_fee(conn, fee_id)?;
    serde_json::to_value(record).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn fees_allocate(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let raw_title = get_required_str(params, "title")?;
    let title = FeeTitle::parse(&raw_title)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown fee title: {}", raw_title)))?;
    let amount = get_required_paise(params, "amount")?;
    let fine = get_optional_paise(params, "fine")?.unwrap_or(0);
    let rewards = get_optional_paise(params, "rewards")?.unwrap_or(0);

    let fee_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fees(id, student_id, title, amount_paise, fine_paise, rewards_paise, allocated_on)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &fee_id,
            &student_id,
            title.code(),
            amount,
            fine,
            rewards,
            now_stamp(),
        ),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "fees"))?;
    tracing::info!(fee_id = %fee_id, student_id = %student_id, title = title.code(), "fee allocated");
    fee_value(conn, &fee_id)
}

fn fees_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let fee_id = get_required_str(params, "feeId")?;
    ensure_exists(conn, "fees", &fee_id, "fee")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (key, column) in [
        ("amount", "amount_paise"),
        ("fine", "fine_paise"),
        ("rewards", "rewards_paise"),
    ] {
        if patch.get(key).is_none() {
            continue;
        }
        let value = get_optional_paise(patch, key)?.unwrap_or(0);
        let sql = format!("UPDATE fees SET {} = ? WHERE id = ?", column);
        tx.execute(&sql, (value, &fee_id))
            .map_err(|e| write_err(e, "db_update_failed", "fees"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    fee_value(conn, &fee_id)
}

fn fees_pay(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let account = account(state)?.clone();
    let conn = conn(state)?;
    let fee_id = get_required_str(params, "feeId")?;
    let owner = fees::fee_owner(conn, &fee_id)?;
    match &account {
        Account::Admin => {}
        Account::Student { student_id } if *student_id == owner => {}
        _ => return Err(HandlerErr::forbidden("fees are paid by the student or an admin")),
    }
    let amount = get_required_paise(params, "amount")?;
    if amount == 0 {
        return Err(HandlerErr::bad_params("amount must be greater than zero"));
    }
    let transaction_id = get_required_str(params, "transactionId")?;
    let method = match get_optional_str(params, "paymentMethod")? {
        None => PaymentMethod::default(),
        Some(raw) => PaymentMethod::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown payment method: {}", raw)))?,
    };
    let remarks = get_optional_str(params, "remarks")?.unwrap_or_default();

    conn.execute(
        "INSERT INTO fee_payments(id, fee_id, amount_paise, paid_on, transaction_id, payment_method, remarks)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &fee_id,
            amount,
            now_stamp(),
            &transaction_id,
            method.code(),
            &remarks,
        ),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "fee_payments"))?;
    tracing::info!(fee_id = %fee_id, transaction_id = %transaction_id, "fee payment recorded");
    fee_value(conn, &fee_id)
}

fn fees_verify(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let fee_id = get_required_str(params, "feeId")?;
    let changed = conn
        .execute(
            "UPDATE fees SET is_verified = 1, verified_on = ? WHERE id = ?",
            (now_stamp(), &fee_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "fees"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("fee not found"));
    }
    fee_value(conn, &fee_id)
}

fn fees_student_ledger(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = match account(state)? {
        Account::Admin => get_required_str(params, "studentId")?,
        Account::Student { student_id } => {
            if let Some(requested) = params.get("studentId").and_then(|v| v.as_str()) {
                if requested != student_id {
                    return Err(HandlerErr::forbidden("students may only view their own fees"));
                }
            }
            student_id.clone()
        }
        Account::Teacher { .. } => return Err(HandlerErr::forbidden("fees are not visible to teachers")),
    };
    let conn = conn(state)?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let ledger = fees::load_student_ledger(conn, &student_id)?;
    serde_json::to_value(ledger).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "fees.allocate" => fees_allocate(state, &req.params),
        "fees.update" => fees_update(state, &req.params),
        "fees.pay" => fees_pay(state, &req.params),
        "fees.verify" => fees_verify(state, &req.params),
        "fees.studentLedger" => fees_student_ledger(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_accept_rupees_with_two_decimals() {
        let params = json!({ "amount": 1500.5, "fine": null, "rewards": "10" });
        assert_eq!(get_required_paise(&params, "amount").expect("amount"), 150_050);
        assert_eq!(get_optional_paise(&params, "fine").expect("fine"), None);
        assert_eq!(
            get_optional_paise(&params, "rewards").expect_err("string").code,
            "bad_params"
        );
        assert_eq!(
            get_required_paise(&json!({}), "amount").expect_err("missing").code,
            "bad_params"
        );
    }
}
