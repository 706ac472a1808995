use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    account, check_semester, conn, ensure_exists, get_optional_i64, get_optional_str,
    get_required_i64, get_required_str, require_staff,
};
use crate::ipc::types::{Account, AppState, Request};
use crate::timetable::{self, TimetableInput, TimetableKey, Weekday, LECTURES_PER_DAY};
use serde_json::{json, Value};

fn parse_key(params: &Value) -> Result<TimetableKey, HandlerErr> {
    Ok(TimetableKey {
        degree_id: get_optional_str(params, "degreeId")?,
        section: get_required_str(params, "section")?.to_uppercase(),
        semester: get_optional_i64(params, "semester")?
            .map(check_semester)
            .transpose()?,
    })
}

fn parse_day(raw: &str) -> Result<Weekday, HandlerErr> {
    Weekday::parse(raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown day: {}", raw)))
}

/// Fixed-length per-lecture array; missing trailing entries read as null.
fn lecture_array<'a>(params: &'a Value, key: &str) -> Result<Vec<Option<&'a str>>, HandlerErr> {
    let mut out = vec![None; LECTURES_PER_DAY as usize];
    match params.get(key) {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            if items.len() > out.len() {
                return Err(HandlerErr::bad_params(format!(
                    "{} has more than {} entries",
                    key, LECTURES_PER_DAY
                )));
            }
            for (i, item) in items.iter().enumerate() {
                out[i] = match item {
                    Value::Null => None,
                    Value::String(s) if s.trim().is_empty() => None,
                    Value::String(s) => Some(s.trim()),
                    _ => {
                        return Err(HandlerErr::bad_params(format!(
                            "{}[{}] must be string or null",
                            key, i
                        )))
                    }
                };
            }
        }
        Some(_) => return Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
    Ok(out)
}

fn parse_active_days_param(params: &Value, fallback: &str) -> Result<Vec<Weekday>, HandlerErr> {
    let raw = match params.get("activeDays") {
        None | Some(Value::Null) => fallback.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| HandlerErr::bad_params("activeDays must contain strings"))
            })
            .collect::<Result<Vec<_>, _>>()?
            .join(","),
        Some(_) => {
            return Err(HandlerErr::bad_params(
                "activeDays must be a string or an array",
            ))
        }
    };
    Ok(timetable::parse_active_days(&raw)?)
}

fn parse_input(params: &Value, default_days: &str) -> Result<TimetableInput, HandlerErr> {
    let mut input = TimetableInput::default();
    for (i, raw) in lecture_array(params, "lectureTimes")?.into_iter().enumerate() {
        input.lecture_times[i] = raw.map(timetable::parse_time).transpose()?;
    }
    for (i, raw) in lecture_array(params, "lectureSubjectIds")?
        .into_iter()
        .enumerate()
    {
        input.lecture_subjects[i] = raw.map(str::to_string);
    }
    input.lunch = get_optional_str(params, "lunch")?
        .map(|s| timetable::parse_time(&s))
        .transpose()?;
    input.active_days = parse_active_days_param(params, default_days)?;

    if let Some(slots) = params.get("slots") {
        let slots = slots
            .as_array()
            .ok_or_else(|| HandlerErr::bad_params("slots must be an array"))?;
        for (i, slot) in slots.iter().enumerate() {
            let day = parse_day(&get_required_str(slot, "day")?)?;
            let lecture = timetable::check_lecture_number(get_required_i64(slot, "lectureNumber")?)?;
            if !input.active_days.contains(&day) {
                return Err(HandlerErr::bad_params(format!(
                    "slots[{}]: {} is not an active day",
                    i,
                    day.code()
                )));
            }
            input
                .slots
                .insert((day, lecture), get_optional_str(slot, "subjectId")?);
        }
    }
    Ok(input)
}

fn timetable_save(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let key = parse_key(params)?;
    if let Some(d) = &key.degree_id {
        ensure_exists(conn, "degrees", d, "degree")?;
    }
    let default_days = setup::default_active_days(conn)?;
    let input = parse_input(params, &default_days)?;
    let lecture_subjects = input.lecture_subjects.iter().flatten();
    let slot_subjects = input.slots.values().flatten();
    for subject_id in lecture_subjects.chain(slot_subjects) {
        ensure_exists(conn, "subjects", subject_id, "subject")?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let outcome = timetable::save_timetable(&tx, &key, &input)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(
        timetable_id = %outcome.timetable_id,
        created = outcome.created,
        removed_slots = outcome.removed_slots,
        "timetable saved"
    );
    serde_json::to_value(outcome).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn timetable_set_slot(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let timetable_id = get_required_str(params, "timetableId")?;
    let day = parse_day(&get_required_str(params, "day")?)?;
    let lecture = timetable::check_lecture_number(get_required_i64(params, "lectureNumber")?)?;
    let subject_id = get_optional_str(params, "subjectId")?;
    if let Some(s) = &subject_id {
        ensure_exists(conn, "subjects", s, "subject")?;
    }
    timetable::set_slot(conn, &timetable_id, day, lecture, subject_id.as_deref())?;
    Ok(json!({ "ok": true }))
}

fn timetable_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    account(state)?;
    let conn = conn(state)?;
    let timetable_id = match get_optional_str(params, "timetableId")? {
        Some(id) => id,
        None => timetable::find_timetable_id(conn, &parse_key(params)?)?
            .ok_or_else(|| HandlerErr::not_found("timetable not found"))?,
    };
    let view = timetable::load_timetable(conn, &timetable_id)?
        .ok_or_else(|| HandlerErr::not_found("timetable not found"))?;
    serde_json::to_value(view).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn timetable_for_student(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = match account(state)? {
        Account::Student { student_id } => student_id.clone(),
        _ => get_required_str(params, "studentId")?,
    };
    let conn = conn(state)?;
    let Some(timetable_id) = timetable::find_for_student(conn, &student_id)? else {
        return Ok(json!({ "studentId": student_id, "timetable": null }));
    };
    let view = timetable::load_timetable(conn, &timetable_id)?;
    Ok(json!({ "studentId": student_id, "timetable": view }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "timetable.save" => timetable_save(state, &req.params),
        "timetable.setSlot" => timetable_set_slot(state, &req.params),
        "timetable.get" => timetable_get(state, &req.params),
        "timetable.forStudent" => timetable_for_student(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_defaults_days_and_pads_lectures() {
        let params = json!({
            "section": "a",
            "lectureTimes": ["09:00", "09:50"],
            "lunch": "12:30",
        });
        let input = parse_input(&params, "mon,wed").expect("input");
        assert_eq!(input.active_days, vec![Weekday::Mon, Weekday::Wed]);
        assert!(input.lecture_times[0].is_some());
        assert!(input.lecture_times[2].is_none());
        assert!(input.lunch.is_some());
    }

    #[test]
    fn slots_on_inactive_days_are_rejected() {
        let params = json!({
            "section": "A",
            "activeDays": ["mon", "tue"],
            "slots": [{ "day": "sat", "lectureNumber": 1, "subjectId": "x" }],
        });
        let err = parse_input(&params, "mon").expect_err("inactive day");
        assert_eq!(err.code, "bad_params");
    }

    #[test]
    fn lecture_arrays_are_bounded() {
        let params = json!({ "lectureTimes": ["1", "2", "3", "4", "5", "6", "7", "8"] });
        assert!(lecture_array(&params, "lectureTimes").is_err());
    }
}
