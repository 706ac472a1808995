use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{conn, require_admin};
use crate::ipc::types::{AppState, Request};
use crate::timetable;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
pub enum SetupSection {
    Enrollment,
    Attendance,
    Timetable,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::Enrollment, Self::Attendance, Self::Timetable];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "enrollment" => Some(Self::Enrollment),
            "attendance" => Some(Self::Attendance),
            "timetable" => Some(Self::Timetable),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::Attendance => "attendance",
            Self::Timetable => "timetable",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Enrollment => "setup.enrollment",
            Self::Attendance => "setup.attendance",
            Self::Timetable => "setup.timetable",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Enrollment => json!({
            "autoEnrollOnSave": true
        }),
        SetupSection::Attendance => json!({
            "shortageThresholdPercent": 75
        }),
        SetupSection::Timetable => json!({
            "defaultActiveDays": "mon,tue,wed,thu,fri,sat"
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Enrollment => match k.as_str() {
                "autoEnrollOnSave" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown enrollment field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "shortageThresholdPercent" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Timetable => match k.as_str() {
                "defaultActiveDays" => {
                    let raw = v.as_str().ok_or_else(|| format!("{} must be string", k))?;
                    let days = timetable::parse_active_days(raw).map_err(|e| e.to_string())?;
                    obj.insert(
                        k.clone(),
                        Value::String(timetable::format_active_days(&days)),
                    );
                }
                _ => return Err(format!("unknown timetable field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn auto_enroll_on_save(conn: &rusqlite::Connection) -> Result<bool, HandlerErr> {
    let section = load_section(conn, SetupSection::Enrollment)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(section
        .get("autoEnrollOnSave")
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

pub fn shortage_threshold(conn: &rusqlite::Connection) -> Result<f64, HandlerErr> {
    let section = load_section(conn, SetupSection::Attendance)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(section
        .get("shortageThresholdPercent")
        .and_then(|v| v.as_f64())
        .unwrap_or(75.0))
}

pub fn default_active_days(conn: &rusqlite::Connection) -> Result<String, HandlerErr> {
    let section = load_section(conn, SetupSection::Timetable)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(section
        .get("defaultActiveDays")
        .and_then(|v| v.as_str())
        .unwrap_or("mon,tue,wed,thu,fri,sat")
        .to_string())
}

fn setup_get(state: &mut AppState) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let value = load_section(conn, section)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        out.insert(section.name().to_string(), value);
    }
    Ok(Value::Object(out))
}

fn setup_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let section_raw = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section =
        SetupSection::parse(section_raw).ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::db_write("db_update_failed", e, "settings"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => setup_get(state),
        "setup.update" => setup_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
