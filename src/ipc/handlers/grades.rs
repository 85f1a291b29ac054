use serde_json::json;

use crate::ipc::error::{err, ok, service_err};
use crate::ipc::types::{AppState, Request};
use crate::projection;
use crate::sync;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let include_hidden = req
        .params
        .get("includeHidden")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let section_id = req
        .params
        .get("sectionId")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // Only the unfiltered-by-section views are cached; a section-scoped
    // query goes straight to the store.
    let key = sync::grades_key(&user_id, include_hidden);
    if section_id.is_none() {
        if let Some(v) = state.cache.get(&key) {
            return ok(&req.id, v.clone());
        }
    }

    match projection::query(conn, &user_id, section_id.as_deref(), include_hidden) {
        Ok(grades) => {
            let payload = json!({ "grades": grades });
            if section_id.is_none() {
                state.cache.set(key, payload.clone(), sync::GRADES_TTL);
            }
            ok(&req.id, payload)
        }
        Err(e) => err(&req.id, "store_unavailable", e.to_string(), None),
    }
}

fn handle_set_hidden(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(hidden) = req.params.get("hidden").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing hidden", None);
    };

    match sync::set_hidden_for_student(conn, &mut state.cache, &section_id, &student_id, hidden) {
        Ok(updated) => ok(&req.id, json!({ "updated": updated })),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_set_hidden_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let Some(hidden) = req.params.get("hidden").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing hidden", None);
    };

    match sync::set_hidden_for_section(conn, &mut state.cache, &section_id, hidden) {
        Ok(report) => ok(
            &req.id,
            serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => service_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_list(state, req)),
        "grades.setHidden" => Some(handle_set_hidden(state, req)),
        "grades.setHiddenAll" => Some(handle_set_hidden_all(state, req)),
        _ => None,
    }
}
