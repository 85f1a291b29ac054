use serde_json::json;

use crate::connection;
use crate::ipc::error::{err, ok, service_err};
use crate::ipc::types::{AppState, Request};
use crate::section;
use crate::sync;

struct ConnectParams {
    section_id: String,
    student_id: String,
    user_id: String,
    connected_by: String,
}

fn parse_connect_params(req: &Request) -> Result<ConnectParams, serde_json::Value> {
    let get = |key: &str| {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
    };
    let section_id = get("sectionId")?;
    let student_id = get("studentId")?;
    let user_id = get("userId")?;
    // Repair calls typically come from the account holder themselves.
    let connected_by = req
        .params
        .get("connectedBy")
        .and_then(|v| v.as_str())
        .unwrap_or(&user_id)
        .to_string();
    Ok(ConnectParams {
        section_id,
        student_id,
        user_id,
        connected_by,
    })
}

fn handle_connect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let p = match parse_connect_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let section = match section::get(conn, &p.section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    match sync::connect_student(
        conn,
        &mut state.cache,
        &section,
        &p.student_id,
        &p.user_id,
        &p.connected_by,
    ) {
        Ok((link, records)) => ok(
            &req.id,
            json!({ "connection": link, "records": records }),
        ),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_repair(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let p = match parse_connect_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let section = match section::get(conn, &p.section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    match sync::repair_connection(
        conn,
        &mut state.cache,
        &section,
        &p.student_id,
        &p.user_id,
        &p.connected_by,
    ) {
        Ok((link, records)) => ok(
            &req.id,
            json!({ "connection": link, "records": records }),
        ),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_disconnect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let p = match parse_connect_params(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let section = match section::get(conn, &p.section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    match sync::disconnect_student(conn, &mut state.cache, &section, &p.student_id, &p.user_id) {
        Ok(removed) => ok(&req.id, json!({ "removedRecords": removed })),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let active_only = req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    match connection::list_for_section(conn, &section_id, active_only) {
        Ok(links) => ok(&req.id, json!({ "connections": links })),
        Err(e) => err(&req.id, "store_unavailable", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "connections.connect" => Some(handle_connect(state, req)),
        "connections.repair" => Some(handle_repair(state, req)),
        "connections.disconnect" => Some(handle_disconnect(state, req)),
        "connections.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
