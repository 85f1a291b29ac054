use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok, service_err};
use crate::ipc::types::{AppState, Request};
use crate::section::{self, Assessment, Section, Student, Subject};
use crate::sync;
use crate::transmute::Revision;

fn parse_revision(req: &Request) -> Result<Revision, serde_json::Value> {
    match req.params.get("revision") {
        None => Ok(Revision::default()),
        Some(v) if v.is_null() => Ok(Revision::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|_| {
            err(
                &req.id,
                "bad_params",
                "revision must be one of: k12-2015, legacy",
                Some(json!({ "revision": v })),
            )
        }),
    }
}

fn require_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let owner_id = match require_str(req, "ownerId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let grade_level = match req.params.get("gradeLevel").and_then(|v| v.as_i64()) {
        Some(v) if (1..=12).contains(&v) => v,
        _ => return err(&req.id, "bad_params", "gradeLevel must be 1-12", None),
    };
    let subjects: Vec<Subject> = match req.params.get("subjects") {
        None => Vec::new(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "bad_params", format!("subjects: {}", e), None),
        },
    };
    let students: Vec<Student> = match req.params.get("students") {
        None => Vec::new(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "bad_params", format!("students: {}", e), None),
        },
    };

    let section = Section {
        id: Uuid::new_v4().to_string(),
        name,
        grade_level,
        owner_id,
        subjects,
        students,
    };
    if let Err(e) = section::save(conn, &section) {
        return service_err(&req.id, &e);
    }
    sync::invalidate_section_caches(&mut state.cache, &section.id, &section.owner_id);
    ok(&req.id, json!({ "sectionId": section.id }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match require_str(req, "sectionId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };

    let key = sync::section_key(&section_id);
    if let Some(v) = state.cache.get(&key) {
        return ok(&req.id, v.clone());
    }

    let section = match section::get(conn, &section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    let payload = json!({ "section": section });
    state.cache.set(key, payload.clone(), sync::SECTION_TTL);
    ok(&req.id, payload)
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let owner_id = match require_str(req, "ownerId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };

    // Non-evicting lookup: an expired entry must stay in place so the
    // degraded branch below can still serve it.
    let key = sync::owner_sections_key(&owner_id);
    if let Some(v) = state.cache.peek(&key) {
        return ok(&req.id, v.clone());
    }

    match section::list(conn, &owner_id) {
        Ok(sections) => {
            let payload = json!({ "sections": sections });
            state
                .cache
                .set(key, payload.clone(), sync::SECTION_LIST_TTL);
            ok(&req.id, payload)
        }
        // Listing opts into degraded reads: when the store read fails, an
        // expired cached list is better than nothing, so this lookup
        // ignores the TTL. Writes never do this.
        Err(e) => {
            warn!(owner_id, error = %e, "section list read failed; trying stale cache");
            match state.cache.peek_stale(&key) {
                Some(v) => ok(&req.id, v.clone()),
                None => service_err(&req.id, &e),
            }
        }
    }
}

fn handle_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(raw) = req.params.get("section") else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let next: Section = match serde_json::from_value(raw.clone()) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "bad_params", format!("section: {}", e), None),
    };
    let revision = match parse_revision(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    // Ownership may have moved; both owners' cached lists are stale then.
    if let Ok(prior) = section::get(conn, &next.id) {
        if prior.owner_id != next.owner_id {
            sync::invalidate_section_caches(&mut state.cache, &next.id, &prior.owner_id);
        }
    }

    match sync::save_and_sync(conn, &mut state.cache, &next, revision) {
        Ok(report) => ok(
            &req.id,
            json!({
                "sectionId": next.id,
                "sync": report,
            }),
        ),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match require_str(req, "sectionId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    match sync::delete_section(conn, &mut state.cache, &section_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => service_err(&req.id, &e),
    }
}

/// One student's score changed: persist the new document, then resync that
/// student alone if they are connected. Local-only students stop here.
fn handle_update_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match require_str(req, "sectionId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let subject_id = match require_str(req, "subjectId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let assessment_id = match require_str(req, "assessmentId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let score = match req.params.get("score") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "score must be a number or null", None),
        },
    };
    let revision = match parse_revision(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let current = match section::get(conn, &section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    let next = match current.with_score(&student_id, &subject_id, &assessment_id, score) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    if let Err(e) = section::save(conn, &next) {
        return service_err(&req.id, &e);
    }
    sync::invalidate_section_caches(&mut state.cache, &next.id, &next.owner_id);

    match sync::resync_student(conn, &mut state.cache, &next, &student_id, revision) {
        Ok(Some(written)) => ok(&req.id, json!({ "synced": true, "records": written })),
        Ok(None) => ok(&req.id, json!({ "synced": false })),
        Err(e) => service_err(&req.id, &e),
    }
}

fn edit_assessments(
    state: &mut AppState,
    req: &Request,
    apply: impl FnOnce(&Section, &str) -> Result<Section, crate::error::ServiceError>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match require_str(req, "sectionId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let subject_id = match require_str(req, "subjectId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let revision = match parse_revision(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let current = match section::get(conn, &section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    let next = match apply(&current, &subject_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    match sync::save_and_sync(conn, &mut state.cache, &next, revision) {
        Ok(report) => ok(&req.id, json!({ "sync": report })),
        Err(e) => service_err(&req.id, &e),
    }
}

fn handle_add_assessment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("assessment") else {
        return err(&req.id, "bad_params", "missing assessment", None);
    };
    let mut raw = raw.clone();
    // The definition id is server-assigned unless the caller provides one.
    if let Some(obj) = raw.as_object_mut() {
        if !obj.contains_key("id") {
            obj.insert("id".into(), json!(Uuid::new_v4().to_string()));
        }
    }
    let assessment: Assessment = match serde_json::from_value(raw) {
        Ok(a) => a,
        Err(e) => return err(&req.id, "bad_params", format!("assessment: {}", e), None),
    };
    let assessment_id = assessment.id.clone();
    let resp = edit_assessments(state, req, move |section, subject_id| {
        section.with_assessment_added(subject_id, assessment)
    });
    match resp.get("ok").and_then(|v| v.as_bool()) {
        Some(true) => {
            let mut resp = resp;
            resp["result"]["assessmentId"] = json!(assessment_id);
            resp
        }
        _ => resp,
    }
}

fn handle_remove_assessment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let assessment_id = match require_str(req, "assessmentId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    edit_assessments(state, req, move |section, subject_id| {
        section.with_assessment_removed(subject_id, &assessment_id)
    })
}

/// Read-only report card view for one student: per-subject quarter
/// computations, final grades over populated quarters, and the general
/// average. This is the display edge, so figures are rounded to one
/// decimal here and nowhere earlier.
fn handle_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let section_id = match require_str(req, "sectionId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let student_id = match require_str(req, "studentId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let revision = match parse_revision(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let section = match section::get(conn, &section_id) {
        Ok(s) => s,
        Err(e) => return service_err(&req.id, &e),
    };
    let Some(student) = section.student(&student_id) else {
        return service_err(&req.id, &crate::error::ServiceError::NotFound("student"));
    };

    let mut subjects = Vec::new();
    let mut finals = Vec::new();
    for subject in &section.subjects {
        let mut comps = Vec::new();
        let mut quarters_json = Vec::new();
        if let Some(quarters) = student.grade_data.get(&subject.id) {
            for (period, scores) in quarters.iter() {
                let comp =
                    match calc::quarter_grade(scores, subject, section.grade_level, revision) {
                        Ok(c) => c,
                        Err(e) => return service_err(&req.id, &e.into()),
                    };
                if comp.is_populated() {
                    quarters_json.push(json!({
                        "period": period,
                        "writtenWorkPercent": calc::round1(comp.written_work_percent),
                        "performanceTaskPercent": calc::round1(comp.performance_task_percent),
                        "quarterlyExamPercent": calc::round1(comp.quarterly_exam_percent),
                        "initialGrade": calc::round1(comp.initial_grade),
                        "transmutedGrade": comp.transmuted_grade,
                    }));
                }
                comps.push(comp);
            }
        }
        let final_grade = calc::final_subject_grade(&comps);
        if final_grade > 0.0 {
            finals.push(final_grade);
        }
        subjects.push(json!({
            "subjectId": subject.id,
            "subjectName": subject.name,
            "quarters": quarters_json,
            "finalGrade": calc::round1(final_grade),
        }));
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "subjects": subjects,
            "generalAverage": calc::round1(calc::general_average(&finals)),
        }),
    )
}

fn handle_rename_assessment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let assessment_id = match require_str(req, "assessmentId") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    let name = match require_str(req, "name") {
        Ok(v) => v.to_string(),
        Err(resp) => return resp,
    };
    edit_assessments(state, req, move |section, subject_id| {
        section.with_assessment_renamed(subject_id, &assessment_id, &name)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.create" => Some(handle_create(state, req)),
        "sections.get" => Some(handle_get(state, req)),
        "sections.list" => Some(handle_list(state, req)),
        "sections.save" => Some(handle_save(state, req)),
        "sections.delete" => Some(handle_delete(state, req)),
        "sections.updateScore" => Some(handle_update_score(state, req)),
        "sections.addAssessment" => Some(handle_add_assessment(state, req)),
        "sections.removeAssessment" => Some(handle_remove_assessment(state, req)),
        "sections.renameAssessment" => Some(handle_rename_assessment(state, req)),
        "sections.report" => Some(handle_report(state, req)),
        _ => None,
    }
}
