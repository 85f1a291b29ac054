use rusqlite::Connection as DbConnection;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::calc;
use crate::connection::{self, Connection};
use crate::error::ServiceError;
use crate::projection::{self, Grade};
use crate::section::{self, Section, Student};
use crate::transmute::Revision;

pub const SECTION_TTL: Duration = Duration::from_secs(300);
pub const SECTION_LIST_TTL: Duration = Duration::from_secs(120);
pub const GRADES_TTL: Duration = Duration::from_secs(120);

pub type JsonCache = Cache<serde_json::Value>;

pub fn section_key(section_id: &str) -> String {
    format!("section:{}", section_id)
}

pub fn owner_sections_key(owner_id: &str) -> String {
    format!("sections:owner:{}", owner_id)
}

/// The hidden-filtered and unfiltered views must not collide, so the flag
/// is part of the key.
pub fn grades_key(user_id: &str, include_hidden: bool) -> String {
    format!("grades:{}:{}", user_id, include_hidden)
}

fn grades_prefix(user_id: &str) -> String {
    format!("grades:{}:", user_id)
}

/// Any section write may have changed list membership, so the single
/// section entry and every cached list for its owner go together.
pub fn invalidate_section_caches(cache: &mut JsonCache, section_id: &str, owner_id: &str) {
    cache.invalidate(&section_key(section_id));
    cache.invalidate_prefix(&owner_sections_key(owner_id));
}

pub fn invalidate_grade_caches(cache: &mut JsonCache, user_id: &str) {
    cache.invalidate_prefix(&grades_prefix(user_id));
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFailure {
    pub student_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: usize,
    pub records: usize,
    pub failed: Vec<StudentFailure>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityReport {
    pub updated: usize,
    pub failed: Vec<StudentFailure>,
}

/// Recomputes every subject/quarter for one connected student and replaces
/// the whole (user, section) projection set in one transaction, keeping the
/// caller-supplied hidden flag on every written record.
///
/// Delete-and-reinsert rather than diffing: assessment deletion can never
/// leave an orphaned record, and re-running with unchanged inputs produces
/// the identical set, timestamps included.
pub fn recompute_and_replace(
    conn: &DbConnection,
    section: &Section,
    student: &Student,
    user_id: &str,
    hidden: bool,
    revision: Revision,
) -> Result<usize, ServiceError> {
    let prior = projection::created_at_index(conn, user_id, &section.id)?;
    let now = chrono::Utc::now().to_rfc3339();

    let mut target: Vec<Grade> = Vec::new();
    for subject in &section.subjects {
        let Some(quarters) = student.grade_data.get(&subject.id) else {
            continue;
        };
        for (period, scores) in quarters.iter() {
            let comp = calc::quarter_grade(scores, subject, section.grade_level, revision)?;
            if !comp.is_populated() {
                continue;
            }
            let created_at = prior
                .get(&(subject.name.clone(), period))
                .cloned()
                .unwrap_or_else(|| now.clone());
            target.push(Grade {
                user_id: user_id.to_string(),
                subject: subject.name.clone(),
                period,
                score: comp.transmuted_grade,
                section_id: section.id.clone(),
                created_at,
                hidden,
            });
        }
    }

    let written = projection::batch_replace(conn, user_id, &section.id, &target)?;
    debug!(
        user_id,
        section_id = %section.id,
        records = written,
        "projection set replaced"
    );
    Ok(written)
}

/// Resynchronizes every connected student of a section after its embedded
/// data changed. Per-student failures are logged and reported, never
/// aborting the remaining students. Local-only students are skipped: the
/// registry is the gate.
pub fn sync_section(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    revision: Revision,
) -> Result<SyncReport, ServiceError> {
    let mut report = SyncReport::default();
    for link in connection::list_for_section(conn, &section.id, true)? {
        let Some(student) = section.student(&link.student_id) else {
            warn!(
                student_id = %link.student_id,
                section_id = %section.id,
                "connected student missing from roster; skipping"
            );
            report.failed.push(StudentFailure {
                student_id: link.student_id.clone(),
                user_id: Some(link.user_id.clone()),
                code: "not_found".into(),
                message: "connected student missing from roster".into(),
            });
            continue;
        };

        let hidden = projection::current_hidden(conn, &link.user_id, &section.id)?.unwrap_or(false);
        match recompute_and_replace(conn, section, student, &link.user_id, hidden, revision) {
            Ok(n) => {
                report.synced += 1;
                report.records += n;
                invalidate_grade_caches(cache, &link.user_id);
            }
            Err(e) => {
                warn!(
                    student_id = %link.student_id,
                    user_id = %link.user_id,
                    section_id = %section.id,
                    error = %e,
                    "projection sync failed for student"
                );
                report.failed.push(StudentFailure {
                    student_id: link.student_id.clone(),
                    user_id: Some(link.user_id.clone()),
                    code: e.code().into(),
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Resynchronizes a single student after an edit scoped to them. Returns
/// `None` when the student is local-only: no connection, no projection.
pub fn resync_student(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    student_id: &str,
    revision: Revision,
) -> Result<Option<usize>, ServiceError> {
    let Some(link) = connection::find(conn, student_id, &section.id)?.filter(|c| c.is_active)
    else {
        return Ok(None);
    };
    let student = section
        .student(student_id)
        .ok_or(ServiceError::NotFound("student"))?;
    let hidden = projection::current_hidden(conn, &link.user_id, &section.id)?.unwrap_or(false);
    let written = recompute_and_replace(conn, section, student, &link.user_id, hidden, revision)?;
    invalidate_grade_caches(cache, &link.user_id);
    Ok(Some(written))
}

/// Saves the section document, then recomputes projections for every
/// connected student and drops every cache entry the write can have
/// touched.
pub fn save_and_sync(
    conn: &DbConnection,
    cache: &mut JsonCache,
    next: &Section,
    revision: Revision,
) -> Result<SyncReport, ServiceError> {
    section::save(conn, next)?;
    invalidate_section_caches(cache, &next.id, &next.owner_id);
    sync_section(conn, cache, next, revision)
}

/// Visibility toggle for one connected student. Only the hidden flag moves;
/// no recomputation.
pub fn set_hidden_for_student(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section_id: &str,
    student_id: &str,
    hidden: bool,
) -> Result<usize, ServiceError> {
    let link = connection::find(conn, student_id, section_id)?
        .filter(|c| c.is_active)
        .ok_or(ServiceError::NotFound("connection"))?;
    let updated = projection::batch_set_hidden(conn, &link.user_id, section_id, hidden)?;
    invalidate_grade_caches(cache, &link.user_id);
    Ok(updated)
}

/// Section-wide visibility toggle as a loop of independent per-student
/// updates. Deliberately not atomic as a whole: one student's failure never
/// rolls back the others, and the report tells the caller whom to retry.
pub fn set_hidden_for_section(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section_id: &str,
    hidden: bool,
) -> Result<VisibilityReport, ServiceError> {
    let mut report = VisibilityReport::default();
    for link in connection::list_for_section(conn, section_id, true)? {
        match projection::batch_set_hidden(conn, &link.user_id, section_id, hidden) {
            Ok(_) => {
                report.updated += 1;
                invalidate_grade_caches(cache, &link.user_id);
            }
            Err(e) => {
                warn!(
                    student_id = %link.student_id,
                    user_id = %link.user_id,
                    section_id,
                    error = %e,
                    "visibility toggle failed for student"
                );
                report.failed.push(StudentFailure {
                    student_id: link.student_id.clone(),
                    user_id: Some(link.user_id.clone()),
                    code: "store_unavailable".into(),
                    message: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Creates (or reactivates) the connection and seeds the projection from
/// the current section state.
pub fn connect_student(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    student_id: &str,
    user_id: &str,
    connected_by: &str,
) -> Result<(Connection, usize), ServiceError> {
    let link = connection::connect(conn, section, student_id, user_id, connected_by)?;
    seed_projection(conn, cache, section, student_id, &link)
}

/// Idempotent connect repair plus the same projection seed. Re-running it
/// converges on the same end state.
pub fn repair_connection(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    student_id: &str,
    user_id: &str,
    connected_by: &str,
) -> Result<(Connection, usize), ServiceError> {
    let link = connection::repair(conn, section, student_id, user_id, connected_by)?;
    seed_projection(conn, cache, section, student_id, &link)
}

fn seed_projection(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    student_id: &str,
    link: &Connection,
) -> Result<(Connection, usize), ServiceError> {
    let next = section.with_connected_user(student_id, Some(&link.user_id))?;
    section::save(conn, &next)?;
    let student = next
        .student(student_id)
        .ok_or(ServiceError::NotFound("student"))?;
    let hidden = projection::current_hidden(conn, &link.user_id, &next.id)?.unwrap_or(false);
    let written =
        recompute_and_replace(conn, &next, student, &link.user_id, hidden, Revision::default())?;
    invalidate_section_caches(cache, &next.id, &next.owner_id);
    invalidate_grade_caches(cache, &link.user_id);
    Ok((link.clone(), written))
}

/// Removes the connection and every projection record for (user, section).
/// The roster entry's embedded scores are untouched: disconnection changes
/// projection visibility, not the instructor's copy.
pub fn disconnect_student(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section: &Section,
    student_id: &str,
    user_id: &str,
) -> Result<usize, ServiceError> {
    connection::remove(conn, student_id, user_id, &section.id)?;
    let removed = projection::delete_all(conn, user_id, &section.id)?;
    let next = section.with_connected_user(student_id, None)?;
    section::save(conn, &next)?;
    invalidate_section_caches(cache, &next.id, &next.owner_id);
    invalidate_grade_caches(cache, user_id);
    Ok(removed)
}

/// Deletes a section and cascades to every derived projection and
/// connection, in one transaction.
pub fn delete_section(
    conn: &DbConnection,
    cache: &mut JsonCache,
    section_id: &str,
) -> Result<(), ServiceError> {
    let existing = section::get(conn, section_id)?;
    let links = connection::list_for_section(conn, section_id, false)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grades WHERE section_id = ?", [section_id])?;
    tx.execute("DELETE FROM connections WHERE section_id = ?", [section_id])?;
    tx.execute("DELETE FROM sections WHERE id = ?", [section_id])?;
    tx.commit()?;

    invalidate_section_caches(cache, section_id, &existing.owner_id);
    for link in links {
        invalidate_grade_caches(cache, &link.user_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::section::{
        Assessment, Category, CategoryWeights, ScoreEntry, Student, Subject,
    };
    use std::collections::HashMap;

    fn test_conn() -> DbConnection {
        let conn = DbConnection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("schema");
        conn
    }

    fn math_subject() -> Subject {
        Subject {
            id: "math".into(),
            name: "Mathematics".into(),
            weights: CategoryWeights {
                written_work: 30.0,
                performance_task: 50.0,
                quarterly_exam: 20.0,
            },
            assessments: vec![
                Assessment {
                    id: "ww-1".into(),
                    name: "Quiz 1".into(),
                    category: Category::WrittenWork,
                    quarter: 1,
                    max_points: 10.0,
                },
                Assessment {
                    id: "pt-1".into(),
                    name: "Project".into(),
                    category: Category::PerformanceTask,
                    quarter: 1,
                    max_points: 50.0,
                },
                Assessment {
                    id: "qe-1".into(),
                    name: "Exam".into(),
                    category: Category::QuarterlyExam,
                    quarter: 1,
                    max_points: 20.0,
                },
            ],
        }
    }

    fn seeded_section(conn: &DbConnection) -> Section {
        let section = Section {
            id: "sec-1".into(),
            name: "Sampaguita".into(),
            grade_level: 7,
            owner_id: "teacher-1".into(),
            subjects: vec![math_subject()],
            students: vec![Student {
                id: "stu-1".into(),
                name: "Reyes, Juan".into(),
                lrn: None,
                gender: None,
                grade_data: HashMap::new(),
                connected_user_id: None,
            }],
        };
        section::save(conn, &section).expect("save section");
        let section = section
            .with_score("stu-1", "math", "ww-1", Some(8.0))
            .and_then(|s| s.with_score("stu-1", "math", "pt-1", Some(45.0)))
            .and_then(|s| s.with_score("stu-1", "math", "qe-1", Some(18.0)))
            .expect("score edits");
        section::save(conn, &section).expect("save scored section");
        section
    }

    #[test]
    fn recompute_writes_the_worked_example() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        let (_, written) =
            connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
                .expect("connect");
        assert_eq!(written, 1);

        let grades = projection::query(&conn, "user-1", None, true).expect("query");
        assert_eq!(grades.len(), 1);
        assert_eq!(grades[0].subject, "Mathematics");
        assert_eq!(grades[0].period, 1);
        assert_eq!(grades[0].score, 91.0);
        assert!(!grades[0].hidden);
    }

    #[test]
    fn recompute_is_idempotent_field_for_field() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");

        let first = projection::query(&conn, "user-1", None, true).expect("query");
        let stored = section::get(&conn, "sec-1").expect("reload");
        let report = sync_section(&conn, &mut cache, &stored, Revision::default()).expect("sync");
        assert_eq!(report.synced, 1);
        assert!(report.failed.is_empty());
        let second = projection::query(&conn, "user-1", None, true).expect("query");
        assert_eq!(first, second);
    }

    #[test]
    fn local_only_students_never_project() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        // No connection exists: sync has nothing to do for this roster.
        let report = sync_section(&conn, &mut cache, &section, Revision::default()).expect("sync");
        assert_eq!(report.synced, 0);
        assert!(projection::query(&conn, "user-1", None, true)
            .expect("query")
            .is_empty());
    }

    #[test]
    fn assessment_removal_leaves_no_orphan_records() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");

        let section = section::get(&conn, "sec-1").expect("reload");
        let trimmed = section
            .with_assessment_removed("math", "ww-1")
            .and_then(|s| s.with_assessment_removed("math", "pt-1"))
            .and_then(|s| s.with_assessment_removed("math", "qe-1"))
            .expect("remove assessments");
        let report =
            save_and_sync(&conn, &mut cache, &trimmed, Revision::default()).expect("sync");
        assert!(report.failed.is_empty());

        // Quarter 1 is no longer populated, so the record set is empty.
        assert!(projection::query(&conn, "user-1", None, true)
            .expect("query")
            .is_empty());
    }

    #[test]
    fn visibility_toggle_never_touches_scores() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");

        let before = projection::query(&conn, "user-1", None, true).expect("query");
        let report =
            set_hidden_for_section(&conn, &mut cache, "sec-1", true).expect("toggle");
        assert_eq!(report.updated, 1);
        assert!(report.failed.is_empty());

        let after = projection::query(&conn, "user-1", None, true).expect("query");
        assert_eq!(before[0].score, after[0].score);
        assert!(after[0].hidden);
        // Default (hidden-filtered) view is now empty.
        assert!(projection::query(&conn, "user-1", None, false)
            .expect("query")
            .is_empty());
    }

    #[test]
    fn resync_preserves_the_hidden_flag() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");
        set_hidden_for_student(&conn, &mut cache, "sec-1", "stu-1", true).expect("hide");

        let section = section::get(&conn, "sec-1").expect("reload");
        let edited = section
            .with_score("stu-1", "math", "ww-1", Some(10.0))
            .expect("edit");
        save_and_sync(&conn, &mut cache, &edited, Revision::default()).expect("sync");

        let grades = projection::query(&conn, "user-1", None, true).expect("query");
        assert_eq!(grades.len(), 1);
        assert!(grades[0].hidden);
        // 100*0.3 + 90*0.5 + 90*0.2 = 93 -> 95 bracket.
        assert_eq!(grades[0].score, 95.0);
    }

    #[test]
    fn disconnect_removes_projection_but_not_section_scores() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");

        let section = section::get(&conn, "sec-1").expect("reload");
        let removed =
            disconnect_student(&conn, &mut cache, &section, "stu-1", "user-1").expect("disconnect");
        assert_eq!(removed, 1);
        assert!(projection::query(&conn, "user-1", None, true)
            .expect("query")
            .is_empty());

        let stored = section::get(&conn, "sec-1").expect("reload");
        let entry: &ScoreEntry =
            &stored.students[0].grade_data["math"].quarter1.written_work[0];
        assert_eq!(entry.score, Some(8.0));
        assert_eq!(stored.students[0].connected_user_id, None);
    }

    #[test]
    fn connect_conflicts_and_repair_converges() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        let (link, _) =
            connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
                .expect("connect");

        let section = section::get(&conn, "sec-1").expect("reload");
        let err = connect_student(&conn, &mut cache, &section, "stu-1", "user-2", "teacher-1")
            .expect_err("duplicate connect");
        assert_eq!(err.code(), "conflict");

        let (repaired, _) =
            repair_connection(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
                .expect("repair");
        assert_eq!(repaired.id, link.id);
        assert_eq!(
            connection::list_for_section(&conn, "sec-1", true)
                .expect("list")
                .len(),
            1
        );
    }

    #[test]
    fn section_delete_cascades_projections_and_connections() {
        let conn = test_conn();
        let mut cache = JsonCache::new();
        let section = seeded_section(&conn);
        connect_student(&conn, &mut cache, &section, "stu-1", "user-1", "teacher-1")
            .expect("connect");

        delete_section(&conn, &mut cache, "sec-1").expect("delete");
        assert!(matches!(
            section::get(&conn, "sec-1"),
            Err(ServiceError::NotFound(_))
        ));
        assert!(projection::query(&conn, "user-1", None, true)
            .expect("query")
            .is_empty());
        assert!(connection::list_for_section(&conn, "sec-1", false)
            .expect("list")
            .is_empty());
    }
}
