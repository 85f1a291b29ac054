use rusqlite::{Connection as DbConnection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::section::Section;

/// Link between a roster entry and a platform account. Gates whether any
/// projection exists for the student at all. Natural key: (studentId,
/// sectionId), at most one active row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub student_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lrn: Option<String>,
    pub section_id: String,
    pub section_name: String,
    pub grade_level: i64,
    pub connected_at: String,
    pub connected_by: String,
    pub is_active: bool,
}

fn row_to_connection(r: &rusqlite::Row<'_>) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: r.get(0)?,
        student_id: r.get(1)?,
        user_id: r.get(2)?,
        lrn: r.get(3)?,
        section_id: r.get(4)?,
        section_name: r.get(5)?,
        grade_level: r.get(6)?,
        connected_at: r.get(7)?,
        connected_by: r.get(8)?,
        is_active: r.get::<_, i64>(9)? != 0,
    })
}

const COLUMNS: &str = "id, student_id, user_id, lrn, section_id, section_name,
    grade_level, connected_at, connected_by, is_active";

pub fn find(
    conn: &DbConnection,
    student_id: &str,
    section_id: &str,
) -> Result<Option<Connection>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM connections WHERE student_id = ? AND section_id = ?"),
        (student_id, section_id),
        row_to_connection,
    )
    .optional()
}

pub fn list_for_section(
    conn: &DbConnection,
    section_id: &str,
    active_only: bool,
) -> Result<Vec<Connection>, rusqlite::Error> {
    let sql = if active_only {
        format!("SELECT {COLUMNS} FROM connections WHERE section_id = ? AND is_active = 1 ORDER BY connected_at")
    } else {
        format!("SELECT {COLUMNS} FROM connections WHERE section_id = ? ORDER BY connected_at")
    };
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map([section_id], row_to_connection)
        .and_then(|it| it.collect())
}

/// Creates the connection, or reports a conflict if the natural key already
/// has an active row. An inactive leftover is reactivated in place rather
/// than duplicated.
pub fn connect(
    conn: &DbConnection,
    section: &Section,
    student_id: &str,
    user_id: &str,
    connected_by: &str,
) -> Result<Connection, ServiceError> {
    let student = section
        .student(student_id)
        .ok_or(ServiceError::NotFound("student"))?;

    match find(conn, student_id, &section.id)? {
        Some(existing) if existing.is_active => Err(ServiceError::Conflict(format!(
            "student {} is already connected in section {}",
            student_id, section.id
        ))),
        Some(existing) => {
            let connected_at = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE connections
                 SET user_id = ?, connected_at = ?, connected_by = ?, is_active = 1
                 WHERE id = ?",
                (user_id, &connected_at, connected_by, &existing.id),
            )?;
            Ok(Connection {
                user_id: user_id.to_string(),
                connected_at,
                connected_by: connected_by.to_string(),
                is_active: true,
                ..existing
            })
        }
        None => {
            let record = Connection {
                id: Uuid::new_v4().to_string(),
                student_id: student_id.to_string(),
                user_id: user_id.to_string(),
                lrn: student.lrn.clone(),
                section_id: section.id.clone(),
                section_name: section.name.clone(),
                grade_level: section.grade_level,
                connected_at: chrono::Utc::now().to_rfc3339(),
                connected_by: connected_by.to_string(),
                is_active: true,
            };
            insert(conn, &record)?;
            Ok(record)
        }
    }
}

/// Idempotent lookup-or-reactivate-or-create on the natural key. Safe to
/// re-invoke after client retries or partial failures; never produces a
/// second active row for the same (student, section).
pub fn repair(
    conn: &DbConnection,
    section: &Section,
    student_id: &str,
    user_id: &str,
    connected_by: &str,
) -> Result<Connection, ServiceError> {
    match find(conn, student_id, &section.id)? {
        Some(existing) if existing.is_active => Ok(existing),
        Some(existing) => {
            conn.execute(
                "UPDATE connections SET user_id = ?, is_active = 1 WHERE id = ?",
                (user_id, &existing.id),
            )?;
            Ok(Connection {
                user_id: user_id.to_string(),
                is_active: true,
                ..existing
            })
        }
        None => connect(conn, section, student_id, user_id, connected_by),
    }
}

/// Removes the connection row. The projection cleanup and the section
/// document update are the synchronizer's responsibility.
pub fn remove(
    conn: &DbConnection,
    student_id: &str,
    user_id: &str,
    section_id: &str,
) -> Result<(), ServiceError> {
    let n = conn.execute(
        "DELETE FROM connections WHERE student_id = ? AND user_id = ? AND section_id = ?",
        (student_id, user_id, section_id),
    )?;
    if n == 0 {
        return Err(ServiceError::NotFound("connection"));
    }
    Ok(())
}

fn insert(conn: &DbConnection, c: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO connections(id, student_id, user_id, lrn, section_id, section_name,
                                 grade_level, connected_at, connected_by, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &c.id,
            &c.student_id,
            &c.user_id,
            &c.lrn,
            &c.section_id,
            &c.section_name,
            c.grade_level,
            &c.connected_at,
            &c.connected_by,
            c.is_active as i64,
        ),
    )?;
    Ok(())
}
