use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One read-optimized, per-learner grade record. Derived data: created and
/// replaced wholesale by the synchronizer, never edited in place except for
/// the visibility flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub user_id: String,
    pub subject: String,
    pub period: u8,
    pub score: f64,
    pub section_id: String,
    pub created_at: String,
    pub hidden: bool,
}

pub fn query(
    conn: &Connection,
    user_id: &str,
    section_id: Option<&str>,
    include_hidden: bool,
) -> Result<Vec<Grade>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT user_id, subject, period, score, section_id, created_at, hidden
         FROM grades WHERE user_id = ?1",
    );
    if section_id.is_some() {
        sql.push_str(" AND section_id = ?2");
    }
    if !include_hidden {
        sql.push_str(" AND hidden = 0");
    }
    sql.push_str(" ORDER BY section_id, subject, period");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(Grade {
            user_id: r.get(0)?,
            subject: r.get(1)?,
            period: r.get::<_, i64>(2)? as u8,
            score: r.get(3)?,
            section_id: r.get(4)?,
            created_at: r.get(5)?,
            hidden: r.get::<_, i64>(6)? != 0,
        })
    };
    match section_id {
        Some(sid) => stmt
            .query_map((user_id, sid), map_row)
            .and_then(|it| it.collect()),
        None => stmt.query_map([user_id], map_row).and_then(|it| it.collect()),
    }
}

/// Replaces the whole (user, section) projection set in one transaction.
/// Readers never observe a partial mix of old and new records.
pub fn batch_replace(
    conn: &Connection,
    user_id: &str,
    section_id: &str,
    grades: &[Grade],
) -> Result<usize, rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM grades WHERE user_id = ? AND section_id = ?",
        (user_id, section_id),
    )?;
    for g in grades {
        tx.execute(
            "INSERT INTO grades(id, user_id, subject, period, score, section_id, created_at, hidden)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &g.user_id,
                &g.subject,
                g.period as i64,
                g.score,
                &g.section_id,
                &g.created_at,
                g.hidden as i64,
            ),
        )?;
    }
    tx.commit()?;
    Ok(grades.len())
}

/// Flips only the hidden flag on every (user, section) record; the score
/// column is never touched by a visibility change.
pub fn batch_set_hidden(
    conn: &Connection,
    user_id: &str,
    section_id: &str,
    hidden: bool,
) -> Result<usize, rusqlite::Error> {
    let n = conn.execute(
        "UPDATE grades SET hidden = ? WHERE user_id = ? AND section_id = ?",
        (hidden as i64, user_id, section_id),
    )?;
    Ok(n)
}

pub fn delete_all(
    conn: &Connection,
    user_id: &str,
    section_id: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM grades WHERE user_id = ? AND section_id = ?",
        (user_id, section_id),
    )
}

/// Current hidden state of a (user, section) projection set, if any records
/// exist. Visibility is toggled per set, so any row is representative.
pub fn current_hidden(
    conn: &Connection,
    user_id: &str,
    section_id: &str,
) -> Result<Option<bool>, rusqlite::Error> {
    conn.query_row(
        "SELECT hidden FROM grades WHERE user_id = ? AND section_id = ? LIMIT 1",
        (user_id, section_id),
        |r| Ok(r.get::<_, i64>(0)? != 0),
    )
    .optional()
}

/// Prior creation timestamps keyed by (subject, period), so an unchanged
/// recomputation reproduces the record set field-for-field.
pub fn created_at_index(
    conn: &Connection,
    user_id: &str,
    section_id: &str,
) -> Result<std::collections::HashMap<(String, u8), String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT subject, period, created_at FROM grades
         WHERE user_id = ? AND section_id = ?",
    )?;
    let rows = stmt.query_map((user_id, section_id), |r| {
        Ok((
            (r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u8),
            r.get::<_, String>(2)?,
        ))
    })?;
    rows.collect()
}
