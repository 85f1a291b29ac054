use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradesync.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the three tables. Sections are stored as whole JSON documents
/// (save is last-write-wins on the document); projections and connections
/// are relational because they are queried by several keys.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            doc TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_owner ON sections(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            period INTEGER NOT NULL,
            score REAL NOT NULL,
            section_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            hidden INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_user ON grades(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_user_section ON grades(user_id, section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_section ON grades(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS connections(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            lrn TEXT,
            section_id TEXT NOT NULL,
            section_name TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            connected_at TEXT NOT NULL,
            connected_by TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(student_id, section_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_connections_section ON connections(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id)",
        [],
    )?;

    Ok(())
}
