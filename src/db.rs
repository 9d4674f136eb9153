use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("quizdesk.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL,
            total_points INTEGER NOT NULL,
            questions TEXT NOT NULL,
            classification_stats TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quizzes_owner ON quizzes(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            class_no TEXT,
            subject TEXT,
            status TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_owner ON classes(owner_id)",
        [],
    )?;

    // Learners reference classes through the many-valued class_ids field,
    // stored as a JSON array; there is no reverse roster table.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            student_no TEXT,
            program TEXT,
            auth_uid TEXT,
            has_account INTEGER NOT NULL DEFAULT 0,
            class_ids TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assigned_quizzes(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_doc_id TEXT,
            student_name TEXT,
            student_no TEXT,
            quiz_title TEXT NOT NULL,
            class_name TEXT NOT NULL,
            subject TEXT,
            quiz_mode TEXT NOT NULL,
            quiz_code TEXT,
            due_date TEXT,
            settings TEXT NOT NULL,
            status TEXT NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            raw_score_percentage INTEGER,
            base50_score_percentage INTEGER,
            correct_points INTEGER,
            total_points INTEGER,
            started_at TEXT,
            submitted_at TEXT,
            assigned_at TEXT NOT NULL,
            assigned_by TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assigned_quiz_class ON assigned_quizzes(quiz_id, class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assigned_student ON assigned_quizzes(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assigned_class ON assigned_quizzes(class_id)",
        [],
    )?;

    // Live-mode session columns shipped after the original table; add them
    // in place on older workspaces.
    ensure_assigned_quizzes_live_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            quiz_id TEXT NOT NULL,
            quiz_title TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_no TEXT,
            class_id TEXT,
            class_name TEXT,
            quiz_mode TEXT NOT NULL,
            answers TEXT NOT NULL,
            raw_score_percentage INTEGER NOT NULL,
            base50_score_percentage INTEGER NOT NULL,
            correct_points INTEGER NOT NULL,
            total_points INTEGER NOT NULL,
            total_questions INTEGER NOT NULL,
            submitted_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_assignment ON quiz_submissions(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_student ON quiz_submissions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS archived_classes(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            class_no TEXT,
            subject TEXT,
            archived_at TEXT NOT NULL,
            archived_by TEXT NOT NULL,
            student_snapshot TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archived_classes_owner ON archived_classes(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS archived_quizzes(
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            total_points INTEGER NOT NULL,
            questions TEXT NOT NULL,
            classification_stats TEXT,
            created_at TEXT,
            updated_at TEXT,
            archived_at TEXT NOT NULL,
            archived_by TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archived_quizzes_owner ON archived_quizzes(owner_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_assigned_quizzes_live_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assigned_quizzes", "session_status")? {
        conn.execute(
            "ALTER TABLE assigned_quizzes ADD COLUMN session_status TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "assigned_quizzes", "session_started_at")? {
        conn.execute(
            "ALTER TABLE assigned_quizzes ADD COLUMN session_started_at TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "assigned_quizzes", "session_ended_at")? {
        conn.execute(
            "ALTER TABLE assigned_quizzes ADD COLUMN session_ended_at TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "assigned_quizzes", "current_answers")? {
        conn.execute(
            "ALTER TABLE assigned_quizzes ADD COLUMN current_answers TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "assigned_quizzes", "current_question_index")? {
        conn.execute(
            "ALTER TABLE assigned_quizzes ADD COLUMN current_question_index INTEGER",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
