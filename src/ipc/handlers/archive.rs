use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    class_ids_json, get_required_str, now_rfc3339, parse_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

struct SnapshotStudent {
    id: String,
    name: String,
    email: Option<String>,
    student_no: Option<String>,
    program: Option<String>,
    class_ids: Vec<String>,
}

fn enrolled_students(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<SnapshotStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, email, student_no, program, class_ids
             FROM users
             WHERE role = 'student' AND class_ids LIKE '%\"' || ? || '\"%'
             ORDER BY name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(SnapshotStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                student_no: r.get(3)?,
                program: r.get(4)?,
                class_ids: parse_class_ids(&r.get::<_, String>(5)?),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(rows
        .into_iter()
        .filter(|s| s.class_ids.iter().any(|c| c == class_id))
        .collect())
}

fn archive_class_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let row: Option<(String, String, Option<String>, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT owner_id, name, code, class_no, subject FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, name, code, class_no, subject)) = row else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("class belongs to another teacher"));
    }

    let enrolled = enrolled_students(conn, &class_id)?;
    let now = now_rfc3339();
    let snapshot = json!({
        "count": enrolled.len(),
        "students": enrolled.iter().map(|s| json!({
            "id": s.id,
            "name": s.name,
            "email": s.email,
            "studentNo": s.student_no,
            "program": s.program,
        })).collect::<Vec<_>>(),
        "snapshotDate": now,
    });

    // Membership removal, snapshot write and class delete land together;
    // a failure leaves the class fully active.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for student in &enrolled {
        let remaining: Vec<String> = student
            .class_ids
            .iter()
            .filter(|c| *c != &class_id)
            .cloned()
            .collect();
        tx.execute(
            "UPDATE users SET class_ids = ? WHERE id = ?",
            params![class_ids_json(&remaining), student.id],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    // A second archive of the same id overwrites the previous copy.
    tx.execute(
        "INSERT OR REPLACE INTO archived_classes(
            id, owner_id, name, code, class_no, subject, archived_at, archived_by,
            student_snapshot)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            class_id,
            owner_id,
            name,
            code,
            class_no,
            subject,
            now,
            teacher_id,
            snapshot.to_string()
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "classId": class_id,
        "archived": true,
        "studentCount": enrolled.len(),
    }))
}

fn restore_class_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let row: Option<(String, String, Option<String>, Option<String>, Option<String>, String)> =
        conn.query_row(
            "SELECT owner_id, name, code, class_no, subject, student_snapshot
             FROM archived_classes WHERE id = ?",
            [&class_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, name, code, class_no, subject, snapshot)) = row else {
        return Err(HandlerErr::not_found("archived class not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("class belongs to another teacher"));
    }

    let snapshot: serde_json::Value = serde_json::from_str(&snapshot).unwrap_or(json!({}));
    let snapshot_students: Vec<(String, String)> = snapshot
        .get("students")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|s| {
                    let id = s.get("id").and_then(|v| v.as_str())?;
                    let name = s.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                    Some((id.to_string(), name.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT OR REPLACE INTO classes(id, owner_id, name, code, class_no, subject, status)
         VALUES(?, ?, ?, ?, ?, ?, 'active')",
        params![class_id, owner_id, name, code, class_no, subject],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    // Every snapshot learner is re-enrolled, account or not; learners that
    // no longer exist are skipped with a warning rather than failing the
    // whole restore.
    let mut re_enrolled = 0usize;
    let mut missing: Vec<String> = Vec::new();
    for (student_id, student_name) in &snapshot_students {
        let class_ids: Option<String> = tx
            .query_row("SELECT class_ids FROM users WHERE id = ?", [student_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        match class_ids {
            Some(raw) => {
                let mut ids = parse_class_ids(&raw);
                if !ids.contains(&class_id) {
                    ids.push(class_id.clone());
                }
                tx.execute(
                    "UPDATE users SET class_ids = ? WHERE id = ?",
                    params![class_ids_json(&ids), student_id],
                )
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
                re_enrolled += 1;
            }
            None => missing.push(student_name.clone()),
        }
    }

    tx.execute("DELETE FROM archived_classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "classId": class_id,
        "restored": true,
        "reEnrolled": re_enrolled,
        "missingStudents": missing,
    }))
}

fn list_archived_classes_inner(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, code, class_no, subject, archived_at, student_snapshot
             FROM archived_classes
             WHERE owner_id = ?
             ORDER BY archived_at DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let classes = stmt
        .query_map([&teacher_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let class_no: Option<String> = r.get(3)?;
            let subject: Option<String> = r.get(4)?;
            let archived_at: String = r.get(5)?;
            let snapshot: String = r.get(6)?;
            let student_count = serde_json::from_str::<serde_json::Value>(&snapshot)
                .ok()
                .and_then(|v| v.get("count").and_then(|c| c.as_u64()))
                .unwrap_or(0);
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "classNo": class_no,
                "subject": subject,
                "archivedAt": archived_at,
                "studentCount": student_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "archivedClasses": classes }))
}

fn delete_archived_class_inner(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT owner_id FROM archived_classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match owner {
        None => return Err(HandlerErr::not_found("archived class not found")),
        Some(o) if o != teacher_id => {
            return Err(HandlerErr::permission("class belongs to another teacher"))
        }
        Some(_) => {}
    }

    conn.execute("DELETE FROM archived_classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "deleted": true }))
}

fn archive_quiz_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let row: Option<(String, String, i64, String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT owner_id, title, total_points, questions, classification_stats,
                    created_at, updated_at
             FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, title, total_points, questions, stats, created_at, updated_at)) = row
    else {
        return Err(HandlerErr::not_found("quiz not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("quiz belongs to another teacher"));
    }

    let now = now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT OR REPLACE INTO archived_quizzes(
            id, owner_id, title, total_points, questions, classification_stats,
            created_at, updated_at, archived_at, archived_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            quiz_id, owner_id, title, total_points, questions, stats, created_at, updated_at,
            now, teacher_id
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    tx.execute("DELETE FROM quizzes WHERE id = ?", [&quiz_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "quizId": quiz_id, "archived": true }))
}

fn restore_quiz_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let row: Option<(String, String, i64, String, Option<String>)> = conn
        .query_row(
            "SELECT owner_id, title, total_points, questions, classification_stats
             FROM archived_quizzes WHERE id = ?",
            [&quiz_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, title, total_points, questions, stats)) = row else {
        return Err(HandlerErr::not_found("archived quiz not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("quiz belongs to another teacher"));
    }

    // Restored quizzes come back published with fresh timestamps.
    let now = now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT OR REPLACE INTO quizzes(
            id, owner_id, title, status, total_points, questions, classification_stats,
            created_at, updated_at)
         VALUES(?, ?, ?, 'published', ?, ?, ?, ?, ?)",
        params![quiz_id, owner_id, title, total_points, questions, stats, now, now],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    tx.execute("DELETE FROM archived_quizzes WHERE id = ?", [&quiz_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "quizId": quiz_id, "restored": true }))
}

fn list_archived_quizzes_inner(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, title, total_points, questions, archived_at
             FROM archived_quizzes
             WHERE owner_id = ?
             ORDER BY archived_at DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let quizzes = stmt
        .query_map([&teacher_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let total_points: i64 = r.get(2)?;
            let questions: String = r.get(3)?;
            let archived_at: String = r.get(4)?;
            let question_count = serde_json::from_str::<serde_json::Value>(&questions)
                .ok()
                .and_then(|v| v.as_array().map(|a| a.len()))
                .unwrap_or(0);
            Ok(json!({
                "id": id,
                "title": title,
                "totalPoints": total_points,
                "questionCount": question_count,
                "archivedAt": archived_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "archivedQuizzes": quizzes }))
}

fn delete_archived_quiz_inner(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT owner_id FROM archived_quizzes WHERE id = ?",
            [&quiz_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match owner {
        None => return Err(HandlerErr::not_found("archived quiz not found")),
        Some(o) if o != teacher_id => {
            return Err(HandlerErr::permission("quiz belongs to another teacher"))
        }
        Some(_) => {}
    }

    conn.execute("DELETE FROM archived_quizzes WHERE id = ?", [&quiz_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.archive" => Some(match archive_class_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Classes);
                state.changes.record(Topic::Students);
                state.changes.record(Topic::ArchivedClasses);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "classes.restore" => Some(match restore_class_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Classes);
                state.changes.record(Topic::Students);
                state.changes.record(Topic::ArchivedClasses);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "archivedClasses.list" => Some(match list_archived_classes_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "archivedClasses.delete" => Some(match delete_archived_class_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::ArchivedClasses);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "quizzes.archive" => Some(match archive_quiz_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Quizzes);
                state.changes.record(Topic::ArchivedQuizzes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "quizzes.restore" => Some(match restore_quiz_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Quizzes);
                state.changes.record(Topic::ArchivedQuizzes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "archivedQuizzes.list" => Some(match list_archived_quizzes_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "archivedQuizzes.delete" => Some(match delete_archived_quiz_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::ArchivedQuizzes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
