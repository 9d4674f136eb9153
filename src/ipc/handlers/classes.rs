use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn create_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    let name = get_required_str(&req.params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let code = get_opt_str(&req.params, "code");
    let class_no = get_opt_str(&req.params, "classNo");
    let subject = get_opt_str(&req.params, "subject");

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, owner_id, name, code, class_no, subject, status)
         VALUES(?, ?, ?, ?, ?, ?, 'active')",
        params![class_id, teacher_id, name, code, class_no, subject],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "classId": class_id, "name": name }))
}

fn list_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    // The learner side owns membership (class_ids JSON array), so the count
    // is a containment probe against that field.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.code,
               c.class_no,
               c.subject,
               (SELECT COUNT(*) FROM users u
                 WHERE u.role = 'student'
                   AND u.class_ids LIKE '%\"' || c.id || '\"%') AS student_count,
               (SELECT COUNT(DISTINCT a.quiz_id) FROM assigned_quizzes a
                 WHERE a.class_id = c.id) AS assigned_quiz_count
             FROM classes c
             WHERE c.owner_id = ?
             ORDER BY c.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let classes = stmt
        .query_map([&teacher_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: Option<String> = r.get(2)?;
            let class_no: Option<String> = r.get(3)?;
            let subject: Option<String> = r.get(4)?;
            let student_count: i64 = r.get(5)?;
            let assigned_quiz_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "classNo": class_no,
                "subject": subject,
                "studentCount": student_count,
                "assignedQuizCount": assigned_quiz_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "classes": classes }))
}

fn get_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;

    let row = conn
        .query_row(
            "SELECT owner_id, name, code, class_no, subject, status
             FROM classes WHERE id = ?",
            [&class_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let Some((owner_id, name, code, class_no, subject, status)) = row else {
        return Err(HandlerErr::not_found("class not found"));
    };

    Ok(json!({
        "class": {
            "id": class_id,
            "ownerId": owner_id,
            "name": name,
            "code": code,
            "classNo": class_no,
            "subject": subject,
            "status": status,
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(match create_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Classes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "classes.list" => Some(match list_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "classes.get" => Some(match get_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
