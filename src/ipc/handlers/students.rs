use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    class_ids_json, get_opt_str, get_required_str, parse_class_ids, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn create_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let name = get_required_str(&req.params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let email = get_opt_str(&req.params, "email");
    let student_no = get_opt_str(&req.params, "studentNo");
    let program = get_opt_str(&req.params, "program");
    let auth_uid = get_opt_str(&req.params, "authUid");

    // A learner already known by email is re-enrolled, not duplicated.
    if let Some(email) = email.as_deref().filter(|e| !e.is_empty()) {
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, class_ids FROM users WHERE role = 'student' AND email = ?",
                [email],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;

        if let Some((student_id, class_ids)) = existing {
            let mut ids = parse_class_ids(&class_ids);
            if !ids.contains(&class_id) {
                ids.push(class_id.clone());
            }
            conn.execute(
                "UPDATE users SET class_ids = ? WHERE id = ?",
                params![class_ids_json(&ids), student_id],
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            return Ok(json!({ "studentId": student_id, "enrolled": true, "created": false }));
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let has_account = auth_uid.as_deref().map(|a| !a.is_empty()).unwrap_or(false);
    conn.execute(
        "INSERT INTO users(id, role, name, email, student_no, program, auth_uid,
                           has_account, class_ids)
         VALUES(?, 'student', ?, ?, ?, ?, ?, ?, ?)",
        params![
            student_id,
            name,
            email,
            student_no,
            program,
            auth_uid,
            has_account as i64,
            class_ids_json(&[class_id])
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({ "studentId": student_id, "enrolled": true, "created": true }))
}

fn list_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, email, student_no, program, auth_uid, has_account, class_ids
             FROM users
             WHERE role = 'student' AND class_ids LIKE '%\"' || ? || '\"%'
             ORDER BY name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let email: Option<String> = r.get(2)?;
            let student_no: Option<String> = r.get(3)?;
            let program: Option<String> = r.get(4)?;
            let auth_uid: Option<String> = r.get(5)?;
            let has_account: i64 = r.get(6)?;
            let class_ids: String = r.get(7)?;
            Ok((id, name, email, student_no, program, auth_uid, has_account, class_ids))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    // The LIKE probe can in principle overmatch; confirm against the parsed
    // membership list before reporting.
    let students: Vec<serde_json::Value> = students
        .into_iter()
        .filter(|(.., class_ids)| parse_class_ids(class_ids).contains(&class_id))
        .map(
            |(id, name, email, student_no, program, auth_uid, has_account, _)| {
                json!({
                    "id": id,
                    "name": name,
                    "email": email,
                    "studentNo": student_no,
                    "program": program,
                    "authUid": auth_uid,
                    "hasAccount": has_account != 0,
                })
            },
        )
        .collect();

    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(match create_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Students);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "students.list" => Some(match list_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
