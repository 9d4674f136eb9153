use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_required_str, now_rfc3339, parse_class_ids, parse_rfc3339, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;
use crate::session::QuizMode;

/// Per-assignment settings, embedded as JSON on every record of the set so
/// a learner session never needs the quiz's current settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentSettings {
    pub mode: String,
    pub time_limit: Option<u32>,
    pub deadline: Option<String>,
    pub shuffle_questions: bool,
    pub shuffle_choices: bool,
    pub show_results: bool,
    pub allow_review: bool,
    pub show_correct_answers: bool,
    pub passing_score: u32,
    pub max_attempts: u32,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            mode: "asynchronous".to_string(),
            time_limit: None,
            deadline: None,
            shuffle_questions: false,
            shuffle_choices: false,
            show_results: true,
            allow_review: true,
            show_correct_answers: true,
            passing_score: 60,
            max_attempts: 1,
        }
    }
}

const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// 6 characters from [A-Z0-9]. Checked against codes already on live
/// records, with a bounded number of redraws; the residual collision window
/// is accepted.
fn fresh_quiz_code(conn: &Connection) -> Result<String, HandlerErr> {
    let mut rng = rand::rng();
    let mut code = String::new();
    for _ in 0..5 {
        code = (0..6)
            .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
            .collect();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM assigned_quizzes WHERE quiz_code = ? LIMIT 1",
                [&code],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if taken.is_none() {
            break;
        }
    }
    Ok(code)
}

struct QuizHead {
    title: String,
    status: String,
}

fn load_owned_quiz(
    conn: &Connection,
    quiz_id: &str,
    teacher_id: &str,
) -> Result<QuizHead, HandlerErr> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT owner_id, title, status FROM quizzes WHERE id = ?",
            [quiz_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, title, status)) = row else {
        return Err(HandlerErr::not_found("quiz not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("quiz belongs to another teacher"));
    }
    Ok(QuizHead { title, status })
}

struct ClassHead {
    name: String,
    subject: Option<String>,
}

fn load_owned_class(
    conn: &Connection,
    class_id: &str,
    teacher_id: &str,
) -> Result<ClassHead, HandlerErr> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT owner_id, name, subject FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((owner_id, name, subject)) = row else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if owner_id != teacher_id {
        return Err(HandlerErr::permission("class belongs to another teacher"));
    }
    Ok(ClassHead { name, subject })
}

#[derive(Debug, Clone)]
struct RosterEntry {
    doc_id: String,
    name: String,
    student_no: Option<String>,
    auth_uid: Option<String>,
}

fn load_roster(
    conn: &Connection,
    class_id: &str,
    only_ids: Option<&[String]>,
) -> Result<Vec<RosterEntry>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, student_no, auth_uid, class_ids
             FROM users
             WHERE role = 'student' AND class_ids LIKE '%\"' || ? || '\"%'
             ORDER BY name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let class_id = class_id.to_string();
    Ok(rows
        .into_iter()
        .filter(|(.., class_ids)| parse_class_ids(class_ids).contains(&class_id))
        .filter(|(doc_id, ..)| {
            only_ids
                .map(|ids| ids.iter().any(|i| i == doc_id))
                .unwrap_or(true)
        })
        .map(|(doc_id, name, student_no, auth_uid, _)| RosterEntry {
            doc_id,
            name,
            student_no,
            auth_uid: auth_uid.filter(|a| !a.is_empty()),
        })
        .collect())
}

fn parse_settings(params: &serde_json::Value) -> Result<(AssignmentSettings, QuizMode), HandlerErr> {
    let raw = params
        .get("settings")
        .ok_or_else(|| HandlerErr::bad_params("missing settings"))?;
    let settings: AssignmentSettings = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("settings are malformed: {}", e)))?;
    let mode = QuizMode::parse(&settings.mode).ok_or_else(|| {
        HandlerErr::bad_params("settings.mode must be asynchronous or synchronous")
    })?;
    if settings.max_attempts < 1 {
        return Err(HandlerErr::bad_params("settings.maxAttempts must be at least 1"));
    }
    if settings.passing_score > 100 {
        return Err(HandlerErr::bad_params("settings.passingScore must be 0-100"));
    }
    if let Some(limit) = settings.time_limit {
        if limit < 1 {
            return Err(HandlerErr::bad_params("settings.timeLimit must be at least 1 minute"));
        }
    }
    Ok((settings, mode))
}

fn existing_set_ids(
    conn: &Connection,
    quiz_id: &str,
    class_id: &str,
) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM assigned_quizzes WHERE quiz_id = ? AND class_id = ?")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([quiz_id, class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

struct AssignOutcome {
    result: serde_json::Value,
    removed_assignment_ids: Vec<String>,
}

fn assign_inner(
    state: &AppState,
    req: &Request,
    replace_existing: bool,
) -> Result<AssignOutcome, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    let quiz = load_owned_quiz(conn, &quiz_id, &teacher_id)?;
    if quiz.status != "published" {
        return Err(HandlerErr::new(
            "validation_failed",
            "only published quizzes can be assigned",
        ));
    }
    let class = load_owned_class(conn, &class_id, &teacher_id)?;

    let (settings, mode) = parse_settings(&req.params)?;

    // Mode-dependent validation happens before any write.
    let due_date = match mode {
        QuizMode::Asynchronous => {
            let due = get_required_str(&req.params, "dueDate")
                .map_err(|_| HandlerErr::bad_params("asynchronous mode needs a dueDate"))?;
            if parse_rfc3339(&due).is_none() {
                return Err(HandlerErr::bad_params("dueDate must be an RFC 3339 timestamp"));
            }
            due
        }
        QuizMode::Synchronous => {
            let deadline = settings.deadline.clone().ok_or_else(|| {
                HandlerErr::bad_params("synchronous mode needs a settings.deadline")
            })?;
            if parse_rfc3339(&deadline).is_none() {
                return Err(HandlerErr::bad_params(
                    "settings.deadline must be an RFC 3339 timestamp",
                ));
            }
            deadline
        }
    };

    let existing = existing_set_ids(conn, &quiz_id, &class_id)?;
    if !existing.is_empty() && !replace_existing {
        return Err(HandlerErr::with_details(
            "already_assigned",
            "this quiz is already assigned to this class; reassign to replace it",
            json!({ "existingCount": existing.len() }),
        ));
    }

    let only_ids: Option<Vec<String>> = req
        .params
        .get("studentIds")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        });
    let roster = load_roster(conn, &class_id, only_ids.as_deref())?;
    let (eligible, skipped): (Vec<_>, Vec<_>) =
        roster.into_iter().partition(|s| s.auth_uid.is_some());
    if eligible.is_empty() {
        return Err(HandlerErr::with_details(
            "no_eligible_students",
            "no selected students have accounts; nothing was assigned",
            json!({ "skipped": skipped.iter().map(|s| s.name.clone()).collect::<Vec<_>>() }),
        ));
    }

    let quiz_code = match mode {
        QuizMode::Synchronous => Some(fresh_quiz_code(conn)?),
        QuizMode::Asynchronous => None,
    };
    let initial_status = match mode {
        QuizMode::Synchronous => "not_started",
        QuizMode::Asynchronous => "pending",
    };
    let session_status = match mode {
        QuizMode::Synchronous => Some("not_started"),
        QuizMode::Asynchronous => None,
    };

    let settings_json = serde_json::to_string(&settings)
        .map_err(|e| HandlerErr::bad_params(format!("settings are malformed: {}", e)))?;
    let now = now_rfc3339();

    // Replace is delete-then-insert inside one transaction: the old and new
    // sets are never both live.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if !existing.is_empty() {
        tx.execute(
            "DELETE FROM assigned_quizzes WHERE quiz_id = ? AND class_id = ?",
            [&quiz_id, &class_id],
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    }

    for student in &eligible {
        let assignment_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO assigned_quizzes(
                id, quiz_id, class_id, student_id, student_doc_id, student_name,
                student_no, quiz_title, class_name, subject, quiz_mode, quiz_code,
                due_date, settings, status, completed, attempts, session_status,
                assigned_at, assigned_by)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)",
            params![
                assignment_id,
                quiz_id,
                class_id,
                student.auth_uid.as_deref().unwrap_or_default(),
                student.doc_id,
                student.name,
                student.student_no,
                quiz.title,
                class.name,
                class.subject,
                mode.as_str(),
                quiz_code,
                due_date,
                settings_json,
                initial_status,
                session_status,
                now,
                teacher_id
            ],
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let result = json!({
        "assigned": eligible.len(),
        "skipped": skipped.len(),
        "skippedStudents": skipped.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        "reassigned": !existing.is_empty(),
        "quizMode": mode.as_str(),
        "quizCode": quiz_code,
        "dueDate": due_date,
    });
    Ok(AssignOutcome {
        result,
        removed_assignment_ids: existing,
    })
}

fn delete_inner(state: &AppState, req: &Request) -> Result<AssignOutcome, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    load_owned_quiz(conn, &quiz_id, &teacher_id)?;

    let existing = existing_set_ids(conn, &quiz_id, &class_id)?;
    if existing.is_empty() {
        return Err(HandlerErr::not_found("no assignment exists for this quiz and class"));
    }
    conn.execute(
        "DELETE FROM assigned_quizzes WHERE quiz_id = ? AND class_id = ?",
        [&quiz_id, &class_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    Ok(AssignOutcome {
        result: json!({ "deleted": existing.len() }),
        removed_assignment_ids: existing,
    })
}

fn set_session_status(
    state: &AppState,
    req: &Request,
    status: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let class_id = get_required_str(&req.params, "classId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    load_owned_quiz(conn, &quiz_id, &teacher_id)?;

    let mode: Option<String> = conn
        .query_row(
            "SELECT quiz_mode FROM assigned_quizzes WHERE quiz_id = ? AND class_id = ? LIMIT 1",
            [&quiz_id, &class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match mode.as_deref() {
        None => return Err(HandlerErr::not_found("no assignment exists for this quiz and class")),
        Some("synchronous") => {}
        Some(_) => {
            return Err(HandlerErr::new(
                "validation_failed",
                "live session control only applies to synchronous assignments",
            ))
        }
    }

    let now = now_rfc3339();
    let updated = match status {
        "active" => conn.execute(
            "UPDATE assigned_quizzes
             SET session_status = 'active', session_started_at = ?, session_ended_at = NULL
             WHERE quiz_id = ? AND class_id = ?",
            params![now, quiz_id, class_id],
        ),
        "ended" => conn.execute(
            "UPDATE assigned_quizzes
             SET session_status = 'ended', session_ended_at = ?
             WHERE quiz_id = ? AND class_id = ?",
            params![now, quiz_id, class_id],
        ),
        _ => conn.execute(
            "UPDATE assigned_quizzes
             SET session_status = 'not_started', session_started_at = NULL,
                 session_ended_at = NULL
             WHERE quiz_id = ? AND class_id = ?",
            params![quiz_id, class_id],
        ),
    }
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    Ok(json!({ "sessionStatus": status, "updated": updated }))
}

fn list_for_class_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let class_id = get_required_str(&req.params, "classId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, quiz_id, student_id, student_doc_id, student_name, quiz_title,
                    quiz_mode, quiz_code, due_date, status, completed, attempts,
                    raw_score_percentage, base50_score_percentage, session_status, assigned_at
             FROM assigned_quizzes
             WHERE class_id = ?
             ORDER BY assigned_at DESC, student_name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let assignments = stmt
        .query_map([&class_id], assignment_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "assignments": assignments }))
}

fn list_for_student_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let student_id = get_required_str(&req.params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, quiz_id, student_id, student_doc_id, student_name, quiz_title,
                    quiz_mode, quiz_code, due_date, status, completed, attempts,
                    raw_score_percentage, base50_score_percentage, session_status, assigned_at
             FROM assigned_quizzes
             WHERE student_id = ?
             ORDER BY assigned_at DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let assignments = stmt
        .query_map([&student_id], assignment_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "assignments": assignments }))
}

fn assignment_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let quiz_id: String = r.get(1)?;
    let student_id: String = r.get(2)?;
    let student_doc_id: Option<String> = r.get(3)?;
    let student_name: Option<String> = r.get(4)?;
    let quiz_title: String = r.get(5)?;
    let quiz_mode: String = r.get(6)?;
    let quiz_code: Option<String> = r.get(7)?;
    let due_date: Option<String> = r.get(8)?;
    let status: String = r.get(9)?;
    let completed: i64 = r.get(10)?;
    let attempts: i64 = r.get(11)?;
    let raw: Option<i64> = r.get(12)?;
    let base50: Option<i64> = r.get(13)?;
    let session_status: Option<String> = r.get(14)?;
    let assigned_at: String = r.get(15)?;
    Ok(json!({
        "id": id,
        "quizId": quiz_id,
        "studentId": student_id,
        "studentDocId": student_doc_id,
        "studentName": student_name,
        "quizTitle": quiz_title,
        "quizMode": quiz_mode,
        "quizCode": quiz_code,
        "dueDate": due_date,
        "status": status,
        "completed": completed != 0,
        "attempts": attempts,
        "rawScorePercentage": raw,
        "base50ScorePercentage": base50,
        "sessionStatus": session_status,
        "assignedAt": assigned_at,
    }))
}

fn cleanup_removed(state: &mut AppState, removed: &[String]) {
    for assignment_id in removed {
        state.sessions.remove(assignment_id);
        if let Some(store) = state.checkpoints.as_mut() {
            store.delete(assignment_id);
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.assign" | "assignments.reassign" => {
            let replace = req.method == "assignments.reassign";
            Some(match assign_inner(state, req, replace) {
                Ok(outcome) => {
                    cleanup_removed(state, &outcome.removed_assignment_ids);
                    state.changes.record(Topic::Assignments);
                    ok(&req.id, outcome.result)
                }
                Err(e) => e.response(&req.id),
            })
        }
        "assignments.delete" => Some(match delete_inner(state, req) {
            Ok(outcome) => {
                cleanup_removed(state, &outcome.removed_assignment_ids);
                state.changes.record(Topic::Assignments);
                ok(&req.id, outcome.result)
            }
            Err(e) => e.response(&req.id),
        }),
        "assignments.session.start" => Some(match set_session_status(state, req, "active") {
            Ok(result) => {
                state.changes.record(Topic::Assignments);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "assignments.session.end" => Some(match set_session_status(state, req, "ended") {
            Ok(result) => {
                state.changes.record(Topic::Assignments);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "assignments.session.reset" => Some(match set_session_status(state, req, "not_started") {
            Ok(result) => {
                state.changes.record(Topic::Assignments);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "assignments.listForClass" => Some(match list_for_class_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "assignments.listForStudent" => Some(match list_for_student_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
