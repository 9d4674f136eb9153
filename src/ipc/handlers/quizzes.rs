use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_str, now_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;
use crate::quiz;

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn parse_and_validate_bank(params: &serde_json::Value) -> Result<Vec<quiz::Question>, HandlerErr> {
    let raw = params
        .get("questions")
        .ok_or_else(|| HandlerErr::bad_params("missing questions"))?;
    let bank = quiz::parse_bank(raw)
        .map_err(|e| HandlerErr::bad_params(format!("questions are malformed: {}", e)))?;
    if bank.is_empty() {
        return Err(HandlerErr::bad_params("a quiz needs at least one question"));
    }
    quiz::validate_bank(&bank).map_err(|issue| {
        HandlerErr::with_details(
            "validation_failed",
            format!("question {}: {}", issue.question_index + 1, issue.message),
            json!(issue),
        )
    })?;
    Ok(bank)
}

fn quiz_owned_by(
    conn: &Connection,
    quiz_id: &str,
    teacher_id: &str,
) -> Result<(), HandlerErr> {
    let owner: Option<String> = conn
        .query_row("SELECT owner_id FROM quizzes WHERE id = ?", [quiz_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match owner {
        None => Err(HandlerErr::not_found("quiz not found")),
        Some(o) if o != teacher_id => Err(HandlerErr::permission("quiz belongs to another teacher")),
        Some(_) => Ok(()),
    }
}

fn create_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    let title = get_required_str(&req.params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let bank = parse_and_validate_bank(&req.params)?;

    let quiz_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let total_points = quiz::total_points(&bank);
    let stats = quiz::classification_stats(&bank);
    let questions_json = serde_json::to_string(&bank)
        .map_err(|e| HandlerErr::bad_params(format!("questions are malformed: {}", e)))?;

    conn.execute(
        "INSERT INTO quizzes(id, owner_id, title, status, total_points, questions,
                             classification_stats, created_at, updated_at)
         VALUES(?, ?, ?, 'published', ?, ?, ?, ?, ?)",
        params![
            quiz_id,
            teacher_id,
            title,
            total_points,
            questions_json,
            json!(stats).to_string(),
            now,
            now
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    Ok(json!({
        "quizId": quiz_id,
        "title": title,
        "totalPoints": total_points,
        "questionCount": bank.len(),
        "classificationStats": stats,
    }))
}

fn update_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    quiz_owned_by(conn, &quiz_id, &teacher_id)?;

    let now = now_rfc3339();
    if let Some(title) = get_opt_str(&req.params, "title") {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        conn.execute(
            "UPDATE quizzes SET title = ?, updated_at = ? WHERE id = ?",
            params![title, now, quiz_id],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    // Edits never rewrite assignments already taken; submissions carry their
    // own point totals.
    if req.params.get("questions").is_some() {
        let bank = parse_and_validate_bank(&req.params)?;
        let questions_json = serde_json::to_string(&bank)
            .map_err(|e| HandlerErr::bad_params(format!("questions are malformed: {}", e)))?;
        conn.execute(
            "UPDATE quizzes
             SET questions = ?, total_points = ?, classification_stats = ?, updated_at = ?
             WHERE id = ?",
            params![
                questions_json,
                quiz::total_points(&bank),
                json!(quiz::classification_stats(&bank)).to_string(),
                now,
                quiz_id
            ],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    Ok(json!({ "quizId": quiz_id }))
}

fn get_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;

    let row = conn
        .query_row(
            "SELECT owner_id, title, status, total_points, questions, classification_stats,
                    created_at, updated_at
             FROM quizzes WHERE id = ?",
            [&quiz_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let Some((owner_id, title, status, total_points, questions, stats, created_at, updated_at)) =
        row
    else {
        return Err(HandlerErr::not_found("quiz not found"));
    };

    let questions: serde_json::Value = serde_json::from_str(&questions).unwrap_or(json!([]));
    let stats: serde_json::Value = stats
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);

    Ok(json!({
        "quiz": {
            "id": quiz_id,
            "ownerId": owner_id,
            "title": title,
            "status": status,
            "totalPoints": total_points,
            "questions": questions,
            "classificationStats": stats,
            "createdAt": created_at,
            "updatedAt": updated_at,
        }
    }))
}

fn list_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;

    // Correlated counts keep the teacher dashboard to one query.
    let mut stmt = conn
        .prepare(
            "SELECT
               q.id,
               q.title,
               q.status,
               q.total_points,
               q.questions,
               q.created_at,
               q.updated_at,
               (SELECT COUNT(DISTINCT a.class_id) FROM assigned_quizzes a WHERE a.quiz_id = q.id)
                 AS assigned_class_count
             FROM quizzes q
             WHERE q.owner_id = ?
             ORDER BY q.created_at DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let quizzes = stmt
        .query_map([&teacher_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let status: String = r.get(2)?;
            let total_points: i64 = r.get(3)?;
            let questions: String = r.get(4)?;
            let created_at: String = r.get(5)?;
            let updated_at: String = r.get(6)?;
            let assigned_class_count: i64 = r.get(7)?;
            let question_count = serde_json::from_str::<serde_json::Value>(&questions)
                .ok()
                .and_then(|v| v.as_array().map(|a| a.len()))
                .unwrap_or(0);
            Ok(json!({
                "id": id,
                "title": title,
                "status": status,
                "totalPoints": total_points,
                "questionCount": question_count,
                "assignedClassCount": assigned_class_count,
                "createdAt": created_at,
                "updatedAt": updated_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "quizzes": quizzes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quizzes.create" => Some(match create_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Quizzes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "quizzes.update" => Some(match update_inner(state, req) {
            Ok(result) => {
                state.changes.record(Topic::Quizzes);
                ok(&req.id, result)
            }
            Err(e) => e.response(&req.id),
        }),
        "quizzes.get" => Some(match get_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "quizzes.list" => Some(match list_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
