use rusqlite::{params_from_iter, Connection};
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Submission audit trail, filterable by any of the natural keys. At least
/// one filter is required; a full-table dump is never useful to the UI.
fn submissions_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    for (key, clause) in [
        ("assignmentId", "assignment_id = ?"),
        ("quizId", "quiz_id = ?"),
        ("classId", "class_id = ?"),
        ("studentId", "student_id = ?"),
    ] {
        if let Some(value) = get_opt_str(&req.params, key) {
            clauses.push(clause);
            args.push(value);
        }
    }
    if clauses.is_empty() {
        return Err(HandlerErr::bad_params(
            "provide at least one of assignmentId, quizId, classId, studentId",
        ));
    }

    let sql = format!(
        "SELECT id, assignment_id, quiz_id, quiz_title, student_id, student_no,
                class_id, class_name, quiz_mode, answers, raw_score_percentage,
                base50_score_percentage, correct_points, total_points,
                total_questions, submitted_at
         FROM quiz_submissions
         WHERE {}
         ORDER BY submitted_at DESC",
        clauses.join(" AND ")
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let submissions = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            let id: String = r.get(0)?;
            let assignment_id: String = r.get(1)?;
            let quiz_id: String = r.get(2)?;
            let quiz_title: String = r.get(3)?;
            let student_id: String = r.get(4)?;
            let student_no: Option<String> = r.get(5)?;
            let class_id: Option<String> = r.get(6)?;
            let class_name: Option<String> = r.get(7)?;
            let quiz_mode: String = r.get(8)?;
            let answers: String = r.get(9)?;
            let raw: i64 = r.get(10)?;
            let base50: i64 = r.get(11)?;
            let correct_points: i64 = r.get(12)?;
            let total_points: i64 = r.get(13)?;
            let total_questions: i64 = r.get(14)?;
            let submitted_at: String = r.get(15)?;
            let answers: serde_json::Value = serde_json::from_str(&answers).unwrap_or(json!({}));
            Ok(json!({
                "id": id,
                "assignmentId": assignment_id,
                "quizId": quiz_id,
                "quizTitle": quiz_title,
                "studentId": student_id,
                "studentNo": student_no,
                "classId": class_id,
                "className": class_name,
                "quizMode": quiz_mode,
                "answers": answers,
                "rawScorePercentage": raw,
                "base50ScorePercentage": base50,
                "correctPoints": correct_points,
                "totalPoints": total_points,
                "totalQuestions": total_questions,
                "submittedAt": submitted_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "submissions": submissions }))
}

fn quiz_summary_inner(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let quiz_id = get_required_str(&req.params, "quizId")?;
    let class_id = get_opt_str(&req.params, "classId");

    let (sql, args) = match class_id.clone() {
        Some(class_id) => (
            "SELECT COUNT(*), AVG(raw_score_percentage), AVG(base50_score_percentage),
                    MAX(raw_score_percentage), MIN(raw_score_percentage)
             FROM quiz_submissions WHERE quiz_id = ? AND class_id = ?",
            vec![quiz_id.clone(), class_id],
        ),
        None => (
            "SELECT COUNT(*), AVG(raw_score_percentage), AVG(base50_score_percentage),
                    MAX(raw_score_percentage), MIN(raw_score_percentage)
             FROM quiz_submissions WHERE quiz_id = ?",
            vec![quiz_id.clone()],
        ),
    };

    let (count, avg_raw, avg_base50, highest, lowest) = conn
        .query_row(sql, params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<i64>>(3)?,
                r.get::<_, Option<i64>>(4)?,
            ))
        })
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "quizId": quiz_id,
        "classId": class_id,
        "submissionCount": count,
        "averageRawScorePercentage": avg_raw,
        "averageBase50ScorePercentage": avg_base50,
        "highestRawScorePercentage": highest,
        "lowestRawScorePercentage": lowest,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.submissions" => Some(match submissions_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "reports.quizSummary" => Some(match quiz_summary_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
