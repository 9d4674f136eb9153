use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::compose;
use crate::ipc::error::ok;
use crate::ipc::handlers::assignments::AssignmentSettings;
use crate::ipc::helpers::{get_required_str, parse_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::Topic;
use crate::quiz::{self, QuestionKind};
use crate::scoring;
use crate::session::{QuizMode, QuizSession, SubmitGate};

struct AssignmentRow {
    quiz_id: String,
    class_id: String,
    student_id: String,
    quiz_mode: String,
    due_date: Option<String>,
    settings: AssignmentSettings,
    completed: bool,
    attempts: u32,
    session_status: Option<String>,
    started_at: Option<String>,
    current_answers: Option<String>,
    current_question_index: Option<i64>,
    quiz_title: String,
    class_name: String,
}

fn load_assignment(conn: &Connection, assignment_id: &str) -> Result<AssignmentRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT quiz_id, class_id, student_id, quiz_mode, due_date, settings, completed,
                    attempts, session_status, started_at, current_answers,
                    current_question_index, quiz_title, class_name
             FROM assigned_quizzes WHERE id = ?",
            [assignment_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, i64>(6)?,
                    r.get::<_, i64>(7)?,
                    r.get::<_, Option<String>>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, Option<String>>(10)?,
                    r.get::<_, Option<i64>>(11)?,
                    r.get::<_, String>(12)?,
                    r.get::<_, String>(13)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let Some((
        quiz_id,
        class_id,
        student_id,
        quiz_mode,
        due_date,
        settings,
        completed,
        attempts,
        session_status,
        started_at,
        current_answers,
        current_question_index,
        quiz_title,
        class_name,
    )) = row
    else {
        return Err(HandlerErr::not_found("assignment not found"));
    };

    let settings: AssignmentSettings = serde_json::from_str(&settings)
        .map_err(|e| HandlerErr::new("bad_record", format!("assignment settings unreadable: {}", e)))?;

    Ok(AssignmentRow {
        quiz_id,
        class_id,
        student_id,
        quiz_mode,
        due_date,
        settings,
        completed: completed != 0,
        attempts: attempts.max(0) as u32,
        session_status,
        started_at,
        current_answers,
        current_question_index,
        quiz_title,
        class_name,
    })
}

/// The question bank survives quiz archival on the archive row, so an
/// in-flight assignment keeps working after its quiz is archived.
fn load_question_bank(conn: &Connection, quiz_id: &str) -> Result<Vec<quiz::Question>, HandlerErr> {
    let questions: Option<String> = conn
        .query_row("SELECT questions FROM quizzes WHERE id = ?", [quiz_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let questions = match questions {
        Some(q) => q,
        None => conn
            .query_row(
                "SELECT questions FROM archived_quizzes WHERE id = ?",
                [quiz_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
            .ok_or_else(|| HandlerErr::not_found("quiz not found"))?,
    };
    let bank = quiz::parse_bank(&serde_json::from_str(&questions).unwrap_or(json!([])))
        .map_err(|e| HandlerErr::new("bad_record", format!("quiz questions unreadable: {}", e)))?;
    if bank.is_empty() {
        return Err(HandlerErr::new("bad_record", "quiz has no questions"));
    }
    Ok(bank)
}

fn parse_answer_map(raw: &str) -> HashMap<usize, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Delivered questions with grading fields stripped; the daemon grades, the
/// UI only renders.
fn delivered_questions_json(session: &QuizSession) -> serde_json::Value {
    let items: Vec<serde_json::Value> = session
        .questions
        .iter()
        .enumerate()
        .map(|(i, q)| {
            let mut item = json!({
                "index": i,
                "type": match q.kind {
                    QuestionKind::MultipleChoice => "multiple_choice",
                    QuestionKind::TrueFalse => "true_false",
                    QuestionKind::Identification => "identification",
                },
                "question": q.question,
                "points": q.points,
            });
            if q.kind == QuestionKind::MultipleChoice {
                item["choices"] =
                    json!(q.choices.iter().map(|c| c.text.clone()).collect::<Vec<_>>());
            }
            if let Some(options) = session.identification_options.get(&i) {
                item["options"] = json!(options);
            }
            item
        })
        .collect();
    json!(items)
}

fn persist_progress(
    conn: &Connection,
    checkpoints: &mut Option<Box<dyn CheckpointStore>>,
    session: &QuizSession,
    now: DateTime<Utc>,
) -> Result<(), HandlerErr> {
    match session.mode {
        QuizMode::Asynchronous => {
            if let Some(store) = checkpoints.as_mut() {
                store
                    .put(&session.assignment_id, &session.checkpoint(now))
                    .map_err(|e| HandlerErr::db("checkpoint_write_failed", e))?;
            }
            Ok(())
        }
        QuizMode::Synchronous => {
            let answers = serde_json::to_string(&session.answers)
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            conn.execute(
                "UPDATE assigned_quizzes
                 SET current_answers = ?, current_question_index = ?
                 WHERE id = ?",
                params![answers, session.current_question_index as i64, session.assignment_id],
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            Ok(())
        }
    }
}

struct SubmitOutcome {
    result: serde_json::Value,
    already_submitted: bool,
}

/// The one write path out of an attempt. Assignment update and submission
/// insert commit together; the checkpoint is only dropped after the commit,
/// so a failed submit retries losslessly.
fn do_submit(
    conn: &Connection,
    checkpoints: &mut Option<Box<dyn CheckpointStore>>,
    session: &mut QuizSession,
    now: DateTime<Utc>,
) -> Result<SubmitOutcome, HandlerErr> {
    match session.begin_submit() {
        SubmitGate::AlreadyDone(summary) => {
            return Ok(SubmitOutcome {
                result: json!({ "result": summary }),
                already_submitted: true,
            });
        }
        SubmitGate::InFlight => {
            return Err(HandlerErr::new(
                "submit_in_flight",
                "a submission is already being processed",
            ));
        }
        SubmitGate::Proceed => {}
    }

    let summary = session.score();
    let row = match load_assignment(conn, &session.assignment_id) {
        Ok(row) => row,
        Err(e) => {
            session.fail_submit();
            return Err(e);
        }
    };

    let written = (|| -> Result<(), HandlerErr> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
        tx.execute(
            "UPDATE assigned_quizzes
             SET status = 'completed', completed = 1,
                 raw_score_percentage = ?, base50_score_percentage = ?,
                 correct_points = ?, total_points = ?,
                 attempts = attempts + 1, submitted_at = ?,
                 current_answers = NULL, current_question_index = NULL
             WHERE id = ?",
            params![
                summary.raw_score_percentage,
                summary.base50_score_percentage,
                summary.correct_points,
                summary.total_points,
                now.to_rfc3339(),
                session.assignment_id
            ],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

        let answers = serde_json::to_string(&session.answers)
            .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        let student_no: Option<String> = tx
            .query_row(
                "SELECT student_no FROM assigned_quizzes WHERE id = ?",
                [&session.assignment_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
            .flatten();
        tx.execute(
            "INSERT INTO quiz_submissions(
                id, assignment_id, quiz_id, quiz_title, student_id, student_no,
                class_id, class_name, quiz_mode, answers,
                raw_score_percentage, base50_score_percentage, correct_points,
                total_points, total_questions, submitted_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                session.assignment_id,
                row.quiz_id,
                row.quiz_title,
                session.student_id,
                student_no,
                row.class_id,
                row.class_name,
                session.mode.as_str(),
                answers,
                summary.raw_score_percentage,
                summary.base50_score_percentage,
                summary.correct_points,
                summary.total_points,
                summary.total_questions as i64,
                now.to_rfc3339()
            ],
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))
    })();

    if let Err(mut e) = written {
        // Keep the checkpoint; reopen the attempt for a lossless retry.
        session.fail_submit();
        e.details = Some(json!({ "retryable": true }));
        return Err(e);
    }

    session.complete(summary);
    if let Some(store) = checkpoints.as_mut() {
        store.delete(&session.assignment_id);
    }

    let mut result = json!({
        "result": summary,
        "passingScore": row.settings.passing_score,
        "showResults": row.settings.show_results,
    });
    if row.settings.allow_review {
        result["questionResults"] =
            json!(scoring::question_results(&session.questions, &session.answers));
    }

    Ok(SubmitOutcome {
        result,
        already_submitted: false,
    })
}

fn load_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let mode_param = get_required_str(&req.params, "mode")?;
    let entry_mode = QuizMode::parse(&mode_param)
        .ok_or_else(|| HandlerErr::bad_params("mode must be asynchronous or synchronous"))?;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let now = Utc::now();

    let row = load_assignment(conn, &assignment_id)?;
    if row.student_id != student_id {
        return Err(HandlerErr::permission("this quiz is not assigned to you"));
    }
    let mode = QuizMode::parse(&row.quiz_mode)
        .ok_or_else(|| HandlerErr::new("bad_record", "assignment has an unknown mode"))?;
    if mode != entry_mode {
        let message = match mode {
            QuizMode::Synchronous => "this quiz is not available for self-paced completion",
            QuizMode::Asynchronous => "this is not a live quiz",
        };
        return Err(HandlerErr::new("wrong_mode", message));
    }

    match mode {
        QuizMode::Asynchronous => {
            if row.completed && row.attempts >= row.settings.max_attempts {
                return Err(HandlerErr::new(
                    "already_completed",
                    "you have already completed this quiz",
                ));
            }
            if let Some(due) = row.due_date.as_deref().and_then(parse_rfc3339) {
                if now > due {
                    return Err(HandlerErr::new("past_due", "this quiz is past its due date"));
                }
            }
        }
        QuizMode::Synchronous => {
            if row.completed {
                return Err(HandlerErr::new(
                    "already_completed",
                    "you have already completed this quiz",
                ));
            }
            match row.session_status.as_deref() {
                Some("active") => {}
                Some("ended") => {
                    return Err(HandlerErr::new("session_ended", "the live session has ended"))
                }
                _ => {
                    return Err(HandlerErr::new(
                        "session_not_started",
                        "the teacher has not started this quiz yet",
                    ))
                }
            }
        }
    }

    let bank = load_question_bank(conn, &row.quiz_id)?;
    let composition = compose::compose(
        &bank,
        compose::ComposeSettings {
            shuffle_questions: row.settings.shuffle_questions,
            shuffle_choices: row.settings.shuffle_choices,
        },
        compose::attempt_seed(&assignment_id, row.attempts),
    );

    // A fresh attempt (first entry, or a retake after completion) stamps its
    // own epoch; re-entry keeps the stored one so reloading never resets the
    // clock.
    let fresh_attempt = row.started_at.is_none() || row.completed;
    let started_at = if fresh_attempt {
        conn.execute(
            "UPDATE assigned_quizzes
             SET status = 'in_progress', completed = 0, started_at = ?,
                 current_answers = NULL, current_question_index = NULL
             WHERE id = ?",
            params![now.to_rfc3339(), assignment_id],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        state.changes.record(Topic::Assignments);
        now
    } else {
        row.started_at
            .as_deref()
            .and_then(parse_rfc3339)
            .unwrap_or(now)
    };

    let mut session = QuizSession::new(
        assignment_id.clone(),
        student_id,
        mode,
        composition.questions,
        composition.identification_options,
        row.settings.time_limit.map(|m| i64::from(m) * 60),
        started_at,
    );

    if !fresh_attempt {
        let saved = match mode {
            QuizMode::Asynchronous => state
                .checkpoints
                .as_ref()
                .and_then(|store| store.get(&assignment_id)),
            QuizMode::Synchronous => row.current_answers.as_deref().map(|raw| Checkpoint {
                answers: parse_answer_map(raw),
                current_question_index: row.current_question_index.unwrap_or(0).max(0) as usize,
                timestamp: 0,
            }),
        };
        if let Some(checkpoint) = saved {
            session.restore(checkpoint);
        }
    }

    let allowances: Option<Vec<u32>> = match mode {
        QuizMode::Synchronous => Some(
            session
                .questions
                .iter()
                .map(compose::question_time_allowance)
                .collect(),
        ),
        QuizMode::Asynchronous => None,
    };

    let mut result = json!({
        "assignmentId": assignment_id,
        "quizTitle": row.quiz_title,
        "className": row.class_name,
        "quizMode": mode.as_str(),
        "questions": delivered_questions_json(&session),
        "totalQuestions": session.questions.len(),
        "totalPoints": session.questions.iter().map(|q| q.points).sum::<u32>(),
        "answers": session.answers,
        "currentQuestionIndex": session.current_question_index,
        "timeLimitSeconds": session.time_limit_secs,
        "remainingSeconds": session.remaining_seconds(now),
        "settings": {
            "shuffleQuestions": row.settings.shuffle_questions,
            "shuffleChoices": row.settings.shuffle_choices,
            "showResults": row.settings.show_results,
            "allowReview": row.settings.allow_review,
            "showCorrectAnswers": row.settings.show_correct_answers,
            "passingScore": row.settings.passing_score,
            "maxAttempts": row.settings.max_attempts,
        },
    });
    if let Some(allowances) = allowances {
        result["questionTimeAllowances"] = json!(allowances);
    }

    state.sessions.insert(assignment_id, session);
    Ok(result)
}

/// Shared entry for answer/navigate/tick/submit: the session must exist and
/// belong to the caller.
fn session_for<'a>(
    sessions: &'a mut HashMap<String, QuizSession>,
    assignment_id: &str,
    student_id: &str,
) -> Result<&'a mut QuizSession, HandlerErr> {
    let session = sessions
        .get_mut(assignment_id)
        .ok_or_else(|| HandlerErr::new("no_session", "no active session; load the quiz first"))?;
    if session.student_id != student_id {
        return Err(HandlerErr::permission("this quiz is not assigned to you"));
    }
    Ok(session)
}

/// Reads the teacher-controlled live status; `ended` forces submission on
/// the learner's next interaction.
fn live_session_ended(conn: &Connection, assignment_id: &str) -> Result<bool, HandlerErr> {
    let status: Option<Option<String>> = conn
        .query_row(
            "SELECT session_status FROM assigned_quizzes WHERE id = ?",
            [assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(matches!(status, Some(Some(ref s)) if s == "ended"))
}

fn answer_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let index = req
        .params
        .get("questionIndex")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing questionIndex"))? as usize;
    let answer = get_required_str(&req.params, "answer")?;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let now = Utc::now();
    let session = session_for(&mut state.sessions, &assignment_id, &student_id)?;

    if session.is_expired(now) {
        session.mark_expired();
        let outcome = do_submit(conn, &mut state.checkpoints, session, now)?;
        state.changes.record(Topic::Assignments);
        state.changes.record(Topic::Submissions);
        return Err(HandlerErr::with_details(
            "time_expired",
            "time is up; the attempt was submitted automatically",
            outcome.result,
        ));
    }

    session
        .record_answer(index, answer)
        .map_err(|e| match e {
            crate::session::SessionError::QuestionOutOfRange { .. } => {
                HandlerErr::bad_params(e.to_string())
            }
            crate::session::SessionError::NotAnswering { .. } => {
                HandlerErr::new("not_answering", e.to_string())
            }
        })?;
    persist_progress(conn, &mut state.checkpoints, session, now)?;

    Ok(json!({
        "saved": true,
        "answeredCount": session.questions.len() - session.unanswered_count(),
        "remainingSeconds": session.remaining_seconds(now),
    }))
}

fn navigate_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let index = req
        .params
        .get("questionIndex")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing questionIndex"))? as usize;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let now = Utc::now();
    let session = session_for(&mut state.sessions, &assignment_id, &student_id)?;

    session.navigate(index).map_err(|e| match e {
        crate::session::SessionError::QuestionOutOfRange { .. } => {
            HandlerErr::bad_params(e.to_string())
        }
        crate::session::SessionError::NotAnswering { .. } => {
            HandlerErr::new("not_answering", e.to_string())
        }
    })?;
    persist_progress(conn, &mut state.checkpoints, session, now)?;

    Ok(json!({ "currentQuestionIndex": session.current_question_index }))
}

fn tick_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let now = Utc::now();
    let session = session_for(&mut state.sessions, &assignment_id, &student_id)?;

    if let Some(summary) = session.result() {
        return Ok(json!({
            "phase": session.phase().as_str(),
            "result": summary,
        }));
    }

    let ended = session.mode == QuizMode::Synchronous && live_session_ended(conn, &assignment_id)?;
    if session.is_expired(now) || ended {
        session.mark_expired();
        let outcome = do_submit(conn, &mut state.checkpoints, session, now)?;
        state.changes.record(Topic::Assignments);
        state.changes.record(Topic::Submissions);
        let mut result = outcome.result;
        result["expired"] = json!(true);
        result["autoSubmitted"] = json!(!outcome.already_submitted);
        return Ok(result);
    }

    Ok(json!({
        "phase": session.phase().as_str(),
        "expired": false,
        "remainingSeconds": session.remaining_seconds(now),
        "answeredCount": session.questions.len() - session.unanswered_count(),
    }))
}

fn submit_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;

    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let now = Utc::now();
    let session = session_for(&mut state.sessions, &assignment_id, &student_id)?;

    let expired = session.is_expired(now)
        || (session.mode == QuizMode::Synchronous && live_session_ended(conn, &assignment_id)?);
    if expired {
        session.mark_expired();
    } else if session.result().is_none() {
        // Manual submit requires a full answer sheet; expiry does not.
        let unanswered = session.unanswered_count();
        if unanswered > 0 {
            return Err(HandlerErr::with_details(
                "missing_answers",
                format!(
                    "please answer all questions before submitting; {} unanswered",
                    unanswered
                ),
                json!({ "unanswered": unanswered }),
            ));
        }
    }

    let outcome = do_submit(conn, &mut state.checkpoints, session, now)?;
    if !outcome.already_submitted {
        state.changes.record(Topic::Assignments);
        state.changes.record(Topic::Submissions);
    }
    let mut result = outcome.result;
    result["alreadySubmitted"] = json!(outcome.already_submitted);
    Ok(result)
}

fn state_inner(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(&req.params, "assignmentId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let now = Utc::now();
    let session = session_for(&mut state.sessions, &assignment_id, &student_id)?;

    Ok(json!({
        "phase": session.phase().as_str(),
        "answeredCount": session.questions.len() - session.unanswered_count(),
        "totalQuestions": session.questions.len(),
        "currentQuestionIndex": session.current_question_index,
        "remainingSeconds": session.remaining_seconds(now),
        "result": session.result(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.load" => Some(match load_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "session.answer" => Some(match answer_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "session.navigate" => Some(match navigate_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "session.tick" => Some(match tick_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "session.submit" => Some(match submit_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        "session.state" => Some(match state_inner(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }),
        _ => None,
    }
}
