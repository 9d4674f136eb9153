use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_quizdeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn quizdeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn future_date(days: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::days(days)).to_rfc3339()
}

fn scenario_questions() -> serde_json::Value {
    json!([
        {
            "type": "multiple_choice",
            "question": "Which planet is known as the Red Planet?",
            "points": 1,
            "choices": [
                { "text": "Mars", "is_correct": true },
                { "text": "Venus", "is_correct": false },
                { "text": "Jupiter", "is_correct": false }
            ]
        },
        {
            "type": "multiple_choice",
            "question": "Which gas do plants absorb from the air?",
            "points": 1,
            "choices": [
                { "text": "Carbon dioxide", "is_correct": true },
                { "text": "Oxygen", "is_correct": false }
            ]
        },
        {
            "type": "identification",
            "question": "Name the process plants use to make food.",
            "points": 1,
            "correct_answer": "Photosynthesis"
        },
        {
            "type": "identification",
            "question": "Name the powerhouse of the cell.",
            "points": 1,
            "correct_answer": "Mitochondria"
        }
    ])
}

#[test]
fn assigned_quiz_runs_through_answering_to_a_graded_result() {
    let workspace = temp_dir("quizdesk-session-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "quizzes.create",
        json!({
            "teacherId": "teacher-1",
            "title": "Science Check",
            "questions": scenario_questions(),
        }),
    );
    let quiz_id = quiz.get("quizId").and_then(|v| v.as_str()).expect("quizId").to_string();
    assert_eq!(quiz.get("totalPoints").and_then(|v| v.as_u64()), Some(4));

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "teacherId": "teacher-1", "name": "Grade 7 - Sampaguita", "subject": "Science" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).expect("classId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "classId": class_id.clone(),
            "name": "Reyes, Ana",
            "email": "ana@example.edu",
            "authUid": "stud-1",
        }),
    );

    let assign = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.assign",
        json!({
            "quizId": quiz_id.clone(),
            "classId": class_id.clone(),
            "teacherId": "teacher-1",
            "dueDate": future_date(7),
            "settings": {
                "mode": "asynchronous",
                "timeLimit": 10,
                "shuffleQuestions": true,
                "shuffleChoices": true,
                "maxAttempts": 1
            }
        }),
    );
    assert_eq!(assign.get("assigned").and_then(|v| v.as_u64()), Some(1));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.listForStudent",
        json!({ "studentId": "stud-1" }),
    );
    let assignment = listing
        .get("assignments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("one assignment");
    let assignment_id = assignment
        .get("id")
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();
    assert_eq!(assignment.get("status").and_then(|v| v.as_str()), Some("pending"));

    let loaded = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "session.load",
        json!({
            "assignmentId": assignment_id.clone(),
            "studentId": "stud-1",
            "mode": "asynchronous",
        }),
    );
    assert_eq!(loaded.get("totalQuestions").and_then(|v| v.as_u64()), Some(4));
    let remaining = loaded
        .get("remainingSeconds")
        .and_then(|v| v.as_i64())
        .expect("countdown running");
    assert!(remaining > 0 && remaining <= 600);

    let questions = loaded
        .get("questions")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("questions");
    // Grading data never leaves the daemon.
    for q in &questions {
        assert!(q.get("correct_answer").is_none());
        if let Some(choices) = q.get("choices").and_then(|v| v.as_array()) {
            assert!(choices.iter().all(|c| c.is_string()));
        }
    }
    // Bucket order survives shuffling.
    let kinds: Vec<&str> = questions
        .iter()
        .map(|q| q.get("type").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["multiple_choice", "multiple_choice", "identification", "identification"]
    );
    // Identification questions share the deduplicated option pool.
    for q in &questions {
        if q.get("type").and_then(|v| v.as_str()) == Some("identification") {
            let mut options: Vec<&str> = q
                .get("options")
                .and_then(|v| v.as_array())
                .expect("options")
                .iter()
                .map(|o| o.as_str().unwrap())
                .collect();
            options.sort_unstable();
            assert_eq!(options, vec!["Mitochondria", "Photosynthesis"]);
        }
    }

    // Submit with nothing answered is rejected, naming the count.
    let premature = request(
        &mut stdin,
        &mut reader,
        "8",
        "session.submit",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-1" }),
    );
    assert_eq!(premature.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        premature
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("missing_answers")
    );
    assert_eq!(
        premature
            .get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("unanswered"))
            .and_then(|v| v.as_u64()),
        Some(4)
    );

    // Answer 3 correctly and 1 incorrectly, whatever the delivered order.
    for (i, q) in questions.iter().enumerate() {
        let text = q.get("question").and_then(|v| v.as_str()).unwrap();
        let answer = if text.contains("Red Planet") {
            "Mars"
        } else if text.contains("gas do plants") {
            "Carbon dioxide"
        } else if text.contains("make food") {
            "Photosynthesis"
        } else {
            "Photosynthesis" // wrong on purpose: the answer is Mitochondria
        };
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("answer-{}", i),
            "session.answer",
            json!({
                "assignmentId": assignment_id.clone(),
                "studentId": "stud-1",
                "questionIndex": i,
                "answer": answer,
            }),
        );
    }

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "session.submit",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-1" }),
    );
    let result = submitted.get("result").cloned().expect("score summary");
    assert_eq!(result.get("correctPoints").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(result.get("totalPoints").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(result.get("rawScorePercentage").and_then(|v| v.as_u64()), Some(75));
    // round(50 + 75/2) rounds half up.
    assert_eq!(result.get("base50ScorePercentage").and_then(|v| v.as_u64()), Some(88));

    // The assignment record carries the grade and the attempt.
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assignments.listForStudent",
        json!({ "studentId": "stud-1" }),
    );
    let row = after
        .get("assignments")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("assignment row");
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("completed"));
    assert_eq!(row.get("completed").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(row.get("attempts").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(row.get("rawScorePercentage").and_then(|v| v.as_u64()), Some(75));
    assert_eq!(row.get("base50ScorePercentage").and_then(|v| v.as_u64()), Some(88));

    // Exactly one immutable submission record.
    let submissions = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.submissions",
        json!({ "assignmentId": assignment_id.clone() }),
    );
    let rows = submissions
        .get("submissions")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("submissions");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("rawScorePercentage").and_then(|v| v.as_u64()),
        Some(75)
    );

    // maxAttempts=1: the quiz cannot be taken again.
    let reload = request(
        &mut stdin,
        &mut reader,
        "12",
        "session.load",
        json!({
            "assignmentId": assignment_id,
            "studentId": "stud-1",
            "mode": "asynchronous",
        }),
    );
    assert_eq!(
        reload
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("already_completed")
    );
}
