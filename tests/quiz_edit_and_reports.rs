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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn editing_a_quiz_never_rewrites_taken_attempts_and_reports_see_the_snapshot() {
    let workspace = temp_dir("quizdesk-quiz-edit");
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
            "title": "Tooling Basics",
            "questions": [
                {
                    "type": "identification",
                    "question": "Name the Rust package manager.",
                    "points": 1,
                    "correct_answer": "Cargo"
                },
                {
                    "type": "identification",
                    "question": "Name the optimized build profile.",
                    "points": 1,
                    "correct_answer": "release"
                }
            ],
        }),
    );
    let quiz_id = quiz["quizId"].as_str().unwrap().to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "teacherId": "teacher-1", "name": "Grade 10 - Banaba" }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "classId": class_id.clone(),
            "name": "Velasco, Rio",
            "email": "rio@example.edu",
            "authUid": "stud-r",
        }),
    );

    let due = (chrono::Utc::now() + chrono::Duration::days(3)).to_rfc3339();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.assign",
        json!({
            "quizId": quiz_id.clone(),
            "classId": class_id.clone(),
            "teacherId": "teacher-1",
            "dueDate": due,
            "settings": { "mode": "asynchronous" }
        }),
    );
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.listForStudent",
        json!({ "studentId": "stud-r" }),
    );
    let assignment_id = listing["assignments"][0]["id"].as_str().unwrap().to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "session.load",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-r", "mode": "asynchronous" }),
    );
    for (i, answer) in [(0, "cargo"), (1, "  Release ")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "session.answer",
            json!({
                "assignmentId": assignment_id.clone(),
                "studentId": "stud-r",
                "questionIndex": i,
                "answer": answer,
            }),
        );
    }

    let mid = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "session.state",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-r" }),
    );
    assert_eq!(mid["phase"].as_str(), Some("answering"));
    assert_eq!(mid["answeredCount"].as_u64(), Some(2));
    assert_eq!(mid["totalQuestions"].as_u64(), Some(2));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "session.submit",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-r" }),
    );
    assert_eq!(submitted["result"]["rawScorePercentage"].as_u64(), Some(100));

    // Rewrite the bank after the attempt: different questions, more points.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "quizzes.update",
        json!({
            "quizId": quiz_id.clone(),
            "teacherId": "teacher-1",
            "title": "Tooling Basics v2",
            "questions": [
                {
                    "type": "multiple_choice",
                    "question": "Which command builds the project?",
                    "points": 5,
                    "choices": [
                        { "text": "cargo build", "is_correct": true },
                        { "text": "cargo erase", "is_correct": false }
                    ]
                }
            ],
        }),
    );
    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "quizzes.get",
        json!({ "quizId": quiz_id.clone() }),
    );
    assert_eq!(edited["quiz"]["title"].as_str(), Some("Tooling Basics v2"));
    assert_eq!(edited["quiz"]["totalPoints"].as_u64(), Some(5));

    // The taken attempt keeps its own snapshot of the totals and score.
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "assignments.listForStudent",
        json!({ "studentId": "stud-r" }),
    );
    let row = after["assignments"][0].clone();
    assert_eq!(row["rawScorePercentage"].as_u64(), Some(100));
    assert_eq!(row["attempts"].as_u64(), Some(1));

    let submissions = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reports.submissions",
        json!({ "quizId": quiz_id.clone() }),
    );
    let rows = submissions["submissions"].as_array().cloned().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["totalPoints"].as_u64(), Some(2));
    assert_eq!(rows[0]["totalQuestions"].as_u64(), Some(2));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "reports.quizSummary",
        json!({ "quizId": quiz_id, "classId": class_id }),
    );
    assert_eq!(summary["submissionCount"].as_u64(), Some(1));
    assert_eq!(summary["averageRawScorePercentage"].as_f64(), Some(100.0));
    assert_eq!(summary["highestRawScorePercentage"].as_u64(), Some(100));
    assert_eq!(summary["lowestRawScorePercentage"].as_u64(), Some(100));
}
