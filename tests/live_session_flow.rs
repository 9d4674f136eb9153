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

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn live_quiz_waits_for_the_teacher_and_auto_submits_when_ended() {
    let workspace = temp_dir("quizdesk-live-session");
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
            "title": "Live Drill",
            "questions": [
                {
                    "type": "multiple_choice",
                    "question": "Which planet is known as the Red Planet?",
                    "points": 1,
                    "bloom_classification": "LOTS",
                    "choices": [
                        { "text": "Mars", "is_correct": true },
                        { "text": "Venus", "is_correct": false }
                    ]
                },
                {
                    "type": "identification",
                    "question": "Name the process plants use to make food.",
                    "points": 1,
                    "bloom_classification": "HOTS",
                    "correct_answer": "Photosynthesis"
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
        json!({ "teacherId": "teacher-1", "name": "Grade 8 - Mabini" }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "classId": class_id.clone(),
            "name": "Lopez, Mia",
            "email": "mia@example.edu",
            "authUid": "stud-7",
        }),
    );

    let deadline = (chrono::Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.assign",
        json!({
            "quizId": quiz_id.clone(),
            "classId": class_id.clone(),
            "teacherId": "teacher-1",
            "settings": { "mode": "synchronous", "deadline": deadline }
        }),
    );
    assert!(assigned["quizCode"].as_str().is_some());

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.listForStudent",
        json!({ "studentId": "stud-7" }),
    );
    let assignment_id = listing["assignments"][0]["id"].as_str().unwrap().to_string();

    // Learners wait for the teacher.
    let waiting = request(
        &mut stdin,
        &mut reader,
        "7",
        "session.load",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-7", "mode": "synchronous" }),
    );
    assert_eq!(error_code(&waiting), Some("session_not_started"));

    // The self-paced entry point is the wrong door for a live quiz.
    let wrong_door = request(
        &mut stdin,
        &mut reader,
        "8",
        "session.load",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-7", "mode": "asynchronous" }),
    );
    assert_eq!(error_code(&wrong_door), Some("wrong_mode"));

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assignments.session.start",
        json!({ "quizId": quiz_id.clone(), "classId": class_id.clone(), "teacherId": "teacher-1" }),
    );
    assert_eq!(started["updated"].as_u64(), Some(1));

    let loaded = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "session.load",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-7", "mode": "synchronous" }),
    );
    let allowances = loaded["questionTimeAllowances"].as_array().cloned().unwrap();
    assert_eq!(allowances.len(), 2);
    for a in &allowances {
        let secs = a.as_u64().unwrap();
        assert!((12..=120).contains(&secs), "allowance out of range: {}", secs);
    }

    // One of two answered when the teacher pulls the plug.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "session.answer",
        json!({
            "assignmentId": assignment_id.clone(),
            "studentId": "stud-7",
            "questionIndex": 0,
            "answer": "Mars",
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "assignments.session.end",
        json!({ "quizId": quiz_id.clone(), "classId": class_id, "teacherId": "teacher-1" }),
    );

    // The next tick force-submits with whatever answers are held.
    let ticked = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "session.tick",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-7" }),
    );
    assert_eq!(ticked["expired"].as_bool(), Some(true));
    assert_eq!(ticked["autoSubmitted"].as_bool(), Some(true));
    assert_eq!(ticked["result"]["rawScorePercentage"].as_u64(), Some(50));
    assert_eq!(ticked["result"]["base50ScorePercentage"].as_u64(), Some(75));

    // A later tick reports the completed attempt without submitting again.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "session.tick",
        json!({ "assignmentId": assignment_id.clone(), "studentId": "stud-7" }),
    );
    assert_eq!(again["phase"].as_str(), Some("completed"));

    let submissions = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "reports.submissions",
        json!({ "quizId": quiz_id }),
    );
    let rows = submissions["submissions"].as_array().cloned().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["quizMode"].as_str(), Some("synchronous"));
}
