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
fn class_archive_then_restore_round_trips_the_roster() {
    let workspace = temp_dir("quizdesk-class-archive");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({
            "teacherId": "teacher-1",
            "name": "Grade 7 - Rosal",
            "code": "G7-ROS",
            "classNo": "703",
            "subject": "Mathematics",
        }),
    );
    let class_id = class["classId"].as_str().unwrap().to_string();

    let kept = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "classId": class_id.clone(),
            "name": "Reyes, Ana",
            "email": "ana3@example.edu",
            "studentNo": "2023-0001",
            "authUid": "acct-ana",
        }),
    );
    let kept_id = kept["studentId"].as_str().unwrap().to_string();
    let dropped = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "classId": class_id.clone(),
            "name": "Gone, Gary",
            "email": "gary@example.edu",
            "studentNo": "2023-0002",
        }),
    );
    let dropped_id = dropped["studentId"].as_str().unwrap().to_string();

    let archived = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.archive",
        json!({ "classId": class_id.clone(), "teacherId": "teacher-1" }),
    );
    assert_eq!(archived["studentCount"].as_u64(), Some(2));

    // Active record gone, membership cleared, snapshot kept.
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.list",
        json!({ "teacherId": "teacher-1" }),
    );
    assert_eq!(classes["classes"].as_array().map(|a| a.len()), Some(0));
    let members = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "classId": class_id.clone() }),
    );
    assert_eq!(members["students"].as_array().map(|a| a.len()), Some(0));
    let archived_list = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "archivedClasses.list",
        json!({ "teacherId": "teacher-1" }),
    );
    let entry = archived_list["archivedClasses"][0].clone();
    assert_eq!(entry["id"].as_str(), Some(class_id.as_str()));
    assert_eq!(entry["studentCount"].as_u64(), Some(2));

    // One snapshot learner disappears from the store before the restore.
    {
        let conn = rusqlite::Connection::open(workspace.join("quizdesk.sqlite3"))
            .expect("open workspace db");
        conn.execute("DELETE FROM users WHERE id = ?", [&dropped_id])
            .expect("drop learner row");
    }

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.restore",
        json!({ "classId": class_id.clone(), "teacherId": "teacher-1" }),
    );
    assert_eq!(restored["reEnrolled"].as_u64(), Some(1));
    assert_eq!(restored["missingStudents"][0].as_str(), Some("Gone, Gary"));

    // The class record matches the pre-archive one, archive-only fields
    // stripped, and the surviving learner is back on the roster.
    let back = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "classes.get",
        json!({ "classId": class_id.clone() }),
    );
    assert_eq!(back["class"]["name"].as_str(), Some("Grade 7 - Rosal"));
    assert_eq!(back["class"]["code"].as_str(), Some("G7-ROS"));
    assert_eq!(back["class"]["classNo"].as_str(), Some("703"));
    assert_eq!(back["class"]["subject"].as_str(), Some("Mathematics"));
    assert_eq!(back["class"]["status"].as_str(), Some("active"));
    assert!(back["class"].get("archivedAt").is_none());

    let members = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "classId": class_id }),
    );
    let roster = members["students"].as_array().cloned().unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0]["id"].as_str(), Some(kept_id.as_str()));

    let archived_after = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "archivedClasses.list",
        json!({ "teacherId": "teacher-1" }),
    );
    assert_eq!(
        archived_after["archivedClasses"].as_array().map(|a| a.len()),
        Some(0)
    );
}
