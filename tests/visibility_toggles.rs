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
    let exe = env!("CARGO_BIN_EXE_gradesyncd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesyncd");
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

fn grades_for(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    user_id: &str,
    include_hidden: bool,
) -> Vec<serde_json::Value> {
    request_ok(
        stdin,
        reader,
        id,
        "grades.list",
        json!({ "userId": user_id, "includeHidden": include_hidden }),
    )
    .get("grades")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default()
}

/// Builds a two-student section, connects both students, and returns the
/// section id. stu-1 lands on 91.0, stu-2 on 66.0.
fn seed_two_students(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "s2",
        "sections.create",
        json!({
            "name": "Sampaguita",
            "gradeLevel": 7,
            "ownerId": "teacher-1",
            "subjects": [{
                "id": "math",
                "name": "Mathematics",
                "weights": { "writtenWork": 30.0, "performanceTask": 50.0, "quarterlyExam": 20.0 },
                "assessments": [
                    { "id": "ww-1", "name": "Quiz 1", "category": "writtenWork", "quarter": 1, "maxPoints": 10.0 },
                    { "id": "pt-1", "name": "Project", "category": "performanceTask", "quarter": 1, "maxPoints": 50.0 },
                    { "id": "qe-1", "name": "Exam", "category": "quarterlyExam", "quarter": 1, "maxPoints": 20.0 }
                ]
            }],
            "students": [
                { "id": "stu-1", "name": "Reyes, Juan" },
                { "id": "stu-2", "name": "Santos, Maria" }
            ]
        }),
    );
    let section_id = created
        .get("sectionId")
        .and_then(|v| v.as_str())
        .expect("sectionId")
        .to_string();

    for (i, (student, user)) in [("stu-1", "user-1"), ("stu-2", "user-2")].iter().enumerate() {
        request_ok(
            stdin,
            reader,
            &format!("c{}", i),
            "connections.connect",
            json!({
                "sectionId": section_id,
                "studentId": student,
                "userId": user,
                "connectedBy": "teacher-1"
            }),
        );
    }

    let scores = [
        ("stu-1", "ww-1", 8.0),
        ("stu-1", "pt-1", 45.0),
        ("stu-1", "qe-1", 18.0),
        ("stu-2", "ww-1", 9.0),
    ];
    for (i, (student, assessment, score)) in scores.iter().enumerate() {
        request_ok(
            stdin,
            reader,
            &format!("u{}", i),
            "sections.updateScore",
            json!({
                "sectionId": section_id,
                "studentId": student,
                "subjectId": "math",
                "assessmentId": assessment,
                "score": score
            }),
        );
    }
    section_id
}

#[test]
fn bulk_hide_reports_and_filters_per_view() {
    let workspace = temp_dir("gradesync-visibility");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let section_id = seed_two_students(&mut stdin, &mut reader, &workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.setHiddenAll",
        json!({ "sectionId": section_id, "hidden": true }),
    );
    assert_eq!(report.get("updated").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        report
            .get("failed")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // Default view filters hidden records out; the unfiltered view keeps
    // the scores byte-for-byte.
    assert!(grades_for(&mut stdin, &mut reader, "2", "user-1", false).is_empty());
    let hidden_view = grades_for(&mut stdin, &mut reader, "3", "user-1", true);
    assert_eq!(hidden_view.len(), 1);
    assert_eq!(hidden_view[0].get("score").and_then(|v| v.as_f64()), Some(91.0));
    assert_eq!(hidden_view[0].get("hidden").and_then(|v| v.as_bool()), Some(true));

    let other = grades_for(&mut stdin, &mut reader, "4", "user-2", true);
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].get("score").and_then(|v| v.as_f64()), Some(66.0));

    // Per-student unhide only touches that student's records.
    let single = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.setHidden",
        json!({ "sectionId": section_id, "studentId": "stu-1", "hidden": false }),
    );
    assert_eq!(single.get("updated").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(grades_for(&mut stdin, &mut reader, "6", "user-1", false).len(), 1);
    assert!(grades_for(&mut stdin, &mut reader, "7", "user-2", false).is_empty());
}

#[test]
fn hidden_flag_survives_a_resync() {
    let workspace = temp_dir("gradesync-hidden-resync");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let section_id = seed_two_students(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.setHidden",
        json!({ "sectionId": section_id, "studentId": "stu-1", "hidden": true }),
    );

    // Score edit triggers a full recompute for stu-1; hidden must carry over.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sections.updateScore",
        json!({
            "sectionId": section_id,
            "studentId": "stu-1",
            "subjectId": "math",
            "assessmentId": "ww-1",
            "score": 10.0
        }),
    );

    let grades = grades_for(&mut stdin, &mut reader, "3", "user-1", true);
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].get("hidden").and_then(|v| v.as_bool()), Some(true));
    // 100*0.3 + 90*0.5 + 90*0.2 = 93 -> 95 bracket.
    assert_eq!(grades[0].get("score").and_then(|v| v.as_f64()), Some(95.0));
    assert!(grades_for(&mut stdin, &mut reader, "4", "user-1", false).is_empty());
}

#[test]
fn toggle_for_unconnected_student_is_not_found() {
    let workspace = temp_dir("gradesync-visibility-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let section_id = seed_two_students(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.setHidden",
        json!({ "sectionId": section_id, "studentId": "stu-9", "hidden": true }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );
}
