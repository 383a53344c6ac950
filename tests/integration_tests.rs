//! Integration tests for the slimline binary.
//!
//! Every test runs against a throwaway HOME so session discovery sees only
//! the fixture transcript it writes.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn slimline(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("slimline").unwrap();
    cmd.env("HOME", home);
    cmd.env_remove("SLIMLINE_SESSION_ID");
    cmd
}

fn project_dir(home: &Path) -> PathBuf {
    let dir = home.join(".claude").join("projects").join("-work-proj");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_session(home: &Path, session_id: &str, records: &[Value]) -> PathBuf {
    let path = project_dir(home).join(format!("{session_id}.jsonl"));
    let lines: Vec<String> = records.iter().map(Value::to_string).collect();
    fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn read_lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn user(i: usize, text: &str) -> Value {
    json!({
        "type": "user",
        "uuid": format!("u{i}"),
        "parentUuid": if i == 0 { Value::Null } else { Value::from(format!("u{}", i - 1)) },
        "message": {"role": "user", "content": text},
    })
}

fn tick(i: usize) -> Value {
    json!({
        "type": "progress",
        "uuid": format!("u{i}"),
        "parentUuid": format!("u{}", i.saturating_sub(1)),
        "message": {"content": [{"type": "text", "text": format!("working on it ({i})")}]},
    })
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_and_version_work() {
        let home = TempDir::new().unwrap();
        slimline(home.path()).arg("--help").assert().success();
        slimline(home.path()).arg("--version").assert().success();
    }

    #[test]
    fn formulary_lists_all_strategies() {
        let home = TempDir::new().unwrap();
        slimline(home.path())
            .arg("formulary")
            .assert()
            .success()
            .stdout(predicate::str::contains("progress-collapse"))
            .stdout(predicate::str::contains("envelope-strip"))
            .stdout(predicate::str::contains("aggressive"));
    }

    #[test]
    fn unknown_prescription_exits_2() {
        let home = TempDir::new().unwrap();
        write_session(home.path(), "abc-123", &[user(0, "hello")]);
        slimline(home.path())
            .args(["treat", "abc-123", "--rx", "homeopathic"])
            .assert()
            .code(2);
    }

    #[test]
    fn unknown_strategy_exits_2() {
        let home = TempDir::new().unwrap();
        write_session(home.path(), "abc-123", &[user(0, "hello")]);
        slimline(home.path())
            .args(["strategy", "liposuction", "abc-123"])
            .assert()
            .code(2);
    }

    #[test]
    fn missing_session_exits_3() {
        let home = TempDir::new().unwrap();
        project_dir(home.path());
        slimline(home.path())
            .args(["diagnose", "no-such-session"])
            .assert()
            .code(3);
    }

    #[test]
    fn single_dash_rx_is_accepted() {
        let home = TempDir::new().unwrap();
        write_session(home.path(), "abc-123", &[user(0, "hello")]);
        slimline(home.path())
            .args(["treat", "abc-123", "-rx", "gentle"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gentle"));
    }

    #[test]
    fn list_shows_the_session() {
        let home = TempDir::new().unwrap();
        write_session(home.path(), "abc-123", &[user(0, "hello")]);
        slimline(home.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("abc-123"))
            .stdout(predicate::str::contains("1 sessions"));
    }

    #[test]
    fn session_resolves_by_unique_prefix() {
        let home = TempDir::new().unwrap();
        write_session(home.path(), "abcd-1234-5678", &[user(0, "hello")]);
        slimline(home.path())
            .args(["diagnose", "abcd"])
            .assert()
            .success()
            .stdout(predicate::str::contains("abcd-1234-5678"));
    }
}

mod treatment {
    use super::*;

    #[test]
    fn dry_run_is_the_default_and_touches_nothing() {
        let home = TempDir::new().unwrap();
        let records: Vec<Value> = (0..5).map(tick).collect();
        let path = write_session(home.path(), "dry-1", &records);
        let before = fs::read(&path).unwrap();

        slimline(home.path())
            .args(["treat", "dry-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("DRY RUN"));

        assert_eq!(fs::read(&path).unwrap(), before, "dry run must not modify the file");
        let backups: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".bak"))
            .collect();
        assert!(backups.is_empty(), "dry run must not create a backup");
    }

    #[test]
    fn execute_creates_a_byte_identical_backup() {
        let home = TempDir::new().unwrap();
        let mut records = vec![user(0, "start")];
        records.extend((1..20).map(tick));
        let path = write_session(home.path(), "exec-1", &records);
        let before = fs::read(&path).unwrap();

        slimline(home.path())
            .args(["treat", "exec-1", "--execute"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Backup:"));

        let backup = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .find(|e| e.file_name().to_string_lossy().ends_with(".jsonl.bak"))
            .expect("backup created");
        assert_eq!(fs::read(backup.path()).unwrap(), before);
        assert!(fs::read(&path).unwrap().len() < before.len());
    }

    #[test]
    fn second_execute_is_a_no_op() {
        let home = TempDir::new().unwrap();
        let mut records = vec![user(0, "start")];
        records.extend((1..30).map(tick));
        records.push(user(30, "end"));
        let path = write_session(home.path(), "idem-1", &records);

        slimline(home.path())
            .args(["treat", "idem-1", "-rx", "aggressive", "--execute"])
            .assert()
            .success();
        let after_first = fs::read(&path).unwrap();

        slimline(home.path())
            .args(["treat", "idem-1", "-rx", "aggressive", "--execute"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Saved:  0B"));
        assert_eq!(fs::read(&path).unwrap(), after_first);
    }

    #[test]
    fn metadata_strip_leaves_no_telemetry_behind() {
        let home = TempDir::new().unwrap();
        let records = vec![
            json!({
                "type": "assistant",
                "uuid": "u0",
                "parentUuid": null,
                "costUSD": 0.12,
                "durationMs": 900,
                "message": {
                    "role": "assistant",
                    "usage": {"input_tokens": 10, "output_tokens": 2},
                    "stop_reason": "end_turn",
                    "content": [{"type": "text", "text": "hello"}],
                },
            }),
            user(1, "thanks"),
        ];
        let path = write_session(home.path(), "meta-1", &records);

        slimline(home.path())
            .args(["strategy", "metadata-strip", "meta-1", "--execute"])
            .assert()
            .success();

        for value in read_lines(&path) {
            assert!(value.get("costUSD").is_none());
            assert!(value.get("durationMs").is_none());
            if let Some(message) = value.get("message") {
                assert!(message.get("usage").is_none());
                assert!(message.get("stop_reason").is_none());
            }
        }
    }
}

mod scenarios {
    use super::*;

    /// 10,000 records, 6,000 of them one contiguous progress run: gentle
    /// leaves 4,001 records and one synthetic tick carrying the run count
    /// and the first tick's identifiers.
    #[test]
    fn contiguous_progress_run_collapses_to_one() {
        let home = TempDir::new().unwrap();
        let mut records: Vec<Value> = (0..2000).map(|i| user(i, "chatter")).collect();
        records.extend((2000..8000).map(tick));
        records.extend((8000..10000).map(|i| user(i, "more chatter")));
        let path = write_session(home.path(), "prog-1", &records);

        slimline(home.path())
            .args(["treat", "prog-1", "-rx", "gentle", "--execute"])
            .assert()
            .success();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4001);
        let synthetic = lines
            .iter()
            .find(|v| v.get("collapsedCount").is_some())
            .expect("one synthetic tick record");
        assert_eq!(synthetic["collapsedCount"], 6000);
        assert_eq!(synthetic["uuid"], "u2000");
        assert_eq!(synthetic["parentUuid"], "u1999");
    }

    /// 50 snapshots alternating between two payloads: the last copy of
    /// each payload survives.
    #[test]
    fn alternating_snapshots_dedup_to_two() {
        let home = TempDir::new().unwrap();
        let records: Vec<Value> = (0..50)
            .map(|i| {
                json!({
                    "type": "file-history-snapshot",
                    "uuid": format!("u{i}"),
                    "messageId": format!("m{i}"),
                    "snapshot": {"files": if i % 2 == 0 { "payload-A" } else { "payload-B" }},
                })
            })
            .collect();
        let path = write_session(home.path(), "snap-1", &records);

        slimline(home.path())
            .args(["treat", "snap-1", "-rx", "gentle", "--execute"])
            .assert()
            .success();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["uuid"], "u48");
        assert_eq!(lines[1]["uuid"], "u49");
    }

    /// A 200KB document block repeated three times: the first copy stays
    /// untouched, the repeats become stubs, roughly 600KB goes away.
    #[test]
    fn repeated_documents_are_stubbed() {
        let home = TempDir::new().unwrap();
        let body = "D".repeat(200 * 1024);
        let doc = |i: usize| {
            json!({
                "type": "user",
                "uuid": format!("u{i}"),
                "parentUuid": if i == 0 { Value::Null } else { Value::from(format!("u{}", i - 1)) },
                "message": {"role": "user", "content": [
                    {"type": "document", "title": "manual",
                     "source": {"type": "text", "media_type": "text/plain", "data": body}},
                ]},
            })
        };
        let records = vec![doc(0), user(1, "interlude"), doc(2), doc(3), doc(4)];
        let path = write_session(home.path(), "doc-1", &records);
        let before = fs::metadata(&path).unwrap().len();
        let first_line_before = fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();

        slimline(home.path())
            .args(["treat", "doc-1", "-rx", "aggressive", "--execute"])
            .assert()
            .success();

        let after = fs::metadata(&path).unwrap().len();
        assert!(before - after > 550 * 1024, "expected ~600KB saved, got {}", before - after);

        let first_line_after = fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();
        assert_eq!(first_line_before, first_line_after, "first copy byte-identical");
        let lines = read_lines(&path);
        for line in &lines[2..] {
            let text = line["message"]["content"][0]["text"].as_str().unwrap();
            assert!(text.contains("identical to record 0"));
        }
    }

    /// Read at 10, edit at 12, read again at 20: the first read's result
    /// is dropped, the later one survives.
    #[test]
    fn stale_read_is_dropped() {
        let home = TempDir::new().unwrap();
        let read_call = |i: usize, id: &str| {
            json!({
                "type": "assistant",
                "uuid": format!("u{i}"),
                "parentUuid": format!("u{}", i - 1),
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "name": "Read", "id": id, "input": {"file_path": "/x/y.py"}}
                ]},
            })
        };
        let read_result = |i: usize, id: &str| {
            json!({
                "type": "user",
                "uuid": format!("u{i}"),
                "parentUuid": format!("u{}", i - 1),
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": id, "content": "the whole file body"}
                ]},
            })
        };
        let edit_call = |i: usize| {
            json!({
                "type": "assistant",
                "uuid": format!("u{i}"),
                "parentUuid": format!("u{}", i - 1),
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "name": "Edit", "id": format!("e{i}"),
                     "input": {"file_path": "/x/y.py", "old_string": "a", "new_string": "b"}}
                ]},
            })
        };

        let mut records: Vec<Value> = (0..10).map(|i| user(i, "setup")).collect();
        records.push(read_call(10, "r1"));
        records.push(read_result(11, "r1"));
        records.push(edit_call(12));
        records.extend((13..20).map(|i| user(i, "between")));
        records.push(read_call(20, "r2"));
        records.push(read_result(21, "r2"));
        let path = write_session(home.path(), "stale-1", &records);

        slimline(home.path())
            .args(["treat", "stale-1", "-rx", "standard", "--execute"])
            .assert()
            .success();

        let lines = read_lines(&path);
        let uuids: Vec<&str> = lines.iter().filter_map(|v| v["uuid"].as_str()).collect();
        assert!(!uuids.contains(&"u11"), "stale read result dropped");
        assert!(uuids.contains(&"u21"), "fresh read result kept");
        assert!(uuids.contains(&"u10"), "the read call itself survives");
    }

    #[test]
    fn diagnose_reports_bloat_and_projections() {
        let home = TempDir::new().unwrap();
        let mut records = vec![user(0, "start")];
        records.extend((1..40).map(tick));
        write_session(home.path(), "diag-1", &records);

        slimline(home.path())
            .args(["diagnose", "diag-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Progress ticks"))
            .stdout(predicate::str::contains("Heaviest records"))
            .stdout(predicate::str::contains("Estimated savings by prescription"))
            .stdout(predicate::str::contains("gentle"))
            .stdout(predicate::str::contains("aggressive"));
    }

    #[test]
    fn checkpoint_writes_team_state_from_env_selected_session() {
        let home = TempDir::new().unwrap();
        let records = vec![
            user(0, "kick off"),
            json!({
                "type": "assistant",
                "uuid": "u1",
                "parentUuid": "u0",
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "name": "Task", "id": "t1",
                     "input": {"description": "map the repo", "subagent_type": "scout", "prompt": "go"}}
                ]},
            }),
        ];
        let path = write_session(home.path(), "team-1", &records);

        slimline(home.path())
            .env("SLIMLINE_SESSION_ID", "team-1")
            .arg("checkpoint")
            .assert()
            .success()
            .stdout(predicate::str::contains("1 subagents"));

        let checkpoint = path.parent().unwrap().join("team-checkpoint.md");
        let content = fs::read_to_string(checkpoint).unwrap();
        assert!(content.contains("map the repo"));
        assert!(content.contains("scout"));
    }
}
