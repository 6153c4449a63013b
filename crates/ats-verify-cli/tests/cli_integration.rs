use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ats<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ats"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ats binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ats(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ats command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

fn new_ulid() -> String {
    ulid::Ulid::new().to_string()
}

// Test IDs: TCLI-001
#[test]
fn db_migrate_and_schema_version_report_contract() {
    let dir = unique_temp_dir("ats-cli-db");
    let db = dir.join("ats.sqlite3");

    let plan = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&plan, "contract_version"), "cli.v1");
    assert_eq!(plan["would_apply_versions"], serde_json::json!([1, 2]));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(applied["up_to_date"], true);

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);
    assert_eq!(status["up_to_date"], true);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], true);

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn parcels_ingest_lookup_mark_used_and_list() {
    let dir = unique_temp_dir("ats-cli-parcels");
    let db = dir.join("ats.sqlite3");
    let marketplaces = repo_root().join("config/marketplaces.json");
    let csv = write_file(
        &dir,
        "parcels.csv",
        "\u{feff}marketplace;country;brand;product_name;track_number;serial_ref;date\r\n\
         ;KZ;Acme;Kettle;T1;S1;2026-01-05\r\n\
         ;KZ;Acme;Toaster;T1;S2;05.01.2026\r\n\
         ;KZ;;Toaster;T2;S3;\r\n",
    );
    let uploader = new_ulid();

    let result = run_json([
        "--db",
        path_str(&db),
        "--marketplaces",
        path_str(&marketplaces),
        "parcels",
        "ingest",
        "--file",
        path_str(&csv),
        "--uploader",
        &uploader,
        "--marketplace-prefix",
        "kaspi",
    ]);
    assert_eq!(as_i64(&result, "total_processed"), 3);
    assert_eq!(as_i64(&result, "inserted"), 1);
    assert_eq!(as_i64(&result, "updated"), 1);
    assert_eq!(result["errors"][0]["line"], 4);
    assert_eq!(result["errors"][0]["track_number"], "T2");

    let lookup = run_json(["--db", path_str(&db), "parcels", "lookup", "--track", "T1", "--track", "T2"]);
    assert_eq!(as_i64(&lookup, "found"), 1);
    assert_eq!(as_i64(&lookup, "missing"), 1);
    assert_eq!(lookup["results"][0]["found"], true);
    assert_eq!(lookup["results"][0]["unit"]["marketplace"], "Kaspi");
    assert_eq!(lookup["results"][0]["unit"]["product_name"], "Toaster");
    assert_eq!(lookup["results"][1]["found"], false);

    let marked = run_json(["--db", path_str(&db), "parcels", "mark-used", "--track", "T1"]);
    assert_eq!(as_str(&marked, "outcome"), "marked");
    let again = run_json(["--db", path_str(&db), "parcels", "mark-used", "--track", "T1"]);
    assert_eq!(as_str(&again, "outcome"), "already_used");

    let listed = run_json(["--db", path_str(&db), "parcels", "list", "--status", "used"]);
    assert_eq!(as_i64(&listed, "total"), 1);

    let rerun = run_json([
        "--db",
        path_str(&db),
        "parcels",
        "ingest",
        "--file",
        path_str(&csv),
        "--uploader",
        &uploader,
        "--marketplace-prefix",
        "kaspi",
    ]);
    assert_eq!(as_i64(&rerun, "skipped"), 2);
    assert_eq!(rerun["errors"][0]["kind"], "skipped_used");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn mark_used_unknown_track_fails() {
    let dir = unique_temp_dir("ats-cli-missing");
    let db = dir.join("ats.sqlite3");
    let output = run_ats(["--db", path_str(&db), "parcels", "mark-used", "--track", "ghost"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn risk_load_and_analytics() {
    let dir = unique_temp_dir("ats-cli-risk");
    let db = dir.join("ats.sqlite3");
    let csv = write_file(
        &dir,
        "risk.csv",
        "date,application_id,iin,document,user,org,status,reject,reason\n\
         2026-01-01,A1,111,D1,u,o,NEW,,\n\
         2026-01-02,A2,111,D1,u,o,REJECTED,1,\"photo, blurred\"\n\
         2026-01-03,A3,222,D1,u,o,NEW,,\n\
         2026-01-04,A4,333,D2,u,o,NEW,,\n\
         2026-01-05,A5,0,D2,u,o,NEW,,\n",
    );

    let loaded = run_json(["--db", path_str(&db), "risk", "load", "--file", path_str(&csv), "--chunk-rows", "2"]);
    assert_eq!(as_i64(&loaded, "rows_persisted"), 4);
    assert_eq!(as_i64(&loaded, "rows_rejected"), 1);

    let reports = run_json(["--db", path_str(&db), "risk", "analytics"]);
    assert_eq!(reports["document_reuse"][0]["document_ref"], "D1");
    assert_eq!(reports["document_reuse"][0]["count"], 3);
    assert_eq!(reports["document_identity_reuse"][0]["count"], 2);
    assert_eq!(reports["identity_frequency"][0]["identity_key"], "111");
    assert_eq!(reports["flip_flop_status"][0]["statuses"], "NEW -> REJECTED");
    assert_eq!(reports["failures"], serde_json::json!([]));

    let empty = write_file(&dir, "empty.csv", "date,app,iin,doc,user,org,status,reject,reason\n2026-01-01,A,0,D,u,o,NEW,,\n");
    let output = run_ats(["--db", path_str(&db), "risk", "load", "--file", path_str(&empty)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no valid data rows"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn risk_profile_set_list_delete() {
    let dir = unique_temp_dir("ats-cli-profiles");
    let db = dir.join("ats.sqlite3");
    let analyst = new_ulid();

    let profile = run_json([
        "--db",
        path_str(&db),
        "risk",
        "profile",
        "set",
        "--identity-key",
        "990101300123",
        "--level",
        "red",
        "--flagged-by",
        &analyst,
        "--reason",
        "document reuse",
    ]);
    assert_eq!(as_str(&profile, "risk_level"), "red");
    let id = as_str(&profile, "id").to_string();

    let listed = run_json(["--db", path_str(&db), "risk", "profile", "list"]);
    assert_eq!(listed["profiles"].as_array().map(Vec::len), Some(1));

    let deleted = run_json(["--db", path_str(&db), "risk", "profile", "delete", "--id", &id]);
    assert_eq!(deleted["deleted"], true);

    let output = run_ats(["--db", path_str(&db), "risk", "profile", "delete", "--id", &id]);
    assert!(!output.status.success());

    let _ = fs::remove_dir_all(&dir);
}
