use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const BLOG: &str = r#"datasource db {
    provider = "postgresql"
    url = env("DATABASE_URL")
}

model User {
    id    String @id @default(uuid())
    email String @unique
    posts Post[]
    @@allow('read', true)
}

model Post {
    id       String @id @default(cuid())
    author   User   @relation(fields: [authorId], references: [id])
    authorId String
    @@allow('all', author == auth())
    @@deny('delete', true)
}
"#;

fn zmodel_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_zmodel"))
}

fn run(args: &[&str]) -> Output {
    Command::new(zmodel_bin())
        .args(args)
        .output()
        .expect("run zmodel")
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).expect("write fixture");
    path
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn validate_accepts_a_clean_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "blog.zmodel", BLOG);
    let output = run(&["check", "validate", path_arg(&file)]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stdout));
    assert!(String::from_utf8_lossy(&output.stderr).contains("validated 1 document(s)"));
}

#[test]
fn validate_walks_directories_and_reports_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "good.zmodel", BLOG);
    fs::create_dir(dir.path().join("nested")).expect("mkdir");
    write(&dir.path().join("nested"), "bad.zmodel", "model M {\n    x Int\n}\n");
    write(dir.path(), "notes.txt", "model ignored {");

    let output = run(&["check", "validate", "--json", path_arg(dir.path())]);
    assert_eq!(output.status.code(), Some(1));
    let reports: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("json report");
    let reports = reports.as_array().expect("array");
    assert_eq!(reports.len(), 2);

    let bad = reports
        .iter()
        .find(|r| r["file"].as_str().is_some_and(|f| f.ends_with("bad.zmodel")))
        .expect("bad report");
    let first = &bad["diagnostics"][0];
    assert_eq!(first["severity"], "error");
    assert_eq!(first["kind"], "structural");
    assert_eq!(first["line"], 1);
}

#[test]
fn validate_reports_parse_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "broken.zmodel", "model {");
    let output = run(&["check", "validate", path_arg(&file)]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("error[parse]"));
}

#[test]
fn require_datasource_flag_is_honoured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "m.zmodel", "model M {\n    id Int @id\n}\n");
    assert!(run(&["check", "validate", path_arg(&file)]).status.success());
    let strict = run(&["check", "validate", "--require-datasource", path_arg(&file)]);
    assert_eq!(strict.status.code(), Some(1));
}

#[test]
fn fmt_writes_canonical_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "m.zmodel", "model   M {\n id   Int  @id\n}");
    let out = dir.path().join("out.zmodel");
    let output = run(&["check", "fmt", path_arg(&file), "--out", path_arg(&out)]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let formatted = fs::read_to_string(&out).expect("read output");
    assert!(formatted.starts_with("model M {\n"));

    let again = run(&["check", "fmt", path_arg(&out)]);
    assert_eq!(String::from_utf8_lossy(&again.stdout), formatted);
}

#[test]
fn fmt_refuses_to_drop_comments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "m.zmodel", "// keep me\nmodel M {\n id Int @id\n}\n");
    let output = run(&["check", "fmt", "--write", path_arg(&file)]);
    assert!(!output.status.success());
    assert!(fs::read_to_string(&file).expect("read").contains("keep me"));

    let forced = run(&["check", "fmt", "--write", "--strip-comments", path_arg(&file)]);
    assert!(forced.status.success());
    assert!(!fs::read_to_string(&file).expect("read").contains("keep me"));
}

#[test]
fn policy_emits_a_bundle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "blog.zmodel", BLOG);
    let output = run(&["policy", path_arg(&file)]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let bundle: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let post_rules = bundle["models"]["Post"]["rules"].as_array().expect("rules");
    assert_eq!(post_rules.len(), 2);
    assert_eq!(post_rules[1]["kind"], "deny");
}

#[test]
fn policy_refuses_invalid_documents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = write(dir.path(), "bad.zmodel", "model M {\n    x Int\n}\n");
    let output = run(&["policy", path_arg(&file)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Model must have at least one unique criteria"));
}
