use anyhow::{anyhow, Result};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vbridge_core::Attachments;
use vbridge_marks::MarkType;
use vbridge_reports::ReportEvent;
use vbridge_runner::{
    config_path, config_template, error_code, events_from_value, find_project_root, load_config,
    Bridge, StateDir, StateLock, CONFIG_DIR,
};

#[derive(Parser)]
#[command(name = "vbridge", version = "0.3.0", about = "Verification report bridge")]
struct Cli {
    /// Project root holding `.vbridge/`; found from the current directory by default.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MarkTypeArg {
    #[value(name = "safe")]
    Safe,
    #[value(name = "unsafe")]
    Unsafe,
    #[value(name = "unknown")]
    Unknown,
}

impl From<MarkTypeArg> for MarkType {
    fn from(value: MarkTypeArg) -> Self {
        match value {
            MarkTypeArg::Safe => MarkType::Safe,
            MarkTypeArg::Unsafe => MarkType::Unsafe,
            MarkTypeArg::Unknown => MarkType::Unknown,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Init {
        #[arg(long)]
        force: bool,
    },
    Decide {
        job: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    Ingest {
        job: String,
        events: PathBuf,
        #[arg(long)]
        files: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    ValidateEvents {
        events: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Finish {
        job: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    Fail {
        job: String,
        #[arg(long)]
        problem: String,
        #[arg(long)]
        report: Option<String>,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        job: String,
        #[arg(long)]
        json: bool,
    },
    Status {
        job: String,
        #[arg(long)]
        json: bool,
    },
    ImportMarks {
        paths: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    EditMark {
        id: String,
        #[arg(long, value_enum)]
        mark_type: MarkTypeArg,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    DeleteMark {
        id: String,
        #[arg(long)]
        json: bool,
    },
    Summary {
        job: String,
        #[arg(long)]
        report: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Verdict {
        job: String,
        report: String,
        #[arg(long)]
        json: bool,
    },
    Confirm {
        job: String,
        mark: String,
        report: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    Unconfirm {
        job: String,
        mark: String,
        report: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        json: bool,
    },
    Serve {
        #[arg(long, default_value = "127.0.0.1:8765")]
        addr: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => find_project_root(&std::env::current_dir()?),
    };
    init_tracing(&root);
    let json_mode = command_json_mode(&cli.command);
    match run_command(&root, cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(&error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// `RUST_LOG` wins over the config `log.filter`. Logs go to stderr so that
/// `--json` output stays parseable.
fn init_tracing(root: &Path) {
    let configured = load_config(root)
        .map(|c| c.log.filter)
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_bridge(root: &Path) -> Result<(Bridge, StateLock)> {
    let config = load_config(root)?;
    let lock = StateDir::new(config.storage.state_dir.clone()).lock()?;
    let bridge = Bridge::open(&config)?;
    Ok((bridge, lock))
}

fn run_command(root: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { force } => {
            let path = config_path(root);
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            fs::create_dir_all(root.join(CONFIG_DIR))?;
            fs::write(&path, config_template())?;
            let shown = path.strip_prefix(root).unwrap_or(&path).display();
            println!("wrote: {}", shown);
            println!("next: edit {} and fill in all fields marked REQUIRED", shown);
        }
        Commands::Decide { job, user, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let status = bridge.start_decision(&user, &job)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "decide",
                    "job": job,
                    "status": status,
                })));
            }
            println!("job: {}", job);
            println!("status: {}", status);
        }
        Commands::Ingest {
            job,
            events,
            files,
            user,
            json,
        } => {
            let mut attachments = Attachments::new();
            if let Some(dir) = &files {
                add_dir_attachments(dir, &mut attachments)?;
            }
            let batch = read_event_lines(&events, &mut attachments)?;
            let (bridge, _lock) = open_bridge(root)?;
            let report = bridge.apply_batch(&user, &job, batch, &attachments)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.is_clean(),
                    "command": "ingest",
                    "batch": report,
                })));
            }
            println!("job: {}", report.job);
            println!("applied: {}", report.applied);
            println!("new_leaves: {}", report.new_leaves);
            println!("associations_created: {}", report.associations.created);
            for failure in &report.failures {
                println!("failed[{}]: {}", failure.index, failure.message);
            }
            if let Some(aborted) = &report.aborted {
                println!("aborted[{}]: {}", aborted.index, aborted.message);
            }
            println!("status: {}", report.status);
        }
        Commands::ValidateEvents { events, json } => {
            let mut attachments = Attachments::new();
            let batch = read_event_lines(&events, &mut attachments)?;
            let schema = vbridge_schemas::compile_schema("report_event_v1.jsonschema")?;
            let mut invalid = 0usize;
            for (index, event) in batch.iter().enumerate() {
                let checked = vbridge_schemas::validate_value(&schema, event).and_then(|_| {
                    ReportEvent::from_value(event.clone())
                        .map(|_| ())
                        .map_err(anyhow::Error::from)
                });
                if let Err(e) = checked {
                    eprintln!("event[{}]: {}", index, e);
                    invalid += 1;
                }
            }
            if invalid > 0 {
                return Err(anyhow!(
                    "malformed_event: {} of {} events are invalid",
                    invalid,
                    batch.len()
                ));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate-events",
                    "valid": true,
                    "events": batch.len(),
                    "attachments": attachments.len(),
                })));
            }
            println!("ok");
        }
        Commands::Finish { job, user, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let status = bridge.scheduler_finished(&user, &job)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "finish", "job": job, "status": status})));
            }
            println!("status: {}", status);
        }
        Commands::Fail {
            job,
            problem,
            report,
            user,
            json,
        } => {
            let (bridge, _lock) = open_bridge(root)?;
            let status = match &report {
                Some(path) => bridge.fail_component(&user, &job, path, &problem)?,
                None => bridge.fail_job(&user, &job, &problem)?,
            };
            if json {
                return Ok(Some(json!({"ok": true, "command": "fail", "job": job, "status": status})));
            }
            println!("status: {}", status);
        }
        Commands::Cancel { job, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let status = bridge.cancel(&job)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "cancel", "job": job, "status": status})));
            }
            println!("status: {}", status);
        }
        Commands::Status { job, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let status = bridge.status(&job);
            let progress = bridge.progress(&job);
            let reports = bridge.snapshot(&job).map(|s| s.tree.len()).unwrap_or(0);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "job": job,
                    "status": status,
                    "reports": reports,
                    "progress": progress,
                })));
            }
            println!("job: {}", job);
            println!("status: {}", status);
            println!("reports: {}", reports);
            if let Some(p) = progress {
                println!(
                    "tasks: {}/{} solved, {} failed",
                    p.tasks.solved,
                    p.tasks.total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string()),
                    p.tasks.failed
                );
            }
        }
        Commands::ImportMarks { paths, json } => {
            let config = load_config(root)?;
            let sources = if paths.is_empty() {
                vec![config.marks.dir.clone()]
            } else {
                paths
            };
            let files = collect_mark_files(&sources)?;
            let (bridge, _lock) = open_bridge(root)?;
            let mut imported = Vec::new();
            let mut failed = Vec::new();
            for file in &files {
                let result = fs::read(file)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| bridge.import_mark(&bytes));
                match result {
                    Ok(change) => {
                        if !json {
                            println!(
                                "imported: {} ({} new associations)",
                                change.mark, change.associations.created
                            );
                        }
                        imported.push(change);
                    }
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "mark not imported");
                        failed.push(json!({
                            "file": file.display().to_string(),
                            "code": error_code(&e),
                            "message": e.to_string(),
                        }));
                    }
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": failed.is_empty(),
                    "command": "import-marks",
                    "imported": imported,
                    "failed": failed,
                })));
            }
            for f in &failed {
                println!("failed: {}", f);
            }
        }
        Commands::EditMark {
            id,
            mark_type,
            file,
            json,
        } => {
            let doc: Value = serde_json::from_str(&fs::read_to_string(&file)?)?;
            let (bridge, _lock) = open_bridge(root)?;
            let change = bridge.upsert_mark(&id, mark_type.into(), &doc)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "edit-mark", "change": change})));
            }
            println!("mark: {}", change.mark);
            println!("version: {}", change.version.unwrap_or_default());
            println!("jobs: {}", change.jobs);
            println!("associations_created: {}", change.associations.created);
            println!("associations_removed: {}", change.associations.removed);
        }
        Commands::DeleteMark { id, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let change = bridge.delete_mark(&id)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "delete-mark", "change": change})));
            }
            println!("deleted: {}", id);
            println!("associations_removed: {}", change.associations.removed);
        }
        Commands::Summary { job, report, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let summary = bridge.summary(&job, report.as_deref())?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "summary", "summary": summary})));
            }
            println!("job: {}", summary.job);
            println!("report: {}", summary.report);
            for (label, counts) in [
                ("safes", &summary.safes),
                ("unsafes", &summary.unsafes),
                ("unknowns", &summary.unknowns),
            ] {
                println!("{}: {}", label, counts.total);
                for (verdict, n) in &counts.verdicts {
                    println!("  {}: {}", verdict, n);
                }
                for (tag, n) in &counts.tags {
                    println!("  tag {}: {}", tag, n);
                }
            }
        }
        Commands::Verdict { job, report, json } => {
            let (bridge, _lock) = open_bridge(root)?;
            let verdict = bridge.verdict(&job, &report)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "verdict", "verdict": verdict})));
            }
            println!("report: {}", verdict.path);
            println!("type: {}", verdict.leaf_type.as_str());
            println!("verdict: {}", verdict.verdict.label());
            if let Some(mark) = &verdict.primary_mark {
                println!("primary_mark: {}", mark);
            }
            if !verdict.tags.is_empty() {
                println!(
                    "tags: {}",
                    verdict.tags.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
        }
        Commands::Confirm {
            job,
            mark,
            report,
            user,
            json,
        } => {
            let (bridge, _lock) = open_bridge(root)?;
            let association = bridge.confirm(&user, &job, &mark, &report)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "confirm", "association": association})));
            }
            println!("confirmed: {} on {}", mark, report);
        }
        Commands::Unconfirm {
            job,
            mark,
            report,
            user,
            json,
        } => {
            let (bridge, _lock) = open_bridge(root)?;
            let association = bridge.unconfirm(&user, &job, &mark, &report)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "unconfirm", "association": association})));
            }
            println!("unconfirmed: {} on {}", mark, report);
        }
        Commands::Serve { addr } => {
            let (bridge, _lock) = open_bridge(root)?;
            serve(&bridge, &addr)?;
        }
    }
    Ok(None)
}

/// Splits an upload envelope `{"report": …, "attachments": {name: base64}}`
/// into events and attachments. Anything else is taken as bare events.
fn split_envelope(mut value: Value, attachments: &mut Attachments) -> Result<Vec<Value>> {
    let report = value.as_object_mut().and_then(|o| o.remove("report"));
    let Some(report) = report else {
        return Ok(events_from_value(value));
    };
    if let Some(files) = value.get("attachments").and_then(Value::as_object) {
        for (name, data) in files {
            let encoded = data
                .as_str()
                .ok_or_else(|| anyhow!("malformed_event: attachment '{}' is not base64 text", name))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| anyhow!("malformed_event: attachment '{}': {}", name, e))?;
            attachments.insert(name.clone(), bytes);
        }
    }
    Ok(events_from_value(report))
}

fn read_event_lines(path: &Path, attachments: &mut Attachments) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| anyhow!("malformed_event: line {}: {}", n + 1, e))?;
        events.extend(split_envelope(value, attachments)?);
    }
    Ok(events)
}

/// Every file under `dir`, named by its path relative to `dir`.
fn add_dir_attachments(dir: &Path, attachments: &mut Attachments) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir)?;
        let name = rel.to_string_lossy().replace('\\', "/");
        attachments.insert(name, fs::read(entry.path())?);
    }
    Ok(())
}

fn collect_mark_files(sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for source in sources {
        if source.is_file() {
            out.push(source.clone());
            continue;
        }
        if !source.is_dir() {
            return Err(anyhow!("mark source not found: {}", source.display()));
        }
        for entry in walkdir::WalkDir::new(source) {
            let entry = entry?;
            let is_mark = entry.file_type().is_file()
                && matches!(
                    entry.path().extension().and_then(|s| s.to_str()),
                    Some("zip") | Some("json")
                );
            if is_mark {
                out.push(entry.path().to_path_buf());
            }
        }
    }
    out.sort();
    Ok(out)
}

fn serve(bridge: &Bridge, addr: &str) -> Result<()> {
    let server = tiny_http::Server::http(addr).map_err(|e| anyhow!("serve: {}: {}", addr, e))?;
    info!(addr, "bridge listening");
    for mut request in server.incoming_requests() {
        let user = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("X-Vbridge-User"))
            .map(|h| h.value.as_str().to_string())
            .unwrap_or_else(|| "anonymous".to_string());
        let mut body = Vec::new();
        let read = request.as_reader().read_to_end(&mut body);
        let (status, payload) = match read {
            Ok(_) => route(bridge, request.method(), request.url(), &user, body),
            Err(e) => (400, json_error("bad_request", e.to_string(), json!({}))),
        };
        let mut response = tiny_http::Response::from_string(payload.to_string()).with_status_code(status);
        if let Ok(header) = "Content-Type: application/json".parse::<tiny_http::Header>() {
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            warn!(error = %e, "response not sent");
        }
    }
    Ok(())
}

fn route(bridge: &Bridge, method: &tiny_http::Method, url: &str, user: &str, body: Vec<u8>) -> (u16, Value) {
    let path = url.split('?').next().unwrap_or("");
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let result = match (method, segments.as_slice()) {
        (tiny_http::Method::Post, ["jobs", job, "decision"]) => bridge
            .start_decision(user, job)
            .map(|status| json!({"job": job, "status": status})),
        (tiny_http::Method::Post, ["jobs", job, "reports"]) => {
            let mut attachments = Attachments::new();
            serde_json::from_slice::<Value>(&body)
                .map_err(|e| anyhow!("malformed_event: {}", e))
                .and_then(|value| split_envelope(value, &mut attachments))
                .and_then(|events| bridge.apply_batch(user, job, events, &attachments))
                .and_then(|report| Ok(json!({"batch": serde_json::to_value(report)?})))
        }
        (tiny_http::Method::Post, ["jobs", job, "finished"]) => bridge
            .scheduler_finished(user, job)
            .map(|status| json!({"job": job, "status": status})),
        (tiny_http::Method::Get, ["jobs", job, "summary"]) => bridge
            .summary(job, None)
            .and_then(|summary| Ok(json!({"summary": serde_json::to_value(summary)?}))),
        (tiny_http::Method::Post, ["marks"]) => bridge
            .import_mark(&body)
            .and_then(|change| Ok(json!({"change": serde_json::to_value(change)?}))),
        _ => {
            return (
                404,
                json_error("not_found", format!("{} {}", method, path), json!({})),
            )
        }
    };
    match result {
        Ok(mut payload) => {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("ok".to_string(), Value::Bool(true));
            }
            (200, payload)
        }
        Err(e) => {
            let code = error_code(&e);
            let status = match code.as_str() {
                "authorization_error" => 403,
                "unknown_job" | "unknown_report" | "unknown_mark" => 404,
                "state_error" => 409,
                _ => 400,
            };
            (status, json_error(&code, e.to_string(), json!({})))
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Decide { json, .. }
        | Commands::Ingest { json, .. }
        | Commands::ValidateEvents { json, .. }
        | Commands::Finish { json, .. }
        | Commands::Fail { json, .. }
        | Commands::Cancel { json, .. }
        | Commands::Status { json, .. }
        | Commands::ImportMarks { json, .. }
        | Commands::EditMark { json, .. }
        | Commands::DeleteMark { json, .. }
        | Commands::Summary { json, .. }
        | Commands::Verdict { json, .. }
        | Commands::Confirm { json, .. }
        | Commands::Unconfirm { json, .. } => *json,
        Commands::Init { .. } | Commands::Serve { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn split_envelope_decodes_attachments() {
        let mut attachments = Attachments::new();
        let events = split_envelope(
            json!({"report": [{"type": "start", "id": "/"}, {"type": "finish", "id": "/"}],
                   "attachments": {"log.txt": STANDARD.encode(b"hello")}}),
            &mut attachments,
        )
        .expect("envelope");
        assert_eq!(events.len(), 2);
        assert_eq!(attachments.names().collect::<Vec<_>>(), vec!["log.txt"]);

        let err = split_envelope(
            json!({"report": {"type": "start", "id": "/"}, "attachments": {"x": "%%%"}}),
            &mut attachments,
        )
        .expect_err("bad base64");
        assert!(err.to_string().starts_with("malformed_event:"), "{}", err);
    }

    #[test]
    fn event_lines_mix_bare_events_and_envelopes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let lines = [
            json!({"type": "start", "id": "/"}).to_string(),
            String::new(),
            json!({"report": {"type": "unknown", "id": "/p", "parent id": "/", "problem desc": "p.txt"},
                   "attachments": {"p.txt": STANDARD.encode(b"oops")}})
            .to_string(),
        ];
        fs::write(&path, lines.join("\n")).expect("write");
        let mut attachments = Attachments::new();
        let events = read_event_lines(&path, &mut attachments).expect("lines");
        assert_eq!(events.len(), 2);
        assert_eq!(attachments.len(), 1);

        fs::write(&path, "{not json").expect("write");
        let err = read_event_lines(&path, &mut attachments).expect_err("bad line");
        assert!(err.to_string().contains("line 1"), "{}", err);
    }

    #[test]
    fn dir_attachments_use_relative_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("traces")).expect("mkdir");
        fs::write(dir.path().join("traces").join("t1.json"), b"{}").expect("write");
        fs::write(dir.path().join("log.txt"), b"log").expect("write");
        let mut attachments = Attachments::new();
        add_dir_attachments(dir.path(), &mut attachments).expect("walk");
        let mut names: Vec<&str> = attachments.names().collect();
        names.sort();
        assert_eq!(names, vec!["log.txt", "traces/t1.json"]);
    }

    #[test]
    fn route_reports_codes_as_http_status() {
        let bridge = Bridge::new(std::sync::Arc::new(vbridge_core::MemoryBlobStore::new()));
        let (status, body) = route(&bridge, &tiny_http::Method::Post, "/jobs/j/decision", "svc", Vec::new());
        assert_eq!(status, 200, "{}", body);
        assert_eq!(body["status"], "PENDING");

        let batch = json!([{"type": "start", "id": "/"}]).to_string().into_bytes();
        let (status, body) = route(&bridge, &tiny_http::Method::Post, "/jobs/j/reports", "svc", batch);
        assert_eq!(status, 200, "{}", body);
        assert_eq!(body["batch"]["applied"], 1);

        let (status, body) = route(&bridge, &tiny_http::Method::Get, "/jobs/other/summary", "svc", Vec::new());
        assert_eq!(status, 404, "{}", body);
        assert_eq!(body["error"]["code"], "unknown_job");

        let (status, _) = route(&bridge, &tiny_http::Method::Delete, "/jobs/j", "svc", Vec::new());
        assert_eq!(status, 404);
    }

    #[test]
    fn scheduler_finish_route_checks_the_user() {
        let bridge = Bridge::new(std::sync::Arc::new(vbridge_core::MemoryBlobStore::new()))
            .with_authorizer(std::sync::Arc::new(vbridge_runner::ServiceUsers::new(["svc"])));
        route(&bridge, &tiny_http::Method::Post, "/jobs/j/decision", "svc", Vec::new());
        let batch = json!([{"type": "start", "id": "/"}]).to_string().into_bytes();
        route(&bridge, &tiny_http::Method::Post, "/jobs/j/reports", "svc", batch);

        let (status, body) = route(&bridge, &tiny_http::Method::Post, "/jobs/j/finished", "stranger", Vec::new());
        assert_eq!(status, 403, "{}", body);
        assert_eq!(body["error"]["code"], "authorization_error");
        assert_eq!(bridge.status("j"), vbridge_reports::JobStatus::Processing);

        let (status, body) = route(&bridge, &tiny_http::Method::Post, "/jobs/j/finished", "svc", Vec::new());
        assert_eq!(status, 200, "{}", body);
        assert_eq!(body["status"], "CORRUPTED");
    }
}
