use exp_analysis::{experiments_table, ExperimentRecord, ExperimentSet, LoadOptions};
use exp_core::{args_from, ensure_dir, ExperimentId, StaticVcs, Status};
use exp_session::{Session, SessionOptions, Termination};
use serde_json::json;
use std::fs;
use std::path::PathBuf;

fn temp_project(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "exp_roundtrip_{}_{}_{}",
        tag,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    ));
    ensure_dir(&root).expect("temp project");
    root
}

#[test]
fn recorded_session_reads_back() {
    let project = temp_project("session");
    let vcs = StaticVcs::new(&project, "feedbeef00", "Tune optimizer\n\nlonger body");
    let options = SessionOptions {
        project_directory: project.clone(),
        description: "sweep".to_string(),
        ..SessionOptions::default()
    };
    let session = Session::start(
        args_from(&json!({"lr": 0.1, "epochs": 5})).expect("args"),
        Some(args_from(&json!({"lr": 0.01, "epochs": 5})).expect("defaults")),
        &options,
        &vcs,
    )
    .expect("start");
    session.log(&json!({"epoch": 1, "loss": 0.9})).expect("log");
    session.log(&json!({"epoch": 2, "loss": 0.5})).expect("log");
    session.summary(&json!({"loss": 0.9, "acc": 0.7})).expect("summary");
    session.summary(&json!({"loss": 0.5})).expect("summary");
    let dir = session.dir().to_path_buf();
    session.finalize(Termination::Exit(3)).expect("finalize");
    drop(session);

    let record = ExperimentRecord::load(&dir).expect("record");
    assert_eq!(record.id, ExperimentId::Numbered(1));
    assert_eq!(record.status, Status::Error);
    assert_eq!(record.status_message, "exit(3)");
    assert_eq!(record.metadata.description, "sweep");
    assert_eq!(record.metadata.headline(), "Tune optimizer");
    assert!(record.metadata.end_time.is_some());
    assert_eq!(record.args, args_from(&json!({"lr": 0.1})).expect("args"));
    assert_eq!(
        record.summary,
        args_from(&json!({"loss": 0.5, "acc": 0.7})).expect("summary")
    );
    assert_eq!(
        record.log().expect("log"),
        vec![json!({"epoch": 1, "loss": 0.9}), json!({"epoch": 2, "loss": 0.5})]
    );
    let _ = fs::remove_dir_all(project);
}

#[test]
fn set_over_sessions_survives_a_broken_directory() {
    let project = temp_project("set");
    let vcs = StaticVcs::new(&project, "aaa111", "First");
    let options = SessionOptions {
        project_directory: project.clone(),
        ..SessionOptions::default()
    };
    for lr in [0.1, 0.2, 0.3, 0.4, 0.5] {
        let session = Session::start(
            args_from(&json!({"lr": lr})).expect("args"),
            None,
            &options,
            &vcs,
        )
        .expect("start");
        session.finish().expect("finish");
    }
    let root = options.experiments_root();
    fs::write(root.join("3").join("args.json"), "[broken").expect("corrupt");

    let set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");
    assert_eq!(set.len(), 4);
    assert_eq!(set.skipped().len(), 1);
    assert!(set.get(&ExperimentId::Numbered(3)).is_none());
    assert!(set.iter().all(|r| r.status == Status::Success));

    let groups = set.group_by_commit(None);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].experiments.len(), 4);
    assert_eq!(groups[0].differing_args(), vec!["lr".to_string()]);

    let rendered = experiments_table(set.iter(), true).to_string();
    assert!(rendered.contains("aaa111"));
    assert!(rendered.contains("0.5"));
    let _ = fs::remove_dir_all(project);
}
