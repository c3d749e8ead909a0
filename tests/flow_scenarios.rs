use std::fs;
use std::path::{Path, PathBuf};

use ingestree::config::IfExists;
use ingestree::error::ErrorKind;
use ingestree::types::Value;
use ingestree::{ConfigTree, Engine, ExecutionOptions, RunReport, Session};

fn write(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}

fn engine() -> Engine {
    Engine::new(ExecutionOptions {
        num_threads: Some(2),
        ..ExecutionOptions::default()
    })
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// `_root.yml` with `root_yml`, plus `data/a.csv` = [1, 2] and `data/b.csv` = [3, 4].
fn two_sources(root_yml: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    write(&root.join("_root.yml"), root_yml);
    write(&root.join("data/a.csv"), "a\n1\n2\n");
    write(&root.join("data/b.csv"), "a\n3\n4\n");
    (dir, root)
}

fn run(root: &Path) -> RunReport {
    engine().run_path(root.join("data")).unwrap()
}

#[test]
fn sources_sharing_a_target_table_are_appended() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n");

    let mut tree = ConfigTree::from_path(root.join("data")).unwrap();
    let session = Session::new(tree.root());
    let engine = engine();
    let leaves = engine.plan(&mut tree, &session).unwrap();
    let flow = engine.build_flow(leaves, &session).unwrap();

    let policies: Vec<(String, IfExists)> = flow
        .leaves()
        .into_iter()
        .map(|l| (l.key, l.target.if_exists))
        .collect();
    assert_eq!(
        policies,
        vec![
            ("data/a.csv::a".to_string(), IfExists::Fail),
            ("data/b.csv::b".to_string(), IfExists::Append),
        ]
    );

    let report = engine.execute(&flow, &session);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert!(report.success());
    assert_eq!(report.metrics.rows_written, 4);
    assert_eq!(report.metrics.tables_built, 1);
    assert_eq!(report.metrics.persists, 1);
    assert_eq!(lines(&root.join("out/out.csv")), vec!["a", "1", "2", "3", "4"]);
}

#[test]
fn fail_policy_leaves_existing_target_untouched() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n");
    assert!(run(&root).success());
    let before = fs::read(root.join("out/out.csv")).unwrap();

    let report = run(&root);
    assert!(!report.success());
    assert_eq!(report.failed().count(), 2);
    assert!(report.outcomes.iter().all(|o| o.error_kind == Some(ErrorKind::Build)));
    assert_eq!(report.metrics.builds_failed, 1);
    assert_eq!(fs::read(root.join("out/out.csv")).unwrap(), before);
}

#[test]
fn replace_discards_prior_content() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n  if_exists: replace\n");
    write(&root.join("out/out.csv"), "a\n9\n8\n");

    let report = run(&root);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(lines(&root.join("out/out.csv")), vec!["a", "1", "2", "3", "4"]);
}

#[test]
fn append_keeps_existing_rows_and_column_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("_root.yml"), "target:\n  url: out/out.csv\n  if_exists: append\n");
    write(&root.join("data/a.csv"), "a,b\n1,x\n2,y\n");
    write(&root.join("data/b.csv"), "a,b\n3,z\n4,w\n");
    write(&root.join("out/out.csv"), "b,a\nq,0\n");

    let report = run(root);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(
        lines(&root.join("out/out.csv")),
        vec!["b,a", "q,0", "x,1", "y,2", "z,3", "w,4"]
    );
}

#[test]
fn truncate_keeps_schema_and_replaces_rows() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n  if_exists: truncate\n  consistency: ignore\n");
    write(&root.join("out/out.csv"), "a,extra\n9,x\n8,y\n7,z\n");

    let report = run(&root);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(
        lines(&root.join("out/out.csv")),
        vec!["a,extra", "1,", "2,", "3,", "4,"]
    );
}

#[test]
fn strict_consistency_blocks_mismatched_sources() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n  if_exists: append\n");
    write(&root.join("out/out.csv"), "x,a\n7,0\n");
    let before = fs::read(root.join("out/out.csv")).unwrap();

    let report = run(&root);
    assert!(!report.success());
    assert!(report.outcomes.iter().all(|o| o.error_kind == Some(ErrorKind::Consistency)));
    assert_eq!(fs::read(root.join("out/out.csv")).unwrap(), before);
}

#[test]
fn ignored_consistency_proceeds_despite_mismatch() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n  if_exists: append\n  consistency: ignore\n");
    write(&root.join("out/out.csv"), "x,a\n7,0\n");

    let report = run(&root);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(
        lines(&root.join("out/out.csv")),
        vec!["x,a", "7,0", ",1", ",2", ",3", ",4"]
    );
}

#[test]
fn split_yields_one_target_per_distinct_value() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("_root.yml"), "target:\n  type: memory\ntransform:\n  - split: g\n");
    write(&root.join("data.csv"), "g,n\nt1,1\nt1,2\nt2,3\nt2,4\n");

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let report = engine().run(&mut tree, &session).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);

    let mut keys: Vec<&str> = report.outcomes.iter().map(|o| o.key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["data.csv::data[g=t1]", "data.csv::data[g=t2]"]);

    let mut tables = session.store().table_names();
    tables.sort();
    assert_eq!(tables, vec!["t1", "t2"]);

    let t1 = session.store().get("t1").unwrap();
    let t2 = session.store().get("t2").unwrap();
    assert_eq!(t1.row_count() + t2.row_count(), 4);
    assert!(t1.column("g").unwrap().iter().all(|v| **v == Value::Utf8("t1".into())));
    assert!(t2.column("g").unwrap().iter().all(|v| **v == Value::Utf8("t2".into())));
}

#[test]
fn staged_tables_are_written_before_their_readers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(&root.join("_root.yml"), "target:\n  type: memory\n  table: stage\n");
    // `a/` sorts before `data.csv`, so the reader comes first in tree order.
    write(
        &root.join("a/export.yml"),
        "source:\n  url: memory://\n  type: memory\n  table: stage\ntarget:\n  url: out/final.csv\n  type: csv\n",
    );
    write(&root.join("data.csv"), "a\n1\n2\n");

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let engine = engine();
    let leaves = engine.plan(&mut tree, &session).unwrap();
    assert_eq!(leaves[0].key, "a/export.yml::stage");

    let flow = engine.build_flow(leaves, &session).unwrap();
    let order: Vec<String> = flow.leaves().into_iter().map(|l| l.key).collect();
    assert_eq!(order, vec!["data.csv::data", "a/export.yml::stage"]);

    let report = engine.execute(&flow, &session);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(lines(&root.join("out/final.csv")), vec!["a", "1", "2"]);
}

#[test]
fn memory_tables_staged_into_memory_run_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("_root.yml"),
        "source:\n  load_parallel: true\ntarget:\n  type: memory\n  table: stage\n",
    );
    write(
        &root.join("a/export.yml"),
        "source:\n  url: memory://\n  type: memory\n  table: stage\ntarget:\n  table: final\n",
    );
    write(&root.join("data.csv"), "a\n1\n2\n");

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let engine = engine();
    let leaves = engine.plan(&mut tree, &session).unwrap();
    let flow = engine.build_flow(leaves, &session).unwrap();
    let order: Vec<String> = flow.leaves().into_iter().map(|l| l.key).collect();
    assert_eq!(order, vec!["data.csv::data", "a/export.yml::stage"]);

    let report = engine.execute(&flow, &session);
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(session.store().get("stage").unwrap().row_count(), 2);
    assert_eq!(session.store().get("final").unwrap().row_count(), 2);
}

/// `data/a.csv` with 150 integer rows whose row 121 holds `late`.
fn late_value_source(late: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    write(&root.join("_root.yml"), "target:\n  url: out/out.csv\n");
    let mut text = String::from("n\n");
    for i in 1..=150 {
        if i == 121 {
            text.push_str(late);
        } else {
            text.push_str(&i.to_string());
        }
        text.push('\n');
    }
    write(&root.join("data/a.csv"), &text);
    (dir, root)
}

#[test]
fn values_past_the_sample_keep_their_type() {
    for late in ["2.5", "hello"] {
        let (_dir, root) = late_value_source(late);
        let report = run(&root);
        assert!(report.all_succeeded(), "{:?}", report.outcomes);

        let out = lines(&root.join("out/out.csv"));
        assert_eq!(out.len(), 151, "{late}");
        assert_eq!(out[121], late);
    }
}

#[test]
fn flow_display_shows_resources_and_tables() {
    let (_dir, root) = two_sources("target:\n  url: out/out.csv\n");
    let mut tree = ConfigTree::from_path(root.join("data")).unwrap();
    let session = Session::new(tree.root());
    let engine = engine();
    let leaves = engine.plan(&mut tree, &session).unwrap();
    let flow = engine.build_flow(leaves, &session).unwrap();

    let shown = flow.to_string();
    assert!(shown.contains("target "), "{shown}");
    assert!(shown.contains("table out"), "{shown}");
    assert!(shown.contains("execute data/b.csv::b"), "{shown}");
    assert_eq!(flow.leaf_count(), 2);
}
