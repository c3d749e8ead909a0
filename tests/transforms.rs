use std::fs;

use ingestree::types::Value;
use ingestree::{ConfigTree, Engine, Session};

#[test]
fn query_script_next_to_the_data_runs_against_the_frame() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("_root.yml"),
        "target:\n  type: memory\ntransform:\n  - query:\n      path: totals.sql\n",
    )
    .unwrap();
    fs::write(root.join("totals.sql"), "SELECT g, SUM(n) AS total FROM df GROUP BY g ORDER BY g").unwrap();
    fs::write(root.join("sales.csv"), "g,n\nx,1\ny,2\nx,3\n").unwrap();

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let report = Engine::default().run(&mut tree, &session).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(report.outcomes.len(), 1);

    let out = session.store().get("sales").unwrap();
    assert_eq!(out.column_names(), vec!["g", "total"]);
    assert_eq!(
        out.rows,
        vec![
            vec![Value::Utf8("x".into()), Value::Int64(4)],
            vec![Value::Utf8("y".into()), Value::Int64(2)],
        ]
    );
}

#[test]
fn filter_melt_and_constant_columns_chain_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("_root.yml"),
        concat!(
            "target:\n  type: memory\n",
            "transform:\n",
            "  - filter: q1 > 10\n",
            "  - melt:\n      id_vars: id\n      var_name: quarter\n      value_name: amount\n",
            "  - add_columns:\n      origin: \"{file_name}\"\n",
        ),
    )
    .unwrap();
    fs::write(root.join("wide.csv"), "id,q1,q2\na,5,6\nb,20,30\n").unwrap();

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let report = Engine::default().run(&mut tree, &session).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);

    let out = session.store().get("wide").unwrap();
    assert_eq!(out.column_names(), vec!["id", "quarter", "amount", "origin"]);
    assert_eq!(out.row_count(), 2);
    assert!(out.rows.iter().all(|r| r[0] == Value::Utf8("b".into())));
    assert!(out.rows.iter().all(|r| r[3] == Value::Utf8("wide.csv".into())));
}
