#![cfg(feature = "excel")]

use std::fs;
use std::path::Path;

use ingestree::backend::excel;
use ingestree::config::ReadOptions;
use ingestree::io::ResourceStats;
use ingestree::types::Value;
use ingestree::{ConfigTree, Engine, ExecutionOptions, Session};

/// Three sheets: `north` (2 rows), `south` (3 rows), `west` (1 row), each `id,name`.
fn write_regions_xlsx(path: &Path) {
    use rust_xlsxwriter::Workbook;

    let mut wb = Workbook::new();
    for (sheet, rows) in [("north", 2u32), ("south", 3), ("west", 1)] {
        let ws = wb.add_worksheet();
        ws.set_name(sheet).unwrap();
        ws.write_string(0, 0, "id").unwrap();
        ws.write_string(0, 1, "name").unwrap();
        for r in 1..=rows {
            ws.write_number(r, 0, f64::from(r)).unwrap();
            ws.write_string(r, 1, &format!("{sheet}-{r}")).unwrap();
        }
    }
    wb.save(path).unwrap();
}

#[test]
fn workbook_opens_once_for_all_sheets_loaded_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("_root.yml"),
        "source:\n  load_parallel: true\ntarget:\n  type: memory\n",
    )
    .unwrap();
    write_regions_xlsx(&root.join("regions.xlsx"));

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let engine = Engine::new(ExecutionOptions {
        num_threads: Some(3),
        ..ExecutionOptions::default()
    });
    let report = engine.run(&mut tree, &session).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);
    assert_eq!(report.metrics.leaves_succeeded, 3);
    assert_eq!(report.metrics.persists, 1);

    let workbook = fs::canonicalize(root.join("regions.xlsx")).unwrap();
    let url = workbook.to_str().unwrap();
    assert_eq!(session.stats(url), ResourceStats { opens: 1, closes: 1 });
    assert!(!session.is_open(url));

    for (sheet, rows) in [("north", 2), ("south", 3), ("west", 1)] {
        let table = session.store().get(sheet).unwrap();
        assert_eq!(table.row_count(), rows, "{sheet}");
        assert_eq!(table.column_names(), vec!["id", "name"], "{sheet}");
    }
}

#[test]
fn sheet_list_overrides_limit_the_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("_root.yml"), "target:\n  type: memory\n").unwrap();
    fs::write(
        root.join("regions.xlsx.yml"),
        "source:\n  table: [south, west]\ntables:\n  west:\n    target:\n      table: far_west\n",
    )
    .unwrap();
    write_regions_xlsx(&root.join("regions.xlsx"));

    let mut tree = ConfigTree::from_path(root).unwrap();
    let session = Session::new(tree.root());
    let report = Engine::default().run(&mut tree, &session).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);

    let mut tables = session.store().table_names();
    tables.sort();
    assert_eq!(tables, vec!["far_west", "south"]);
}

#[test]
fn truncate_keeps_the_sheet_header_and_leaves_other_sheets_alone() {
    use rust_xlsxwriter::Workbook;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("_root.yml"),
        "target:\n  url: out/book.xlsx\n  table: regions\n  if_exists: truncate\n",
    )
    .unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("data/regions.csv"), "id,name\n1,north\n2,south\n").unwrap();

    fs::create_dir_all(root.join("out")).unwrap();
    let mut wb = Workbook::new();
    let ws = wb.add_worksheet();
    ws.set_name("regions").unwrap();
    ws.write_string(0, 0, "name").unwrap();
    ws.write_string(0, 1, "id").unwrap();
    for r in 1..=3u32 {
        ws.write_string(r, 0, &format!("old-{r}")).unwrap();
        ws.write_number(r, 1, f64::from(r * 10)).unwrap();
    }
    let ws = wb.add_worksheet();
    ws.set_name("notes").unwrap();
    ws.write_string(0, 0, "note").unwrap();
    ws.write_string(1, 0, "keep me").unwrap();
    wb.save(root.join("out/book.xlsx")).unwrap();

    let report = Engine::default().run_path(root.join("data")).unwrap();
    assert!(report.all_succeeded(), "{:?}", report.outcomes);

    let mut book = excel::open(&root.join("out/book.xlsx")).unwrap();
    assert_eq!(excel::sheet_names(&book, true), vec!["regions", "notes"]);

    let regions = excel::read_sheet(&mut book, "regions", &ReadOptions::default(), None).unwrap();
    assert_eq!(regions.column_names(), vec!["name", "id"]);
    assert_eq!(
        regions.rows,
        vec![
            vec![Value::Utf8("north".into()), Value::Int64(1)],
            vec![Value::Utf8("south".into()), Value::Int64(2)],
        ]
    );

    let notes = excel::read_sheet(&mut book, "notes", &ReadOptions::default(), None).unwrap();
    assert_eq!(notes.column_names(), vec!["note"]);
    assert_eq!(notes.rows, vec![vec![Value::Utf8("keep me".into())]]);
}
