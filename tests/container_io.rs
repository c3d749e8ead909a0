use std::fs;

use ingestree::backend::BackendKind;
use ingestree::config::{IfExists, ReadOptions, WriteOptions};
use ingestree::io::{ContainerMode, FrameMode, ResourceStats};
use ingestree::types::{DataSet, DataType, Field, Schema, Value};
use ingestree::Session;

fn ints(values: &[i64]) -> DataSet {
    DataSet::new(
        Schema::new(vec![Field::new("id", DataType::Int64)]),
        values.iter().map(|v| vec![Value::Int64(*v)]).collect(),
    )
}

#[test]
fn frame_modes_only_move_forward_and_reads_are_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people.csv");
    fs::write(&path, "id\n1\n2\n3\n").unwrap();

    let session = Session::new(dir.path());
    let c = session.open("people.csv", BackendKind::Csv, false).unwrap();
    let opts = ReadOptions::default();

    assert_eq!(c.read("people", &opts, None, Some(2)).unwrap().row_count(), 2);
    assert_eq!(c.read("people", &opts, None, Some(2)).unwrap().row_count(), 2);
    assert_eq!(c.read("people", &opts, None, None).unwrap().row_count(), 3);
    assert_eq!(c.read("people", &opts, None, None).unwrap().row_count(), 3);
    assert_eq!(c.mode(), ContainerMode::Read);

    c.write("people", ints(&[4]), IfExists::Append, &WriteOptions::default(), false)
        .unwrap();
    assert_eq!(c.mode(), ContainerMode::Append);
    c.persist().unwrap();

    let frame = c.frame("people");
    let frame = frame.lock().unwrap();
    assert_eq!(frame.backend_reads(), 2);
    assert_eq!(
        frame.history(),
        &[FrameMode::Soft, FrameMode::Sampled, FrameMode::Read, FrameMode::Appending]
    );
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["id", "1", "2", "3", "4"]);
}

#[test]
fn one_persist_writes_every_dirty_table_of_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = "sqlite://warehouse.db";
    {
        let session = Session::new(dir.path());
        let c = session.open(url, BackendKind::Sql, false).unwrap();
        assert_eq!(c.mode(), ContainerMode::Overwrite);
        c.write("a", ints(&[1, 2]), IfExists::Fail, &WriteOptions::default(), false)
            .unwrap();
        c.write("b", ints(&[3]), IfExists::Fail, &WriteOptions::default(), false)
            .unwrap();
        c.persist().unwrap();
        session.retain(url, 1).unwrap();
        session.release(url, 1).unwrap();
        assert_eq!(session.stats(url), ResourceStats { opens: 1, closes: 1 });
    }

    let session = Session::new(dir.path());
    let c = session.open(url, BackendKind::Sql, false).unwrap();
    let mut names = c.children(false).unwrap();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(
        c.read("a", &ReadOptions::default(), None, None).unwrap().rows,
        vec![vec![Value::Int64(1)], vec![Value::Int64(2)]]
    );
}

#[test]
fn replace_opens_an_empty_container() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("t.csv"), "id\n7\n").unwrap();

    let session = Session::new(dir.path());
    let c = session.open("t.csv", BackendKind::Csv, true).unwrap();
    assert!(!c.exists("t").unwrap());
    assert_eq!(c.mode(), ContainerMode::Overwrite);
}

#[test]
fn build_only_containers_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(dir.path());
    let c = session.open("new.csv", BackendKind::Csv, false).unwrap();
    c.write("new", ints(&[1]), IfExists::Fail, &WriteOptions::default(), true)
        .unwrap();
    assert!(c.exists("new").unwrap());

    let err = c.persist().unwrap_err();
    assert!(matches!(err, ingestree::IngestError::EmptyWrite { .. }));
    assert!(!dir.path().join("new.csv").exists());
}

#[test]
fn memory_tables_are_shared_through_the_session_store() {
    let session = Session::new(".");
    let c = session.open("memory://", BackendKind::Memory, false).unwrap();
    c.write("stage", ints(&[1, 2]), IfExists::Replace, &WriteOptions::default(), false)
        .unwrap();
    assert!(!session.store().contains("stage"));
    c.persist().unwrap();
    assert_eq!(session.store().get("stage").unwrap(), ints(&[1, 2]));
}

#[test]
fn failed_physical_write_keeps_frames_uncommitted() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();

    let session = Session::new(dir.path());
    let c = session.open("blocker/out.csv", BackendKind::Csv, false).unwrap();
    c.write("out", ints(&[1, 2]), IfExists::Fail, &WriteOptions::default(), false)
        .unwrap();
    assert!(c.persist().is_err());
    {
        let frame = c.frame("out");
        let frame = frame.lock().unwrap();
        assert!(frame.is_dirty());
        assert!(frame.output().is_none());
    }

    fs::remove_file(&blocker).unwrap();
    c.persist().unwrap();
    let text = fs::read_to_string(blocker.join("out.csv")).unwrap();
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["id", "1", "2"]);
    assert!(!c.frame("out").lock().unwrap().is_dirty());
}
