//! XML backend.
//!
//! A document is read as one table: every row element (the root's children, or the elements
//! named `row_tag`) becomes a row; its attributes and the text of its child elements become
//! columns, in first-appearance order.

use std::fs;
use std::path::Path;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::config::{ReadOptions, WriteOptions};
use crate::error::{IngestError, IngestResult};
use crate::types::DataSet;

use super::infer;

const DEFAULT_ROOT_TAG: &str = "data";
const DEFAULT_ROW_TAG: &str = "row";

type Record = Vec<(String, String)>;

pub fn read(path: &Path, options: &ReadOptions, nrows: Option<usize>) -> IngestResult<DataSet> {
    let text = fs::read_to_string(path)?;
    let records = parse_records(&text, options.row_tag.as_deref(), nrows)?;

    let mut headers: Vec<String> = Vec::new();
    for rec in &records {
        for (k, _) in rec {
            if !headers.contains(k) {
                headers.push(k.clone());
            }
        }
    }
    let rows = records
        .into_iter()
        .map(|rec| {
            let mut row = vec![String::new(); headers.len()];
            for (k, v) in rec {
                if let Some(i) = headers.iter().position(|h| *h == k) {
                    row[i] = v;
                }
            }
            row
        })
        .collect();
    infer::dataset_from_strings(headers, rows, &options.dtypes)
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> IngestResult<Record> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(IngestError::xml)?;
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        let value = unescape(&raw).map_err(IngestError::xml)?.into_owned();
        out.push((tag_name(attr.key.as_ref()), value));
    }
    Ok(out)
}

fn parse_records(text: &str, row_tag: Option<&str>, nrows: Option<usize>) -> IngestResult<Vec<Record>> {
    let mut reader = Reader::from_str(text);

    let is_row = |name: &str, depth: usize| match row_tag {
        Some(tag) => name == tag,
        None => depth == 1,
    };

    let mut records: Vec<Record> = Vec::new();
    let mut depth = 0usize;
    let mut row: Option<(usize, Record)> = None;
    let mut field: Option<(String, String)> = None;

    loop {
        if nrows.is_some_and(|n| records.len() >= n) {
            break;
        }
        match reader.read_event().map_err(IngestError::xml)? {
            Event::Start(e) => {
                let name = tag_name(e.name().as_ref());
                match row.as_ref().map(|(d, _)| *d) {
                    None if is_row(&name, depth) => row = Some((depth, attributes(&e)?)),
                    Some(d) if depth == d + 1 => field = Some((name, String::new())),
                    _ => {}
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = tag_name(e.name().as_ref());
                match row.as_mut() {
                    None if is_row(&name, depth) => records.push(attributes(&e)?),
                    Some((d, rec)) if depth == *d + 1 => rec.push((name, String::new())),
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some((_, buf)) = &mut field {
                    let raw = String::from_utf8_lossy(&t).into_owned();
                    buf.push_str(&unescape(&raw).map_err(IngestError::xml)?);
                }
            }
            Event::CData(t) => {
                if let Some((_, buf)) = &mut field {
                    buf.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::GeneralRef(r) => {
                if let Some((_, buf)) = &mut field {
                    let entity = format!("&{};", String::from_utf8_lossy(&r));
                    buf.push_str(&unescape(&entity).map_err(IngestError::xml)?);
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                match row.as_ref().map(|(d, _)| *d) {
                    Some(d) if depth == d + 1 => {
                        if let (Some((name, value)), Some((_, rec))) = (field.take(), row.as_mut()) {
                            rec.push((name, value.trim().to_string()));
                        }
                    }
                    Some(d) if depth == d => {
                        if let Some((_, rec)) = row.take() {
                            records.push(rec);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(records)
}

pub fn write(path: &Path, data: &DataSet, options: &WriteOptions) -> IngestResult<()> {
    let root_tag = options.root_tag.as_deref().unwrap_or(DEFAULT_ROOT_TAG);
    let row_tag = options.row_tag.as_deref().unwrap_or(DEFAULT_ROW_TAG);

    let mut xml = Writer::new_with_indent(Vec::new(), b' ', 2);
    xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(IngestError::xml)?;
    xml.write_event(Event::Start(BytesStart::new(root_tag)))
        .map_err(IngestError::xml)?;
    for row in &data.rows {
        xml.write_event(Event::Start(BytesStart::new(row_tag)))
            .map_err(IngestError::xml)?;
        for (name, value) in data.schema.field_names().zip(row) {
            if value.is_null() {
                xml.write_event(Event::Empty(BytesStart::new(name)))
                    .map_err(IngestError::xml)?;
                continue;
            }
            let text = value.to_string();
            xml.write_event(Event::Start(BytesStart::new(name)))
                .map_err(IngestError::xml)?;
            xml.write_event(Event::Text(BytesText::new(&text)))
                .map_err(IngestError::xml)?;
            xml.write_event(Event::End(BytesEnd::new(name)))
                .map_err(IngestError::xml)?;
        }
        xml.write_event(Event::End(BytesEnd::new(row_tag)))
            .map_err(IngestError::xml)?;
    }
    xml.write_event(Event::End(BytesEnd::new(root_tag)))
        .map_err(IngestError::xml)?;
    fs::write(path, xml.into_inner())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Value};

    #[test]
    fn rows_from_children_and_attributes() {
        let doc = r#"<?xml version="1.0"?>
<orders>
  <order id="1"><item>pen</item><qty>2</qty></order>
  <order id="2"><item>ink &amp; nib</item><qty/></order>
</orders>"#;
        let recs = parse_records(doc, None, None).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0], vec![
            ("id".to_string(), "1".to_string()),
            ("item".to_string(), "pen".to_string()),
            ("qty".to_string(), "2".to_string()),
        ]);
        assert_eq!(recs[1][1].1, "ink & nib");
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.xml");
        let ds = DataSet::new(
            crate::types::Schema::new(vec![
                crate::types::Field::new("a", DataType::Int64),
                crate::types::Field::new("b", DataType::Utf8),
            ]),
            vec![
                vec![Value::Int64(1), Value::Utf8("x<y".to_string())],
                vec![Value::Int64(2), Value::Null],
            ],
        );
        write(&path, &ds, &WriteOptions::default()).unwrap();
        let back = read(&path, &ReadOptions::default(), None).unwrap();
        assert_eq!(back, ds);
    }
}
