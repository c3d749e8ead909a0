#![cfg(feature = "pdf")]

//! PDF backend (read-only).
//!
//! Every text-showing operator on every page becomes one row `(page, x, y, text)`, with the
//! position taken from the text matrix in effect at that point of the content stream.

use std::path::Path;

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object};

use crate::error::IngestResult;
use crate::types::{DataSet, DataType, Field, Schema, Value};

/// A positioned run of text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub text: String,
}

pub fn read(path: &Path, nrows: Option<usize>) -> IngestResult<DataSet> {
    let doc = Document::load(path)?;
    let mut boxes = Vec::new();
    for (page_no, page_id) in doc.get_pages() {
        let data = doc.get_page_content(page_id)?;
        let content = Content::decode(&data)?;
        boxes.extend(text_boxes_from_operations(page_no, &content.operations));
        if nrows.is_some_and(|n| boxes.len() >= n) {
            break;
        }
    }
    if let Some(n) = nrows {
        boxes.truncate(n);
    }
    Ok(to_dataset(boxes))
}

pub fn to_dataset(boxes: Vec<TextBox>) -> DataSet {
    let schema = Schema::new(vec![
        Field::new("page", DataType::Int64),
        Field::new("x", DataType::Float64),
        Field::new("y", DataType::Float64),
        Field::new("text", DataType::Utf8),
    ]);
    let rows = boxes
        .into_iter()
        .map(|b| {
            vec![
                Value::Int64(i64::from(b.page)),
                Value::Float64(b.x),
                Value::Float64(b.y),
                Value::Utf8(b.text),
            ]
        })
        .collect();
    DataSet::new(schema, rows)
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn text_of(obj: &Object, out: &mut String) {
    match obj {
        Object::String(bytes, _) => out.push_str(&String::from_utf8_lossy(bytes)),
        Object::Array(items) => {
            for item in items {
                match number(item) {
                    // Large negative kerning is a word gap.
                    Some(n) if n < -200.0 => out.push(' '),
                    Some(_) => {}
                    None => text_of(item, out),
                }
            }
        }
        _ => {}
    }
}

/// Extract text boxes from one page's content-stream operations.
pub fn text_boxes_from_operations(page: u32, ops: &[Operation]) -> Vec<TextBox> {
    let mut boxes = Vec::new();
    // Start of the current line, and the leading set by TL.
    let (mut line_x, mut line_y) = (0.0, 0.0);
    let mut leading = 0.0;

    for op in ops {
        let nums: Vec<f64> = op.operands.iter().filter_map(number).collect();
        match op.operator.as_str() {
            "BT" => {
                line_x = 0.0;
                line_y = 0.0;
            }
            "Tm" if nums.len() == 6 => {
                line_x = nums[4];
                line_y = nums[5];
            }
            "Td" if nums.len() == 2 => {
                line_x += nums[0];
                line_y += nums[1];
            }
            "TD" if nums.len() == 2 => {
                leading = -nums[1];
                line_x += nums[0];
                line_y += nums[1];
            }
            "TL" if nums.len() == 1 => leading = nums[0],
            "T*" => line_y -= leading,
            "Tj" | "TJ" | "'" | "\"" => {
                if op.operator != "Tj" && op.operator != "TJ" {
                    line_y -= leading;
                }
                let mut text = String::new();
                if let Some(last) = op.operands.last() {
                    text_of(last, &mut text);
                }
                let text = text.trim().to_string();
                if !text.is_empty() {
                    boxes.push(TextBox {
                        page,
                        x: line_x,
                        y: line_y,
                        text,
                    });
                }
            }
            _ => {}
        }
    }
    boxes
}
