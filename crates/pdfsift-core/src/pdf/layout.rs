use lopdf::content::Operation;
use lopdf::{Document, Object, ObjectId};

use crate::error::{CoreError, Result};

/// Kerning adjustments in a `TJ` array larger than this (thousandths of an
/// em) are treated as word gaps.
const TJ_SPACE_THRESHOLD: f32 = 200.0;

/// A string drawn at one text position.
///
/// Coordinates are in unscaled text space: only translations from `Td`,
/// `TD`, `Tm` and `T*` are tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub x: f32,
    pub y: f32,
    pub text: String,
}

impl TextRun {
    pub fn new(x: f32, y: f32, text: impl Into<String>) -> Self {
        Self {
            x,
            y,
            text: text.into(),
        }
    }
}

/// Decode a page's content stream and collect its positioned text runs.
pub fn page_text_runs(doc: &Document, page_id: ObjectId) -> Result<Vec<TextRun>> {
    let content = doc
        .get_and_decode_page_content(page_id)
        .map_err(|e| CoreError::Pdf(format!("decode page content: {e}")))?;
    Ok(runs_from_operations(&content.operations))
}

#[derive(Default)]
struct TextState {
    line_x: f32,
    line_y: f32,
    leading: f32,
    /// Set while consecutive show operators draw at the same position.
    open: bool,
}

impl TextState {
    fn move_line(&mut self, dx: f32, dy: f32) {
        self.line_x += dx;
        self.line_y += dy;
        self.open = false;
    }

    fn next_line(&mut self) {
        let leading = self.leading;
        self.move_line(0.0, -leading);
    }
}

/// Replay text operators and emit one run per text position.
pub fn runs_from_operations(operations: &[Operation]) -> Vec<TextRun> {
    let mut runs: Vec<TextRun> = Vec::new();
    let mut state = TextState::default();

    for op in operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "BT" => {
                state.line_x = 0.0;
                state.line_y = 0.0;
                state.open = false;
            }
            "ET" => state.open = false,
            "TL" => {
                if let Some(leading) = number(operands, 0) {
                    state.leading = leading;
                }
            }
            "Td" => {
                if let (Some(dx), Some(dy)) = (number(operands, 0), number(operands, 1)) {
                    state.move_line(dx, dy);
                }
            }
            "TD" => {
                if let (Some(dx), Some(dy)) = (number(operands, 0), number(operands, 1)) {
                    state.leading = -dy;
                    state.move_line(dx, dy);
                }
            }
            "Tm" => {
                if let (Some(e), Some(f)) = (number(operands, 4), number(operands, 5)) {
                    state.line_x = e;
                    state.line_y = f;
                    state.open = false;
                }
            }
            "T*" => state.next_line(),
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    show(&mut runs, &mut state, &decode_pdf_string(bytes));
                }
            }
            "'" => {
                state.next_line();
                if let Some(Object::String(bytes, _)) = operands.first() {
                    show(&mut runs, &mut state, &decode_pdf_string(bytes));
                }
            }
            "\"" => {
                state.next_line();
                if let Some(Object::String(bytes, _)) = operands.get(2) {
                    show(&mut runs, &mut state, &decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    let text = decode_tj_array(items);
                    show(&mut runs, &mut state, &text);
                }
            }
            _ => {}
        }
    }

    runs.retain(|run| !run.text.trim().is_empty());
    runs
}

fn show(runs: &mut Vec<TextRun>, state: &mut TextState, text: &str) {
    if text.is_empty() {
        return;
    }
    if state.open {
        if let Some(last) = runs.last_mut() {
            last.text.push_str(text);
            return;
        }
    }
    runs.push(TextRun::new(state.line_x, state.line_y, text));
    state.open = true;
}

fn number(operands: &[Object], index: usize) -> Option<f32> {
    operands.get(index).and_then(as_number)
}

pub(crate) fn as_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(f) => Some(*f),
        _ => None,
    }
}

fn decode_tj_array(items: &[Object]) -> String {
    let mut text = String::new();
    for item in items {
        match item {
            Object::String(bytes, _) => text.push_str(&decode_pdf_string(bytes)),
            other => {
                if let Some(adjust) = as_number(other) {
                    if adjust < -TJ_SPACE_THRESHOLD && !text.ends_with(' ') {
                        text.push(' ');
                    }
                }
            }
        }
    }
    text
}

/// Decode a string operand: UTF-16BE when it carries a byte-order mark,
/// otherwise one byte per character.
pub(crate) fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Render runs as plain text, one line per baseline, top to bottom.
pub fn runs_to_text(runs: &[TextRun]) -> String {
    super::tables::group_rows(runs)
        .iter()
        .map(|row| {
            row.iter()
                .map(|run| run.text.trim())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::StringFormat;

    fn op(operator: &str, operands: Vec<Object>) -> Operation {
        Operation::new(operator, operands)
    }

    fn int(i: i64) -> Object {
        Object::Integer(i)
    }

    fn lit(s: &str) -> Object {
        Object::String(s.as_bytes().to_vec(), StringFormat::Literal)
    }

    #[test]
    fn test_td_positions_accumulate() {
        let ops = vec![
            op("BT", vec![]),
            op("Td", vec![int(72), int(700)]),
            op("Tj", vec![lit("first")]),
            op("Td", vec![int(0), int(-14)]),
            op("Tj", vec![lit("second")]),
            op("ET", vec![]),
        ];
        let runs = runs_from_operations(&ops);
        assert_eq!(
            runs,
            vec![
                TextRun::new(72.0, 700.0, "first"),
                TextRun::new(72.0, 686.0, "second"),
            ]
        );
    }

    #[test]
    fn test_consecutive_shows_join_one_run() {
        let ops = vec![
            op("BT", vec![]),
            op("Tm", vec![int(1), int(0), int(0), int(1), int(50), int(500)]),
            op("Tj", vec![lit("Hel")]),
            op("Tj", vec![lit("lo")]),
            op("ET", vec![]),
        ];
        let runs = runs_from_operations(&ops);
        assert_eq!(runs, vec![TextRun::new(50.0, 500.0, "Hello")]);
    }

    #[test]
    fn test_leading_and_quote_operators() {
        let ops = vec![
            op("BT", vec![]),
            op("TD", vec![int(10), int(-12)]),
            op("Tj", vec![lit("a")]),
            op("'", vec![lit("b")]),
            op("T*", vec![]),
            op("\"", vec![int(0), int(0), lit("c")]),
            op("ET", vec![]),
        ];
        let runs = runs_from_operations(&ops);
        let ys: Vec<f32> = runs.iter().map(|r| r.y).collect();
        assert_eq!(ys, vec![-12.0, -24.0, -48.0]);
        assert!(runs.iter().all(|r| r.x == 10.0));
    }

    #[test]
    fn test_tj_array_word_gaps() {
        let ops = vec![
            op("BT", vec![]),
            op(
                "TJ",
                vec![Object::Array(vec![
                    lit("Total"),
                    int(-250),
                    lit("due"),
                    int(-30),
                    lit("!"),
                ])],
            ),
            op("ET", vec![]),
        ];
        let runs = runs_from_operations(&ops);
        assert_eq!(runs[0].text, "Total due!");
    }

    #[test]
    fn test_whitespace_runs_dropped() {
        let ops = vec![
            op("BT", vec![]),
            op("Tj", vec![lit("   ")]),
            op("ET", vec![]),
        ];
        assert!(runs_from_operations(&ops).is_empty());
    }

    #[test]
    fn test_decode_utf16_string() {
        let bytes = [0xFE, 0xFF, 0x00, 0x48, 0x00, 0xE9];
        assert_eq!(decode_pdf_string(&bytes), "Hé");
        assert_eq!(decode_pdf_string(b"plain"), "plain");
    }

    #[test]
    fn test_runs_to_text_orders_lines() {
        let runs = vec![
            TextRun::new(72.0, 600.0, "bottom"),
            TextRun::new(150.0, 700.0, "right"),
            TextRun::new(72.0, 700.0, "left"),
        ];
        assert_eq!(runs_to_text(&runs), "left right\nbottom");
    }
}
