use super::layout::TextRun;
use crate::schema::Table;

/// Runs whose baselines differ by at most this much share a row.
const ROW_TOLERANCE: f32 = 3.0;
/// Cells in the same column may start this far apart.
const COLUMN_TOLERANCE: f32 = 6.0;
const MIN_ROWS: usize = 2;
const MIN_COLUMNS: usize = 2;

/// Group runs into rows, top of the page first, each row sorted left to right.
pub(crate) fn group_rows(runs: &[TextRun]) -> Vec<Vec<&TextRun>> {
    let mut sorted: Vec<&TextRun> = runs.iter().collect();
    sorted.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));

    let mut rows: Vec<Vec<&TextRun>> = Vec::new();
    let mut row_y = f32::NAN;
    for run in sorted {
        if (row_y - run.y).abs() <= ROW_TOLERANCE {
            if let Some(row) = rows.last_mut() {
                row.push(run);
                continue;
            }
        }
        row_y = run.y;
        rows.push(vec![run]);
    }

    for row in &mut rows {
        row.sort_by(|a, b| a.x.total_cmp(&b.x));
    }
    rows
}

fn columns_align(a: &[&TextRun], b: &[&TextRun]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| (x.x - y.x).abs() <= COLUMN_TOLERANCE)
}

/// Find grid-like blocks: consecutive rows with the same number of cells
/// whose left edges line up.
pub fn detect_tables(runs: &[TextRun]) -> Vec<Table> {
    let rows = group_rows(runs);
    let mut tables = Vec::new();

    let mut i = 0;
    while i < rows.len() {
        if rows[i].len() < MIN_COLUMNS {
            i += 1;
            continue;
        }

        let mut end = i + 1;
        while end < rows.len() && columns_align(&rows[i], &rows[end]) {
            end += 1;
        }

        if end - i >= MIN_ROWS {
            let table: Table = rows[i..end]
                .iter()
                .map(|row| row.iter().map(|run| run.text.trim().to_string()).collect())
                .collect();
            tables.push(table);
            i = end;
        } else {
            i += 1;
        }
    }

    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(x: f32, y: f32, text: &str) -> TextRun {
        TextRun::new(x, y, text)
    }

    #[test]
    fn test_group_rows_tolerates_baseline_jitter() {
        let runs = vec![
            run(200.0, 699.0, "b"),
            run(72.0, 700.5, "a"),
            run(72.0, 650.0, "c"),
        ];
        let rows = group_rows(&runs);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].iter().map(|r| r.text.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(rows[1][0].text, "c");
    }

    #[test]
    fn test_detects_single_table() {
        let runs = vec![
            run(72.0, 720.0, "Quarterly figures"),
            run(72.0, 700.0, "Region"),
            run(200.0, 700.0, "Sales"),
            run(72.0, 686.0, "North"),
            run(201.0, 686.0, "120"),
            run(72.0, 672.0, "South"),
            run(199.0, 672.0, "95"),
            run(72.0, 640.0, "Closing paragraph."),
        ];
        let tables = detect_tables(&runs);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].len(), 3);
        assert_eq!(tables[0][0], vec!["Region", "Sales"]);
        assert_eq!(tables[0][2], vec!["South", "95"]);
    }

    #[test]
    fn test_prose_is_not_a_table() {
        let runs = vec![
            run(72.0, 700.0, "A single line of text."),
            run(72.0, 686.0, "Another single line."),
        ];
        assert!(detect_tables(&runs).is_empty());
    }

    #[test]
    fn test_lone_multi_cell_row_is_not_a_table() {
        let runs = vec![
            run(72.0, 700.0, "Name:"),
            run(150.0, 700.0, "Alice"),
            run(72.0, 686.0, "Plain text follows"),
        ];
        assert!(detect_tables(&runs).is_empty());
    }

    #[test]
    fn test_misaligned_columns_split_tables() {
        let runs = vec![
            run(72.0, 700.0, "a"),
            run(150.0, 700.0, "b"),
            run(72.0, 686.0, "c"),
            run(150.0, 686.0, "d"),
            run(72.0, 600.0, "x"),
            run(300.0, 600.0, "y"),
            run(400.0, 600.0, "z"),
            run(72.0, 586.0, "1"),
            run(300.0, 586.0, "2"),
            run(400.0, 586.0, "3"),
        ];
        let tables = detect_tables(&runs);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].len(), 2);
        assert_eq!(tables[1][1], vec!["1", "2", "3"]);
    }
}
