use prettytable::{self, format, row, Cell, Row};

use crate::runtime::ValidationRecord;
use crate::utils::join_into_string;

/// Build a table with one row per validated assignment and one column per output.
pub fn verdict_table(records: &[ValidationRecord], color: bool) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    let mut titles = row!["#", "Ranks", "Dims"];
    if let Some(first) = records.first() {
        for verdict in &first.verdicts {
            titles.add_cell(Cell::new(&verdict.name));
        }
    }
    table.set_titles(titles);

    for (i, record) in records.iter().enumerate() {
        let dims = record
            .dims
            .iter()
            .map(|(name, dims)| format!("{name}=[{}]", join_into_string(dims, ",")));
        let mut r = Row::new(vec![
            Cell::new(&i.to_string()),
            Cell::new(&record.ranks.to_string()),
            Cell::new(&join_into_string(dims, " ")),
        ]);
        for verdict in &record.verdicts {
            let (text, style) = if verdict.equal {
                ("PASS", "Fgb")
            } else {
                ("FAIL", "Frb")
            };
            let cell = Cell::new(text);
            r.add_cell(if color { cell.style_spec(style) } else { cell });
        }
        table.add_row(r);
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

pub fn pprint(records: &[ValidationRecord], color: bool) {
    verdict_table(records, color).printstd();
}
