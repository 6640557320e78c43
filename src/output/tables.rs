use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::stages::results::{FAIL, PASS};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

/// Green for `pass`, red for `fail`, yellow for anything else (`error`, `info`, ...).
pub fn result_cell(result: &str) -> Cell {
    let cell = Cell::new(result);
    match result {
        PASS => cell.fg(TableColor::Green),
        FAIL => cell.fg(TableColor::Red),
        _ => cell.fg(TableColor::Yellow),
    }
}

pub fn status_cell(status: i32) -> Cell {
    if status == 0 {
        Cell::new("ok").fg(TableColor::Green)
    } else {
        Cell::new(format!("failed ({status})")).fg(TableColor::Red)
    }
}
