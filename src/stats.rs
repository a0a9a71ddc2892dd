//! Statistics window counters and the table rendering for their periodic emission.

/// OUT-side counters for one statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutWindow {
    pub sent: u32,
    pub acks_received: u32,
    pub rtt_total_micros: u64,
    pub rtt_max_micros: u64,
}

/// IN-side counters for one statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InWindow {
    pub received: u32,
    pub acks_sent: u32,
}

/// Renders rows of cells as a bordered ASCII table. The first row is treated as the
///  header and separated from the body.
pub fn render_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut border = String::from("+");
    for width in &widths {
        border.push_str(&"-".repeat(width + 2));
        border.push('+');
    }
    border.push('\n');

    let mut out = String::new();
    out.push_str(&border);
    for (n, row) in rows.iter().enumerate() {
        out.push('|');
        for (i, width) in widths.iter().enumerate() {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            out.push_str(&format!(" {:<w$} |", cell, w = *width));
        }
        out.push('\n');
        if n == 0 {
            out.push_str(&border);
        }
    }
    out.push_str(&border);
    out
}
