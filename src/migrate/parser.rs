/// Parsing for migration tool text output.
///
/// Two status formats are accepted and normalise identically: the
/// pipe-delimited table (`| Ran? | Migration | Batch |`) and the bracketed
/// plain-text form (`[Ran] name` / `[Pending] name`). Both may carry ANSI
/// escape sequences.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMigration {
    pub name: String,
    pub ran: bool,
    pub batch: Option<u32>,
}

/// Remove ANSI CSI/escape sequences (`ESC [ ... <final byte>` and the
/// two-byte `ESC <char>` forms).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameters/intermediates end at a byte in 0x40..=0x7e
                for f in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&f) {
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Parse status output in either accepted format.
pub fn parse_status(output: &str) -> Vec<ParsedMigration> {
    let clean = strip_ansi(output);
    let mut entries = Vec::new();
    for raw_line in clean.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('|') {
            if let Some(entry) = parse_table_row(line) {
                entries.push(entry);
            }
        } else if let Some(entry) = parse_bracket_line(line) {
            entries.push(entry);
        }
    }
    entries
}

/// `| Yes | 0003_create_catalog | 1 |` — header and separator rows are
/// skipped by the Ran?-cell check.
fn parse_table_row(line: &str) -> Option<ParsedMigration> {
    let cells: Vec<&str> = line
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .collect();
    if cells.len() < 2 {
        return None;
    }
    let ran = match cells[0] {
        "Yes" | "Y" => true,
        "No" | "N" => false,
        _ => return None, // header, separator, or decoration
    };
    let name = cells[1];
    if name.is_empty() {
        return None;
    }
    let batch = cells.get(2).and_then(|c| c.parse::<u32>().ok());
    Some(ParsedMigration {
        name: name.to_string(),
        ran,
        batch,
    })
}

/// `[Ran] name` / `[Pending] name`, an optional `(batch N)` suffix.
fn parse_bracket_line(line: &str) -> Option<ParsedMigration> {
    let rest = line.strip_prefix('[')?;
    let (tag, after) = rest.split_once(']')?;
    let ran = match tag.trim() {
        "Ran" => true,
        "Pending" => false,
        _ => return None,
    };
    let after = after.trim();
    if after.is_empty() {
        return None;
    }
    let (name, batch) = match after.rsplit_once("(batch ") {
        Some((name, tail)) => {
            let batch = tail.trim_end_matches(')').trim().parse::<u32>().ok();
            (name.trim(), batch)
        }
        None => (after, None),
    };
    Some(ParsedMigration {
        name: name.to_string(),
        ran,
        batch,
    })
}

/// Count applied migrations in apply output by its per-migration `DONE`
/// markers. The embedded runner also reports this count structurally; the
/// textual count exists for output captured from an external tool.
pub fn applied_count(output: &str) -> usize {
    strip_ansi(output)
        .lines()
        .filter(|line| line.trim_end().ends_with("DONE"))
        .count()
}
