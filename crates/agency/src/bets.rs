//! Bet loading from the agency's CSV file.
//!
//! One bet per line: `first name,last name,document,birth date,number`.
//! The agency id is not in the file; it comes from configuration.
//!
//! Fields may be double-quoted to hold commas, with `""` for a literal quote.
//! A quoted field cannot span lines.

use std::io;
use std::path::{Path, PathBuf};

use crate::wire::protocol::Bet;

pub const CSV_FIELDS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: expected {} fields, got {found}", CSV_FIELDS)]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: bet number '{number}' is not numeric")]
    InvalidNumber { line: usize, number: String },
    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote { line: usize },
}

/// Split one CSV line into fields, honouring double quotes.
fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::with_capacity(CSV_FIELDS);
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if field.is_empty() => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    if quoted {
        return None;
    }
    fields.push(field);
    Some(fields)
}

pub fn load_bets(path: &Path, agency: &str) -> Result<Vec<Bet>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let bets = parse_bets(&content, agency)?;
    tracing::info!(agency, path = %path.display(), count = bets.len(), "Loaded bets");
    Ok(bets)
}

pub fn parse_bets(content: &str, agency: &str) -> Result<Vec<Bet>, LoadError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let line_number = i + 1;
            let fields = split_fields(line).ok_or(LoadError::UnterminatedQuote {
                line: line_number,
            })?;
            let [first, last, document, birth, number] = fields.as_slice() else {
                return Err(LoadError::FieldCount {
                    line: line_number,
                    found: fields.len(),
                });
            };
            let bet = Bet::new(
                agency,
                first.as_str(),
                last.as_str(),
                document.as_str(),
                birth.as_str(),
                number.as_str(),
            );
            if bet.number_value().is_none() {
                return Err(LoadError::InvalidNumber {
                    line: line_number,
                    number: number.clone(),
                });
            }
            Ok(bet)
        })
        .collect()
}
