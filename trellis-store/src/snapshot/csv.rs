// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal comma-separated values reader and writer.
//!
//! Fields containing commas, double quotes or line breaks are wrapped in double quotes, inner
//! double quotes are doubled.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("unterminated quoted field starting on line {0}")]
    UnterminatedQuote(usize),

    #[error("unexpected character after closing quote on line {0}")]
    TrailingAfterQuote(usize),
}

impl CsvError {
    pub fn line(&self) -> usize {
        match self {
            CsvError::UnterminatedQuote(line) | CsvError::TrailingAfterQuote(line) => *line,
        }
    }
}

/// One parsed row together with the line it started on (1-based).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub line: usize,
    pub fields: Vec<String>,
}

pub fn write_row<S: AsRef<str>>(out: &mut String, fields: &[S]) {
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_field(out, field.as_ref());
    }
    out.push('\n');
}

fn write_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Parse all rows of a document. Empty lines are skipped.
pub fn parse(text: &str) -> Result<Vec<Row>, CsvError> {
    let mut rows = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while chars.peek().is_some() {
        let row_line = line;
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut quoted = false;

        loop {
            match chars.next() {
                None => {
                    fields.push(std::mem::take(&mut field));
                    break;
                }
                Some('"') if field.is_empty() && !quoted => {
                    quoted = true;
                    let quote_line = line;
                    loop {
                        match chars.next() {
                            None => return Err(CsvError::UnterminatedQuote(quote_line)),
                            Some('"') if chars.peek() == Some(&'"') => {
                                chars.next();
                                field.push('"');
                            }
                            Some('"') => break,
                            Some(c) => {
                                if c == '\n' {
                                    line += 1;
                                }
                                field.push(c);
                            }
                        }
                    }
                    if !matches!(chars.peek(), None | Some(',') | Some('\n') | Some('\r')) {
                        return Err(CsvError::TrailingAfterQuote(line));
                    }
                }
                Some(',') => {
                    fields.push(std::mem::take(&mut field));
                    quoted = false;
                }
                Some('\r') if chars.peek() == Some(&'\n') => (),
                Some('\n') => {
                    line += 1;
                    fields.push(std::mem::take(&mut field));
                    break;
                }
                Some(c) => field.push(c),
            }
        }

        let blank = fields.len() == 1 && fields[0].is_empty() && !quoted;
        if !blank {
            rows.push(Row {
                line: row_line,
                fields,
            });
        }
    }

    Ok(rows)
}
