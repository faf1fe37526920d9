//! Reads `.conf` formatted files.
//!
//! The format is line based: `#` starts a comment, assignments are
//! `name = value`, `\r` counts as ordinary whitespace (only `\n` terminates
//! a line), and whitespace around names and values is trimmed. Duplicate
//! names are allowed; lookups return the last occurrence. Lines longer than
//! 32 KiB are dropped with a warning.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::Result;

/// Longest accepted line in bytes; longer lines are dropped.
pub const MAX_LINE_LENGTH: usize = 32 * 1024;

/// Problems encountered while reading a file.
///
/// Warnings do not abort the read; the offending line is kept as raw text
/// (or dropped entirely for [`LineTooLong`](Self::LineTooLong)) and parsing
/// continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfFileWarning {
    /// A non-comment line has no `=` separator.
    EqualSignMissing,
    /// An assignment has an empty name.
    NameMissing,
    /// A line exceeded [`MAX_LINE_LENGTH`] and was dropped.
    LineTooLong,
}

/// Callback invoked for each warning: kind, 1-based line number, raw line.
pub type ConfFileWarningFn<'a> = &'a mut dyn FnMut(ConfFileWarning, usize, &str);

#[derive(Debug)]
struct ConfFileLine {
    name: Option<String>,
    value: Option<String>,
}

/// An in-memory `.conf` file.
#[derive(Debug)]
pub struct ConfFile {
    lines: Vec<ConfFileLine>,
}

fn is_conf_space(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r'
}

impl ConfFile {
    /// Read and parse a `.conf` file.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`](crate::ErrorKind) if the file does
    /// not exist, [`ErrorKind::Io`](crate::ErrorKind) for other read
    /// failures. Malformed lines produce warnings, not errors.
    pub fn read<P: AsRef<Path>>(path: P, mut warning: Option<ConfFileWarningFn<'_>>) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut raw = String::new();
        let mut number = 0;

        loop {
            raw.clear();
            number += 1;

            if reader.read_line(&mut raw)? == 0 {
                break;
            }

            let trimmed_raw = raw.strip_suffix('\n').unwrap_or(&raw);

            if trimmed_raw.len() > MAX_LINE_LENGTH {
                if let Some(warning) = warning.as_mut() {
                    warning(ConfFileWarning::LineTooLong, number, trimmed_raw);
                }

                continue;
            }

            lines.push(Self::parse_line(trimmed_raw, number, warning.as_mut()));
        }

        Ok(Self { lines })
    }

    fn parse_line(
        raw: &str,
        number: usize,
        warning: Option<&mut ConfFileWarningFn<'_>>,
    ) -> ConfFileLine {
        let content = raw.trim_start_matches(is_conf_space);

        // Empty lines and comments carry no assignment.
        if content.is_empty() || content.starts_with('#') {
            return ConfFileLine {
                name: None,
                value: None,
            };
        }

        let Some((name, value)) = content.split_once('=') else {
            if let Some(warning) = warning {
                warning(ConfFileWarning::EqualSignMissing, number, raw);
            }

            return ConfFileLine {
                name: None,
                value: None,
            };
        };

        let name = name.trim_matches(is_conf_space);

        if name.is_empty() {
            if let Some(warning) = warning {
                warning(ConfFileWarning::NameMissing, number, raw);
            }

            return ConfFileLine {
                name: None,
                value: None,
            };
        }

        let value = value.trim_matches(is_conf_space);

        ConfFileLine {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    /// Look up the value of `name`, case-insensitively.
    ///
    /// When the file assigns the same name more than once, the last
    /// occurrence wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .find(|line| {
                line.name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .and_then(|line| line.value.as_deref())
    }

    /// Iterate over all assignments in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| {
            match (line.name.as_deref(), line.value.as_deref()) {
                (Some(name), Some(value)) => Some((name, value)),
                _ => None,
            }
        })
    }
}
