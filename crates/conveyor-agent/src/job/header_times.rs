use std::collections::BTreeMap;

use chrono::Utc;
use regex::Regex;

use super::rfc3339_nanos;

/// Lines longer than this are never considered header markers.
const MAX_HEADER_LINE_LEN: usize = 500;

/// Pattern a log line must match to be tagged as a section header.
const HEADER_PATTERN: &str = r"^(?:---|\+\+\+|~~~)\s(.+)?$";

/// Watches the raw log stream for section-header markers and records when
/// each one scrolled past, keyed by line index.
///
/// The scanner works on bytes as they arrive; lines may be split across
/// calls. Over-long lines are discarded rather than buffered, so a job
/// that emits one enormous line cannot balloon memory here.
#[derive(Debug)]
pub struct HeaderScanner {
    pattern: Regex,
    line: Vec<u8>,
    line_index: usize,
    overflow: bool,
    times: BTreeMap<usize, String>,
}

impl Default for HeaderScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderScanner {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(HEADER_PATTERN).expect("header pattern compiles"),
            line: Vec::new(),
            line_index: 0,
            overflow: false,
            times: BTreeMap::new(),
        }
    }

    pub fn scan(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.end_line();
            } else if !self.overflow {
                if self.line.len() >= MAX_HEADER_LINE_LEN {
                    self.overflow = true;
                    self.line.clear();
                } else {
                    self.line.push(byte);
                }
            }
        }
    }

    /// Consume the scanner, flushing any trailing unterminated line.
    pub fn finish(mut self) -> BTreeMap<usize, String> {
        if !self.line.is_empty() || self.overflow {
            self.end_line();
        }
        self.times
    }

    fn end_line(&mut self) {
        if !self.overflow {
            let mut line = String::from_utf8_lossy(&self.line).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if self.pattern.is_match(&line) {
                self.times
                    .insert(self.line_index, rfc3339_nanos(Utc::now()));
            }
        }
        self.line_index += 1;
        self.overflow = false;
        self.line.clear();
    }
}
