//! Error -> fix sequence detection over an execution log.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::hashing::truncate_at_char_boundary;
use crate::core::types::ExecutionRecord;

/// Tool names that can close an error sequence when they succeed.
pub const FIX_TOOLS: &[&str] = &[
    "edit",
    "edit_file",
    "str_replace",
    "write",
    "write_file",
    "bash",
    "shell",
    "run_command",
    "commit",
    "git_commit",
];

const ERROR_TEXT_LIMIT: usize = 500;

static ERROR_OUTPUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(\berror\b[:\[]|\bexception\b|",
        r"traceback \(most recent call last\)|\bfailed\b|panicked at)",
    ))
    .unwrap()
});

pub fn is_fix_tool(tool_name: &str) -> bool {
    let name = tool_name.trim().to_ascii_lowercase();
    FIX_TOOLS.contains(&name.as_str())
}

/// Explicit error, non-zero exit, or a recognizable failure in output.
pub fn has_error(record: &ExecutionRecord) -> bool {
    record
        .error
        .as_deref()
        .is_some_and(|err| !err.trim().is_empty())
        || record.exit_code.is_some_and(|code| code != 0)
        || ERROR_OUTPUT_RE.is_match(&record.output)
}

pub fn is_fix(record: &ExecutionRecord) -> bool {
    is_fix_tool(&record.tool_name) && record.exit_code.unwrap_or(0) == 0 && !has_error(record)
}

/// A closed run of records from the first error through the fixing record.
#[derive(Debug, Clone, Copy)]
pub struct ErrorSequence<'a> {
    pub records: &'a [ExecutionRecord],
}

impl<'a> ErrorSequence<'a> {
    pub fn error_record(&self) -> &'a ExecutionRecord {
        &self.records[0]
    }

    pub fn fix_record(&self) -> &'a ExecutionRecord {
        &self.records[self.records.len() - 1]
    }

    /// Files touched anywhere in the sequence, first-seen order.
    pub fn files_touched(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for file in self.records.iter().flat_map(|r| r.files_touched.iter()) {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        files
    }
}

/// Sequences that never see a fix, or are shorter than two records, are dropped.
pub fn extract_sequences(records: &[ExecutionRecord]) -> Vec<ErrorSequence<'_>> {
    let mut sequences = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, record) in records.iter().enumerate() {
        match open {
            None => {
                if has_error(record) {
                    open = Some(idx);
                }
            }
            Some(start) => {
                if is_fix(record) {
                    if idx - start + 1 >= 2 {
                        sequences.push(ErrorSequence {
                            records: &records[start..=idx],
                        });
                    }
                    open = None;
                }
            }
        }
    }
    sequences
}

/// Best human-readable error text for a record.
pub fn error_text(record: &ExecutionRecord) -> String {
    if let Some(err) = record.error.as_deref()
        && !err.trim().is_empty()
    {
        return truncate_at_char_boundary(err.trim(), ERROR_TEXT_LIMIT).to_string();
    }
    if let Some(line) = record
        .output
        .lines()
        .find(|line| ERROR_OUTPUT_RE.is_match(line))
    {
        return truncate_at_char_boundary(line.trim(), ERROR_TEXT_LIMIT).to_string();
    }
    match record.exit_code {
        Some(code) if code != 0 => format!("{} exited with code {code}", record.tool_name),
        _ => truncate_at_char_boundary(record.output.trim(), ERROR_TEXT_LIMIT).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{error_record, fix_record, read_record};

    #[test]
    fn detects_errors_from_each_signal() {
        assert!(has_error(&error_record("t", "boom")));
        let mut record = read_record("t", "cargo test");
        record.exit_code = Some(101);
        assert!(has_error(&record));
        let mut record = read_record("t", "pytest");
        record.output = "Traceback (most recent call last):\n  ...".to_string();
        assert!(has_error(&record));
        assert!(!has_error(&read_record("t", "src/lib.rs")));
    }

    #[test]
    fn fix_requires_fix_tool_and_clean_result() {
        assert!(is_fix(&fix_record("t", "src/lib.rs")));
        assert!(!is_fix(&read_record("t", "src/lib.rs")));
        let mut failed = fix_record("t", "src/lib.rs");
        failed.exit_code = Some(1);
        assert!(!is_fix(&failed));
    }

    #[test]
    fn sequence_stays_open_through_investigation() {
        let log = vec![
            error_record("t", "ModuleNotFoundError: no module named foo"),
            read_record("t", "requirements.txt"),
            fix_record("t", "requirements.txt"),
        ];
        let sequences = extract_sequences(&log);
        assert_eq!(sequences.len(), 1);
        assert_eq!(sequences[0].records.len(), 3);
        assert_eq!(sequences[0].fix_record().tool_name, "edit_file");
    }

    #[test]
    fn unfixed_errors_are_discarded() {
        let log = vec![
            error_record("t", "boom"),
            read_record("t", "src/lib.rs"),
        ];
        assert!(extract_sequences(&log).is_empty());
    }

    #[test]
    fn finds_multiple_sequences() {
        let log = vec![
            fix_record("t", "a.py"),
            error_record("t", "first"),
            fix_record("t", "a.py"),
            error_record("t", "second"),
            error_record("t", "second again"),
            fix_record("t", "b.py"),
        ];
        let sequences = extract_sequences(&log);
        assert_eq!(sequences.len(), 2);
        assert_eq!(error_text(sequences[1].error_record()), "second");
        assert_eq!(sequences[1].files_touched(), vec!["b.py".to_string()]);
    }

    #[test]
    fn error_text_prefers_matching_output_line() {
        let mut record = read_record("t", "make");
        record.output = "building\nerror: linker failed\ndone".to_string();
        assert_eq!(error_text(&record), "error: linker failed");
    }
}
