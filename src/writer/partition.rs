//! Partition layout.
//!
//! `<root>/<YYYY>/<MM>/<DD>[/<HH>]/model=<model>/part.jsonl.gz`
//!
//! The directory is a pure function of `(ts, model, partitioning)`. Rotated
//! segments of one partition live side by side as `part-00001.jsonl.gz`,
//! `part-00002.jsonl.gz`, ...

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Timelike};

use crate::config::Partitioning;
use crate::time::Timestamp;

const SEGMENT_STEM: &str = "part";
const SEGMENT_EXT: &str = ".jsonl.gz";

/// Directory holding the segments of the partition for `(ts, model)`.
#[must_use]
pub fn partition_dir(root: &Path, ts: &Timestamp, model: &str, partitioning: Partitioning) -> PathBuf {
    let mut dir = root.to_path_buf();
    dir.push(format!("{:04}", ts.year()));
    dir.push(format!("{:02}", ts.month()));
    dir.push(format!("{:02}", ts.day()));
    if partitioning == Partitioning::Hourly {
        dir.push(format!("{:02}", ts.hour()));
    }
    dir.push(format!("model={}", encode_model(model)));
    dir
}

/// Makes a model id safe to use as one path component.
///
/// Path separators, `%` and control characters are percent-encoded, so two
/// distinct model ids never map to the same directory.
#[must_use]
pub fn encode_model(model: &str) -> String {
    let mut out = String::with_capacity(model.len());
    for c in model.chars() {
        if matches!(c, '/' | '\\' | '%' | ':') || c.is_control() {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "%{b:02X}");
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// File name of segment `seq` within a partition.
#[must_use]
pub fn segment_file_name(seq: u32) -> String {
    if seq == 0 {
        format!("{SEGMENT_STEM}{SEGMENT_EXT}")
    } else {
        format!("{SEGMENT_STEM}-{seq:05}{SEGMENT_EXT}")
    }
}

/// Inverse of `segment_file_name`.
#[must_use]
pub fn parse_segment_seq(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(SEGMENT_EXT)?;
    if stem == SEGMENT_STEM {
        return Some(0);
    }
    let digits = stem.strip_prefix(SEGMENT_STEM)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_timestamp;

    #[test]
    fn daily_layout() {
        let ts = parse_timestamp("2024-06-01T13:45:00").unwrap();
        let dir = partition_dir(Path::new("/data"), &ts, "m", Partitioning::Daily);
        assert_eq!(dir, PathBuf::from("/data/2024/06/01/model=m"));
    }

    #[test]
    fn hourly_layout_adds_hour() {
        let ts = parse_timestamp("2024-06-01T03:45:00").unwrap();
        let dir = partition_dir(Path::new("/data"), &ts, "m", Partitioning::Hourly);
        assert_eq!(dir, PathBuf::from("/data/2024/06/01/03/model=m"));
    }

    #[test]
    fn uses_wall_clock_of_offset_timestamps() {
        let ts = parse_timestamp("2024-06-01T23:30:00-05:00").unwrap();
        let dir = partition_dir(Path::new("/data"), &ts, "m", Partitioning::Hourly);
        assert_eq!(dir, PathBuf::from("/data/2024/06/01/23/model=m"));
    }

    #[test]
    fn same_keys_same_dir_different_keys_differ() {
        let a = parse_timestamp("2024-06-01T01:00:00").unwrap();
        let b = parse_timestamp("2024-06-01T22:00:00").unwrap();
        let root = Path::new("/r");
        assert_eq!(
            partition_dir(root, &a, "m", Partitioning::Daily),
            partition_dir(root, &b, "m", Partitioning::Daily)
        );
        assert_ne!(
            partition_dir(root, &a, "m", Partitioning::Hourly),
            partition_dir(root, &b, "m", Partitioning::Hourly)
        );
        assert_ne!(
            partition_dir(root, &a, "m", Partitioning::Daily),
            partition_dir(root, &a, "n", Partitioning::Daily)
        );
    }

    #[test]
    fn model_encoding_is_injective_for_separators() {
        assert_eq!(encode_model("openai/gpt-4o"), "openai%2Fgpt-4o");
        assert_ne!(encode_model("a/b"), encode_model("a%2Fb"));
        assert_eq!(encode_model("llama3:8b"), "llama3%3A8b");
    }

    #[test]
    fn segment_names_round_trip() {
        assert_eq!(segment_file_name(0), "part.jsonl.gz");
        assert_eq!(segment_file_name(7), "part-00007.jsonl.gz");
        assert_eq!(parse_segment_seq("part.jsonl.gz"), Some(0));
        assert_eq!(parse_segment_seq("part-00007.jsonl.gz"), Some(7));
        assert_eq!(parse_segment_seq("part-.jsonl.gz"), None);
        assert_eq!(parse_segment_seq("other.jsonl.gz"), None);
        assert_eq!(parse_segment_seq("part.jsonl"), None);
    }
}
