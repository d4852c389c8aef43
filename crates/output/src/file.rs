use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use td_protocol::RecordSink;

/// Append-only record file. Each line is flushed as it is written so a
/// `tail -f` on the output sees records the moment passes decode.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Open (or create) the output file for appending.
    pub fn open(path: &Path) -> Result<Self, String> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("failed to open output file {}: {}", path.display(), e))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for FileSink {
    fn append(&mut self, line: &str) -> Result<(), String> {
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| format!("failed to write record: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_lines() {
        let path = std::env::temp_dir().join(format!("td-output-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut sink = FileSink::open(&path).unwrap();
            sink.append("{\"decoded\":false}").unwrap();
            sink.append("{\"passHeader\":5}").unwrap();
        }
        {
            // Reopening appends rather than truncating.
            let mut sink = FileSink::open(&path).unwrap();
            sink.append("{\"passHeader\":6}").unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec!["{\"decoded\":false}", "{\"passHeader\":5}", "{\"passHeader\":6}"]
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unreachable_path_is_an_error() {
        let path = Path::new("/nonexistent-dir/records.json");
        assert!(FileSink::open(path).is_err());
    }
}
