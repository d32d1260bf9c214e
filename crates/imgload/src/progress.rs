//! Per-layer progress reporting.

use std::io::{self, Read, Write};

/// Number of progress lines emitted before completion.
const STEPS: u64 = 4;

/// Length of a shortened identifier.
const SHORT_ID_LEN: usize = 12;

/// Shorten an identifier for display: drop any `algorithm:` prefix and keep
/// the first twelve characters.
pub fn short_id(id: &str) -> &str {
    let id = id.split_once(':').map(|(_, hex)| hex).unwrap_or(id);
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// A reader that reports how much of a layer blob has been consumed.
///
/// A line `<id>: Loading layer <done>/<total>` is written every time another
/// quarter of `total` has been read, and once more at end of stream.
pub struct ProgressReader<'w, R> {
    inner: R,
    out: &'w mut dyn Write,
    id: String,
    total: u64,
    done: u64,
    reported_steps: u64,
    finished: bool,
}

impl<R> std::fmt::Debug for ProgressReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReader")
            .field("id", &self.id)
            .field("total", &self.total)
            .field("done", &self.done)
            .finish()
    }
}

impl<'w, R: Read> ProgressReader<'w, R> {
    /// Report progress of reading `total` bytes from `inner` to `out`.
    pub fn new(inner: R, out: &'w mut dyn Write, id: &str, total: u64) -> Self {
        Self {
            inner,
            out,
            id: short_id(id).to_string(),
            total,
            done: 0,
            reported_steps: 0,
            finished: false,
        }
    }

    fn report(&mut self) -> io::Result<()> {
        writeln!(
            self.out,
            "{}: Loading layer {}/{}",
            self.id, self.done, self.total
        )
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.done += n as u64;
        if n == 0 || self.done >= self.total {
            if !self.finished {
                self.finished = true;
                self.report()?;
            }
        } else if self.total > 0 {
            let steps = self.done * STEPS / self.total;
            if steps > self.reported_steps {
                self.reported_steps = steps;
                self.report()?;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let hex = "0123456789abcdef".repeat(4);
        assert_eq!(short_id(&format!("sha256:{hex}")), "0123456789ab");
        assert_eq!(short_id(&hex), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_progress_lines() {
        let data = vec![0u8; 100];
        let mut out = Vec::new();
        {
            let mut reader = ProgressReader::new(&data[..], &mut out, "sha256:aaaabbbbccccdddd", 100);
            let mut buf = [0u8; 10];
            while reader.read(&mut buf).unwrap() > 0 {}
        }
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "aaaabbbbcccc: Loading layer 30/100",
                "aaaabbbbcccc: Loading layer 50/100",
                "aaaabbbbcccc: Loading layer 80/100",
                "aaaabbbbcccc: Loading layer 100/100",
            ]
        );
    }

    #[test]
    fn test_progress_empty_blob() {
        let mut out = Vec::new();
        {
            let mut reader = ProgressReader::new(&b""[..], &mut out, "abc", 0);
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).unwrap();
        }
        assert_eq!(String::from_utf8(out).unwrap(), "abc: Loading layer 0/0\n");
    }

    #[test]
    fn test_progress_passes_data_through() {
        let data: Vec<u8> = (0..=255).collect();
        let mut out = Vec::new();
        let mut copy = Vec::new();
        ProgressReader::new(&data[..], &mut out, "id", data.len() as u64)
            .read_to_end(&mut copy)
            .unwrap();
        assert_eq!(copy, data);
    }
}
