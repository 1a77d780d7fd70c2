use std::io::{self, Write};

use serde::Serialize;

use crate::manifest::ModalityStats;
use crate::progress::{ProgressEvent, ProgressSink};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_stats(stats: &[ModalityStats]) -> io::Result<()> {
        Self::print_json(&stats)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress sink for terminal runs: one line per completed work item on
/// stderr, keeping stdout free for results.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        eprintln!(
            "phase={} {}/{}",
            event.phase, event.completed, event.total
        );
    }
}

pub fn human_size(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const KIB: f64 = 1024.0;
    let size = bytes as f64;
    if size > GIB {
        format!("{:.2} GB", size / GIB)
    } else if size > MIB {
        format!("{:.2} MB", size / MIB)
    } else {
        format!("{:.2} KB", size / KIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "0.50 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
