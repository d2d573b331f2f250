use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::telemetry::Snapshot;

pub const HEADER: [&str; 13] = [
    "min_rtt",
    "avg_urtt",
    "cnt",
    "srtt_us",
    "avg_thr",
    "thr_cnt",
    "pacing_rate",
    "loss_bytes",
    "packets_out",
    "retrans_out",
    "max_packets_out",
    "CWND in Kernel",
    "CWND to Assign",
];

/// Append-only, tab-separated record of control cycles. Every line is flushed as it is written,
/// so the file is complete up to the last recorded cycle even if the process exits abruptly.
pub struct PerfLog<W: Write = BufWriter<fs::File>> {
    writer: W,
}

impl PerfLog {
    /// Creates (or truncates) the log file at `path` and writes the header line.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = fs::File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PerfLog<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        writeln!(writer, "{}", HEADER.join("\t"))?;
        writer.flush()?;

        Ok(Self { writer })
    }

    /// Appends one line pairing the snapshot with the window that was assigned in response.
    pub fn record(&mut self, snapshot: &Snapshot, assigned_cwnd: u32) -> io::Result<()> {
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            snapshot.min_rtt,
            snapshot.avg_micro_rtt,
            snapshot.sample_count,
            snapshot.srtt_micros(),
            snapshot.avg_throughput,
            snapshot.throughput_count,
            snapshot.pacing_rate,
            snapshot.loss_bytes,
            snapshot.packets_out,
            snapshot.retrans_out,
            snapshot.max_packets_out,
            snapshot.cwnd,
            assigned_cwnd,
        )?;
        self.writer.flush()
    }

    /// Flushes and returns the underlying writer.
    pub fn close(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_line() {
        let mut log = PerfLog::new(Vec::new()).unwrap();

        let snapshot = Snapshot {
            min_rtt: 10,
            avg_micro_rtt: 11,
            sample_count: 12,
            srtt_us: 13 << 3,
            avg_throughput: 14,
            throughput_count: 15,
            pacing_rate: 16,
            loss_bytes: 17,
            packets_out: 18,
            retrans_out: 19,
            max_packets_out: 20,
            cwnd: 21,
        };

        log.record(&snapshot, 22).unwrap();

        let text = String::from_utf8(log.close().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split('\t').count(), HEADER.len());
        assert_eq!(lines[0].split('\t').last(), Some("CWND to Assign"));
        assert_eq!(
            lines[1],
            "10\t11\t12\t13\t14\t15\t16\t17\t18\t19\t20\t21\t22"
        );
    }

    #[test]
    fn create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("perf.log");

        assert!(PerfLog::create(path).is_err());
    }
}
