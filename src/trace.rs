use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Bits per packet opportunity (one 1500-byte MTU).
pub const PACKET_BITS: f64 = 1500.0 * 8.0;

/// Length of a generated trace.
pub const TRACE_DURATION_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("invalid bandwidth {0} Mbps")]
    Bandwidth(f64),
    #[error("{path:?}: error writing trace: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Number of packet delivery opportunities in one trace at the given bandwidth.
pub fn packet_count(bandwidth_mbps: f64) -> u64 {
    (bandwidth_mbps * 1e6 / PACKET_BITS * (TRACE_DURATION_MS / 1000) as f64) as u64
}

/// Evenly spaced delivery timestamps in milliseconds, starting at zero and stopping short of the
/// trace duration.
pub fn constant_bandwidth(bandwidth_mbps: f64) -> impl Iterator<Item = u64> {
    let count = packet_count(bandwidth_mbps);
    let step = if count == 0 {
        0.0
    } else {
        TRACE_DURATION_MS as f64 / count as f64
    };

    (0..count).map(move |i| (i as f64 * step) as u64)
}

pub fn file_name(bandwidth_mbps: f64) -> String {
    format!("{bandwidth_mbps}mbps.trace")
}

pub fn write_trace<W: Write>(
    writer: &mut W,
    timestamps: impl Iterator<Item = u64>,
) -> io::Result<()> {
    for ts in timestamps {
        writeln!(writer, "{ts}")?;
    }
    writer.flush()
}

/// Writes a constant-bandwidth trace into `dir` and returns its path.
pub fn generate(bandwidth_mbps: f64, dir: &Path) -> Result<PathBuf, TraceError> {
    if !bandwidth_mbps.is_finite() || bandwidth_mbps <= 0.0 {
        return Err(TraceError::Bandwidth(bandwidth_mbps));
    }

    let path = dir.join(file_name(bandwidth_mbps));

    let result = fs::File::create(&path).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write_trace(&mut writer, constant_bandwidth(bandwidth_mbps))
    });

    match result {
        Ok(()) => {
            log::debug!("wrote {} timestamps to {path:?}", packet_count(bandwidth_mbps));
            Ok(path)
        }
        Err(source) => Err(TraceError::Io { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_counts() {
        assert_eq!(packet_count(12.0), 60_000);
        assert_eq!(packet_count(1.0), 5_000);
        assert_eq!(packet_count(0.5), 2_500);
        assert_eq!(packet_count(0.0001), 0);
    }

    #[test]
    fn timestamps_are_evenly_spaced() {
        let ts: Vec<u64> = constant_bandwidth(1.0).collect();

        assert_eq!(ts.len(), 5_000);
        assert_eq!(&ts[..4], &[0, 12, 24, 36]);
        assert_eq!(*ts.last().unwrap(), 59_988);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn fractional_spacing_truncates() {
        // 24 Mbps gives two opportunities per millisecond
        let ts: Vec<u64> = constant_bandwidth(24.0).take(5).collect();
        assert_eq!(ts, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn generate_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();

        let path = generate(12.0, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("12mbps.trace"));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 60_000);
        assert_eq!(lines[0], "0");
        assert_eq!(lines[1], "1");
        assert_eq!(lines[59_999], "59999");
    }

    #[test]
    fn generate_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            generate(0.0, dir.path()),
            Err(TraceError::Bandwidth(_))
        ));
        assert!(matches!(
            generate(f64::NAN, dir.path()),
            Err(TraceError::Bandwidth(_))
        ));
        assert!(matches!(
            generate(5.0, &dir.path().join("missing")),
            Err(TraceError::Io { .. })
        ));
    }
}
