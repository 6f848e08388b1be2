//! Accumulator protocol
//!
//! Every worker reduces its own input to a [`LocalSum`] without touching
//! shared state, then folds that partial sum into the shared total exactly
//! once under the gate.

use crate::{CoordError, Result};
use serde::{Deserialize, Serialize};
use shm_coord_shared_memory::{Detached, SegmentLayout, SegmentOptions, SessionNames, SharedSegment};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Default base name of accumulator segments
pub const ACCUMULATOR_BASE: &str = "shm_sum";

/// Shared payload of an accumulator segment
#[repr(C)]
#[derive(Debug)]
pub struct AccumulatorState {
    total: f64,
    folds: u64,
}

unsafe impl SegmentLayout for AccumulatorState {
    const LAYOUT_ID: u32 = 0x4143_4331; // "ACC1"

    fn initialize(&mut self) {
        self.total = 0.0;
        self.folds = 0;
    }
}

/// A worker's contribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSum {
    pub sum: f64,
    pub count: usize,
}

/// Lazy sequence of whitespace-separated numbers
///
/// Ends at end of input or at the first token that is not a number. Only
/// read failures are reported as errors.
pub struct NumberTokens<R> {
    reader: R,
    line: String,
    offset: usize,
    done: bool,
}

impl<R: BufRead> NumberTokens<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            offset: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NumberTokens<R> {
    type Item = io::Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let rest = &self.line[self.offset..];
            let skipped = rest.len() - rest.trim_start().len();
            let rest = &rest[skipped..];

            if rest.is_empty() {
                self.line.clear();
                self.offset = 0;
                match self.reader.read_line(&mut self.line) {
                    Ok(0) => self.done = true,
                    Ok(_) => {}
                    // Binary garbage reads like a non-numeric token
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => self.done = true,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                continue;
            }

            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let token = &rest[..end];
            self.offset += skipped + end;

            match token.parse::<f64>() {
                Ok(value) => return Some(Ok(value)),
                Err(_) => {
                    debug!("Stopping at non-numeric token {:?}", token);
                    self.done = true;
                }
            }
        }
    }
}

/// Sum every number `reader` yields
pub fn compute_local<R: BufRead>(reader: R) -> io::Result<LocalSum> {
    let mut local = LocalSum::default();
    for value in NumberTokens::new(reader) {
        local.sum += value?;
        local.count += 1;
    }
    Ok(local)
}

/// Sum the numbers stored in a file
pub fn sum_file(path: &Path) -> Result<LocalSum> {
    let file = File::open(path).map_err(|e| CoordError::input(path, e))?;
    let local = compute_local(BufReader::new(file)).map_err(|e| CoordError::input(path, e))?;
    debug!("{}: {} numbers, local sum {}", path.display(), local.count, local.sum);
    Ok(local)
}

/// Persist the final total, overwriting any previous result
pub fn write_result(path: &Path, total: f64) -> Result<()> {
    std::fs::write(path, format_total(total))?;
    info!("Result {:.2} written to {}", total, path.display());
    Ok(())
}

/// Text form of the result artifact
pub fn format_total(total: f64) -> String {
    format!("{:.2}\n", total)
}

/// Handle to a shared accumulator
#[derive(Debug)]
pub struct Accumulator {
    segment: SharedSegment<AccumulatorState>,
}

impl Accumulator {
    /// Join the accumulator, creating it on first use
    #[instrument(skip(options))]
    pub fn create_or_attach(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let segment = SharedSegment::create_or_attach(names, options)?;
        Ok(Self { segment })
    }

    /// Join an accumulator somebody else created
    #[instrument(skip(options))]
    pub fn attach(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let segment = SharedSegment::attach(names, options)?;
        Ok(Self { segment })
    }

    /// Add a local sum to the shared total; returns the new total
    pub fn fold(&self, local: f64) -> Result<f64> {
        let mut state = self.segment.lock()?;
        state.total += local;
        state.folds += 1;
        Ok(state.total)
    }

    /// Current shared total
    pub fn total(&self) -> Result<f64> {
        Ok(self.segment.lock()?.total)
    }

    /// Number of folds applied so far
    pub fn folds(&self) -> Result<u64> {
        Ok(self.segment.lock()?.folds)
    }

    pub fn names(&self) -> &SessionNames {
        self.segment.names()
    }

    pub fn participants(&self) -> u32 {
        self.segment.participants()
    }

    /// Leave the accumulator; the last participant removes it
    pub fn detach(&self) -> Result<Detached> {
        Ok(self.segment.detach()?)
    }

    /// Remove the accumulator for every participant
    pub fn destroy(&self) -> Result<()> {
        Ok(self.segment.destroy()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_coord_shared_memory::SharedMemoryError;
    use std::io::{Cursor, Write};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn options() -> SegmentOptions {
        SegmentOptions {
            acquire_timeout: Some(Duration::from_secs(10)),
            ..SegmentOptions::default()
        }
    }

    fn temp_input(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_compute_local() {
        let local = compute_local(Cursor::new("1.0 2.0 3.0")).unwrap();
        assert_eq!(local, LocalSum { sum: 6.0, count: 3 });

        let local = compute_local(Cursor::new("  4.0\n\n\t5.0  \n")).unwrap();
        assert_eq!(local, LocalSum { sum: 9.0, count: 2 });

        let local = compute_local(Cursor::new("")).unwrap();
        assert_eq!(local, LocalSum::default());
    }

    #[test]
    fn test_compute_local_stops_at_first_non_number() {
        let local = compute_local(Cursor::new("1 2 three 4\n5")).unwrap();
        assert_eq!(local, LocalSum { sum: 3.0, count: 2 });

        let local = compute_local(Cursor::new("-1.5e1 +2.5 abc")).unwrap();
        assert_eq!(local, LocalSum { sum: -12.5, count: 2 });

        let local = compute_local(Cursor::new(&b"7\n\xff\xfe 8"[..])).unwrap();
        assert_eq!(local, LocalSum { sum: 7.0, count: 1 });
    }

    #[test]
    fn test_sum_file_missing() {
        let err = sum_file(Path::new("/nonexistent/input.txt")).unwrap_err();
        assert!(matches!(err, CoordError::Input { .. }));
    }

    #[test]
    fn test_two_file_scenario() {
        let names = SessionNames::generate("acc-scenario").unwrap();
        let accumulator = Accumulator::create_or_attach(&names, options()).unwrap();

        let first = temp_input("1.0 2.0 3.0");
        let second = temp_input("4.0 5.0");
        let a = sum_file(first.path()).unwrap();
        let b = sum_file(second.path()).unwrap();
        assert_eq!(a.sum, 6.0);
        assert_eq!(b.sum, 9.0);

        accumulator.fold(a.sum).unwrap();
        assert_eq!(accumulator.fold(b.sum).unwrap(), 15.0);
        assert_eq!(accumulator.folds().unwrap(), 2);

        let out = NamedTempFile::new().unwrap();
        write_result(out.path(), accumulator.total().unwrap()).unwrap();
        assert_eq!(std::fs::read_to_string(out.path()).unwrap(), "15.00\n");

        accumulator.destroy().unwrap();
    }

    #[test]
    fn test_partitions_fold_to_same_total() {
        let numbers: Vec<f64> = (1..=60).map(|i| i as f64 * 0.25).collect();
        let expected: f64 = numbers.iter().sum();

        for workers in 1..=6 {
            let names = SessionNames::generate("acc-partition").unwrap();
            let owner = Accumulator::create_or_attach(&names, options()).unwrap();

            let chunk = (numbers.len() + workers - 1) / workers;
            std::thread::scope(|s| {
                for part in numbers.chunks(chunk) {
                    let names = &names;
                    s.spawn(move || {
                        let text: Vec<String> = part.iter().map(|n| n.to_string()).collect();
                        let local = compute_local(Cursor::new(text.join(" "))).unwrap();
                        let worker = Accumulator::attach(names, options()).unwrap();
                        worker.fold(local.sum).unwrap();
                        worker.detach().unwrap();
                    });
                }
            });

            let total = owner.total().unwrap();
            assert!((total - expected).abs() <= 1e-9 * expected.abs());
            assert_eq!(owner.folds().unwrap() as usize, numbers.chunks(chunk).count());
            assert_eq!(owner.participants(), 1);
            owner.destroy().unwrap();
        }
    }

    #[test]
    fn test_fold_after_destroy_fails() {
        let names = SessionNames::generate("acc-destroyed").unwrap();
        let owner = Accumulator::create_or_attach(&names, options()).unwrap();
        let worker = Accumulator::attach(&names, options()).unwrap();

        owner.destroy().unwrap();
        let err = worker.fold(1.0).unwrap_err();
        assert!(matches!(err, CoordError::Resource(SharedMemoryError::NotFound(_))));
    }

    #[test]
    fn test_format_total() {
        assert_eq!(format_total(15.0), "15.00\n");
        assert_eq!(format_total(0.0), "0.00\n");
        assert_eq!(format_total(-2.5), "-2.50\n");
    }
}
