//! Square matrices and parallel symmetry checks

use crate::{CoordError, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Largest |a[i][j] - a[j][i]| still considered equal
pub const TOLERANCE: f64 = 1e-9;

/// Elements reserved up front when reading a matrix; more grow on demand
const PREALLOCATED_ELEMENTS: usize = 1 << 16;

/// Dense square matrix, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

/// Generated test matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// a[i][j] = i + j
    Symmetric,
    /// a[i][j] = i * n + j
    Linear,
    /// n + i on the diagonal, 1 / (i + j + 1) elsewhere
    DiagonallyDominant,
    /// a[i][j] = 1 / (i + j + 1)
    Hilbert,
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "symmetric" => Ok(Pattern::Symmetric),
            "linear" => Ok(Pattern::Linear),
            "diagonal" | "diagonally-dominant" => Ok(Pattern::DiagonallyDominant),
            "hilbert" => Ok(Pattern::Hilbert),
            other => Err(format!("unknown matrix pattern {:?}", other)),
        }
    }
}

/// A matrix file: dimension, suggested worker count, values
#[derive(Debug, Clone)]
pub struct MatrixFile {
    pub matrix: Matrix,
    pub workers: usize,
}

impl Matrix {
    /// Build from row-major values; `data` must hold `n * n` entries
    pub fn new(n: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n * n {
            return Err(CoordError::InvalidData(format!(
                "{} values for a {}x{} matrix",
                data.len(),
                n,
                n
            )));
        }
        Ok(Self { n, data })
    }

    pub fn generate(n: usize, pattern: Pattern) -> Self {
        let mut data = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let value = match pattern {
                    Pattern::Symmetric => (i + j) as f64,
                    Pattern::Linear => (i * n + j) as f64,
                    Pattern::DiagonallyDominant if i == j => (n + i) as f64,
                    Pattern::DiagonallyDominant | Pattern::Hilbert => 1.0 / (i + j + 1) as f64,
                };
                data.push(value);
            }
        }
        Self { n, data }
    }

    /// Parse `n p` followed by `n * n` whitespace-separated values
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<MatrixFile> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let mut tokens = text.split_whitespace();

        let mut header = |what: &str| -> Result<usize> {
            let token = tokens
                .next()
                .ok_or_else(|| CoordError::InvalidData(format!("missing {}", what)))?;
            token
                .parse::<usize>()
                .map_err(|_| CoordError::InvalidData(format!("bad {} {:?}", what, token)))
        };
        let n = header("dimension")?;
        let workers = header("worker count")?;
        let elements = n
            .checked_mul(n)
            .ok_or_else(|| CoordError::InvalidData(format!("dimension {} is too large", n)))?;
        // No more workers than rows
        let workers = workers.min(n.max(1));

        let mut data = Vec::with_capacity(elements.min(PREALLOCATED_ELEMENTS));
        for index in 0..elements {
            let token = tokens.next().ok_or_else(|| {
                CoordError::InvalidData(format!("missing element [{}][{}]", index / n, index % n))
            })?;
            let value = token.parse::<f64>().map_err(|_| {
                CoordError::InvalidData(format!(
                    "bad element [{}][{}]: {:?}",
                    index / n,
                    index % n,
                    token
                ))
            })?;
            data.push(value);
        }

        Ok(MatrixFile {
            matrix: Matrix { n, data },
            workers,
        })
    }

    pub fn from_file(path: &Path) -> Result<MatrixFile> {
        let file = std::fs::File::open(path).map_err(|e| CoordError::input(path, e))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.n {
            for value in self.row(i) {
                write!(f, "{:8.2} ", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A pair of entries that differ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asymmetry {
    pub row: usize,
    pub col: usize,
    pub upper: f64,
    pub lower: f64,
    /// Worker that found it
    pub worker: usize,
}

impl fmt::Display for Asymmetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a[{}][{}] = {:.6} != a[{}][{}] = {:.6}",
            self.row, self.col, self.upper, self.col, self.row, self.lower
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymmetryReport {
    pub symmetric: bool,
    pub mismatch: Option<Asymmetry>,
    pub workers: usize,
}

fn find_in_row(m: &Matrix, i: usize, worker: usize) -> Option<Asymmetry> {
    (i + 1..m.n).find_map(|j| {
        let (upper, lower) = (m.get(i, j), m.get(j, i));
        ((upper - lower).abs() > TOLERANCE).then(|| Asymmetry {
            row: i,
            col: j,
            upper,
            lower,
            worker,
        })
    })
}

/// Check with one thread per worker over strided rows
///
/// Worker `w` takes rows `w, w + workers, ...`. The first worker to find a
/// mismatch raises a shared flag; the others stop before their next row.
pub fn check_symmetric_strided(m: &Matrix, workers: usize) -> SymmetryReport {
    let workers = workers.clamp(1, m.n.max(1));
    let asymmetric = AtomicBool::new(false);

    let mismatch = std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let asymmetric = &asymmetric;
                s.spawn(move || {
                    for i in (worker..m.n).step_by(workers) {
                        if asymmetric.load(Ordering::Relaxed) {
                            return None;
                        }
                        if let Some(found) = find_in_row(m, i, worker) {
                            // Only the first finder reports
                            if asymmetric.swap(true, Ordering::AcqRel) {
                                return None;
                            }
                            debug!("Worker {} found {}", worker, found);
                            return Some(found);
                        }
                    }
                    None
                })
            })
            .collect();

        handles.into_iter().find_map(|h| h.join().ok().flatten())
    });

    SymmetryReport {
        symmetric: mismatch.is_none(),
        mismatch,
        workers,
    }
}

/// Data-parallel check on a rayon pool
///
/// Rows are split by the pool; once any row reports a mismatch the
/// remaining rows are skipped cooperatively.
pub fn check_symmetric_parallel(m: &Matrix, pool: &rayon::ThreadPool) -> SymmetryReport {
    let mismatch = pool.install(|| {
        (0..m.n)
            .into_par_iter()
            .find_map_any(|i| find_in_row(m, i, rayon::current_thread_index().unwrap_or(0)))
    });

    SymmetryReport {
        symmetric: mismatch.is_none(),
        mismatch,
        workers: pool.current_num_threads(),
    }
}

/// (A + Aᵀ) / 2
pub fn symmetrize(m: &Matrix, pool: &rayon::ThreadPool) -> Matrix {
    let n = m.n;
    let mut data = vec![0.0; n * n];
    pool.install(|| {
        data.par_chunks_mut(n.max(1)).enumerate().for_each(|(i, row)| {
            for (j, value) in row.iter_mut().enumerate() {
                *value = (m.get(i, j) + m.get(j, i)) / 2.0;
            }
        })
    });
    info!("Symmetrized {}x{} matrix on {} threads", n, n, pool.current_num_threads());
    Matrix { n, data }
}

/// Largest |a[i][j] - a[j][i]|
pub fn symmetry_error(m: &Matrix, pool: &rayon::ThreadPool) -> f64 {
    pool.install(|| {
        (0..m.n)
            .into_par_iter()
            .map(|i| (i + 1..m.n).map(|j| (m.get(i, j) - m.get(j, i)).abs()).fold(0.0, f64::max))
            .reduce(|| 0.0, f64::max)
    })
}

/// Build a rayon pool; `threads == 0` picks one thread per CPU
pub fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    let threads = if threads == 0 { num_cpus::get() } else { threads };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| CoordError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
}
