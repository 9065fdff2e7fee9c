//! Bounded-cost Shannon entropy estimation over recently touched files.

#![allow(clippy::cast_precision_loss)]

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Shannon entropy (bits/byte) of a byte slice.
#[must_use]
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }

    let mut frequency = [0u32; 256];
    for &byte in bytes {
        frequency[byte as usize] += 1;
    }

    let total = bytes.len() as f64;
    let mut entropy = 0.0;
    for &count in &frequency {
        if count > 0 {
            let p = f64::from(count) / total;
            entropy -= p * p.log2();
        }
    }
    entropy
}

/// Entropy of the head of a file, reading at most `sample_bytes`.
///
/// Reading only the head keeps per-file cost constant; encrypted output is
/// uniformly high-entropy so the head is as informative as the whole file.
pub fn file_head_entropy(path: &Path, sample_bytes: usize) -> std::io::Result<f64> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; sample_bytes.max(1)];
    let mut filled = 0usize;
    // A single read may return short on pipes/network filesystems.
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(shannon_entropy(&buffer[..filled]))
}

/// Mean head-entropy over a bounded sample of paths.
///
/// The caller passes the most recently touched files; only the first
/// `budget` are read. The budget is what keeps tick cost independent of
/// tree size, so it is an argument, not a constant the caller can forget.
/// Unreadable files (deleted between event and sample) are skipped.
#[must_use]
pub fn mean_entropy_of<'a, I>(paths: I, budget: usize, sample_bytes: usize) -> Option<f64>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut total = 0.0;
    let mut counted = 0usize;

    for path in paths.into_iter().take(budget) {
        match file_head_entropy(path, sample_bytes) {
            Ok(entropy) => {
                total += entropy;
                counted += 1;
            }
            Err(_) => continue,
        }
    }

    if counted == 0 {
        None
    } else {
        Some(total / counted as f64)
    }
}
