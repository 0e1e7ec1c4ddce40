//! Plain-text numeric tables for milestone and final snapshots.
//!
//! One matrix row per line, values separated by a single space.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::controller::{FinalSnapshot, MilestoneSnapshot};

pub const OUTPUT_DIR: &str = "output";
pub const SNAPSHOT_DIR: &str = "output_snap";
pub const TIMING_DIR: &str = "output/timing";

pub fn write_table(path: &Path, table: &Array2<f64>) -> io::Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    for row in table.rows() {
        let mut first = true;
        for v in row {
            if !first {
                w.write_all(b" ")?;
            }
            write!(w, "{v:e}")?;
            first = false;
        }
        w.write_all(b"\n")?;
    }
    w.flush()
}

/// One value per line.
pub fn write_series(path: &Path, series: &[f64]) -> io::Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    for v in series {
        writeln!(w, "{v:e}")?;
    }
    w.flush()
}

/// Parse a table written by [`write_table`] (or [`write_series`], as a column).
pub fn read_table(path: &Path) -> io::Result<Array2<f64>> {
    let r = BufReader::new(fs::File::open(path)?);
    let mut values = Vec::new();
    let mut rows = 0usize;
    let mut cols: Option<usize> = None;

    for line in r.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let before = values.len();
        for tok in line.split_whitespace() {
            let v = tok
                .parse::<f64>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{tok}: {e}")))?;
            values.push(v);
        }
        let width = values.len() - before;
        match cols {
            None => cols = Some(width),
            Some(c) if c != width => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("row {rows} has {width} values, expected {c}"),
                ))
            }
            _ => {}
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, cols.unwrap_or(0)), values)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Write the three milestone tables into `<root>/output_snap/`.
pub fn write_milestone(root: &Path, snap: &MilestoneSnapshot) -> io::Result<Vec<PathBuf>> {
    let dir = root.join(SNAPSHOT_DIR);
    fs::create_dir_all(&dir)?;
    let f = snap.frame;

    let files = [
        (format!("model_weights_frame{f}.txt"), &snap.weights),
        (format!("ests_C_frame{f}.txt"), &snap.activity),
        (format!("tuning_curves_frame{f}.txt"), &snap.tuning),
    ];
    let mut written = Vec::with_capacity(files.len());
    for (name, table) in files {
        let path = dir.join(name);
        write_table(&path, table)?;
        written.push(path);
    }
    Ok(written)
}

/// Write the final tables into `<root>/output/`, the stimulus record into
/// `<root>/output_snap/` and the per-tick timing trace into `<root>/output/timing/`.
pub fn write_final(root: &Path, snap: &FinalSnapshot) -> io::Result<Vec<PathBuf>> {
    let out = root.join(OUTPUT_DIR);
    let snap_dir = root.join(SNAPSHOT_DIR);
    let timing_dir = root.join(TIMING_DIR);
    fs::create_dir_all(&out)?;
    fs::create_dir_all(&snap_dir)?;
    fs::create_dir_all(&timing_dir)?;

    let weights = out.join("model_weights.txt");
    let activity = out.join("analysis_proc_S.txt");
    let likelihood = out.join("analysis_LL.txt");
    let tuning = out.join("analysis_estsAvg.txt");
    let stims = snap_dir.join("stims.txt");
    let frame_time = timing_dir.join("analysis_frame_time.txt");
    let timestamp = timing_dir.join("analysis_timestamp.txt");

    write_table(&weights, &snap.weights)?;
    write_table(&activity, &snap.activity)?;
    write_series(&likelihood, &snap.likelihood)?;
    write_table(&tuning, &snap.tuning)?;
    write_table(&stims, &snap.stimulus)?;
    write_series(&frame_time, &snap.frame_times)?;
    let stamps = Array2::from_shape_vec(
        (snap.timestamps.len(), 2),
        snap.timestamps.iter().flatten().copied().collect(),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    write_table(&timestamp, &stamps)?;

    Ok(vec![
        weights, activity, likelihood, tuning, stims, frame_time, timestamp,
    ])
}
