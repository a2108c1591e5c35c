//! Epoch-end observers (§4.10): a [`Callback`] trait plus three built-in
//! implementations — [`Logger`], [`ModelCheckpoint`], and [`EarlyStopping`].
//!
//! Every callback sees the optimizer only through [`crate::optim::OptimizerInfo`],
//! so the same callback works with any [`crate::optim::Optimizer`] variant.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::optim::{EpochResults, OptimizerInfo};

/// Called once per completed epoch. Implementations may hold mutable state
/// (an open file handle, a best-so-far score, a patience counter).
pub trait Callback {
    fn on_epoch_end(&mut self, opt: &dyn OptimizerInfo, results: &EpochResults);
}

/// Prints `Epoch N: metric=value ...` to stdout and, optionally, appends the
/// same line to a file. Reopening a log whose last line is `Epoch N: ...`
/// resumes counting from `N + 1` rather than restarting at 1, so training
/// resumed from a checkpoint keeps one continuous log.
pub struct Logger {
    epoch: u64,
    file: Option<std::fs::File>,
}

impl Logger {
    pub fn new() -> Self {
        Self { epoch: 0, file: None }
    }

    /// Opens `path` for appending. Per §7, a failure to open the file is
    /// logged through `tracing` and otherwise ignored — logging never aborts
    /// training. The existing content (if any) is scanned for the last
    /// `Epoch N` line to resume the counter.
    pub fn with_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut epoch = 0;
        if let Ok(existing) = std::fs::File::open(&path) {
            for line in BufReader::new(existing).lines().map_while(Result::ok) {
                if let Some(rest) = line.strip_prefix("Epoch ") {
                    if let Some(n) = rest.split(':').next().and_then(|s| s.trim().parse::<u64>().ok()) {
                        epoch = n;
                    }
                }
            }
        }

        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not open log file, logging to stdout only");
                None
            }
        };

        Self { epoch, file }
    }

    fn format_line(&self, opt: &dyn OptimizerInfo, results: &EpochResults) -> String {
        let mut line = format!("Epoch {}:", self.epoch);
        for i in 0..opt.n_metrics() {
            line.push_str(&format!(" {}={:.6}", opt.metric_name(i), results.train(i)));
            if let Some(v) = results.validation(i) {
                line.push_str(&format!(" val_{}={:.6}", opt.metric_name(i), v));
            }
        }
        line
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for Logger {
    fn on_epoch_end(&mut self, opt: &dyn OptimizerInfo, results: &EpochResults) {
        self.epoch += 1;
        let line = self.format_line(opt, results);
        println!("{line}");
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                tracing::warn!(error = %err, "failed to append to log file");
            }
        }
    }
}

/// Whether a lower or higher metric value counts as "improved".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Higher,
    Lower,
}

/// Resolves which slot of an [`EpochResults`] a monitor index refers to: the
/// validation half if present, else the training half. `monitor: None`
/// defaults to metric `0` — "the last validation metric if given, else the
/// first training metric" per §4.10, read here as "the metric at this
/// index, validation-side if there is one".
fn monitored_value(results: &EpochResults, monitor: Option<usize>) -> f32 {
    let i = monitor.unwrap_or(0);
    results.validation(i).unwrap_or_else(|| results.train(i))
}

/// Saves the network to `path` whenever the monitored metric improves.
/// Save failures are logged and swallowed (§7) — a checkpoint failure never
/// halts training.
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: Option<usize>,
    direction: Direction,
    best: Option<f32>,
}

impl ModelCheckpoint {
    pub fn new(path: impl AsRef<Path>, monitor: Option<usize>, direction: Direction) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            monitor,
            direction,
            best: None,
        }
    }

    fn improved(&self, value: f32) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.direction {
                Direction::Higher => value > best,
                Direction::Lower => value < best,
            },
        }
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, opt: &dyn OptimizerInfo, results: &EpochResults) {
        let value = monitored_value(results, self.monitor);
        if self.improved(value) {
            self.best = Some(value);
            if let Err(err) = opt.network().save(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to save checkpoint");
            }
        }
    }
}

/// Stops training once the monitored metric has failed to improve for
/// `patience` consecutive epochs.
pub struct EarlyStopping {
    monitor: Option<usize>,
    direction: Direction,
    patience: u32,
    best: Option<f32>,
    wait: u32,
    stop: bool,
}

impl EarlyStopping {
    pub fn new(monitor: Option<usize>, direction: Direction, patience: u32) -> Self {
        Self {
            monitor,
            direction,
            patience,
            best: None,
            wait: 0,
            stop: false,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop
    }

    fn improved(&self, value: f32) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.direction {
                Direction::Higher => value > best,
                Direction::Lower => value < best,
            },
        }
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(&mut self, _opt: &dyn OptimizerInfo, results: &EpochResults) {
        let value = monitored_value(results, self.monitor);
        if self.improved(value) {
            self.best = Some(value);
            self.wait = 0;
        } else {
            self.wait += 1;
            if self.wait >= self.patience {
                self.stop = true;
            }
        }
    }
}
