//! # Fit Trajectories
//!
//! A trajectory records one attempt at a fit: where it started, where it
//! ended, how it ended and at what cost. Collections of trajectories come
//! from multi-start explorations; they can be sorted, clustered into
//! groups of equivalent solutions and saved as tab-separated text.
//!
//! The text format has one header line and one record per trajectory.
//! Vectors are written as comma-separated values in a single field.
//! Loading tolerates records cut short after the final parameters: the
//! missing fields keep their default values.

use crate::error::{FitError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Ending {
    Converged,
    Cancelled,
    /// The iteration cap was reached.
    TimeOut,
    /// The final parameters contain NaN or infinities.
    NonFinite,
    /// The engine failed.
    Error,
    /// Not a real fit, e.g. a record read from an incomplete file.
    #[default]
    Invalid,
}

impl fmt::Display for Ending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ending::Converged => "ok",
            Ending::Cancelled => "cancelled",
            Ending::TimeOut => "timeout",
            Ending::NonFinite => "non-finite",
            Ending::Error => "error",
            Ending::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Ending {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ok" | "converged" => Ok(Ending::Converged),
            "cancelled" => Ok(Ending::Cancelled),
            "timeout" => Ok(Ending::TimeOut),
            "non-finite" => Ok(Ending::NonFinite),
            "error" => Ok(Ending::Error),
            "invalid" => Ok(Ending::Invalid),
            other => Err(FitError::Trajectory(format!("unknown ending '{}'", other))),
        }
    }
}

/// One fit attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitTrajectory {
    /// Natural parameters the fit started from.
    pub initial_parameters: Vec<f64>,
    /// Natural parameters the fit ended at.
    pub final_parameters: Vec<f64>,
    /// Relative standard errors of the final parameters.
    pub parameter_errors: Vec<f64>,
    pub ending: Ending,
    /// Norm of the weighted residuals.
    pub residuals: f64,
    /// Residuals relative to the norm of the weighted data.
    pub relative_residuals: f64,
    /// Residuals as reported by the engine.
    pub internal_residuals: f64,
    pub engine: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub iterations: usize,
    pub evaluations: usize,
}

impl Default for FitTrajectory {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            initial_parameters: Vec::new(),
            final_parameters: Vec::new(),
            parameter_errors: Vec::new(),
            ending: Ending::Invalid,
            residuals: f64::NAN,
            relative_residuals: f64::NAN,
            internal_residuals: f64::NAN,
            engine: String::new(),
            start_time: now,
            end_time: now,
            iterations: 0,
            evaluations: 0,
        }
    }
}

impl FitTrajectory {
    pub fn new(initial_parameters: Vec<f64>, engine: &str) -> Self {
        Self {
            initial_parameters,
            engine: engine.to_string(),
            ..Self::default()
        }
    }

    /// Marks the trajectory as [`Ending::NonFinite`] when the final
    /// parameters are not all finite.
    pub fn flag_bad(&mut self) {
        if self.final_parameters.iter().any(|v| !v.is_finite()) {
            self.ending = Ending::NonFinite;
        }
    }

    /// Wall-clock duration of the fit.
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    /// Whether every final parameter of `other` lies within
    /// `relative * |value|` of ours.
    pub fn is_within(&self, other: &FitTrajectory, relative: f64) -> bool {
        self.final_parameters.len() == other.final_parameters.len()
            && self
                .final_parameters
                .iter()
                .zip(&other.final_parameters)
                .all(|(a, b)| (a - b).abs() <= relative * a.abs())
    }

    /// Whether `other` ends within our error bars, each relative error
    /// being at least 1e-6.
    pub fn is_within_error_range(&self, other: &FitTrajectory) -> bool {
        self.final_parameters.len() == other.final_parameters.len()
            && self
                .final_parameters
                .iter()
                .zip(&other.final_parameters)
                .enumerate()
                .all(|(i, (a, b))| {
                    let error = self.parameter_errors.get(i).copied().unwrap_or(0.0);
                    let error = if error.is_finite() { error.max(1e-6) } else { f64::INFINITY };
                    (a - b).abs() <= error * a.abs()
                })
    }

    /// Orders by relative residuals, finite values first.
    pub fn cmp_residuals(&self, other: &FitTrajectory) -> Ordering {
        let (a, b) = (self.relative_residuals, other.relative_residuals);
        match (a.is_finite(), b.is_finite()) {
            (true, true) => a.total_cmp(&b),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        }
    }
}

const HEADER: [&str; 12] = [
    "initial",
    "final",
    "errors",
    "ending",
    "residuals",
    "relative_residuals",
    "internal_residuals",
    "engine",
    "start_time",
    "end_time",
    "iterations",
    "evaluations",
];

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:e}", v))
        .collect::<Vec<_>>()
        .join(",")
}

fn split(field: &str) -> Result<Vec<f64>> {
    if field.trim().is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(parse_number)
        .collect()
}

fn parse_number(s: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| FitError::Trajectory(format!("invalid number '{}': {}", s, e)))
}

fn parse_count(s: &str) -> Result<usize> {
    s.trim()
        .parse::<usize>()
        .map_err(|e| FitError::Trajectory(format!("invalid count '{}': {}", s, e)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FitError::Trajectory(format!("invalid time '{}': {}", s, e)))
}

impl FitTrajectory {
    fn to_record(&self) -> Vec<String> {
        vec![
            join(&self.initial_parameters),
            join(&self.final_parameters),
            join(&self.parameter_errors),
            self.ending.to_string(),
            format!("{:e}", self.residuals),
            format!("{:e}", self.relative_residuals),
            format!("{:e}", self.internal_residuals),
            self.engine.clone(),
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339(),
            self.iterations.to_string(),
            self.evaluations.to_string(),
        ]
    }

    fn from_record(record: &csv::StringRecord) -> Result<Self> {
        if record.len() < 2 {
            return Err(FitError::Trajectory(format!(
                "record has {} fields, at least the initial and final parameters are needed",
                record.len()
            )));
        }
        let mut t = FitTrajectory {
            initial_parameters: split(&record[0])?,
            final_parameters: split(&record[1])?,
            ..FitTrajectory::default()
        };
        for (i, field) in record.iter().enumerate().skip(2) {
            match i {
                2 => t.parameter_errors = split(field)?,
                3 => t.ending = field.parse()?,
                4 => t.residuals = parse_number(field)?,
                5 => t.relative_residuals = parse_number(field)?,
                6 => t.internal_residuals = parse_number(field)?,
                7 => t.engine = field.to_string(),
                8 => t.start_time = parse_time(field)?,
                9 => t.end_time = parse_time(field)?,
                10 => t.iterations = parse_count(field)?,
                11 => t.evaluations = parse_count(field)?,
                _ => break,
            }
        }
        Ok(t)
    }
}

/// A set of trajectories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitTrajectories {
    trajectories: Vec<FitTrajectory>,
}

impl FitTrajectories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trajectory: FitTrajectory) {
        self.trajectories.push(trajectory);
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FitTrajectory> {
        self.trajectories.iter()
    }

    pub fn get(&self, index: usize) -> Option<&FitTrajectory> {
        self.trajectories.get(index)
    }

    /// Sorts from best to worst.
    pub fn sort(&mut self) {
        self.trajectories.sort_by(|a, b| a.cmp_residuals(b));
    }

    /// The trajectory with the lowest relative residuals.
    pub fn best(&self) -> Option<&FitTrajectory> {
        self.trajectories.iter().min_by(|a, b| a.cmp_residuals(b))
    }

    /// Groups trajectories that ended within each other's error range.
    ///
    /// Each cluster is sorted best first; clusters are sorted by
    /// decreasing size, then by the residuals of their best member.
    pub fn cluster(&self) -> Vec<FitTrajectories> {
        let mut sorted = self.trajectories.clone();
        sorted.sort_by(|a, b| a.cmp_residuals(b));

        let mut clusters: Vec<FitTrajectories> = Vec::new();
        for t in sorted {
            let home = clusters.iter_mut().find(|c| {
                c.trajectories
                    .first()
                    .map_or(false, |r| r.is_within_error_range(&t) || t.is_within_error_range(r))
            });
            match home {
                Some(c) => c.push(t),
                None => clusters.push(FitTrajectories {
                    trajectories: vec![t],
                }),
            }
        }
        clusters.sort_by(|a, b| {
            b.len().cmp(&a.len()).then_with(|| match (a.best(), b.best()) {
                (Some(x), Some(y)) => x.cmp_residuals(y),
                _ => Ordering::Equal,
            })
        });
        clusters
    }

    /// Writes the trajectories as tab-separated text with a header.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);
        w.write_record(HEADER)?;
        for t in &self.trajectories {
            w.write_record(t.to_record())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Reads trajectories written by [`save`](Self::save), possibly by an
    /// older version writing fewer columns.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut r = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let mut trajectories = Vec::new();
        for record in r.records() {
            let record = record?;
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            trajectories.push(FitTrajectory::from_record(&record)?);
        }
        Ok(Self { trajectories })
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.save(std::fs::File::create(path)?)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(std::fs::File::open(path)?)
    }
}

impl FromIterator<FitTrajectory> for FitTrajectories {
    fn from_iter<I: IntoIterator<Item = FitTrajectory>>(iter: I) -> Self {
        Self {
            trajectories: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a FitTrajectories {
    type Item = &'a FitTrajectory;
    type IntoIter = std::slice::Iter<'a, FitTrajectory>;

    fn into_iter(self) -> Self::IntoIter {
        self.trajectories.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trajectory(params: &[f64], residuals: f64) -> FitTrajectory {
        FitTrajectory {
            final_parameters: params.to_vec(),
            parameter_errors: vec![1e-2; params.len()],
            relative_residuals: residuals,
            ending: Ending::Converged,
            ..FitTrajectory::new(vec![1.0; params.len()], "qsoas")
        }
    }

    #[test]
    fn test_flag_bad() {
        let mut t = trajectory(&[1.0, f64::NAN], 0.1);
        t.flag_bad();
        assert_eq!(t.ending, Ending::NonFinite);
        let mut t = trajectory(&[1.0, 2.0], 0.1);
        t.flag_bad();
        assert_eq!(t.ending, Ending::Converged);
    }

    #[test]
    fn test_ordering_puts_non_finite_last() {
        let mut set: FitTrajectories = vec![
            trajectory(&[1.0], f64::NAN),
            trajectory(&[2.0], 0.5),
            trajectory(&[3.0], 0.1),
        ]
        .into_iter()
        .collect();
        set.sort();
        assert_eq!(set.get(0).unwrap().final_parameters, vec![3.0]);
        assert!(set.get(2).unwrap().relative_residuals.is_nan());
        assert_eq!(set.best().unwrap().final_parameters, vec![3.0]);
    }

    #[test]
    fn test_within() {
        let a = trajectory(&[1.0, 10.0], 0.1);
        let b = trajectory(&[1.005, 10.05], 0.1);
        let c = trajectory(&[1.5, 10.0], 0.1);
        assert!(a.is_within_error_range(&b));
        assert!(!a.is_within_error_range(&c));
        assert!(a.is_within(&c, 0.6));
        assert!(!a.is_within(&c, 0.1));
    }

    #[test]
    fn test_cluster() {
        let set: FitTrajectories = vec![
            trajectory(&[1.0, 10.0], 0.2),
            trajectory(&[5.0, 1.0], 0.05),
            trajectory(&[1.001, 10.001], 0.1),
            trajectory(&[1.002, 9.999], 0.3),
        ]
        .into_iter()
        .collect();
        let clusters = set.cluster();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 3);
        assert_eq!(clusters[0].get(0).unwrap().relative_residuals, 0.1);
        assert_eq!(clusters[1].len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let mut t = trajectory(&[1.5, -2.0], 0.25);
        t.iterations = 12;
        t.evaluations = 140;
        t.residuals = 3.0;
        let set: FitTrajectories = vec![t].into_iter().collect();
        let mut buffer = Vec::new();
        set.save(&mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("initial\tfinal\terrors\tending"));

        let loaded = FitTrajectories::load(buffer.as_slice()).unwrap();
        assert_eq!(loaded.len(), 1);
        let l = loaded.get(0).unwrap();
        assert_eq!(l.final_parameters, vec![1.5, -2.0]);
        assert_eq!(l.ending, Ending::Converged);
        assert_eq!(l.iterations, 12);
        assert_eq!(l.evaluations, 140);
        assert_eq!(l.engine, "qsoas");
    }

    #[test]
    fn test_load_truncated_records() {
        let text = "initial\tfinal\terrors\tending\n1,2\t3,4\t0.1,0.1\tok\n5\t6\n";
        let loaded = FitTrajectories::load(text.as_bytes()).unwrap();
        assert_eq!(loaded.len(), 2);
        let first = loaded.get(0).unwrap();
        assert_eq!(first.final_parameters, vec![3.0, 4.0]);
        assert_eq!(first.ending, Ending::Converged);
        assert!(first.residuals.is_nan());
        let second = loaded.get(1).unwrap();
        assert_eq!(second.ending, Ending::Invalid);

        let bad = "initial\tfinal\n1\tx\n";
        assert!(matches!(
            FitTrajectories::load(bad.as_bytes()),
            Err(FitError::Trajectory(_))
        ));
        let short = "initial\tfinal\n1\n";
        assert!(FitTrajectories::load(short.as_bytes()).is_err());
    }
}
