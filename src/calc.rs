use serde::Serialize;
use thiserror::Error;

use crate::section::{Category, CategoryScores, ScoreEntry, Subject};
use crate::transmute::{transmute, Revision};

/// Malformed input to the computation engine. These are rejected before any
/// projection write; they are never coerced to zero.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("entry '{entry_id}': score must be >= 0, got {score}")]
    NegativeScore { entry_id: String, score: f64 },
    #[error("entry '{entry_id}': totalPoints must be >= 0, got {total_points}")]
    NegativeTotalPoints { entry_id: String, total_points: f64 },
    #[error("category weights must sum to 100, got {0}")]
    BadWeights(f64),
}

/// One-decimal display rounding, `Int(10*x + 0.5) / 10`. Internal figures
/// stay at full precision; only formatted output goes through this.
pub fn round1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

fn validate_entries(entries: &[ScoreEntry]) -> Result<(), CalcError> {
    for e in entries {
        if e.total_points < 0.0 {
            return Err(CalcError::NegativeTotalPoints {
                entry_id: e.id.clone(),
                total_points: e.total_points,
            });
        }
        if let Some(v) = e.score {
            if v < 0.0 {
                return Err(CalcError::NegativeScore {
                    entry_id: e.id.clone(),
                    score: v,
                });
            }
        }
    }
    Ok(())
}

/// Percentage over graded entries only. Ungraded entries (no score, or a
/// zero denominator) are excluded from both numerator and denominator.
pub fn category_percentage(entries: &[ScoreEntry]) -> f64 {
    let mut sum = 0.0_f64;
    let mut total = 0.0_f64;
    for e in entries.iter().filter(|e| e.is_graded()) {
        sum += e.score.unwrap_or(0.0);
        total += e.total_points;
    }
    if total > 0.0 {
        100.0 * sum / total
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterComputation {
    pub written_work_percent: f64,
    pub performance_task_percent: f64,
    pub quarterly_exam_percent: f64,
    pub initial_grade: f64,
    pub transmuted_grade: f64,
}

impl QuarterComputation {
    /// A transmuted grade of 0 marks an unpopulated quarter; callers must
    /// treat it as "ungraded", never render it as a real grade.
    pub fn is_populated(&self) -> bool {
        self.transmuted_grade > 0.0
    }
}

/// Computes one quarter of one subject: the three category percentages, the
/// weighted initial grade, and its transmutation. Pure and deterministic.
///
/// A quarter with no graded entries in any category computes to all zeros
/// rather than passing 0 through the transmutation table.
pub fn quarter_grade(
    scores: &CategoryScores,
    subject: &Subject,
    grade_level: i64,
    revision: Revision,
) -> Result<QuarterComputation, CalcError> {
    let weights = &subject.weights;
    if (weights.total() - 100.0).abs() > 1e-6 {
        return Err(CalcError::BadWeights(weights.total()));
    }
    for category in [
        Category::WrittenWork,
        Category::PerformanceTask,
        Category::QuarterlyExam,
    ] {
        validate_entries(scores.entries(category))?;
    }

    if !scores.has_graded_entries() {
        return Ok(QuarterComputation::default());
    }

    let ww = category_percentage(scores.entries(Category::WrittenWork));
    let pt = category_percentage(scores.entries(Category::PerformanceTask));
    let qe = category_percentage(scores.entries(Category::QuarterlyExam));
    let initial = ww * weights.weight(Category::WrittenWork) / 100.0
        + pt * weights.weight(Category::PerformanceTask) / 100.0
        + qe * weights.weight(Category::QuarterlyExam) / 100.0;
    Ok(QuarterComputation {
        written_work_percent: ww,
        performance_task_percent: pt,
        quarterly_exam_percent: qe,
        initial_grade: initial,
        transmuted_grade: transmute(initial, grade_level, revision),
    })
}

/// Average of transmuted grades over populated quarters only. Returns 0 when
/// no quarter is populated; callers must treat that as "ungraded".
pub fn final_subject_grade(quarters: &[QuarterComputation]) -> f64 {
    let mut sum = 0.0_f64;
    let mut count = 0usize;
    for q in quarters.iter().filter(|q| q.is_populated()) {
        sum += q.transmuted_grade;
        count += 1;
    }
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

/// Arithmetic mean of subject final grades that are > 0; 0 if none are.
pub fn general_average(subject_finals: &[f64]) -> f64 {
    let mut sum = 0.0_f64;
    let mut count = 0usize;
    for g in subject_finals.iter().filter(|g| **g > 0.0) {
        sum += g;
        count += 1;
    }
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}
