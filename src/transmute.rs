use serde::{Deserialize, Serialize};

/// Transmutation rule revision. The mapping from an initial weighted grade
/// to the officially reported grade is a versioned policy table, so callers
/// select the revision explicitly rather than relying on a single built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Revision {
    /// DepEd Order 8, s. 2015 bracket table.
    #[default]
    #[serde(rename = "k12-2015")]
    K12_2015,
    /// Pre-K-12 base-60 linear scheme.
    #[serde(rename = "legacy")]
    Legacy,
}

/// DepEd 2015 brackets: (lower bound of initial grade, transmuted grade).
/// Checked top-down; an initial grade of exactly 100 maps to 100.
const K12_2015_BRACKETS: &[(f64, f64)] = &[
    (98.4, 99.0),
    (96.8, 98.0),
    (95.2, 97.0),
    (93.6, 96.0),
    (92.0, 95.0),
    (90.4, 94.0),
    (88.8, 93.0),
    (87.2, 92.0),
    (85.6, 91.0),
    (84.0, 90.0),
    (82.4, 89.0),
    (80.8, 88.0),
    (79.2, 87.0),
    (77.6, 86.0),
    (76.0, 85.0),
    (74.4, 84.0),
    (72.8, 83.0),
    (71.2, 82.0),
    (69.6, 81.0),
    (68.0, 80.0),
    (66.4, 79.0),
    (64.8, 78.0),
    (63.2, 77.0),
    (61.6, 76.0),
    (60.0, 75.0),
    (56.0, 74.0),
    (52.0, 73.0),
    (48.0, 72.0),
    (44.0, 71.0),
    (40.0, 70.0),
    (36.0, 69.0),
    (32.0, 68.0),
    (28.0, 67.0),
    (24.0, 66.0),
    (20.0, 65.0),
    (16.0, 64.0),
    (12.0, 63.0),
    (8.0, 62.0),
    (4.0, 61.0),
    (0.0, 60.0),
];

/// Maps an initial grade to the official reported grade for the given rule
/// revision and grade level. The input is clamped to [0, 100] before lookup
/// and the result is monotonically non-decreasing in the input.
pub fn transmute(initial: f64, grade_level: i64, revision: Revision) -> f64 {
    let x = initial.clamp(0.0, 100.0);
    match revision {
        Revision::K12_2015 => {
            // One table covers both the quarterly (grades 1-10) and the
            // semestral (grades 11-12) schemes under the 2015 order.
            let _ = grade_level;
            if x >= 100.0 {
                return 100.0;
            }
            bracket_grade(x, K12_2015_BRACKETS)
        }
        Revision::Legacy => 60.0 + 0.4 * x,
    }
}

fn bracket_grade(x: f64, brackets: &[(f64, f64)]) -> f64 {
    for &(lower, grade) in brackets {
        if x >= lower {
            return grade;
        }
    }
    // Brackets cover [0, 100]; clamp above guarantees we never fall through.
    brackets.last().map(|&(_, g)| g).unwrap_or(0.0)
}
