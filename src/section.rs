use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ServiceError;

/// The three graded buckets with fixed per-subject weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    WrittenWork,
    PerformanceTask,
    QuarterlyExam,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub id: String,
    pub name: String,
    pub score: Option<f64>,
    pub total_points: f64,
}

impl ScoreEntry {
    /// An entry counts toward a percentage only when it has a score and a
    /// positive denominator. Anything else is excluded entirely, never
    /// treated as zero.
    pub fn is_graded(&self) -> bool {
        self.score.is_some() && self.total_points > 0.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScores {
    #[serde(default)]
    pub written_work: Vec<ScoreEntry>,
    #[serde(default)]
    pub performance_task: Vec<ScoreEntry>,
    #[serde(default)]
    pub quarterly_exam: Vec<ScoreEntry>,
}

impl CategoryScores {
    pub fn entries(&self, category: Category) -> &[ScoreEntry] {
        match category {
            Category::WrittenWork => &self.written_work,
            Category::PerformanceTask => &self.performance_task,
            Category::QuarterlyExam => &self.quarterly_exam,
        }
    }

    pub fn entries_mut(&mut self, category: Category) -> &mut Vec<ScoreEntry> {
        match category {
            Category::WrittenWork => &mut self.written_work,
            Category::PerformanceTask => &mut self.performance_task,
            Category::QuarterlyExam => &mut self.quarterly_exam,
        }
    }

    pub fn has_graded_entries(&self) -> bool {
        self.written_work
            .iter()
            .chain(&self.performance_task)
            .chain(&self.quarterly_exam)
            .any(ScoreEntry::is_graded)
    }

    fn all_lists_mut(&mut self) -> [&mut Vec<ScoreEntry>; 3] {
        [
            &mut self.written_work,
            &mut self.performance_task,
            &mut self.quarterly_exam,
        ]
    }
}

/// Exactly four period slots. Semestral levels read the same slots two per
/// semester; the computation does not change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuarterGrades {
    #[serde(default)]
    pub quarter1: CategoryScores,
    #[serde(default)]
    pub quarter2: CategoryScores,
    #[serde(default)]
    pub quarter3: CategoryScores,
    #[serde(default)]
    pub quarter4: CategoryScores,
}

impl QuarterGrades {
    pub fn quarter_mut(&mut self, q: u8) -> Option<&mut CategoryScores> {
        match q {
            1 => Some(&mut self.quarter1),
            2 => Some(&mut self.quarter2),
            3 => Some(&mut self.quarter3),
            4 => Some(&mut self.quarter4),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &CategoryScores)> {
        [
            (1, &self.quarter1),
            (2, &self.quarter2),
            (3, &self.quarter3),
            (4, &self.quarter4),
        ]
        .into_iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut CategoryScores> {
        [
            &mut self.quarter1,
            &mut self.quarter2,
            &mut self.quarter3,
            &mut self.quarter4,
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryWeights {
    pub written_work: f64,
    pub performance_task: f64,
    pub quarterly_exam: f64,
}

impl CategoryWeights {
    pub fn weight(&self, category: Category) -> f64 {
        match category {
            Category::WrittenWork => self.written_work,
            Category::PerformanceTask => self.performance_task,
            Category::QuarterlyExam => self.quarterly_exam,
        }
    }

    pub fn total(&self) -> f64 {
        self.written_work + self.performance_task + self.quarterly_exam
    }
}

/// Assessment definitions are shared by every student in the section; edits
/// to one must be mirrored into every student's score set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub quarter: u8,
    pub max_points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub weights: CategoryWeights,
    #[serde(default)]
    pub assessments: Vec<Assessment>,
}

/// Roster entry. A student with no `connectedUserId` is local-only: its
/// grades live solely inside the section and are never projected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lrn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub grade_data: HashMap<String, QuarterGrades>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub name: String,
    pub grade_level: i64,
    pub owner_id: String,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub students: Vec<Student>,
}

impl Section {
    pub fn subject(&self, subject_id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == subject_id)
    }

    pub fn student(&self, student_id: &str) -> Option<&Student> {
        self.students.iter().find(|s| s.id == student_id)
    }

    /// Rejects malformed documents before they reach the store: category
    /// weights must sum to 100 and assessments must have a valid quarter
    /// and a non-negative denominator.
    pub fn validate(&self) -> Result<(), ServiceError> {
        for subject in &self.subjects {
            if (subject.weights.total() - 100.0).abs() > 1e-6 {
                return Err(ServiceError::Validation(format!(
                    "subject '{}': category weights must sum to 100, got {}",
                    subject.name,
                    subject.weights.total()
                )));
            }
            for a in &subject.assessments {
                if !(1..=4).contains(&a.quarter) {
                    return Err(ServiceError::Validation(format!(
                        "assessment '{}': quarter must be 1-4, got {}",
                        a.name, a.quarter
                    )));
                }
                if a.max_points < 0.0 {
                    return Err(ServiceError::Validation(format!(
                        "assessment '{}': maxPoints must be >= 0, got {}",
                        a.name, a.max_points
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns a copy with one student's score set for an assessment.
    /// The entry's name and denominator always mirror the definition.
    pub fn with_score(
        &self,
        student_id: &str,
        subject_id: &str,
        assessment_id: &str,
        score: Option<f64>,
    ) -> Result<Section, ServiceError> {
        if let Some(v) = score {
            if v < 0.0 {
                return Err(ServiceError::Validation(format!(
                    "score must be >= 0, got {}",
                    v
                )));
            }
        }

        let subject = self
            .subject(subject_id)
            .ok_or(ServiceError::NotFound("subject"))?;
        let def = subject
            .assessments
            .iter()
            .find(|a| a.id == assessment_id)
            .ok_or(ServiceError::NotFound("assessment"))?
            .clone();
        if self.student(student_id).is_none() {
            return Err(ServiceError::NotFound("student"));
        }

        let mut next = self.clone();
        let student = next
            .students
            .iter_mut()
            .find(|s| s.id == student_id)
            .expect("student checked above");
        let quarters = student.grade_data.entry(subject_id.to_string()).or_default();
        let scores = quarters
            .quarter_mut(def.quarter)
            .ok_or_else(|| ServiceError::Validation(format!("quarter must be 1-4, got {}", def.quarter)))?;
        let list = scores.entries_mut(def.category);
        match list.iter_mut().find(|e| e.id == def.id) {
            Some(entry) => {
                entry.score = score;
                entry.name = def.name.clone();
                entry.total_points = def.max_points;
            }
            None => list.push(ScoreEntry {
                id: def.id.clone(),
                name: def.name.clone(),
                score,
                total_points: def.max_points,
            }),
        }
        Ok(next)
    }

    /// Returns a copy with an assessment added to a subject and a matching
    /// unscored entry seeded into every student's score set.
    pub fn with_assessment_added(
        &self,
        subject_id: &str,
        assessment: Assessment,
    ) -> Result<Section, ServiceError> {
        if !(1..=4).contains(&assessment.quarter) {
            return Err(ServiceError::Validation(format!(
                "quarter must be 1-4, got {}",
                assessment.quarter
            )));
        }
        if assessment.max_points < 0.0 {
            return Err(ServiceError::Validation(format!(
                "maxPoints must be >= 0, got {}",
                assessment.max_points
            )));
        }
        let subject = self
            .subject(subject_id)
            .ok_or(ServiceError::NotFound("subject"))?;
        if subject.assessments.iter().any(|a| a.id == assessment.id) {
            return Err(ServiceError::Conflict(format!(
                "assessment {} already exists",
                assessment.id
            )));
        }

        let mut next = self.clone();
        for student in &mut next.students {
            let quarters = student.grade_data.entry(subject_id.to_string()).or_default();
            let scores = quarters
                .quarter_mut(assessment.quarter)
                .expect("quarter validated above");
            scores.entries_mut(assessment.category).push(ScoreEntry {
                id: assessment.id.clone(),
                name: assessment.name.clone(),
                score: None,
                total_points: assessment.max_points,
            });
        }
        let subject = next
            .subjects
            .iter_mut()
            .find(|s| s.id == subject_id)
            .expect("subject checked above");
        subject.assessments.push(assessment);
        Ok(next)
    }

    /// Returns a copy with an assessment removed from a subject along with
    /// its entry in every student's score set.
    pub fn with_assessment_removed(
        &self,
        subject_id: &str,
        assessment_id: &str,
    ) -> Result<Section, ServiceError> {
        let subject = self
            .subject(subject_id)
            .ok_or(ServiceError::NotFound("subject"))?;
        if !subject.assessments.iter().any(|a| a.id == assessment_id) {
            return Err(ServiceError::NotFound("assessment"));
        }

        let mut next = self.clone();
        let subject = next
            .subjects
            .iter_mut()
            .find(|s| s.id == subject_id)
            .expect("subject checked above");
        subject.assessments.retain(|a| a.id != assessment_id);
        for student in &mut next.students {
            if let Some(quarters) = student.grade_data.get_mut(subject_id) {
                for scores in quarters.iter_mut() {
                    for list in scores.all_lists_mut() {
                        list.retain(|e| e.id != assessment_id);
                    }
                }
            }
        }
        Ok(next)
    }

    /// Returns a copy with an assessment renamed; every student's mirrored
    /// entry picks up the new name.
    pub fn with_assessment_renamed(
        &self,
        subject_id: &str,
        assessment_id: &str,
        name: &str,
    ) -> Result<Section, ServiceError> {
        let subject = self
            .subject(subject_id)
            .ok_or(ServiceError::NotFound("subject"))?;
        if !subject.assessments.iter().any(|a| a.id == assessment_id) {
            return Err(ServiceError::NotFound("assessment"));
        }

        let mut next = self.clone();
        let subject = next
            .subjects
            .iter_mut()
            .find(|s| s.id == subject_id)
            .expect("subject checked above");
        for a in &mut subject.assessments {
            if a.id == assessment_id {
                a.name = name.to_string();
            }
        }
        for student in &mut next.students {
            if let Some(quarters) = student.grade_data.get_mut(subject_id) {
                for scores in quarters.iter_mut() {
                    for list in scores.all_lists_mut() {
                        for e in list.iter_mut() {
                            if e.id == assessment_id {
                                e.name = name.to_string();
                            }
                        }
                    }
                }
            }
        }
        Ok(next)
    }

    /// Returns a copy with a student's connection reference set or cleared.
    pub fn with_connected_user(
        &self,
        student_id: &str,
        user_id: Option<&str>,
    ) -> Result<Section, ServiceError> {
        if self.student(student_id).is_none() {
            return Err(ServiceError::NotFound("student"));
        }
        let mut next = self.clone();
        let student = next
            .students
            .iter_mut()
            .find(|s| s.id == student_id)
            .expect("student checked above");
        student.connected_user_id = user_id.map(str::to_string);
        Ok(next)
    }
}

pub fn get(conn: &Connection, section_id: &str) -> Result<Section, ServiceError> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM sections WHERE id = ?", [section_id], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(doc) = doc else {
        return Err(ServiceError::NotFound("section"));
    };
    serde_json::from_str(&doc)
        .map_err(|e| ServiceError::Validation(format!("corrupt section document: {}", e)))
}

pub fn list(conn: &Connection, owner_id: &str) -> Result<Vec<Section>, ServiceError> {
    let mut stmt = conn.prepare("SELECT doc FROM sections WHERE owner_id = ? ORDER BY name")?;
    let docs: Vec<String> = stmt
        .query_map([owner_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    docs.iter()
        .map(|doc| {
            serde_json::from_str(doc)
                .map_err(|e| ServiceError::Validation(format!("corrupt section document: {}", e)))
        })
        .collect()
}

/// Whole-document save, last-write-wins.
pub fn save(conn: &Connection, section: &Section) -> Result<(), ServiceError> {
    section.validate()?;
    let doc = serde_json::to_string(section)
        .map_err(|e| ServiceError::Validation(format!("section document encoding: {}", e)))?;
    conn.execute(
        "INSERT INTO sections(id, owner_id, name, grade_level, doc, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           owner_id = excluded.owner_id,
           name = excluded.name,
           grade_level = excluded.grade_level,
           doc = excluded.doc,
           updated_at = excluded.updated_at",
        (
            &section.id,
            &section.owner_id,
            &section.name,
            section.grade_level,
            &doc,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_section() -> Section {
        Section {
            id: "sec-1".into(),
            name: "Sampaguita".into(),
            grade_level: 7,
            owner_id: "teacher-1".into(),
            subjects: vec![Subject {
                id: "math".into(),
                name: "Mathematics".into(),
                weights: CategoryWeights {
                    written_work: 30.0,
                    performance_task: 50.0,
                    quarterly_exam: 20.0,
                },
                assessments: vec![Assessment {
                    id: "ww-1".into(),
                    name: "Quiz 1".into(),
                    category: Category::WrittenWork,
                    quarter: 1,
                    max_points: 10.0,
                }],
            }],
            students: vec![Student {
                id: "stu-1".into(),
                name: "Reyes, Juan".into(),
                lrn: Some("136414090001".into()),
                gender: None,
                grade_data: HashMap::new(),
                connected_user_id: None,
            }],
        }
    }

    #[test]
    fn with_score_leaves_original_untouched() {
        let section = sample_section();
        let next = section
            .with_score("stu-1", "math", "ww-1", Some(8.0))
            .expect("set score");
        assert!(section.students[0].grade_data.is_empty());
        let entry = &next.students[0].grade_data["math"].quarter1.written_work[0];
        assert_eq!(entry.score, Some(8.0));
        assert_eq!(entry.total_points, 10.0);
        assert_eq!(entry.name, "Quiz 1");
    }

    #[test]
    fn with_score_rejects_negative_values() {
        let section = sample_section();
        let err = section
            .with_score("stu-1", "math", "ww-1", Some(-1.0))
            .expect_err("negative score");
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn assessment_add_seeds_every_student() {
        let mut section = sample_section();
        section.students.push(Student {
            id: "stu-2".into(),
            name: "Santos, Maria".into(),
            lrn: None,
            gender: None,
            grade_data: HashMap::new(),
            connected_user_id: None,
        });

        let next = section
            .with_assessment_added(
                "math",
                Assessment {
                    id: "pt-1".into(),
                    name: "Project".into(),
                    category: Category::PerformanceTask,
                    quarter: 2,
                    max_points: 50.0,
                },
            )
            .expect("add assessment");

        assert_eq!(next.subjects[0].assessments.len(), 2);
        for student in &next.students {
            let entries = &student.grade_data["math"].quarter2.performance_task;
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].id, "pt-1");
            assert_eq!(entries[0].score, None);
        }
    }

    #[test]
    fn assessment_removal_clears_every_score_entry() {
        let section = sample_section();
        let scored = section
            .with_score("stu-1", "math", "ww-1", Some(8.0))
            .expect("set score");
        let next = scored
            .with_assessment_removed("math", "ww-1")
            .expect("remove assessment");
        assert!(next.subjects[0].assessments.is_empty());
        assert!(next.students[0].grade_data["math"]
            .quarter1
            .written_work
            .is_empty());
    }

    #[test]
    fn assessment_rename_mirrors_into_entries() {
        let section = sample_section();
        let scored = section
            .with_score("stu-1", "math", "ww-1", Some(8.0))
            .expect("set score");
        let next = scored
            .with_assessment_renamed("math", "ww-1", "Long Quiz 1")
            .expect("rename");
        assert_eq!(next.subjects[0].assessments[0].name, "Long Quiz 1");
        assert_eq!(
            next.students[0].grade_data["math"].quarter1.written_work[0].name,
            "Long Quiz 1"
        );
    }

    #[test]
    fn validate_rejects_bad_weights() {
        let mut section = sample_section();
        section.subjects[0].weights.quarterly_exam = 30.0;
        let err = section.validate().expect_err("weights sum 110");
        assert_eq!(err.code(), "bad_params");
    }
}
