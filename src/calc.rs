use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkState {
    /// Nothing entered yet.
    NotEntered,
    Absent,
    Scored(f64),
}

impl MarkState {
    pub fn obtained(self) -> f64 {
        match self {
            MarkState::Scored(v) => v,
            MarkState::NotEntered | MarkState::Absent => 0.0,
        }
    }
}

pub fn round_to(x: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (x * f).round() / f
}

pub fn compute_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Some(v[mid])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub min: f64,
    pub grade: String,
}

pub fn default_grade_bands() -> Vec<GradeBand> {
    [
        (90.0, "A+"),
        (80.0, "A"),
        (70.0, "B"),
        (60.0, "C"),
        (50.0, "D"),
        (40.0, "E"),
        (0.0, "F"),
    ]
    .into_iter()
    .map(|(min, grade)| GradeBand {
        min,
        grade: grade.to_string(),
    })
    .collect()
}

/// Highest band whose `min` the percentage reaches; bands may be unsorted.
pub fn grade_for(percent: f64, bands: &[GradeBand]) -> Option<String> {
    bands
        .iter()
        .filter(|b| percent >= b.min)
        .max_by(|a, b| a.min.partial_cmp(&b.min).unwrap_or(Ordering::Equal))
        .map(|b| b.grade.clone())
}

/// Competition ranking ("1224"): equal totals share a rank and the next rank
/// skips. Returns ranks aligned with `totals`.
pub fn competition_ranks(totals: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..totals.len()).collect();
    order.sort_by(|a, b| {
        totals[*b]
            .partial_cmp(&totals[*a])
            .unwrap_or(Ordering::Equal)
    });
    let mut ranks = vec![0usize; totals.len()];
    for (pos, idx) in order.iter().enumerate() {
        if pos > 0 && totals[order[pos - 1]] == totals[*idx] {
            ranks[*idx] = ranks[order[pos - 1]];
        } else {
            ranks[*idx] = pos + 1;
        }
    }
    ranks
}

#[derive(Debug, Clone)]
pub struct SubjectDef {
    pub subject_id: String,
    pub max_marks: f64,
    pub pass_marks: f64,
}

#[derive(Debug, Clone)]
pub struct GradingPolicy {
    pub pass_percent: f64,
    pub bands: Vec<GradeBand>,
    pub round_decimals: u32,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            pass_percent: 40.0,
            bands: default_grade_bands(),
            round_decimals: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub marks: Option<f64>,
    pub absent: bool,
    pub max_marks: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub grade: Option<String>,
    pub passed: bool,
    pub rank: usize,
    pub subjects: Vec<SubjectResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub max_marks: f64,
    pub average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub median: Option<f64>,
    pub scored_count: usize,
    pub absent_count: usize,
    pub pass_count: usize,
}

fn subject_passed(state: MarkState, def: &SubjectDef) -> bool {
    match state {
        MarkState::Scored(v) => v >= def.pass_marks,
        MarkState::Absent | MarkState::NotEntered => false,
    }
}

/// Results for one exam. `marks` is keyed by (student_id, subject_id); any
/// missing pair counts as not entered.
pub fn exam_results(
    student_ids: &[String],
    subjects: &[SubjectDef],
    marks: &HashMap<(String, String), MarkState>,
    policy: &GradingPolicy,
) -> (Vec<StudentResult>, Vec<SubjectStats>) {
    let max_total: f64 = subjects.iter().map(|s| s.max_marks).sum();
    let mut results: Vec<StudentResult> = Vec::with_capacity(student_ids.len());

    for student_id in student_ids {
        let mut total = 0.0;
        let mut all_passed = !subjects.is_empty();
        let mut subject_rows = Vec::with_capacity(subjects.len());
        for def in subjects {
            let state = marks
                .get(&(student_id.clone(), def.subject_id.clone()))
                .copied()
                .unwrap_or(MarkState::NotEntered);
            total += state.obtained();
            let passed = subject_passed(state, def);
            all_passed &= passed;
            subject_rows.push(SubjectResult {
                subject_id: def.subject_id.clone(),
                marks: match state {
                    MarkState::Scored(v) => Some(v),
                    _ => None,
                },
                absent: state == MarkState::Absent,
                max_marks: def.max_marks,
                passed,
            });
        }
        let percentage = if max_total > 0.0 {
            round_to(100.0 * total / max_total, policy.round_decimals)
        } else {
            0.0
        };
        results.push(StudentResult {
            student_id: student_id.clone(),
            total: round_to(total, policy.round_decimals),
            max_total,
            percentage,
            grade: grade_for(percentage, &policy.bands),
            passed: all_passed && percentage >= policy.pass_percent,
            rank: 0,
            subjects: subject_rows,
        });
    }

    let totals: Vec<f64> = results.iter().map(|r| r.total).collect();
    for (r, rank) in results.iter_mut().zip(competition_ranks(&totals)) {
        r.rank = rank;
    }

    let stats = subjects
        .iter()
        .map(|def| {
            let mut scored: Vec<f64> = Vec::new();
            let mut absent_count = 0usize;
            let mut pass_count = 0usize;
            for student_id in student_ids {
                let state = marks
                    .get(&(student_id.clone(), def.subject_id.clone()))
                    .copied()
                    .unwrap_or(MarkState::NotEntered);
                match state {
                    MarkState::Scored(v) => scored.push(v),
                    MarkState::Absent => absent_count += 1,
                    MarkState::NotEntered => {}
                }
                if subject_passed(state, def) {
                    pass_count += 1;
                }
            }
            let average = if scored.is_empty() {
                None
            } else {
                Some(round_to(
                    scored.iter().sum::<f64>() / scored.len() as f64,
                    policy.round_decimals,
                ))
            };
            SubjectStats {
                subject_id: def.subject_id.clone(),
                max_marks: def.max_marks,
                average,
                highest: scored.iter().copied().reduce(f64::max),
                lowest: scored.iter().copied().reduce(f64::min),
                median: compute_median(&scored),
                scored_count: scored.len(),
                absent_count,
                pass_count,
            }
        })
        .collect();

    (results, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str, sub: &str) -> (String, String) {
        (s.to_string(), sub.to_string())
    }

    #[test]
    fn rounding_and_median() {
        assert_eq!(round_to(66.666_666, 2), 66.67);
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(compute_median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(compute_median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(compute_median(&[]), None);
    }

    #[test]
    fn grade_bands_pick_highest_reached() {
        let bands = default_grade_bands();
        assert_eq!(grade_for(95.0, &bands).as_deref(), Some("A+"));
        assert_eq!(grade_for(80.0, &bands).as_deref(), Some("A"));
        assert_eq!(grade_for(39.99, &bands).as_deref(), Some("F"));
        let partial = vec![GradeBand {
            min: 50.0,
            grade: "P".into(),
        }];
        assert_eq!(grade_for(10.0, &partial), None);
    }

    #[test]
    fn ties_share_competition_rank() {
        assert_eq!(competition_ranks(&[90.0, 75.0, 90.0, 60.0]), vec![1, 3, 1, 4]);
        assert!(competition_ranks(&[]).is_empty());
    }

    #[test]
    fn exam_results_totals_pass_and_stats() {
        let students = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let subjects = vec![
            SubjectDef {
                subject_id: "math".into(),
                max_marks: 100.0,
                pass_marks: 35.0,
            },
            SubjectDef {
                subject_id: "eng".into(),
                max_marks: 50.0,
                pass_marks: 20.0,
            },
        ];
        let mut marks = HashMap::new();
        marks.insert(key("s1", "math"), MarkState::Scored(90.0));
        marks.insert(key("s1", "eng"), MarkState::Scored(45.0));
        marks.insert(key("s2", "math"), MarkState::Scored(30.0));
        marks.insert(key("s2", "eng"), MarkState::Scored(40.0));
        marks.insert(key("s3", "math"), MarkState::Absent);
        marks.insert(key("s3", "eng"), MarkState::Scored(50.0));

        let (results, stats) = exam_results(&students, &subjects, &marks, &GradingPolicy::default());
        assert_eq!(results[0].total, 135.0);
        assert_eq!(results[0].percentage, 90.0);
        assert_eq!(results[0].grade.as_deref(), Some("A+"));
        assert!(results[0].passed);
        assert_eq!(results[0].rank, 1);

        // Failing one subject fails the exam even with a passing percentage.
        assert_eq!(results[1].total, 70.0);
        assert!(!results[1].passed);
        assert_eq!(results[1].rank, 2);

        assert!(results[2].subjects[0].absent);
        assert!(!results[2].passed);
        assert_eq!(results[2].rank, 3);

        let math = &stats[0];
        assert_eq!(math.scored_count, 2);
        assert_eq!(math.absent_count, 1);
        assert_eq!(math.average, Some(60.0));
        assert_eq!(math.highest, Some(90.0));
        assert_eq!(math.lowest, Some(30.0));
        assert_eq!(math.pass_count, 1);
    }
}
