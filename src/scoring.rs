use crate::quiz::{Question, QuestionKind};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub raw_score_percentage: u32,
    pub base50_score_percentage: u32,
    pub correct_points: u32,
    pub total_points: u32,
    pub total_questions: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub answered: bool,
    pub correct: bool,
    pub points_awarded: u32,
}

/// JS-style `Math.round` for non-negative values: half-up.
fn round_half_up(x: f64) -> u32 {
    (x + 0.5).floor() as u32
}

/// Correctness of one answer against one question, as delivered (choices in
/// their shuffled order). Multiple choice matches the marked choice's text
/// exactly; true/false compares case-insensitively; identification also
/// trims surrounding whitespace.
pub fn answer_is_correct(question: &Question, answer: &str) -> bool {
    match question.kind {
        QuestionKind::MultipleChoice => question
            .correct_choice()
            .map(|c| answer == c.text)
            .unwrap_or(false),
        QuestionKind::TrueFalse => question
            .correct_answer
            .as_deref()
            .map(|a| answer.to_lowercase() == a.to_lowercase())
            .unwrap_or(false),
        QuestionKind::Identification => question
            .correct_answer
            .as_deref()
            .map(|a| answer.to_lowercase().trim() == a.to_lowercase().trim())
            .unwrap_or(false),
    }
}

pub fn question_results(
    questions: &[Question],
    answers: &HashMap<usize, String>,
) -> Vec<QuestionResult> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| {
            // An empty answer counts as unanswered, never as an error.
            let answer = answers.get(&i).filter(|a| !a.is_empty());
            let correct = answer.map(|a| answer_is_correct(q, a)).unwrap_or(false);
            QuestionResult {
                answered: answer.is_some(),
                correct,
                points_awarded: if correct { q.points } else { 0 },
            }
        })
        .collect()
}

/// Raw and base-50 scores over the delivered question list. Pure: the same
/// (questions, answers) always yield the same summary.
pub fn score(questions: &[Question], answers: &HashMap<usize, String>) -> ScoreSummary {
    let results = question_results(questions, answers);
    let total_points: u32 = questions.iter().map(|q| q.points).sum();
    let correct_points: u32 = results.iter().map(|r| r.points_awarded).sum();

    let raw = if total_points > 0 {
        round_half_up(100.0 * correct_points as f64 / total_points as f64)
    } else {
        0
    };
    let base50 = round_half_up(50.0 + raw as f64 / 2.0);

    ScoreSummary {
        raw_score_percentage: raw,
        base50_score_percentage: base50,
        correct_points,
        total_points,
        total_questions: questions.len(),
    }
}
