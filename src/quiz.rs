use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    Identification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

/// One question-bank entry. Field names match the stored quiz documents:
/// `multiple_choice` questions own `choices`, the other two types own
/// `correct_answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub question: String,
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognitive_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

fn default_points() -> u32 {
    1
}

impl Question {
    pub fn correct_choice(&self) -> Option<&Choice> {
        self.choices.iter().find(|c| c.is_correct)
    }
}

/// A validation failure, pointing at the offending question and field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankIssue {
    pub question_index: usize,
    pub field: &'static str,
    pub message: String,
}

pub fn parse_bank(raw: &serde_json::Value) -> Result<Vec<Question>, String> {
    serde_json::from_value(raw.clone()).map_err(|e| e.to_string())
}

/// Pre-persistence validation. Every rule here is checked before any write
/// so the composer and scorer can assume a well-formed bank.
pub fn validate_bank(bank: &[Question]) -> Result<(), BankIssue> {
    for (i, q) in bank.iter().enumerate() {
        if q.question.trim().is_empty() {
            return Err(BankIssue {
                question_index: i,
                field: "question",
                message: "question text must not be empty".to_string(),
            });
        }
        if q.points < 1 {
            return Err(BankIssue {
                question_index: i,
                field: "points",
                message: "points must be at least 1".to_string(),
            });
        }
        match q.kind {
            QuestionKind::MultipleChoice => {
                if q.choices.len() < 2 {
                    return Err(BankIssue {
                        question_index: i,
                        field: "choices",
                        message: "multiple choice questions need at least 2 choices".to_string(),
                    });
                }
                if q.choices.iter().any(|c| c.text.trim().is_empty()) {
                    return Err(BankIssue {
                        question_index: i,
                        field: "choices",
                        message: "choice text must not be empty".to_string(),
                    });
                }
                let correct = q.choices.iter().filter(|c| c.is_correct).count();
                if correct != 1 {
                    return Err(BankIssue {
                        question_index: i,
                        field: "choices",
                        message: format!(
                            "exactly one choice must be marked correct (found {})",
                            correct
                        ),
                    });
                }
            }
            QuestionKind::TrueFalse => {
                let ok = q
                    .correct_answer
                    .as_deref()
                    .map(|a| {
                        let t = a.trim();
                        t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false")
                    })
                    .unwrap_or(false);
                if !ok {
                    return Err(BankIssue {
                        question_index: i,
                        field: "correctAnswer",
                        message: "true/false answer must be True or False".to_string(),
                    });
                }
            }
            QuestionKind::Identification => {
                let blank = q
                    .correct_answer
                    .as_deref()
                    .map(|a| a.trim().is_empty())
                    .unwrap_or(true);
                if blank {
                    return Err(BankIssue {
                        question_index: i,
                        field: "correctAnswer",
                        message: "identification questions need a correct answer".to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

pub fn total_points(bank: &[Question]) -> u32 {
    bank.iter().map(|q| q.points).sum()
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationStats {
    pub hots: usize,
    pub lots: usize,
    pub unclassified: usize,
}

/// HOTS/LOTS tally across the bank, kept on the quiz record for reporting.
pub fn classification_stats(bank: &[Question]) -> ClassificationStats {
    let mut stats = ClassificationStats::default();
    for q in bank {
        match q.bloom_classification.as_deref() {
            Some("HOTS") => stats.hots += 1,
            Some("LOTS") => stats.lots += 1,
            _ => stats.unclassified += 1,
        }
    }
    stats
}
