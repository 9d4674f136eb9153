use crate::quiz::{Question, QuestionKind};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeSettings {
    pub shuffle_questions: bool,
    pub shuffle_choices: bool,
}

/// The question list as delivered to one learner for one attempt, plus the
/// selectable option pool for each identification question.
#[derive(Debug, Clone)]
pub struct Composition {
    pub questions: Vec<Question>,
    pub identification_options: HashMap<usize, Vec<String>>,
}

/// Deterministic per-attempt seed: FNV-1a over the assignment id, mixed with
/// the attempt counter. Re-entering an in-flight attempt reproduces the same
/// order; a new attempt or a reassigned record draws a fresh permutation.
pub fn attempt_seed(assignment_id: &str, attempt: u32) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in assignment_id.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h ^= u64::from(attempt).wrapping_add(1);
    h.wrapping_mul(0x100_0000_01b3)
}

/// Correct answers of every identification question, first-occurrence order,
/// deduplicated, blanks dropped. Shared by all identification questions in
/// the quiz.
pub fn identification_pool(bank: &[Question]) -> Vec<String> {
    let mut pool: Vec<String> = Vec::new();
    for q in bank {
        if q.kind != QuestionKind::Identification {
            continue;
        }
        let Some(answer) = q.correct_answer.as_deref() else {
            continue;
        };
        if answer.trim().is_empty() {
            continue;
        }
        if !pool.iter().any(|p| p == answer) {
            pool.push(answer.to_string());
        }
    }
    pool
}

/// Materialize the delivered question list. Buckets stay in the fixed order
/// multiple_choice, true_false, identification; shuffles are Fisher-Yates
/// within each bucket, then per multiple-choice question for choices, then
/// per identification question for its option pool.
pub fn compose(bank: &[Question], settings: ComposeSettings, seed: u64) -> Composition {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut multiple_choice: Vec<Question> = Vec::new();
    let mut true_false: Vec<Question> = Vec::new();
    let mut identification: Vec<Question> = Vec::new();
    for q in bank {
        match q.kind {
            QuestionKind::MultipleChoice => multiple_choice.push(q.clone()),
            QuestionKind::TrueFalse => true_false.push(q.clone()),
            QuestionKind::Identification => identification.push(q.clone()),
        }
    }

    if settings.shuffle_questions {
        multiple_choice.shuffle(&mut rng);
        true_false.shuffle(&mut rng);
        identification.shuffle(&mut rng);
    }

    let mut questions = multiple_choice;
    questions.append(&mut true_false);
    questions.append(&mut identification);

    if settings.shuffle_choices {
        for q in questions.iter_mut() {
            if q.kind == QuestionKind::MultipleChoice {
                q.choices.shuffle(&mut rng);
            }
        }
    }

    let pool = identification_pool(bank);
    let mut identification_options = HashMap::new();
    for (i, q) in questions.iter().enumerate() {
        if q.kind == QuestionKind::Identification {
            let mut options = pool.clone();
            options.shuffle(&mut rng);
            identification_options.insert(i, options);
        }
    }

    Composition {
        questions,
        identification_options,
    }
}

const COMPUTATION_KEYWORDS: [&str; 10] = [
    "calculate",
    "compute",
    "solve",
    "solve for",
    "find the value",
    "what is the sum",
    "what is the total",
    "what is the product",
    "equation",
    "formula",
];

fn div_round(len: usize, per: usize) -> i64 {
    ((len as f64 / per as f64) + 0.5).floor() as i64
}

fn digit_run_count(text: &str) -> usize {
    let mut runs = 0;
    let mut in_run = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            if !in_run {
                runs += 1;
                in_run = true;
            }
        } else {
            in_run = false;
        }
    }
    runs
}

/// Adaptive per-question time allowance for live delivery, in whole seconds:
/// reading time for the stem and choices, a Bloom factor, and a computation
/// surcharge when the stem asks for arithmetic. Clamped to 12s (true/false)
/// or 15s minimum and 120s maximum.
pub fn question_time_allowance(q: &Question) -> u32 {
    let text = q.question.as_str();
    let lower = text.to_lowercase();

    let base: i64 = if q.kind == QuestionKind::TrueFalse { 8 } else { 10 };
    let length_factor = div_round(text.len(), 25);

    let choice_reading = if q.kind == QuestionKind::MultipleChoice {
        let total: usize = q.choices.iter().map(|c| c.text.len()).sum();
        div_round(total, 20)
    } else {
        0
    };

    let difficulty: i64 = match q.bloom_classification.as_deref() {
        Some("HOTS") => 10,
        _ => 5,
    };

    let has_keyword = COMPUTATION_KEYWORDS.iter().any(|k| lower.contains(k));
    let has_numbers = text.chars().any(|c| c.is_ascii_digit());
    let has_math_symbols = text.chars().any(|c| matches!(c, '+' | '-' | '×' | '÷' | '='));
    let computation: i64 = if has_keyword && (has_numbers || has_math_symbols) {
        let many_numbers = digit_run_count(text) >= 3;
        let percentage = lower.contains("percent") || text.contains('%');
        let multi_step = ["then", "after", "next", "first", "second"]
            .iter()
            .any(|k| lower.contains(k));
        if multi_step || (many_numbers && percentage) {
            30
        } else if many_numbers || percentage {
            20
        } else {
            10
        }
    } else {
        0
    };

    // Binary choice carries less reading load; only trim very long stems.
    let true_false_penalty: i64 = if q.kind == QuestionKind::TrueFalse && length_factor > 20 {
        -5
    } else {
        0
    };

    let total = base + length_factor + choice_reading + difficulty + computation + true_false_penalty;
    let min = if q.kind == QuestionKind::TrueFalse { 12 } else { 15 };
    total.clamp(min, 120) as u32
}
