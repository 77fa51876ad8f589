use crate::tutor::decision::selector::Candidate;

/// Deterministic fallback when the bandit cannot be used: the eligible
/// candidate with the largest mastery gap. Ties go to due reviews, then to
/// the lexicographically smallest question id.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSelector;

impl HeuristicSelector {
    pub fn new() -> Self {
        Self
    }

    pub fn pick<'c, 'q>(&self, candidates: &'c [Candidate<'q>]) -> Option<&'c Candidate<'q>> {
        candidates.iter().max_by(|a, b| {
            a.mastery_gap
                .total_cmp(&b.mastery_gap)
                .then(a.review_due.cmp(&b.review_due))
                .then_with(|| b.question.question_id.cmp(&a.question.question_id))
        })
    }
}
