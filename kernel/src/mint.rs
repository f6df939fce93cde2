//! Mint auction: periodic sealed-bid second-price scoring auction.
//!
//! Bids are accepted at any time and apply to the next resolution; there is
//! no waiting window. Bid amounts are escrowed by the kernel at submission
//! (transferred to the mint principal) and unwound here through the
//! [`ResolutionOutcome`] the kernel applies atomically. The scorer is a
//! configuration point; the default scores by bid alone.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::types::{ArtifactId, PrincipalId};

/// Principal id of the mint itself; escrows bids and retains clearing
/// prices.
pub const MINT_PRINCIPAL: &str = "genesis_mint";

/// Scores a submission. Higher wins; ties break by earlier submission then
/// lexicographic submission id.
pub trait Scorer: Send {
    fn score(&self, submission: &Submission, artifact_content: Option<&str>) -> i64;
    fn name(&self) -> &'static str;
}

/// Default scorer: the bid is the score.
#[derive(Debug, Default)]
pub struct BidScorer;

impl Scorer for BidScorer {
    fn score(&self, submission: &Submission, _artifact_content: Option<&str>) -> i64 {
        submission.bid.min(i64::MAX as u64) as i64
    }

    fn name(&self) -> &'static str {
        "bid_only"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: String,
    pub submitter: PrincipalId,
    pub artifact_id: ArtifactId,
    pub bid: u64,
    pub submitted_at_ms: u64,
}

/// A past resolution, kept for `history()` queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub resolved_at_ms: u64,
    /// End of the period this resolution covered.
    pub period_end_ms: u64,
    pub winner: PrincipalId,
    pub winning_submission_id: String,
    pub artifact_id: ArtifactId,
    /// Clearing price actually paid: `max(second_price, minimum_bid)`.
    pub price: u64,
    /// Newly minted scrip credited to the winner.
    pub reward: u64,
    pub losing_submission_ids: Vec<String>,
}

/// Everything the kernel must apply for one resolution: refunds come out of
/// the mint principal's escrow, the reward is freshly minted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub resolution: Resolution,
    /// `(principal, amount)` refunds of escrowed bids: losers in full, the
    /// winner's over-hold (`bid - price`).
    pub refunds: Vec<(PrincipalId, u64)>,
}

/// Serializable auction state for checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MintSnapshot {
    pub next_due_ms: u64,
    pub pending: Vec<Submission>,
    pub history: Vec<Resolution>,
}

pub struct MintAuction {
    period_ms: u64,
    minimum_bid: u64,
    reward_amount: u64,
    next_due_ms: u64,
    pending: Vec<Submission>,
    history: Vec<Resolution>,
    scorer: Box<dyn Scorer>,
}

impl std::fmt::Debug for MintAuction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintAuction")
            .field("period_ms", &self.period_ms)
            .field("minimum_bid", &self.minimum_bid)
            .field("next_due_ms", &self.next_due_ms)
            .field("pending", &self.pending.len())
            .field("history", &self.history.len())
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

impl MintAuction {
    pub fn new(
        config: &crate::config::MintConfig,
        started_at_ms: u64,
        scorer: Box<dyn Scorer>,
    ) -> Self {
        Self {
            period_ms: config.period_seconds * 1_000,
            minimum_bid: config.minimum_bid,
            reward_amount: config.reward_amount,
            next_due_ms: started_at_ms + config.first_auction_delay_seconds * 1_000,
            pending: Vec::new(),
            history: Vec::new(),
            scorer,
        }
    }

    pub fn minimum_bid(&self) -> u64 {
        self.minimum_bid
    }

    pub fn pending(&self) -> &[Submission] {
        &self.pending
    }

    pub fn history(&self, limit: usize) -> &[Resolution] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    /// Record a submission whose bid the kernel has already escrowed.
    pub fn submit(&mut self, submission: Submission) -> KernelResult<()> {
        if submission.bid < self.minimum_bid {
            return Err(KernelError::Validation(format!(
                "bid {} below minimum {}",
                submission.bid, self.minimum_bid
            )));
        }
        if self.pending.iter().any(|s| s.id == submission.id) {
            return Err(KernelError::DuplicateId(submission.id));
        }
        self.pending.push(submission);
        Ok(())
    }

    /// Withdraw a pending submission. Only the submitter may cancel; the
    /// returned submission tells the kernel how much escrow to release.
    pub fn cancel(&mut self, submission_id: &str, caller: &str) -> KernelResult<Submission> {
        let idx = self
            .pending
            .iter()
            .position(|s| s.id == submission_id)
            .ok_or_else(|| KernelError::NotFound(format!("submission {}", submission_id)))?;
        if self.pending[idx].submitter != caller {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: submission_id.to_string(),
                reason: "only the submitter may cancel".into(),
            });
        }
        Ok(self.pending.remove(idx))
    }

    /// Resolve the earliest due period, if any. Late submissions roll to
    /// the next cycle; a backlog of missed periods drains one call at a
    /// time, so callers re-check until `is_due` is false.
    pub fn resolve_due(
        &mut self,
        now_ms: u64,
        artifact_content: impl Fn(&str) -> Option<String>,
    ) -> Option<ResolutionOutcome> {
        if !self.is_due(now_ms) {
            return None;
        }
        let period_end_ms = self.next_due_ms;
        self.next_due_ms += self.period_ms;

        let (eligible, late): (Vec<Submission>, Vec<Submission>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|s| s.submitted_at_ms <= period_end_ms);
        self.pending = late;
        if eligible.is_empty() {
            return None;
        }

        let mut scored: Vec<(i64, Submission)> = eligible
            .into_iter()
            .map(|s| {
                let content = artifact_content(&s.artifact_id);
                (self.scorer.score(&s, content.as_deref()), s)
            })
            .collect();
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then(a.submitted_at_ms.cmp(&b.submitted_at_ms))
                .then(a.id.cmp(&b.id))
        });

        let winner = scored[0].1.clone();
        let second_price = scored.get(1).map(|(_, s)| s.bid).unwrap_or(0);
        let price = second_price.max(self.minimum_bid).min(winner.bid);

        let mut refunds = Vec::new();
        if winner.bid > price {
            refunds.push((winner.submitter.clone(), winner.bid - price));
        }
        let losing_submission_ids: Vec<String> = scored[1..]
            .iter()
            .map(|(_, s)| {
                refunds.push((s.submitter.clone(), s.bid));
                s.id.clone()
            })
            .collect();

        let resolution = Resolution {
            resolved_at_ms: now_ms,
            period_end_ms,
            winner: winner.submitter.clone(),
            winning_submission_id: winner.id.clone(),
            artifact_id: winner.artifact_id.clone(),
            price,
            reward: self.reward_amount,
            losing_submission_ids,
        };
        self.history.push(resolution.clone());
        Some(ResolutionOutcome { resolution, refunds })
    }

    /// Re-apply a journaled resolution during event replay: drop the
    /// settled submissions, record history, advance the schedule past the
    /// resolved period. Ledger effects are replayed from their own events.
    pub(crate) fn replay_resolution(&mut self, resolution: &Resolution) {
        self.pending.retain(|s| {
            s.id != resolution.winning_submission_id
                && !resolution.losing_submission_ids.contains(&s.id)
        });
        if self.next_due_ms <= resolution.period_end_ms {
            self.next_due_ms = resolution.period_end_ms + self.period_ms;
        }
        self.history.push(resolution.clone());
    }

    pub fn snapshot(&self) -> MintSnapshot {
        MintSnapshot {
            next_due_ms: self.next_due_ms,
            pending: self.pending.clone(),
            history: self.history.clone(),
        }
    }

    pub fn restore(
        config: &crate::config::MintConfig,
        snapshot: MintSnapshot,
        scorer: Box<dyn Scorer>,
    ) -> Self {
        Self {
            period_ms: config.period_seconds * 1_000,
            minimum_bid: config.minimum_bid,
            reward_amount: config.reward_amount,
            next_due_ms: snapshot.next_due_ms,
            pending: snapshot.pending,
            history: snapshot.history,
            scorer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> crate::config::MintConfig {
        crate::config::MintConfig {
            period_seconds: 60,
            first_auction_delay_seconds: 60,
            minimum_bid: 1,
            reward_amount: 0,
        }
    }

    fn submission(id: &str, submitter: &str, bid: u64, at_ms: u64) -> Submission {
        Submission {
            id: id.into(),
            submitter: submitter.into(),
            artifact_id: format!("artifact_of_{}", id),
            bid,
            submitted_at_ms: at_ms,
        }
    }

    #[test]
    fn second_price_with_two_bidders() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 5_000)).unwrap();
        mint.submit(submission("s2", "bob", 15, 20_000)).unwrap();

        assert!(!mint.is_due(59_999));
        let outcome = mint.resolve_due(60_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.winner, "bob");
        assert_eq!(outcome.resolution.price, 10);
        // Bob over-held 5, alice gets her full bid back.
        assert_eq!(
            outcome.refunds,
            vec![("bob".to_string(), 5), ("alice".to_string(), 10)]
        );
        assert_eq!(outcome.resolution.losing_submission_ids, vec!["s1".to_string()]);
    }

    #[test]
    fn single_bidder_pays_the_minimum() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 1_000)).unwrap();
        let outcome = mint.resolve_due(61_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.price, 1);
        assert_eq!(outcome.refunds, vec![("alice".to_string(), 9)]);
    }

    #[test]
    fn late_submissions_roll_to_next_cycle() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 5_000)).unwrap();
        // Submitted after the period being resolved closed.
        mint.submit(submission("s2", "bob", 50, 70_000)).unwrap();
        let outcome = mint.resolve_due(70_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.winner, "alice");
        assert_eq!(mint.pending().len(), 1);

        let outcome = mint.resolve_due(120_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.winner, "bob");
    }

    #[test]
    fn backlog_drains_one_period_per_call() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 1_000)).unwrap();
        // Clock jumps three periods; the first call resolves the earliest
        // pending period only.
        let now = 200_000;
        assert!(mint.resolve_due(now, |_| None).is_some());
        assert_eq!(mint.next_due_ms(), 120_000);
        assert!(mint.resolve_due(now, |_| None).is_none());
        assert_eq!(mint.next_due_ms(), 180_000);
        assert!(mint.resolve_due(now, |_| None).is_none());
        assert_eq!(mint.next_due_ms(), 240_000);
        assert!(!mint.is_due(now));
    }

    #[test]
    fn ties_break_by_submission_time_then_id() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s_b", "bob", 10, 2_000)).unwrap();
        mint.submit(submission("s_a", "alice", 10, 1_000)).unwrap();
        let outcome = mint.resolve_due(60_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.winner, "alice");

        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s_b", "bob", 10, 1_000)).unwrap();
        mint.submit(submission("s_a", "alice", 10, 1_000)).unwrap();
        let outcome = mint.resolve_due(60_000, |_| None).unwrap();
        assert_eq!(outcome.resolution.winning_submission_id, "s_a");
    }

    #[test]
    fn bids_below_minimum_are_rejected() {
        let mut mint = MintAuction::new(
            &crate::config::MintConfig {
                minimum_bid: 5,
                ..config()
            },
            0,
            Box::new(BidScorer),
        );
        assert!(mint.submit(submission("s1", "alice", 4, 0)).is_err());
    }

    #[test]
    fn cancel_is_submitter_only() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 0)).unwrap();
        assert!(mint.cancel("s1", "bob").is_err());
        let returned = mint.cancel("s1", "alice").unwrap();
        assert_eq!(returned.bid, 10);
        assert!(mint.pending().is_empty());
    }

    #[test]
    fn custom_scorer_overrides_bid_order() {
        struct ContentLengthScorer;
        impl Scorer for ContentLengthScorer {
            fn score(&self, _s: &Submission, content: Option<&str>) -> i64 {
                content.map_or(0, |c| c.len() as i64)
            }
            fn name(&self) -> &'static str {
                "content_length"
            }
        }
        let mut mint = MintAuction::new(&config(), 0, Box::new(ContentLengthScorer));
        mint.submit(submission("s1", "alice", 50, 1_000)).unwrap();
        mint.submit(submission("s2", "bob", 2, 2_000)).unwrap();
        let outcome = mint
            .resolve_due(60_000, |id| {
                (id == "artifact_of_s2").then(|| "long long content".to_string())
            })
            .unwrap();
        // Bob's artifact scores higher despite the lower bid; he pays the
        // second-ranked bid, capped by his own.
        assert_eq!(outcome.resolution.winner, "bob");
        assert_eq!(outcome.resolution.price, 2);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut mint = MintAuction::new(&config(), 0, Box::new(BidScorer));
        mint.submit(submission("s1", "alice", 10, 1_000)).unwrap();
        mint.resolve_due(60_000, |_| None).unwrap();
        mint.submit(submission("s2", "bob", 20, 61_000)).unwrap();

        let snapshot = mint.snapshot();
        let restored = MintAuction::restore(&config(), snapshot.clone(), Box::new(BidScorer));
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.pending().len(), 1);
        assert_eq!(restored.history(10).len(), 1);
    }
}
