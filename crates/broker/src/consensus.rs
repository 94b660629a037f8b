//! Consensus tallying.
//!
//! The broker does not judge vote content; it only counts. The tally is a
//! pure function so callers (and the audit composer) can apply it to any vote
//! map, and [`ConsensusRound`] is the small accumulator that owns a map for
//! one proposal.

use std::collections::BTreeMap;

use agora_proto::{AgentId, Ballot, ConsensusOutcome, Vote};

/// Result of tallying one vote map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tally {
	/// The outcome.
	pub outcome: ConsensusOutcome,
	/// Winning-side share of all votes; 0.5 on deadlock.
	pub confidence: f64,
}

/// Tally a vote map.
///
/// Approved iff strictly more than half of all votes (abstentions included in
/// the denominator) agree; rejected iff strictly more than half disagree;
/// deadlock otherwise, ties included. An empty map deadlocks.
#[must_use]
pub fn tally(votes: &BTreeMap<String, Ballot>) -> Tally {
	let total = votes.len();
	if total == 0 {
		return Tally {
			outcome: ConsensusOutcome::Deadlock,
			confidence: 0.5,
		};
	}

	let agree = votes.values().filter(|b| b.vote == Vote::Agree).count();
	let disagree = votes.values().filter(|b| b.vote == Vote::Disagree).count();

	if agree * 2 > total {
		Tally {
			outcome: ConsensusOutcome::Approved,
			confidence: agree as f64 / total as f64,
		}
	} else if disagree * 2 > total {
		Tally {
			outcome: ConsensusOutcome::Rejected,
			confidence: disagree as f64 / total as f64,
		}
	} else {
		Tally {
			outcome: ConsensusOutcome::Deadlock,
			confidence: 0.5,
		}
	}
}

/// Consensus round number encoded in a proposal id.
///
/// Proposal ids carrying a `round_<n>` segment (anywhere in the id) belong to
/// round `n`; everything else is round 1. When several markers appear, the
/// rightmost one followed by digits wins.
#[must_use]
pub fn round_of(proposal_id: &str) -> u32 {
	let mut rest = proposal_id;
	while let Some(at) = rest.rfind("round_") {
		let digits: String = rest[at + "round_".len()..]
			.chars()
			.take_while(char::is_ascii_digit)
			.collect();
		if let Ok(round) = digits.parse() {
			return round;
		}
		rest = &rest[..at];
	}
	1
}

/// Correlation id grouping all envelopes of one proposal.
#[must_use]
pub fn correlation_id(proposal_id: &str) -> String {
	format!("consensus_{proposal_id}")
}

/// Vote accumulator for a single proposal.
///
/// Each agent holds one slot; casting again overwrites the earlier ballot.
#[derive(Debug, Clone)]
pub struct ConsensusRound {
	proposal_id: String,
	votes: BTreeMap<String, Ballot>,
}

impl ConsensusRound {
	/// Open a round for a proposal.
	#[must_use]
	pub fn new(proposal_id: impl Into<String>) -> Self {
		Self {
			proposal_id: proposal_id.into(),
			votes: BTreeMap::new(),
		}
	}

	/// The proposal this round belongs to.
	#[must_use]
	pub fn proposal_id(&self) -> &str {
		&self.proposal_id
	}

	/// Round number derived from the proposal id.
	#[must_use]
	pub fn round(&self) -> u32 {
		round_of(&self.proposal_id)
	}

	/// Correlation id shared by every envelope of this proposal.
	#[must_use]
	pub fn correlation_id(&self) -> String {
		correlation_id(&self.proposal_id)
	}

	/// Record an agent's ballot; a later cast replaces an earlier one.
	pub fn cast(&mut self, agent: &AgentId, ballot: Ballot) {
		self.votes.insert(agent.to_string(), ballot);
	}

	/// Number of ballots cast so far.
	#[must_use]
	pub fn ballots(&self) -> usize {
		self.votes.len()
	}

	/// The accumulated vote map.
	#[must_use]
	pub fn votes(&self) -> &BTreeMap<String, Ballot> {
		&self.votes
	}

	/// Close the round and tally it.
	#[must_use]
	pub fn close(&self) -> Tally {
		tally(&self.votes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ballots(entries: &[(&str, Vote)]) -> BTreeMap<String, Ballot> {
		entries
			.iter()
			.map(|(name, vote)| {
				(
					(*name).to_string(),
					Ballot {
						vote: *vote,
						reasoning: None,
					},
				)
			})
			.collect()
	}

	#[test]
	fn majority_agree_approves() {
		let result = tally(&ballots(&[
			("a1", Vote::Agree),
			("a2", Vote::Agree),
			("a3", Vote::Agree),
			("a4", Vote::Disagree),
		]));
		assert_eq!(result.outcome, ConsensusOutcome::Approved);
		assert_eq!(result.confidence, 0.75);
	}

	#[test]
	fn abstentions_count_toward_the_denominator() {
		// Two of four agree: not a strict majority.
		let result = tally(&ballots(&[
			("a1", Vote::Agree),
			("a2", Vote::Agree),
			("a3", Vote::Disagree),
			("a4", Vote::Abstain),
		]));
		assert_eq!(result.outcome, ConsensusOutcome::Deadlock);
		assert_eq!(result.confidence, 0.5);
	}

	#[test]
	fn majority_disagree_rejects() {
		let result = tally(&ballots(&[
			("a1", Vote::Disagree),
			("a2", Vote::Disagree),
			("a3", Vote::Agree),
		]));
		assert_eq!(result.outcome, ConsensusOutcome::Rejected);
		assert!((result.confidence - 2.0 / 3.0).abs() < f64::EPSILON);
	}

	#[test]
	fn even_split_deadlocks() {
		let result = tally(&ballots(&[("a1", Vote::Agree), ("a2", Vote::Disagree)]));
		assert_eq!(result.outcome, ConsensusOutcome::Deadlock);
		assert_eq!(result.confidence, 0.5);
	}

	#[test]
	fn empty_map_deadlocks() {
		let result = tally(&BTreeMap::new());
		assert_eq!(result.outcome, ConsensusOutcome::Deadlock);
		assert_eq!(result.confidence, 0.5);
	}

	#[test]
	fn confidence_stays_within_bounds() {
		for agree in 0..=6usize {
			for disagree in 0..=6usize {
				let mut map = BTreeMap::new();
				for i in 0..agree {
					map.insert(
						format!("agree-{i}"),
						Ballot {
							vote: Vote::Agree,
							reasoning: None,
						},
					);
				}
				for i in 0..disagree {
					map.insert(
						format!("disagree-{i}"),
						Ballot {
							vote: Vote::Disagree,
							reasoning: None,
						},
					);
				}
				let result = tally(&map);
				assert!(
					(0.5..=1.0).contains(&result.confidence),
					"confidence {} out of bounds for {agree} agree / {disagree} disagree",
					result.confidence
				);
			}
		}
	}

	#[test]
	fn round_extraction() {
		assert_eq!(round_of("proposal_round_3_refactor"), 3);
		assert_eq!(round_of("round_12"), 12);
		assert_eq!(round_of("xround_7y"), 7);
		assert_eq!(round_of("plain-proposal"), 1);
		assert_eq!(round_of("round_"), 1);
		assert_eq!(round_of("round_abc"), 1);
	}

	#[test]
	fn round_extraction_prefers_the_rightmost_marker() {
		assert_eq!(round_of("round_1_then_round_2"), 2);
		// A trailing digitless marker falls back to the one before it.
		assert_eq!(round_of("round_5_round_x"), 5);
	}

	#[test]
	fn recast_overwrites_earlier_ballot() {
		let mut round = ConsensusRound::new("round_2_rename");
		let voter: AgentId = "a1".into();
		round.cast(
			&voter,
			Ballot {
				vote: Vote::Agree,
				reasoning: None,
			},
		);
		round.cast(
			&voter,
			Ballot {
				vote: Vote::Disagree,
				reasoning: Some("changed my mind".to_string()),
			},
		);
		assert_eq!(round.ballots(), 1);
		assert_eq!(round.close().outcome, ConsensusOutcome::Rejected);
		assert_eq!(round.round(), 2);
		assert_eq!(round.correlation_id(), "consensus_round_2_rename");
	}
}
