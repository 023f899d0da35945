use std::{collections::BTreeMap, time::Duration};

use rand::SeedableRng;

use super::{PbftData, PbftFailureReason, PbftPhase};
use crate::{
	crypto::{schnorr, sha512, Rng},
	helpers::{accept_all, reject_all, spawn_pbft_round, Point},
	overlay::{Envelope, NodeIndex},
};

const MSG: &[u8] = b"block";
const TIMEOUT: Duration = Duration::from_secs(5);

fn decode(envelope: &Envelope) -> PbftData<Point> {
	bincode::deserialize(&envelope.payload).unwrap()
}

#[tokio::test]
async fn happy_path_agrees_on_the_digest() {
	let mut round = spawn_pbft_round(4, MSG.to_vec(), TIMEOUT, &[0, 1, 2, 3], accept_all());
	let mut observed = round.network.observe();

	assert_eq!(round.final_reply.take().unwrap().await.unwrap(), sha512(MSG).to_vec());
	for (_, task) in round.tasks.drain(..) {
		assert!(task.await.unwrap().is_ok());
	}

	// Every follower broadcasts exactly one prepare and one commit
	// (n - 1 envelopes each) and sends exactly one reply
	let mut counts: BTreeMap<(NodeIndex, PbftPhase), usize> = BTreeMap::new();
	while let Ok(envelope) = observed.try_recv() {
		let phase = match decode(&envelope) {
			PbftData::PrePrepare(_) => PbftPhase::PrePrepare,
			PbftData::Prepare(_) => PbftPhase::Prepare,
			PbftData::Commit(_) => PbftPhase::Commit,
			PbftData::Reply(_) => PbftPhase::Reply,
			PbftData::Stop(_) => continue,
		};
		*counts.entry((envelope.from, phase)).or_default() += 1;
	}
	for follower in 1..4 {
		assert_eq!(counts.get(&(follower, PbftPhase::Prepare)), Some(&3));
		assert_eq!(counts.get(&(follower, PbftPhase::Commit)), Some(&3));
		assert_eq!(counts.get(&(follower, PbftPhase::Reply)), Some(&1));
	}
}

#[tokio::test]
async fn single_node_tree_emits_the_digest_immediately() {
	let round = spawn_pbft_round(1, MSG.to_vec(), TIMEOUT, &[0], accept_all());
	assert_eq!(round.final_reply.unwrap().await.unwrap(), sha512(MSG).to_vec());
}

#[tokio::test(start_paused = true)]
async fn missing_prepares_fail_the_round_at_commit() {
	// Two of four followers drop out entirely after the roster was
	// fixed: quorum is 3, each honest node sees one prepare and one
	// commit, and the round dies at the commit quorum
	let round = spawn_pbft_round(4, MSG.to_vec(), TIMEOUT, &[0, 1], accept_all());

	for (_, task) in round.tasks {
		assert_eq!(
			task.await.unwrap(),
			Err(PbftFailureReason::QuorumMissed {
				phase: PbftPhase::Commit,
				received: 1,
				required: 3,
			})
		);
	}

	// The leader's final channel emits nothing
	assert!(round.final_reply.unwrap().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn forged_prepare_signature_does_not_poison_the_round() {
	let attacker: NodeIndex = 3;

	let round = spawn_pbft_round(4, MSG.to_vec(), TIMEOUT, &[0, 1, 2, 3], accept_all());

	// Re-sign the attacker's prepares under another party's key, so
	// they fail verification against the attacker's registered key;
	// every other phase message stays honest
	let forger = round.keypairs[1].clone();
	round.network.set_fault_injector(Box::new(move |envelope| {
		if envelope.from != attacker {
			return Some(envelope.clone())
		}
		let mut rng = Rng::from_seed([98; 32]);
		match bincode::deserialize::<PbftData<Point>>(&envelope.payload) {
			Ok(PbftData::Prepare(mut prepare)) => {
				prepare.sig = schnorr::sign(&forger, &prepare.digest, &mut rng);
				Some(Envelope {
					payload: bincode::serialize(&PbftData::Prepare(prepare)).unwrap(),
					..envelope.clone()
				})
			},
			_ => Some(envelope.clone()),
		}
	}));

	// The forged prepares are dropped (prepare ends sub-quorum), but
	// the valid commits still reach the quorum and the round succeeds
	assert_eq!(round.final_reply.unwrap().await.unwrap(), sha512(MSG).to_vec());
	for (_, task) in round.tasks {
		assert!(task.await.unwrap().is_ok());
	}
}

#[tokio::test(start_paused = true)]
async fn rejected_proposal_fails_verification() {
	let mut round = spawn_pbft_round(2, MSG.to_vec(), TIMEOUT, &[0, 1], reject_all());

	let (_, follower_task) = round.tasks.remove(1);
	assert_eq!(follower_task.await.unwrap(), Err(PbftFailureReason::VerificationFailed));

	// With its only follower gone the leader cannot reach any quorum
	let (_, leader_task) = round.tasks.remove(0);
	assert!(matches!(
		leader_task.await.unwrap(),
		Err(PbftFailureReason::QuorumMissed { phase: PbftPhase::Commit, .. })
	));
	assert!(round.final_reply.unwrap().await.is_err());
}

#[tokio::test]
async fn stop_releases_a_waiting_follower() {
	let round = spawn_pbft_round(3, MSG.to_vec(), TIMEOUT, &[1], accept_all());

	// The follower sits in pre-prepare; a stop from the leader's
	// position releases it
	let leader = round.network.node(round.tree.clone(), 0, crate::helpers::DEFAULT_INSTANCE).unwrap();
	leader.send_to(1, &PbftData::<Point>::Stop(crate::overlay::Stop)).unwrap();

	for (_, task) in round.tasks {
		assert!(task.await.unwrap().is_ok());
	}
}
