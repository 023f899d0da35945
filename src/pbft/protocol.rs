//! The per-node agreement instance: a single dispatch sequence through
//! pre-prepare, prepare, commit and reply.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
	time::Duration,
};

use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, info_span, warn, Instrument};

use super::{
	pbft_data::{Commit, PbftData, PrePrepare, Prepare, Reply, SignedPhaseMessage},
	PbftChannels, PbftFailureReason, PbftPhase,
};
use crate::{
	crypto::{schnorr, sha512, ECPoint, Keypair, Rng},
	overlay::{Node, NodeIndex, Roster, Stop, StopChannel},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Decides whether the proposal body is acceptable. Runs off the
/// dispatch sequence so slow verification does not block message
/// collection.
pub type VerificationFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Round parameters. `msg` is the proposal (leader only); `data` is
/// side input handed to the verification function. A zero timeout
/// falls back to the default when the round starts.
#[derive(Clone, Debug)]
pub struct PbftConfig {
	pub msg: Vec<u8>,
	pub data: Vec<u8>,
	pub timeout: Duration,
}

impl PbftConfig {
	pub fn new(msg: Vec<u8>) -> Self {
		PbftConfig { msg, data: Vec::new(), timeout: Duration::ZERO }
	}
}

/// Distinct valid phase messages needed to advance:
/// `min(⌈2(n−1)/3⌉ + 1, n − 1)`. A tree of one needs none.
pub fn quorum(n: usize) -> usize {
	if n <= 1 {
		return 0
	}
	((2 * (n - 1)).div_ceil(3) + 1).min(n - 1)
}

/// One Byzantine agreement instance. Every tree node runs one; the
/// leader additionally collects replies and emits the agreed digest
/// on its one-shot final channel.
pub struct Pbft<P: ECPoint> {
	node: Node,
	keypair: Keypair<P>,
	/// Registered verification keys, derived from the tree's roster
	public_keys: BTreeMap<NodeIndex, P>,
	config: PbftConfig,
	verification: VerificationFn,
	rng: Rng,
	channels: PbftChannels<P>,
	stop: StopChannel,
	final_reply: Option<oneshot::Sender<Vec<u8>>>,
}

impl<P: ECPoint> Pbft<P> {
	/// Build the instance for one node. The final-reply receiver is
	/// returned for the leader only.
	pub fn new(
		node: Node,
		roster: &Roster<P>,
		keypair: Keypair<P>,
		config: PbftConfig,
		verification: VerificationFn,
		rng: Rng,
	) -> (Self, Option<oneshot::Receiver<Vec<u8>>>) {
		let public_keys = node
			.tree()
			.members()
			.into_iter()
			.filter_map(|index| roster.public(index).map(|public| (index, *public)))
			.collect();

		let (channels, stop) = PbftChannels::register(&node);

		let (final_sender, final_receiver) = if node.is_root() {
			let (sender, receiver) = oneshot::channel();
			(Some(sender), Some(receiver))
		} else {
			(None, None)
		};

		(
			Pbft {
				node,
				keypair,
				public_keys,
				config,
				verification,
				rng,
				channels,
				stop,
				final_reply: final_sender,
			},
			final_receiver,
		)
	}

	pub async fn run(mut self) -> Result<(), PbftFailureReason> {
		let span = info_span!("Pbft", node = self.node.index(), instance = self.node.instance());

		let node = self.node.clone();
		let mut stop_receiver = {
			let (stop_sender, stop_receiver) = tokio::sync::mpsc::unbounded_channel();
			std::mem::replace(&mut self.stop, StopChannel::new(stop_receiver, stop_sender))
				.receiver
		};

		async move {
			let result = tokio::select! {
				result = self.dispatch() => result,
				Some((from, _)) = stop_receiver.recv() => {
					debug!(from, "received stop");
					if node.is_root() {
						let errors = node.broadcast(&PbftData::<P>::Stop(Stop));
						if !errors.is_empty() {
							warn!("failed to relay stop to {} node(s)", errors.len());
						}
					}
					Ok(())
				},
			};
			node.done();
			if let Err(reason) = &result {
				warn!("agreement round failed: {reason}");
			}
			result
		}
		.instrument(span)
		.await
	}

	async fn dispatch(&mut self) -> Result<(), PbftFailureReason> {
		let n = self.node.tree().size();
		let quorum = quorum(n);
		let window = {
			let timeout =
				if self.config.timeout.is_zero() { DEFAULT_TIMEOUT } else { self.config.timeout };
			// Each phase gets twice the base timeout, restarted per phase
			timeout * 2
		};

		// ----- PrePrepare -----
		let future_digest = if self.node.is_root() {
			if self.config.msg.is_empty() {
				return Err(PbftFailureReason::InvalidConfig(
					"leader started without a proposal".to_string(),
				))
			}
			let digest = sha512(&self.config.msg).to_vec();
			let sig = schnorr::sign(&self.keypair, &self.config.msg, &mut self.rng);

			let errors = self.node.send_to_children_in_parallel(&PbftData::PrePrepare(PrePrepare {
				msg: self.config.msg.clone(),
				digest: digest.clone(),
				sig,
				sender: self.node.index(),
			}));
			if !errors.is_empty() {
				warn!("failed to send pre-prepare to {} node(s)", errors.len());
			}

			digest
		} else {
			let Some((from, pre_prepare)) = self.channels.pre_prepare.recv().await else {
				return Ok(())
			};
			debug!(from, "received pre-prepare, verifying");

			// Start verifying the proposal body while the cheap checks run
			let body_accepted = {
				let verification = self.verification.clone();
				let msg = pre_prepare.msg.clone();
				let data = self.config.data.clone();
				tokio::task::spawn_blocking(move || verification(&msg, &data))
			};

			let leader_key = self
				.public_keys
				.get(&pre_prepare.sender)
				.ok_or(PbftFailureReason::InvalidLeaderSignature)?;
			schnorr::verify(leader_key, &pre_prepare.msg, &pre_prepare.sig)
				.map_err(|_| PbftFailureReason::InvalidLeaderSignature)?;

			if sha512(&pre_prepare.msg).to_vec() != pre_prepare.digest {
				return Err(PbftFailureReason::DigestMismatch)
			}

			if !body_accepted.await.unwrap_or(false) {
				return Err(PbftFailureReason::VerificationFailed)
			}

			pre_prepare.digest
		};

		// ----- Prepare -----
		let sig = schnorr::sign(&self.keypair, &future_digest, &mut self.rng);
		let errors = self.node.broadcast(&PbftData::Prepare(Prepare {
			digest: future_digest.clone(),
			sig,
			sender: self.node.index(),
		}));
		if !errors.is_empty() {
			warn!("failed to broadcast prepare to {} node(s)", errors.len());
		}

		let prepares = collect_phase(
			&mut self.channels.prepare,
			&self.public_keys,
			&future_digest,
			quorum,
			window,
		)
		.await;
		if prepares < quorum {
			// The round is allowed to limp on: the commit phase applies
			// the quorum that actually decides
			warn!("prepare quorum not reached ({prepares}/{quorum}), continuing sub-quorum");
		} else {
			debug!("received enough prepare messages ({prepares}/{quorum})");
		}

		// ----- Commit -----
		let sig = schnorr::sign(&self.keypair, &future_digest, &mut self.rng);
		let errors = self.node.broadcast(&PbftData::Commit(Commit {
			digest: future_digest.clone(),
			sig,
			sender: self.node.index(),
		}));
		if !errors.is_empty() {
			warn!("failed to broadcast commit to {} node(s)", errors.len());
		}

		let commits = collect_phase(
			&mut self.channels.commit,
			&self.public_keys,
			&future_digest,
			quorum,
			window,
		)
		.await;
		if commits < quorum {
			return Err(PbftFailureReason::QuorumMissed {
				phase: PbftPhase::Commit,
				received: commits,
				required: quorum,
			})
		}
		debug!("received enough commit messages ({commits}/{quorum})");

		// ----- Reply -----
		if self.node.is_root() {
			let replies = collect_phase(
				&mut self.channels.reply,
				&self.public_keys,
				&future_digest,
				quorum,
				window,
			)
			.await;
			if replies < quorum {
				return Err(PbftFailureReason::QuorumMissed {
					phase: PbftPhase::Reply,
					received: replies,
					required: quorum,
				})
			}

			debug!("round complete, emitting final digest");
			if let Some(sender) = self.final_reply.take() {
				let _result = sender.send(future_digest);
			}
		} else {
			let sig = schnorr::sign(&self.keypair, &future_digest, &mut self.rng);
			self.node.send_to_parent(&PbftData::Reply(Reply {
				result: future_digest,
				sig,
				sender: self.node.index(),
			}))?;
		}

		Ok(())
	}
}

/// Count distinct senders with a valid signature over the expected
/// digest, until the quorum is reached or the phase window closes.
/// Bad signatures, unknown senders, foreign digests and duplicates
/// are dropped, never fatal.
async fn collect_phase<P: ECPoint, M: SignedPhaseMessage<P>>(
	receiver: &mut UnboundedReceiver<(NodeIndex, M)>,
	public_keys: &BTreeMap<NodeIndex, P>,
	expected_digest: &[u8],
	quorum: usize,
	window: Duration,
) -> usize {
	let mut senders: BTreeSet<NodeIndex> = BTreeSet::new();

	let deadline = tokio::time::sleep(window);
	tokio::pin!(deadline);

	while senders.len() < quorum {
		tokio::select! {
			received = receiver.recv() => match received {
				Some((from, message)) => {
					let sender = message.sender();
					let Some(public_key) = public_keys.get(&sender) else {
						warn!(from, "{}: dropping message from unknown sender {sender}", M::PHASE);
						continue
					};
					if message.digest() != expected_digest {
						warn!(from, "{}: dropping message for a different digest", M::PHASE);
						continue
					}
					if schnorr::verify(public_key, message.digest(), message.signature()).is_err() {
						warn!(from, "{}: dropping message with an invalid signature", M::PHASE);
						continue
					}
					if !senders.insert(sender) {
						warn!(from, "{}: ignoring duplicate message", M::PHASE);
					}
				},
				None => break,
			},
			() = &mut deadline => {
				debug!("{}: phase window closed with {} of {quorum}", M::PHASE, senders.len());
				break
			},
		}
	}

	senders.len()
}
