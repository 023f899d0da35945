//! The root of a collective-signing round: partitions the tree into
//! subtrees, runs one sub-protocol per subtree in parallel and folds
//! the subtree aggregates into the final signature.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use rand::{RngCore, SeedableRng};
use tokio::{
	sync::{mpsc::UnboundedSender, oneshot},
	time::timeout,
};
use tracing::{debug, info_span, warn, Instrument};

use super::{
	aggregate::{self, AggregateError, CosiSignature},
	cosi_data::{Challenge, Commitment},
	shutdown,
	sub_protocol::{SubCosi, SubtreeEvent, SubtreeHandle},
	CosiChannels, CosiFailureReason,
};
use crate::{
	crypto::{ECPoint, Keypair, Rng},
	overlay::{InstanceId, Network, Node, NodeIndex, Roster, Stop, Tree},
};

pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(60);
/// 1% of the protocol budget
pub const DEFAULT_SUBLEADER_TIMEOUT: Duration = Duration::from_millis(600);
/// 0.5% of the protocol budget
pub const DEFAULT_LEAVES_TIMEOUT: Duration = Duration::from_millis(300);

/// Round parameters exposed on the root instance. Timeouts left at
/// zero fall back to the defaults when the round starts.
#[derive(Clone, Debug)]
pub struct CosiConfig {
	pub proposal: Vec<u8>,
	pub n_subtrees: usize,
	pub subleader_timeout: Duration,
	pub leaves_timeout: Duration,
	pub protocol_timeout: Duration,
}

impl CosiConfig {
	pub fn new(proposal: Vec<u8>, n_subtrees: usize) -> Self {
		CosiConfig {
			proposal,
			n_subtrees,
			subleader_timeout: Duration::ZERO,
			leaves_timeout: Duration::ZERO,
			protocol_timeout: Duration::ZERO,
		}
	}
}

/// One subtree as seen from the root: the delegate's reporting
/// channels plus a spare handle used to relay `Stop` down the subtree
struct SubtreeState<P: ECPoint> {
	index: usize,
	handle: SubtreeHandle<P>,
	stopper: Node,
}

/// The top-level collective-signing instance, run by the tree root.
/// Emits the final signature on its one-shot channel exactly once.
pub struct Cosi<P: ECPoint> {
	network: Arc<Network>,
	roster: Roster<P>,
	keypair: Keypair<P>,
	instance: InstanceId,
	config: CosiConfig,
	rng: Rng,
	final_signature: oneshot::Sender<CosiSignature<P>>,
}

impl<P: ECPoint> Cosi<P> {
	pub fn new(
		network: Arc<Network>,
		roster: Roster<P>,
		keypair: Keypair<P>,
		instance: InstanceId,
		config: CosiConfig,
		rng: Rng,
	) -> (Self, oneshot::Receiver<CosiSignature<P>>) {
		let (final_sender, final_receiver) = oneshot::channel();
		(
			Cosi {
				network,
				roster,
				keypair,
				instance,
				config,
				rng,
				final_signature: final_sender,
			},
			final_receiver,
		)
	}

	/// Instance id a subtree's sub-protocol runs under; deterministic
	/// so that every host can register the matching instance.
	pub fn subtree_instance(instance: InstanceId, subtree: usize) -> InstanceId {
		instance + 1 + subtree as InstanceId
	}

	pub async fn run(self) -> Result<(), CosiFailureReason> {
		let span = info_span!("Cosi", instance = self.instance);

		let Cosi { network, roster, keypair, instance, config, mut rng, final_signature } = self;

		// -- validation and defaults --
		if config.proposal.is_empty() {
			return Err(CosiFailureReason::InvalidConfig("proposal must not be empty".to_string()))
		}
		if roster.is_empty() {
			return Err(CosiFailureReason::InvalidConfig("roster must not be empty".to_string()))
		}
		if config.n_subtrees == 0 {
			return Err(CosiFailureReason::InvalidConfig(
				"at least one subtree is required".to_string(),
			))
		}
		let protocol_timeout = if config.protocol_timeout.is_zero() {
			DEFAULT_PROTOCOL_TIMEOUT
		} else {
			config.protocol_timeout
		};
		let subleader_timeout = if config.subleader_timeout.is_zero() {
			DEFAULT_SUBLEADER_TIMEOUT
		} else {
			config.subleader_timeout
		};
		let leaves_timeout = if config.leaves_timeout.is_zero() {
			DEFAULT_LEAVES_TIMEOUT
		} else {
			config.leaves_timeout
		};
		if leaves_timeout >= subleader_timeout {
			return Err(CosiFailureReason::InvalidConfig(
				"leaves timeout must be shorter than the subleader timeout".to_string(),
			))
		}

		let hosts = roster.len();
		let publics = roster.publics();
		let proposal = config.proposal;

		async move {
			// A tree of one signs alone
			if hosts == 1 {
				let signature =
					sign_alone(&publics, &proposal, &keypair, &mut rng)?;
				debug!("emitting single-node signature");
				let _result = final_signature.send(signature);
				return Ok(())
			}

			let subtrees = Tree::cosi_subtrees(hosts, config.n_subtrees)
				.map_err(|error| CosiFailureReason::InvalidConfig(error.to_string()))?;

			// The root's own instance only listens for Stop; all round
			// traffic flows through the per-subtree delegates.
			let main_tree = Arc::new(
				Tree::two_level(hosts, config.n_subtrees)
					.map_err(|error| CosiFailureReason::InvalidConfig(error.to_string()))?,
			);
			let main_node = network.node(main_tree, 0, instance)?;
			let (_main_channels, main_stop) = CosiChannels::<P>::register(&main_node);
			let mut main_stop_receiver = main_stop.receiver;

			// Spawn one delegate per subtree, each with its own inbox
			let mut states = Vec::with_capacity(subtrees.len());
			for (index, tree) in subtrees.into_iter().enumerate() {
				let tree = Arc::new(tree);
				let node =
					network.node(tree, 0, Self::subtree_instance(instance, index))?;
				let stopper = node.clone();

				let mut seed = [0u8; 32];
				rng.fill_bytes(&mut seed);
				let (delegate, handle) = SubCosi::delegate(
					node,
					keypair.clone(),
					Rng::from_seed(seed),
					publics.clone(),
					proposal.clone(),
					subleader_timeout,
					leaves_timeout,
				)?;

				tokio::spawn(async move {
					if let Err(reason) = delegate.run().await {
						warn!(subtree = index, "subtree delegate failed: {reason}");
					}
				});

				states.push(SubtreeState { index, handle, stopper });
			}

			let stop_lines: Vec<(Node, UnboundedSender<(NodeIndex, Stop)>)> = states
				.iter()
				.map(|state| (state.stopper.clone(), state.handle.stop.clone()))
				.collect();

			let round = round(
				&mut states,
				&publics,
				&proposal,
				&keypair,
				&mut rng,
				subleader_timeout,
			);
			tokio::pin!(round);

			let outcome = tokio::select! {
				outcome = &mut round => outcome,
				Some((from, _)) = main_stop_receiver.recv() => {
					debug!(from, "round stopped externally");
					stop_subtrees::<P>(&stop_lines);
					main_node.done();
					return Ok(())
				},
				() = tokio::time::sleep(protocol_timeout) => Err(CosiFailureReason::ProtocolTimeout),
			};

			match outcome {
				Ok(signature) => {
					debug!(
						contributors = signature.mask.count(),
						"round complete, emitting final signature"
					);
					main_node.done();
					let _result = final_signature.send(signature);
					Ok(())
				},
				Err(reason) => {
					warn!("round failed: {reason}");
					stop_subtrees::<P>(&stop_lines);
					main_node.done();
					Err(reason)
				},
			}
		}
		.instrument(span)
		.await
	}
}

/// The signing sequence proper: collect subtree commitments, combine,
/// fan the challenge out, collect subtree responses, assemble the
/// signature.
async fn round<P: ECPoint>(
	states: &mut [SubtreeState<P>],
	publics: &[P],
	proposal: &[u8],
	keypair: &Keypair<P>,
	rng: &mut Rng,
	subleader_timeout: Duration,
) -> Result<CosiSignature<P>, CosiFailureReason> {
	// Each subtree either delivers one aggregated commitment within
	// the window or is excluded from the round. The delegate enforces
	// the window itself; the doubled bound here only guards against a
	// delegate that died without reporting.
	let commitments: Vec<Option<Commitment<P>>> =
		join_all(states.iter_mut().map(|state| async move {
			match timeout(subleader_timeout * 2, state.handle.events.recv()).await {
				Ok(Some(SubtreeEvent::Commitment(commitment))) => Some(commitment),
				Ok(Some(SubtreeEvent::SubleaderUnresponsive)) => {
					warn!(subtree = state.index, "excluding subtree: subleader not responding");
					None
				},
				Ok(Some(SubtreeEvent::Response(_))) => {
					warn!(subtree = state.index, "excluding subtree: response before commitment");
					None
				},
				Ok(None) | Err(_) => {
					warn!(subtree = state.index, "excluding subtree: no result from delegate");
					None
				},
			}
		}))
		.await;

	// Silent subtrees are done for this round; release their nodes
	for (state, commitment) in states.iter().zip(&commitments) {
		if commitment.is_none() {
			let _result = state.handle.stop.send((0, Stop));
			shutdown::<P>(&state.stopper);
		}
	}

	let child_commitments: Vec<Commitment<P>> =
		commitments.iter().flatten().cloned().collect();

	// Fold in our own commitment; overlapping subtree masks mean the
	// partition itself is broken
	let (secret, aggregate) =
		aggregate::generate_commitment_and_aggregate(0, publics, &child_commitments, rng)
			.map_err(|error| match error {
				AggregateError::OverlappingContribution(_) => CosiFailureReason::AggregationConflict,
				other => CosiFailureReason::Aggregation(other),
			})?;

	let challenge =
		aggregate::derive_challenge(&aggregate.commitment, &aggregate.mask, publics, proposal)?;

	// Only responding subtrees take part in the response phase
	for (state, commitment) in states.iter().zip(&commitments) {
		if commitment.is_some() {
			let _result =
				state.handle.challenge.send((0, Challenge { challenge: challenge.clone() }));
		}
	}

	let responding: Vec<&mut SubtreeState<P>> = states
		.iter_mut()
		.zip(&commitments)
		.filter(|(_, commitment)| commitment.is_some())
		.map(|(state, _)| state)
		.collect();

	// One response per responding subtree; the enclosing protocol
	// budget bounds this wait
	let responses = join_all(responding.into_iter().map(|state| async move {
		match state.handle.events.recv().await {
			Some(SubtreeEvent::Response(response)) => Ok(response.response),
			_ => Err(CosiFailureReason::MissingSubtreeResponse(state.index)),
		}
	}))
	.await
	.into_iter()
	.collect::<Result<Vec<_>, _>>()?;

	let response = aggregate::generate_response::<P>(
		Some((secret, keypair.secret.clone())),
		responses,
		&challenge,
	);

	Ok(CosiSignature { commitment: aggregate.commitment, response, mask: aggregate.mask })
}

fn sign_alone<P: ECPoint>(
	publics: &[P],
	proposal: &[u8],
	keypair: &Keypair<P>,
	rng: &mut Rng,
) -> Result<CosiSignature<P>, CosiFailureReason> {
	let (secret, aggregate) =
		aggregate::generate_commitment_and_aggregate(0, publics, &[], rng)?;
	let challenge =
		aggregate::derive_challenge(&aggregate.commitment, &aggregate.mask, publics, proposal)?;
	let response = aggregate::generate_response::<P>(
		Some((secret, keypair.secret.clone())),
		Vec::new(),
		&challenge,
	);
	Ok(CosiSignature { commitment: aggregate.commitment, response, mask: aggregate.mask })
}

fn stop_subtrees<P: ECPoint>(stop_lines: &[(Node, UnboundedSender<(NodeIndex, Stop)>)]) {
	for (stopper, stop) in stop_lines {
		let _result = stop.send((0, Stop));
		shutdown::<P>(stopper);
	}
}
