//! Test utilities: seeded identities and fully wired in-memory rounds
//! over the overlay.

use std::{sync::Arc, time::Duration};

use rand::SeedableRng;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
	cosi::{Cosi, CosiConfig, CosiFailureReason, SubCosi},
	crypto::{ECPoint, Keypair, Rng},
	overlay::{InstanceId, Network, NodeId, NodeIndex, Peer, Roster, Tree},
	pbft::{Pbft, PbftConfig, PbftFailureReason, VerificationFn},
};

/// The curve used by all protocol tests
pub type Point = crate::crypto::ed25519::Point;

pub type CosiSignature = crate::cosi::aggregate::CosiSignature<Point>;

pub const DEFAULT_SEED: [u8; 32] = [8; 32];

/// Instance id used by single-round tests
pub const DEFAULT_INSTANCE: InstanceId = 1;

/// Deterministic roster of `count` identities
pub fn new_roster<P: ECPoint>(count: usize, seed: [u8; 32]) -> (Roster<P>, Vec<Keypair<P>>) {
	let mut rng = Rng::from_seed(seed);
	let keypairs: Vec<Keypair<P>> = (0..count).map(|_| Keypair::generate(&mut rng)).collect();
	let peers = keypairs
		.iter()
		.enumerate()
		.map(|(index, keypair)| Peer { id: NodeId([index as u8; 32]), public: keypair.public })
		.collect();
	(Roster::new(peers), keypairs)
}

fn node_rng(index: NodeIndex) -> Rng {
	let mut seed = DEFAULT_SEED;
	seed[0] = seed[0].wrapping_add(index as u8).wrapping_add(1);
	Rng::from_seed(seed)
}

pub struct CosiRound {
	pub network: Arc<Network>,
	pub publics: Vec<Point>,
	pub root_task: JoinHandle<Result<(), CosiFailureReason>>,
	pub sub_tasks: Vec<(NodeIndex, JoinHandle<Result<(), CosiFailureReason>>)>,
	pub final_signature: oneshot::Receiver<CosiSignature>,
}

/// Wire up a full collective-signing round: one sub-protocol instance
/// per non-root subtree member plus the root instance. Silenced nodes
/// exist in the roster but neither send nor receive.
pub fn spawn_cosi_round(hosts: usize, config: CosiConfig, silenced: &[NodeIndex]) -> CosiRound {
	let (roster, keypairs) = new_roster::<Point>(hosts, DEFAULT_SEED);
	let publics = roster.publics();
	let network = Network::new(hosts);
	for &index in silenced {
		network.silence(index);
	}

	let mut sub_tasks = Vec::new();
	let subtrees = Tree::cosi_subtrees(hosts, config.n_subtrees).unwrap();
	for (subtree_index, tree) in subtrees.into_iter().enumerate() {
		let tree = Arc::new(tree);
		let instance = Cosi::<Point>::subtree_instance(DEFAULT_INSTANCE, subtree_index);
		for member in tree.members() {
			if member == tree.root() {
				continue
			}
			let node = network.node(tree.clone(), member, instance).unwrap();
			let sub =
				SubCosi::new(node, keypairs[member as usize].clone(), node_rng(member));
			sub_tasks.push((member, tokio::spawn(sub.run())));
		}
	}

	let (root, final_signature) = Cosi::new(
		network.clone(),
		roster,
		keypairs[0].clone(),
		DEFAULT_INSTANCE,
		config,
		node_rng(0),
	);
	let root_task = tokio::spawn(root.run());

	CosiRound { network, publics, root_task, sub_tasks, final_signature }
}

pub fn accept_all() -> VerificationFn {
	Arc::new(|_msg, _data| true)
}

pub fn reject_all() -> VerificationFn {
	Arc::new(|_msg, _data| false)
}

pub struct PbftRound {
	pub network: Arc<Network>,
	pub tree: Arc<Tree>,
	pub keypairs: Vec<Keypair<Point>>,
	pub tasks: Vec<(NodeIndex, JoinHandle<Result<(), PbftFailureReason>>)>,
	/// Present when the leader is among the participants
	pub final_reply: Option<oneshot::Receiver<Vec<u8>>>,
}

/// Wire up an agreement round over a star tree of `hosts` members,
/// spawning instances only for `participants` (the rest stay dark,
/// which is how dropped-out followers are modelled).
pub fn spawn_pbft_round(
	hosts: usize,
	msg: Vec<u8>,
	timeout: Duration,
	participants: &[NodeIndex],
	verification: VerificationFn,
) -> PbftRound {
	let (roster, keypairs) = new_roster::<Point>(hosts, DEFAULT_SEED);
	let network = Network::new(hosts);
	let tree = Arc::new(Tree::star(hosts));

	let mut tasks = Vec::new();
	let mut final_reply = None;
	for &index in participants {
		let node = network.node(tree.clone(), index, DEFAULT_INSTANCE).unwrap();
		let config = PbftConfig {
			msg: if index == tree.root() { msg.clone() } else { Vec::new() },
			data: Vec::new(),
			timeout,
		};
		let (instance, receiver) = Pbft::new(
			node,
			&roster,
			keypairs[index as usize].clone(),
			config,
			verification.clone(),
			node_rng(index),
		);
		if index == tree.root() {
			final_reply = receiver;
		}
		tasks.push((index, tokio::spawn(instance.run())));
	}

	PbftRound { network, tree, keypairs, tasks, final_reply }
}
