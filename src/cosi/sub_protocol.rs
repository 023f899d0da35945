//! One subtree round: a subleader and its leaves, rooted at the
//! enclosing round's delegate. Each instance is a single dispatch
//! sequence that suspends only on message receipt or on a timer.

use std::{
	collections::{btree_map, BTreeMap},
	time::Duration,
};

use tokio::{
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
	time::timeout,
};
use tracing::{debug, info_span, warn, Instrument};

use super::{
	aggregate,
	cosi_data::{Announcement, Challenge, Commitment, CosiData, Response},
	shutdown, CosiChannels, CosiFailureReason,
};
use crate::{
	crypto::{ECPoint, ECScalar, Keypair, Rng},
	overlay::{Node, NodeIndex, StopChannel},
	utils::format_iterator,
};

/// What a subtree reports to the enclosing round
#[derive(Debug)]
pub(crate) enum SubtreeEvent<P: ECPoint> {
	/// The subleader produced nothing within its window; the subtree
	/// is excluded from the round
	SubleaderUnresponsive,
	Commitment(Commitment<P>),
	Response(Response<P>),
}

/// The enclosing round's side of a subtree delegate: events coming
/// up, the challenge going down, and a direct line for `Stop`.
pub(crate) struct SubtreeHandle<P: ECPoint> {
	pub events: UnboundedReceiver<SubtreeEvent<P>>,
	pub challenge: UnboundedSender<(NodeIndex, Challenge<P>)>,
	pub stop: UnboundedSender<(NodeIndex, crate::overlay::Stop)>,
}

/// Round parameters, set at start on the delegate and learned from
/// the announcement everywhere else
struct StartInfo<P: ECPoint> {
	publics: Vec<P>,
	proposal: Vec<u8>,
	subleader_timeout: Duration,
	leaves_timeout: Duration,
}

/// A collective-signing sub-protocol instance. Runs exactly one round
/// and releases its channels on the way out.
pub struct SubCosi<P: ECPoint> {
	node: Node,
	keypair: Keypair<P>,
	rng: Rng,
	channels: CosiChannels<P>,
	stop: StopChannel,
	start: Option<StartInfo<P>>,
	events: Option<UnboundedSender<SubtreeEvent<P>>>,
}

impl<P: ECPoint> SubCosi<P> {
	/// Instance on a subleader or leaf; waits for the announcement
	pub fn new(node: Node, keypair: Keypair<P>, rng: Rng) -> Self {
		let (channels, stop) = CosiChannels::register(&node);
		SubCosi { node, keypair, rng, channels, stop, start: None, events: None }
	}

	/// The enclosing root's delegate into one subtree: started with
	/// the round parameters rather than announced, and reporting the
	/// subtree's aggregate back over an internal channel.
	pub(crate) fn delegate(
		node: Node,
		keypair: Keypair<P>,
		rng: Rng,
		publics: Vec<P>,
		proposal: Vec<u8>,
		subleader_timeout: Duration,
		leaves_timeout: Duration,
	) -> Result<(Self, SubtreeHandle<P>), CosiFailureReason> {
		if proposal.is_empty() {
			return Err(CosiFailureReason::InvalidConfig("started without a proposal".to_string()))
		}
		if publics.is_empty() {
			return Err(CosiFailureReason::InvalidConfig(
				"started with an empty public key list".to_string(),
			))
		}
		let subleader_timeout = if subleader_timeout.is_zero() {
			super::DEFAULT_SUBLEADER_TIMEOUT
		} else {
			subleader_timeout
		};
		let leaves_timeout =
			if leaves_timeout.is_zero() { super::DEFAULT_LEAVES_TIMEOUT } else { leaves_timeout };

		let (channels, stop) = CosiChannels::register(&node);
		let (event_sender, event_receiver) = mpsc::unbounded_channel();
		let handle = SubtreeHandle {
			events: event_receiver,
			challenge: channels.challenge_injector(),
			stop: stop.injector(),
		};

		let instance = SubCosi {
			node,
			keypair,
			rng,
			channels,
			stop,
			start: Some(StartInfo { publics, proposal, subleader_timeout, leaves_timeout }),
			events: Some(event_sender),
		};

		Ok((instance, handle))
	}

	pub async fn run(self) -> Result<(), CosiFailureReason> {
		let span =
			info_span!("SubCosi", node = self.node.index(), instance = self.node.instance());

		let SubCosi { node, keypair, rng, channels, stop, start, events } = self;
		let mut stop_receiver = stop.receiver;
		let mut dispatch = Dispatch { node: node.clone(), keypair, rng, channels, start, events };

		async move {
			let result = tokio::select! {
				result = dispatch.run() => result,
				Some((from, _)) = stop_receiver.recv() => {
					debug!(from, "received stop");
					shutdown::<P>(&node);
					Ok(())
				},
			};
			node.done();
			if let Err(reason) = &result {
				warn!("subtree round failed: {reason}");
			}
			result
		}
		.instrument(span)
		.await
	}
}

/// The linear per-node dispatch sequence, kept apart from the stop
/// channel so the two can be raced against each other.
struct Dispatch<P: ECPoint> {
	node: Node,
	keypair: Keypair<P>,
	rng: Rng,
	channels: CosiChannels<P>,
	start: Option<StartInfo<P>>,
	events: Option<UnboundedSender<SubtreeEvent<P>>>,
}

impl<P: ECPoint> Dispatch<P> {
	async fn run(&mut self) -> Result<(), CosiFailureReason> {
		// ----- Announcement -----
		let info = match self.start.take() {
			Some(info) => info,
			None => match self.channels.announcement.recv().await {
				Some((_, announcement)) => {
					debug!("received announcement");
					StartInfo {
						publics: announcement.publics,
						proposal: announcement.proposal,
						subleader_timeout: announcement.subleader_timeout,
						leaves_timeout: announcement.leaves_timeout,
					}
				},
				None => return Ok(()),
			},
		};

		self.node.send_to_children(&CosiData::Announcement(Announcement {
			proposal: info.proposal.clone(),
			publics: info.publics.clone(),
			subleader_timeout: info.subleader_timeout,
			leaves_timeout: info.leaves_timeout,
		}))?;

		// ----- Commitment -----
		let commitments = if self.node.is_root() {
			// One commitment expected, from the subleader
			match timeout(info.subleader_timeout, self.channels.commitment.recv()).await {
				Ok(Some((from, commitment))) => {
					self.ensure_child("commitment", from)?;
					BTreeMap::from([(from, commitment)])
				},
				Ok(None) => return Ok(()),
				Err(_) => {
					warn!("subleader did not respond within {:?}", info.subleader_timeout);
					self.send_event(SubtreeEvent::SubleaderUnresponsive);
					return Ok(())
				},
			}
		} else {
			self.collect_commitments(info.leaves_timeout).await?
		};

		let committed_children: Vec<NodeIndex> = commitments.keys().copied().collect();
		debug!(
			"finished receiving commitments from [{}]",
			format_iterator(&committed_children)
		);

		let mut secret = None;
		if self.node.is_root() {
			// Exactly one aggregate goes up to the enclosing round
			if commitments.len() != 1 {
				return Err(CosiFailureReason::NotExactlyOne {
					kind: "commitment",
					count: commitments.len(),
				})
			}
			let commitment = commitments.into_values().next().expect("checked above");
			self.send_event(SubtreeEvent::Commitment(commitment));
		} else {
			let child_commitments: Vec<Commitment<P>> = commitments.into_values().collect();
			let (commitment_secret, aggregate) = aggregate::generate_commitment_and_aggregate(
				self.node.index(),
				&info.publics,
				&child_commitments,
				&mut self.rng,
			)?;
			secret = Some(commitment_secret);
			self.node.send_to_parent(&CosiData::Commitment(aggregate))?;
		}

		// ----- Challenge -----
		let challenge = match self.channels.challenge.recv().await {
			Some((_, challenge)) => challenge,
			None => return Ok(()),
		};
		debug!("received challenge");

		// Only children whose commitment made it into the mask get
		// the challenge
		for &child in &committed_children {
			self.node.send_to(child, &CosiData::Challenge(challenge.clone()))?;
		}

		// ----- Response -----
		if self.node.is_leaf() {
			// Sentinel keeping the collection step uniform across roles
			self.channels
				.inject_response(self.node.index(), Response { response: P::Scalar::zero() });
		}

		let responses = self.collect_responses(&committed_children).await?;
		let Some(responses) = responses else { return Ok(()) };
		debug!("received all {} response(s)", responses.len());

		if self.node.is_root() {
			if responses.len() != 1 {
				return Err(CosiFailureReason::NotExactlyOne {
					kind: "response",
					count: responses.len(),
				})
			}
			let response = responses.into_values().next().expect("checked above");
			self.send_event(SubtreeEvent::Response(response));
		} else {
			let response = aggregate::generate_response::<P>(
				secret.map(|commitment_secret| (commitment_secret, self.keypair.secret.clone())),
				responses.into_values().map(|response| response.response).collect(),
				&challenge.challenge,
			);
			self.node.send_to_parent(&CosiData::Response(Response::<P> { response }))?;
		}

		Ok(())
	}

	/// Accept as many leaf commitments as arrive within the window;
	/// whoever stays silent is simply left out of the mask.
	async fn collect_commitments(
		&mut self,
		window: Duration,
	) -> Result<BTreeMap<NodeIndex, Commitment<P>>, CosiFailureReason> {
		let mut commitments = BTreeMap::new();

		let deadline = tokio::time::sleep(window);
		tokio::pin!(deadline);

		while commitments.len() < self.node.children().len() {
			tokio::select! {
				received = self.channels.commitment.recv() => match received {
					Some((from, commitment)) => {
						self.ensure_child("commitment", from)?;
						match commitments.entry(from) {
							btree_map::Entry::Occupied(_) =>
								warn!(from, "ignoring a redundant commitment"),
							btree_map::Entry::Vacant(entry) => {
								entry.insert(commitment);
							},
						}
					},
					None => return Ok(commitments),
				},
				() = &mut deadline => {
					warn!(
						"timed out collecting commitments, proceeding with {} of {}",
						commitments.len(),
						self.node.children().len(),
					);
					break
				},
			}
		}

		Ok(commitments)
	}

	/// Exactly one response per committed child; the commit window
	/// already bounded participation, so there is no further timer
	/// here and a missing response leaves the round to the enclosing
	/// budget.
	async fn collect_responses(
		&mut self,
		committed_children: &[NodeIndex],
	) -> Result<Option<BTreeMap<NodeIndex, Response<P>>>, CosiFailureReason> {
		let mut responses = BTreeMap::new();

		while responses.len() < committed_children.len() {
			match self.channels.response.recv().await {
				Some((from, response)) => {
					if !committed_children.contains(&from) {
						return Err(CosiFailureReason::UnexpectedSender { kind: "response", from })
					}
					match responses.entry(from) {
						btree_map::Entry::Occupied(_) =>
							warn!(from, "ignoring a redundant response"),
						btree_map::Entry::Vacant(entry) => {
							entry.insert(response);
						},
					}
				},
				None => return Ok(None),
			}
		}

		Ok(Some(responses))
	}

	fn ensure_child(&self, kind: &'static str, from: NodeIndex) -> Result<(), CosiFailureReason> {
		if self.node.children().contains(&from) {
			Ok(())
		} else {
			Err(CosiFailureReason::UnexpectedSender { kind, from })
		}
	}

	fn send_event(&self, event: SubtreeEvent<P>) {
		if let Some(events) = &self.events {
			let _result = events.send(event);
		}
	}
}
