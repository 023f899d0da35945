//! Tree-organized collective Schnorr signing.
//!
//! A round runs over a depth-2 tree: the root partitions the roster
//! into subtrees, each led by a subleader, and runs one sub-protocol
//! per subtree in parallel. Commitments and responses are aggregated
//! up the tree; the root combines the subtree aggregates into a single
//! signature whose participation mask records exactly who contributed.

pub mod aggregate;
mod cosi_data;
mod protocol;
mod sub_protocol;


pub use cosi_data::{Announcement, Challenge, Commitment, CosiData, Response};
pub use protocol::{
	Cosi, CosiConfig, DEFAULT_LEAVES_TIMEOUT, DEFAULT_PROTOCOL_TIMEOUT, DEFAULT_SUBLEADER_TIMEOUT,
};
pub use sub_protocol::SubCosi;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
	crypto::ECPoint,
	overlay::{DispatchError, Node, NodeIndex, OverlayError, Stop, StopChannel},
};
use aggregate::AggregateError;

#[derive(Error, Debug, PartialEq)]
pub enum CosiFailureReason {
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("received a {kind} from node {from}, which is not a direct child")]
	UnexpectedSender { kind: &'static str, from: NodeIndex },
	#[error("subtree delegate collected {count} {kind}s where exactly one was expected")]
	NotExactlyOne { kind: &'static str, count: usize },
	#[error("subtree {0} did not deliver a response after a successful commitment")]
	MissingSubtreeResponse(usize),
	#[error("subtrees contributed overlapping mask bits")]
	AggregationConflict,
	#[error("aggregation failed: {0}")]
	Aggregation(#[from] AggregateError),
	#[error("round timed out before producing a signature")]
	ProtocolTimeout,
	#[error("overlay error: {0}")]
	Overlay(#[from] OverlayError),
}

/// Typed inbound queues of one collective-signing instance, one per
/// message kind. A message for a phase the instance has not reached
/// yet simply waits in its queue.
pub struct CosiChannels<P: ECPoint> {
	pub announcement: UnboundedReceiver<(NodeIndex, Announcement<P>)>,
	pub commitment: UnboundedReceiver<(NodeIndex, Commitment<P>)>,
	pub challenge: UnboundedReceiver<(NodeIndex, Challenge<P>)>,
	pub response: UnboundedReceiver<(NodeIndex, Response<P>)>,
	challenge_injector: UnboundedSender<(NodeIndex, Challenge<P>)>,
	response_injector: UnboundedSender<(NodeIndex, Response<P>)>,
}

impl<P: ECPoint> CosiChannels<P> {
	/// Create the queues and wire the node's incoming envelopes into
	/// them by message kind
	pub fn register(node: &Node) -> (Self, StopChannel) {
		let (announcement_sender, announcement) = mpsc::unbounded_channel();
		let (commitment_sender, commitment) = mpsc::unbounded_channel();
		let (challenge_sender, challenge) = mpsc::unbounded_channel();
		let (response_sender, response) = mpsc::unbounded_channel();
		let (stop_sender, stop_receiver) = mpsc::unbounded_channel();

		let challenge_injector = challenge_sender.clone();
		let response_injector = response_sender.clone();
		let stop_injector = stop_sender.clone();

		node.register_handler(Box::new(move |from, payload| {
			let data: CosiData<P> = bincode::deserialize(&payload)
				.map_err(|error| DispatchError::Decode(error.to_string()))?;
			let delivered = match data {
				CosiData::Announcement(inner) => announcement_sender.send((from, inner)).is_ok(),
				CosiData::Commitment(inner) => commitment_sender.send((from, inner)).is_ok(),
				CosiData::Challenge(inner) => challenge_sender.send((from, inner)).is_ok(),
				CosiData::Response(inner) => response_sender.send((from, inner)).is_ok(),
				CosiData::Stop(inner) => stop_sender.send((from, inner)).is_ok(),
			};
			if delivered {
				Ok(())
			} else {
				Err(DispatchError::Closed)
			}
		}));

		(
			CosiChannels {
				announcement,
				commitment,
				challenge,
				response,
				challenge_injector,
				response_injector,
			},
			StopChannel::new(stop_receiver, stop_injector),
		)
	}

	pub(crate) fn challenge_injector(&self) -> UnboundedSender<(NodeIndex, Challenge<P>)> {
		self.challenge_injector.clone()
	}

	pub(crate) fn inject_response(&self, from: NodeIndex, response: Response<P>) {
		let _result = self.response_injector.send((from, response));
	}
}

/// Broadcast `Stop` over this instance's subtree if we are its root,
/// per the cancellation rules, then release the channels.
pub(crate) fn shutdown<P: ECPoint>(node: &Node) {
	if node.is_root() {
		let errors = node.broadcast(&CosiData::<P>::Stop(Stop));
		if !errors.is_empty() {
			tracing::warn!("failed to relay stop to {} node(s)", errors.len());
		}
	}
	node.done();
}
