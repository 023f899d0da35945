//! Three-phase Byzantine agreement over a tree.
//!
//! Every node runs the same instance: the leader (tree root) opens the
//! round with a signed pre-prepare, then prepare and commit are signed
//! broadcasts counted against a `2/3 + 1` quorum of distinct senders,
//! and replies flow back to the leader, which emits the agreed digest.

mod pbft_data;
mod protocol;

#[cfg(test)]
mod tests;

pub use pbft_data::{Commit, PbftData, PrePrepare, Prepare, Reply};
pub use protocol::{quorum, Pbft, PbftConfig, VerificationFn, DEFAULT_TIMEOUT};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::{
	crypto::ECPoint,
	overlay::{DispatchError, Node, NodeIndex, OverlayError, StopChannel},
};

/// Phases of one agreement round, in order
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PbftPhase {
	#[error("pre-prepare")]
	PrePrepare,
	#[error("prepare")]
	Prepare,
	#[error("commit")]
	Commit,
	#[error("reply")]
	Reply,
}

#[derive(Error, Debug, PartialEq)]
pub enum PbftFailureReason {
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("invalid leader signature on the pre-prepare")]
	InvalidLeaderSignature,
	#[error("pre-prepare digest does not match the proposal")]
	DigestMismatch,
	#[error("proposal rejected by the verification function")]
	VerificationFailed,
	#[error("{phase} quorum missed: {received} of {required} valid messages")]
	QuorumMissed { phase: PbftPhase, received: usize, required: usize },
	#[error("overlay error: {0}")]
	Overlay(#[from] OverlayError),
}

/// Typed inbound queues of one agreement instance. Messages for a
/// later phase wait in their queue until the instance gets there.
pub struct PbftChannels<P: ECPoint> {
	pub pre_prepare: UnboundedReceiver<(NodeIndex, PrePrepare<P>)>,
	pub prepare: UnboundedReceiver<(NodeIndex, Prepare<P>)>,
	pub commit: UnboundedReceiver<(NodeIndex, Commit<P>)>,
	pub reply: UnboundedReceiver<(NodeIndex, Reply<P>)>,
}

impl<P: ECPoint> PbftChannels<P> {
	/// Create the queues and wire the node's incoming envelopes into
	/// them by message kind
	pub fn register(node: &Node) -> (Self, StopChannel) {
		let (pre_prepare_sender, pre_prepare) = mpsc::unbounded_channel();
		let (prepare_sender, prepare) = mpsc::unbounded_channel();
		let (commit_sender, commit) = mpsc::unbounded_channel();
		let (reply_sender, reply) = mpsc::unbounded_channel();
		let (stop_sender, stop_receiver) = mpsc::unbounded_channel();

		let stop_injector = stop_sender.clone();

		node.register_handler(Box::new(move |from, payload| {
			let data: PbftData<P> = bincode::deserialize(&payload)
				.map_err(|error| DispatchError::Decode(error.to_string()))?;
			let delivered = match data {
				PbftData::PrePrepare(inner) => pre_prepare_sender.send((from, inner)).is_ok(),
				PbftData::Prepare(inner) => prepare_sender.send((from, inner)).is_ok(),
				PbftData::Commit(inner) => commit_sender.send((from, inner)).is_ok(),
				PbftData::Reply(inner) => reply_sender.send((from, inner)).is_ok(),
				PbftData::Stop(inner) => stop_sender.send((from, inner)).is_ok(),
			};
			if delivered {
				Ok(())
			} else {
				Err(DispatchError::Closed)
			}
		}));

		(
			PbftChannels { pre_prepare, prepare, commit, reply },
			StopChannel::new(stop_receiver, stop_injector),
		)
	}
}
