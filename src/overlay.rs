//! Message routing substrate for tree protocols.
//!
//! Every protocol instance registers a message handler with its node's
//! [`Endpoint`]; the handler decodes incoming envelopes and wires them
//! into the instance's typed inbound queues. Envelopes arriving before
//! an instance has registered are buffered, so message delivery and
//! instance startup can race freely. All sends are addressed along
//! tree edges (parent, children) or to the whole tree (broadcast).

pub mod shape;

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::crypto::ECPoint;

pub use shape::Tree;

/// Position of a node in the roster. The root is always index 0.
pub type NodeIndex = u32;

/// Identifies one protocol instance; concurrent instances on the same
/// node (e.g. one per subtree) use distinct ids.
pub type InstanceId = u64;

/// Stable identity of a tree node
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl std::fmt::Display for NodeId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", hex::encode(&self.0[..4]))
	}
}

/// A roster entry: identity plus long-term public key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Peer<P: ECPoint> {
	pub id: NodeId,
	#[serde(bound = "")]
	pub public: P,
}

/// Ordered sequence of participants; index 0 is the root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Roster<P: ECPoint> {
	#[serde(bound = "")]
	peers: Vec<Peer<P>>,
}

impl<P: ECPoint> Roster<P> {
	pub fn new(peers: Vec<Peer<P>>) -> Self {
		Roster { peers }
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	pub fn peer(&self, index: NodeIndex) -> Option<&Peer<P>> {
		self.peers.get(index as usize)
	}

	pub fn public(&self, index: NodeIndex) -> Option<&P> {
		self.peer(index).map(|peer| &peer.public)
	}

	pub fn publics(&self) -> Vec<P> {
		self.peers.iter().map(|peer| peer.public).collect()
	}

	pub fn index_of(&self, id: &NodeId) -> Option<NodeIndex> {
		self.peers.iter().position(|peer| &peer.id == id).map(|idx| idx as NodeIndex)
	}
}

/// Orderly-teardown control message, understood by every protocol.
/// A root receiving it re-broadcasts it over its tree before
/// releasing its channels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stop;

impl std::fmt::Display for Stop {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Stop")
	}
}

/// The stop queue of one instance, kept apart from the phase queues so
/// a dispatch loop can select over it while phases borrow the rest.
pub struct StopChannel {
	pub receiver: tokio::sync::mpsc::UnboundedReceiver<(NodeIndex, Stop)>,
	injector: tokio::sync::mpsc::UnboundedSender<(NodeIndex, Stop)>,
}

impl StopChannel {
	pub(crate) fn new(
		receiver: tokio::sync::mpsc::UnboundedReceiver<(NodeIndex, Stop)>,
		injector: tokio::sync::mpsc::UnboundedSender<(NodeIndex, Stop)>,
	) -> Self {
		StopChannel { receiver, injector }
	}

	/// Sender that short-circuits the overlay, used by an enclosing
	/// instance on the same node to stop this one directly
	pub(crate) fn injector(&self) -> tokio::sync::mpsc::UnboundedSender<(NodeIndex, Stop)> {
		self.injector.clone()
	}
}

/// What actually crosses between nodes: the instance the message is
/// for, the sender's roster position and the encoded protocol data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
	pub instance: InstanceId,
	pub from: NodeIndex,
	pub payload: Vec<u8>,
}

/// Decodes an envelope payload and routes it into an instance's typed
/// inbound queues. Returning an error drops the message.
pub type MessageHandler = Box<dyn Fn(NodeIndex, Vec<u8>) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("failed to decode message: {0}")]
	Decode(String),
	#[error("instance is shutting down")]
	Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
	#[error("node {0} has no parent")]
	NoParent(NodeIndex),
	#[error("node {0} is not part of the tree")]
	NotAMember(NodeIndex),
	#[error("failed to encode message: {0}")]
	Encode(String),
}

#[derive(Default)]
struct Endpoint {
	handlers: Mutex<HashMap<InstanceId, MessageHandler>>,
	/// Envelopes for instances that have not registered yet
	pending: Mutex<HashMap<InstanceId, Vec<(NodeIndex, Vec<u8>)>>>,
	/// Instances that have released their channels; late messages for
	/// them are dropped rather than buffered
	released: Mutex<BTreeSet<InstanceId>>,
}

impl Endpoint {
	fn dispatch(&self, envelope: Envelope) {
		let handlers = self.handlers.lock().unwrap();
		match handlers.get(&envelope.instance) {
			Some(handler) => {
				if let Err(error) = handler(envelope.from, envelope.payload) {
					warn!(
						from = envelope.from,
						instance = envelope.instance,
						"Dropping undeliverable message: {error}"
					);
				}
			},
			None => {
				if self.released.lock().unwrap().contains(&envelope.instance) {
					return
				}
				self.pending
					.lock()
					.unwrap()
					.entry(envelope.instance)
					.or_default()
					.push((envelope.from, envelope.payload));
			},
		}
	}

	fn register(&self, instance: InstanceId, handler: MessageHandler) {
		let buffered = self.pending.lock().unwrap().remove(&instance).unwrap_or_default();
		for (from, payload) in buffered {
			if let Err(error) = handler(from, payload) {
				warn!(from, instance, "Dropping undeliverable buffered message: {error}");
			}
		}
		self.handlers.lock().unwrap().insert(instance, handler);
	}

	fn release(&self, instance: InstanceId) {
		// Dropping the handler drops the typed channel senders it
		// captured, which closes the instance's inbound queues. The
		// released set makes repeated calls (and late messages) no-ops.
		self.released.lock().unwrap().insert(instance);
		self.handlers.lock().unwrap().remove(&instance);
		self.pending.lock().unwrap().remove(&instance);
	}
}

#[cfg(test)]
type FaultInjector = Box<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

/// In-memory overlay connecting all roster positions. Delivery is
/// immediate and per-edge FIFO; nodes can be silenced to model
/// crashed or unreachable participants.
pub struct Network {
	endpoints: Vec<Endpoint>,
	silenced: Mutex<BTreeSet<NodeIndex>>,
	#[cfg(test)]
	fault_injector: Mutex<Option<FaultInjector>>,
	#[cfg(test)]
	observer: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Envelope>>>,
}

impl Network {
	pub fn new(size: usize) -> Arc<Self> {
		Arc::new(Network {
			endpoints: (0..size).map(|_| Endpoint::default()).collect(),
			silenced: Mutex::new(BTreeSet::new()),
			#[cfg(test)]
			fault_injector: Mutex::new(None),
			#[cfg(test)]
			observer: Mutex::new(None),
		})
	}

	pub fn size(&self) -> usize {
		self.endpoints.len()
	}

	/// Stop delivering messages from and to the given node
	pub fn silence(&self, index: NodeIndex) {
		self.silenced.lock().unwrap().insert(index);
	}

	/// Create a handle for one protocol instance at `index` on `tree`
	pub fn node(
		self: &Arc<Self>,
		tree: Arc<Tree>,
		index: NodeIndex,
		instance: InstanceId,
	) -> Result<Node, OverlayError> {
		if index as usize >= self.endpoints.len() || !tree.is_member(index) {
			return Err(OverlayError::NotAMember(index))
		}
		Ok(Node { network: self.clone(), tree, index, instance })
	}

	fn deliver(&self, to: NodeIndex, envelope: Envelope) {
		{
			let silenced = self.silenced.lock().unwrap();
			if silenced.contains(&envelope.from) || silenced.contains(&to) {
				return
			}
		}

		#[cfg(test)]
		let envelope = {
			if let Some(sender) = self.observer.lock().unwrap().as_ref() {
				let _result = sender.send(envelope.clone());
			}
			match self.fault_injector.lock().unwrap().as_ref() {
				Some(inject) => match inject(&envelope) {
					Some(envelope) => envelope,
					None => return,
				},
				None => envelope,
			}
		};

		if let Some(endpoint) = self.endpoints.get(to as usize) {
			endpoint.dispatch(envelope);
		}
	}

	#[cfg(test)]
	pub fn set_fault_injector(&self, injector: FaultInjector) {
		*self.fault_injector.lock().unwrap() = Some(injector);
	}

	#[cfg(test)]
	pub fn observe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
		let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
		*self.observer.lock().unwrap() = Some(sender);
		receiver
	}
}

/// Per-instance handle onto the overlay: topology queries plus sends
/// along tree edges. Cloning is cheap; all clones share the same
/// registration, and `done` is idempotent across them.
#[derive(Clone)]
pub struct Node {
	network: Arc<Network>,
	tree: Arc<Tree>,
	index: NodeIndex,
	instance: InstanceId,
}

impl Node {
	pub fn index(&self) -> NodeIndex {
		self.index
	}

	pub fn instance(&self) -> InstanceId {
		self.instance
	}

	pub fn tree(&self) -> &Arc<Tree> {
		&self.tree
	}

	pub fn is_root(&self) -> bool {
		self.tree.root() == self.index
	}

	pub fn is_leaf(&self) -> bool {
		self.children().is_empty()
	}

	pub fn parent(&self) -> Option<NodeIndex> {
		self.tree.parent_of(self.index)
	}

	pub fn children(&self) -> &[NodeIndex] {
		self.tree.children_of(self.index)
	}

	/// Register the decoder that wires incoming payloads into this
	/// instance's typed queues; drains any buffered envelopes.
	pub fn register_handler(&self, handler: MessageHandler) {
		self.endpoint().register(self.instance, handler);
	}

	/// Release this instance's channels. Idempotent: repeated calls
	/// (e.g. a Stop racing the normal terminal path) are no-ops.
	pub fn done(&self) {
		self.endpoint().release(self.instance);
	}

	pub fn send_to<T: Serialize>(&self, to: NodeIndex, data: &T) -> Result<(), OverlayError> {
		if !self.tree.is_member(to) {
			return Err(OverlayError::NotAMember(to))
		}
		let envelope = self.envelope(data)?;
		self.network.deliver(to, envelope);
		Ok(())
	}

	pub fn send_to_parent<T: Serialize>(&self, data: &T) -> Result<(), OverlayError> {
		let parent = self.parent().ok_or(OverlayError::NoParent(self.index))?;
		self.send_to(parent, data)
	}

	/// Send to each child in order, stopping at the first failure
	pub fn send_to_children<T: Serialize>(&self, data: &T) -> Result<(), OverlayError> {
		let envelope = self.envelope(data)?;
		for &child in self.children() {
			self.network.deliver(child, envelope.clone());
		}
		Ok(())
	}

	/// Send to all children, collecting per-child failures instead of
	/// stopping at the first one
	pub fn send_to_children_in_parallel<T: Serialize>(&self, data: &T) -> Vec<OverlayError> {
		let envelope = match self.envelope(data) {
			Ok(envelope) => envelope,
			Err(error) => return vec![error],
		};
		for &child in self.children() {
			self.network.deliver(child, envelope.clone());
		}
		Vec::new()
	}

	/// Send to every other member of the tree
	pub fn broadcast<T: Serialize>(&self, data: &T) -> Vec<OverlayError> {
		let envelope = match self.envelope(data) {
			Ok(envelope) => envelope,
			Err(error) => return vec![error],
		};
		for member in self.tree.members() {
			if member != self.index {
				self.network.deliver(member, envelope.clone());
			}
		}
		Vec::new()
	}

	fn envelope<T: Serialize>(&self, data: &T) -> Result<Envelope, OverlayError> {
		let payload =
			bincode::serialize(data).map_err(|error| OverlayError::Encode(error.to_string()))?;
		Ok(Envelope { instance: self.instance, from: self.index, payload })
	}

	fn endpoint(&self) -> &Endpoint {
		&self.network.endpoints[self.index as usize]
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	fn collecting_handler(
		sender: mpsc::UnboundedSender<(NodeIndex, Vec<u8>)>,
	) -> MessageHandler {
		Box::new(move |from, payload| {
			sender.send((from, payload)).map_err(|_| DispatchError::Closed)
		})
	}

	#[tokio::test]
	async fn routes_messages_to_registered_instance() {
		let network = Network::new(3);
		let tree = Arc::new(Tree::star(3));

		let root = network.node(tree.clone(), 0, 1).unwrap();
		let child = network.node(tree, 1, 1).unwrap();

		let (sender, mut receiver) = mpsc::unbounded_channel();
		root.register_handler(collecting_handler(sender));

		child.send_to_parent(&42u32).unwrap();

		let (from, payload) = receiver.recv().await.unwrap();
		assert_eq!(from, 1);
		assert_eq!(bincode::deserialize::<u32>(&payload).unwrap(), 42);
	}

	#[tokio::test]
	async fn buffers_messages_until_registration() {
		let network = Network::new(2);
		let tree = Arc::new(Tree::star(2));

		let root = network.node(tree.clone(), 0, 7).unwrap();
		let child = network.node(tree, 1, 7).unwrap();

		child.send_to_parent(&1u32).unwrap();
		child.send_to_parent(&2u32).unwrap();

		let (sender, mut receiver) = mpsc::unbounded_channel();
		root.register_handler(collecting_handler(sender));

		// Buffered envelopes are delivered in order on registration
		assert_eq!(bincode::deserialize::<u32>(&receiver.recv().await.unwrap().1).unwrap(), 1);
		assert_eq!(bincode::deserialize::<u32>(&receiver.recv().await.unwrap().1).unwrap(), 2);
	}

	#[tokio::test]
	async fn done_closes_channels_and_is_idempotent() {
		let network = Network::new(2);
		let tree = Arc::new(Tree::star(2));

		let root = network.node(tree.clone(), 0, 1).unwrap();
		let child = network.node(tree, 1, 1).unwrap();

		let (sender, mut receiver) = mpsc::unbounded_channel();
		root.register_handler(collecting_handler(sender));

		root.done();
		root.done();

		// Messages after release are dropped, not buffered
		child.send_to_parent(&1u32).unwrap();
		assert!(receiver.recv().await.is_none());
	}

	#[test]
	fn silenced_nodes_do_not_send_or_receive() {
		let network = Network::new(3);
		let tree = Arc::new(Tree::star(3));

		let root = network.node(tree.clone(), 0, 1).unwrap();
		let silenced = network.node(tree, 2, 1).unwrap();
		network.silence(2);

		let (sender, mut receiver) = mpsc::unbounded_channel();
		root.register_handler(collecting_handler(sender));

		silenced.send_to_parent(&1u32).unwrap();
		assert!(receiver.try_recv().is_err());
	}

	#[test]
	fn sends_are_restricted_to_tree_members() {
		let network = Network::new(4);
		// Tree over the first three indices only
		let tree = Arc::new(Tree::star(3));

		let root = network.node(tree, 0, 1).unwrap();
		assert_eq!(root.send_to(3, &1u32), Err(OverlayError::NotAMember(3)));
		assert_eq!(root.send_to_parent(&1u32), Err(OverlayError::NoParent(0)));
	}

	#[test]
	fn roster_maps_ids_to_indices() {
		use crate::{crypto::ed25519::Point, helpers::new_roster};

		let (roster, _keypairs) = new_roster::<Point>(3, [3; 32]);
		let id = roster.peer(2).unwrap().id;
		assert_eq!(roster.index_of(&id), Some(2));
		assert_eq!(roster.len(), 3);
	}
}
