//! Tree topologies and the deterministic partition of a roster into
//! subtrees. Subleader positions are spaced approximately evenly over
//! the non-root roster range; remaining positions become leaves,
//! distributed round-robin.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::NodeIndex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
	#[error("a tree needs at least one host")]
	NoHosts,
	#[error("at least one subtree is required")]
	NoSubtrees,
}

/// A rooted tree over roster positions. Only edges are stored, so a
/// tree may span a subset of the roster (the subtrees handed to each
/// collective-signing delegate do).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
	root: NodeIndex,
	parent: BTreeMap<NodeIndex, NodeIndex>,
	children: BTreeMap<NodeIndex, Vec<NodeIndex>>,
}

impl Tree {
	fn new(root: NodeIndex) -> Self {
		Tree { root, parent: BTreeMap::new(), children: BTreeMap::new() }
	}

	fn add_edge(&mut self, parent: NodeIndex, child: NodeIndex) {
		self.parent.insert(child, parent);
		self.children.entry(parent).or_default().push(child);
	}

	/// Root with every other position as a direct child
	pub fn star(hosts: usize) -> Self {
		let mut tree = Tree::new(0);
		for child in 1..hosts as NodeIndex {
			tree.add_edge(0, child);
		}
		tree
	}

	/// Depth-2 tree: root, subleaders, leaves
	pub fn two_level(hosts: usize, n_subtrees: usize) -> Result<Self, ShapeError> {
		let mut tree = Tree::new(0);
		for (subleader, leaves) in partition(hosts, n_subtrees)? {
			tree.add_edge(0, subleader);
			for leaf in leaves {
				tree.add_edge(subleader, leaf);
			}
		}
		Ok(tree)
	}

	/// One depth-2 tree per subtree, each spanning the root, one
	/// subleader and that subleader's leaves. These are the trees the
	/// root's per-subtree delegates run on.
	pub fn cosi_subtrees(hosts: usize, n_subtrees: usize) -> Result<Vec<Self>, ShapeError> {
		Ok(partition(hosts, n_subtrees)?
			.into_iter()
			.map(|(subleader, leaves)| {
				let mut tree = Tree::new(0);
				tree.add_edge(0, subleader);
				for leaf in leaves {
					tree.add_edge(subleader, leaf);
				}
				tree
			})
			.collect())
	}

	pub fn root(&self) -> NodeIndex {
		self.root
	}

	pub fn size(&self) -> usize {
		1 + self.parent.len()
	}

	pub fn is_member(&self, index: NodeIndex) -> bool {
		index == self.root || self.parent.contains_key(&index)
	}

	pub fn members(&self) -> Vec<NodeIndex> {
		std::iter::once(self.root).chain(self.parent.keys().copied()).collect()
	}

	pub fn parent_of(&self, index: NodeIndex) -> Option<NodeIndex> {
		self.parent.get(&index).copied()
	}

	pub fn children_of(&self, index: NodeIndex) -> &[NodeIndex] {
		self.children.get(&index).map(Vec::as_slice).unwrap_or(&[])
	}
}

/// Subleader positions for a partition of `hosts` into `n_subtrees`:
/// `1 + round(i·(hosts−1)/N)`, clamped to the roster and deduplicated.
/// Deterministic on identical inputs.
pub fn subleader_indices(hosts: usize, n_subtrees: usize) -> Vec<NodeIndex> {
	let mut subleaders: Vec<NodeIndex> = Vec::with_capacity(n_subtrees);
	for i in 0..n_subtrees {
		let spacing = (i as f64 * (hosts - 1) as f64 / n_subtrees as f64).round() as usize;
		let index = (1 + spacing).min(hosts - 1) as NodeIndex;
		if subleaders.last() != Some(&index) {
			subleaders.push(index);
		}
	}
	subleaders
}

/// All non-root, non-subleader positions, in roster order
pub fn leaf_indices(hosts: usize, n_subtrees: usize) -> Vec<NodeIndex> {
	let subleaders = subleader_indices(hosts, n_subtrees);
	(1..hosts as NodeIndex).filter(|index| !subleaders.contains(index)).collect()
}

/// (subleader, leaves) pairs; leaves are assigned round-robin in
/// roster order
fn partition(
	hosts: usize,
	n_subtrees: usize,
) -> Result<Vec<(NodeIndex, Vec<NodeIndex>)>, ShapeError> {
	if hosts == 0 {
		return Err(ShapeError::NoHosts)
	}
	if n_subtrees == 0 {
		return Err(ShapeError::NoSubtrees)
	}
	if hosts == 1 {
		return Ok(Vec::new())
	}

	let subleaders = subleader_indices(hosts, n_subtrees);
	let mut subtrees: Vec<(NodeIndex, Vec<NodeIndex>)> =
		subleaders.iter().map(|&subleader| (subleader, Vec::new())).collect();

	let n = subtrees.len();
	for (position, leaf) in leaf_indices(hosts, n_subtrees).into_iter().enumerate() {
		subtrees[position % n].1.push(leaf);
	}

	Ok(subtrees)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subleaders_are_evenly_spaced() {
		assert_eq!(subleader_indices(7, 2), vec![1, 4]);
		assert_eq!(subleader_indices(9, 2), vec![1, 5]);
		assert_eq!(subleader_indices(9, 3), vec![1, 4, 6]);
	}

	#[test]
	fn subleaders_are_deduplicated_and_clamped() {
		// More subtrees than non-root hosts collapses to what fits
		assert_eq!(subleader_indices(2, 2), vec![1]);
		assert_eq!(subleader_indices(3, 5), vec![1, 2]);
	}

	#[test]
	fn every_subtree_has_one_subleader_when_maximal() {
		// n_subtrees == hosts - 1: one subleader each, zero leaves
		let subtrees = partition(7, 6).unwrap();
		assert_eq!(subtrees.len(), 6);
		for (subleader, leaves) in &subtrees {
			assert!((1..7).contains(subleader));
			assert!(leaves.is_empty());
		}
	}

	#[test]
	fn leaves_are_distributed_round_robin() {
		let subtrees = partition(7, 2).unwrap();
		assert_eq!(subtrees, vec![(1, vec![2, 5]), (4, vec![3, 6])]);
	}

	#[test]
	fn partition_is_deterministic() {
		assert_eq!(partition(20, 3).unwrap(), partition(20, 3).unwrap());
	}

	#[test]
	fn single_host_has_no_subtrees() {
		assert!(partition(1, 2).unwrap().is_empty());
		assert_eq!(Tree::two_level(1, 2).unwrap().size(), 1);
	}

	#[test]
	fn two_level_tree_matches_partition() {
		let tree = Tree::two_level(7, 2).unwrap();
		assert_eq!(tree.size(), 7);
		assert_eq!(tree.children_of(0), &[1, 4]);
		assert_eq!(tree.children_of(1), &[2, 5]);
		assert_eq!(tree.children_of(4), &[3, 6]);
		assert_eq!(tree.parent_of(5), Some(1));
		assert_eq!(tree.parent_of(0), None);
	}

	#[test]
	fn star_tree_parents_everything_at_the_root() {
		let tree = Tree::star(4);
		assert_eq!(tree.size(), 4);
		assert_eq!(tree.children_of(0), &[1, 2, 3]);
		assert!(tree.is_member(3));
		assert!(!tree.is_member(4));
	}
}
