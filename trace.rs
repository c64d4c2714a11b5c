use crate::{Node, Tree};
use thiserror::Error;

/// One step of a decision path: the node visited and, for branches, the feature whose split routed the row onward. The final step is the reached leaf and has no feature.
#[derive(Clone, Debug, PartialEq)]
pub struct PathStep {
	pub node_index: usize,
	pub feature_index: Option<usize>,
}

/// The ordered sequence of nodes one row visits from the root of one tree to the leaf it reaches.
#[derive(Clone, Debug, PartialEq)]
pub struct DecisionPath {
	pub steps: Vec<PathStep>,
}

impl DecisionPath {
	/// The index of the leaf the row reached.
	pub fn leaf_index(&self) -> usize {
		self.steps.last().unwrap().node_index
	}
}

/// Traversal revisited a node, which can only happen if the tree's child references loop. Treated as a malformed tree.
#[derive(Debug, Error)]
#[error("traversal of tree {tree_index} revisited node {node_index}")]
pub struct CycleDetectedError {
	pub tree_index: usize,
	pub node_index: usize,
}

/// Trace the path a row takes through a tree, from the root to the leaf it reaches. Deterministic: the same tree and row always yield the same path.
pub fn trace(tree: &Tree, row: &[f64]) -> Result<DecisionPath, CycleDetectedError> {
	let mut steps = Vec::new();
	let mut visited = vec![false; tree.nodes.len()];
	let mut node_index = 0;
	loop {
		if visited[node_index] {
			return Err(CycleDetectedError {
				tree_index: tree.tree_index,
				node_index,
			});
		}
		visited[node_index] = true;
		match tree.node(node_index) {
			Node::Branch(branch) => {
				steps.push(PathStep {
					node_index,
					feature_index: Some(branch.feature_index),
				});
				node_index = branch.route(row[branch.feature_index]);
			}
			Node::Leaf(_) => {
				steps.push(PathStep {
					node_index,
					feature_index: None,
				});
				return Ok(DecisionPath { steps });
			}
		}
	}
}

#[cfg(test)]
use crate::{NodeRecord, SplitDirection};

#[cfg(test)]
fn test_tree(missing_direction: SplitDirection) -> Tree {
	Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, missing_direction, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	)
	.unwrap()
}

#[test]
fn test_trace() {
	let tree = test_tree(SplitDirection::Left);
	let path = trace(&tree, &[0.7]).unwrap();
	assert_eq!(
		path.steps,
		vec![
			PathStep {
				node_index: 0,
				feature_index: Some(0)
			},
			PathStep {
				node_index: 2,
				feature_index: None
			},
		]
	);
	assert_eq!(path.leaf_index(), 2);
}

#[test]
fn test_missing_value_routing() {
	// A missing value must follow the stored missing direction, so flipping only that flag changes which leaf is reached.
	let row = &[std::f64::NAN];
	let left = test_tree(SplitDirection::Left);
	let path = trace(&left, row).unwrap();
	assert_eq!(path.leaf_index(), 1);
	let right = test_tree(SplitDirection::Right);
	let path = trace(&right, row).unwrap();
	assert_eq!(path.leaf_index(), 2);
}

#[test]
fn test_trace_is_deterministic() {
	let tree = test_tree(SplitDirection::Left);
	let row = &[0.3];
	assert_eq!(trace(&tree, row).unwrap(), trace(&tree, row).unwrap());
}

#[test]
fn test_cycle_detected() {
	use crate::{BranchNode, LeafNode};
	// Built by hand because `Tree::from_records` rejects this structure.
	let tree = Tree {
		nodes: vec![
			Node::Branch(BranchNode {
				left_child_index: 1,
				right_child_index: 2,
				feature_index: 0,
				split_value: 0.5,
				missing_direction: SplitDirection::Left,
				value: 0.0,
			}),
			Node::Branch(BranchNode {
				left_child_index: 0,
				right_child_index: 2,
				feature_index: 0,
				split_value: 0.5,
				missing_direction: SplitDirection::Left,
				value: 0.0,
			}),
			Node::Leaf(LeafNode { value: 1.0 }),
		],
		tree_index: 7,
		class_index: 0,
	};
	let error = trace(&tree, &[0.3]).unwrap_err();
	assert_eq!(error.tree_index, 7);
	assert_eq!(error.node_index, 0);
}
