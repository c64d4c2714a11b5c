use crate::{BranchNode, Ensemble, LeafNode, Node, SplitDirection, Tree};
use thiserror::Error;

/// A `NodeRecord` is the flat, already parsed form of one node, as produced by an adapter for an external training library's tree dump. Leaf records carry only `index` and `value`; branch records carry every field. Records for one tree must be dense: indexes run from 0 with the root at 0, in order.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NodeRecord {
	/// The node's index within its tree.
	pub index: usize,
	#[serde(default)]
	pub left_child: Option<usize>,
	#[serde(default)]
	pub right_child: Option<usize>,
	#[serde(default)]
	pub feature_index: Option<usize>,
	#[serde(default)]
	pub split_value: Option<f64>,
	#[serde(default)]
	pub missing_direction: Option<SplitDirection>,
	/// The value the model would output if traversal stopped at this node.
	pub value: f64,
}

impl NodeRecord {
	pub fn leaf(index: usize, value: f64) -> NodeRecord {
		NodeRecord {
			index,
			left_child: None,
			right_child: None,
			feature_index: None,
			split_value: None,
			missing_direction: None,
			value,
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub fn branch(
		index: usize,
		left_child: usize,
		right_child: usize,
		feature_index: usize,
		split_value: f64,
		missing_direction: SplitDirection,
		value: f64,
	) -> NodeRecord {
		NodeRecord {
			index,
			left_child: Some(left_child),
			right_child: Some(right_child),
			feature_index: Some(feature_index),
			split_value: Some(split_value),
			missing_direction: Some(missing_direction),
			value,
		}
	}
}

/// A structural violation in supplied node records. A malformed tree invalidates every row that would traverse it, so these are surfaced immediately and abort the whole decomposition.
#[derive(Debug, Error)]
pub enum MalformedTreeError {
	#[error("tree has no nodes")]
	Empty,
	#[error("expected node index {expected} but found {found}")]
	NodeIndexMismatch { expected: usize, found: usize },
	#[error("node {node_index} references child {child_index}, which is out of range")]
	ChildIndexOutOfRange { node_index: usize, child_index: usize },
	#[error("node {child_index} is referenced as a child more than once")]
	SharedChild { child_index: usize },
	#[error("leaf node {node_index} carries split fields")]
	LeafWithSplitFields { node_index: usize },
	#[error("branch node {node_index} is missing split fields")]
	MissingSplitFields { node_index: usize },
	#[error("tree has {n_nodes} nodes but {n_edges} child references")]
	EdgeCountMismatch { n_nodes: usize, n_edges: usize },
	#[error("node {node_index} is not reachable from the root")]
	UnreachableNode { node_index: usize },
	#[error("an ensemble must have at least one class")]
	NoClasses,
	#[error("tree {tree_index} is assigned to class {class_index}, but the ensemble has {n_classes} classes")]
	ClassIndexOutOfRange {
		tree_index: usize,
		class_index: usize,
		n_classes: usize,
	},
	#[error("expected one base score per class ({n_classes}), found {found}")]
	BaseScoreCountMismatch { n_classes: usize, found: usize },
	#[error("node {node_index} in tree {tree_index} tests feature {feature_index}, but rows have {n_features} features")]
	FeatureIndexOutOfRange {
		tree_index: usize,
		node_index: usize,
		feature_index: usize,
		n_features: usize,
	},
}

impl Tree {
	/// Build a tree from parsed node records, validating that they form a binary tree: indexes are dense and in order, children are in range and referenced exactly once, every node is reachable from the root, leaves carry no split fields, and branches carry all of them.
	pub fn from_records(
		records: Vec<NodeRecord>,
		tree_index: usize,
		class_index: usize,
	) -> Result<Tree, MalformedTreeError> {
		if records.is_empty() {
			return Err(MalformedTreeError::Empty);
		}
		let n_nodes = records.len();
		for (expected, record) in records.iter().enumerate() {
			if record.index != expected {
				return Err(MalformedTreeError::NodeIndexMismatch {
					expected,
					found: record.index,
				});
			}
		}
		let mut nodes = Vec::with_capacity(n_nodes);
		for record in &records {
			let node = match (record.left_child, record.right_child) {
				(None, None) => {
					if record.feature_index.is_some()
						|| record.split_value.is_some()
						|| record.missing_direction.is_some()
					{
						return Err(MalformedTreeError::LeafWithSplitFields {
							node_index: record.index,
						});
					}
					Node::Leaf(LeafNode {
						value: record.value,
					})
				}
				(Some(left_child_index), Some(right_child_index)) => {
					let (feature_index, split_value, missing_direction) = match (
						record.feature_index,
						record.split_value,
						record.missing_direction,
					) {
						(Some(f), Some(s), Some(m)) => (f, s, m),
						_ => {
							return Err(MalformedTreeError::MissingSplitFields {
								node_index: record.index,
							})
						}
					};
					for &child_index in &[left_child_index, right_child_index] {
						if child_index >= n_nodes {
							return Err(MalformedTreeError::ChildIndexOutOfRange {
								node_index: record.index,
								child_index,
							});
						}
					}
					Node::Branch(BranchNode {
						left_child_index,
						right_child_index,
						feature_index,
						split_value,
						missing_direction,
						value: record.value,
					})
				}
				_ => {
					return Err(MalformedTreeError::MissingSplitFields {
						node_index: record.index,
					})
				}
			};
			nodes.push(node);
		}
		// Every node except the root must be referenced as a child exactly once. Together with the edge count and the reachability walk below, this guarantees the nodes form a single acyclic tree.
		let mut parent_counts = vec![0; n_nodes];
		let mut n_edges = 0;
		for node in &nodes {
			if let Node::Branch(branch) = node {
				for &child_index in &[branch.left_child_index, branch.right_child_index] {
					parent_counts[child_index] += 1;
					n_edges += 1;
					if parent_counts[child_index] > 1 {
						return Err(MalformedTreeError::SharedChild { child_index });
					}
				}
			}
		}
		if n_edges != n_nodes - 1 {
			return Err(MalformedTreeError::EdgeCountMismatch { n_nodes, n_edges });
		}
		let mut reachable = vec![false; n_nodes];
		let mut stack = vec![0];
		while let Some(node_index) = stack.pop() {
			if reachable[node_index] {
				continue;
			}
			reachable[node_index] = true;
			if let Node::Branch(branch) = &nodes[node_index] {
				stack.push(branch.left_child_index);
				stack.push(branch.right_child_index);
			}
		}
		if let Some(node_index) = reachable.iter().position(|reached| !reached) {
			return Err(MalformedTreeError::UnreachableNode { node_index });
		}
		Ok(Tree {
			nodes,
			tree_index,
			class_index,
		})
	}
}

impl Ensemble {
	/// Build an ensemble from trees, validating that every tree's class index is in range and that there is one base score per class.
	pub fn new(
		trees: Vec<Tree>,
		n_classes: usize,
		base_scores: Vec<f64>,
		feature_names: Option<Vec<String>>,
	) -> Result<Ensemble, MalformedTreeError> {
		if n_classes == 0 {
			return Err(MalformedTreeError::NoClasses);
		}
		if base_scores.len() != n_classes {
			return Err(MalformedTreeError::BaseScoreCountMismatch {
				n_classes,
				found: base_scores.len(),
			});
		}
		for tree in &trees {
			if tree.class_index >= n_classes {
				return Err(MalformedTreeError::ClassIndexOutOfRange {
					tree_index: tree.tree_index,
					class_index: tree.class_index,
					n_classes,
				});
			}
		}
		Ok(Ensemble {
			trees,
			n_classes,
			base_scores,
			feature_names,
		})
	}
}

#[test]
fn test_from_records() {
	let tree = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	)
	.unwrap();
	assert_eq!(tree.nodes.len(), 3);
	assert!(!tree.root().is_leaf());
	assert_eq!(tree.root().value(), 0.0);
	assert_eq!(tree.node(2).value(), 1.0);
	assert_eq!(tree.predict(&[0.7]), 1.0);
	assert_eq!(tree.predict(&[0.3]), -1.0);
}

#[test]
fn test_node_index_mismatch() {
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(2, 1.0),
			NodeRecord::leaf(1, -1.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::NodeIndexMismatch {
			expected: 1,
			found: 2
		})
	));
}

#[test]
fn test_child_index_out_of_range() {
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 5, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::ChildIndexOutOfRange {
			node_index: 0,
			child_index: 5
		})
	));
}

#[test]
fn test_shared_child() {
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 1, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::SharedChild { child_index: 1 })
	));
}

#[test]
fn test_leaf_with_split_fields() {
	let mut record = NodeRecord::leaf(1, -1.0);
	record.split_value = Some(0.5);
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			record,
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::LeafWithSplitFields { node_index: 1 })
	));
}

#[test]
fn test_missing_split_fields() {
	let mut record = NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0);
	record.missing_direction = None;
	let result = Tree::from_records(
		vec![record, NodeRecord::leaf(1, -1.0), NodeRecord::leaf(2, 1.0)],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::MissingSplitFields { node_index: 0 })
	));
}

#[test]
fn test_unreachable_node() {
	// Node 3 parents itself, so every in degree is fine but the walk from the root never reaches it.
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
			NodeRecord::branch(3, 3, 4, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(4, 2.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::UnreachableNode { node_index: 3 })
	));
}

#[test]
fn test_orphan_node() {
	let result = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
			NodeRecord::leaf(3, 2.0),
		],
		0,
		0,
	);
	assert!(matches!(
		result,
		Err(MalformedTreeError::EdgeCountMismatch {
			n_nodes: 4,
			n_edges: 2
		})
	));
}

#[test]
fn test_ensemble_base_score_count() {
	let tree = Tree::from_records(vec![NodeRecord::leaf(0, 0.5)], 0, 0).unwrap();
	let result = Ensemble::new(vec![tree], 2, vec![0.0], None);
	assert!(matches!(
		result,
		Err(MalformedTreeError::BaseScoreCountMismatch {
			n_classes: 2,
			found: 1
		})
	));
}

#[test]
fn test_ensemble_class_index_out_of_range() {
	let tree = Tree::from_records(vec![NodeRecord::leaf(0, 0.5)], 0, 3).unwrap();
	let result = Ensemble::new(vec![tree], 2, vec![0.0, 0.0], None);
	assert!(matches!(
		result,
		Err(MalformedTreeError::ClassIndexOutOfRange {
			tree_index: 0,
			class_index: 3,
			n_classes: 2
		})
	));
}
