/*!
This module checks that a trained ensemble actually honors declared monotonic constraints. For every branch that splits on a constrained feature, the leaf values reachable on the side the constraint expects to be lower must not exceed the leaf values reachable on the side it expects to be higher.
*/

use crate::{Ensemble, Node, Tree};
use std::collections::BTreeMap;

/// The direction a feature is constrained to move the prediction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Monotonicity {
	Increasing,
	Decreasing,
}

/// A split whose reachable leaf values break a declared constraint.
#[derive(Clone, Debug, PartialEq)]
pub struct MonotonicViolation {
	pub tree_index: usize,
	pub node_index: usize,
	pub feature_index: usize,
	pub monotonicity: Monotonicity,
	/// The largest leaf value reachable on the side the constraint expects to be lower.
	pub lower_side_max: f64,
	/// The smallest leaf value reachable on the side the constraint expects to be higher.
	pub higher_side_min: f64,
}

/// Check every split on a constrained feature across the whole ensemble. Returns all violations rather than failing on the first, so callers can report them together. An empty result means the constraints hold.
pub fn check_monotonicity(
	ensemble: &Ensemble,
	constraints: &BTreeMap<usize, Monotonicity>,
) -> Vec<MonotonicViolation> {
	let mut violations = Vec::new();
	for tree in &ensemble.trees {
		for (node_index, node) in tree.nodes.iter().enumerate() {
			let branch = match node {
				Node::Branch(branch) => branch,
				Node::Leaf(_) => continue,
			};
			let monotonicity = match constraints.get(&branch.feature_index) {
				Some(monotonicity) => *monotonicity,
				None => continue,
			};
			let (left_min, left_max) = leaf_range(tree, branch.left_child_index);
			let (right_min, right_max) = leaf_range(tree, branch.right_child_index);
			// The left child holds the lower feature values, so an increasing constraint requires every leaf on the left to be at most every leaf on the right.
			let (lower_side_max, higher_side_min) = match monotonicity {
				Monotonicity::Increasing => (left_max, right_min),
				Monotonicity::Decreasing => (right_max, left_min),
			};
			if lower_side_max > higher_side_min {
				violations.push(MonotonicViolation {
					tree_index: tree.tree_index,
					node_index,
					feature_index: branch.feature_index,
					monotonicity,
					lower_side_max,
					higher_side_min,
				});
			}
		}
	}
	violations
}

/// The smallest and largest leaf values reachable from a node.
fn leaf_range(tree: &Tree, node_index: usize) -> (f64, f64) {
	match tree.node(node_index) {
		Node::Leaf(leaf) => (leaf.value, leaf.value),
		Node::Branch(branch) => {
			let (left_min, left_max) = leaf_range(tree, branch.left_child_index);
			let (right_min, right_max) = leaf_range(tree, branch.right_child_index);
			(left_min.min(right_min), left_max.max(right_max))
		}
	}
}

#[cfg(test)]
use crate::{NodeRecord, SplitDirection};
#[cfg(test)]
use maplit::btreemap;

#[cfg(test)]
fn tree_with_leaves(left: f64, right: f64) -> Tree {
	Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, left),
			NodeRecord::leaf(2, right),
		],
		0,
		0,
	)
	.unwrap()
}

#[test]
fn test_constraint_holds() {
	let ensemble = Ensemble::new(vec![tree_with_leaves(-1.0, 1.0)], 1, vec![0.0], None).unwrap();
	let constraints = btreemap! { 0 => Monotonicity::Increasing };
	assert!(check_monotonicity(&ensemble, &constraints).is_empty());
	// The same tree read as decreasing is a violation.
	let constraints = btreemap! { 0 => Monotonicity::Decreasing };
	assert_eq!(check_monotonicity(&ensemble, &constraints).len(), 1);
}

#[test]
fn test_violation_details() {
	// Increasing constraint, but the left subtree can reach 2.0 while the right bottoms out at -1.0.
	let tree = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::branch(1, 3, 4, 1, 10.0, SplitDirection::Left, 0.0),
			NodeRecord::leaf(2, -1.0),
			NodeRecord::leaf(3, -2.0),
			NodeRecord::leaf(4, 2.0),
		],
		0,
		0,
	)
	.unwrap();
	let ensemble = Ensemble::new(vec![tree], 1, vec![0.0], None).unwrap();
	let constraints = btreemap! { 0 => Monotonicity::Increasing };
	let violations = check_monotonicity(&ensemble, &constraints);
	assert_eq!(violations.len(), 1);
	let violation = &violations[0];
	assert_eq!(violation.tree_index, 0);
	assert_eq!(violation.node_index, 0);
	assert_eq!(violation.feature_index, 0);
	assert_eq!(violation.lower_side_max, 2.0);
	assert_eq!(violation.higher_side_min, -1.0);
	// An unconstrained feature is never checked.
	let constraints = btreemap! { 1 => Monotonicity::Increasing };
	assert!(check_monotonicity(&ensemble, &constraints).is_empty());
}
