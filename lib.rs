/*!
This crate explains the predictions of gradient boosted decision tree ensembles. It takes the trees of a trained model and decomposes the raw prediction for each input row into a bias term plus one contribution per feature, by tracing the row's decision path through every tree and attributing the change in predicted value at each split to the feature the split tested. The bias and the contributions always sum back to the model's raw prediction, and the engine verifies this tie-out for every row it explains.

Models trained by [XGBoost](github.com/dmlc/xgboost) can be loaded from their tree dumps with the `xgboost` module. Decomposition is defined on the raw, link space prediction: no sigmoid or softmax is applied, because a non linear transform of a sum would break the additivity of the breakdown.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod decompose;
pub mod monotonic;
mod progress;
mod records;
mod result;
mod trace;
pub mod xgboost;

pub use decompose::{
	accumulate, explain, explain_mean, explain_with_progress, EmptyEnsembleError, ExplainError,
	ExplainOptions, TreeContributions,
};
pub use progress::{ExplainProgress, ProgressCounter};
pub use records::{MalformedTreeError, NodeRecord};
pub use result::{
	build_result, FeatureContribution, FeatureContributions, ReconciliationError, RowContributions,
};
pub use trace::{trace, CycleDetectedError, DecisionPath, PathStep};

use itertools::izip;
use ndarray::prelude::*;

/// An `Ensemble` is the full set of trees of a trained model, plus the global base score for each class. It is built once, from parsed node records or from a dump via the `xgboost` module, and never mutated during decomposition.
#[derive(Debug)]
pub struct Ensemble {
	/// The trees of the model, in training order.
	pub trees: Vec<Tree>,
	/// The number of output classes. This is 1 for regression and binary classification, and the number of classes otherwise.
	pub n_classes: usize,
	/// The base score for each class, in link space. Its length always equals `n_classes`.
	pub base_scores: Vec<f64>,
	/// Optional names for the input features, used to key the output. Features without a name are keyed `f{index}`.
	pub feature_names: Option<Vec<String>>,
}

impl Ensemble {
	/// The name used to key the output for a feature.
	pub fn feature_name(&self, feature_index: usize) -> String {
		self.feature_names
			.as_ref()
			.and_then(|names| names.get(feature_index))
			.cloned()
			.unwrap_or_else(|| format!("f{}", feature_index))
	}

	/// One more than the largest feature index tested by any branch in any tree.
	pub fn n_features(&self) -> usize {
		let mut n_features = 0;
		for tree in &self.trees {
			for node in &tree.nodes {
				if let Node::Branch(branch) = node {
					n_features = n_features.max(branch.feature_index + 1);
				}
			}
		}
		n_features
	}

	/// Make a raw prediction for a single row, one score per class. The scores are in link space: no output transform is applied.
	pub fn predict_row(&self, row: &[f64]) -> Vec<f64> {
		let mut scores = self.base_scores.clone();
		for tree in &self.trees {
			scores[tree.class_index] += tree.predict(row);
		}
		scores
	}

	/// Make raw predictions for a batch of rows. Returns an array of shape (n_rows, n_classes).
	pub fn predict(&self, features: ArrayView2<f64>) -> Array2<f64> {
		let mut predictions = Array2::zeros((features.nrows(), self.n_classes));
		let mut row = vec![0.0; features.ncols()];
		for (features, mut predictions) in izip!(
			features.axis_iter(Axis(0)),
			predictions.axis_iter_mut(Axis(0)),
		) {
			for (value, feature) in row.iter_mut().zip(features) {
				*value = *feature;
			}
			let scores = self.predict_row(&row);
			for (prediction, score) in predictions.iter_mut().zip(scores) {
				*prediction = score;
			}
		}
		predictions
	}
}

/// Trees are stored as a `Vec` of `Node`s rooted at index 0. Each branch has two indexes into the `Vec`, one for each of its children.
#[derive(Debug)]
pub struct Tree {
	pub nodes: Vec<Node>,
	/// The tree's index within the ensemble.
	pub tree_index: usize,
	/// The class whose score this tree contributes to. Multiclass models train one tree per class per round; this field makes the association explicit instead of relying on tree ordering. It is always 0 for single output ensembles.
	pub class_index: usize,
}

impl Tree {
	/// The root is always the node at index 0.
	pub fn root(&self) -> &Node {
		&self.nodes[0]
	}

	pub fn node(&self, node_index: usize) -> &Node {
		&self.nodes[node_index]
	}

	/// Make a raw prediction for a single row by routing it from the root to a leaf.
	pub fn predict(&self, row: &[f64]) -> f64 {
		let mut node_index = 0;
		loop {
			match &self.nodes[node_index] {
				Node::Branch(branch) => {
					node_index = branch.route(row[branch.feature_index]);
				}
				Node::Leaf(leaf) => return leaf.value,
			}
		}
	}
}

/// A node is either a branch or a leaf.
#[derive(Debug)]
pub enum Node {
	Branch(BranchNode),
	Leaf(LeafNode),
}

impl Node {
	pub fn is_leaf(&self) -> bool {
		match self {
			Node::Branch(_) => false,
			Node::Leaf(_) => true,
		}
	}

	/// The value the model would output if traversal stopped at this node. For a leaf this is the stored leaf value; for a branch it is the weighted average prediction of its subtree.
	pub fn value(&self) -> f64 {
		match self {
			Node::Branch(branch) => branch.value,
			Node::Leaf(leaf) => leaf.value,
		}
	}
}

/// A `BranchNode` sends each row to one of its two children based on the value of a single feature.
#[derive(Debug)]
pub struct BranchNode {
	/// This is the index in the tree's node vector for this node's left child.
	pub left_child_index: usize,
	/// This is the index in the tree's node vector for this node's right child.
	pub right_child_index: usize,
	/// This is the index of the feature whose value the split tests.
	pub feature_index: usize,
	/// This is the threshold value of the split.
	pub split_value: f64,
	/// This is the direction rows with a missing value for the feature are sent.
	pub missing_direction: SplitDirection,
	/// The weighted average prediction of this node's subtree.
	pub value: f64,
}

impl BranchNode {
	/// Route a feature value to a child, replicating the training library's semantics exactly: a missing value (`NaN`) follows `missing_direction`, any other value goes left iff it is strictly less than `split_value`. Any deviation here silently misattributes contributions, so this comparison must match the library that trained the trees.
	pub fn route(&self, feature_value: f64) -> usize {
		if feature_value.is_nan() {
			match self.missing_direction {
				SplitDirection::Left => self.left_child_index,
				SplitDirection::Right => self.right_child_index,
			}
		} else if feature_value < self.split_value {
			self.left_child_index
		} else {
			self.right_child_index
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SplitDirection {
	Left,
	Right,
}

/// The leaves in a tree hold the partial predictions to output for rows that get sent to them.
#[derive(Debug)]
pub struct LeafNode {
	/// This is the value to output.
	pub value: f64,
}
