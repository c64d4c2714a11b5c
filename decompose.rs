use crate::{
	progress::{ExplainProgress, ProgressCounter},
	records::MalformedTreeError,
	result::{
		build_result, FeatureContribution, FeatureContributions, ReconciliationError,
		RowContributions,
	},
	trace::{trace, CycleDetectedError, DecisionPath},
	Ensemble, Node, Tree,
};
use itertools::{izip, Itertools};
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use thiserror::Error;

/// These are the options passed to `explain` and `explain_mean`.
#[derive(Debug, Default)]
pub struct ExplainOptions {
	/// This option overrides the tolerance used by the reconciliation check. If it is `None`, the tolerance is the double precision epsilon scaled by the number of accumulated terms and by the magnitude of the prediction.
	pub tolerance: Option<f64>,
}

/// The ensemble has no trees. A bias only result would be well defined, but a treeless ensemble almost always signals a caller error, so it is surfaced instead of silently returned.
#[derive(Debug, Error)]
#[error("ensemble has no trees")]
pub struct EmptyEnsembleError;

#[derive(Debug, Error)]
pub enum ExplainError {
	#[error(transparent)]
	MalformedTree(#[from] MalformedTreeError),
	#[error(transparent)]
	CycleDetected(#[from] CycleDetectedError),
	#[error(transparent)]
	EmptyEnsemble(#[from] EmptyEnsembleError),
	#[error(transparent)]
	Reconciliation(#[from] ReconciliationError),
}

/// The decomposition of a single tree's prediction for a single row: the predicted value at the root, plus one summed delta per feature.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeContributions {
	/// The predicted value at the root of the tree.
	pub bias: f64,
	/// The contribution of each feature, indexed by feature index. Features not tested on the path contribute 0.
	pub contributions: Vec<f64>,
}

/// Decompose one traced path into per feature contributions. Each edge's change in predicted value, `value(child) - value(parent)`, is attributed to the feature tested at the edge's parent, the split that caused the movement. A feature tested at several depths accumulates every delta into one entry. The deltas telescope: `bias + sum(contributions)` equals the value of the reached leaf exactly.
pub fn accumulate(tree: &Tree, path: &DecisionPath, n_features: usize) -> TreeContributions {
	let mut contributions = vec![0.0; n_features];
	let bias = tree.node(path.steps[0].node_index).value();
	for (parent, child) in path.steps.iter().tuple_windows() {
		let delta = tree.node(child.node_index).value() - tree.node(parent.node_index).value();
		contributions[parent.feature_index.unwrap()] += delta;
	}
	TreeContributions {
		bias,
		contributions,
	}
}

/// Decompose the ensemble's raw prediction for every row into a bias plus one contribution per feature. Returns one result per row, each holding one decomposition per class. Rows are decomposed in parallel; results are collected in row order, so output is reproducible across runs.
pub fn explain(
	ensemble: &Ensemble,
	features: ArrayView2<f64>,
	options: &ExplainOptions,
) -> Result<Vec<RowContributions>, ExplainError> {
	explain_with_progress(ensemble, features, options, &mut |_| {})
}

/// Like `explain`, but reports a `ProgressCounter` through the callback before the batch starts. The counter is incremented once per decomposed row and can be read from another thread.
pub fn explain_with_progress(
	ensemble: &Ensemble,
	features: ArrayView2<f64>,
	options: &ExplainOptions,
	update_progress: &mut dyn FnMut(ExplainProgress),
) -> Result<Vec<RowContributions>, ExplainError> {
	if ensemble.trees.is_empty() {
		return Err(EmptyEnsembleError.into());
	}
	let n_features = features.ncols();
	check_feature_indexes(ensemble, n_features)?;
	let progress_counter = ProgressCounter::new(features.nrows().to_u64().unwrap());
	update_progress(ExplainProgress::ExplainingRows(progress_counter.clone()));
	let results: Vec<Result<RowContributions, ExplainError>> = (0..features.nrows())
		.into_par_iter()
		.map(|row_index| {
			let result = explain_row(ensemble, features.row(row_index), row_index, options);
			progress_counter.inc(1);
			result
		})
		.collect();
	let mut rows = Vec::with_capacity(results.len());
	for result in results {
		rows.push(result?);
	}
	Ok(rows)
}

/// Decompose every row, then reduce to the feature wise mean per class, for a global importance summary. Shares all logic with `explain` up to the final reduction, which runs in row order so results are reproducible.
pub fn explain_mean(
	ensemble: &Ensemble,
	features: ArrayView2<f64>,
	options: &ExplainOptions,
) -> Result<Vec<FeatureContributions>, ExplainError> {
	let rows = explain(ensemble, features, options)?;
	let n_features = features.ncols();
	if rows.is_empty() {
		// With no rows there is nothing to average. The bias does not depend on the row, so the summary is the bias alone.
		let classes = (0..ensemble.n_classes)
			.map(|class_index| {
				let mut bias = ensemble.base_scores[class_index];
				for tree in &ensemble.trees {
					if tree.class_index == class_index {
						bias += tree.root().value();
					}
				}
				FeatureContributions {
					bias,
					contributions: named_contributions(ensemble, vec![0.0; n_features]),
					output: bias,
				}
			})
			.collect();
		return Ok(classes);
	}
	let n_rows = rows.len().to_f64().unwrap();
	let classes = (0..ensemble.n_classes)
		.map(|class_index| {
			let mut bias = 0.0;
			let mut output = 0.0;
			let mut values = vec![0.0; n_features];
			for row in &rows {
				let contributions = &row.classes[class_index];
				bias += contributions.bias;
				output += contributions.output;
				for (total, contribution) in values.iter_mut().zip(&contributions.contributions) {
					*total += contribution.value;
				}
			}
			for value in values.iter_mut() {
				*value /= n_rows;
			}
			FeatureContributions {
				bias: bias / n_rows,
				contributions: named_contributions(ensemble, values),
				output: output / n_rows,
			}
		})
		.collect();
	Ok(classes)
}

fn explain_row(
	ensemble: &Ensemble,
	features: ArrayView1<f64>,
	row_index: usize,
	options: &ExplainOptions,
) -> Result<RowContributions, ExplainError> {
	let n_features = features.len();
	let mut row = vec![0.0; n_features];
	for (value, feature) in row.iter_mut().zip(features) {
		*value = *feature;
	}
	let mut biases = ensemble.base_scores.clone();
	let mut contributions = vec![vec![0.0; n_features]; ensemble.n_classes];
	// One term for the base score, then one for each tree's bias and each edge's delta. The default reconciliation tolerance scales with this count.
	let mut n_terms = vec![1; ensemble.n_classes];
	for tree in &ensemble.trees {
		let path = trace(tree, &row)?;
		let tree_contributions = accumulate(tree, &path, n_features);
		biases[tree.class_index] += tree_contributions.bias;
		for (total, delta) in contributions[tree.class_index]
			.iter_mut()
			.zip(tree_contributions.contributions)
		{
			*total += delta;
		}
		n_terms[tree.class_index] += path.steps.len();
	}
	let predictions = ensemble.predict_row(&row);
	let classes = izip!(biases, contributions, n_terms, predictions)
		.enumerate()
		.map(|(class_index, (bias, contributions, n_terms, predicted))| {
			build_result(
				ensemble,
				row_index,
				class_index,
				bias,
				contributions,
				n_terms,
				predicted,
				options.tolerance,
			)
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(RowContributions { classes })
}

fn named_contributions(ensemble: &Ensemble, values: Vec<f64>) -> Vec<FeatureContribution> {
	values
		.into_iter()
		.enumerate()
		.map(|(feature_index, value)| FeatureContribution {
			feature_name: ensemble.feature_name(feature_index),
			value,
		})
		.collect()
}

fn check_feature_indexes(
	ensemble: &Ensemble,
	n_features: usize,
) -> Result<(), MalformedTreeError> {
	for tree in &ensemble.trees {
		for (node_index, node) in tree.nodes.iter().enumerate() {
			if let Node::Branch(branch) = node {
				if branch.feature_index >= n_features {
					return Err(MalformedTreeError::FeatureIndexOutOfRange {
						tree_index: tree.tree_index,
						node_index,
						feature_index: branch.feature_index,
						n_features,
					});
				}
			}
		}
	}
	Ok(())
}

#[cfg(test)]
use crate::{NodeRecord, SplitDirection};

#[cfg(test)]
fn stump(tree_index: usize, class_index: usize, left: f64, right: f64) -> Tree {
	Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, left),
			NodeRecord::leaf(2, right),
		],
		tree_index,
		class_index,
	)
	.unwrap()
}

#[test]
fn test_single_tree() {
	// The root splits on x at 0.5, the left leaf is -1, the right leaf is 1, and the root's predicted value is 0. A row with x = 0.7 goes right.
	let ensemble = Ensemble::new(
		vec![stump(0, 0, -1.0, 1.0)],
		1,
		vec![0.0],
		Some(vec!["x".to_owned()]),
	)
	.unwrap();
	let features = arr2(&[[0.7]]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(results.len(), 1);
	let result = results[0].single();
	assert_eq!(result.bias, 0.0);
	assert_eq!(result.contribution("x"), Some(1.0));
	assert_eq!(result.output, 1.0);
}

#[test]
fn test_multi_tree_aggregation() {
	// Two single split trees on the same feature, with a base score of 0.1. Contributions for the feature sum across both trees; the bias sums both roots' predicted values plus the base score.
	let ensemble = Ensemble::new(
		vec![stump(0, 0, -1.0, 1.0), stump(1, 0, -0.5, 0.5)],
		1,
		vec![0.1],
		None,
	)
	.unwrap();
	let features = arr2(&[[0.7]]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let result = results[0].single();
	assert_eq!(result.bias, 0.1);
	assert_eq!(result.contribution("f0"), Some(1.5));
	assert_eq!(result.output, 0.1 + 1.5);
	assert!((result.output - ensemble.predict_row(&[0.7])[0]).abs() < 1e-12);
}

#[test]
fn test_repeated_feature_on_path() {
	// Feature 0 is tested at two depths. Both deltas accumulate into one summed contribution, not two separate entries.
	let tree = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Left, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::branch(2, 3, 4, 0, 0.8, SplitDirection::Left, 1.0),
			NodeRecord::leaf(3, 0.75),
			NodeRecord::leaf(4, 1.25),
		],
		0,
		0,
	)
	.unwrap();
	let ensemble = Ensemble::new(vec![tree], 1, vec![0.0], None).unwrap();
	let features = arr2(&[[0.7]]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let result = results[0].single();
	// Root to node 2 contributes 1.0, node 2 to leaf 3 contributes -0.25, both on feature 0.
	assert_eq!(result.contributions.len(), 1);
	assert_eq!(result.contribution("f0"), Some(0.75));
	assert_eq!(result.bias, 0.0);
	assert_eq!(result.output, 0.75);
}

#[test]
fn test_multiclass() {
	// Each tree's output must be routed to its own class's accumulator rather than mixed.
	let ensemble = Ensemble::new(
		vec![
			stump(0, 0, -1.0, 1.0),
			stump(1, 1, -2.0, 2.0),
			stump(2, 0, -0.25, 0.25),
			stump(3, 1, -0.5, 0.5),
		],
		2,
		vec![0.1, 0.2],
		None,
	)
	.unwrap();
	let features = arr2(&[[0.7]]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(results[0].classes.len(), 2);
	let class_zero = &results[0].classes[0];
	assert_eq!(class_zero.bias, 0.1);
	assert_eq!(class_zero.contribution("f0"), Some(1.25));
	let class_one = &results[0].classes[1];
	assert_eq!(class_one.bias, 0.2);
	assert_eq!(class_one.contribution("f0"), Some(2.5));
	let predictions = ensemble.predict_row(&[0.7]);
	assert!((class_zero.output - predictions[0]).abs() < 1e-12);
	assert!((class_one.output - predictions[1]).abs() < 1e-12);
}

#[test]
fn test_missing_direction_changes_contribution() {
	// With the row held fixed, flipping only the missing direction sends the row to the other leaf and flips the feature's contribution.
	let row = arr2(&[[std::f64::NAN]]);
	let left = Ensemble::new(vec![stump(0, 0, -1.0, 1.0)], 1, vec![0.0], None).unwrap();
	let results = explain(&left, row.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(results[0].single().contribution("f0"), Some(-1.0));
	let tree = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 0, 0.5, SplitDirection::Right, 0.0),
			NodeRecord::leaf(1, -1.0),
			NodeRecord::leaf(2, 1.0),
		],
		0,
		0,
	)
	.unwrap();
	let right = Ensemble::new(vec![tree], 1, vec![0.0], None).unwrap();
	let results = explain(&right, row.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(results[0].single().contribution("f0"), Some(1.0));
}

#[test]
fn test_empty_ensemble() {
	let ensemble = Ensemble::new(Vec::new(), 1, vec![0.0], None).unwrap();
	let features = arr2(&[[0.7]]);
	let result = explain(&ensemble, features.view(), &ExplainOptions::default());
	assert!(matches!(result, Err(ExplainError::EmptyEnsemble(_))));
}

#[test]
fn test_determinism() {
	let ensemble = Ensemble::new(
		vec![stump(0, 0, -1.0, 1.0), stump(1, 0, -0.5, 0.5)],
		1,
		vec![0.3],
		None,
	)
	.unwrap();
	let features = arr2(&[[0.7], [0.2], [std::f64::NAN]]);
	let first = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let second = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(first, second);
	for (a, b) in first.iter().zip(&second) {
		assert_eq!(
			a.single().output.to_bits(),
			b.single().output.to_bits()
		);
	}
}

#[test]
fn test_additivity() {
	// For every row and class, bias + sum(contributions) must equal the ensemble's raw prediction.
	let deep = Tree::from_records(
		vec![
			NodeRecord::branch(0, 1, 2, 1, 3.0, SplitDirection::Right, 0.1),
			NodeRecord::branch(1, 3, 4, 0, 0.5, SplitDirection::Left, -0.2),
			NodeRecord::leaf(2, 0.4),
			NodeRecord::leaf(3, -0.7),
			NodeRecord::leaf(4, 0.3),
		],
		2,
		0,
	)
	.unwrap();
	let ensemble = Ensemble::new(
		vec![stump(0, 0, -1.0, 1.0), stump(1, 0, -0.5, 0.5), deep],
		1,
		vec![0.5],
		None,
	)
	.unwrap();
	let features = arr2(&[
		[0.7, 1.0],
		[0.2, 5.0],
		[std::f64::NAN, 2.0],
		[0.9, std::f64::NAN],
	]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let predictions = ensemble.predict(features.view());
	for (row_index, result) in results.iter().enumerate() {
		let result = result.single();
		let reconstructed = result.bias
			+ result
				.contributions
				.iter()
				.map(|contribution| contribution.value)
				.sum::<f64>();
		assert_eq!(result.output, reconstructed);
		assert!((result.output - predictions[[row_index, 0]]).abs() < 1e-12);
	}
}

#[test]
fn test_mean_mode() {
	// The mean contribution over a batch equals the elementwise mean of the per row contributions.
	let ensemble = Ensemble::new(
		vec![stump(0, 0, -1.0, 1.0), stump(1, 0, -0.5, 0.5)],
		1,
		vec![0.1],
		None,
	)
	.unwrap();
	let features = arr2(&[[0.7], [0.2]]);
	let rows = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let means = explain_mean(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	assert_eq!(means.len(), 1);
	let mean = &means[0];
	let expected =
		(rows[0].single().contribution("f0").unwrap() + rows[1].single().contribution("f0").unwrap()) / 2.0;
	assert_eq!(mean.contribution("f0"), Some(expected));
	assert_eq!(mean.bias, (rows[0].single().bias + rows[1].single().bias) / 2.0);
	assert_eq!(
		mean.output,
		(rows[0].single().output + rows[1].single().output) / 2.0
	);
}

#[test]
fn test_accumulate_telescopes() {
	let tree = stump(0, 0, -1.0, 1.0);
	let path = trace(&tree, &[0.7]).unwrap();
	let contributions = accumulate(&tree, &path, 1);
	assert_eq!(contributions.bias, 0.0);
	assert_eq!(contributions.contributions, vec![1.0]);
	assert_eq!(
		contributions.bias + contributions.contributions.iter().sum::<f64>(),
		tree.node(path.leaf_index()).value()
	);
}

#[test]
fn test_progress() {
	let ensemble = Ensemble::new(vec![stump(0, 0, -1.0, 1.0)], 1, vec![0.0], None).unwrap();
	let features = arr2(&[[0.7], [0.2], [0.4]]);
	let mut counter = None;
	explain_with_progress(
		&ensemble,
		features.view(),
		&ExplainOptions::default(),
		&mut |progress| {
			let ExplainProgress::ExplainingRows(progress_counter) = progress;
			counter = Some(progress_counter);
		},
	)
	.unwrap();
	let counter = counter.unwrap();
	assert_eq!(counter.total(), 3);
	assert_eq!(counter.get(), 3);
}
