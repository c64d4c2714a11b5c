use crate::Ensemble;
use num_traits::ToPrimitive;
use thiserror::Error;

/// The decomposition of one raw prediction: a bias, one contribution per feature, and the reconstructed prediction they sum to.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureContributions {
	/// The portion of the prediction not attributed to any feature: the sum of the trees' root values plus the class's base score.
	pub bias: f64,
	/// The contribution of each feature, one entry per input column, in column order. Features not tested on any path contribute 0.
	pub contributions: Vec<FeatureContribution>,
	/// The reconstructed prediction: `bias` plus the sum of the contribution values. Ties out to the model's raw prediction.
	pub output: f64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureContribution {
	pub feature_name: String,
	pub value: f64,
}

impl FeatureContributions {
	/// Look up the contribution for a feature by name.
	pub fn contribution(&self, feature_name: &str) -> Option<f64> {
		self.contributions
			.iter()
			.find(|contribution| contribution.feature_name == feature_name)
			.map(|contribution| contribution.value)
	}
}

/// The decompositions for one row, one per class. Regression and binary classification ensembles have exactly one.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct RowContributions {
	pub classes: Vec<FeatureContributions>,
}

impl RowContributions {
	/// The decomposition for a single output ensemble.
	pub fn single(&self) -> &FeatureContributions {
		&self.classes[0]
	}
}

/// The bias and the contributions did not reconstruct the model's raw prediction within tolerance. This signals either a format incompatibility between the supplied trees and the model, or an internal bug; it is always surfaced, because a silent mismatch would defeat the purpose of an exact explanation.
#[derive(Debug, Error)]
#[error("row {row_index}, class {class_index}: bias + contributions = {reconstructed}, but the model predicts {predicted} (tolerance {tolerance})")]
pub struct ReconciliationError {
	pub row_index: usize,
	pub class_index: usize,
	pub reconstructed: f64,
	pub predicted: f64,
	pub tolerance: f64,
}

/// Assemble the final result for one row and one class, verifying that the bias and the contributions reconstruct the independently computed raw prediction. `n_terms` is the number of floating point terms that were summed to produce the reconstruction; the default tolerance scales with it and with the magnitude of the prediction.
#[allow(clippy::too_many_arguments)]
pub fn build_result(
	ensemble: &Ensemble,
	row_index: usize,
	class_index: usize,
	bias: f64,
	contributions: Vec<f64>,
	n_terms: usize,
	predicted: f64,
	tolerance: Option<f64>,
) -> Result<FeatureContributions, ReconciliationError> {
	let reconstructed = bias + contributions.iter().sum::<f64>();
	let tolerance = tolerance.unwrap_or_else(|| default_tolerance(n_terms, predicted));
	if (reconstructed - predicted).abs() > tolerance {
		return Err(ReconciliationError {
			row_index,
			class_index,
			reconstructed,
			predicted,
			tolerance,
		});
	}
	let contributions = contributions
		.into_iter()
		.enumerate()
		.map(|(feature_index, value)| FeatureContribution {
			feature_name: ensemble.feature_name(feature_index),
			value,
		})
		.collect();
	Ok(FeatureContributions {
		bias,
		contributions,
		output: reconstructed,
	})
}

fn default_tolerance(n_terms: usize, predicted: f64) -> f64 {
	std::f64::EPSILON * n_terms.to_f64().unwrap() * predicted.abs().max(1.0)
}

#[cfg(test)]
fn test_ensemble() -> Ensemble {
	use crate::{NodeRecord, Tree};
	let tree = Tree::from_records(vec![NodeRecord::leaf(0, 0.5)], 0, 0).unwrap();
	Ensemble::new(vec![tree], 1, vec![0.0], Some(vec!["x".to_owned()])).unwrap()
}

#[test]
fn test_reconciliation_error() {
	let ensemble = test_ensemble();
	let error = build_result(&ensemble, 3, 0, 0.0, vec![1.0], 2, 2.0, None).unwrap_err();
	assert_eq!(error.row_index, 3);
	assert_eq!(error.class_index, 0);
	assert_eq!(error.reconstructed, 1.0);
	assert_eq!(error.predicted, 2.0);
}

#[test]
fn test_build_result() {
	let ensemble = test_ensemble();
	let result = build_result(&ensemble, 0, 0, 0.0, vec![1.0], 2, 1.0, None).unwrap();
	assert_eq!(result.bias, 0.0);
	assert_eq!(result.contribution("x"), Some(1.0));
	assert_eq!(result.contribution("y"), None);
	assert_eq!(result.output, 1.0);
}

#[test]
fn test_serialize() {
	let ensemble = test_ensemble();
	let result = build_result(&ensemble, 0, 0, 0.0, vec![1.0], 2, 1.0, None).unwrap();
	insta::assert_snapshot!(
		serde_json::to_string(&result).unwrap(),
		@r###"{"bias":0.0,"contributions":[{"featureName":"x","value":1.0}],"output":1.0}"###
	);
}
