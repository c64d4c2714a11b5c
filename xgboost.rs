/*!
This module loads ensembles from the tree dumps XGBoost produces. Both the text format (`0:[f2<2.45] yes=1,no=2,missing=1,gain=116.05,cover=105`, with trees separated by `booster[i]:` headers) and the JSON format (an array with one nested object per tree) are supported.

XGBoost dumps store predicted values only at the leaves, so the value of each internal node is derived bottom up as the cover weighted mean of its children's values. This requires the dump to include statistics; a dump without cover is rejected.
*/

use crate::{records::MalformedTreeError, Ensemble, NodeRecord, SplitDirection, Tree};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// These options describe the model whose dump is being loaded. XGBoost dumps do not carry the base score, the number of classes, or feature names, so the caller supplies them.
#[derive(Debug)]
pub struct DumpOptions {
	/// The number of output classes: 1 for regression and binary objectives. Multiclass models dump one tree per class per round, in class order, and trees are assigned to classes accordingly.
	pub n_classes: usize,
	/// The base score for each class, in link space.
	pub base_scores: Vec<f64>,
	/// Names for the model's features. If `Some`, split names in the dump must resolve against them, either by name or by the `f{N}` shorthand. If `None`, `f{N}` names map to index `N` and any other names are assigned indexes in order of first appearance.
	pub feature_names: Option<Vec<String>>,
}

impl Default for DumpOptions {
	fn default() -> DumpOptions {
		DumpOptions {
			n_classes: 1,
			base_scores: vec![0.0],
			feature_names: None,
		}
	}
}

#[derive(Debug, Error)]
pub enum DumpError {
	#[error("line {line}: {message}")]
	Parse { line: usize, message: String },
	#[error("node {node_id}: {message}")]
	Node { node_id: usize, message: String },
	#[error("node id {node_id} appears more than once in one tree")]
	DuplicateNode { node_id: usize },
	#[error("node {node_id} references undefined node {child_id}")]
	UnknownNode { node_id: usize, child_id: usize },
	#[error("node {node_id}: missing direction {missing_id} is neither child")]
	MissingNotChild { node_id: usize, missing_id: usize },
	#[error("node {node_id} has no cover statistic; dump the model with statistics so internal node values can be derived")]
	MissingCover { node_id: usize },
	#[error("node {node_id}: children report zero total cover")]
	ZeroCover { node_id: usize },
	#[error("node {node_id} is its own ancestor")]
	CyclicDump { node_id: usize },
	#[error("feature {name:?} is not in the supplied feature names")]
	UnknownFeature { name: String },
	#[error("dump contains no trees")]
	EmptyDump,
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	MalformedTree(#[from] MalformedTreeError),
}

#[derive(Debug)]
struct RawNode {
	id: usize,
	kind: RawNodeKind,
	cover: Option<f64>,
}

#[derive(Debug)]
enum RawNodeKind {
	Branch {
		feature: String,
		threshold: f64,
		yes: usize,
		no: usize,
		missing: Option<usize>,
	},
	Leaf {
		value: f64,
	},
}

/// Parse XGBoost's text dump format into an ensemble. Trees are separated by `booster[i]:` headers; a dump without headers is read as a single tree.
pub fn ensemble_from_text_dump(dump: &str, options: &DumpOptions) -> Result<Ensemble, DumpError> {
	let mut raw_trees: Vec<Vec<RawNode>> = Vec::new();
	for (line_index, line) in dump.lines().enumerate() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if line.starts_with("booster[") {
			raw_trees.push(Vec::new());
			continue;
		}
		let node = parse_text_node(line).map_err(|message| DumpError::Parse {
			line: line_index + 1,
			message,
		})?;
		if raw_trees.is_empty() {
			raw_trees.push(Vec::new());
		}
		raw_trees.last_mut().unwrap().push(node);
	}
	resolve_ensemble(raw_trees, options)
}

/// Parse XGBoost's JSON dump format: a JSON array with one nested node object per tree.
pub fn ensemble_from_json_dump(dump: &str, options: &DumpOptions) -> Result<Ensemble, DumpError> {
	let json_trees: Vec<JsonNode> = serde_json::from_str(dump)?;
	let mut raw_trees = Vec::with_capacity(json_trees.len());
	for json_tree in json_trees {
		let mut raw_nodes = Vec::new();
		flatten_json_node(json_tree, &mut raw_nodes)?;
		raw_trees.push(raw_nodes);
	}
	resolve_ensemble(raw_trees, options)
}

fn parse_text_node(line: &str) -> Result<RawNode, String> {
	let (id, rest) = line
		.split_once(':')
		.ok_or_else(|| format!("expected `id:` at the start of {:?}", line))?;
	let id = id
		.trim()
		.parse::<usize>()
		.map_err(|_| format!("invalid node id {:?}", id))?;
	if let Some(rest) = rest.strip_prefix('[') {
		let close = rest
			.find(']')
			.ok_or_else(|| "unterminated split condition".to_owned())?;
		let condition = &rest[..close];
		let lt = condition
			.rfind('<')
			.ok_or_else(|| format!("unsupported split condition {:?}", condition))?;
		let feature = condition[..lt].to_owned();
		let threshold = condition[lt + 1..]
			.parse::<f64>()
			.map_err(|_| format!("invalid split threshold in {:?}", condition))?;
		let mut yes = None;
		let mut no = None;
		let mut missing = None;
		let mut cover = None;
		for pair in rest[close + 1..].split(',') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let (key, value) = pair
				.split_once('=')
				.ok_or_else(|| format!("malformed attribute {:?}", pair))?;
			match key {
				"yes" => yes = Some(parse_attribute::<usize>(key, value)?),
				"no" => no = Some(parse_attribute::<usize>(key, value)?),
				"missing" => missing = Some(parse_attribute::<usize>(key, value)?),
				"cover" => cover = Some(parse_attribute::<f64>(key, value)?),
				// gain and friends are not needed for decomposition
				_ => {}
			}
		}
		let yes = yes.ok_or_else(|| format!("node {} has no yes child", id))?;
		let no = no.ok_or_else(|| format!("node {} has no no child", id))?;
		Ok(RawNode {
			id,
			kind: RawNodeKind::Branch {
				feature,
				threshold,
				yes,
				no,
				missing,
			},
			cover,
		})
	} else {
		let mut leaf = None;
		let mut cover = None;
		for pair in rest.split(',') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let (key, value) = pair
				.split_once('=')
				.ok_or_else(|| format!("malformed attribute {:?}", pair))?;
			match key {
				"leaf" => leaf = Some(parse_attribute::<f64>(key, value)?),
				"cover" => cover = Some(parse_attribute::<f64>(key, value)?),
				_ => {}
			}
		}
		let value = leaf.ok_or_else(|| format!("node {} is neither split nor leaf", id))?;
		Ok(RawNode {
			id,
			kind: RawNodeKind::Leaf { value },
			cover,
		})
	}
}

fn parse_attribute<T>(key: &str, value: &str) -> Result<T, String>
where
	T: std::str::FromStr,
{
	value
		.parse::<T>()
		.map_err(|_| format!("invalid value {:?} for attribute {:?}", value, key))
}

#[derive(serde::Deserialize)]
struct JsonNode {
	nodeid: usize,
	#[serde(default)]
	split: Option<String>,
	#[serde(default)]
	split_condition: Option<f64>,
	#[serde(default)]
	yes: Option<usize>,
	#[serde(default)]
	no: Option<usize>,
	#[serde(default)]
	missing: Option<usize>,
	#[serde(default)]
	leaf: Option<f64>,
	#[serde(default)]
	cover: Option<f64>,
	#[serde(default)]
	children: Vec<JsonNode>,
}

fn flatten_json_node(node: JsonNode, raw_nodes: &mut Vec<RawNode>) -> Result<(), DumpError> {
	let kind = match (&node.split, node.split_condition, node.yes, node.no, node.leaf) {
		(Some(feature), Some(threshold), Some(yes), Some(no), None) => RawNodeKind::Branch {
			feature: feature.clone(),
			threshold,
			yes,
			no,
			missing: node.missing,
		},
		(None, None, None, None, Some(value)) => RawNodeKind::Leaf { value },
		_ => {
			return Err(DumpError::Node {
				node_id: node.nodeid,
				message: "mixes leaf and split fields".to_owned(),
			})
		}
	};
	raw_nodes.push(RawNode {
		id: node.nodeid,
		kind,
		cover: node.cover,
	});
	for child in node.children {
		flatten_json_node(child, raw_nodes)?;
	}
	Ok(())
}

fn resolve_ensemble(
	raw_trees: Vec<Vec<RawNode>>,
	options: &DumpOptions,
) -> Result<Ensemble, DumpError> {
	if raw_trees.is_empty() {
		return Err(DumpError::EmptyDump);
	}
	let mut feature_indexes = FeatureIndexes::new(options.feature_names.clone());
	let mut trees = Vec::with_capacity(raw_trees.len());
	for (tree_index, raw_nodes) in raw_trees.into_iter().enumerate() {
		let class_index = if options.n_classes > 1 {
			tree_index % options.n_classes
		} else {
			0
		};
		trees.push(resolve_tree(
			raw_nodes,
			tree_index,
			class_index,
			&mut feature_indexes,
		)?);
	}
	let feature_names = feature_indexes.into_names();
	Ok(Ensemble::new(
		trees,
		options.n_classes,
		options.base_scores.clone(),
		feature_names,
	)?)
}

fn resolve_tree(
	raw_nodes: Vec<RawNode>,
	tree_index: usize,
	class_index: usize,
	feature_indexes: &mut FeatureIndexes,
) -> Result<Tree, DumpError> {
	// Node ids in a dump are not necessarily contiguous, so map them to dense indexes in id order. XGBoost's root always has the smallest id, which lands it at index 0.
	let mut ids: Vec<usize> = raw_nodes.iter().map(|node| node.id).collect();
	ids.sort_unstable();
	for pair in ids.windows(2) {
		if pair[0] == pair[1] {
			return Err(DumpError::DuplicateNode { node_id: pair[0] });
		}
	}
	let index_by_id: BTreeMap<usize, usize> = ids
		.iter()
		.enumerate()
		.map(|(index, &id)| (id, index))
		.collect();
	let nodes_by_id: BTreeMap<usize, &RawNode> =
		raw_nodes.iter().map(|node| (node.id, node)).collect();
	let mut values = BTreeMap::new();
	let mut visiting = BTreeSet::new();
	for &id in &ids {
		derive_value(id, &nodes_by_id, &mut values, &mut visiting)?;
	}
	let mut records = Vec::with_capacity(raw_nodes.len());
	for &id in &ids {
		let node = nodes_by_id[&id];
		let index = index_by_id[&id];
		match &node.kind {
			RawNodeKind::Leaf { value } => records.push(NodeRecord::leaf(index, *value)),
			RawNodeKind::Branch {
				feature,
				threshold,
				yes,
				no,
				missing,
			} => {
				let left_child = *index_by_id.get(yes).ok_or(DumpError::UnknownNode {
					node_id: id,
					child_id: *yes,
				})?;
				let right_child = *index_by_id.get(no).ok_or(DumpError::UnknownNode {
					node_id: id,
					child_id: *no,
				})?;
				// The yes child is the one taken when `feature < threshold`, which is this crate's left.
				let missing_direction = match missing {
					Some(missing) if missing == yes => SplitDirection::Left,
					Some(missing) if missing == no => SplitDirection::Right,
					Some(missing) => {
						return Err(DumpError::MissingNotChild {
							node_id: id,
							missing_id: *missing,
						})
					}
					None => SplitDirection::Left,
				};
				let feature_index = feature_indexes.resolve(feature)?;
				records.push(NodeRecord::branch(
					index,
					left_child,
					right_child,
					feature_index,
					*threshold,
					missing_direction,
					values[&id],
				));
			}
		}
	}
	Ok(Tree::from_records(records, tree_index, class_index)?)
}

/// Derive the predicted value of a node: a leaf's stored value, or the cover weighted mean of a branch's children's values.
fn derive_value(
	node_id: usize,
	nodes_by_id: &BTreeMap<usize, &RawNode>,
	values: &mut BTreeMap<usize, f64>,
	visiting: &mut BTreeSet<usize>,
) -> Result<f64, DumpError> {
	if let Some(&value) = values.get(&node_id) {
		return Ok(value);
	}
	if !visiting.insert(node_id) {
		return Err(DumpError::CyclicDump { node_id });
	}
	let node = nodes_by_id[&node_id];
	let value = match &node.kind {
		RawNodeKind::Leaf { value } => *value,
		RawNodeKind::Branch { yes, no, .. } => {
			let yes_node = nodes_by_id.get(yes).ok_or(DumpError::UnknownNode {
				node_id,
				child_id: *yes,
			})?;
			let no_node = nodes_by_id.get(no).ok_or(DumpError::UnknownNode {
				node_id,
				child_id: *no,
			})?;
			let yes_cover = yes_node
				.cover
				.ok_or(DumpError::MissingCover { node_id: *yes })?;
			let no_cover = no_node
				.cover
				.ok_or(DumpError::MissingCover { node_id: *no })?;
			let total_cover = yes_cover + no_cover;
			if total_cover <= 0.0 {
				return Err(DumpError::ZeroCover { node_id });
			}
			let yes_value = derive_value(*yes, nodes_by_id, values, visiting)?;
			let no_value = derive_value(*no, nodes_by_id, values, visiting)?;
			(yes_cover * yes_value + no_cover * no_value) / total_cover
		}
	};
	visiting.remove(&node_id);
	values.insert(node_id, value);
	Ok(value)
}

struct FeatureIndexes {
	supplied: bool,
	by_name: BTreeMap<String, usize>,
	names: Vec<String>,
}

impl FeatureIndexes {
	fn new(feature_names: Option<Vec<String>>) -> FeatureIndexes {
		match feature_names {
			Some(names) => {
				let by_name = names
					.iter()
					.enumerate()
					.map(|(index, name)| (name.clone(), index))
					.collect();
				FeatureIndexes {
					supplied: true,
					by_name,
					names,
				}
			}
			None => FeatureIndexes {
				supplied: false,
				by_name: BTreeMap::new(),
				names: Vec::new(),
			},
		}
	}

	fn resolve(&mut self, name: &str) -> Result<usize, DumpError> {
		if let Some(&index) = self.by_name.get(name) {
			return Ok(index);
		}
		let index = match parse_feature_shorthand(name) {
			Some(index) if !self.supplied || index < self.names.len() => index,
			_ if self.supplied => {
				return Err(DumpError::UnknownFeature {
					name: name.to_owned(),
				})
			}
			_ => self.names.len(),
		};
		if !self.supplied {
			while self.names.len() <= index {
				self.names.push(String::new());
			}
			self.names[index] = name.to_owned();
		}
		self.by_name.insert(name.to_owned(), index);
		Ok(index)
	}

	fn into_names(self) -> Option<Vec<String>> {
		if self.names.is_empty() {
			return None;
		}
		let names = self
			.names
			.into_iter()
			.enumerate()
			.map(|(index, name)| {
				if name.is_empty() {
					format!("f{}", index)
				} else {
					name
				}
			})
			.collect();
		Some(names)
	}
}

/// `f{N}` resolves to feature index `N`, the shorthand XGBoost uses when no feature map is supplied.
fn parse_feature_shorthand(name: &str) -> Option<usize> {
	let digits = name.strip_prefix('f')?;
	if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
		return None;
	}
	digits.parse().ok()
}

#[cfg(test)]
use crate::{explain, ExplainOptions};
#[cfg(test)]
use ndarray::prelude::*;

#[cfg(test)]
const TEXT_DUMP: &str = "booster[0]:
0:[f0<0.5] yes=1,no=2,missing=1,gain=10,cover=10
	1:leaf=-1,cover=4
	2:leaf=1,cover=6
";

#[test]
fn test_text_dump() {
	let ensemble = ensemble_from_text_dump(TEXT_DUMP, &DumpOptions::default()).unwrap();
	assert_eq!(ensemble.trees.len(), 1);
	assert_eq!(ensemble.trees[0].nodes.len(), 3);
	// The root's value is the cover weighted mean of its leaves.
	let root_value = (4.0 * -1.0 + 6.0 * 1.0) / 10.0;
	assert_eq!(ensemble.trees[0].root().value(), root_value);
	assert_eq!(ensemble.predict_row(&[0.7])[0], 1.0);
	assert_eq!(ensemble.predict_row(&[0.3])[0], -1.0);
	// A missing value follows missing=1, the left child.
	assert_eq!(ensemble.predict_row(&[std::f64::NAN])[0], -1.0);
	let features = arr2(&[[0.7]]);
	let results = explain(&ensemble, features.view(), &ExplainOptions::default()).unwrap();
	let result = results[0].single();
	assert_eq!(result.bias, root_value);
	assert_eq!(result.contribution("f0"), Some(1.0 - root_value));
	assert!((result.output - 1.0).abs() < 1e-12);
}

#[test]
fn test_text_dump_without_stats() {
	let dump = "0:[f0<0.5] yes=1,no=2,missing=1\n1:leaf=-1\n2:leaf=1\n";
	let result = ensemble_from_text_dump(dump, &DumpOptions::default());
	assert!(matches!(
		result,
		Err(DumpError::MissingCover { node_id: 1 })
	));
}

#[test]
fn test_json_dump() {
	let dump = r#"[
		{
			"nodeid": 0, "split": "f0", "split_condition": 0.5, "yes": 1, "no": 2, "missing": 1, "cover": 10.0,
			"children": [
				{ "nodeid": 1, "leaf": -1.0, "cover": 4.0 },
				{ "nodeid": 2, "leaf": 1.0, "cover": 6.0 }
			]
		}
	]"#;
	let from_json = ensemble_from_json_dump(dump, &DumpOptions::default()).unwrap();
	let from_text = ensemble_from_text_dump(TEXT_DUMP, &DumpOptions::default()).unwrap();
	assert_eq!(
		from_json.trees[0].root().value(),
		from_text.trees[0].root().value()
	);
	assert_eq!(
		from_json.predict_row(&[0.7]),
		from_text.predict_row(&[0.7])
	);
}

#[test]
fn test_multiclass_dump() {
	// Multiclass models dump one tree per class per round, interleaved.
	let dump = "booster[0]:
0:leaf=0.5
booster[1]:
0:leaf=0.25
booster[2]:
0:leaf=0.125
booster[3]:
0:leaf=0.0625
";
	let options = DumpOptions {
		n_classes: 2,
		base_scores: vec![0.0, 0.0],
		feature_names: None,
	};
	let ensemble = ensemble_from_text_dump(dump, &options).unwrap();
	let class_indexes: Vec<usize> = ensemble.trees.iter().map(|tree| tree.class_index).collect();
	assert_eq!(class_indexes, vec![0, 1, 0, 1]);
	assert_eq!(ensemble.predict_row(&[]), vec![0.625, 0.3125]);
}

#[test]
fn test_feature_names() {
	let dump = "0:[age<30] yes=1,no=2,missing=1,cover=10\n1:leaf=-1,cover=4\n2:leaf=1,cover=6\n";
	// Names discovered from the dump.
	let ensemble = ensemble_from_text_dump(dump, &DumpOptions::default()).unwrap();
	assert_eq!(ensemble.feature_name(0), "age");
	// Names resolved against a supplied table.
	let options = DumpOptions {
		feature_names: Some(vec!["age".to_owned()]),
		..DumpOptions::default()
	};
	let ensemble = ensemble_from_text_dump(dump, &options).unwrap();
	assert_eq!(ensemble.feature_name(0), "age");
	// A name outside the supplied table is an error.
	let options = DumpOptions {
		feature_names: Some(vec!["height".to_owned()]),
		..DumpOptions::default()
	};
	let result = ensemble_from_text_dump(dump, &options);
	assert!(matches!(result, Err(DumpError::UnknownFeature { .. })));
}
