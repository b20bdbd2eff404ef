//! Output binding: from expected-output declarations to captured content.
//!
//! Three binding modes exist per expected output: `fillFrom` (paths read
//! from a previously resolved input under the same linear key), `glob`
//! (recursive match under the outputs directory), and the engine's explicit
//! per-output mapping (only for engines that produce one). When no outputs
//! are declared at all, they are discovered instead and named
//! `unnamed_output_{n}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde_yaml::Value;
use tracing::{instrument, warn};

use crate::digest;
use crate::types::{
    Cardinality, ContentKind, ExpectedOutput, MaterializedInput, MaterializedOutput, OutputValue,
};

/// Parse the `outputs` block of a staging definition.
pub fn parse_expected_outputs(outputs: &Value) -> Result<Vec<ExpectedOutput>> {
    let mut expected = Vec::new();
    let Value::Mapping(map) = outputs else {
        return Ok(expected);
    };

    for (key, desc) in map {
        let name = key
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{key:?}"));
        let Value::Mapping(desc) = desc else {
            bail!("output {name:?} must be a mapping");
        };

        let kind = match desc.get(&Value::from("c-l-a-s-s")).and_then(Value::as_str) {
            Some("Directory") => ContentKind::Directory,
            Some("Value") => ContentKind::Value,
            _ => ContentKind::File,
        };

        let glob = desc
            .get(&Value::from("glob"))
            .and_then(Value::as_str)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string);
        let fill_from = desc
            .get(&Value::from("fillFrom"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let preferred_filename = desc
            .get(&Value::from("preferredName"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let cardinality = parse_cardinality(desc.get(&Value::from("cardinality")));

        expected.push(ExpectedOutput {
            name,
            kind,
            cardinality,
            preferred_filename,
            fill_from,
            glob,
        });
    }
    Ok(expected)
}

/// Cardinality grammar: `"1"`, `"?"`, `"*"`, `"+"`, a bare integer, or an
/// explicit `[min, max]` pair. Anything else falls back to exactly-one.
pub fn parse_cardinality(value: Option<&Value>) -> Cardinality {
    match value {
        Some(Value::String(token)) => match token.as_str() {
            "1" => Cardinality::ONE,
            "?" => Cardinality::OPTIONAL,
            "*" => Cardinality::ANY,
            "+" => Cardinality::AT_LEAST_ONE,
            _ => Cardinality::ONE,
        },
        Some(Value::Number(n)) => match n.as_i64() {
            Some(count) if count < 1 => Cardinality::OPTIONAL,
            Some(count) => Cardinality {
                min: count as u64,
                max: count as u64,
            },
            None => Cardinality::ONE,
        },
        Some(Value::Sequence(pair)) if pair.len() == 2 => {
            let min = pair[0].as_u64().unwrap_or(0);
            let max = pair[1].as_u64().unwrap_or(u64::MAX);
            Cardinality { min, max }
        }
        _ => Cardinality::ONE,
    }
}

/// Identify the outputs of a finished run.
///
/// `outputs_mapping` is the engine's explicit per-output report (CWL
/// style); engines without one pass `None` and get glob/discovery
/// semantics.
#[instrument(skip_all, fields(outputs_dir = ?outputs_dir))]
pub async fn identify_materialized_outputs(
    inputs: &[MaterializedInput],
    expected_outputs: &[ExpectedOutput],
    outputs_dir: &Path,
    outputs_mapping: Option<&serde_json::Map<String, serde_json::Value>>,
    has_explicit_outputs: bool,
) -> Result<Vec<MaterializedOutput>> {
    let input_values: HashMap<&str, &MaterializedInput> = inputs
        .iter()
        .map(|input| (input.name.as_str(), input))
        .collect();

    let mut outputs = Vec::new();

    if expected_outputs.is_empty() {
        match outputs_mapping {
            None => {
                // Engines without an explicit map: one discovered output
                // per entry of the outputs directory.
                let mut entries = tokio::fs::read_dir(outputs_dir)
                    .await
                    .with_context(|| format!("scan {outputs_dir:?}"))?;
                let mut paths = Vec::new();
                while let Some(entry) = entries.next_entry().await.context("scan entry")? {
                    paths.push(entry.path());
                }
                paths.sort();

                for (index, path) in paths.into_iter().enumerate() {
                    let meta = tokio::fs::symlink_metadata(&path)
                        .await
                        .with_context(|| format!("stat {path:?}"))?;
                    let (kind, value) = if meta.is_dir() {
                        (
                            ContentKind::Directory,
                            OutputValue::Directory(
                                digest::generated_directory_content(&path, None, None).await?,
                            ),
                        )
                    } else if meta.is_file() {
                        (
                            ContentKind::File,
                            OutputValue::File(
                                digest::generated_file_content(&path, None, None).await?,
                            ),
                        )
                    } else {
                        continue;
                    };

                    outputs.push(MaterializedOutput {
                        name: format!("unnamed_output_{index}"),
                        kind,
                        expected_cardinality: Cardinality::OPTIONAL,
                        values: vec![value],
                        synthetic: true,
                        filled_from: None,
                        glob: None,
                    });
                }
            }
            Some(mapping) => {
                // Engines with an explicit map: one discovered output per
                // mapping key.
                for (name, desc) in mapping {
                    let values = translated_engine_values(desc).await?;
                    let kind = match values.first() {
                        Some(OutputValue::Directory(_)) => ContentKind::Directory,
                        Some(OutputValue::Value(_)) => ContentKind::Value,
                        _ => ContentKind::File,
                    };
                    let expected_cardinality = if values.len() > 1 {
                        Cardinality::ANY
                    } else {
                        Cardinality::OPTIONAL
                    };
                    outputs.push(MaterializedOutput {
                        name: name.clone(),
                        kind,
                        expected_cardinality,
                        values,
                        synthetic: true,
                        filled_from: None,
                        glob: None,
                    });
                }
            }
        }
    }

    for expected in expected_outputs {
        let cannot_be_empty = expected.cardinality.min >= 1;
        let mut values: Vec<OutputValue> = Vec::new();

        if let Some(fill_from) = &expected.fill_from {
            if let Some(input) = input_values.get(fill_from.as_str()) {
                for path_hint in input.values.iter().filter_map(|value| value.as_path_hint()) {
                    let resolved = if path_hint.is_absolute() {
                        path_hint
                    } else {
                        outputs_dir.join(path_hint)
                    };
                    match bind_path(&resolved, expected).await {
                        Ok(value) => values.push(value),
                        Err(err) => {
                            warn!(
                                ?resolved,
                                "unable to read path from filled input {fill_from}: {err:#}"
                            );
                        }
                    }
                }
            }
            if values.is_empty() && cannot_be_empty {
                warn!(
                    output = %expected.name,
                    "output got no path from filled input {fill_from}"
                );
            }
        } else if let Some(pattern) = &expected.glob {
            let matches = glob_under(outputs_dir, pattern, expected.kind)?;
            if matches.is_empty() && cannot_be_empty {
                warn!(output = %expected.name, "output got no path for pattern {pattern}");
            }
            for path in matches {
                values.push(bind_path(&path, expected).await?);
            }
        } else {
            if !has_explicit_outputs {
                bail!(
                    "output {:?} declares neither glob nor fillFrom, and the engine has no explicit outputs",
                    expected.name
                );
            }
            let mapped = outputs_mapping.and_then(|mapping| mapping.get(&expected.name));
            match mapped {
                Some(desc) => values.extend(translated_engine_values(desc).await?),
                None if cannot_be_empty => {
                    warn!(output = %expected.name, "output got no match from the outputs mapping");
                }
                None => {}
            }
        }

        outputs.push(MaterializedOutput {
            name: expected.name.clone(),
            kind: expected.kind,
            expected_cardinality: expected.cardinality,
            values,
            synthetic: false,
            filled_from: expected.fill_from.clone(),
            glob: expected.glob.clone(),
        });
    }

    Ok(outputs)
}

/// Bind one path according to the expected kind: digest files and
/// directories, read `Value` outputs as UTF-8 text.
async fn bind_path(path: &Path, expected: &ExpectedOutput) -> Result<OutputValue> {
    match expected.kind {
        ContentKind::Directory => Ok(OutputValue::Directory(
            digest::generated_directory_content(path, None, expected.preferred_filename.clone())
                .await?,
        )),
        ContentKind::File => Ok(OutputValue::File(
            digest::generated_file_content(path, None, expected.preferred_filename.clone())
                .await?,
        )),
        ContentKind::Value => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read value output {path:?}"))?;
            Ok(OutputValue::Value(text))
        }
    }
}

/// Recursive glob under the outputs directory, filtered by expected kind.
fn glob_under(outputs_dir: &Path, pattern: &str, kind: ContentKind) -> Result<Vec<PathBuf>> {
    let full_pattern = format!("{}/{pattern}", outputs_dir.display());
    let mut matches = Vec::new();
    for entry in
        glob::glob(&full_pattern).with_context(|| format!("bad output glob {pattern:?}"))?
    {
        let path = entry.context("walk glob match")?;
        let keep = match kind {
            ContentKind::Directory => path.is_dir(),
            _ => path.is_file(),
        };
        if keep {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Translate one engine-reported output descriptor (CWL shape) into
/// generated content: `{class: File, path | location, ...}`, a directory,
/// an array of either, or a bare scalar.
async fn translated_engine_values(desc: &serde_json::Value) -> Result<Vec<OutputValue>> {
    use serde_json::Value as Json;

    let mut values = Vec::new();
    match desc {
        Json::Array(items) => {
            for item in items {
                values.extend(Box::pin(translated_engine_values(item)).await?);
            }
        }
        Json::Object(object) => {
            let class = object.get("class").and_then(Json::as_str);
            let path = object
                .get("path")
                .and_then(Json::as_str)
                .or_else(|| object.get("location").and_then(Json::as_str))
                .map(|raw| raw.strip_prefix("file://").unwrap_or(raw))
                .map(PathBuf::from);

            match (class, path) {
                (Some("File"), Some(path)) => {
                    values.push(OutputValue::File(
                        digest::generated_file_content(&path, None, None).await?,
                    ));
                }
                (Some("Directory"), Some(path)) => {
                    values.push(OutputValue::Directory(
                        digest::generated_directory_content(&path, None, None).await?,
                    ));
                }
                _ => {
                    warn!(?desc, "unrecognized engine output descriptor");
                }
            }
        }
        Json::Null => {}
        other => values.push(OutputValue::Value(
            other
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        )),
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    #[test_case("\"1\"", Cardinality::ONE; "one")]
    #[test_case("\"?\"", Cardinality::OPTIONAL; "optional")]
    #[test_case("\"*\"", Cardinality::ANY; "any")]
    #[test_case("\"+\"", Cardinality::AT_LEAST_ONE; "at least one")]
    #[test_case("3", Cardinality { min: 3, max: 3 }; "exact count")]
    #[test_case("[2, 5]", Cardinality { min: 2, max: 5 }; "explicit pair")]
    #[test]
    fn cardinality_grammar(yaml: &str, expected: Cardinality) {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        pretty_assert_eq!(parse_cardinality(Some(&value)), expected);
    }

    #[test]
    fn default_cardinality_is_one() {
        pretty_assert_eq!(parse_cardinality(None), Cardinality::ONE);
    }

    #[test]
    fn parses_output_block() {
        let outputs: Value = serde_yaml::from_str(
            r#"
aligned:
  c-l-a-s-s: File
  glob: "*.bam"
  cardinality: "+"
summary:
  c-l-a-s-s: Value
  fillFrom: report_path
"#,
        )
        .unwrap();
        let expected = parse_expected_outputs(&outputs).unwrap();
        pretty_assert_eq!(expected.len(), 2);

        let aligned = expected.iter().find(|o| o.name == "aligned").unwrap();
        pretty_assert_eq!(aligned.kind, ContentKind::File);
        pretty_assert_eq!(aligned.glob.as_deref(), Some("*.bam"));
        pretty_assert_eq!(aligned.cardinality, Cardinality::AT_LEAST_ONE);

        let summary = expected.iter().find(|o| o.name == "summary").unwrap();
        pretty_assert_eq!(summary.kind, ContentKind::Value);
        pretty_assert_eq!(summary.fill_from.as_deref(), Some("report_path"));
    }

    #[tokio::test]
    async fn glob_binding_matches_kind_and_signs() {
        let temp = tempfile::tempdir().unwrap();
        let outputs_dir = temp.path();
        tokio::fs::write(outputs_dir.join("a.bam"), b"alignment a")
            .await
            .unwrap();
        tokio::fs::write(outputs_dir.join("b.bam"), b"alignment b")
            .await
            .unwrap();
        tokio::fs::write(outputs_dir.join("c.txt"), b"not matched")
            .await
            .unwrap();

        let expected = vec![ExpectedOutput {
            name: "aligned".into(),
            kind: ContentKind::File,
            cardinality: Cardinality::AT_LEAST_ONE,
            preferred_filename: None,
            fill_from: None,
            glob: Some("*.bam".into()),
        }];

        let outputs = identify_materialized_outputs(&[], &expected, outputs_dir, None, false)
            .await
            .unwrap();

        pretty_assert_eq!(outputs.len(), 1);
        pretty_assert_eq!(outputs[0].values.len(), 2);
        for value in &outputs[0].values {
            assert!(
                value.signature().is_some_and(|s| !s.is_empty()),
                "every bound output carries a signature"
            );
        }
    }

    #[tokio::test]
    async fn discovery_names_unnamed_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let outputs_dir = temp.path();
        tokio::fs::write(outputs_dir.join("result.txt"), b"done")
            .await
            .unwrap();
        tokio::fs::create_dir(outputs_dir.join("plots")).await.unwrap();
        tokio::fs::write(outputs_dir.join("plots/p.svg"), b"<svg/>")
            .await
            .unwrap();

        let outputs = identify_materialized_outputs(&[], &[], outputs_dir, None, false)
            .await
            .unwrap();

        pretty_assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|output| output.synthetic));
        assert!(
            outputs
                .iter()
                .all(|output| output.name.starts_with("unnamed_output_"))
        );
    }

    #[tokio::test]
    async fn fill_from_reads_value_outputs() {
        let temp = tempfile::tempdir().unwrap();
        let outputs_dir = temp.path();
        tokio::fs::write(outputs_dir.join("metrics.txt"), b"97.5")
            .await
            .unwrap();

        let inputs = vec![MaterializedInput::scalars(
            "metrics_path",
            vec![crate::types::ScalarValue::Str("metrics.txt".into())],
        )];
        let expected = vec![ExpectedOutput {
            name: "metrics".into(),
            kind: ContentKind::Value,
            cardinality: Cardinality::ONE,
            preferred_filename: None,
            fill_from: Some("metrics_path".into()),
            glob: None,
        }];

        let outputs = identify_materialized_outputs(&inputs, &expected, outputs_dir, None, false)
            .await
            .unwrap();
        pretty_assert_eq!(
            outputs[0].values,
            vec![OutputValue::Value("97.5".into())]
        );
    }

    #[tokio::test]
    async fn explicit_mapping_translates_cwl_descriptors() {
        let temp = tempfile::tempdir().unwrap();
        let outputs_dir = temp.path();
        let produced = outputs_dir.join("out.bam");
        tokio::fs::write(&produced, b"alignment").await.unwrap();

        let mapping = serde_json::json!({
            "aligned": {"class": "File", "path": produced.to_string_lossy()}
        });
        let expected = vec![ExpectedOutput {
            name: "aligned".into(),
            kind: ContentKind::File,
            cardinality: Cardinality::ONE,
            preferred_filename: None,
            fill_from: None,
            glob: None,
        }];

        let outputs = identify_materialized_outputs(
            &[],
            &expected,
            outputs_dir,
            mapping.as_object(),
            true,
        )
        .await
        .unwrap();

        pretty_assert_eq!(outputs[0].values.len(), 1);
        assert!(outputs[0].values[0].signature().is_some());
    }
}
