//! Instruction dataset loading.
//!
//! Each record is a JSON object with an instruction, an optional input and
//! the expected output:
//!
//! ```json
//! {"instruction": "Translate to French.", "input": "Good morning", "output": "Bonjour"}
//! ```
//!
//! `prompt` is accepted for `instruction`, `context` for `input`, and
//! `response` / `completion` for `output`. A `.jsonl` file holds one record
//! per line; a `.json` file may instead hold a single array of records. When
//! given a directory, every `.jsonl` and `.json` file in it is read in
//! alphabetical order.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::info;

/// One supervised example.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionExample {
    pub instruction: String,
    /// Empty when the record has no input.
    pub input: String,
    pub output: String,
}

// ── Deserialization helper ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawExample {
    #[serde(alias = "prompt")]
    instruction: String,
    #[serde(default, alias = "context")]
    input: Option<String>,
    #[serde(alias = "response", alias = "completion")]
    output: String,
}

impl From<RawExample> for InstructionExample {
    fn from(raw: RawExample) -> Self {
        Self {
            instruction: raw.instruction,
            input: raw.input.unwrap_or_default(),
            output: raw.output,
        }
    }
}

// ── InstructionDataset ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InstructionDataset {
    examples: Vec<InstructionExample>,
}

impl InstructionDataset {
    /// Load a single file or every dataset file in a directory.
    pub fn load(path: &Path) -> Result<Self> {
        let files = if path.is_dir() {
            dataset_files(path)?
        } else {
            vec![path.to_path_buf()]
        };

        let mut examples = Vec::new();
        for file in &files {
            let before = examples.len();
            read_file(file, &mut examples)?;
            info!(path = %file.display(), count = examples.len() - before, "Loaded dataset file");
        }

        anyhow::ensure!(!examples.is_empty(), "Dataset at {} contains no examples", path.display());
        info!(total = examples.len(), "Dataset loaded");
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<InstructionExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn as_slice(&self) -> &[InstructionExample] {
        &self.examples
    }

    /// A permutation of `0..len()` that depends only on `seed` and `epoch`.
    pub fn shuffled_indices(&self, seed: u64, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        indices
    }
}

fn dataset_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read dataset directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && matches!(p.extension().and_then(|e| e.to_str()), Some("jsonl") | Some("json"))
        })
        .collect();
    entries.sort();
    anyhow::ensure!(!entries.is_empty(), "No .jsonl or .json files found in {}", dir.display());
    Ok(entries)
}

fn read_file(path: &Path, out: &mut Vec<InstructionExample>) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot open {}", path.display()))?;

    if text.trim_start().starts_with('[') {
        let records: Vec<RawExample> = serde_json::from_str(&text).with_context(|| {
            format!(
                "JSON parse error in {}: expected an array of {{\"instruction\",\"output\"}} records",
                path.display()
            )
        })?;
        out.extend(records.into_iter().map(InstructionExample::from));
        return Ok(());
    }

    for (line_no, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: RawExample = serde_json::from_str(trimmed).with_context(|| {
            format!(
                "JSON parse error at {}:{}: expected {{\"instruction\":…,\"output\":…}}",
                path.display(),
                line_no + 1
            )
        })?;
        out.push(raw.into());
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_dataset(name: &str, lines: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut f = fs::File::create(dir.path().join(name)).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        dir
    }

    #[test]
    fn loads_jsonl_with_aliases() {
        let dir = make_dataset(
            "data.jsonl",
            &[
                r#"{"instruction":"Add","input":"2 and 2","output":"4"}"#,
                "",
                r#"{"prompt":"Greet","completion":"hello"}"#,
                r#"{"instruction":"Sum","context":"1, 2","response":"3"}"#,
            ],
        );
        let ds = InstructionDataset::load(dir.path()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.as_slice()[0].input, "2 and 2");
        assert_eq!(ds.as_slice()[1].instruction, "Greet");
        assert_eq!(ds.as_slice()[1].input, "");
        assert_eq!(ds.as_slice()[2].output, "3");
        assert_eq!(ds.as_slice()[2].input, "1, 2");
    }

    #[test]
    fn loads_json_array_file() {
        let dir = make_dataset(
            "alpaca.json",
            &[r#"[{"instruction":"a","input":null,"output":"b"},{"instruction":"c","output":"d"}]"#],
        );
        let ds = InstructionDataset::load(&dir.path().join("alpaca.json")).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.as_slice()[0].input, "");
    }

    #[test]
    fn directory_files_read_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.jsonl"), r#"{"instruction":"second","output":"x"}"#).unwrap();
        fs::write(dir.path().join("a.jsonl"), r#"{"instruction":"first","output":"x"}"#).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let ds = InstructionDataset::load(dir.path()).unwrap();
        assert_eq!(ds.as_slice()[0].instruction, "first");
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn empty_inputs_error() {
        let dir = TempDir::new().unwrap();
        assert!(InstructionDataset::load(dir.path()).is_err());

        let blank = make_dataset("data.jsonl", &["", "   "]);
        assert!(InstructionDataset::load(blank.path()).is_err());
    }

    #[test]
    fn malformed_record_names_line() {
        let dir = make_dataset(
            "data.jsonl",
            &[r#"{"instruction":"a","output":"b"}"#, r#"{"instruction":"a"}"#],
        );
        let err = InstructionDataset::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("data.jsonl:2"), "got: {err:#}");
    }

    #[test]
    fn shuffle_is_deterministic_per_epoch() {
        let examples = (0..20)
            .map(|i| InstructionExample {
                instruction: i.to_string(),
                input: String::new(),
                output: String::new(),
            })
            .collect();
        let ds = InstructionDataset::from_examples(examples);
        let a = ds.shuffled_indices(42, 0);
        assert_eq!(a, ds.shuffled_indices(42, 0));
        assert_ne!(a, ds.shuffled_indices(42, 1));
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
