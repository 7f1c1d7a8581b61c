//! Job configuration.
//!
//! Precedence, lowest to highest: built-in defaults (the original job's
//! hardcoded bucket locations), an optional YAML file, then `CSVCLEAN_*`
//! environment variables.

pub mod env;

use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{clean::DropNa, error::JobError, session::location::Location};
pub use env::{apply_env_overrides, EnvSource, ProcessEnv, ENV_PREFIX};

pub const DEFAULT_APP_NAME: &str = "Team7_Final_Pipeline";
pub const DEFAULT_INPUT: &str = "gs://team7-nba-data/*.csv";
pub const DEFAULT_OUTPUT: &str = "gs://team7-nba-data/output/final_parquet/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub app_name: String,
    /// Worker threads for decoding and encoding; `None` uses every core.
    pub parallelism: Option<usize>,
    pub input: InputConfig,
    pub csv: CsvOptions,
    pub dropna: DropNa,
    pub output: OutputConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            parallelism: None,
            input: InputConfig::default(),
            csv: CsvOptions::default(),
            dropna: DropNa::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    /// Glob (`gs://bucket/*.csv`) or, together with `files`, a plain prefix.
    pub location: String,
    /// Explicit object names relative to `location`. When non-empty the
    /// location must not contain a wildcard and every file must exist.
    pub files: Vec<String>,
    pub fetch_concurrency: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            location: DEFAULT_INPUT.to_string(),
            files: Vec::new(),
            fetch_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsvOptions {
    pub header: bool,
    pub delimiter: char,
    pub quote: char,
    pub escape: Option<char>,
    /// Raw field values read as null. Matching is exact.
    pub null_values: Vec<String>,
    /// When false every column is read as a string.
    pub infer_types: bool,
    /// Rows sampled per file for type inference; `None` reads them all.
    pub infer_max_records: Option<usize>,
    pub batch_size: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            header: true,
            delimiter: ',',
            quote: '"',
            escape: None,
            null_values: vec![String::new()],
            infer_types: false,
            infer_max_records: None,
            batch_size: 8192,
        }
    }
}

impl CsvOptions {
    pub fn delimiter_byte(&self) -> Result<u8, JobError> {
        ascii_byte("delimiter", self.delimiter)
    }

    pub fn quote_byte(&self) -> Result<u8, JobError> {
        ascii_byte("quote", self.quote)
    }

    pub fn escape_byte(&self) -> Result<Option<u8>, JobError> {
        self.escape.map(|c| ascii_byte("escape", c)).transpose()
    }

    /// Regex matching exactly the configured null values. With no null
    /// values configured nothing is treated as null.
    pub fn null_regex(&self) -> Result<Regex, JobError> {
        let pattern = if self.null_values.is_empty() {
            r"\b\B".to_string()
        } else {
            let alternatives: Vec<String> =
                self.null_values.iter().map(|v| regex::escape(v)).collect();
            format!("^(?:{})$", alternatives.join("|"))
        };
        Regex::new(&pattern).map_err(|e| JobError::Config(format!("null_values: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub location: String,
    pub mode: SaveMode,
    pub compression: ParquetCompression,
    pub max_rows_per_file: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            location: DEFAULT_OUTPUT.to_string(),
            mode: SaveMode::Overwrite,
            compression: ParquetCompression::Snappy,
            max_rows_per_file: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Overwrite,
    ErrorIfExists,
}

impl FromStr for SaveMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(SaveMode::Overwrite),
            "error_if_exists" | "errorifexists" | "error" => Ok(SaveMode::ErrorIfExists),
            other => Err(JobError::Config(format!("unknown save mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParquetCompression {
    Snappy,
    Zstd,
    Gzip,
    #[serde(alias = "uncompressed")]
    None,
}

impl ParquetCompression {
    pub fn codec(&self) -> Compression {
        match self {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        }
    }

    /// Infix used in part file names, e.g. `part-00000-<run>.snappy.parquet`.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ParquetCompression::Snappy => Some("snappy"),
            ParquetCompression::Zstd => Some("zstd"),
            ParquetCompression::Gzip => Some("gz"),
            ParquetCompression::None => None,
        }
    }
}

impl FromStr for ParquetCompression {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(ParquetCompression::Snappy),
            "zstd" => Ok(ParquetCompression::Zstd),
            "gzip" | "gz" => Ok(ParquetCompression::Gzip),
            "none" | "uncompressed" => Ok(ParquetCompression::None),
            other => Err(JobError::Config(format!("unknown compression {other:?}"))),
        }
    }
}

impl JobConfig {
    /// Defaults, then the YAML file at `path` (if any), then env overrides.
    pub fn load<E: EnvSource>(path: Option<&Path>, env: &E) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let config: JobConfig = serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                info!(path = %path.display(), "loaded config file");
                config
            }
            None => JobConfig::default(),
        };

        apply_env_overrides(&mut config, env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.app_name.trim().is_empty() {
            return Err(JobError::Config("app_name must not be empty".into()));
        }
        if self.parallelism == Some(0) {
            return Err(JobError::Config("parallelism must be at least 1".into()));
        }

        let input = Location::parse(&self.input.location)?;
        if !self.input.files.is_empty() && input.pattern().is_some() {
            return Err(JobError::Config(
                "input.files requires input.location to be a plain prefix, not a glob".into(),
            ));
        }
        if self.input.files.iter().any(|f| f.trim().is_empty()) {
            return Err(JobError::Config("input.files contains an empty name".into()));
        }
        if self.input.fetch_concurrency == 0 {
            return Err(JobError::Config("input.fetch_concurrency must be at least 1".into()));
        }

        self.csv.delimiter_byte()?;
        self.csv.quote_byte()?;
        self.csv.escape_byte()?;
        self.csv.null_regex()?;
        if self.csv.batch_size == 0 {
            return Err(JobError::Config("csv.batch_size must be at least 1".into()));
        }

        if matches!(&self.dropna.subset, Some(cols) if cols.is_empty()) {
            return Err(JobError::Config("dropna.subset must name at least one column".into()));
        }

        let output = Location::parse(&self.output.location)?;
        if output.pattern().is_some() {
            return Err(JobError::Config("output.location must not contain wildcards".into()));
        }
        if output.is_root() {
            return Err(JobError::Config(
                "output.location must not be a bucket or filesystem root".into(),
            ));
        }
        // The commit deletes everything under the output prefix, so no input
        // may live there. Outputs nested below a glob input are fine: the
        // glob only matches direct children.
        if output.root() == input.root() {
            if input.prefix().prefix_matches(output.prefix()) {
                return Err(JobError::Config(
                    "output.location must not contain the input location".into(),
                ));
            }
            if self
                .input
                .files
                .iter()
                .any(|f| input.join(f).prefix_matches(output.prefix()))
            {
                return Err(JobError::Config(
                    "input.files must not point inside output.location".into(),
                ));
            }
        }
        if self.output.max_rows_per_file == 0 {
            return Err(JobError::Config("output.max_rows_per_file must be at least 1".into()));
        }

        Ok(())
    }
}

fn ascii_byte(name: &str, c: char) -> Result<u8, JobError> {
    if c.is_ascii() {
        Ok(c as u8)
    } else {
        Err(JobError::Config(format!("csv.{name} must be a single ASCII character")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::How;
    use std::{collections::HashMap, io::Write};
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_original_job() {
        let config = JobConfig::default();
        assert_eq!(config.app_name, "Team7_Final_Pipeline");
        assert_eq!(config.input.location, "gs://team7-nba-data/*.csv");
        assert_eq!(config.output.location, "gs://team7-nba-data/output/final_parquet/");
        assert_eq!(config.output.mode, SaveMode::Overwrite);
        assert!(config.csv.header);
        assert_eq!(config.dropna, DropNa::default());
        config.validate().unwrap();
    }

    #[test]
    fn null_regex_matches_exact_values_only() {
        let mut csv = CsvOptions::default();
        let re = csv.null_regex().unwrap();
        assert!(re.is_match(""));
        assert!(!re.is_match(" "));
        assert!(!re.is_match("NA"));

        csv.null_values = vec![String::new(), "NA".into(), "n/a".into()];
        let re = csv.null_regex().unwrap();
        assert!(re.is_match("NA"));
        assert!(re.is_match("n/a"));
        assert!(!re.is_match("NAN"));

        csv.null_values.clear();
        let re = csv.null_regex().unwrap();
        assert!(!re.is_match(""));
        assert!(!re.is_match("x"));
    }

    #[test]
    fn yaml_then_env_precedence() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            r#"
app_name: nightly
input:
  location: "memory:///raw/*.csv"
csv:
  delimiter: ";"
  infer_types: true
dropna:
  how: all
output:
  location: "memory:///clean/"
  compression: zstd
"#
        )?;

        let env: HashMap<String, String> = [
            ("CSVCLEAN_APP_NAME", "override"),
            ("CSVCLEAN_MAX_ROWS_PER_FILE", "10"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = JobConfig::load(Some(file.path()), &env)?;
        assert_eq!(config.app_name, "override");
        assert_eq!(config.input.location, "memory:///raw/*.csv");
        assert_eq!(config.csv.delimiter, ';');
        assert!(config.csv.infer_types);
        assert_eq!(config.dropna.how, How::All);
        assert_eq!(config.output.compression, ParquetCompression::Zstd);
        assert_eq!(config.output.max_rows_per_file, 10);
        Ok(())
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "app_nmae: typo")?;
        let env: HashMap<String, String> = HashMap::new();
        assert!(JobConfig::load(Some(file.path()), &env).is_err());
        Ok(())
    }

    #[test]
    fn validate_rejects_unsafe_outputs() {
        let mut config = JobConfig::default();
        config.output.location = "gs://team7-nba-data/".into();
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.output.location = "gs://team7-nba-data/out/*.parquet".into();
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.input.location = "gs://team7-nba-data/raw/*.csv".into();
        config.output.location = "gs://team7-nba-data/raw".into();
        assert!(matches!(config.validate(), Err(JobError::Config(_))));
    }

    #[test]
    fn validate_rejects_output_enclosing_input() {
        let mut config = JobConfig::default();
        config.input.location = "memory:///data/raw/*.csv".into();
        config.output.location = "memory:///data".into();
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.output.location = "memory:///data/clean".into();
        config.validate().unwrap();

        // output below a glob input is never picked up by the glob
        config.input.location = "memory:///data/*.csv".into();
        config.validate().unwrap();

        config.input.location = "memory:///data/".into();
        config.input.files = vec!["clean/games.csv".into()];
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.input.location = "s3://other/data/raw/*.csv".into();
        config.input.files.clear();
        config.output.location = "memory:///data".into();
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_input_combinations() {
        let mut config = JobConfig::default();
        config.input.files = vec!["games.csv".into()];
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.input.location = "gs://team7-nba-data/".into();
        config.validate().unwrap();

        config.csv.delimiter = '¦';
        assert!(matches!(config.validate(), Err(JobError::Config(_))));

        config.csv.delimiter = ',';
        config.dropna.subset = Some(Vec::new());
        assert!(matches!(config.validate(), Err(JobError::Config(_))));
    }
}
