use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

use super::{JobConfig, ParquetCompression, SaveMode};
use crate::clean::How;

pub const ENV_PREFIX: &str = "CSVCLEAN_";

/// Source of environment overrides, so tests can supply a plain map.
pub trait EnvSource {
    /// Look up `key` with the `CSVCLEAN_` prefix applied.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, &format!("{ENV_PREFIX}{key}")).cloned()
    }
}

/// Apply environment-variable overrides (highest priority) to the job config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut JobConfig, env: &E) -> Result<()> {
    if let Some(name) = env.get("APP_NAME") {
        config.app_name = name;
    }
    if let Some(threads) = get_env_usize(env, "PARALLELISM")? {
        config.parallelism = Some(threads);
    }

    // Input
    if let Some(location) = env.get("INPUT") {
        config.input.location = location;
    }
    if let Some(files) = get_env_list(env, "INPUT_FILES") {
        config.input.files = files;
    }
    if let Some(n) = get_env_usize(env, "FETCH_CONCURRENCY")? {
        config.input.fetch_concurrency = n;
    }

    // CSV dialect
    if let Some(val) = get_env_bool(env, "HEADER")? {
        config.csv.header = val;
    }
    if let Some(val) = get_env_char(env, "DELIMITER")? {
        config.csv.delimiter = val;
    }
    if let Some(val) = get_env_bool(env, "INFER_TYPES")? {
        config.csv.infer_types = val;
    }
    // An empty value clears the list, so `CSVCLEAN_NULL_VALUES=` disables
    // null inference entirely.
    if let Some(raw) = env.get("NULL_VALUES") {
        config.csv.null_values = if raw.is_empty() {
            Vec::new()
        } else {
            raw.split(',').map(str::to_string).collect()
        };
    }

    // Drop policy
    if let Some(how) = env.get("DROP_HOW") {
        config.dropna.how = how
            .parse::<How>()
            .context("Invalid CSVCLEAN_DROP_HOW value")?;
    }
    if let Some(thresh) = get_env_usize(env, "DROP_THRESH")? {
        config.dropna.thresh = Some(thresh);
    }
    if let Some(subset) = get_env_list(env, "DROP_SUBSET") {
        config.dropna.subset = Some(subset);
    }

    // Output
    if let Some(location) = env.get("OUTPUT") {
        config.output.location = location;
    }
    if let Some(mode) = env.get("SAVE_MODE") {
        config.output.mode = mode
            .parse::<SaveMode>()
            .context("Invalid CSVCLEAN_SAVE_MODE value")?;
    }
    if let Some(compression) = env.get("COMPRESSION") {
        config.output.compression = compression
            .parse::<ParquetCompression>()
            .context("Invalid CSVCLEAN_COMPRESSION value")?;
    }
    if let Some(n) = get_env_usize(env, "MAX_ROWS_PER_FILE")? {
        config.output.max_rows_per_file = n;
    }

    Ok(())
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val.trim().parse::<bool>().map_err(|e| {
                anyhow!(
                    "Failed to parse {}{} (expected bool): {}",
                    ENV_PREFIX,
                    key,
                    e
                )
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_char<E: EnvSource>(env: &E, key: &str) -> Result<Option<char>> {
    match env.get(key) {
        Some(val) => {
            let mut chars = val.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Some(c)),
                _ => Err(anyhow!(
                    "Failed to parse {}{}: expected a single character, got {:?}",
                    ENV_PREFIX,
                    key,
                    val
                )),
            }
        }
        None => Ok(None),
    }
}

/// Comma-separated list with blanks dropped.
fn get_env_list<E: EnvSource>(env: &E, key: &str) -> Option<Vec<String>> {
    env.get(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
