//! Reading the input CSV files into one table.
//!
//! Inputs are either every file under a prefix whose name matches the glob in
//! the location's last segment, or an explicit list of names that must all
//! exist. Objects whose names start with `_` or `.` are never picked up by a
//! glob. Files are fetched concurrently, then schema inference and decoding
//! run on the session's worker pool.

pub mod schema;

use std::{collections::HashSet, io::Cursor, sync::Arc, time::Instant};

use anyhow::{bail, Context, Result};
use arrow::{csv::ReaderBuilder, datatypes::SchemaRef, record_batch::RecordBatch};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use object_store::{path::Path, ObjectStore};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{CsvOptions, InputConfig},
    error::JobError,
    session::{location::Location, Session},
    table::Table,
};
use schema::{infer_file_schema, reconcile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: Path,
    pub size: u64,
}

/// The validated set of files one run reads.
#[derive(Debug, Clone)]
pub struct InputSet {
    pub location: Location,
    pub files: Vec<InputFile>,
}

impl InputSet {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[instrument(level = "info", skip_all, fields(location = %input.location))]
pub async fn resolve_inputs(session: &Session, input: &InputConfig) -> Result<InputSet> {
    let location = Location::parse(&input.location)?;
    let store = session.store_for(&location)?;

    let files = if input.files.is_empty() {
        list_matching(store.as_ref(), &location).await?
    } else {
        check_explicit(store.as_ref(), &location, &input.files).await?
    };

    if files.is_empty() {
        return Err(JobError::NoInputFiles {
            location: location.to_string(),
        }
        .into());
    }

    let inputs = InputSet { location, files };
    info!(
        files = inputs.files.len(),
        bytes = inputs.total_bytes(),
        "resolved input files"
    );
    Ok(inputs)
}

async fn list_matching(store: &dyn ObjectStore, location: &Location) -> Result<Vec<InputFile>> {
    let pattern = location
        .pattern()
        .map(glob::Pattern::new)
        .transpose()
        .with_context(|| format!("invalid file pattern in {}", location))?;

    let listing = store
        .list_with_delimiter(location.list_prefix())
        .await
        .with_context(|| format!("listing {}", location))?;

    let mut files: Vec<InputFile> = listing
        .objects
        .into_iter()
        .filter(|meta| {
            let Some(name) = meta.location.filename() else {
                return false;
            };
            if is_hidden(name) {
                return false;
            }
            pattern.as_ref().map_or(true, |p| p.matches(name))
        })
        .map(|meta| InputFile {
            path: meta.location,
            size: meta.size,
        })
        .collect();
    files.sort_by(|a, b| a.path.as_ref().cmp(b.path.as_ref()));

    debug!(matched = files.len(), "listed input prefix");
    Ok(files)
}

async fn check_explicit(
    store: &dyn ObjectStore,
    location: &Location,
    names: &[String],
) -> Result<Vec<InputFile>> {
    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(names.len());

    for name in names {
        let path = location.join(name);
        if !seen.insert(path.clone()) {
            return Err(JobError::DuplicateInput {
                path: location.uri(&path),
            }
            .into());
        }

        match store.head(&path).await {
            Ok(meta) => files.push(InputFile {
                path,
                size: meta.size,
            }),
            Err(object_store::Error::NotFound { .. }) => {
                return Err(JobError::MissingInput {
                    path: location.uri(&path),
                }
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("checking {}", location.uri(&path)));
            }
        }
    }

    Ok(files)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// Fetch every input and decode it into one table.
#[instrument(level = "info", skip_all, fields(files = inputs.files.len()))]
pub async fn read_table(
    session: &Session,
    inputs: &InputSet,
    csv: &CsvOptions,
    fetch_concurrency: usize,
) -> Result<Table> {
    let store = session.store_for(&inputs.location)?;
    let start = Instant::now();

    let fetched: Vec<(String, Bytes)> = stream::iter(inputs.files.iter().map(|file| {
        let store = Arc::clone(&store);
        let path = file.path.clone();
        let uri = inputs.location.uri(&file.path);
        async move {
            let bytes = store
                .get(&path)
                .await
                .with_context(|| format!("fetching {}", uri))?
                .bytes()
                .await
                .with_context(|| format!("reading {}", uri))?;
            debug!(file = %uri, bytes = bytes.len(), "fetched input");
            Ok::<_, anyhow::Error>((uri, bytes))
        }
    }))
    .buffered(fetch_concurrency.max(1))
    .try_collect()
    .await?;

    let csv = csv.clone();
    let table = session.run_cpu(move || decode_files(&fetched, &csv)).await??;

    info!(
        rows = table.num_rows(),
        columns = table.schema().fields().len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "read input table"
    );
    Ok(table)
}

/// Decode already-fetched files. Runs on the caller's rayon pool.
pub fn decode_files(files: &[(String, Bytes)], csv: &CsvOptions) -> Result<Table> {
    let inferred: Vec<Option<arrow::datatypes::Schema>> = files
        .par_iter()
        .map(|(name, data)| infer_file_schema(name, data, csv))
        .collect::<Result<_>>()?;

    let mut named = Vec::with_capacity(files.len());
    for ((name, _), schema) in files.iter().zip(&inferred) {
        match schema {
            Some(schema) => named.push((name.as_str(), schema)),
            None => warn!(file = %name, "skipping input without a header row"),
        }
    }
    if named.is_empty() {
        bail!("none of the {} input files has a header row", files.len());
    }

    let schema: SchemaRef = Arc::new(reconcile(&named)?);
    debug!(?schema, "reconciled input schema");

    let per_file: Vec<Vec<RecordBatch>> = files
        .par_iter()
        .zip(inferred.par_iter())
        .filter(|(_, schema)| schema.is_some())
        .map(|((name, data), _)| decode_file(name, data, &schema, csv))
        .collect::<Result<_>>()?;

    Ok(Table::new(schema, per_file.into_iter().flatten().collect()))
}

fn decode_file(
    name: &str,
    data: &[u8],
    schema: &SchemaRef,
    csv: &CsvOptions,
) -> Result<Vec<RecordBatch>> {
    let mut builder = ReaderBuilder::new(Arc::clone(schema))
        .with_header(csv.header)
        .with_delimiter(csv.delimiter_byte()?)
        .with_quote(csv.quote_byte()?)
        .with_null_regex(csv.null_regex()?)
        .with_batch_size(csv.batch_size);
    if let Some(escape) = csv.escape_byte()? {
        builder = builder.with_escape(escape);
    }

    let reader = builder
        .build(Cursor::new(data))
        .with_context(|| format!("creating CSV reader for {}", name))?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing CSV {}", name))?;
    debug!(file = %name, batches = batches.len(), "decoded input");
    Ok(batches)
}
