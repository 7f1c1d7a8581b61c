//! Parquet output with overwrite semantics.
//!
//! Parts are encoded in memory and uploaded under
//! `<output>/_temporary/<run-id>/`. A failure while staging leaves the
//! previous output untouched. Once every upload succeeded the commit:
//!
//! 1. removes the previous `_SUCCESS` marker,
//! 2. moves the staged parts to their final names (rolling the moved ones
//!    back and restoring the marker if a move fails),
//! 3. deletes the previous parts,
//! 4. writes a fresh `_SUCCESS`.
//!
//! Readers that wait for `_SUCCESS` see either the old or the new output.
//! A plain listing taken mid-commit may see both sets of parts.

use std::{io::Cursor, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use futures::{stream, StreamExt, TryStreamExt};
use object_store::{path::Path, ObjectMeta, ObjectStore, PutPayload};
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{OutputConfig, ParquetCompression, SaveMode},
    error::JobError,
    session::{location::Location, Session},
    table::Table,
};

pub const STAGING_DIR: &str = "_temporary";
pub const SUCCESS_MARKER: &str = "_SUCCESS";
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    /// Final URIs of the committed part files.
    pub parts: Vec<String>,
    pub bytes: u64,
    pub rows: u64,
}

/// Write `table` to the configured output location.
#[instrument(level = "info", skip_all, fields(output = %output.location, run_id = %run_id))]
pub async fn write_table(
    session: &Session,
    table: &Table,
    output: &OutputConfig,
    run_id: &str,
) -> Result<WriteOutcome> {
    let location = Location::parse(&output.location)?;
    let store = session.store_for(&location)?;
    let start = Instant::now();

    let existing: Vec<ObjectMeta> = store
        .list(location.list_prefix())
        .try_collect()
        .await
        .with_context(|| format!("listing output {}", location))?;
    if output.mode == SaveMode::ErrorIfExists && existing.iter().any(|m| !is_marker(&m.location)) {
        return Err(JobError::OutputExists {
            location: location.to_string(),
        }
        .into());
    }

    // encode
    let schema = table.schema_arc();
    let plan = plan_parts(table, output.max_rows_per_file);
    let compression = output.compression;
    let encoded: Vec<(u64, Vec<u8>)> = session
        .run_cpu(move || {
            plan.into_par_iter()
                .map(|batches| {
                    let rows = batches.iter().map(|b| b.num_rows() as u64).sum();
                    encode_part(&schema, &batches, compression).map(|bytes| (rows, bytes))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await??;

    // stage
    let staging = location.join(&format!("{}/{}", STAGING_DIR, run_id));
    let names: Vec<String> = (0..encoded.len())
        .map(|i| part_name(i, run_id, compression))
        .collect();
    let total_bytes: u64 = encoded.iter().map(|(_, b)| b.len() as u64).sum();
    let total_rows: u64 = encoded.iter().map(|(rows, _)| *rows).sum();

    let staged = stage_parts(store.as_ref(), &location, &staging, &names, encoded).await;
    if let Err(e) = staged {
        cleanup_staging(store.as_ref(), &staging).await;
        return Err(e);
    }

    // commit
    let committed = commit(store.as_ref(), &location, &staging, &names, &existing).await;
    cleanup_staging(store.as_ref(), &staging).await;
    committed?;

    let parts: Vec<String> = names
        .iter()
        .map(|name| location.uri(&location.join(name)))
        .collect();
    info!(
        parts = parts.len(),
        rows = total_rows,
        bytes = total_bytes,
        replaced = existing.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "committed output"
    );

    Ok(WriteOutcome {
        parts,
        bytes: total_bytes,
        rows: total_rows,
    })
}

/// Group batches into parts of at most `max_rows` rows. An empty table still
/// yields one (empty) part so the schema is persisted.
pub fn plan_parts(table: &Table, max_rows: usize) -> Vec<Vec<RecordBatch>> {
    let max_rows = max_rows.max(1);
    let mut parts = Vec::new();
    let mut current: Vec<RecordBatch> = Vec::new();
    let mut current_rows = 0;

    for batch in table.batches() {
        let mut offset = 0;
        while offset < batch.num_rows() {
            let take = (max_rows - current_rows).min(batch.num_rows() - offset);
            current.push(batch.slice(offset, take));
            current_rows += take;
            offset += take;
            if current_rows == max_rows {
                parts.push(std::mem::take(&mut current));
                current_rows = 0;
            }
        }
    }
    if !current.is_empty() || parts.is_empty() {
        parts.push(current);
    }
    parts
}

fn encode_part(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    compression: ParquetCompression,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let cursor = Cursor::new(&mut buffer);

    let props = WriterProperties::builder()
        .set_compression(compression.codec())
        .build();

    let mut writer = ArrowWriter::try_new(cursor, Arc::clone(schema), Some(props))
        .context("creating parquet writer")?;
    for batch in batches {
        writer.write(batch).context("writing batch to parquet")?;
    }
    writer.close().context("closing parquet writer")?;

    Ok(buffer)
}

fn part_name(index: usize, run_id: &str, compression: ParquetCompression) -> String {
    match compression.extension() {
        Some(ext) => format!("part-{:05}-{}.{}.parquet", index, run_id, ext),
        None => format!("part-{:05}-{}.parquet", index, run_id),
    }
}

fn is_marker(path: &Path) -> bool {
    path.filename() == Some(SUCCESS_MARKER)
}

async fn stage_parts(
    store: &dyn ObjectStore,
    location: &Location,
    staging: &Path,
    names: &[String],
    encoded: Vec<(u64, Vec<u8>)>,
) -> Result<()> {
    stream::iter(names.iter().zip(encoded).map(|(name, (rows, bytes))| {
        let path = Path::from(format!("{}/{}", staging, name));
        async move {
            let len = bytes.len();
            store
                .put(&path, PutPayload::from(bytes))
                .await
                .with_context(|| format!("uploading {}", location.uri(&path)))?;
            debug!(part = %path, rows, bytes = len, "staged part");
            Ok::<_, anyhow::Error>(())
        }
    }))
    .buffer_unordered(UPLOAD_CONCURRENCY)
    .try_collect::<Vec<()>>()
    .await?;
    Ok(())
}

async fn commit(
    store: &dyn ObjectStore,
    location: &Location,
    staging: &Path,
    names: &[String],
    existing: &[ObjectMeta],
) -> Result<()> {
    let marker = location.join(SUCCESS_MARKER);
    let had_marker = existing.iter().any(|m| m.location == marker);
    if had_marker {
        delete_if_present(store, &marker)
            .await
            .with_context(|| format!("removing {}", location.uri(&marker)))?;
    }

    let mut moved: Vec<Path> = Vec::with_capacity(names.len());
    for name in names {
        let from = Path::from(format!("{}/{}", staging, name));
        let to = location.join(name);
        if let Err(e) = store.copy(&from, &to).await {
            rollback(store, &moved, had_marker.then_some(&marker)).await;
            return Err(e).with_context(|| format!("moving {} into place", location.uri(&from)));
        }
        moved.push(to);
        if let Err(e) = store.delete(&from).await {
            debug!(part = %from, error = %e, "staged part left for cleanup");
        }
    }

    // new parts are in place; everything listed before staging is stale
    for meta in existing {
        if meta.location == marker
            || meta.location.prefix_matches(staging)
            || moved.contains(&meta.location)
        {
            continue;
        }
        delete_if_present(store, &meta.location)
            .await
            .with_context(|| format!("deleting old output {}", location.uri(&meta.location)))?;
    }

    store
        .put(&marker, PutPayload::new())
        .await
        .with_context(|| format!("writing {}", location.uri(&marker)))?;
    Ok(())
}

async fn delete_if_present(store: &dyn ObjectStore, path: &Path) -> object_store::Result<()> {
    match store.delete(path).await {
        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Undo a partial move: drop the parts already placed and put the previous
/// marker back.
async fn rollback(store: &dyn ObjectStore, moved: &[Path], marker: Option<&Path>) {
    for path in moved {
        if let Err(e) = delete_if_present(store, path).await {
            warn!(part = %path, error = %e, "could not roll back part");
        }
    }
    if let Some(marker) = marker {
        if let Err(e) = store.put(marker, PutPayload::new()).await {
            warn!(marker = %marker, error = %e, "could not restore success marker");
        }
    }
}

/// Best-effort removal of everything under the staging prefix.
async fn cleanup_staging(store: &dyn ObjectStore, staging: &Path) {
    let leftovers: Vec<ObjectMeta> = match store.list(Some(staging)).try_collect().await {
        Ok(found) => found,
        Err(e) => {
            warn!(staging = %staging, error = %e, "could not list staging area");
            return;
        }
    };
    for meta in leftovers {
        if let Err(e) = store.delete(&meta.location).await {
            warn!(object = %meta.location, error = %e, "could not remove staged object");
        }
    }
}
