use anyhow::{bail, Context, Result};
use csvclean::{
    session::{location::Location, Session, SessionGuard},
    write::SUCCESS_MARKER,
};
use futures::TryStreamExt;
use object_store::{ObjectMeta, ObjectStore};
use parquet::file::{
    metadata::RowGroupMetaData,
    reader::{FileReader, SerializedFileReader},
};
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    // Expect exactly one CLI argument: the output location of a job run.
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        bail!("Usage: {} <OUTPUT_LOCATION>", args[0]);
    }

    let session = SessionGuard::new(
        Session::builder()
            .app_name("csvclean-inspect")
            .get_or_create()?,
    );
    inspect_output(&session, &args[1]).await
}

/// List the part files under `raw` and print their Parquet metadata.
async fn inspect_output(session: &Session, raw: &str) -> Result<()> {
    let location = Location::parse(raw)?;
    let store = session.store_for(&location)?;

    let mut objects: Vec<ObjectMeta> = store
        .list(location.list_prefix())
        .try_collect()
        .await
        .with_context(|| format!("listing {}", location))?;
    objects.sort_by(|a, b| a.location.cmp(&b.location));

    let committed = objects
        .iter()
        .any(|m| m.location.filename() == Some(SUCCESS_MARKER));
    let parts: Vec<&ObjectMeta> = objects
        .iter()
        .filter(|m| m.location.extension() == Some("parquet"))
        .filter(|m| !m.location.as_ref().contains("/_temporary/"))
        .collect();

    println!("=== Output: {} ===", location);
    println!("Committed ({}):     {}", SUCCESS_MARKER, if committed { "yes" } else { "no" });
    println!("Part files:           {}", parts.len());
    println!();

    let mut total_rows = 0i64;
    for meta in parts {
        let bytes = store
            .get(&meta.location)
            .await?
            .bytes()
            .await
            .with_context(|| format!("reading {}", location.uri(&meta.location)))?;
        let reader = SerializedFileReader::new(bytes)
            .with_context(|| format!("opening {}", location.uri(&meta.location)))?;
        let parquet_meta = reader.metadata();
        let file_meta = parquet_meta.file_metadata();
        total_rows += file_meta.num_rows();

        println!("--- {} ---", location.uri(&meta.location));
        println!("  Size:            {} bytes", meta.size);
        println!("  Rows:            {}", file_meta.num_rows());
        println!("  Row groups:      {}", parquet_meta.num_row_groups());
        println!(
            "  Created by:      {}",
            file_meta.created_by().unwrap_or("<unknown>")
        );
        println!("  Columns:");
        for col_desc in file_meta.schema_descr().columns() {
            let logical = col_desc
                .logical_type()
                .as_ref()
                .map_or("<none>".to_string(), |lt| format!("{:?}", lt));
            println!(
                "    - {:<30} | Physical: {:<10} | Logical: {}",
                col_desc.name(),
                format!("{:?}", col_desc.physical_type()),
                logical
            );
        }
        for (idx, rg_md) in parquet_meta.row_groups().iter().enumerate() {
            print_row_group(idx, rg_md);
        }
        println!();
    }

    println!("Total rows:           {}", total_rows);
    Ok(())
}

/// One line per row group, then null counts per column chunk.
fn print_row_group(idx: usize, rg_md: &RowGroupMetaData) {
    println!(
        "  Row group {}: {} rows, {} bytes uncompressed",
        idx,
        rg_md.num_rows(),
        rg_md.total_byte_size()
    );
    for col_md in rg_md.columns() {
        let nulls = col_md
            .statistics()
            .and_then(|stats| stats.null_count_opt())
            .map_or("?".to_string(), |n| n.to_string());
        println!(
            "    > {:<28} {:?}, {} values, {} nulls",
            col_md.column_descr().name(),
            col_md.compression(),
            col_md.num_values(),
            nulls
        );
    }
}
