use std::io::Cursor;

use anyhow::{Context, Result};
use arrow::{
    csv::reader::Format,
    datatypes::{DataType, Field, Schema},
};

use crate::{config::CsvOptions, error::JobError};

/// CSV dialect shared by schema inference and decoding.
pub fn csv_format(csv: &CsvOptions) -> Result<Format> {
    let mut format = Format::default()
        .with_header(csv.header)
        .with_delimiter(csv.delimiter_byte()?)
        .with_quote(csv.quote_byte()?)
        .with_null_regex(csv.null_regex()?);
    if let Some(escape) = csv.escape_byte()? {
        format = format.with_escape(escape);
    }
    Ok(format)
}

/// Column names and types of one file. `None` when the file has no header
/// row at all (zero bytes or blank).
pub fn infer_file_schema(name: &str, data: &[u8], csv: &CsvOptions) -> Result<Option<Schema>> {
    let format = csv_format(csv)?;
    // names only need the first record
    let max_records = if csv.infer_types {
        csv.infer_max_records
    } else {
        Some(1)
    };

    let (inferred, _) = format
        .infer_schema(Cursor::new(data), max_records)
        .with_context(|| format!("inferring schema of {}", name))?;
    if inferred.fields().is_empty() {
        return Ok(None);
    }

    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let col_name = if csv.header {
                f.name().clone()
            } else {
                format!("_c{}", i)
            };
            let data_type = if csv.infer_types {
                f.data_type().clone()
            } else {
                DataType::Utf8
            };
            Field::new(col_name, data_type, true)
        })
        .collect();

    Ok(Some(Schema::new(fields)))
}

/// Merge per-file schemas into the table schema. Every file must carry the
/// same column names in the same order; types are widened column by column.
pub fn reconcile(files: &[(&str, &Schema)]) -> Result<Schema, JobError> {
    let Some((_, first)) = files.first() else {
        return Ok(Schema::empty());
    };
    let expected: Vec<String> = first.fields().iter().map(|f| f.name().clone()).collect();
    let mut types: Vec<DataType> = first.fields().iter().map(|f| f.data_type().clone()).collect();

    for (file, schema) in &files[1..] {
        let found: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
        if found != expected {
            return Err(JobError::SchemaMismatch {
                file: file.to_string(),
                expected,
                found,
            });
        }
        for (ty, field) in types.iter_mut().zip(schema.fields()) {
            *ty = unify(ty, field.data_type());
        }
    }

    let fields: Vec<Field> = expected
        .into_iter()
        .zip(types)
        .map(|(name, ty)| {
            let ty = if ty == DataType::Null { DataType::Utf8 } else { ty };
            Field::new(name, ty, true)
        })
        .collect();
    Ok(Schema::new(fields))
}

fn unify(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        _ if a == b => a.clone(),
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
            DataType::Float64
        }
        _ => DataType::Utf8,
    }
}
