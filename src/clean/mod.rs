//! Null-row dropping.
//!
//! The default policy drops every row that has a null in any column. `how`,
//! `thresh` and `subset` narrow it down for wide tables where only some
//! columns matter.

use std::str::FromStr;

use anyhow::{Context, Result};
use arrow::{
    array::BooleanArray,
    compute::{filter_record_batch, is_not_null},
    datatypes::Schema,
    record_batch::RecordBatch,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{error::JobError, table::Table};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum How {
    /// Drop a row when any considered column is null.
    #[default]
    Any,
    /// Drop a row only when every considered column is null.
    All,
}

impl FromStr for How {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(How::Any),
            "all" => Ok(How::All),
            other => Err(JobError::Config(format!("unknown drop mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DropNa {
    pub how: How,
    /// Keep rows with at least this many non-null considered values.
    /// Takes precedence over `how`.
    pub thresh: Option<usize>,
    /// Columns to consider; `None` means all of them.
    pub subset: Option<Vec<String>>,
}

impl DropNa {
    /// Indices of the columns this policy looks at.
    pub fn column_indices(&self, schema: &Schema) -> Result<Vec<usize>, JobError> {
        match &self.subset {
            None => Ok((0..schema.fields().len()).collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    schema
                        .index_of(name)
                        .map_err(|_| JobError::UnknownColumn {
                            column: name.clone(),
                        })
                })
                .collect(),
        }
    }

    fn required_non_null(&self, considered: usize) -> usize {
        match (self.thresh, self.how) {
            (Some(thresh), _) => thresh,
            (None, How::Any) => considered,
            (None, How::All) => 1,
        }
    }

    /// Filter one batch. The schema is untouched and surviving rows keep
    /// their relative order.
    pub fn apply(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let indices = self.column_indices(batch.schema_ref())?;
        if indices.is_empty() || batch.num_rows() == 0 {
            return Ok(batch.clone());
        }
        let required = self.required_non_null(indices.len());

        let mut non_null = vec![0usize; batch.num_rows()];
        for &i in &indices {
            let valid = is_not_null(batch.column(i).as_ref())
                .with_context(|| format!("checking nulls in column {}", batch.schema().field(i).name()))?;
            for (row, is_valid) in valid.values().iter().enumerate() {
                if is_valid {
                    non_null[row] += 1;
                }
            }
        }

        let keep: BooleanArray = non_null.iter().map(|&n| Some(n >= required)).collect();
        filter_record_batch(batch, &keep).context("filtering null rows")
    }

    /// Filter every batch of `table` in parallel on the current rayon pool.
    pub fn apply_table(&self, table: &Table) -> Result<Table> {
        // validate the subset even when there are no batches to filter
        self.column_indices(table.schema())?;
        let batches = table
            .batches()
            .par_iter()
            .map(|b| self.apply(b))
            .collect::<Result<Vec<_>>>()?;
        Ok(Table::new(table.schema_arc(), batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::{
        array::{ArrayRef, Int64Array, StringArray},
        datatypes::{DataType, Field},
    };
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("player", DataType::Utf8, true),
            Field::new("team", DataType::Utf8, true),
            Field::new("pts", DataType::Int64, true),
        ]));
        let player: ArrayRef = Arc::new(StringArray::from(vec![
            Some("Curry"),
            Some("James"),
            None,
            Some("Jokic"),
            None,
        ]));
        let team: ArrayRef = Arc::new(StringArray::from(vec![
            Some("GSW"),
            None,
            None,
            Some("DEN"),
            Some("BOS"),
        ]));
        let pts: ArrayRef = Arc::new(Int64Array::from(vec![
            Some(30),
            Some(25),
            None,
            None,
            Some(12),
        ]));
        RecordBatch::try_new(schema, vec![player, team, pts]).unwrap()
    }

    fn players(batch: &RecordBatch) -> Vec<Option<String>> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    #[test]
    fn default_drops_rows_with_any_null() -> Result<()> {
        let out = DropNa::default().apply(&batch())?;
        assert_eq!(out.num_rows(), 1);
        assert_eq!(players(&out), vec![Some("Curry".to_string())]);
        assert_eq!(out.schema(), batch().schema());
        Ok(())
    }

    #[test]
    fn how_all_drops_only_fully_null_rows() -> Result<()> {
        let policy = DropNa {
            how: How::All,
            ..Default::default()
        };
        let out = policy.apply(&batch())?;
        assert_eq!(out.num_rows(), 4);
        Ok(())
    }

    #[test]
    fn thresh_overrides_how() -> Result<()> {
        let policy = DropNa {
            how: How::All,
            thresh: Some(2),
            subset: None,
        };
        let out = policy.apply(&batch())?;
        assert_eq!(
            players(&out),
            vec![
                Some("Curry".to_string()),
                Some("James".to_string()),
                Some("Jokic".to_string()),
                None,
            ]
        );
        Ok(())
    }

    #[test]
    fn subset_limits_considered_columns() -> Result<()> {
        let policy = DropNa {
            subset: Some(vec!["player".into()]),
            ..Default::default()
        };
        let out = policy.apply(&batch())?;
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.num_columns(), 3);
        Ok(())
    }

    #[test]
    fn unknown_subset_column_is_an_error() {
        let policy = DropNa {
            subset: Some(vec!["rebounds".into()]),
            ..Default::default()
        };
        let err = policy.apply(&batch()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::UnknownColumn { column }) if column == "rebounds"
        ));
    }

    #[test]
    fn batch_without_nulls_is_unchanged() -> Result<()> {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Utf8, true)]));
        let input = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec!["x", "y"])) as ArrayRef],
        )?;
        let out = DropNa::default().apply(&input)?;
        assert_eq!(out, input);
        Ok(())
    }
}
