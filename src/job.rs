//! The batch pipeline: list CSV inputs, read them into one table, drop rows
//! with nulls, write the result as Parquet.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    config::JobConfig,
    ingest::{read_table, resolve_inputs},
    session::{Session, SessionGuard},
    write::write_table,
};

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub app_name: String,
    pub run_id: String,
    pub files_read: usize,
    pub bytes_read: u64,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_dropped: usize,
    pub parts_written: usize,
    pub bytes_written: u64,
    pub output: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatchJob {
    config: JobConfig,
}

impl BatchJob {
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Acquire the session for `app_name`, run the pipeline and stop the
    /// session again, whether or not the run succeeded.
    pub async fn run(&self) -> Result<JobSummary> {
        self.config.validate()?;
        let session = SessionGuard::new(
            Session::builder()
                .app_name(self.config.app_name.clone())
                .parallelism(self.config.parallelism)
                .get_or_create()
                .context("starting session")?,
        );
        self.run_in(&session).await
    }

    /// Run the pipeline inside a session the caller manages.
    #[instrument(level = "info", skip_all, fields(app = %session.app_name(), run_id))]
    pub async fn run_in(&self, session: &Session) -> Result<JobSummary> {
        session.ensure_live()?;
        let start = Instant::now();
        let run_id = new_run_id();
        tracing::Span::current().record("run_id", run_id.as_str());
        info!(
            input = %self.config.input.location,
            output = %self.config.output.location,
            "job started"
        );

        // ─── 1) read ──────────────────────────────────────────────────────
        let inputs = resolve_inputs(session, &self.config.input).await?;
        let table = read_table(
            session,
            &inputs,
            &self.config.csv,
            self.config.input.fetch_concurrency,
        )
        .await?;
        let rows_read = table.num_rows();

        // ─── 2) drop rows with nulls ──────────────────────────────────────
        let policy = self.config.dropna.clone();
        let cleaned = session
            .run_cpu(move || policy.apply_table(&table))
            .await??;
        let rows_written = cleaned.num_rows();
        info!(
            rows_read,
            rows_dropped = rows_read - rows_written,
            "dropped rows with nulls"
        );

        // ─── 3) write ─────────────────────────────────────────────────────
        let outcome = write_table(session, &cleaned, &self.config.output, &run_id).await?;

        let summary = JobSummary {
            app_name: session.app_name().to_string(),
            run_id,
            files_read: inputs.files.len(),
            bytes_read: inputs.total_bytes(),
            rows_read,
            rows_written,
            rows_dropped: rows_read - rows_written,
            parts_written: outcome.parts.len(),
            bytes_written: outcome.bytes,
            output: self.config.output.location.clone(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            files = summary.files_read,
            rows = summary.rows_written,
            parts = summary.parts_written,
            elapsed_ms = summary.elapsed_ms,
            "job finished"
        );
        Ok(summary)
    }
}

/// Run the job with the built-in defaults: every CSV in the team bucket,
/// cleaned and written to `output/final_parquet/`.
pub async fn run() -> Result<JobSummary> {
    BatchJob::new(JobConfig::default()).run().await
}

fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::{
        array::{Array, Int64Array, StringArray},
        datatypes::DataType,
        record_batch::RecordBatch,
    };
    use futures::TryStreamExt;
    use object_store::{memory::InMemory, path::Path, ObjectStore, PutPayload};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use crate::error::JobError;

    fn init_test_logging() {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,csvclean=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn config(app: &str) -> JobConfig {
        let mut config = JobConfig::default();
        config.app_name = app.to_string();
        config.input.location = "memory:///landing/*.csv".to_string();
        config.output.location = "memory:///output/final_parquet/".to_string();
        config
    }

    async fn store_with(objects: &[(&str, &str)]) -> Result<Arc<InMemory>> {
        let store = Arc::new(InMemory::new());
        for (path, body) in objects {
            store
                .put(&Path::from(*path), PutPayload::from(body.as_bytes().to_vec()))
                .await?;
        }
        Ok(store)
    }

    fn session(app: &str, store: &Arc<InMemory>) -> Result<SessionGuard> {
        let session = SessionGuard::new(Session::builder().app_name(app).get_or_create()?);
        session.register_store("memory://", store.clone())?;
        Ok(session)
    }

    async fn part_files(store: &InMemory) -> Result<Vec<String>> {
        let prefix = Path::from("output/final_parquet");
        let mut names: Vec<String> = store
            .list(Some(&prefix))
            .map_ok(|m| m.location.to_string())
            .try_collect()
            .await?;
        names.retain(|n| n.ends_with(".parquet"));
        names.sort();
        Ok(names)
    }

    async fn read_output(store: &InMemory) -> Result<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        for name in part_files(store).await? {
            let bytes = store.get(&Path::from(name)).await?.bytes().await?;
            for batch in ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()? {
                batches.push(batch?);
            }
        }
        Ok(batches)
    }

    fn column(batches: &[RecordBatch], i: usize) -> Vec<Option<String>> {
        batches
            .iter()
            .flat_map(|b| {
                let col = b.column(i).as_any().downcast_ref::<StringArray>().unwrap();
                (0..col.len())
                    .map(|r| col.is_valid(r).then(|| col.value(r).to_string()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn drops_rows_with_empty_fields() -> Result<()> {
        init_test_logging();
        let store = store_with(&[("landing/games.csv", "a,b\n1,2\n,3\n")]).await?;
        let session = session("job-dropna-test", &store)?;

        let summary = BatchJob::new(config("job-dropna-test")).run_in(&session).await?;
        assert_eq!(summary.files_read, 1);
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.rows_written, 1);
        assert_eq!(summary.rows_dropped, 1);
        assert_eq!(summary.parts_written, 1);

        let batches = read_output(&store).await?;
        assert_eq!(column(&batches, 0), vec![Some("1".to_string())]);
        assert_eq!(column(&batches, 1), vec![Some("2".to_string())]);
        assert!(store
            .head(&Path::from("output/final_parquet/_SUCCESS"))
            .await
            .is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn empty_strings_survive_without_null_values() -> Result<()> {
        let store = store_with(&[("landing/games.csv", "a,b\n1,2\n,3\n")]).await?;
        let session = session("job-no-nulls-test", &store)?;

        let mut config = config("job-no-nulls-test");
        config.csv.null_values.clear();
        let summary = BatchJob::new(config).run_in(&session).await?;
        assert_eq!(summary.rows_written, 2);

        let batches = read_output(&store).await?;
        assert_eq!(
            column(&batches, 0),
            vec![Some("1".to_string()), Some(String::new())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn all_rows_dropped_keeps_schema() -> Result<()> {
        let store = store_with(&[("landing/games.csv", "player,team\nCurry,\n,GSW\n")]).await?;
        let session = session("job-all-dropped-test", &store)?;

        let summary = BatchJob::new(config("job-all-dropped-test")).run_in(&session).await?;
        assert_eq!(summary.rows_written, 0);
        assert_eq!(summary.parts_written, 1);

        let names = part_files(&store).await?;
        let bytes = store.get(&Path::from(names[0].as_str())).await?.bytes().await?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let fields: Vec<&String> = builder.schema().fields().iter().map(|f| f.name()).collect();
        assert_eq!(fields, vec!["player", "team"]);
        Ok(())
    }

    #[tokio::test]
    async fn inferred_column_types_reach_parquet() -> Result<()> {
        let store = store_with(&[(
            "landing/box_scores.csv",
            "player,pts,fg_pct\nCurry,30,0.5\nJames,,0.4\nJokic,27,0.61\n",
        )])
        .await?;
        let session = session("job-typed-test", &store)?;

        let mut config = config("job-typed-test");
        config.csv.infer_types = true;
        let summary = BatchJob::new(config).run_in(&session).await?;
        assert_eq!(summary.rows_written, 2);

        let names = part_files(&store).await?;
        let bytes = store.get(&Path::from(names[0].as_str())).await?.bytes().await?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let types: Vec<(String, DataType)> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| (f.name().clone(), f.data_type().clone()))
            .collect();
        assert_eq!(
            types,
            vec![
                ("player".to_string(), DataType::Utf8),
                ("pts".to_string(), DataType::Int64),
                ("fg_pct".to_string(), DataType::Float64),
            ]
        );

        let batches: Vec<RecordBatch> = builder.build()?.collect::<Result<_, _>>()?;
        let pts: Vec<Option<i64>> = batches
            .iter()
            .flat_map(|b| {
                b.column(1)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .iter()
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(pts, vec![Some(30), Some(27)]);
        Ok(())
    }

    #[tokio::test]
    async fn rerun_produces_identical_output() -> Result<()> {
        let store = store_with(&[
            ("landing/a.csv", "player,pts\nCurry,30\nJames,\n"),
            ("landing/b.csv", "player,pts\nJokic,27\n"),
        ])
        .await?;
        let session = session("job-rerun-test", &store)?;
        let job = BatchJob::new(config("job-rerun-test"));

        job.run_in(&session).await?;
        let first = read_output(&store).await?;
        job.run_in(&session).await?;
        let second = read_output(&store).await?;

        assert_eq!(part_files(&store).await?.len(), 1);
        assert_eq!(first, second);
        assert_eq!(
            column(&second, 0),
            vec![Some("Curry".to_string()), Some("Jokic".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_read_keeps_previous_output() -> Result<()> {
        init_test_logging();
        let store = store_with(&[
            ("landing/a.csv", "player,pts\nCurry,30\n"),
            ("output/final_parquet/part-00000-old.snappy.parquet", "previous"),
        ])
        .await?;
        let session = session("job-malformed-test", &store)?;
        store
            .put(
                &Path::from("landing/b.csv"),
                PutPayload::from_static(b"player,pts\nJames,25,extra\n"),
            )
            .await?;

        let result = BatchJob::new(config("job-malformed-test")).run_in(&session).await;
        assert!(result.is_err());
        assert_eq!(
            part_files(&store).await?,
            vec!["output/final_parquet/part-00000-old.snappy.parquet"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_the_session() -> Result<()> {
        let store = store_with(&[("landing/a.csv", "x\n1\n")]).await?;
        let session = session("job-stop-test", &store)?;

        BatchJob::new(config("job-stop-test")).run().await?;
        assert!(session.is_stopped());
        assert_eq!(part_files(&store).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn run_rejects_invalid_config_before_starting() {
        let mut config = config("job-invalid-test");
        config.output.location = config.input.location.clone();
        let err = BatchJob::new(config).run().await.unwrap_err();
        assert!(err.downcast_ref::<JobError>().is_some());
    }

    #[tokio::test]
    async fn stopped_session_is_refused() -> Result<()> {
        let store = store_with(&[("landing/a.csv", "x\n1\n")]).await?;
        let session = session("job-stopped-test", &store)?;
        session.stop();

        let err = BatchJob::new(config("job-stopped-test"))
            .run_in(&session)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::SessionStopped { .. })
        ));
        Ok(())
    }
}
