use crate::schema::StarTable;
use crate::storage::OutputLocation;
use crate::utils::paths::TablePaths;
use arrow::datatypes::DataType;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use datafusion::common::config::TableParquetOptions;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::logical_expr::{cast, when};
use datafusion::prelude::*;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Directory value Hive-style readers expect for a null partition key.
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Contents of a table's `_SUCCESS` marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMarker {
    pub table: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    pub partition_columns: Vec<String>,
    /// Data files relative to the table directory.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteSummary {
    pub table: String,
    pub row_count: usize,
    pub files: usize,
    /// Objects of the previous version that were removed.
    pub replaced: usize,
}

/// Destination for finished star schema tables.
///
/// A table is complete only while `<table>/_SUCCESS` exists. During a
/// publish, or after one fails, the directory may hold a mix of old and new
/// files without a marker; readers must check the marker first.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Replaces `table` with the contents of `df`.
    async fn write_table(&self, table: StarTable, df: DataFrame) -> Result<WriteSummary>;

    /// Removes anything the run left behind besides published tables.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes each table as Parquet under a run-scoped staging prefix, then
/// publishes it over the previous version.
pub struct ParquetTableWriter {
    output: OutputLocation,
    run_id: String,
}

impl ParquetTableWriter {
    pub fn new(output: OutputLocation, run_id: impl Into<String>) -> Self {
        Self {
            output,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn parquet_options(&self, table: StarTable) -> TableParquetOptions {
        let mut options = TableParquetOptions::new();
        options
            .key_value_metadata
            .insert("sparkify.table".to_string(), Some(table.name().to_string()));
        options
            .key_value_metadata
            .insert("sparkify.run_id".to_string(), Some(self.run_id.clone()));
        options
    }

    async fn stage_and_publish(
        &self,
        table: StarTable,
        df: DataFrame,
        paths: &TablePaths,
    ) -> Result<WriteSummary> {
        let partition_columns: Vec<String> = table
            .partition_columns()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let df = partition_keys_as_strings(df, table.partition_columns())?;
        let row_count = df.clone().count().await?;

        let staging_url = self.output.url_for(&paths.staging_dir());
        debug!(table = %table, url = %staging_url, "Staging parquet files");
        df.write_parquet(
            &staging_url,
            DataFrameWriteOptions::new().with_partition_by(partition_columns.clone()),
            Some(self.parquet_options(table)),
        )
        .await?;

        let staging_prefix = self.output.path_for(&paths.staging_dir());
        let staged = self.output.list(&paths.staging_dir()).await?;

        // Unpublish first: from here until the marker lands the table reads as absent.
        self.output
            .delete_if_exists(&self.output.path_for(&paths.marker_file()))
            .await?;
        let previous = self.output.list(&paths.table_dir()).await?;

        // New files land next to the old ones; the old version is swept only
        // once every staged file is in place.
        let table_prefix = self.output.path_for(&paths.table_dir());
        let mut files = Vec::with_capacity(staged.len());
        let mut published = Vec::with_capacity(staged.len());
        for from in &staged {
            let relative: ObjectPath = from
                .prefix_match(&staging_prefix)
                .ok_or_else(|| {
                    Error::Storage(format!("{} is outside {}", from, staging_prefix))
                })?
                .collect();
            let to: ObjectPath = table_prefix.parts().chain(relative.parts()).collect();
            self.output.store().rename(from, &to).await?;
            files.push(relative.to_string());
            published.push(to);
        }

        let mut replaced = 0;
        for old in previous.iter().filter(|old| !published.contains(old)) {
            self.output.delete_if_exists(old).await?;
            replaced += 1;
        }
        self.output.prune_empty_dirs(&paths.table_dir())?;

        let marker = TableMarker {
            table: table.name().to_string(),
            run_id: self.run_id.clone(),
            created_at: Utc::now(),
            row_count,
            partition_columns,
            files,
        };
        let body = Bytes::from(serde_json::to_vec_pretty(&marker)?);
        self.output
            .store()
            .put(&self.output.path_for(&paths.marker_file()), body.into())
            .await?;

        Ok(WriteSummary {
            table: marker.table,
            row_count,
            files: marker.files.len(),
            replaced,
        })
    }
}

#[async_trait]
impl TableSink for ParquetTableWriter {
    async fn write_table(&self, table: StarTable, df: DataFrame) -> Result<WriteSummary> {
        validate_schema(table, &df)?;

        let paths = TablePaths::new(&self.run_id, table.name());
        let result = self.stage_and_publish(table, df, &paths).await;

        if let Err(e) = self.output.delete_all(&paths.staging_dir()).await {
            warn!(table = %table, error = %e, "Failed to clean up staged files");
        }

        match result {
            Ok(summary) => {
                info!(
                    table = %table,
                    rows = summary.row_count,
                    files = summary.files,
                    replaced = summary.replaced,
                    "Published table"
                );
                Ok(summary)
            }
            Err(e @ Error::Write { .. }) => Err(e),
            Err(e) => Err(Error::write(table.name(), e)),
        }
    }

    async fn finish(&self) -> Result<()> {
        let paths = TablePaths::new(&self.run_id, "");
        self.output.delete_all(&paths.run_staging_dir()).await?;
        Ok(())
    }
}

/// Checks column names, order and types against the declared table schema.
pub fn validate_schema(table: StarTable, df: &DataFrame) -> Result<()> {
    let expected = table.schema().fields();
    let actual = df.schema().fields();

    let names = |fields: &arrow::datatypes::Fields| {
        fields
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if expected.len() != actual.len()
        || expected
            .iter()
            .zip(actual.iter())
            .any(|(e, a)| e.name() != a.name())
    {
        return Err(Error::SchemaMismatch(format!(
            "table '{}' expects columns [{}], got [{}]",
            table,
            names(expected),
            names(actual)
        )));
    }

    for (e, a) in expected.iter().zip(actual.iter()) {
        if !types_compatible(e.data_type(), a.data_type()) {
            return Err(Error::SchemaMismatch(format!(
                "table '{}' column '{}' expects {}, got {}",
                table,
                e.name(),
                e.data_type(),
                a.data_type()
            )));
        }
    }

    Ok(())
}

fn types_compatible(expected: &DataType, actual: &DataType) -> bool {
    let is_string = |t: &DataType| {
        matches!(t, DataType::Utf8 | DataType::Utf8View | DataType::LargeUtf8)
    };
    expected == actual || (is_string(expected) && is_string(actual))
}

/// Hive directory names are strings; null keys go to the default partition.
fn partition_keys_as_strings(df: DataFrame, partition_columns: &[&str]) -> Result<DataFrame> {
    if partition_columns.is_empty() {
        return Ok(df);
    }

    let exprs: Vec<Expr> = df
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = field.name();
            if partition_columns.contains(&name.as_str()) {
                when(ident(name).is_null(), lit(NULL_PARTITION))
                    .otherwise(cast(ident(name), DataType::Utf8))
                    .map(|expr| expr.alias(name))
            } else {
                Ok(ident(name))
            }
        })
        .collect::<std::result::Result<_, _>>()?;

    Ok(df.select(exprs)?)
}
