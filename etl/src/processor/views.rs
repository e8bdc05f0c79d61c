use common::Result;
use datafusion::prelude::*;
use tracing::debug;
use uuid::Uuid;

/// Frames registered under unique names so concurrent stages can share one
/// `SessionContext`. Every name is deregistered on drop; plans built from the
/// views keep their own handle to the data.
pub struct TempViews<'a> {
    ctx: &'a SessionContext,
    names: Vec<String>,
}

impl<'a> TempViews<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        Self {
            ctx,
            names: Vec::new(),
        }
    }

    pub fn register(&mut self, label: &str, df: DataFrame) -> Result<String> {
        let name = format!("tmp_{}_{}", label, Uuid::new_v4().simple());
        self.ctx.register_table(name.as_str(), df.into_view())?;
        self.names.push(name.clone());
        Ok(name)
    }

    pub async fn sql(&self, query: &str) -> Result<DataFrame> {
        debug!(query, "Planning SQL");
        Ok(self.ctx.sql(query).await?)
    }
}

impl Drop for TempViews<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            let _ = self.ctx.deregister_table(name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::frame;
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;

    #[tokio::test]
    async fn test_views_are_deregistered_on_drop() {
        let ctx = SessionContext::new();
        let schema = Schema::new(vec![Field::new("x", DataType::Int64, true)]);
        let df = frame(&ctx, &schema, &[json!({"x": 1}), json!({"x": 2})]);

        let (name, result) = {
            let mut views = TempViews::new(&ctx);
            let name = views.register("numbers", df).unwrap();
            let result = views
                .sql(&format!("SELECT SUM(x) AS total FROM {}", name))
                .await
                .unwrap();
            (name, result)
        };

        assert!(!ctx.table_exist(name.as_str()).unwrap());
        // The plan still resolves after the view is gone.
        assert_eq!(result.count().await.unwrap(), 1);
    }
}
