pub const STAGING_DIR: &str = "_staging";
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Relative locations used while writing one table during one run.
pub struct TablePaths {
    run_id: String,
    table: String,
}

impl TablePaths {
    pub fn new(run_id: &str, table: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            table: table.to_string(),
        }
    }

    pub fn run_staging_dir(&self) -> String {
        format!("{}/{}", STAGING_DIR, self.run_id)
    }

    pub fn staging_dir(&self) -> String {
        format!("{}/{}", self.run_staging_dir(), self.table)
    }

    pub fn table_dir(&self) -> String {
        self.table.clone()
    }

    pub fn marker_file(&self) -> String {
        format!("{}/{}", self.table, SUCCESS_MARKER)
    }
}
