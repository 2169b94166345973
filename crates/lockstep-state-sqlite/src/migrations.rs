/// Generate SQL migrations for the SQLite commit store
///
/// `workflow_commits` holds every commit record; `workflow_latest` points at
/// the newest record of each instance and carries its status for recovery
/// scans. Each entry is a single statement and safe to re-run.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "20250101000000_workflow_commits",
            r#"
            CREATE TABLE IF NOT EXISTS workflow_commits (
                workflow_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                PRIMARY KEY (workflow_id, sequence)
            )
            "#,
        ),
        (
            "20250101000001_workflow_latest",
            r#"
            CREATE TABLE IF NOT EXISTS workflow_latest (
                workflow_id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        ),
        (
            "20250101000002_workflow_latest_status",
            "CREATE INDEX IF NOT EXISTS idx_workflow_latest_status ON workflow_latest(status)",
        ),
    ]
}
