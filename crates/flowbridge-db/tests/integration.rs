use flowbridge_db::{create_pool, run_migrations, DbRuntimeSettings};
use std::sync::{Arc, Barrier};

#[test]
fn db_initialization_works() {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 3);

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(
        tables,
        vec![
            "_flowbridge_migrations".to_string(),
            "flow_queue".to_string(),
            "flow_token_mappings".to_string(),
            "survey_submissions".to_string(),
        ]
    );
}

#[test]
fn concurrent_schema_setup_is_idempotent() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("concurrent.db");
    let path = path.to_str().expect("utf-8 path").to_string();

    const RUNNERS: usize = 8;
    let barrier = Arc::new(Barrier::new(RUNNERS));

    // Each runner gets its own pool, standing in for separate processes.
    let handles: Vec<_> = (0..RUNNERS)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let pool = create_pool(&path, DbRuntimeSettings::default())
                    .expect("failed to create pool");
                let conn = pool.get().expect("failed to get connection");
                barrier.wait();
                run_migrations(&conn).expect("concurrent migration run should succeed")
            })
        })
        .collect();

    let total_applied: usize = handles
        .into_iter()
        .map(|h| h.join().expect("runner should not panic"))
        .sum();
    assert_eq!(total_applied, 3, "each migration is applied exactly once");

    let pool = create_pool(&path, DbRuntimeSettings::default()).expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let recorded: i64 = conn
        .query_row("SELECT COUNT(*) FROM _flowbridge_migrations", [], |row| row.get(0))
        .expect("failed to count migrations");
    assert_eq!(recorded, 3);
}
