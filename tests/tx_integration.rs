//! Integration tests for scoped transactions and table locks on a
//! file-backed database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use devflow_core::{Database, ErrorKind, LockTable, TxHelper, with_transaction};

mod support;
use support::setup_test_db;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn create_mapping_table(db: &Database) -> Result<(), sqlx::Error> {
    sqlx::query("CREATE TABLE project_mapping (project_name TEXT, table_name TEXT, row_id TEXT)")
        .execute(db.pool())
        .await?;
    Ok(())
}

async fn mapping_rows(db: &Database) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM project_mapping")
        .fetch_one(db.pool())
        .await?;
    Ok(count)
}

// ==================== Lock Tests ====================

#[tokio::test]
async fn test_lock_timeout_fails_within_bound() -> TestResult {
    let (db, _dir) = setup_test_db().await?;
    create_mapping_table(&db).await?;

    let mut holder = TxHelper::new(&db);
    holder.begin().await?;
    holder
        .lock_tables_timeout(Duration::from_secs(1), &[LockTable::exclusive("project_mapping")])
        .await?;

    let mut waiter = TxHelper::new(&db);
    waiter.begin().await?;
    let started = Instant::now();
    let error = waiter
        .lock_tables_timeout(Duration::from_millis(100), &[LockTable::shared("project_mapping")])
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));

    let failed: Result<(), _> = Err(error);
    waiter.end(&failed).await?;
    holder.end(&Ok::<(), devflow_core::EtlError>(())).await?;

    // The abandoned attempt must not keep the table locked.
    let mut later = TxHelper::new(&db);
    later.begin().await?;
    later
        .lock_tables_timeout(Duration::from_secs(1), &[LockTable::exclusive("project_mapping")])
        .await?;
    later.end(&Ok::<(), devflow_core::EtlError>(())).await?;
    Ok(())
}

#[tokio::test]
async fn test_exclusive_locks_serialize_units_of_work() -> TestResult {
    let (db, _dir) = setup_test_db().await?;
    create_mapping_table(&db).await?;
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    let workers = (0..4).map(|worker| {
        let db = db.clone();
        let active = active.clone();
        let overlap = overlap.clone();
        tokio::spawn(async move {
            let tables = [LockTable::exclusive("project_mapping")];
            with_transaction(&db, Duration::from_secs(5), &tables, move |conn| {
                Box::pin(async move {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    sqlx::query("INSERT INTO project_mapping VALUES ('demo', 'repos', ?)")
                        .bind(format!("repo-{worker}"))
                        .execute(&mut *conn)
                        .await?;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
        })
    });

    for handle in futures_util::future::join_all(workers).await {
        handle??;
    }
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert_eq!(mapping_rows(&db).await?, 4);
    Ok(())
}

// ==================== Rollback Tests ====================

#[tokio::test]
async fn test_panic_rolls_back_and_releases_lock() -> TestResult {
    let (db, _dir) = setup_test_db().await?;
    create_mapping_table(&db).await?;
    let tables = [LockTable::exclusive("project_mapping")];

    let result: Result<(), _> = with_transaction(&db, Duration::from_secs(1), &tables, |conn| {
        Box::pin(async move {
            sqlx::query("INSERT INTO project_mapping VALUES ('demo', 'repos', 'r1')")
                .execute(&mut *conn)
                .await?;
            panic!("converter bug");
        })
    })
    .await;

    let error = result.unwrap_err();
    assert!(error.to_string().contains("converter bug"));
    assert_eq!(mapping_rows(&db).await?, 0);

    // Lock was released: another unit of work can take it right away.
    with_transaction(&db, Duration::from_millis(200), &tables, |conn| {
        Box::pin(async move {
            sqlx::query("INSERT INTO project_mapping VALUES ('demo', 'repos', 'r2')")
                .execute(&mut *conn)
                .await?;
            Ok(())
        })
    })
    .await?;
    assert_eq!(mapping_rows(&db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_error_rolls_back_every_statement() -> TestResult {
    let (db, _dir) = setup_test_db().await?;
    create_mapping_table(&db).await?;

    let result: Result<(), _> = with_transaction(&db, Duration::from_secs(1), &[], |conn| {
        Box::pin(async move {
            sqlx::query("INSERT INTO project_mapping VALUES ('demo', 'repos', 'r1')")
                .execute(&mut *conn)
                .await?;
            sqlx::query("INSERT INTO missing_table VALUES (1)")
                .execute(&mut *conn)
                .await?;
            Ok(())
        })
    })
    .await;

    assert!(result.is_err());
    assert_eq!(mapping_rows(&db).await?, 0);
    Ok(())
}
