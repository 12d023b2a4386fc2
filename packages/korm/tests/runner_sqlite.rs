//! End-to-end migrations and ID generation against SQLite files.

use std::fs;

use korm::id_generator::SqlIdGenerator;
use korm::infra::locking::{sqlite_lock_path, BootstrapLock, SqliteFileLock};
use korm::migrations::{count_applied_migrations, MigrationOptions, ScriptError};
use korm::{
    Configuration, ConnectionSettings, IdGenerator, KormBuilder, KormDatabase, KormError,
    MigrateStatus, MigrationsRunner, ServiceCollection, SqlMigrationsRunner,
};
use korm_test_support::sqlite::TempSqlite;
use korm_test_support::test_logging;

fn migrations_config(db: &TempSqlite) -> Configuration {
    test_logging::init();
    Configuration::from_json_str(&format!(
        r#"{{ "KormMigrations": {{
            "AutoMigrate": true,
            "ConnectionString": {{ "ConnectionString": "{}", "ProviderName": "sqlite" }}
        }} }}"#,
        db.url()
    ))
    .unwrap()
}

fn schema_scripts(options: &mut MigrationOptions) {
    options.add_embedded_scripts([
        (
            "1_create_customers.sql",
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        ),
        (
            "2_create_invoices.sql",
            "CREATE TABLE invoices (id INTEGER PRIMARY KEY, \
             customer_id INTEGER NOT NULL REFERENCES customers(id))",
        ),
    ]);
}

async fn applied(db: &TempSqlite) -> usize {
    let database = KormDatabase::new(ConnectionSettings::new(db.url(), "sqlite")).unwrap();
    let conn = database.connect_single().await.unwrap();
    let count = count_applied_migrations(&conn).await.unwrap();
    conn.close().await.unwrap();
    count
}

#[tokio::test]
async fn builder_applies_scripts_once() {
    let db = TempSqlite::new();
    let cfg = migrations_config(&db);

    let builder = KormBuilder::new(ServiceCollection::new(), ConnectionSettings::new(db.url(), "sqlite"))
        .unwrap()
        .add_korm_migrations_with(&cfg, schema_scripts)
        .unwrap();

    assert_eq!(builder.migrate().await.unwrap(), MigrateStatus::Completed);
    assert_eq!(applied(&db).await, 2);

    assert_eq!(builder.migrate().await.unwrap(), MigrateStatus::Completed);
    assert_eq!(applied(&db).await, 2);
}

#[tokio::test]
async fn later_scripts_are_applied_on_next_run() {
    let db = TempSqlite::new();
    let cfg = migrations_config(&db);
    let connection = ConnectionSettings::new(db.url(), "sqlite");

    KormBuilder::new(ServiceCollection::new(), connection.clone())
        .unwrap()
        .add_korm_migrations_with(&cfg, schema_scripts)
        .unwrap()
        .migrate()
        .await
        .unwrap();

    KormBuilder::new(ServiceCollection::new(), connection)
        .unwrap()
        .add_korm_migrations_with(&cfg, |options| {
            schema_scripts(options);
            options.add_embedded_scripts([(
                "3_index_invoices.sql",
                "CREATE INDEX ix_invoices_customer ON invoices (customer_id)",
            )]);
        })
        .unwrap()
        .migrate()
        .await
        .unwrap();

    assert_eq!(applied(&db).await, 3);
}

#[tokio::test]
async fn scripts_from_directory() {
    let db = TempSqlite::new();
    let scripts = db.dir().join("SqlScripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(
        scripts.join("1_create_tags.sql"),
        "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
    )
    .unwrap();
    fs::write(scripts.join("README.txt"), "not a script").unwrap();

    let cfg = migrations_config(&db);
    let builder = KormBuilder::new(ServiceCollection::new(), ConnectionSettings::new(db.url(), "sqlite"))
        .unwrap()
        .add_korm_migrations_with(&cfg, move |options| {
            options.add_directory_scripts(scripts.clone());
        })
        .unwrap();

    builder.migrate().await.unwrap();
    assert_eq!(applied(&db).await, 1);
}

#[tokio::test]
async fn failed_script_surfaces_and_releases_lock() {
    let db = TempSqlite::new();
    let cfg = migrations_config(&db);

    let builder = KormBuilder::new(ServiceCollection::new(), ConnectionSettings::new(db.url(), "sqlite"))
        .unwrap()
        .add_korm_migrations_with(&cfg, |options| {
            options.add_embedded_scripts([
                ("1_ok.sql", "CREATE TABLE ok (id INTEGER PRIMARY KEY)"),
                ("2_broken.sql", "CREATE TABLE broken ("),
            ]);
        })
        .unwrap();

    let err = builder.migrate().await.unwrap_err();
    assert!(
        matches!(err, KormError::Migration(ScriptError::Apply { id: 2, .. })),
        "{err:?}"
    );
    assert_eq!(applied(&db).await, 1);

    let lock_path = sqlite_lock_path(&db.url()).unwrap();
    let guard = SqliteFileLock::new(&lock_path)
        .try_acquire()
        .await
        .unwrap()
        .expect("lock released after failure");
    guard.release().await.unwrap();
}

#[tokio::test]
async fn held_lock_times_out() {
    let db = TempSqlite::new();
    let lock_path = sqlite_lock_path(&db.url()).unwrap();
    let guard = SqliteFileLock::new(&lock_path)
        .try_acquire()
        .await
        .unwrap()
        .unwrap();

    let mut options = MigrationOptions::new();
    schema_scripts(&mut options);
    let runner = SqlMigrationsRunner::new(
        KormDatabase::new(ConnectionSettings::new(db.url(), "sqlite")).unwrap(),
        options,
    )
    .with_lock_timeout(std::time::Duration::from_millis(200));

    let err = runner.migrate().await.unwrap_err();
    assert!(matches!(err, KormError::Lock { .. }), "{err:?}");

    guard.release().await.unwrap();
    runner.migrate().await.unwrap();
    assert_eq!(applied(&db).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_runners_apply_each_script_once() {
    let db = TempSqlite::new();
    test_logging::init();

    let runner = || {
        let mut options = MigrationOptions::new();
        schema_scripts(&mut options);
        SqlMigrationsRunner::new(
            KormDatabase::new(ConnectionSettings::new(db.url(), "sqlite")).unwrap(),
            options,
        )
    };
    let (a, b) = (runner(), runner());

    let (ra, rb) = tokio::join!(a.migrate(), b.migrate());
    ra.unwrap();
    rb.unwrap();

    assert_eq!(applied(&db).await, 2);
}

#[tokio::test]
async fn id_generator_bootstrap_then_generate() {
    let db = TempSqlite::new();
    test_logging::init();

    let services = KormBuilder::new(ServiceCollection::new(), ConnectionSettings::new(db.url(), "sqlite"))
        .unwrap()
        .init_database_for_id_generator()
        .await
        .unwrap()
        .into_services()
        .unwrap();

    let database = services
        .build_service_provider()
        .get_required_service::<KormDatabase>()
        .unwrap();

    let mut generator = SqlIdGenerator::new(database, "invoices");
    assert_eq!(generator.next_id().await.unwrap(), 1);
    assert_eq!(generator.next_id().await.unwrap(), 2);
    generator.release().await.unwrap();
}
