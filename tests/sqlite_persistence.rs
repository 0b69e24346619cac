use objectdb::engine::migration::{Migration, MigrationOp};
use objectdb::engine::store::{DatabaseInfo, SqliteBackend};
use objectdb::{Backend, Connection, MigrationRegistry};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_records_and_schema_survive_restart() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Lay out migrations on disk
    let root = tempfile::tempdir()?;
    let migrations = root.path().join("migrations");
    Migration::new("admins")
        .add_op(MigrationOp::CreateCollection {
            name: "admins".to_string(),
            key_path: "id".to_string(),
            auto_increment: false,
        })
        .save(&migrations.join("App").join("ver_1"), 1)?;
    Migration::new("admins_by_email")
        .add_op(MigrationOp::CreateIndex {
            collection: "admins".to_string(),
            name: "by_email".to_string(),
            key_path: "email".to_string(),
            unique: true,
        })
        .save(&migrations.join("App").join("ver_2"), 1)?;

    let registry = MigrationRegistry::load_dir(&migrations)?;
    assert_eq!(registry.versions("App"), vec![1, 2]);

    let db_path = root.path().join("data").join("objectdb.db");

    // 2. First process: create at version 1 and write
    {
        let backend = Arc::new(SqliteBackend::new(&db_path)?);
        let conn = Connection::new(backend, "App", 1)?;
        conn.open_with_registry(&registry).await?;
        conn.prepare_query("admins", None)
            .insert_many(&[
                json!({ "id": 1, "email": "a@example.com" }),
                json!({ "id": 2, "email": "b@example.com" }),
            ])
            .await?;
        conn.close()?;
    }

    // 3. Second process: upgrade to version 2 and read back
    let backend = Arc::new(SqliteBackend::new(&db_path)?);
    let conn = Connection::new(backend.clone(), "App", 2)?;
    let handle = conn.open_with_registry(&registry).await?;

    assert!(conn.upgrade_needed());
    assert!(!conn.initialization_needed());
    assert_eq!(conn.observed_version(), Some(2));
    assert_eq!(handle.index_names("admins")?, vec!["by_email".to_string()]);

    let by_email = conn.prepare_query("admins", Some("by_email"));
    assert_eq!(
        by_email.find("b@example.com").await?,
        Some(json!({ "id": 2, "email": "b@example.com" }))
    );
    conn.close()?;

    assert_eq!(
        backend.databases().await?,
        vec![DatabaseInfo {
            name: "App".to_string(),
            version: 2
        }]
    );
    Ok(())
}

#[tokio::test]
async fn test_drop_removes_persisted_database() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let backend = Arc::new(SqliteBackend::new(&root.path().join("objectdb.db"))?);

    let conn = Connection::new(backend.clone(), "Scratch", 1)?;
    conn.open(|conn, _| async move {
        conn.migrate(&[objectdb::MigrationStep::create_collection(
            "items",
            objectdb::store::CollectionOptions::key_path("id"),
        )])
        .await
    })
    .await?;
    conn.prepare_query("items", None).insert(&json!({ "id": "x" })).await?;
    conn.close()?;

    conn.drop_database().await?;
    assert!(backend.databases().await?.is_empty());

    // Recreated from scratch
    let handle = conn.open(|_, old| async move {
        assert_eq!(old, 0);
        Ok(())
    })
    .await?;
    assert!(conn.initialization_needed());
    assert!(handle.collection_names()?.is_empty());
    conn.close()?;
    Ok(())
}
