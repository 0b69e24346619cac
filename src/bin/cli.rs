//! ObjectDB CLI - Main entry point for the CLI binary
//!
//! Every command loads objectdb.config.json from the project directory,
//! opens the selected connection (running pending migrations) and closes
//! it again before exiting.

use anyhow::{bail, Context, Result};
use clap::Parser;
use objectdb::engine::{
    cli::{
        formatter::{plural, processed, CliFormatter},
        parse_key, Cli, Commands, MigrateAction, OutputFormat,
    },
    config::Config,
    console::default_sink,
    migration::Migration,
    Connection,
};
use serde_json::{json, Value};
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("objectdb=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;
    let key = cli.connection.as_deref();

    match cli.command {
        Commands::Init { name } => cmd_init(&project_dir, &name, json_output),
        Commands::Status => cmd_status(&project_dir, key, json_output).await,
        Commands::Databases => cmd_databases(&project_dir, json_output).await,
        Commands::Migrate { action } => cmd_migrate(action, &project_dir, key, json_output),
        Commands::Insert { collection, file } => {
            let records = read_records(&file)?;
            let conn = connect(&project_dir, key).await?;
            conn.prepare_query(&collection, None).insert_many(&records).await?;
            conn.close()?;
            report(json_output, "insert", &collection, records.len());
            Ok(())
        }
        Commands::Update { collection, file } => {
            let records = read_records(&file)?;
            let conn = connect(&project_dir, key).await?;
            conn.prepare_query(&collection, None).update_many(&records).await?;
            conn.close()?;
            report(json_output, "update", &collection, records.len());
            Ok(())
        }
        Commands::Find { collection, key: raw, index } => {
            let conn = connect(&project_dir, key).await?;
            let found = conn
                .prepare_query(&collection, index.as_deref())
                .find(parse_key(&raw))
                .await?;
            conn.close()?;

            if json_output {
                CliFormatter::json(&found.unwrap_or(Value::Null));
            } else if let Some(record) = found {
                CliFormatter::record(&record);
            } else {
                CliFormatter::warning(&format!("No record for {} in '{}'", raw, collection));
            }
            Ok(())
        }
        Commands::WhereIn { collection, keys, index } => {
            let conn = connect(&project_dir, key).await?;
            let found = conn
                .prepare_query(&collection, index.as_deref())
                .where_in(keys.iter().map(|k| parse_key(k)))
                .await?;
            conn.close()?;

            if json_output {
                CliFormatter::json(&Value::Array(found));
            } else {
                CliFormatter::header(&format!(
                    "{} of {} in '{}'",
                    plural(found.len(), "record"),
                    plural(keys.len(), "key"),
                    collection
                ));
                for record in &found {
                    CliFormatter::record(record);
                }
            }
            Ok(())
        }
        Commands::Delete { collection, keys } => {
            let conn = connect(&project_dir, key).await?;
            conn.prepare_query(&collection, None)
                .delete_many(keys.iter().map(|k| parse_key(k)))
                .await?;
            conn.close()?;
            report(json_output, "delete", &collection, keys.len());
            Ok(())
        }
        Commands::Drop => cmd_drop(&project_dir, key, json_output).await,
    }
}

fn cmd_init(project_dir: &Path, name: &str, json: bool) -> Result<()> {
    if Config::load(project_dir).is_ok() {
        bail!("Config already exists in {}", project_dir.display());
    }

    std::fs::create_dir_all(project_dir)?;
    let config = Config::default_for_database(name);
    config.save(project_dir)?;
    if let Some(dir) = &config.migrations {
        std::fs::create_dir_all(project_dir.join(dir).join(name))?;
    }

    if json {
        CliFormatter::json(&json!({
            "success": true,
            "project_dir": project_dir.display().to_string(),
            "database": name,
        }));
    } else {
        CliFormatter::success(&format!("Created config for database '{}'", name));
        CliFormatter::kv("Project", &project_dir.display().to_string());
        CliFormatter::item("objectdb migrate create initial_schema");
        CliFormatter::item("objectdb status");
    }
    Ok(())
}

async fn cmd_status(project_dir: &Path, key: Option<&str>, json: bool) -> Result<()> {
    let conn = connect(project_dir, key).await?;
    let collections = conn
        .handle()
        .map(|handle| handle.collection_names())
        .transpose()?
        .unwrap_or_default();

    if json {
        CliFormatter::json(&json!({
            "database": conn.name(),
            "requested_version": conn.version(),
            "observed_version": conn.observed_version(),
            "upgraded": conn.upgrade_needed(),
            "created": conn.initialization_needed(),
            "collections": collections,
        }));
    } else {
        CliFormatter::header(&format!("Database '{}'", conn.name()));
        CliFormatter::kv("Requested version", &conn.version().to_string());
        CliFormatter::kv(
            "Stored version",
            &conn
                .observed_version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if conn.initialization_needed() {
            CliFormatter::success("Database created");
        } else if conn.upgrade_needed() {
            CliFormatter::success("Migrations applied");
        }
        CliFormatter::kv("Collections", &plural(collections.len(), "collection"));
        for name in &collections {
            CliFormatter::item(name);
        }
    }

    conn.close()?;
    Ok(())
}

async fn cmd_databases(project_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let backend = config.build_backend(project_dir)?;
    let databases = backend.databases().await?;

    if json {
        CliFormatter::json(&serde_json::to_value(&databases)?);
    } else {
        CliFormatter::header("Databases");
        if databases.is_empty() {
            CliFormatter::item("(none)");
        }
        for db in &databases {
            CliFormatter::item(&format!("{} (version {})", db.name, db.version));
        }
    }
    Ok(())
}

fn cmd_migrate(action: MigrateAction, project_dir: &Path, key: Option<&str>, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let entry = config.connection(key)?;
    let root = project_dir.join(
        config
            .migrations
            .as_deref()
            .context("No migrations directory configured")?,
    );

    match action {
        MigrateAction::Create { name, version } => {
            let version = version.unwrap_or(entry.version);
            let version_dir = root.join(&entry.name).join(format!("ver_{}", version));
            let ordinal = if version_dir.exists() {
                std::fs::read_dir(&version_dir)?.count() as u32 + 1
            } else {
                1
            };
            Migration::new(&name).save(&version_dir, ordinal)?;

            if json {
                CliFormatter::json(&json!({
                    "success": true,
                    "database": entry.name,
                    "version": version,
                    "dir": version_dir.display().to_string(),
                }));
            } else {
                CliFormatter::success(&format!(
                    "Created migration '{}' for {} version {}",
                    name, entry.name, version
                ));
                CliFormatter::kv("Directory", &version_dir.display().to_string());
            }
        }
        MigrateAction::List => {
            let registry = config.load_registry(project_dir)?;
            let versions = registry.versions(&entry.name);

            if json {
                let listing: Vec<Value> = versions
                    .iter()
                    .map(|v| {
                        let steps: Vec<&str> =
                            registry.steps(&entry.name, *v).iter().map(|s| s.name()).collect();
                        json!({ "version": v, "steps": steps })
                    })
                    .collect();
                CliFormatter::json(&json!({ "database": entry.name, "migrations": listing }));
            } else {
                CliFormatter::header(&format!("Migrations for '{}'", entry.name));
                if versions.is_empty() {
                    CliFormatter::item("(none)");
                }
                for v in versions {
                    for step in registry.steps(&entry.name, v) {
                        CliFormatter::item(&format!("ver_{}: {}", v, step.name()));
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_drop(project_dir: &Path, key: Option<&str>, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let backend = config.build_backend(project_dir)?;
    let conn = config.connect(backend, key, default_sink())?;
    conn.drop_database().await?;

    if json {
        CliFormatter::json(&json!({ "success": true, "dropped": conn.name() }));
    } else {
        CliFormatter::success(&format!("Dropped database '{}'", conn.name()));
    }
    Ok(())
}

async fn connect(project_dir: &Path, key: Option<&str>) -> Result<Connection> {
    let config = Config::load(project_dir)?;
    let backend = config.build_backend(project_dir)?;
    let registry = config.load_registry(project_dir)?;
    let conn = config.connect(backend, key, default_sink())?;
    conn.open_with_registry(&registry)
        .await
        .with_context(|| format!("Failed to open '{}'", conn.name()))?;
    Ok(conn)
}

fn read_records(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match serde_json::from_str(&content)? {
        Value::Array(records) => Ok(records),
        record @ Value::Object(_) => Ok(vec![record]),
        other => bail!("Expected a JSON object or array, found {}", other),
    }
}

fn report(json: bool, action: &str, collection: &str, count: usize) {
    if json {
        CliFormatter::json(&json!({
            "success": true,
            "action": action,
            "collection": collection,
            "processed": count
        }));
    } else {
        CliFormatter::success(&processed(action, collection, count));
    }
}
