use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use korm::config::MigrationsSection;
use korm::{
    Configuration, KormBuilder, KormDatabase, KormError, MigrateStatus, MigrationsRunner,
    ServiceCollection,
};
use korm_migrations::{
    count_applied_migrations, latest_applied_migration, pending_scripts, DirectoryScriptsProvider,
    MigrationOptions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "appsettings.toml";

#[derive(Clone, Copy, ValueEnum)]
enum Command {
    Up,
    Status,
}

#[derive(Parser)]
#[command(name = "korm-migrate")]
#[command(about = "KORM SQL script migration tool")]
struct Args {
    /// Migration command to run
    #[arg(value_enum)]
    command: Command,

    /// Configuration file (TOML, JSON or YAML). Must exist when given;
    /// without the flag `appsettings.toml` is read if present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment variables with this prefix override the file,
    /// e.g. KORM_KORMMIGRATIONS__AUTOMIGRATE=true
    #[arg(long, default_value = "KORM_")]
    env_prefix: String,

    /// Folder of `<id>_<name>.sql` scripts [default: SqlScripts next to the executable]
    #[arg(short, long)]
    scripts: Option<PathBuf>,

    /// Apply migrations even when AutoMigrate is off
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("korm=info,korm_migrations=info,sqlx=warn")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Migration failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), KormError> {
    let (config_path, optional) = config_source(&args);
    let cfg = Configuration::builder()
        .add_file(&config_path, optional)
        .add_env_vars(args.env_prefix.clone())
        .build()?;
    let section = MigrationsSection::resolve(&cfg)?;

    match args.command {
        Command::Up => up(&args, &cfg, section).await,
        Command::Status => status(&args, section).await,
    }
}

/// The default file may be absent; an explicit `--config` may not.
fn config_source(args: &Args) -> (PathBuf, bool) {
    match &args.config {
        Some(path) => (path.clone(), false),
        None => (PathBuf::from(DEFAULT_CONFIG), true),
    }
}

fn configure_scripts(scripts: Option<&PathBuf>, options: &mut MigrationOptions) {
    match scripts {
        Some(dir) => {
            options.add_directory_scripts(dir.clone());
        }
        None => {
            options.add_scripts_provider(DirectoryScriptsProvider::entry_default());
        }
    }
}

async fn up(args: &Args, cfg: &Configuration, section: MigrationsSection) -> Result<(), KormError> {
    let scripts = args.scripts.clone();
    let builder = KormBuilder::new(ServiceCollection::new(), section.connection_string)?
        .add_korm_migrations_with(cfg, move |options| configure_scripts(scripts.as_ref(), options))?;

    if args.force && !builder.auto_migrate() {
        info!("AutoMigrate is off; applying because of --force");
        let runner = builder
            .services()
            .build_service_provider()
            .get_required_service::<Arc<dyn MigrationsRunner>>()?;
        return runner.migrate().await;
    }

    match builder.migrate().await? {
        MigrateStatus::Completed => info!("✅ migrations up to date"),
        MigrateStatus::Skipped => info!("AutoMigrate is off; nothing applied (use --force)"),
    }
    Ok(())
}

async fn status(args: &Args, section: MigrationsSection) -> Result<(), KormError> {
    let database = KormDatabase::new(section.connection_string)?;
    let mut options = MigrationOptions::new();
    configure_scripts(args.scripts.as_ref(), &mut options);
    let scripts = options.collect_scripts()?;

    let conn = database.connect_single().await?;
    let applied = count_applied_migrations(&conn).await?;
    let latest = latest_applied_migration(&conn).await?;
    conn.close().await?;

    let pending = pending_scripts(scripts, latest.as_ref().map(|m| m.id));

    println!("database:  {}", database.connection_settings().sanitized());
    println!("applied:   {applied}");
    match &latest {
        Some(m) => println!("latest:    {} {}", m.id, m.name),
        None => println!("latest:    -"),
    }
    println!("pending:   {}", pending.len());
    for script in &pending {
        println!("  {} {}", script.id, script.name);
    }
    Ok(())
}
