use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use microblog::config::{Cli, Command, Config, DbCommand};
use microblog::db;
use microblog::db::migrations::Migrator;
use microblog::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Db(cmd) => run_db_command(&config, cmd),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    if config.database.auto_migrate {
        let pool = db::create_pool(config.db_path())?;
        db::run_migrations(&pool)?;
    }

    let app = routes::router();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn run_db_command(config: &Config, cmd: DbCommand) -> anyhow::Result<()> {
    let pool = db::create_pool(config.db_path())?;
    let mut conn = pool.get()?;
    let migrator = Migrator::bundled()?;

    match cmd {
        DbCommand::Upgrade { target } => {
            let applied = migrator.upgrade(&mut conn, &target)?;
            if applied.is_empty() {
                println!("Nothing to upgrade");
            }
            for revision in applied {
                println!("Upgraded to {revision}");
            }
        }
        DbCommand::Downgrade { target } => {
            let reverted = migrator.downgrade(&mut conn, &target)?;
            if reverted.is_empty() {
                println!("Nothing to downgrade");
            }
            for revision in reverted {
                println!("Reverted {revision}");
            }
        }
        DbCommand::Current => match migrator.current(&conn)? {
            Some(revision) if Some(revision.as_str()) == migrator.head() => {
                println!("{revision} (head)")
            }
            Some(revision) => println!("{revision}"),
            None => println!("base"),
        },
        DbCommand::History => {
            for step in migrator.history() {
                println!(
                    "{} -> {}, {}",
                    step.down_revision().unwrap_or("<base>"),
                    step.revision(),
                    step.message()
                );
            }
        }
    }

    Ok(())
}
