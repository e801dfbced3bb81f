use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db::migrations::Target;

#[derive(Parser, Debug)]
#[command(name = "microblog", about = "A small microblog")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Path to data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the web application (default)
    Serve,

    /// Manage database schema revisions
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DbCommand {
    /// Apply revisions up to the target (head, a revision id, or +N)
    Upgrade {
        #[arg(default_value = "head", allow_hyphen_values = true)]
        target: Target,
    },

    /// Revert revisions down to the target (base, a revision id, or -N)
    Downgrade {
        #[arg(default_value = "-1", allow_hyphen_values = true)]
        target: Target,
    },

    /// Show the revision the database is at
    Current,

    /// List revisions from root to head
    History,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// Upgrade to the newest revision when the server starts.
    pub auto_migrate: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            auto_migrate: true,
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(cli);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref host) = cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }

        if config.database.path.is_none() {
            config.database.path = Some(data_dir.join("microblog.db"));
        }

        Ok(config)
    }

    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".microblog")
        })
    }

    pub fn db_path(&self) -> &Path {
        self.database
            .path
            .as_deref()
            .unwrap_or(Path::new("microblog.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(data_dir: Option<PathBuf>) -> Cli {
        Cli {
            config: None,
            host: None,
            port: None,
            data_dir,
            command: None,
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert!(config.database.path.is_none());
        assert!(config.database.auto_migrate);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli = cli(Some(PathBuf::from("/tmp/test-microblog")));
        assert_eq!(Config::data_dir(&cli), PathBuf::from("/tmp/test-microblog"));
    }

    #[test]
    fn data_dir_defaults_to_dot_microblog() {
        assert!(Config::data_dir(&cli(None)).ends_with(".microblog"));
    }

    #[test]
    fn load_with_no_config_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&cli(Some(tmp.path().to_path_buf()))).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.db_path(), tmp.path().join("microblog.db"));
    }

    #[test]
    fn load_reads_toml_and_cli_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[server]
host = "192.168.1.1"
port = 9000

[database]
path = "/var/lib/microblog/app.db"
auto_migrate = false
"#,
        )
        .unwrap();

        let mut args = cli(Some(tmp.path().to_path_buf()));
        args.config = Some(config_path.clone());
        let config = Config::load(&args).unwrap();
        assert_eq!(config.server.host, "192.168.1.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.db_path(), Path::new("/var/lib/microblog/app.db"));
        assert!(!config.database.auto_migrate);

        args.port = Some(4000);
        let config = Config::load(&args).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "192.168.1.1");
    }

    #[test]
    fn parses_db_subcommands() {
        let cli = Cli::parse_from(["microblog", "db", "upgrade"]);
        assert_eq!(
            cli.command,
            Some(Command::Db(DbCommand::Upgrade { target: Target::Head }))
        );

        let cli = Cli::parse_from(["microblog", "db", "downgrade"]);
        assert_eq!(
            cli.command,
            Some(Command::Db(DbCommand::Downgrade {
                target: Target::Relative(-1)
            }))
        );

        let cli = Cli::parse_from(["microblog", "db", "downgrade", "a934000a9b42"]);
        assert_eq!(
            cli.command,
            Some(Command::Db(DbCommand::Downgrade {
                target: Target::Revision("a934000a9b42".into())
            }))
        );

        let cli = Cli::parse_from(["microblog", "serve", "--port", "8080"]);
        assert_eq!(cli.command, Some(Command::Serve));
        assert_eq!(cli.port, Some(8080));
    }
}
