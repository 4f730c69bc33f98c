use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use atelier::auth;
use atelier::db::OrdersDb;
use atelier::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "Workshop catalogue and production order backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to serve on
        #[arg(long, env = "ATELIER_PORT", default_value = "8080")]
        port: u16,

        /// Database path
        #[arg(long, env = "ATELIER_DB", default_value = "atelier.db")]
        db: PathBuf,

        /// Base URL of the image object store
        #[arg(long, env = "IMAGE_STORE_URL")]
        images_url: Option<String>,

        /// Bearer token for the image object store
        #[arg(long, env = "IMAGE_STORE_TOKEN")]
        images_token: Option<String>,

        /// Enable dev mode (permissive CORS, in-memory image store)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database and exit
    InitDb {
        /// Database path
        #[arg(long, env = "ATELIER_DB", default_value = "atelier.db")]
        db: PathBuf,
    },
    /// Create a user account
    AddUser {
        /// Login for the new account
        login: String,

        /// Password for the new account
        #[arg(long)]
        password: String,

        /// Grant the moderator role
        #[arg(long)]
        moderator: bool,

        /// Database path
        #[arg(long, env = "ATELIER_DB", default_value = "atelier.db")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db,
            images_url,
            images_token,
            dev,
        } => {
            let config = ServerConfig {
                port,
                db_path: db,
                images_url,
                images_token,
                dev_mode: dev,
            };
            start_server(config).await?;
        }
        Commands::InitDb { db } => {
            if let Some(parent) = db.parent() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            OrdersDb::new(&db).context("Failed to initialize database")?;
            println!("Database ready at {}", db.display());
        }
        Commands::AddUser {
            login,
            password,
            moderator,
            db,
        } => {
            let store = OrdersDb::new(&db).context("Failed to open database")?;
            let password_hash = auth::hash_password(&password)?;
            let user = store.create_user(&login, &password_hash, moderator)?;
            if user.is_moderator {
                println!("Created moderator {} (id {})", user.login, user.id);
            } else {
                println!("Created user {} (id {})", user.login, user.id);
            }
        }
    }

    Ok(())
}
