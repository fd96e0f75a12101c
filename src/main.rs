// RU-PATH server binary. Parses flags/env, bootstraps the engine, and
// serves the HTTP API.

use clap::Parser;
use log::info;
use rupath::engine::server;
use rupath::{EngineConfig, EngineResult, EngineState};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rupath-server", version, about = "Grounded campus parking & bus assistant")]
struct Args {
    /// Path to the campus dataset JSON.
    #[arg(long, env = "RUPATH_DATASET", default_value = "data/campus.json")]
    dataset: PathBuf,

    /// SQLite session database path. Defaults to the platform data dir;
    /// pass --ephemeral-sessions for an in-memory store.
    #[arg(long, env = "RUPATH_SESSION_DB")]
    session_db: Option<PathBuf>,

    /// Keep sessions in memory only.
    #[arg(long)]
    ephemeral_sessions: bool,

    #[arg(long, env = "RUPATH_BIND", default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, env = "RUPATH_PORT", default_value_t = 5005)]
    port: u16,

    /// Seconds of inactivity before a session expires.
    #[arg(long, env = "RUPATH_SESSION_TIMEOUT", default_value_t = 1800)]
    session_timeout: i64,

    /// Embedding API base URL (Ollama or OpenAI-compatible). Omit to use
    /// keyword retrieval only.
    #[arg(long, env = "RUPATH_EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[arg(long, env = "RUPATH_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Generation API key. Omit for deterministic replies only.
    #[arg(long, env = "RUPATH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "RUPATH_GENERATION_URL")]
    generation_url: Option<String>,

    #[arg(long, env = "RUPATH_GENERATION_MODEL")]
    generation_model: Option<String>,
}

#[tokio::main]
async fn main() -> EngineResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = EngineConfig::default();
    config.dataset_path = args.dataset;
    config.session_timeout_secs = args.session_timeout;
    config.session_db_path = if args.ephemeral_sessions {
        None
    } else {
        args.session_db
            .or_else(|| dirs::data_dir().map(|d| d.join("rupath").join("sessions.db")))
    };
    config.embedding.base_url = args.embedding_url;
    if let Some(model) = args.embedding_model {
        config.embedding.model = model;
    }
    config.generation.api_key = args.api_key;
    if let Some(url) = args.generation_url {
        config.generation.base_url = url;
    }
    if let Some(model) = args.generation_model {
        config.generation.model = model;
    }

    let state = EngineState::bootstrap(config).await?;
    info!("[main] Engine ready — {} facts loaded", state.store.len());
    server::run(state, &args.bind, args.port).await
}
