use std::path::{Path, PathBuf};

use actix_web::{web, App, HttpServer};

mod config;
mod error;
mod handlers;
mod process;
mod relay;
mod resolver;
mod state;
mod util;

use crate::state::AppState;

/// `--config <path>` wins; otherwise `config.toml` is used when present.
fn config_path() -> Option<PathBuf> {
    let explicit = std::env::args()
        .skip_while(|a| a != "--config")
        .nth(1)
        .map(PathBuf::from);
    explicit.or_else(|| {
        let default = Path::new("config.toml");
        default.exists().then(|| default.to_path_buf())
    })
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cfg_path = config_path();
    let cfg = match config::AppConfig::load(cfg_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("[CONFIG] Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.download_dir) {
        log::error!(
            "[CONFIG] Cannot create download directory {}: {}",
            cfg.download_dir.display(),
            e
        );
        std::process::exit(1);
    }

    let bind_addr = cfg.bind_addr();
    log::info!("YouTube Audio Service listening on http://{}", bind_addr);
    log::info!("Downloads are written to {}", cfg.download_dir.display());

    let state = web::Data::new(AppState::new(cfg));

    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(state.clone())
            .configure(handlers::routes)
    })
    .bind(bind_addr)?
    .run()
    .await
}
