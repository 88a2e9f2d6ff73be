use argh::FromArgs;
use std::{path::PathBuf, sync::Arc};
use vision_dialog::{AppConfig, DialogPipeline, PromptBook, UpstreamClient, api};

// defaults for the server
const DEFAULT_CONFIG_PATH: &str = "./config/config.yml";
const CONFIG_PATH_ENV: &str = "APP_CONFIG_PATH";

#[derive(FromArgs)]
/// Vision dialog server: image in, clarifying questions out, final answer after.
struct ServerArgs {
    /// path to the YAML configuration (defaults to $APP_CONFIG_PATH or ./config/config.yml)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// the host to run the server on, overriding the configuration
    #[argh(option, short = 'h')]
    host: Option<String>,

    /// the port to run the server on, overriding the configuration
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ServerArgs = argh::from_env();

    let config_path = args
        .config
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load(&config_path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level)).init();
    log::info!("Loaded configuration from {}", config_path.display());
    if config.upstream.url_overridden {
        log::info!("Upstream URL overridden by {}", vision_dialog::config::UPSTREAM_URL_ENV);
    }

    let prompts = PromptBook::load(&config.prompts_file)?;
    let client = UpstreamClient::from_config(&config.upstream)?;
    log::info!(
        "Upstream {} (model {}, timeout {:?})",
        client.url(),
        config.upstream.default_model,
        config.upstream.timeout()
    );

    let pipeline = Arc::new(DialogPipeline::from_config(client, prompts, &config));
    let app = api::router(pipeline, &config.service);

    // format the host and port
    let host = args.host.unwrap_or_else(|| config.service.listen_host.clone());
    let port = args.port.unwrap_or(config.service.listen_port);
    let addr = format!("{}:{}", host, port);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
