use insurance_advisor_service::{Config, config::LogFormat, create_app};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// JSON lines by default, human-readable output for local runs. `RUST_LOG` overrides the filter.
fn init_tracing(log_format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "insurance_advisor_service=debug,prompt_flow=debug,tower_http=debug".into()
    });

    match log_format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() {
    // A local .env is optional; real environment variables win.
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    // Configuration errors are still logged, in the default format.
    init_tracing(config.as_ref().map_or(LogFormat::default(), |c| c.log_format));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if config.generative.api_key.is_none() {
        warn!("GEMINI_API_KEY not set; generative endpoints will answer with configuration errors");
    }
    if config.weather.api_key.is_none() {
        warn!("AEMET_API_KEY not set; weather data will be reported as unavailable");
    }

    let app = match create_app(&config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Insurance advisor service starting on {}", addr);
    info!("API overview available at http://{}/", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
