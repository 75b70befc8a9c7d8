//! The binary rdsys-backend.

use rdsys_backend::{Backend, Config};

#[derive(clap::Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.json")]
    pub config: std::path::PathBuf,

    /// Output tracing in json format.
    #[arg(long)]
    pub json: bool,
}

#[tokio::main]
async fn main() {
    let args = <Args as clap::Parser>::parse();

    let t = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env_lossy(),
    );

    if args.json {
        t.json().try_init()
    } else {
        t.try_init()
    }
    .expect("failed to init tracing");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let backend = match Backend::spawn(config).await {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("failed to start backend: {err}");
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("Received interrupt signal.");

    backend.shutdown().await;
}
