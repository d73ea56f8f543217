use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bridge_agent::config::{
    AgentConfig, DEFAULT_CREDENTIALS_DIR, DEFAULT_DOWNLOADS_DIR, DEFAULT_S3_CREDENTIALS_DIR,
    DEFAULT_SERVICE_ACCOUNT_DIR, KubeApiConfig,
};

#[derive(Parser)]
#[command(
    name = "bridge-agent",
    about = "Submit a job to Ray and relay its status through a ConfigMap"
)]
struct Cli {
    /// Job name; the control object is `<job>-bridge-cm`.
    #[arg(long, env = "JOBNAME")]
    job_name: String,

    /// Namespace holding the control object.
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Kubernetes API server URL. Defaults to the in-cluster service.
    #[arg(long, env = "KUBE_API_URL")]
    kube_api_url: Option<String>,

    /// Service account mount with `token` and `ca.crt`.
    #[arg(long, env = "KUBE_SERVICE_ACCOUNT_DIR", default_value = DEFAULT_SERVICE_ACCOUNT_DIR)]
    service_account_dir: PathBuf,

    /// Directory the job's inputs are staged into.
    #[arg(long, env = "BRIDGE_DOWNLOADS_DIR", default_value = DEFAULT_DOWNLOADS_DIR)]
    downloads_dir: PathBuf,

    /// Mount with the object store `accesskey` and `secretkey` files.
    #[arg(long, env = "BRIDGE_S3_CREDENTIALS_DIR", default_value = DEFAULT_S3_CREDENTIALS_DIR)]
    s3_credentials_dir: PathBuf,

    /// Mount with the execution backend credentials.
    #[arg(long, env = "BRIDGE_CREDENTIALS_DIR", default_value = DEFAULT_CREDENTIALS_DIR)]
    credentials_dir: PathBuf,

    /// Log output format.
    #[arg(long, env = "BRIDGE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bridge_agent=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
    }
}

fn build_config(cli: Cli) -> anyhow::Result<AgentConfig> {
    let kube = KubeApiConfig::resolve(cli.kube_api_url, &cli.service_account_dir)?;
    let mut config = AgentConfig::new(cli.job_name, cli.namespace, kube)?;
    config.downloads_dir = cli.downloads_dir;
    config.s3_credentials_dir = cli.s3_credentials_dir;
    config.credentials_dir = cli.credentials_dir;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = async {
        let config = build_config(cli)?;
        tracing::info!(
            job = %config.job_name,
            namespace = %config.namespace,
            control_object = %config.control_object_name(),
            "Starting bridge agent"
        );
        Ok::<_, anyhow::Error>(bridge_agent::agent::run(&config).await?)
    }
    .await;

    match result {
        Ok(outcome) => {
            tracing::info!(?outcome, "Bridge agent finished");
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            tracing::error!("Bridge agent failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
