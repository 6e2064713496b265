use clap::Parser;
use pushprox::config::ProxyArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ProxyArgs::parse();

    // Reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&args.log_level)?)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    pushprox::server::run(args).await
}
