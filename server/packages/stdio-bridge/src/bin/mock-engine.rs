use stdio_bridge::mock::{run, MockOptions};

#[tokio::main]
async fn main() {
    // stdout carries the protocol; diagnostics go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .init();

    let options = MockOptions::from_args(std::env::args().skip(1));
    if let Err(err) = run(options).await {
        tracing::error!(error = %err, "mock-engine failed");
        std::process::exit(1);
    }
}
