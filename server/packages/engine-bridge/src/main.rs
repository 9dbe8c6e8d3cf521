fn main() {
    if let Err(err) = engine_bridge::cli::run_engine_bridge() {
        tracing::error!(error = %err, "engine-bridge failed");
        std::process::exit(1);
    }
}
