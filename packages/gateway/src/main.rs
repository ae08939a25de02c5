fn main() {
    if let Err(err) = companion_gateway::cli::run() {
        tracing::error!(error = %err, "companion-gateway failed");
        std::process::exit(1);
    }
}
