#[tokio::main]
async fn main() {
    if let Err(e) = privacy_relay::run().await {
        tracing::error!(error = %e, "relay stopped");
        eprintln!("privacy-relay: {e}");
        std::process::exit(1);
    }
}
