#[tokio::main]
async fn main() {
    if let Err(err) = apilink::mcp::server::run_stdio().await {
        eprintln!("apilink: {}", err);
        std::process::exit(1);
    }
}
