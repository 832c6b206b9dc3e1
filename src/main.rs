use direct_downloader::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "direct_downloader=info,tower_http=info".to_string()),
        )
        .init();

    let result = match Config::from_env() {
        Ok(config) => direct_downloader::run(config).await,
        Err(error) => Err(error),
    };

    if let Err(error) = result {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}
