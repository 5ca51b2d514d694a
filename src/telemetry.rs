//! `tracing` initialization: JSON-formatted, env-filter driven by `RUST_LOG`.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "capcast=info,tower_http=info".into()),
        )
        .json()
        .init();
}
