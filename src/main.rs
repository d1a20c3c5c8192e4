#[tokio::main]
async fn main() {
    std::process::exit(siteparity::cli::run().await);
}
