#[tokio::main]
async fn main() -> anyhow::Result<()> {
    soulbridge_cli::cli::run().await
}
