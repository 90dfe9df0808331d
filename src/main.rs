#[tokio::main]
async fn main() -> anyhow::Result<()> {
    labvm_manager::cli::run().await
}
