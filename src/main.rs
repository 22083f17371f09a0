#[tokio::main]
async fn main() -> anyhow::Result<()> {
    query_orchestrator::run().await
}
