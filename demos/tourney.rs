use bey_cache::simulation::TourneyApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    TourneyApp::run().await
}
