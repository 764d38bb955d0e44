#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    wa_relay::telemetry::init();
    wa_relay::app::run().await
}
