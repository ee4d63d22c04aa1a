use anyhow::Result;
use tokengate::cli::start;

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    action.execute().await
}
