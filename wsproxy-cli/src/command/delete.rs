use anyhow::Result;

use crate::client::ControlClient;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Compute session ID
    session_id: String,

    /// Only close the tunnel of this app
    #[arg(long)]
    app: Option<String>,
}

pub async fn execute(args: &Args, client: &ControlClient) -> Result<()> {
    let deleted = client
        .delete(&args.session_id, args.app.as_deref())
        .await?;

    match &args.app {
        Some(app) => println!("Closed tunnel to {} in {}", app, args.session_id),
        None => println!(
            "Closed {} tunnel(s) in {}",
            deleted["deleted"].as_u64().unwrap_or(0),
            args.session_id
        ),
    }
    Ok(())
}
