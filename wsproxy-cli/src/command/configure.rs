use anyhow::Result;
use url::Url;
use wsproxy::SessionHeader;

use crate::api::ConfRequest;
use crate::client::ControlClient;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Access key of the keypair
    #[arg(long, env = "BACKEND_ACCESS_KEY")]
    access_key: String,

    /// Secret key of the keypair
    #[arg(long, env = "BACKEND_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Gateway endpoint, e.g. https://api.example.com
    #[arg(long, env = "BACKEND_ENDPOINT")]
    endpoint: Url,

    /// Gateway API version, e.g. v6.20220615
    #[arg(long)]
    api_version: Option<String>,

    /// Authenticate with a login session token instead of the keypair
    #[arg(long, env = "BACKEND_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Send the session token as X-BackendAI-SessionID instead of a cookie
    #[arg(long, requires = "session_token")]
    session_id_header: bool,
}

pub async fn execute(args: &Args, client: &ControlClient) -> Result<()> {
    let conf = ConfRequest {
        access_key: args.access_key.clone(),
        secret_key: args.secret_key.clone(),
        endpoint: args.endpoint.to_string(),
        api_version: args.api_version.clone(),
        mode: args.session_token.as_ref().map(|_| "session".to_string()),
        session: args.session_token.clone(),
        session_header: args.session_id_header.then_some(SessionHeader::SessionId),
    };
    client.configure(&conf).await?;

    println!("Credentials for {} are set.", args.endpoint);
    Ok(())
}
