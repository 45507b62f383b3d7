pub mod add;
pub mod configure;
pub mod delete;
pub mod serve;
pub mod status;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the proxy daemon and its control API
    Serve(serve::Args),

    /// Send gateway credentials to a running daemon
    Configure(configure::Args),

    /// Open a local tunnel to an app in a compute session
    Add(add::Args),

    /// Close the tunnels of a session
    Delete(delete::Args),

    /// Show the tunnels of a session
    Status(status::Args),
}

impl Command {
    /// Command-line values that take precedence over the config file.
    pub fn overrides(&self) -> crate::config::Overrides {
        match self {
            Self::Serve(args) => args.overrides(),
            _ => Default::default(),
        }
    }
}
