use anyhow::Result;
use clap::Parser;
use safetap_feed::Settings;
use std::path::PathBuf;

mod app;
mod components;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Display name, instead of the one derived from the identity
    #[arg(short, long)]
    name: Option<String>,

    /// Relay to connect to, overriding the configured one
    #[arg(short, long)]
    addr: Option<String>,

    /// Sign in with this participant id instead of anonymously
    #[arg(short, long)]
    uid: Option<String>,

    /// Config file to read instead of ./safetap.*
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the chat
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => Settings::load_file(path)?,
        None => Settings::load()?,
    };
    if let Some(addr) = args.addr {
        settings.remote_addr = Some(addr);
    }
    if let Some(uid) = args.uid {
        settings.auth_uid = Some(uid);
    }
    app::run(settings, args.name).await
}
