use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use fortune_uploader::bridge::{HostOptions, HostRequest};
use fortune_uploader::picker::FilePicker;
use fortune_uploader::utils::{init_logger, mask_secret};
use fortune_uploader::{Config, PhotoBridge, StaticSession, UploadPipeline};

#[derive(Parser)]
#[command(name = "fortune-uploader", version, about = "Pick a photo and upload it to a fortune record")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pick, upload, verify and finalize pipeline
    Upload {
        #[arg(long)]
        fortune_id: String,
        /// Image to "pick"; omit to simulate a dismissed picker
        #[arg(long)]
        file: Option<PathBuf>,
        /// Overrides SUPABASE_ACCESS_TOKEN for this run
        #[arg(long)]
        access_token: Option<String>,
    },
    /// Pick a photo without uploading it
    Pick {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    let _log_guard = init_logger(&config.logging);
    info!(
        base_url = %config.backend.base_url,
        token = %mask_secret(config.backend.access_token.as_deref()),
        "Configuration loaded"
    );

    let session = Arc::new(StaticSession(config.backend.session()));

    match cli.command {
        Command::Upload {
            fortune_id,
            file,
            access_token,
        } => {
            let picker = Arc::new(FilePicker::new(file));
            let pipeline = UploadPipeline::new(&config, picker, session)?;
            let bridge = PhotoBridge::new(Arc::new(pipeline));

            let request = HostRequest {
                id: None,
                options: HostOptions {
                    fortune_id: Some(fortune_id),
                    access_token,
                },
            };
            let response = bridge.pick_and_upload(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Pick { file } => {
            let picker = Arc::new(FilePicker::new(file));
            let pipeline = UploadPipeline::new(&config, picker, session)?;
            let bridge = PhotoBridge::new(Arc::new(pipeline));

            let result = bridge
                .pick_photo()
                .await
                .map_err(|e| anyhow::anyhow!("Photo pick failed: {}", e))?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
        }
    }

    Ok(())
}
