use std::sync::Arc;

use amiferry_aws::AwsProvider;
use amiferry_common::{AmiError, CopyRequest, SourceSpec};
use amiferry_core::Pipeline;
use clap::Parser;
use color_eyre::eyre;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Copy a machine image and its snapshots into another account/region,
/// re-encrypting the snapshots with a destination-side key.
#[derive(Parser, Debug)]
#[command(name = "amiferry", version, about, long_about = None)]
struct Cli {
    /// Credential profile owning the source image
    #[arg(
        long,
        conflicts_with = "source_account_id",
        required_unless_present = "source_account_id"
    )]
    source_profile: Option<String>,

    /// Account id owning an image already shared with the destination
    /// (no source credentials needed)
    #[arg(long)]
    source_account_id: Option<String>,

    /// Credential profile for the destination account
    #[arg(long)]
    destination_profile: String,

    /// Image to copy
    #[arg(long)]
    image_id: String,

    /// Name for the destination image (default: "Copy of <name> <timestamp>")
    #[arg(long)]
    name: Option<String>,

    /// Source region (default: the source profile's configured region)
    #[arg(long)]
    source_region: Option<String>,

    /// Destination region (default: the destination profile's configured region)
    #[arg(long)]
    destination_region: Option<String>,

    /// Enable ENA support on the registered image
    #[arg(long)]
    ena_support: bool,

    /// Replicate tags from the source image and snapshots
    #[arg(long)]
    copy_tags: bool,

    /// Destination KMS key for re-encryption (default: the destination
    /// account's default EBS key)
    #[arg(long)]
    kms_key_id: Option<String>,

    /// Value for the "Env" tag on destination resources (requires --copy-tags)
    #[arg(long, requires = "copy_tags")]
    env: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let spec = match (&cli.source_profile, &cli.source_account_id) {
        (Some(profile), None) => SourceSpec::Profile(profile.clone()),
        (None, Some(account)) => SourceSpec::SharedAccount(account.clone()),
        _ => unreachable!("clap enforces exactly one source specifier"),
    };

    let destination =
        AwsProvider::from_profile(&cli.destination_profile, cli.destination_region.clone())
            .await?;

    // A shared-account source has no credentials of its own; reads go through
    // the destination profile pointed at the source region.
    let source = match &spec {
        SourceSpec::Profile(profile) => {
            AwsProvider::from_profile(profile, cli.source_region.clone()).await?
        }
        SourceSpec::SharedAccount(_) => {
            let region = cli.source_region.clone().ok_or_else(|| {
                AmiError::Configuration(
                    "--source-region is required with --source-account-id".to_string(),
                )
            })?;
            AwsProvider::from_profile(&cli.destination_profile, Some(region)).await?
        }
    };

    let request = CopyRequest {
        image_id: cli.image_id,
        name: cli.name,
        encryption_key: cli.kms_key_id,
        ena_support: cli.ena_support,
        copy_tags: cli.copy_tags,
        env_override: cli.env,
    };

    let outcome = Pipeline::new(Arc::new(source), Arc::new(destination))
        .run(&spec, &request)
        .await?;

    info!(
        image_id = %outcome.image_id,
        snapshots = outcome.snapshots.len(),
        "image copy complete"
    );
    println!("{}", outcome.image_id);
    Ok(())
}
