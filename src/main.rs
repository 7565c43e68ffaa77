use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use privacy_compliance::compliance::age_gate::age_on;
use privacy_compliance::compliance::{RegionCode, RegionPolicyResolver, RequestType};
use privacy_compliance::config::{ComplianceConfig, ConfigLoader};
use privacy_compliance::logging::init_logging;

/// Privacy compliance operator tool
#[derive(Parser)]
#[command(name = "privacy-compliance")]
#[command(about = "Inspect region privacy-law tables and compliance deadlines")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "PRIVACY_CONFIG")]
    config: Option<PathBuf>,

    /// Region table override (TOML)
    #[arg(long, env = "PRIVACY_REGIONS")]
    regions: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the region table and exit
    CheckPolicy,
    /// Print the legal requirements of a region as JSON
    Requirements {
        region: RegionCode,
    },
    /// Compute the response deadline of a rights request
    Deadline {
        region: RegionCode,
        request_type: RequestType,
        /// Submission time (RFC 3339), defaults to now
        #[arg(long)]
        submitted: Option<DateTime<Utc>>,
    },
    /// Check whether a birth date needs parental consent in a region
    Age {
        region: RegionCode,
        birth_date: NaiveDate,
    },
}

fn load_policy(config: &ComplianceConfig) -> Result<Arc<RegionPolicyResolver>> {
    let policy = RegionPolicyResolver::load(config.policy.region_table.as_deref())
        .context("Failed to load region table")?;
    Ok(Arc::new(policy))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load_from_file(cli.config.as_deref())
        .load_from_env()
        .with_region_table(cli.regions.as_deref())
        .build()?;
    let _guard = init_logging(&config.logging)?;

    let policy = load_policy(&config)?;

    match cli.command {
        Commands::CheckPolicy => {
            let source = config
                .policy
                .region_table
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in".to_string());
            let regions: Vec<_> = policy.regions().map(|r| r.to_string()).collect();
            println!("Region table OK ({}): {}", source, regions.join(", "));
        }
        Commands::Requirements { region } => {
            let requirement = policy.requirements_for(region)?;
            println!("{}", serde_json::to_string_pretty(requirement)?);
        }
        Commands::Deadline {
            region,
            request_type,
            submitted,
        } => {
            let submitted = submitted.unwrap_or_else(Utc::now);
            let days = policy.deadline_days(region, request_type)?;
            let extension = policy.extension_days(region, request_type)?;
            let deadline = submitted + Duration::days(i64::from(days));
            println!("region:            {}", region);
            println!("request type:      {}", request_type);
            println!("submitted:         {}", submitted.to_rfc3339());
            println!("deadline:          {} ({} days)", deadline.to_rfc3339(), days);
            println!(
                "extended deadline: {} (+{} days)",
                (deadline + Duration::days(i64::from(extension))).to_rfc3339(),
                extension
            );
        }
        Commands::Age { region, birth_date } => {
            let requirement = policy.requirements_for(region)?;
            let age = age_on(birth_date, Utc::now().date_naive())?;
            let needs_parent =
                requirement.parental_consent_required && age < requirement.minimum_age;
            println!("age:                       {}", age);
            println!("minimum age in {}:         {}", region, requirement.minimum_age);
            println!("requires parental consent: {}", needs_parent);
        }
    }

    Ok(())
}
