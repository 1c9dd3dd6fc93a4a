use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hubstage::config::{DEFAULT_CONFIG_FILE, HubstageConfig};
use hubstage::format::OutputFormat;
use hubstage::merge::{MergeOutcome, RecoveryReport, SkippedEntry};
use hubstage::staging::StagingArea;
use hubstage::status::StatusReport;
use hubstage::timestamp::BasicTimestamp;
use hubstage::{lease, resolve_status, run_merge, submit, telemetry};
use hubstage_store::HubRepo;

/// Staged appends to a shared Hugging Face dataset
///
/// Contributors stage one small file per submission under pending/; a
/// periodic merge folds them into the main dataset shards and clears
/// staging.
///
/// QUICK START:
///
///   export HF_TOKEN=hf_...
///   printf '[repo]\nid = "org/stories"\n' > hubstage.toml
///
///   hubstage submit "a new story"
///   hubstage pending
///   hubstage merge
///   hubstage status
#[derive(Parser)]
#[command(name = "hubstage")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'hubstage <command> --help' for more information on a specific command.")]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, env = "HUBSTAGE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every staged submission into the main dataset
    ///
    /// Safe to run from cron: an idle run commits nothing, a concurrent run
    /// is refused by the merge lease, and a run interrupted between publish
    /// and cleanup is finished by the next one.
    Merge {
        /// Lease owner id (default: host, pid and a random suffix)
        #[arg(long)]
        owner: Option<String>,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show whether submissions are waiting and when the last merge ran
    Status {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stage one submission
    Submit {
        /// The submission text
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        text: Option<String>,

        /// Read the submission text from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List staged submissions
    Pending {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let _telemetry = telemetry::init();
    let cli = Cli::parse();

    let config = HubstageConfig::load(&cli.config)?;
    let repo = HubRepo::new(config.hub_config()?).context("could not create Hub client")?;

    match cli.command {
        Commands::Merge { owner, format } => {
            let owner = owner.unwrap_or_else(lease::new_owner_id);
            let outcome = run_merge(&repo, &config, &owner, Utc::now())?;
            print_merge(&outcome, format)
        }
        Commands::Status { format } => {
            let report = resolve_status(&repo, &config, Utc::now());
            print_status(&report, format)
        }
        Commands::Submit { text, file } => {
            let text = match text {
                Some(text) => text,
                None => read_text(&file.context("provide TEXT or --file")?)?,
            };
            let staged = submit::submit(&repo, &config.staging, &text, BasicTimestamp::now())?;
            println!("Staged {} (commit {})", staged.path, staged.commit.id);
            Ok(())
        }
        Commands::Pending { format } => {
            let pending = StagingArea::new(&repo, &config.staging).list_pending()?;
            match format {
                OutputFormat::Json => println!("{}", format.serialize(&pending)?),
                OutputFormat::Text => {
                    for path in &pending {
                        println!("{path}");
                    }
                    println!("{} pending", pending.len());
                }
            }
            Ok(())
        }
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))
}

fn print_merge(outcome: &MergeOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", format.serialize(outcome)?);
        return Ok(());
    }
    match outcome {
        MergeOutcome::NothingToDo { recovered, skipped } => {
            print_recovered(recovered.as_ref());
            print_skipped(skipped);
            println!("Nothing to merge.");
        }
        MergeOutcome::Merged(summary) => {
            print_recovered(summary.recovered.as_ref());
            print_skipped(&summary.skipped);
            println!(
                "Merged {} entries from {} staging files ({} -> {} records).",
                summary.merged,
                summary.consumed.len(),
                summary.previous_len,
                summary.dataset_len
            );
            if summary.duplicates_dropped > 0 {
                println!("Dropped {} duplicate entries.", summary.duplicates_dropped);
            }
            println!("  publish: {}", summary.publish_commit);
            println!("  cleanup: {}", summary.cleanup_commit);
        }
    }
    Ok(())
}

fn print_recovered(recovered: Option<&RecoveryReport>) {
    if let Some(report) = recovered {
        println!(
            "Finished cleanup of interrupted merge {} ({} staging files deleted).",
            report.merge_id,
            report.deleted.len()
        );
    }
}

fn print_skipped(skipped: &[SkippedEntry]) {
    for entry in skipped {
        println!("Skipped {}: {}", entry.path, entry.reason);
    }
}

fn print_status(report: &StatusReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", format.serialize(report)?),
        OutputFormat::Text => {
            println!("{}: {}", report.state, report.message);
            if let Some(merge) = &report.last_merge {
                println!(
                    "  last merge: {} ({} entries, from {})",
                    merge.at.to_rfc3339(),
                    merge.merged,
                    merge.source
                );
            }
        }
    }
    Ok(())
}
