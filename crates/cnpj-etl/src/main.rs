//! CNPJ ETL - registry download and refinement tool

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cnpj_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use cnpj_etl::config::{FailurePolicy, PipelineConfig};
use cnpj_etl::download::DownloadReport;
use cnpj_etl::extract::ExtractReport;
use cnpj_etl::load::LoadReport;
use cnpj_etl::pipeline::{Pipeline, PipelineReport, PipelineStatus, Stage, StageRange};
use cnpj_etl::progress::{format_bytes, IndicatifReporter, ProgressReporter, SilentReporter};
use cnpj_etl::refine::RefineReport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cnpj-etl")]
#[command(author, version, about = "Download and refine the Receita Federal CNPJ registry")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Do not draw progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Root of the stage directories
    #[arg(long, env = "CNPJ_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct DownloadArgs {
    /// Maximum simultaneous downloads
    #[arg(short = 'k', long)]
    concurrency: Option<usize>,

    /// Keep downloading after a failure and report all failures at the end
    #[arg(long)]
    keep_going: bool,

    /// Extra attempts per archive after a failed transfer
    #[arg(long)]
    retries: Option<u32>,

    /// Registry base URL
    #[arg(long, env = "CNPJ_BASE_URL")]
    base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download missing archives (stage 1)
    Download(DownloadArgs),

    /// Extract archive members as UTF-8 text (stage 2)
    Extract,

    /// Load extracted files into typed tables (stage 3)
    Load,

    /// Build the refined database (stage 4)
    Refine,

    /// Run a range of stages in order
    Run {
        /// First stage to run
        #[arg(long, value_enum, default_value_t = Stage::Download)]
        from: Stage,

        /// Last stage to run
        #[arg(long, value_enum, default_value_t = Stage::Refine)]
        to: Stage,

        #[command(flatten)]
        download: DownloadArgs,
    },

    /// Show which units of work are already complete
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Console)
        .log_file_prefix("cnpj-etl")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let download_args = match &cli.command {
        Command::Download(args) | Command::Run { download: args, .. } => Some(args),
        _ => None,
    };
    let config = build_config(&cli, download_args)?;

    let progress: Arc<dyn ProgressReporter> = if cli.quiet {
        Arc::new(SilentReporter)
    } else {
        Arc::new(IndicatifReporter::new())
    };
    let pipeline = Pipeline::new(config)?.with_progress(progress);

    match cli.command {
        Command::Download(_) => print_download(&pipeline.download().await?),
        Command::Extract => print_extract(&pipeline.extract().await?),
        Command::Load => print_load(&pipeline.load().await?),
        Command::Refine => print_refine(&pipeline.refine().await?),
        Command::Run { from, to, .. } => {
            let report = pipeline.run(StageRange::new(from, to)?).await?;
            print_pipeline(&report);
        },
        Command::Status { json } => {
            let status = pipeline.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        },
    }

    info!("Done");
    Ok(())
}

/// Environment configuration with command-line overrides applied
fn build_config(cli: &Cli, download: Option<&DownloadArgs>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }

    if let Some(args) = download {
        if let Some(k) = args.concurrency {
            config.download.max_concurrent = k;
        }
        if args.keep_going {
            config.download.failure_policy = FailurePolicy::Continue;
        }
        if let Some(retries) = args.retries {
            config.download.max_retries = retries;
        }
        if let Some(url) = &args.base_url {
            config.base_url = url.clone();
        }
    }

    config.validate()?;
    Ok(config)
}

fn print_download(report: &DownloadReport) {
    println!(
        "Download: {} archives ({} downloaded, {} already present, {} transferred)",
        report.considered,
        report.downloaded,
        report.skipped,
        format_bytes(report.bytes)
    );
}

fn print_extract(report: &ExtractReport) {
    println!(
        "Extract: {} members from {} archives ({} extracted, {} already present)",
        report.members, report.archives, report.extracted, report.skipped
    );
}

fn print_load(report: &LoadReport) {
    println!(
        "Load: {} tables created, {} already present",
        report.created.len(),
        report.skipped.len()
    );
    for table in &report.created {
        println!("    {}", table);
    }
}

fn print_refine(report: &RefineReport) {
    println!(
        "Refine: {} tables created, {} already present",
        report.created.len(),
        report.skipped.len()
    );
    for table in &report.created {
        println!("    {}", table);
    }
}

fn print_pipeline(report: &PipelineReport) {
    if let Some(r) = &report.download {
        print_download(r);
    }
    if let Some(r) = &report.extract {
        print_extract(r);
    }
    if let Some(r) = &report.load {
        print_load(r);
    }
    if let Some(r) = &report.refine {
        print_refine(r);
    }
}

fn print_status(status: &PipelineStatus) {
    let mark = |present: bool| if present { "x" } else { " " };

    println!("Data directory: {}", status.data_dir.display());
    println!();
    println!(
        "Archives:        {}/{} present",
        status.archives.present, status.archives.expected
    );
    for name in &status.archives.missing {
        println!("    missing {}", name);
    }
    println!("Extracted files: {}", status.extracted_files);
    println!("Load tables:");
    for table in &status.load_tables {
        println!("    [{}] {}", mark(table.present), table.table);
    }
    println!("Refined tables:");
    for table in &status.refine_tables {
        println!("    [{}] {}", mark(table.present), table.table);
    }
}
