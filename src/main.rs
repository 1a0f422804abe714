use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use captest::config::TestConfig;
use captest::data::groups::ColumnGroups;
use captest::data::loader::load_frame;
use captest::pipeline;

#[derive(Parser)]
#[command(name = "captest")]
#[command(about = "PV capacity testing (ASTM E2848)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capacity test described by a JSON config
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the column groups inferred for a measured-data file as JSON
    Groups { file: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Run { config } => run(config),
        Commands::Groups { file } => {
            let frame = load_frame(&file)?;
            let groups = ColumnGroups::infer(&frame);
            println!("{}", serde_json::to_string_pretty(&groups)?);
            Ok(())
        }
    }
}

fn run(config: PathBuf) -> Result<()> {
    let cfg = TestConfig::from_json(&config)?;
    let outcome = pipeline::run(&cfg)?;

    for cd in [&outcome.measured, &outcome.simulated] {
        println!("{}", cd.summary());
        if let Some(fit) = &cd.regression_results {
            println!("{fit}");
        }
    }

    if !outcome.period_capacities.is_empty() {
        println!("Capacities by period:");
        for pred in &outcome.period_capacities {
            println!("  {pred}");
        }
        println!();
    }

    match &outcome.pvalue_check {
        Some(check) => println!("{check}"),
        None => println!("{}", outcome.results),
    }
    Ok(())
}
