//! Ferrite command-line interface.

mod analysis;
mod deck;
mod logger;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use ferrite_solver::SolverDispatchStrategy;
use log::{error, info};

use crate::deck::{AnalysisSpec, Deck};
use crate::output::{OutputFormat, Report};

#[derive(Parser)]
#[command(name = "ferrite")]
#[command(about = "Transient circuit simulation and PRIMA model-order reduction", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("mode").args(["op", "dc", "tran", "mor"])))]
struct Cli {
    /// JSON circuit deck
    #[arg(value_name = "DECK")]
    deck: PathBuf,

    /// Run only the DC operating point
    #[arg(long)]
    op: bool,

    /// Run the deck's DC sweep
    #[arg(long)]
    dc: bool,

    /// Run the deck's transient analysis
    #[arg(long)]
    tran: bool,

    /// Run the deck's model-order reduction
    #[arg(long)]
    mor: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    /// Linear solver used inside Newton (overrides the deck)
    #[arg(long, value_enum)]
    solver: Option<SolverChoice>,

    /// More log output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn requested(&self) -> Option<&'static str> {
        if self.op {
            Some("op")
        } else if self.dc {
            Some("dc")
        } else if self.tran {
            Some("tran")
        } else if self.mor {
            Some("mor")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SolverChoice {
    Auto,
    Lu,
    Gmres,
}

impl From<SolverChoice> for SolverDispatchStrategy {
    fn from(choice: SolverChoice) -> Self {
        match choice {
            SolverChoice::Auto => SolverDispatchStrategy::Auto,
            SolverChoice::Lu => SolverDispatchStrategy::DirectLU,
            SolverChoice::Gmres => SolverDispatchStrategy::IterativeGmres,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logger::init(logger::level_for(cli.verbose, cli.quiet)) {
        eprintln!("warning: logger already installed: {}", e);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut deck = Deck::from_path(&cli.deck)?;
    if let Some(choice) = cli.solver {
        deck.options.dispatch.strategy = choice.into();
    }
    if let Some(title) = &deck.title {
        info!("{}", title);
    }

    let spec = deck.select(cli.requested())?;
    info!("running {} analysis", spec.label());
    let report = match &spec {
        AnalysisSpec::Op => Report::Dc(analysis::run_dc_op(&deck)?),
        AnalysisSpec::Dc { sweep } => Report::Sweep(analysis::run_dc_sweep(&deck, sweep)?),
        AnalysisSpec::Tran(params) => Report::Tran(analysis::run_transient(&deck, params)?),
        AnalysisSpec::Mor(params) => Report::Mor(analysis::run_mor(&deck, params)?),
    };

    let text = output::render(&report, cli.output).context("failed to format results")?;
    println!("{}", text);
    Ok(())
}
