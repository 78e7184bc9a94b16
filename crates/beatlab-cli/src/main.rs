//! beatlab CLI - The `beatlab` command.
//!
//! A thin host around `beatlab-core` that renders grooves offline and
//! exposes the chord helpers on the command line.

mod render;

use anyhow::{Context, Result};
use beatlab_core::theory::note_name;
use beatlab_core::{Chord, COMMON_PROGRESSIONS};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// beatlab - step sequencer, piano roll and chord tool engine
#[derive(Parser, Debug)]
#[command(name = "beatlab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Render grooves and explore chords with the beatlab engine", long_about = None)]
struct Args {
    /// Log scheduling detail
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a groove to a WAV file
    Render(RenderArgs),

    /// List the built-in chord progressions
    Progressions,

    /// Spell a chord symbol such as "Dm7"
    Chord {
        #[arg(value_name = "SYMBOL")]
        symbol: String,

        /// Octave of the root (C4 = MIDI 60)
        #[arg(long, default_value_t = 4, allow_hyphen_values = true)]
        octave: i32,
    },
}

/// Arguments for `beatlab render`
#[derive(ClapArgs, Debug)]
pub struct RenderArgs {
    /// Output WAV file
    #[arg(short, long, value_name = "FILE")]
    pub out: PathBuf,

    /// Length of the render, e.g. "8s" or "1m 30s"
    #[arg(short, long, default_value = "8s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Tempo (overrides the config file)
    #[arg(long)]
    pub bpm: Option<f64>,

    /// Chord symbols separated by spaces, e.g. "C G Am F"
    #[arg(long, conflicts_with = "preset")]
    pub progression: Option<String>,

    /// Built-in progression id (see `beatlab progressions`)
    #[arg(long)]
    pub preset: Option<String>,

    /// Kick drum sample
    #[arg(long, value_name = "FILE")]
    pub kick: Option<PathBuf>,

    /// Snare drum sample
    #[arg(long, value_name = "FILE")]
    pub snare: Option<PathBuf>,

    /// Hi-hat sample
    #[arg(long, value_name = "FILE")]
    pub hihat: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write 32-bit float samples instead of 16-bit PCM
    #[arg(long)]
    pub float: bool,
}

fn init_logger(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    match args.command {
        Commands::Render(render_args) => render::render(render_args),
        Commands::Progressions => {
            for progression in &COMMON_PROGRESSIONS {
                println!(
                    "{:<10} {:<10} {:<22} {}",
                    progression.id,
                    progression.name,
                    progression.description,
                    progression.chords.join(" ")
                );
            }
            Ok(())
        }
        Commands::Chord { symbol, octave } => {
            let chord = Chord::parse(&symbol).with_context(|| format!("Unknown chord symbol '{}'", symbol))?;
            let pitches = chord.pitches(octave);
            let names: Vec<String> = pitches.iter().map(|&p| note_name(p)).collect();
            let numbers: Vec<String> = pitches.iter().map(|p| p.to_string()).collect();
            println!("{}: {}", chord, names.join(" "));
            println!("MIDI: {}", numbers.join(" "));
            Ok(())
        }
    }
}
