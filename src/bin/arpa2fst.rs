//! Convert an ARPA language model to an FST.
//!
//! Usage:
//!   arpa2fst [OPTIONS] <INPUT_ARPA> [OUTPUT_FST]
//!
//! The text form of the FST (integer labels) is printed to stdout; the
//! binary FST is written only if OUTPUT_FST is given.
//!
//! Examples:
//!   # Grammar FST for decoding, backoff arcs on #0
//!   arpa2fst --disambig-symbol=#0 --read-symbol-table=words.txt lm.arpa G.fst

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustfst_arpa::{arpa2fst, CompileOptions, WeightUnits};

#[derive(Parser, Debug)]
#[command(name = "arpa2fst")]
#[command(about = "Convert an ARPA language model to an FST")]
struct Args {
    /// Beginning of sentence symbol
    #[arg(long, default_value = "<s>")]
    bos_symbol: String,

    /// Disambiguator. If provided (e.g., #0), used on input side of backoff
    /// links, and <s> and </s> are replaced with epsilons
    #[arg(long, default_value = "")]
    disambig_symbol: String,

    /// End of sentence symbol
    #[arg(long, default_value = "</s>")]
    eos_symbol: String,

    /// Unknown word symbol
    #[arg(long, default_value = "<unk>")]
    unk_symbol: String,

    /// Ilabel-sort the output FST
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    ilabel_sort: bool,

    /// Store symbol table with FST. Symbols are always stored if symbol
    /// tables are neither read nor written
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    keep_symbols: bool,

    /// Maximum warnings to report on ARPA parsing, 0 to disable, -1 to show all
    #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
    max_arpa_warnings: i32,

    /// Use existing symbol table
    #[arg(long)]
    read_symbol_table: Option<PathBuf>,

    /// Write generated symbol table to a file
    #[arg(long)]
    write_symbol_table: Option<PathBuf>,

    /// Maximum order (inclusive) of n-grams used, -1 for all
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_order: i32,

    /// Write weights as -log10(p) instead of -ln(p)
    #[arg(long)]
    log10_weights: bool,

    /// Fail if the n-gram counts in the header are wrong
    #[arg(long)]
    strict_counts: bool,

    /// Input ARPA file
    input_arpa: PathBuf,

    /// Output FST file. If absent, no file is created
    output_fst: Option<PathBuf>,
}

impl Args {
    fn options(&self) -> CompileOptions {
        CompileOptions {
            bos_symbol: self.bos_symbol.clone(),
            eos_symbol: self.eos_symbol.clone(),
            unk_symbol: self.unk_symbol.clone(),
            disambig_symbol: Some(self.disambig_symbol.clone()).filter(|sym| !sym.is_empty()),
            ilabel_sort: self.ilabel_sort,
            keep_symbols: self.keep_symbols,
            max_arpa_warnings: self.max_arpa_warnings,
            read_symbol_table: self.read_symbol_table.clone(),
            write_symbol_table: self.write_symbol_table.clone(),
            max_order: usize::try_from(self.max_order).ok(),
            weight_units: if self.log10_weights {
                WeightUnits::Log10
            } else {
                WeightUnits::NaturalLog
            },
            strict_counts: self.strict_counts,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let text = arpa2fst(&args.input_arpa, args.output_fst.as_deref(), &args.options())?;
    print!("{}", text);
    Ok(())
}
