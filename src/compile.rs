use anyhow::{Context, Result};
use rustfst::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::arpa::{ArpaParseOptions, OovHandling};
use crate::error::ArpaError;
use crate::fst::{build_fst, print_fst, FstOptions, WeightUnits};
use crate::symbols::{SymbolConfig, Vocabulary};
use crate::trie::NgramTrie;
use crate::StdVectorFst;

/// Everything that controls one ARPA to FST compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub bos_symbol: String,
    pub eos_symbol: String,
    pub unk_symbol: String,
    /// If set (e.g. `#0`), used on the input side of backoff arcs, and
    /// `<s>`/`</s>` are replaced by the start state and final weights.
    pub disambig_symbol: Option<String>,
    pub ilabel_sort: bool,
    /// Embed the symbol table in the FST. Forced on when symbols are
    /// neither read nor written, otherwise they would be lost.
    pub keep_symbols: bool,
    /// Maximum warnings to report, 0 for none, negative for all.
    pub max_arpa_warnings: i32,
    /// Use this symbol table instead of building one; n-grams with words
    /// missing from it are skipped.
    pub read_symbol_table: Option<PathBuf>,
    pub write_symbol_table: Option<PathBuf>,
    /// Highest n-gram order to use, all of them if `None`.
    pub max_order: Option<usize>,
    pub weight_units: WeightUnits,
    pub strict_counts: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            bos_symbol: "<s>".to_string(),
            eos_symbol: "</s>".to_string(),
            unk_symbol: "<unk>".to_string(),
            disambig_symbol: None,
            ilabel_sort: true,
            keep_symbols: false,
            max_arpa_warnings: 30,
            read_symbol_table: None,
            write_symbol_table: None,
            max_order: None,
            weight_units: WeightUnits::default(),
            strict_counts: false,
        }
    }
}

impl CompileOptions {
    fn symbol_config(&self) -> SymbolConfig {
        SymbolConfig {
            bos: self.bos_symbol.clone(),
            eos: self.eos_symbol.clone(),
            unk: self.unk_symbol.clone(),
            disambig: self.disambig_symbol.clone(),
        }
    }

    fn embeds_symbols(&self) -> bool {
        self.keep_symbols || (self.read_symbol_table.is_none() && self.write_symbol_table.is_none())
    }
}

/// Result of `compile`.
#[derive(Debug)]
pub struct Compiled {
    pub fst: StdVectorFst,
    pub vocabulary: Vocabulary,
    /// Warnings raised while parsing, reported or not.
    pub num_warnings: usize,
}

impl Compiled {
    /// AT&T text listing of the FST.
    pub fn text(&self) -> Result<String> {
        print_fst(&self.fst)
    }
}

/// Compile an ARPA model read from `reader`.
pub fn compile<R: BufRead>(reader: R, options: &CompileOptions) -> Result<Compiled> {
    let config = options.symbol_config();
    let (mut vocabulary, oov_handling) = match &options.read_symbol_table {
        Some(path) => (Vocabulary::read_text(path, &config)?, OovHandling::SkipNGram),
        None => (Vocabulary::new(&config)?, OovHandling::AddToSymbols),
    };
    let parse_options = ArpaParseOptions {
        max_warnings: options.max_arpa_warnings,
        max_order: options.max_order,
        oov_handling,
        strict_counts: options.strict_counts,
    };
    let (trie, warnings) = NgramTrie::read(reader, &mut vocabulary, parse_options)?;

    let fst_options = FstOptions {
        ilabel_sort: options.ilabel_sort,
        weight_units: options.weight_units,
        keep_symbols: options.embeds_symbols(),
    };
    let fst = build_fst(&trie, &vocabulary, &fst_options)?;

    if let Some(path) = &options.write_symbol_table {
        vocabulary.write_text(path)?;
        info!("Wrote {} symbols to {}", vocabulary.len(), path.display());
    }
    Ok(Compiled {
        fst,
        vocabulary,
        num_warnings: warnings.count(),
    })
}

/// Compile the ARPA file `input`, write the binary FST to `output` if
/// given, and return the text listing.
pub fn arpa2fst(input: &Path, output: Option<&Path>, options: &CompileOptions) -> Result<String> {
    let fh = File::open(input).map_err(ArpaError::io(input))?;
    info!("Reading {}", input.display());
    let compiled = compile(BufReader::new(fh), options)
        .with_context(|| format!("failed to compile {}", input.display()))?;
    if let Some(output) = output {
        compiled
            .fst
            .write(output)
            .with_context(|| format!("failed to write FST to {}", output.display()))?;
        info!("Wrote FST to {}", output.display());
    }
    compiled.text()
}
