use rustfst::fst_impls::VectorFst;
use rustfst::semirings::TropicalWeight;

/// rustfst does not define this but we will
pub type StdVectorFst = VectorFst<TropicalWeight>;

/// Error types
pub mod error;
/// Warning budget for ARPA parsing
pub mod warnings;
/// Symbol tables with reserved boundary tokens
pub mod symbols;
/// Streaming ARPA file parser
pub mod arpa;
/// Backoff trie of N-Gram histories
pub mod trie;
/// Compile a backoff trie to an FST
pub mod fst;
/// Incremental scoring over a backoff trie
pub mod scorer;
/// ARPA to FST pipeline
pub mod compile;

pub use arpa::{ArpaParseOptions, ArpaParser, NGram, NGramSink, OovHandling};
pub use compile::{arpa2fst, compile, CompileOptions, Compiled};
pub use error::ArpaError;
pub use fst::{build_fst, print_fst, FstOptions, WeightUnits};
pub use scorer::{ContextState, LanguageModel};
pub use symbols::{SymbolConfig, Vocabulary};
pub use trie::NgramTrie;
