use anyhow::Result;
use rustfst::{Label, EPS_LABEL};
use std::io::BufRead;

use crate::arpa::ArpaParseOptions;
use crate::symbols::{SymbolConfig, Vocabulary};
use crate::trie::{NgramTrie, NodeId, ROOT};

/// Scoring context: the history the next word is scored in.
///
/// Only meaningful for the `LanguageModel` that produced it; the methods
/// taking a `ContextState` panic when given one from a larger model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextState(NodeId);

/// Stateful query interface over a backoff model.
///
/// Scores are log10 probabilities computed by the same recursion the
/// compiled FST encodes with backoff arcs, so summing the scores of a
/// sentence gives the weight of its path through the FST.
#[derive(Debug, Clone)]
pub struct LanguageModel {
    trie: NgramTrie,
    symbols: Vocabulary,
}

impl LanguageModel {
    pub fn new(trie: NgramTrie, symbols: Vocabulary) -> Self {
        Self { trie, symbols }
    }

    /// Read an ARPA model with the default boundary symbols.
    pub fn read<R: BufRead>(reader: R, options: ArpaParseOptions) -> Result<Self> {
        let symbols = Vocabulary::new(&SymbolConfig::default())?;
        Self::read_with_symbols(reader, symbols, options)
    }

    pub fn read_with_symbols<R: BufRead>(
        reader: R,
        mut symbols: Vocabulary,
        options: ArpaParseOptions,
    ) -> Result<Self> {
        let (trie, _) = NgramTrie::read(reader, &mut symbols, options)?;
        Ok(Self { trie, symbols })
    }

    pub fn order(&self) -> usize {
        self.trie.order()
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.symbols
    }

    pub fn trie(&self) -> &NgramTrie {
        &self.trie
    }

    /// Context after `<s>`, or the empty context if the model has no `<s>`.
    pub fn begin_sentence(&self) -> ContextState {
        ContextState(self.trie.find(&[self.symbols.bos()]).unwrap_or(ROOT))
    }

    /// The empty context.
    pub fn null_context(&self) -> ContextState {
        ContextState(ROOT)
    }

    /// Words of the history a context stands for, oldest first.
    ///
    /// Panics if `state` came from another model.
    pub fn context_words(&self, state: ContextState) -> Vec<&str> {
        self.trie
            .node(state.0)
            .history()
            .iter()
            .map(|&label| self.symbols.symbol(label).unwrap_or("<unk>"))
            .collect()
    }

    /// Log10 probability of `word` in `state` and the context after it.
    /// Unknown words get the `<unk>` probability.
    ///
    /// Panics if `state` came from another model.
    pub fn score(&self, state: ContextState, word: &str) -> (f32, ContextState) {
        let (logprob, next, _) = self.walk(state, word);
        (logprob, next)
    }

    /// As `score`, for a word given by label.
    pub fn score_label(&self, state: ContextState, label: Label) -> (f32, ContextState) {
        let (logprob, next, _) = self.trie.walk(state.0, label);
        (logprob, ContextState(next))
    }

    /// Total log10 probability of a whitespace separated sentence.
    pub fn score_sentence(&self, sentence: &str, bos: bool, eos: bool) -> f32 {
        self.full_scores(sentence, bos, eos)
            .iter()
            .map(|&(logprob, _)| logprob)
            .sum()
    }

    /// Per-word log10 probability and length of the n-gram that matched
    /// (0 for an unknown word when the model has no `<unk>`). With `eos`
    /// the last entry is for `</s>`.
    pub fn full_scores(&self, sentence: &str, bos: bool, eos: bool) -> Vec<(f32, usize)> {
        let mut state = if bos {
            self.begin_sentence()
        } else {
            self.null_context()
        };
        let mut scores = Vec::new();
        for word in sentence.split_whitespace() {
            let (logprob, next, length) = self.walk(state, word);
            scores.push((logprob, length));
            state = next;
        }
        if eos {
            let (logprob, _, length) = self.trie.walk(state.0, self.symbols.eos());
            scores.push((logprob, length));
        }
        scores
    }

    /// 10^(-average log10 probability), counting `</s>` as a word.
    pub fn perplexity(&self, sentence: &str) -> f32 {
        let scores = self.full_scores(sentence, true, true);
        let total: f32 = scores.iter().map(|&(logprob, _)| logprob).sum();
        10f32.powf(-total / scores.len() as f32)
    }

    fn walk(&self, state: ContextState, word: &str) -> (f32, ContextState, usize) {
        // epsilon never labels an n-gram, so it always falls through to <unk>
        let label = self
            .symbols
            .find(word)
            .or(self.symbols.unk())
            .unwrap_or(EPS_LABEL);
        let (logprob, next, length) = self.trie.walk(state.0, label);
        (logprob, ContextState(next), length)
    }
}
