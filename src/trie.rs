use anyhow::{ensure, Result};
use rustfst::Label;
use std::collections::HashMap;
use std::io::BufRead;
use tracing::{debug, info};

use crate::arpa::{ArpaParseOptions, ArpaParser, NGram, NGramSink};
use crate::symbols::Vocabulary;
use crate::warnings::Warnings;

/// Index of a node in the trie arena.
pub type NodeId = usize;
/// The empty history.
pub const ROOT: NodeId = 0;
/// Log10 probability of an unknown word when the model has no `<unk>`.
pub const DEFAULT_UNK_LOGPROB: f32 = -100.0;

/// An n-gram emission out of a history.
#[derive(Debug, Clone, PartialEq)]
pub struct Child {
    pub word: Label,
    /// Log10 probability of `word` given the parent history.
    pub logprob: f32,
    /// Node for history + word, if that sequence is itself a history.
    pub node: Option<NodeId>,
    /// Context after emitting `word`: the longest suffix of history + word
    /// that is a node. Valid once the trie is finalized.
    pub next: NodeId,
    /// Placeholder for a history the file did not list.
    pub implicit: bool,
}

/// One history: a word sequence of length 0..order-1.
#[derive(Debug, Clone)]
pub struct TrieNode {
    history: Vec<Label>,
    /// Log10 backoff weight, 0 if the file gave none.
    backoff: f32,
    /// Longest proper suffix of the history that is a node. `None` for the root.
    backoff_node: Option<NodeId>,
    children: Vec<Child>,
    index: HashMap<Label, usize>,
}

impl TrieNode {
    fn new(history: Vec<Label>, backoff: f32) -> Self {
        Self {
            history,
            backoff,
            backoff_node: None,
            children: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn history(&self) -> &[Label] {
        &self.history
    }

    pub fn backoff(&self) -> f32 {
        self.backoff
    }

    pub fn backoff_node(&self) -> Option<NodeId> {
        self.backoff_node
    }

    /// Emissions in insertion order.
    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn child(&self, word: Label) -> Option<&Child> {
        self.index.get(&word).map(|&idx| &self.children[idx])
    }

    fn push_child(&mut self, child: Child) {
        self.index.insert(child.word, self.children.len());
        self.children.push(child);
    }
}

/// Backoff trie built from ARPA n-grams.
///
/// Nodes live in an arena indexed by `NodeId`; children and backoff
/// targets are indices, never owning references. Node ids follow creation
/// order, so they are a pure function of the input.
#[derive(Debug, Clone)]
pub struct NgramTrie {
    nodes: Vec<TrieNode>,
    histories: HashMap<Vec<Label>, NodeId>,
    order: usize,
    eos: Label,
    unk: Option<Label>,
    num_implicit: usize,
    finalized: bool,
}

impl NgramTrie {
    /// Empty trie; the order is taken from the ARPA header.
    pub fn new(symbols: &Vocabulary) -> Self {
        Self::with_order(symbols, 0)
    }

    pub fn with_order(symbols: &Vocabulary, order: usize) -> Self {
        let mut histories = HashMap::new();
        histories.insert(Vec::new(), ROOT);
        Self {
            nodes: vec![TrieNode::new(Vec::new(), 0.0)],
            histories,
            order,
            eos: symbols.eos(),
            unk: symbols.unk(),
            num_implicit: 0,
            finalized: false,
        }
    }

    /// Parse an ARPA model and build a finalized trie from it.
    pub fn read<R: BufRead>(
        reader: R,
        symbols: &mut Vocabulary,
        options: ArpaParseOptions,
    ) -> Result<(Self, Warnings)> {
        let mut trie = NgramTrie::new(symbols);
        let mut parser = ArpaParser::new(options, symbols);
        parser.read(reader, &mut trie)?;
        let warnings = parser.warnings().clone();
        trie.finalize();
        Ok((trie, warnings))
    }

    /// Add one n-gram. Missing histories are created as placeholders.
    pub fn insert(&mut self, ngram: &NGram) -> Result<()> {
        ensure!(!self.finalized, "cannot insert into a finalized trie");
        let order = ngram.order();
        ensure!(
            order >= 1 && order <= self.order,
            "{}-gram does not fit in a trie of order {}",
            order,
            self.order
        );
        let (history, last) = ngram.words.split_at(order - 1);
        let word = last[0];
        let backoff = ngram.backoff.unwrap_or(0.0);
        let parent = self.ensure_history(history);

        let existing = self.nodes[parent].index.get(&word).copied();
        if let Some(idx) = existing {
            let child = &mut self.nodes[parent].children[idx];
            if !child.implicit {
                debug!("duplicate n-gram {:?}, keeping the later one", ngram.words);
            }
            child.logprob = ngram.logprob;
            child.implicit = false;
            let child_node = child.node;
            if let Some(node) = child_node {
                self.nodes[node].backoff = backoff;
            }
            return Ok(());
        }

        let node = if order < self.order && word != self.eos {
            Some(self.add_node(ngram.words.clone(), backoff))
        } else {
            None
        };
        self.nodes[parent].push_child(Child {
            word,
            logprob: ngram.logprob,
            node,
            next: node.unwrap_or(ROOT),
            implicit: false,
        });
        Ok(())
    }

    fn add_node(&mut self, history: Vec<Label>, backoff: f32) -> NodeId {
        let id = self.nodes.len();
        self.histories.insert(history.clone(), id);
        self.nodes.push(TrieNode::new(history, backoff));
        id
    }

    /// Node for `history`, creating it and any missing prefixes.
    fn ensure_history(&mut self, history: &[Label]) -> NodeId {
        if let Some(&id) = self.histories.get(history) {
            return id;
        }
        let (prefix, last) = history.split_at(history.len() - 1);
        let parent = self.ensure_history(prefix);
        let word = last[0];
        let node = self.add_node(history.to_vec(), 0.0);
        self.num_implicit += 1;
        debug!("creating implicit history {:?}", history);
        let existing = self.nodes[parent].index.get(&word).copied();
        match existing {
            Some(idx) => self.nodes[parent].children[idx].node = Some(node),
            None => self.nodes[parent].push_child(Child {
                word,
                logprob: 0.0,
                node: Some(node),
                next: node,
                implicit: true,
            }),
        }
        node
    }

    /// Compute backoff targets and emission destinations, and give
    /// placeholder emissions their backed-off probability. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let backoff_nodes: Vec<Option<NodeId>> = self
            .nodes
            .iter()
            .map(|node| match node.history.split_first() {
                Some((_, tail)) => Some(self.longest_suffix(tail)),
                None => None,
            })
            .collect();
        for (node, backoff_node) in self.nodes.iter_mut().zip(backoff_nodes) {
            node.backoff_node = backoff_node;
        }

        for id in 0..self.nodes.len() {
            let nexts: Vec<NodeId> = self.nodes[id]
                .children
                .iter()
                .map(|child| match child.node {
                    Some(node) => node,
                    None if child.word == self.eos => ROOT,
                    None => {
                        let history = &self.nodes[id].history;
                        let mut seq = history.get(1..).unwrap_or(&[]).to_vec();
                        seq.push(child.word);
                        self.longest_suffix(&seq)
                    }
                })
                .collect();
            for (child, next) in self.nodes[id].children.iter_mut().zip(nexts) {
                child.next = next;
            }
        }

        // Shorter histories first: a placeholder's probability may back off
        // through placeholders of lower order.
        let mut ids: Vec<NodeId> = (0..self.nodes.len()).collect();
        ids.sort_by_key(|&id| self.nodes[id].history.len());
        for id in ids {
            for idx in 0..self.nodes[id].children.len() {
                if !self.nodes[id].children[idx].implicit {
                    continue;
                }
                let word = self.nodes[id].children[idx].word;
                let logprob = match self.nodes[id].backoff_node {
                    Some(parent) => self.nodes[id].backoff + self.walk(parent, word).0,
                    None => self.oov_logprob(),
                };
                self.nodes[id].children[idx].logprob = logprob;
            }
        }
        if self.num_implicit > 0 {
            info!("Created {} implicit histories", self.num_implicit);
        }
        self.finalized = true;
    }

    fn longest_suffix(&self, words: &[Label]) -> NodeId {
        (0..=words.len())
            .find_map(|start| self.histories.get(&words[start..]).copied())
            .unwrap_or(ROOT)
    }

    /// Backoff recursion: probability of `word` in `context`, the context
    /// reached after it, and the length of the n-gram that matched (0 for
    /// an unknown word).
    pub(crate) fn walk(&self, mut context: NodeId, word: Label) -> (f32, NodeId, usize) {
        let mut accum = 0.0;
        loop {
            let node = &self.nodes[context];
            if let Some(child) = node.child(word) {
                return (accum + child.logprob, child.next, node.history.len() + 1);
            }
            match node.backoff_node {
                Some(parent) => {
                    accum += node.backoff;
                    context = parent;
                }
                None => break,
            }
        }
        match self.unk.and_then(|unk| self.nodes[ROOT].child(unk)) {
            Some(child) => (accum + child.logprob, child.next, 0),
            None => (accum + DEFAULT_UNK_LOGPROB, ROOT, 0),
        }
    }

    /// Log10 probability of `word` given the history at `context`, and the
    /// context to score the following word in.
    pub fn prob(&self, context: NodeId, word: Label) -> Result<(f32, NodeId)> {
        ensure!(self.finalized, "trie must be finalized before scoring");
        ensure!(context < self.nodes.len(), "no such context {}", context);
        let (logprob, next, _) = self.walk(context, word);
        Ok((logprob, next))
    }

    /// Log10 probability of an out-of-vocabulary word at the root.
    pub fn oov_logprob(&self) -> f32 {
        self.unk
            .and_then(|unk| self.nodes[ROOT].child(unk))
            .map_or(DEFAULT_UNK_LOGPROB, |child| child.logprob)
    }

    pub fn find(&self, history: &[Label]) -> Option<NodeId> {
        self.histories.get(history).copied()
    }

    pub fn node(&self, id: NodeId) -> &TrieNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TrieNode)> {
        self.nodes.iter().enumerate()
    }

    /// Number of history nodes, including the root.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// True once any n-gram has been inserted.
    pub fn has_ngrams(&self) -> bool {
        !self.nodes[ROOT].children.is_empty()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn eos(&self) -> Label {
        self.eos
    }

    pub fn num_implicit(&self) -> usize {
        self.num_implicit
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl NGramSink for NgramTrie {
    fn header(&mut self, _counts: &[usize], max_order: usize) -> Result<()> {
        ensure!(
            self.nodes.len() == 1 && self.nodes[ROOT].children.is_empty(),
            "header must come before any n-gram"
        );
        self.order = max_order;
        Ok(())
    }

    fn consume(&mut self, ngram: NGram, _line: usize) -> Result<()> {
        self.insert(&ngram)
    }
}
