use anyhow::{anyhow, ensure, Result};
use rustfst::prelude::*;
use rustfst::semirings::Semiring;
use std::f32::consts::LN_10;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use crate::symbols::Vocabulary;
use crate::trie::{NgramTrie, NodeId, TrieNode, ROOT};
use crate::StdVectorFst;

/// Units of the tropical weights written on arcs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightUnits {
    /// -ln(p), what shortest-path tools over the tropical semiring expect.
    #[default]
    NaturalLog,
    /// -log10(p), the units of the ARPA file.
    Log10,
}

impl WeightUnits {
    /// Arc weight for a log10 probability or backoff.
    pub fn weight(self, log10: f32) -> f32 {
        match self {
            WeightUnits::NaturalLog => -log10 * LN_10,
            WeightUnits::Log10 => -log10,
        }
    }

    /// Inverse of `weight`.
    pub fn to_log10(self, weight: f32) -> f32 {
        match self {
            WeightUnits::NaturalLog => -weight / LN_10,
            WeightUnits::Log10 => -weight,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            WeightUnits::NaturalLog => "-ln(p)",
            WeightUnits::Log10 => "-log10(p)",
        }
    }
}

/// Options for `build_fst`.
#[derive(Debug, Clone)]
pub struct FstOptions {
    pub ilabel_sort: bool,
    pub weight_units: WeightUnits,
    /// Attach the vocabulary as input and output symbols.
    pub keep_symbols: bool,
}

impl Default for FstOptions {
    fn default() -> Self {
        Self {
            ilabel_sort: true,
            weight_units: WeightUnits::default(),
            keep_symbols: false,
        }
    }
}

/// Compile a finalized trie into an FST.
///
/// Every kept history becomes a state with an arc per n-gram and a backoff
/// arc to its shorter context. Without a disambiguation symbol, `<s>` and
/// `</s>` are real labels: a dedicated start state accepts `<s>` for free and
/// every `</s>` arc ends in one shared final state. With a disambiguation
/// symbol, the `<s>` history is the start state, `</s>` becomes a final
/// weight, backoff arcs read the disambiguation symbol, and states whose only
/// arc is a backoff arc are bypassed.
pub fn build_fst(
    trie: &NgramTrie,
    symbols: &Vocabulary,
    options: &FstOptions,
) -> Result<StdVectorFst> {
    ensure!(trie.is_finalized(), "trie must be finalized before building an FST");
    let units = options.weight_units;
    let disambig = symbols.disambig();
    let (bos, eos) = (symbols.bos(), symbols.eos());

    let start_node = match trie.find(&[bos]) {
        Some(node) => node,
        None => {
            warn!(
                "model has no '{}' history, starting from the empty history",
                symbols.symbol(bos).unwrap_or("<s>")
            );
            ROOT
        }
    };
    let redundant = |id: NodeId, node: &TrieNode| {
        disambig.is_some() && id != ROOT && id != start_node && node.children().is_empty()
    };

    // State ids are assigned up front, in trie order.
    let mut state_of = Vec::<Option<StateId>>::with_capacity(trie.num_nodes());
    let mut num_states: StateId = 0;
    for (id, node) in trie.nodes() {
        if redundant(id, node) {
            state_of.push(None);
        } else {
            state_of.push(Some(num_states));
            num_states += 1;
        }
    }
    // Follow backoffs out of bypassed nodes, accumulating their weight.
    let resolve = |mut id: NodeId| -> (StateId, f32) {
        let mut accum = 0.0;
        loop {
            if let Some(state) = state_of[id] {
                return (state, accum);
            }
            let node = trie.node(id);
            accum += node.backoff();
            id = node.backoff_node().unwrap_or(ROOT);
        }
    };

    let mut fst = StdVectorFst::new();
    for _ in 0..num_states {
        fst.add_state();
    }
    let eos_state = if disambig.is_none() {
        let state = fst.add_state();
        fst.set_final(state, TropicalWeight::one())?;
        Some(state)
    } else {
        None
    };

    for (id, node) in trie.nodes() {
        let state = match state_of[id] {
            Some(state) => state,
            None => continue,
        };
        if let Some(backoff_node) = node.backoff_node() {
            let (dest, extra) = resolve(backoff_node);
            fst.add_tr(
                state,
                Tr::new(
                    disambig.unwrap_or(EPS_LABEL),
                    EPS_LABEL,
                    units.weight(node.backoff() + extra),
                    dest,
                ),
            )?;
        }
        for child in node.children() {
            if child.word == bos && id == ROOT {
                // Accepting <s> is always free, and only at the start.
                continue;
            }
            if child.word == eos {
                match eos_state {
                    Some(eos_state) => fst.add_tr(
                        state,
                        Tr::new(eos, eos, units.weight(child.logprob), eos_state),
                    )?,
                    None => fst.set_final(state, units.weight(child.logprob))?,
                }
                continue;
            }
            let (dest, extra) = resolve(child.next);
            fst.add_tr(
                state,
                Tr::new(
                    child.word,
                    child.word,
                    units.weight(child.logprob + extra),
                    dest,
                ),
            )?;
        }
    }

    let start_state = state_of[start_node]
        .ok_or_else(|| anyhow!("start history {} has no state", start_node))?;
    if disambig.is_some() {
        fst.set_start(start_state)?;
    } else {
        let start = fst.add_state();
        fst.add_tr(start, Tr::new(bos, bos, TropicalWeight::one(), start_state))?;
        fst.set_start(start)?;
    }

    let bypassed = state_of.iter().filter(|state| state.is_none()).count();
    if bypassed > 0 {
        info!(
            "Reduced num-states from {} to {}",
            fst.num_states() + bypassed,
            fst.num_states()
        );
    }
    info!(
        "Built FST with {} states, weights in {}",
        fst.num_states(),
        units.describe()
    );

    if options.ilabel_sort {
        tr_sort(&mut fst, ILabelCompare {});
    }
    if options.keep_symbols {
        let syms = symbols.shared();
        fst.set_input_symbols(Arc::clone(&syms));
        fst.set_output_symbols(Arc::clone(&syms));
    }
    Ok(fst)
}

/// AT&T text listing: the start state first, then the others in order.
/// Arcs are `src dst ilabel olabel [weight]`, finals `state [weight]`,
/// with weights equal to One left out.
pub fn print_fst(fst: &StdVectorFst) -> Result<String> {
    let mut out = String::new();
    let start = match fst.start() {
        Some(start) => start,
        None => return Ok(out),
    };
    let num_states = fst.num_states() as StateId;
    let states = std::iter::once(start).chain((0..num_states).filter(|&s| s != start));
    for state in states {
        for tr in fst.get_trs(state)?.trs() {
            write!(out, "{}\t{}\t{}\t{}", state, tr.nextstate, tr.ilabel, tr.olabel)?;
            if tr.weight != TropicalWeight::one() {
                write!(out, "\t{}", tr.weight.value())?;
            }
            out.push('\n');
        }
        if let Some(weight) = fst.final_weight(state)? {
            if weight == TropicalWeight::one() {
                writeln!(out, "{}", state)?;
            } else {
                writeln!(out, "{}\t{}", state, weight.value())?;
            }
        }
    }
    Ok(out)
}

/// Total weight of the path reading `labels` from the start state, taking
/// the backoff arc (input `backoff_label`, output epsilon) whenever the
/// current state has no arc for the next label, and backing off the same
/// way until a final state is reached. `None` if the path gets stuck.
pub fn backoff_path_weight(
    fst: &StdVectorFst,
    backoff_label: Label,
    labels: &[Label],
) -> Result<Option<f32>> {
    let is_backoff = |tr: &&Tr<TropicalWeight>| tr.ilabel == backoff_label && tr.olabel == EPS_LABEL;
    let mut state = match fst.start() {
        Some(start) => start,
        None => return Ok(None),
    };
    let mut total = 0.0;
    for &label in labels {
        loop {
            let trs = fst.get_trs(state)?;
            let tr = match trs.trs().iter().find(|tr| tr.ilabel == label) {
                Some(tr) => {
                    total += *tr.weight.value();
                    state = tr.nextstate;
                    break;
                }
                None => trs.trs().iter().find(is_backoff),
            };
            match tr {
                Some(tr) => {
                    total += *tr.weight.value();
                    state = tr.nextstate;
                }
                None => return Ok(None),
            }
        }
    }
    loop {
        if let Some(weight) = fst.final_weight(state)? {
            return Ok(Some(total + *weight.value()));
        }
        let trs = fst.get_trs(state)?;
        match trs.trs().iter().find(is_backoff) {
            Some(tr) => {
                total += *tr.weight.value();
                state = tr.nextstate;
            }
            None => return Ok(None),
        }
    }
}
