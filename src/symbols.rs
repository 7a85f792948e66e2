use anyhow::{Context, Result};
use rustfst::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::ArpaError;

/// Names of the reserved tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolConfig {
    pub bos: String,
    pub eos: String,
    pub unk: String,
    /// Disambiguation symbol for backoff arcs (e.g. `#0`), off by default.
    pub disambig: Option<String>,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            bos: "<s>".to_string(),
            eos: "</s>".to_string(),
            unk: "<unk>".to_string(),
            disambig: None,
        }
    }
}

impl SymbolConfig {
    fn validate(&self) -> Result<()> {
        let mut reserved = vec![&self.bos, &self.eos, &self.unk];
        reserved.extend(self.disambig.iter());
        for (i, sym) in reserved.iter().enumerate() {
            if sym.is_empty() || sym.chars().any(char::is_whitespace) {
                return Err(ArpaError::InvalidOptions(format!(
                    "reserved symbol '{}' must be a non-empty token without whitespace",
                    sym
                ))
                .into());
            }
            if reserved[..i].contains(sym) {
                return Err(ArpaError::InvalidOptions(format!(
                    "reserved symbol '{}' is used for two different purposes",
                    sym
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Token <-> label mapping shared by the parser, the trie and the FST.
///
/// A fresh vocabulary reserves labels in a fixed order (epsilon = 0, BOS,
/// EOS, UNK, then the disambiguation symbol if any) so that models compiled
/// with the same configuration are label-compatible. A vocabulary read from
/// an external table is frozen: interning an unseen token fails.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    table: SymbolTable,
    /// Where a frozen table came from, `None` if the table grows.
    source: Option<String>,
    bos: Label,
    eos: Label,
    unk: Option<Label>,
    disambig: Option<Label>,
}

impl Vocabulary {
    /// Create a growable vocabulary holding only the reserved tokens.
    pub fn new(config: &SymbolConfig) -> Result<Self> {
        config.validate()?;
        // SymbolTable::new() already holds <eps> at EPS_LABEL
        let mut table = SymbolTable::new();
        let bos = table.add_symbol(config.bos.as_str());
        let eos = table.add_symbol(config.eos.as_str());
        let unk = table.add_symbol(config.unk.as_str());
        let disambig = config
            .disambig
            .as_ref()
            .map(|sym| table.add_symbol(sym.as_str()));
        if [bos, eos, unk].contains(&EPS_LABEL) || disambig == Some(EPS_LABEL) {
            return Err(
                ArpaError::InvalidOptions("reserved symbols may not be epsilon".to_string()).into(),
            );
        }
        Ok(Self {
            table,
            source: None,
            bos,
            eos,
            unk: Some(unk),
            disambig,
        })
    }

    /// Wrap an existing table, freezing it. Id 0 must be `<eps>`. BOS, EOS
    /// and the disambiguation symbol (if configured) must be present; UNK is
    /// optional.
    pub fn from_table(table: SymbolTable, source: &str, config: &SymbolConfig) -> Result<Self> {
        config.validate()?;
        match table.get_symbol(EPS_LABEL) {
            Some(EPS_SYMBOL) => {}
            found => {
                return Err(ArpaError::MalformedSymbolTable {
                    location: source.to_string(),
                    reason: format!(
                        "id {} must be {}, found {}",
                        EPS_LABEL,
                        EPS_SYMBOL,
                        found.unwrap_or("nothing")
                    ),
                }
                .into())
            }
        }
        let require = |sym: &str| -> Result<Label> {
            match table.get_label(sym) {
                Some(EPS_LABEL) => Err(ArpaError::InvalidOptions(format!(
                    "reserved symbol '{}' is epsilon in {}",
                    sym, source
                ))
                .into()),
                Some(label) => Ok(label),
                None => Err(ArpaError::UnknownSymbol {
                    symbol: sym.to_string(),
                    table: source.to_string(),
                }
                .into()),
            }
        };
        let bos = require(&config.bos)?;
        let eos = require(&config.eos)?;
        let disambig = match &config.disambig {
            Some(sym) => Some(require(sym)?),
            None => None,
        };
        let unk = table
            .get_label(config.unk.as_str())
            .filter(|&label| label != EPS_LABEL);
        Ok(Self {
            table,
            source: Some(source.to_string()),
            bos,
            eos,
            unk,
            disambig,
        })
    }

    /// Read a frozen vocabulary from `token<whitespace>id` lines.
    pub fn read_text(path: &Path, config: &SymbolConfig) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(ArpaError::io(path))?;
        let source = path.display().to_string();
        let table = parse_symbol_table(&text, &source)?;
        Self::from_table(table, &source, config)
    }

    /// Write `token<TAB>id` lines in id order.
    pub fn write_text(&self, path: &Path) -> Result<()> {
        self.table
            .write_text(path)
            .with_context(|| format!("failed to write symbol table to {}", path.display()))
    }

    /// Label for `token`, assigning a new one on first sight unless frozen.
    pub fn intern(&mut self, token: &str) -> Result<Label> {
        if let Some(label) = self.table.get_label(token) {
            return Ok(label);
        }
        match &self.source {
            Some(source) => Err(ArpaError::UnknownSymbol {
                symbol: token.to_string(),
                table: source.clone(),
            }
            .into()),
            None => Ok(self.table.add_symbol(token)),
        }
    }

    pub fn find(&self, token: &str) -> Option<Label> {
        self.table.get_label(token)
    }

    pub fn symbol(&self, label: Label) -> Option<&str> {
        self.table.get_symbol(label)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    pub fn is_fixed(&self) -> bool {
        self.source.is_some()
    }

    pub fn bos(&self) -> Label {
        self.bos
    }

    pub fn eos(&self) -> Label {
        self.eos
    }

    pub fn unk(&self) -> Option<Label> {
        self.unk
    }

    pub fn disambig(&self) -> Option<Label> {
        self.disambig
    }

    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// Shared copy for attaching to an FST.
    pub fn shared(&self) -> Arc<SymbolTable> {
        Arc::new(self.table.clone())
    }
}

/// Parse a dense text symbol table (ids 0..n in order, one per line).
pub fn parse_symbol_table(text: &str, source: &str) -> Result<SymbolTable> {
    let malformed = |reason: String| ArpaError::MalformedSymbolTable {
        location: source.to_string(),
        reason,
    };
    let mut text = text.to_string();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    let table =
        SymbolTable::from_text_string(&text).map_err(|err| malformed(err.to_string()))?;
    // the rustfst parser stops quietly at the first line it cannot read
    let num_entries = text.lines().filter(|line| !line.trim().is_empty()).count();
    if table.len() < num_entries {
        return Err(malformed(format!(
            "cannot read entry {}, expected '<symbol> <id>'",
            table.len() + 1
        ))
        .into());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn it_reserves_labels_in_order() {
        let config = SymbolConfig {
            disambig: Some("#0".to_string()),
            ..Default::default()
        };
        let vocab = Vocabulary::new(&config).unwrap();
        assert_eq!(vocab.symbol(EPS_LABEL), Some("<eps>"));
        assert_eq!(vocab.bos(), 1);
        assert_eq!(vocab.eos(), 2);
        assert_eq!(vocab.unk(), Some(3));
        assert_eq!(vocab.disambig(), Some(4));
        assert_eq!(vocab.len(), 5);
    }

    #[test]
    fn it_interns_new_tokens_once() {
        let mut vocab = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let a = vocab.intern("a").unwrap();
        let b = vocab.intern("b").unwrap();
        assert_eq!(a, 4);
        assert_eq!(b, 5);
        assert_eq!(vocab.intern("a").unwrap(), a);
        assert_eq!(vocab.symbol(b), Some("b"));
        assert_eq!(vocab.find("c"), None);
    }

    #[test]
    fn it_rejects_conflicting_reserved_symbols() {
        let config = SymbolConfig {
            eos: "<s>".to_string(),
            ..Default::default()
        };
        let err = Vocabulary::new(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArpaError>(),
            Some(ArpaError::InvalidOptions(_))
        ));
    }

    #[test]
    fn fixed_table_refuses_new_tokens() {
        let text = "<eps>\t0\n<s>\t1\n</s>\t2\nhello\t3\n";
        let table = parse_symbol_table(text, "words.txt").unwrap();
        let mut vocab = Vocabulary::from_table(table, "words.txt", &SymbolConfig::default()).unwrap();
        assert!(vocab.is_fixed());
        assert_eq!(vocab.unk(), None);
        assert_eq!(vocab.intern("hello").unwrap(), 3);
        let err = vocab.intern("world").unwrap_err();
        match err.downcast_ref::<ArpaError>() {
            Some(ArpaError::UnknownSymbol { symbol, table }) => {
                assert_eq!(symbol, "world");
                assert_eq!(table, "words.txt");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn fixed_table_requires_disambig_symbol() {
        let text = "<eps> 0\n<s> 1\n</s> 2\n";
        let table = parse_symbol_table(text, "words.txt").unwrap();
        let config = SymbolConfig {
            disambig: Some("#0".to_string()),
            ..Default::default()
        };
        let err = Vocabulary::from_table(table, "words.txt", &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArpaError>(),
            Some(ArpaError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn it_rejects_sparse_ids() {
        let text = "<eps>\t0\n<s>\t2\n";
        let err = parse_symbol_table(text, "words.txt").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArpaError>(),
            Some(ArpaError::MalformedSymbolTable { .. })
        ));
    }

    #[test]
    fn it_rejects_unreadable_entries() {
        let text = "<eps> 0\n<s> 1 extra\n</s> 2\n";
        let err = parse_symbol_table(text, "words.txt").unwrap_err();
        match err.downcast_ref::<ArpaError>() {
            Some(ArpaError::MalformedSymbolTable { location, reason }) => {
                assert_eq!(location, "words.txt");
                assert!(reason.contains("entry 2"), "{}", reason);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // a missing final newline is fine
        let table = parse_symbol_table("<eps> 0\n<s> 1", "words.txt").unwrap();
        assert_eq!(table.get_label("<s>"), Some(1));
    }

    #[test]
    fn id_zero_must_be_epsilon() {
        let table = parse_symbol_table("foo\t0\n<s>\t1\n</s>\t2\n", "words.txt").unwrap();
        let err = Vocabulary::from_table(table, "words.txt", &SymbolConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArpaError>(),
            Some(ArpaError::MalformedSymbolTable { .. })
        ));
        let dir = tempdir().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "<s>\t0\n</s>\t1\n").unwrap();
        assert!(Vocabulary::read_text(&path, &SymbolConfig::default()).is_err());
    }

    #[test]
    fn it_round_trips_through_text() {
        let mut vocab = Vocabulary::new(&SymbolConfig::default()).unwrap();
        for word in ["the", "cat", "sat", "\u{3b2}"] {
            vocab.intern(word).unwrap();
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("words.txt");
        vocab.write_text(&path).unwrap();
        let reread = Vocabulary::read_text(&path, &SymbolConfig::default()).unwrap();
        assert_eq!(reread.len(), vocab.len());
        for label in 0..vocab.len() as Label {
            assert_eq!(reread.symbol(label), vocab.symbol(label));
        }
        assert_eq!(reread.bos(), vocab.bos());
        assert_eq!(reread.unk(), vocab.unk());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = Vocabulary::read_text(&dir.path().join("nope.txt"), &SymbolConfig::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArpaError>(),
            Some(ArpaError::Io { .. })
        ));
    }
}
