use anyhow::Result;
use rustfst::{Label, EPS_LABEL};
use std::io::BufRead;
use tracing::{debug, info, warn};

use crate::error::ArpaError;
use crate::symbols::Vocabulary;
use crate::warnings::Warnings;

/// What to do with n-grams containing words missing from the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OovHandling {
    /// Add novel words to the vocabulary (fails if it is frozen).
    #[default]
    AddToSymbols,
    /// Warn and drop the n-gram.
    SkipNGram,
    /// Replace the word with the unknown token.
    ReplaceWithUnk,
    /// Fail with MalformedArpa.
    Error,
}

/// Options that control `ArpaParser`.
#[derive(Debug, Clone)]
pub struct ArpaParseOptions {
    /// Maximum warnings to report, 0 for none, negative for all.
    pub max_warnings: i32,
    /// Highest order to keep; higher order n-grams are dropped.
    pub max_order: Option<usize>,
    pub oov_handling: OovHandling,
    /// Make section count mismatches fatal.
    pub strict_counts: bool,
}

impl Default for ArpaParseOptions {
    fn default() -> Self {
        Self {
            max_warnings: 30,
            max_order: None,
            oov_handling: OovHandling::default(),
            strict_counts: false,
        }
    }
}

/// A parsed n-gram, probabilities in log10 as written in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct NGram {
    /// Labels in left to right order.
    pub words: Vec<Label>,
    pub logprob: f32,
    /// Backoff weight, if the line had one.
    pub backoff: Option<f32>,
}

impl NGram {
    pub fn order(&self) -> usize {
        self.words.len()
    }
}

/// Receiver for parsed n-grams.
///
/// `header` is called once before any n-gram. N-grams arrive in file
/// order, so every (k-1)-gram is consumed before the first k-gram.
pub trait NGramSink {
    fn header(&mut self, _counts: &[usize], _max_order: usize) -> Result<()> {
        Ok(())
    }

    fn consume(&mut self, ngram: NGram, line: usize) -> Result<()>;
}

impl NGramSink for Vec<NGram> {
    fn consume(&mut self, ngram: NGram, _line: usize) -> Result<()> {
        self.push(ngram);
        Ok(())
    }
}

/// Line cursor that skips blank lines and remembers where it is.
struct LineCursor<R> {
    inner: R,
    line_number: usize,
    bytes: Vec<u8>,
    text: String,
}

impl<R: BufRead> LineCursor<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            line_number: 0,
            bytes: Vec::new(),
            text: String::new(),
        }
    }

    /// Advance to the next non-blank line, trailing whitespace removed.
    /// Returns false at end of input.
    fn advance(&mut self) -> Result<bool> {
        loop {
            self.bytes.clear();
            self.text.clear();
            self.line_number += 1;
            let nread = self
                .inner
                .read_until(b'\n', &mut self.bytes)
                .map_err(|source| ArpaError::Io {
                    location: format!("ARPA input, line {}", self.line_number),
                    source,
                })?;
            if nread == 0 {
                return Ok(false);
            }
            match std::str::from_utf8(&self.bytes) {
                Ok(text) => self.text.push_str(text.trim_end()),
                Err(_) => {
                    self.text
                        .push_str(String::from_utf8_lossy(&self.bytes).trim_end());
                    return Err(self.error("invalid UTF-8").into());
                }
            }
            if !self.text.trim_start().is_empty() {
                return Ok(true);
            }
        }
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn reference(&self) -> String {
        format!("line {} [{}]", self.line_number, self.text)
    }

    fn error(&self, reason: impl Into<String>) -> ArpaError {
        ArpaError::malformed(self.line_number, &self.text, reason)
    }
}

/// Streaming reader of the ARPA format.
///
/// Words are mapped to labels through the vocabulary, which may grow
/// depending on `OovHandling`.
pub struct ArpaParser<'a> {
    options: ArpaParseOptions,
    symbols: &'a mut Vocabulary,
    warnings: Warnings,
    max_order: usize,
}

impl<'a> ArpaParser<'a> {
    pub fn new(options: ArpaParseOptions, symbols: &'a mut Vocabulary) -> Self {
        let warnings = Warnings::new(options.max_warnings);
        Self {
            options,
            symbols,
            warnings,
            max_order: 0,
        }
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    /// Read a whole model, feeding n-grams to `sink`. Returns the n-gram
    /// counts declared in the header.
    pub fn read<R: BufRead, S: NGramSink>(&mut self, reader: R, sink: &mut S) -> Result<Vec<usize>> {
        if self.options.max_order == Some(0) {
            return Err(ArpaError::InvalidOptions("max_order must be at least 1".to_string()).into());
        }
        if self.options.oov_handling == OovHandling::ReplaceWithUnk && self.symbols.unk().is_none() {
            return Err(ArpaError::InvalidOptions(
                "replacing OOV words requires an unknown-word symbol".to_string(),
            )
            .into());
        }
        self.warnings = Warnings::new(self.options.max_warnings);
        let mut lines = LineCursor::new(reader);

        let counts = self.read_header(&mut lines)?;
        self.max_order = self
            .options
            .max_order
            .map_or(counts.len(), |max_order| max_order.min(counts.len()));
        sink.header(&counts, self.max_order)?;

        for order in 1..=counts.len() {
            let declared = counts[order - 1];
            if declared == 0 && self.warnings.should_warn() {
                warn!(
                    "Zero ngram count in ngram order {} (look for 'ngram {}=0' in the \\data\\ section). \
                     There is possibly a problem with the file.",
                    order, order
                );
            }
            let keyword = format!("\\{}-grams:", order);
            if lines.text() != keyword {
                return Err(lines.error(format!("invalid directive, expecting '{}'", keyword)).into());
            }
            info!("Reading {} section", keyword);

            let next_keyword = format!("\\{}-grams:", order + 1);
            let mut actual = 0;
            while lines.advance()? {
                if lines.text().starts_with('\\') {
                    if lines.text() == next_keyword || lines.text() == "\\end\\" {
                        break;
                    }
                    if self.warnings.should_warn() {
                        warn!(
                            "{}: ignoring possible directive, expecting '{}'",
                            lines.reference(),
                            next_keyword
                        );
                    }
                    continue;
                }
                actual += 1;
                if let Some(ngram) = self.parse_ngram(&lines, order, counts.len())? {
                    sink.consume(ngram, lines.line_number)?;
                }
            }

            if actual != declared {
                let mismatch = ArpaError::CountMismatch {
                    order,
                    declared,
                    actual,
                };
                if self.options.strict_counts {
                    return Err(mismatch.into());
                }
                if self.warnings.should_warn() {
                    warn!("{}", mismatch);
                }
            }
        }

        if lines.text() != "\\end\\" {
            return Err(lines
                .error("invalid or unexpected directive line, expecting \\end\\")
                .into());
        }
        self.warnings.summarize();
        Ok(counts)
    }

    /// Skip to `\data\` and read the `ngram K=N` lines after it. Leaves the
    /// cursor on the first directive following the header.
    fn read_header<R: BufRead>(&mut self, lines: &mut LineCursor<R>) -> Result<Vec<usize>> {
        let mut found = false;
        let mut counts = Vec::<usize>::new();
        while lines.advance()? {
            if !found {
                if lines.text() == "\\data\\" {
                    info!("Reading \\data\\ section");
                    found = true;
                }
                continue;
            }
            if lines.text().starts_with('\\') {
                break;
            }
            // Guarantee spaces around the "=".
            let spaced = lines.text().replace('=', " = ");
            let cols: Vec<&str> = spaced.split_whitespace().collect();
            if cols.len() == 4 && cols[0] == "ngram" && cols[2] == "=" {
                let (order, count) = match (cols[1].parse::<usize>(), cols[3].parse::<usize>()) {
                    (Ok(order), Ok(count)) if order > 0 => (order, count),
                    _ => return Err(lines.error("cannot parse ngram count").into()),
                };
                if counts.len() < order {
                    counts.resize(order, 0);
                }
                counts[order - 1] = count;
            } else if self.warnings.should_warn() {
                warn!("{}: uninterpretable line in \\data\\ section", lines.reference());
            }
        }
        if !found {
            return Err(lines.error("\\data\\ section missing").into());
        }
        if counts.is_empty() {
            return Err(lines.error("\\data\\ section missing or empty").into());
        }
        Ok(counts)
    }

    /// Parse one data line. `None` means the n-gram is dropped.
    fn parse_ngram<R: BufRead>(
        &mut self,
        lines: &LineCursor<R>,
        order: usize,
        file_order: usize,
    ) -> Result<Option<NGram>> {
        let fields: Vec<&str> = lines
            .text()
            .split(|c| c == ' ' || c == '\t')
            .filter(|field| !field.is_empty())
            .collect();
        if fields.len() < order + 1
            || fields.len() > order + 2
            || (order == file_order && fields.len() != order + 1)
        {
            return Err(lines.error("invalid n-gram data line").into());
        }
        let logprob: f32 = fields[0]
            .parse()
            .map_err(|_| lines.error(format!("invalid n-gram logprob '{}'", fields[0])))?;
        let backoff = match fields.get(order + 1) {
            Some(field) => Some(
                field
                    .parse::<f32>()
                    .map_err(|_| lines.error(format!("invalid backoff weight '{}'", field)))?,
            ),
            None => None,
        };
        if order > self.max_order {
            return Ok(None);
        }

        let mut words = Vec::with_capacity(order);
        for token in &fields[1..=order] {
            let word = match self.options.oov_handling {
                OovHandling::AddToSymbols => self.symbols.intern(token)?,
                oov_handling => match (self.symbols.find(token), oov_handling) {
                    (Some(word), _) => word,
                    (None, OovHandling::ReplaceWithUnk) => {
                        self.symbols.unk().unwrap_or(EPS_LABEL)
                    }
                    (None, OovHandling::SkipNGram) => {
                        if self.warnings.should_warn() {
                            warn!(
                                "{} skipped: word '{}' not in symbol table",
                                lines.reference(),
                                token
                            );
                        }
                        return Ok(None);
                    }
                    (None, _) => {
                        return Err(lines
                            .error(format!("word '{}' not in symbol table", token))
                            .into())
                    }
                },
            };
            if word == EPS_LABEL {
                return Err(lines
                    .error(format!("epsilon symbol '{}' is illegal in ARPA LM", token))
                    .into());
            }
            if Some(word) == self.symbols.disambig() {
                return Err(lines
                    .error(format!("disambiguation symbol '{}' is illegal in ARPA LM", token))
                    .into());
            }
            words.push(word);
        }

        // <s> is invalid in tails, </s> in heads of an n-gram.
        let (bos, eos) = (self.symbols.bos(), self.symbols.eos());
        let misplaced = words
            .iter()
            .enumerate()
            .any(|(i, &word)| (i > 0 && word == bos) || (i + 1 < words.len() && word == eos));
        if misplaced {
            if self.warnings.should_warn() {
                warn!(
                    "{} skipped: n-gram has invalid BOS/EOS placement",
                    lines.reference()
                );
            }
            return Ok(None);
        }

        debug!("{}-gram {:?} logprob {} backoff {:?}", order, words, logprob, backoff);
        Ok(Some(NGram {
            words,
            logprob,
            backoff,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{parse_symbol_table, SymbolConfig};
    use std::fs::File;
    use std::io::{BufReader, Cursor};

    const SYMBOLIC_LM: &str = "\
We also allow random text coming before the \\data\\
section marker. Even this is ok:

\\1-grams:

and should be ignored before the \\data\\ marker
is seen alone by itself on a line.

\\data\\
ngram 1=4
ngram 2=2
ngram 3=2

\\1-grams:
-5.2\ta\t-3.3
-3.4\t\u{3b2}
0.0\t<s>\t-2.5
-4.3\t</s>

\\2-grams:\t
-1.5\ta \u{3b2}\t-3.2
-1.3\t<s> a\t-4.2

\\3-grams:
-0.3\t<s> a \u{3b2}
-0.2\t<s> a </s>
\\end\\";

    /// Keeps line numbers and the header alongside the n-grams.
    #[derive(Default)]
    struct Recorder {
        counts: Vec<usize>,
        max_order: usize,
        ngrams: Vec<(usize, NGram)>,
    }

    impl NGramSink for Recorder {
        fn header(&mut self, counts: &[usize], max_order: usize) -> Result<()> {
            assert!(self.ngrams.is_empty());
            self.counts = counts.to_vec();
            self.max_order = max_order;
            Ok(())
        }

        fn consume(&mut self, ngram: NGram, line: usize) -> Result<()> {
            if let Some((_, last)) = self.ngrams.last() {
                assert!(last.order() <= ngram.order());
            }
            self.ngrams.push((line, ngram));
            Ok(())
        }
    }

    fn ngram(words: &[Label], logprob: f32, backoff: Option<f32>) -> NGram {
        NGram {
            words: words.to_vec(),
            logprob,
            backoff,
        }
    }

    /// Vocabulary with "a" but no beta: eps 0, <s> 1, </s> 2, <unk> 3, a 4.
    fn frozen_vocabulary() -> Vocabulary {
        let text = "<eps>\t0\n<s>\t1\n</s>\t2\n<unk>\t3\na\t4\n";
        let table = parse_symbol_table(text, "test").unwrap();
        Vocabulary::from_table(table, "test", &SymbolConfig::default()).unwrap()
    }

    fn parse_with(
        text: &str,
        options: ArpaParseOptions,
        symbols: &mut Vocabulary,
    ) -> Result<(Recorder, usize)> {
        let mut recorder = Recorder::default();
        let mut parser = ArpaParser::new(options, symbols);
        parser.read(Cursor::new(text), &mut recorder)?;
        let warnings = parser.warnings().count();
        Ok((recorder, warnings))
    }

    fn error_of(result: Result<(Recorder, usize)>) -> ArpaError {
        match result {
            Ok(_) => panic!("parse unexpectedly succeeded"),
            Err(err) => err.downcast::<ArpaError>().unwrap(),
        }
    }

    #[test]
    fn it_reads_a_symbolic_lm() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let (recorder, warnings) =
            parse_with(SYMBOLIC_LM, ArpaParseOptions::default(), &mut symbols).unwrap();
        assert_eq!(recorder.counts, vec![4, 2, 2]);
        assert_eq!(recorder.max_order, 3);
        assert_eq!(warnings, 0);
        assert_eq!(symbols.len(), 6);
        assert_eq!(symbols.find("\u{3b2}"), Some(5));
        let expected = vec![
            (15, ngram(&[4], -5.2, Some(-3.3))),
            (16, ngram(&[5], -3.4, None)),
            (17, ngram(&[1], 0.0, Some(-2.5))),
            (18, ngram(&[2], -4.3, None)),
            (21, ngram(&[4, 5], -1.5, Some(-3.2))),
            (22, ngram(&[1, 4], -1.3, Some(-4.2))),
            (25, ngram(&[1, 4, 5], -0.3, None)),
            (26, ngram(&[1, 4, 2], -0.2, None)),
        ];
        assert_eq!(recorder.ngrams, expected);
    }

    #[test]
    fn it_replaces_oov_with_unk() {
        let mut symbols = frozen_vocabulary();
        let options = ArpaParseOptions {
            oov_handling: OovHandling::ReplaceWithUnk,
            ..Default::default()
        };
        let (recorder, _) = parse_with(SYMBOLIC_LM, options, &mut symbols).unwrap();
        let words: Vec<Vec<Label>> = recorder.ngrams.into_iter().map(|(_, n)| n.words).collect();
        assert_eq!(
            words,
            vec![
                vec![4],
                vec![3],
                vec![1],
                vec![2],
                vec![4, 3],
                vec![1, 4],
                vec![1, 4, 3],
                vec![1, 4, 2]
            ]
        );
        assert_eq!(symbols.len(), 5);
    }

    #[test]
    fn it_skips_ngrams_with_oov() {
        let mut symbols = frozen_vocabulary();
        let options = ArpaParseOptions {
            oov_handling: OovHandling::SkipNGram,
            ..Default::default()
        };
        let (recorder, warnings) = parse_with(SYMBOLIC_LM, options, &mut symbols).unwrap();
        let lines: Vec<usize> = recorder.ngrams.iter().map(|(line, _)| *line).collect();
        assert_eq!(lines, vec![15, 17, 18, 22, 26]);
        assert_eq!(warnings, 3);
        assert_eq!(symbols.len(), 5);
    }

    #[test]
    fn it_fails_on_oov_when_asked() {
        let mut symbols = frozen_vocabulary();
        let options = ArpaParseOptions {
            oov_handling: OovHandling::Error,
            ..Default::default()
        };
        match error_of(parse_with(SYMBOLIC_LM, options, &mut symbols)) {
            ArpaError::MalformedArpa { line, .. } => assert_eq!(line, 16),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn it_fails_on_oov_in_frozen_table_when_adding() {
        let mut symbols = frozen_vocabulary();
        let err = error_of(parse_with(SYMBOLIC_LM, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::UnknownSymbol { .. }));
    }

    #[test]
    fn it_truncates_to_max_order() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let options = ArpaParseOptions {
            max_order: Some(2),
            ..Default::default()
        };
        let (recorder, _) = parse_with(SYMBOLIC_LM, options, &mut symbols).unwrap();
        assert_eq!(recorder.counts, vec![4, 2, 2]);
        assert_eq!(recorder.max_order, 2);
        assert_eq!(recorder.ngrams.len(), 6);
        assert!(recorder.ngrams.iter().all(|(_, n)| n.order() <= 2));
    }

    #[test]
    fn it_requires_a_header() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let text = "\\1-grams:\n-1.0\ta\n\\end\\\n";
        let err = error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::MalformedArpa { .. }));

        let text = "\\data\\\n\\1-grams:\n-1.0\ta\n\\end\\\n";
        match error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols)) {
            ArpaError::MalformedArpa { line, reason, .. } => {
                assert_eq!(line, 2);
                assert!(reason.contains("empty"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn it_rejects_sections_out_of_order() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let text = "\\data\\\nngram 1=1\nngram 2=1\n\n\\2-grams:\n-1.0\ta a\n\\end\\\n";
        match error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols)) {
            ArpaError::MalformedArpa { line, text, .. } => {
                assert_eq!(line, 5);
                assert_eq!(text, "\\2-grams:");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn it_rejects_malformed_lines() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        // backoff on the highest order
        let text = "\\data\\\nngram 1=1\n\\1-grams:\n-1.0\ta\t-0.5\n\\end\\\n";
        let err = error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::MalformedArpa { line: 4, .. }));
        // not a number
        let text = "\\data\\\nngram 1=1\n\\1-grams:\nminus-one\ta\n\\end\\\n";
        let err = error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::MalformedArpa { line: 4, .. }));
        // epsilon is not a word
        let text = "\\data\\\nngram 1=1\n\\1-grams:\n-1.0\t<eps>\n\\end\\\n";
        let err = error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::MalformedArpa { line: 4, .. }));
        // no \end\
        let text = "\\data\\\nngram 1=1\n\\1-grams:\n-1.0\ta\n";
        let err = error_of(parse_with(text, ArpaParseOptions::default(), &mut symbols));
        assert!(matches!(err, ArpaError::MalformedArpa { .. }));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let bytes: &[u8] = b"\\data\\\nngram 1=2\n\n\\1-grams:\n-0.5\t\xe9a\n-1.0\tb\n\\end\\\n";
        let mut parser = ArpaParser::new(ArpaParseOptions::default(), &mut symbols);
        let mut ngrams = Vec::<NGram>::new();
        let err = parser.read(Cursor::new(bytes), &mut ngrams).unwrap_err();
        match err.downcast_ref::<ArpaError>() {
            Some(ArpaError::MalformedArpa { line, reason, .. }) => {
                assert_eq!(*line, 5);
                assert_eq!(reason, "invalid UTF-8");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn it_warns_about_miscounted_sections() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let reader = BufReader::new(File::open("testdata/miscounted.arpa").unwrap());
        let mut ngrams = Vec::<NGram>::new();
        let options = ArpaParseOptions {
            max_warnings: 1,
            ..Default::default()
        };
        let mut parser = ArpaParser::new(options, &mut symbols);
        let counts = parser.read(reader, &mut ngrams).unwrap();
        assert_eq!(counts, vec![4, 3]);
        assert_eq!(ngrams.len(), 5);
        // two count mismatches and one stray directive
        assert_eq!(parser.warnings().count(), 3);
        assert_eq!(parser.warnings().suppressed(), 2);
    }

    #[test]
    fn strict_counts_make_mismatches_fatal() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let reader = BufReader::new(File::open("testdata/miscounted.arpa").unwrap());
        let options = ArpaParseOptions {
            strict_counts: true,
            ..Default::default()
        };
        let err = ArpaParser::new(options, &mut symbols)
            .read(reader, &mut Vec::<NGram>::new())
            .unwrap_err();
        match err.downcast_ref::<ArpaError>() {
            Some(ArpaError::CountMismatch {
                order,
                declared,
                actual,
            }) => assert_eq!((*order, *declared, *actual), (1, 4, 3)),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn it_accepts_an_empty_order() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let reader = BufReader::new(File::open("testdata/zero_bigrams.arpa").unwrap());
        let mut ngrams = Vec::<NGram>::new();
        let mut parser = ArpaParser::new(ArpaParseOptions::default(), &mut symbols);
        assert_eq!(parser.read(reader, &mut ngrams).unwrap(), vec![3, 0]);
        assert_eq!(ngrams.len(), 3);
        assert_eq!(parser.warnings().count(), 1);
    }

    #[test]
    fn it_skips_misplaced_sentence_boundaries() {
        let mut symbols = Vocabulary::new(&SymbolConfig::default()).unwrap();
        let text = "\\data\\\nngram 1=3\nngram 2=3\n\n\\1-grams:\n-1\t</s>\n-1\t<s>\t-1\n-1\ta\t-1\n\n\
                    \\2-grams:\n-1\ta <s>\n-1\t</s> a\n-1\t<s> a\n\\end\\\n";
        let (recorder, warnings) =
            parse_with(text, ArpaParseOptions::default(), &mut symbols).unwrap();
        assert_eq!(recorder.ngrams.len(), 4);
        assert_eq!(recorder.ngrams[3].1.words, vec![1, 4]);
        assert_eq!(warnings, 2);
    }
}
