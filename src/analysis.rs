use std::sync::Arc;

use hashbrown::HashMap;

/// One token produced by a [`TokenStream`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Token {
    pub text: String,
    /// Position gap to the previous token; 1 for adjacent tokens, larger
    /// values leave holes (removed stop words), 0 stacks synonyms.
    pub position_increment: u32,
    pub start_offset: u32,
    pub end_offset: u32,
    pub payload: Option<Vec<u8>>,
}

/// Attribute pump: `increment_token` advances to the next token and returns
/// false at end of stream, after which `token()` is undefined.
pub trait TokenStream {
    fn increment_token(&mut self) -> bool;
    fn token(&self) -> &Token;
}

/// Supplies a token stream per (field, text). Analyzers must be cheap to
/// call per document; any heavyweight setup belongs in the constructor.
pub trait Analyzer: Send + Sync {
    fn token_stream(&self, field: &str, text: &str) -> Box<dyn TokenStream>;

    /// Extra position increment between multiple values of the same field
    /// in one document, so phrases cannot match across value boundaries.
    fn position_increment_gap(&self, _field: &str) -> u32 {
        0
    }
}

/// Tokens are maximal runs of characters accepted by `keep`, optionally
/// lowercased. Both bundled analyzers reduce to this.
struct CharRunStream {
    chars: Vec<(usize, char)>,
    byte_len: usize,
    pos: usize,
    lowercase: bool,
    keep: fn(char) -> bool,
    current: Token,
}

impl CharRunStream {
    fn new(text: &str, keep: fn(char) -> bool, lowercase: bool) -> Self {
        Self {
            chars: text.char_indices().collect(),
            byte_len: text.len(),
            pos: 0,
            lowercase,
            keep,
            current: Token::default(),
        }
    }
}

impl TokenStream for CharRunStream {
    fn increment_token(&mut self) -> bool {
        while self.pos < self.chars.len() && !(self.keep)(self.chars[self.pos].1) {
            self.pos += 1;
        }
        if self.pos >= self.chars.len() {
            return false;
        }
        let start = self.chars[self.pos].0;
        let mut text = String::new();
        while self.pos < self.chars.len() && (self.keep)(self.chars[self.pos].1) {
            let ch = self.chars[self.pos].1;
            if self.lowercase {
                text.extend(ch.to_lowercase());
            } else {
                text.push(ch);
            }
            self.pos += 1;
        }
        let end = if self.pos < self.chars.len() {
            self.chars[self.pos].0
        } else {
            self.byte_len
        };
        self.current = Token {
            text,
            position_increment: 1,
            start_offset: start as u32,
            end_offset: end as u32,
            payload: None,
        };
        true
    }

    fn token(&self) -> &Token {
        &self.current
    }
}

/// Splits on whitespace, keeps case.
#[derive(Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Box<dyn TokenStream> {
        Box::new(CharRunStream::new(text, |c| !c.is_whitespace(), false))
    }
}

/// Letter runs, lowercased.
#[derive(Default)]
pub struct SimpleAnalyzer;

impl Analyzer for SimpleAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Box<dyn TokenStream> {
        Box::new(CharRunStream::new(text, char::is_alphabetic, true))
    }
}

/// Emits the whole value as a single token. Identifier fields.
#[derive(Default)]
pub struct KeywordAnalyzer;

struct SingleTokenStream {
    token: Option<Token>,
    current: Token,
}

impl TokenStream for SingleTokenStream {
    fn increment_token(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                self.current = token;
                true
            }
            None => false,
        }
    }

    fn token(&self) -> &Token {
        &self.current
    }
}

impl Analyzer for KeywordAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Box<dyn TokenStream> {
        Box::new(SingleTokenStream {
            token: Some(Token {
                text: text.to_string(),
                position_increment: 1,
                start_offset: 0,
                end_offset: text.len() as u32,
                payload: None,
            }),
            current: Token::default(),
        })
    }
}

/// Routes each field to its own analyzer, falling back to a default.
pub struct PerFieldAnalyzer {
    default: Arc<dyn Analyzer>,
    overrides: HashMap<String, Arc<dyn Analyzer>>,
}

impl PerFieldAnalyzer {
    pub fn new(default: Arc<dyn Analyzer>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn add<N: Into<String>>(&mut self, field: N, analyzer: Arc<dyn Analyzer>) -> &mut Self {
        self.overrides.insert(field.into(), analyzer);
        self
    }
}

impl Analyzer for PerFieldAnalyzer {
    fn token_stream(&self, field: &str, text: &str) -> Box<dyn TokenStream> {
        self.overrides
            .get(field)
            .unwrap_or(&self.default)
            .token_stream(field, text)
    }

    fn position_increment_gap(&self, field: &str) -> u32 {
        self.overrides
            .get(field)
            .unwrap_or(&self.default)
            .position_increment_gap(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(analyzer: &dyn Analyzer, text: &str) -> Vec<String> {
        let mut stream = analyzer.token_stream("f", text);
        let mut tokens = Vec::new();
        while stream.increment_token() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }

    #[test]
    fn whitespace_keeps_case() {
        assert_eq!(
            collect(&WhitespaceAnalyzer, "Quick  Brown\tfox"),
            vec!["Quick", "Brown", "fox"]
        );
    }

    #[test]
    fn simple_lowercases_letter_runs() {
        assert_eq!(
            collect(&SimpleAnalyzer, "It's 2 Fast"),
            vec!["it", "s", "fast"]
        );
    }

    #[test]
    fn keyword_is_one_token() {
        assert_eq!(
            collect(&KeywordAnalyzer, "New York"),
            vec!["New York"]
        );
    }

    #[test]
    fn offsets_cover_source() {
        let mut stream = WhitespaceAnalyzer.token_stream("f", "ab cd");
        assert!(stream.increment_token());
        assert_eq!(
            (stream.token().start_offset, stream.token().end_offset),
            (0, 2)
        );
        assert!(stream.increment_token());
        assert_eq!(
            (stream.token().start_offset, stream.token().end_offset),
            (3, 5)
        );
    }
}
