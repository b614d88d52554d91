//! The lexer.
//!
//! Turns a source buffer into a chain of tokens stored in one arena
//! ([TokenStream]); successor links are arena indices, which lets the
//! preprocessor splice replacement tokens without dangling pointers. In
//! preprocessing mode whitespace, comments and line breaks survive as
//! `ignorable`/`line-break` tokens so the `-E` writer can reproduce the input
//! byte for byte.

use std::collections::VecDeque;

use derive_more::Display;
use log::debug;
use regex::Regex;

use crate::common::{CompileError, Result};

/// Index of a token inside its [TokenStream] arena.
pub type TokenId = usize;

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum TokenKind {
    /// Reserved punctuation (`==`, `->`, `;`, ...).
    #[display("punct")]
    Punct,
    /// A `#name` directive head; the whole `#name` is one token.
    #[display("directive")]
    Directive,
    /// Whitespace or a comment; produced only in preprocessing mode.
    #[display("ignorable")]
    Ignorable,
    #[display("line-break")]
    LineBreak,
    #[display("id")]
    Ident,
    #[display("string")]
    Str,
    #[display("num")]
    Num,
    #[display("{_0}")]
    Keyword(Keyword),
    #[display("eof")]
    Eof,
}

/// The closed set of identifiers reclassified into reserved words.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Keyword {
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("for")]
    For,
    #[display("while")]
    While,
    #[display("do")]
    Do,
    #[display("return")]
    Return,
    #[display("sizeof")]
    Sizeof,
    #[display("int")]
    Int,
    #[display("char")]
    Char,
    #[display("long")]
    Long,
    #[display("short")]
    Short,
    #[display("void")]
    Void,
    #[display("struct")]
    Struct,
    #[display("union")]
    Union,
    #[display("enum")]
    Enum,
    #[display("typedef")]
    Typedef,
    #[display("static")]
    Static,
    #[display("extern")]
    Extern,
    #[display("switch")]
    Switch,
    #[display("case")]
    Case,
    #[display("default")]
    Default,
    #[display("break")]
    Break,
    #[display("continue")]
    Continue,
    #[display("goto")]
    Goto,
    #[display("_Bool")]
    Bool,
}

fn keyword(text: &str) -> Option<Keyword> {
    use Keyword::*;
    Some(match text {
        "if" => If,
        "else" => Else,
        "for" => For,
        "while" => While,
        "do" => Do,
        "return" => Return,
        "sizeof" => Sizeof,
        "int" => Int,
        "char" => Char,
        "long" => Long,
        "short" => Short,
        "void" => Void,
        "struct" => Struct,
        "union" => Union,
        "enum" => Enum,
        "typedef" => Typedef,
        "static" => Static,
        "extern" => Extern,
        "switch" => Switch,
        "case" => Case,
        "default" => Default,
        "break" => Break,
        "continue" => Continue,
        "goto" => Goto,
        "_Bool" => Bool,
        _ => return None,
    })
}

/// Tokens in the program.
///
/// `text` is a slice of the input buffer; a suppressed token has an empty
/// `text` and kind [TokenKind::Ignorable].
#[derive(Clone, Copy, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    /// Byte offset of `text` inside the input buffer.
    pub pos: usize,
    /// Value of a numeric literal; 0 otherwise.
    pub val: i64,
    /// Successor in the chain.
    pub next: Option<TokenId>,
}

impl<'src> Token<'src> {
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is(&self, op: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == op
    }
}

/// The token arena plus the bookkeeping the preprocessor needs.
#[derive(Debug)]
pub struct TokenStream<'src> {
    pub src: &'src str,
    pub toks: Vec<Token<'src>>,
    pub head: TokenId,
    /// Conditional-inclusion head groups in group-open order. Each group is
    /// the run `#if*`-start, zero or more `#elif*`/`#else`, one `#endif`.
    pub cond_groups: VecDeque<Vec<TokenId>>,
}

impl<'src> TokenStream<'src> {
    pub fn tok(&self, id: TokenId) -> &Token<'src> {
        &self.toks[id]
    }

    pub fn tok_mut(&mut self, id: TokenId) -> &mut Token<'src> {
        &mut self.toks[id]
    }

    /// Append a token to the arena and return its id. The caller wires `next`.
    pub fn push(&mut self, tok: Token<'src>) -> TokenId {
        self.toks.push(tok);
        self.toks.len() - 1
    }

    /// Move `head` past ignorable and line-break tokens so downstream stages
    /// start on a real token.
    pub fn fix_head(&mut self) {
        let mut id = self.head;
        while matches!(
            self.toks[id].kind,
            TokenKind::Ignorable | TokenKind::LineBreak
        ) {
            id = self.toks[id].next.expect("token chain ends with eof");
        }
        self.head = id;
    }
}

/// Two-character reserved punctuation, matched before the single characters.
const PUNCT2: [&str; 11] = [
    "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "++", "--", "->",
];

/// Single-character reserved punctuation.
const PUNCT1: &str = "+-*/()=!<>;{},&[].\\%^|~?:";

pub struct Lexer<'src> {
    input: &'src str,
    pos: usize,
    /// Keep whitespace, comments and line breaks as tokens.
    preprocess: bool,
    whitespace: Regex,
    line_comment: Regex,
    directive: Regex,
    number: Regex,
    string: Regex,
    ident: Regex,
}

impl<'src> Lexer<'src> {
    pub fn new(input: &'src str, preprocess: bool) -> Self {
        Lexer {
            input,
            pos: 0,
            preprocess,
            whitespace: Regex::new(r"\A[ \t\r\x0B\x0C]+").unwrap(),
            line_comment: Regex::new(r"\A//[^\n]*").unwrap(),
            directive: Regex::new(r"\A#[A-Za-z0-9_]*").unwrap(),
            number: Regex::new(r"\A[0-9]+").unwrap(),
            string: Regex::new(r#"\A"(?:\\.|[^"\\\n])*""#).unwrap(),
            ident: Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*").unwrap(),
        }
    }

    fn rest(&self) -> &'src str {
        &self.input[self.pos..]
    }

    fn error(&self, len: usize, msg: &str) -> CompileError {
        CompileError::at(self.pos, len.max(1), msg)
    }

    /// Tokenize the whole input.
    pub fn tokenize(mut self) -> Result<TokenStream<'src>> {
        debug!("start tokenizer");
        let mut toks: Vec<Token<'src>> = vec![];
        // every conditional group, in open order, plus the open-group stack
        let mut groups: Vec<Vec<TokenId>> = vec![];
        let mut open: Vec<usize> = vec![];

        let mut tok = |toks: &mut Vec<Token<'src>>, kind, pos: usize, text: &'src str, val| {
            toks.push(Token {
                kind,
                text,
                pos,
                val,
                next: None,
            });
            toks.len() - 1
        };

        while self.pos < self.input.len() {
            let rest = self.rest();

            if rest.starts_with('\n') {
                if self.preprocess {
                    tok(&mut toks, TokenKind::LineBreak, self.pos, &rest[..1], 0);
                }
                self.pos += 1;
                continue;
            }

            if let Some(m) = self.whitespace.find(rest) {
                if self.preprocess {
                    tok(&mut toks, TokenKind::Ignorable, self.pos, m.as_str(), 0);
                }
                self.pos += m.end();
                continue;
            }

            if let Some(m) = self.line_comment.find(rest) {
                if self.preprocess {
                    tok(&mut toks, TokenKind::Ignorable, self.pos, m.as_str(), 0);
                }
                self.pos += m.end();
                continue;
            }

            if rest.starts_with("/*") {
                let Some(end) = rest[2..].find("*/") else {
                    return Err(self.error(2, "unterminated comment"));
                };
                let body = &rest[..end + 4];
                if self.preprocess {
                    // Split the comment at line breaks so line counts survive
                    // suppression.
                    let mut at = 0;
                    while let Some(nl) = body[at..].find('\n') {
                        if nl > 0 {
                            tok(
                                &mut toks,
                                TokenKind::Ignorable,
                                self.pos + at,
                                &body[at..at + nl],
                                0,
                            );
                        }
                        tok(
                            &mut toks,
                            TokenKind::LineBreak,
                            self.pos + at + nl,
                            &body[at + nl..at + nl + 1],
                            0,
                        );
                        at += nl + 1;
                    }
                    if at < body.len() {
                        tok(&mut toks, TokenKind::Ignorable, self.pos + at, &body[at..], 0);
                    }
                }
                self.pos += body.len();
                continue;
            }

            if self.preprocess && rest.starts_with('#') {
                let m = self.directive.find(rest).unwrap();
                let id = tok(&mut toks, TokenKind::Directive, self.pos, m.as_str(), 0);
                match m.as_str() {
                    "#if" | "#ifdef" | "#ifndef" => {
                        groups.push(vec![id]);
                        open.push(groups.len() - 1);
                    }
                    "#elif" | "#else" | "#elifdef" | "#elifndef" => match open.last() {
                        Some(&g) => groups[g].push(id),
                        None => return Err(self.error(m.end(), "unbalanced conditional group")),
                    },
                    "#endif" => match open.pop() {
                        Some(g) => groups[g].push(id),
                        None => return Err(self.error(m.end(), "unbalanced conditional group")),
                    },
                    _ => {}
                }
                self.pos += m.end();
                continue;
            }

            if rest.starts_with('"') {
                let Some(m) = self.string.find(rest) else {
                    return Err(self.error(1, "unterminated string"));
                };
                tok(&mut toks, TokenKind::Str, self.pos, m.as_str(), 0);
                self.pos += m.end();
                continue;
            }

            if let Some(m) = self.number.find(rest) {
                let val: i64 = m
                    .as_str()
                    .parse()
                    .map_err(|_| self.error(m.end(), "numeric literal out of range"))?;
                tok(&mut toks, TokenKind::Num, self.pos, m.as_str(), val);
                self.pos += m.end();
                continue;
            }

            if let Some(&op) = PUNCT2.iter().find(|op| rest.starts_with(**op)) {
                tok(&mut toks, TokenKind::Punct, self.pos, &rest[..op.len()], 0);
                self.pos += op.len();
                continue;
            }

            let c = rest.chars().next().unwrap();
            if PUNCT1.contains(c) {
                tok(&mut toks, TokenKind::Punct, self.pos, &rest[..c.len_utf8()], 0);
                self.pos += c.len_utf8();
                continue;
            }

            if let Some(m) = self.ident.find(rest) {
                let kind = match keyword(m.as_str()) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Ident,
                };
                tok(&mut toks, kind, self.pos, m.as_str(), 0);
                self.pos += m.end();
                continue;
            }

            return Err(self.error(c.len_utf8(), "unexpected character"));
        }

        if let Some(&g) = open.last() {
            let head = toks[groups[g][0]];
            return Err(CompileError::at(
                head.pos,
                head.len(),
                "unbalanced conditional group",
            ));
        }

        tok(&mut toks, TokenKind::Eof, self.input.len(), "", 0);
        for i in 0..toks.len() - 1 {
            toks[i].next = Some(i + 1);
        }
        debug!("tokenized {} tokens", toks.len());

        Ok(TokenStream {
            src: self.input,
            toks,
            head: 0,
            cond_groups: groups.into(),
        })
    }
}

/// A read cursor over a token chain; skips ignorable and line-break tokens.
///
/// The consume/expect discipline mirrors the usual recursive-descent helpers:
/// `consume_*` advances and returns the token on a match, `expect_*` fails
/// with a positioned diagnostic otherwise.
pub struct Cursor<'a, 'src> {
    ts: &'a TokenStream<'src>,
    cur: TokenId,
    prev: TokenId,
}

impl<'a, 'src> Cursor<'a, 'src> {
    pub fn new(ts: &'a TokenStream<'src>) -> Self {
        let cur = skip_ignorable(ts, ts.head);
        Cursor { ts, cur, prev: cur }
    }

    pub fn peek(&self) -> &Token<'src> {
        self.ts.tok(self.cur)
    }

    /// The token after the current one (the one-token lookahead).
    pub fn peek_next(&self) -> &Token<'src> {
        let next = self.ts.tok(self.cur).next.expect("token chain ends with eof");
        self.ts.tok(skip_ignorable(self.ts, next))
    }

    /// The most recently consumed token.
    pub fn prev(&self) -> &Token<'src> {
        self.ts.tok(self.prev)
    }

    pub fn prev_id(&self) -> TokenId {
        self.prev
    }

    pub fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    /// The current token's id, for anchoring diagnostics and node tokens.
    pub fn mark(&self) -> TokenId {
        self.cur
    }

    pub fn advance(&mut self) -> TokenId {
        let id = self.cur;
        self.prev = id;
        if let Some(next) = self.ts.tok(id).next {
            self.cur = skip_ignorable(self.ts, next);
        }
        id
    }

    pub fn consume(&mut self, op: &str) -> Option<TokenId> {
        if self.peek().is(op) {
            Some(self.advance())
        } else {
            None
        }
    }

    pub fn expect(&mut self, op: &str) -> Result<TokenId> {
        self.consume(op)
            .ok_or_else(|| self.error(&format!("expected '{op}'")))
    }

    pub fn consume_kw(&mut self, kw: Keyword) -> Option<TokenId> {
        if self.peek().kind == TokenKind::Keyword(kw) {
            Some(self.advance())
        } else {
            None
        }
    }

    pub fn expect_kw(&mut self, kw: Keyword) -> Result<TokenId> {
        self.consume_kw(kw)
            .ok_or_else(|| self.error(&format!("expected '{kw}'")))
    }

    pub fn consume_ident(&mut self) -> Option<TokenId> {
        if self.peek().kind == TokenKind::Ident {
            Some(self.advance())
        } else {
            None
        }
    }

    pub fn expect_ident(&mut self) -> Result<TokenId> {
        self.consume_ident()
            .ok_or_else(|| self.error("expected an identifier"))
    }

    /// Consume an identifier token with exactly the given spelling
    /// (`signed`/`unsigned` are not reserved words).
    pub fn consume_ident_text(&mut self, text: &str) -> Option<TokenId> {
        if self.peek().kind == TokenKind::Ident && self.peek().text == text {
            Some(self.advance())
        } else {
            None
        }
    }

    pub fn consume_string(&mut self) -> Option<TokenId> {
        if self.peek().kind == TokenKind::Str {
            Some(self.advance())
        } else {
            None
        }
    }

    pub fn consume_number(&mut self) -> Option<(TokenId, i64)> {
        if self.peek().kind == TokenKind::Num {
            let val = self.peek().val;
            Some((self.advance(), val))
        } else {
            None
        }
    }

    pub fn expect_number(&mut self) -> Result<(TokenId, i64)> {
        self.consume_number()
            .ok_or_else(|| self.error("expected a number"))
    }

    /// A diagnostic anchored at the current token.
    pub fn error(&self, msg: &str) -> CompileError {
        let tok = self.peek();
        CompileError::at(tok.pos, tok.len().max(1), msg)
    }
}

fn skip_ignorable(ts: &TokenStream, mut id: TokenId) -> TokenId {
    while matches!(
        ts.tok(id).kind,
        TokenKind::Ignorable | TokenKind::LineBreak
    ) {
        id = ts.tok(id).next.expect("token chain ends with eof");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str, preprocess: bool) -> TokenStream<'_> {
        Lexer::new(input, preprocess).tokenize().unwrap()
    }

    #[test]
    fn tokens_concatenate_back_to_the_input() {
        let src = "int main() { // c\n  return 1 <= 2;\n}\n";
        let ts = lex(src, true);
        let text: String = ts.toks.iter().map(|t| t.text).collect();
        assert_eq!(text, src);
    }

    #[test]
    fn keywords_are_reclassified() {
        let ts = lex("return x;", false);
        assert_eq!(ts.toks[0].kind, TokenKind::Keyword(Keyword::Return));
        assert_eq!(ts.toks[1].kind, TokenKind::Ident);
        assert!(ts.toks[2].is(";"));
    }

    #[test]
    fn two_char_punctuation_wins_over_single() {
        let ts = lex("a->b << 2", false);
        let puncts: Vec<&str> = ts
            .toks
            .iter()
            .filter(|t| t.kind == TokenKind::Punct)
            .map(|t| t.text)
            .collect();
        assert_eq!(puncts, ["->", "<<"]);
    }

    #[test]
    fn numbers_carry_their_value() {
        let ts = lex("42", false);
        assert_eq!(ts.toks[0].kind, TokenKind::Num);
        assert_eq!(ts.toks[0].val, 42);
    }

    #[test]
    fn conditional_heads_are_grouped_per_nesting_level() {
        let src = "#ifdef A\n#ifdef B\n#endif\n#else\n#endif\n";
        let ts = lex(src, true);
        assert_eq!(ts.cond_groups.len(), 2);
        let outer = &ts.cond_groups[0];
        let texts: Vec<&str> = outer.iter().map(|&i| ts.tok(i).text).collect();
        assert_eq!(texts, ["#ifdef", "#else", "#endif"]);
        let inner = &ts.cond_groups[1];
        let texts: Vec<&str> = inner.iter().map(|&i| ts.tok(i).text).collect();
        assert_eq!(texts, ["#ifdef", "#endif"]);
    }

    #[test]
    fn unterminated_comment_fails_at_its_start() {
        let err = Lexer::new("int a; /* oops", true).tokenize().unwrap_err();
        assert_eq!(err.pos, Some(7));
        assert_eq!(err.msg, "unterminated comment");
    }

    #[test]
    fn unbalanced_endif_is_rejected() {
        let err = Lexer::new("#endif\n", true).tokenize().unwrap_err();
        assert_eq!(err.msg, "unbalanced conditional group");
    }

    #[test]
    fn unknown_byte_is_rejected_at_its_offset() {
        let err = Lexer::new("int a = $;", false).tokenize().unwrap_err();
        assert_eq!(err.pos, Some(8));
    }

    #[test]
    fn cursor_skips_ignorable_tokens() {
        let ts = lex("  int /* c */ x ;\n", true);
        let mut cur = Cursor::new(&ts);
        assert!(cur.consume_kw(Keyword::Int).is_some());
        assert_eq!(ts.tok(cur.consume_ident().unwrap()).text, "x");
        assert!(cur.consume(";").is_some());
        assert!(cur.at_eof());
    }
}
