//! The preprocessor.
//!
//! Operates on the token chain in place: macro expansion overwrites the
//! expanded identifier and splices the rest of the replacement list into the
//! chain, suppression turns a token into an empty `ignorable`. Line-break
//! tokens are never suppressed so line counts survive. The chain can be
//! serialized back to text for `-E` output.

use log::debug;

use crate::common::{CompileError, Map, Result};
use crate::front::lex::{Token, TokenId, TokenKind, TokenStream};

/// The object-like macro table. Replacement lists are value copies of the
/// defining tokens; the defining occurrences themselves get suppressed.
#[derive(Default)]
pub struct MacroTable<'src> {
    object: Map<String, Vec<Token<'src>>>,
}

impl<'src> MacroTable<'src> {
    pub fn is_defined(&self, name: &str) -> bool {
        self.object.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&Vec<Token<'src>>> {
        self.object.get(name)
    }

    fn define(&mut self, name: &Token<'src>, repl: Vec<Token<'src>>) -> Result<()> {
        if self.is_defined(name.text) {
            return Err(CompileError::at(
                name.pos,
                name.len(),
                format!("macro '{}' is already defined", name.text),
            ));
        }
        self.object.insert(name.text.to_string(), repl);
        Ok(())
    }

    fn undef(&mut self, name: &str) {
        self.object.remove(name);
    }
}

/// Suppress a token: it stays in the chain but reads as nothing.
fn void(ts: &mut TokenStream, id: TokenId) {
    let tok = ts.tok_mut(id);
    tok.kind = TokenKind::Ignorable;
    tok.text = "";
    tok.val = 0;
}

/// Overwrite the token at `at` with `repl[0]` and splice the rest of the
/// replacement list in behind it, re-linking to the original successor.
fn splice<'src>(ts: &mut TokenStream<'src>, at: TokenId, repl: &[Token<'src>]) {
    let orig_next = ts.tok(at).next;
    let first = repl[0];
    let tok = ts.tok_mut(at);
    tok.kind = first.kind;
    tok.text = first.text;
    tok.pos = first.pos;
    tok.val = first.val;
    let mut prev = at;
    for r in &repl[1..] {
        let id = ts.push(Token { next: None, ..*r });
        ts.tok_mut(prev).next = Some(id);
        prev = id;
    }
    ts.tok_mut(prev).next = orig_next;
}

/// Run the whole preprocessing pass over the chain.
pub fn preprocess(ts: &mut TokenStream) -> Result<()> {
    debug!("start preprocessor");
    let mut macros = MacroTable::default();
    let mut cur = ts.head;
    loop {
        match ts.tok(cur).kind {
            TokenKind::Eof => break,
            TokenKind::Directive => directive(ts, &mut macros, cur)?,
            TokenKind::Ident => expand(ts, &macros, cur),
            _ => {}
        }
        match ts.tok(cur).next {
            Some(next) => cur = next,
            None => break,
        }
    }
    Ok(())
}

/// Macro expansion with a hide set, starting at an identifier token.
///
/// As long as the token at `at` names a non-hidden macro, splice its
/// replacement in and re-scan from the same position; the hide set stops
/// self-referential macros from looping.
fn expand<'src>(ts: &mut TokenStream<'src>, macros: &MacroTable<'src>, at: TokenId) {
    let mut hide_set: Vec<String> = vec![];
    loop {
        if ts.tok(at).kind != TokenKind::Ident {
            return;
        }
        let name: &str = ts.tok(at).text;
        if hide_set.iter().any(|h| h == name) {
            return;
        }
        let Some(repl) = macros.get(name) else {
            return;
        };
        hide_set.push(name.to_string());
        if repl.is_empty() {
            void(ts, at);
            return;
        }
        splice(ts, at, repl);
    }
}

/// Step over ignorable padding, suppressing it, and return the first
/// meaningful successor of `id`.
fn next_meaningful(ts: &mut TokenStream, mut id: TokenId) -> TokenId {
    loop {
        id = ts.tok(id).next.expect("token chain ends with eof");
        if ts.tok(id).kind != TokenKind::Ignorable {
            return id;
        }
        void(ts, id);
    }
}

/// Copy and suppress the rest of the directive's line: leading padding is
/// dropped, interior padding is kept in the copy (it spaces the replacement
/// text apart when spliced back in).
fn take_line<'src>(ts: &mut TokenStream<'src>, head: TokenId) -> Vec<Token<'src>> {
    let mut id = head;
    // leading padding
    loop {
        id = ts.tok(id).next.expect("token chain ends with eof");
        match ts.tok(id).kind {
            TokenKind::LineBreak | TokenKind::Eof => return vec![],
            TokenKind::Ignorable => void(ts, id),
            _ => break,
        }
    }
    let mut list = vec![];
    loop {
        list.push(*ts.tok(id));
        void(ts, id);
        id = ts.tok(id).next.expect("token chain ends with eof");
        if matches!(ts.tok(id).kind, TokenKind::LineBreak | TokenKind::Eof) {
            return list;
        }
    }
}

fn directive<'src>(
    ts: &mut TokenStream<'src>,
    macros: &mut MacroTable<'src>,
    head: TokenId,
) -> Result<()> {
    let head_tok = *ts.tok(head);
    match head_tok.text {
        "#define" => {
            void(ts, head);
            let name_id = next_meaningful(ts, head);
            let name = *ts.tok(name_id);
            if name.kind != TokenKind::Ident {
                return Err(CompileError::at(head_tok.pos, head_tok.len(), "invalid #define use"));
            }
            // An immediately following '(' opens a parameter list.
            if let Some(next) = name.next {
                let next = ts.tok(next);
                if next.is("(") && next.pos == name.pos + name.len() {
                    return Err(CompileError::at(
                        name.pos,
                        name.len(),
                        "function-like macros are not implemented",
                    ));
                }
            }
            void(ts, name_id);
            let repl = take_line(ts, name_id);
            debug!("define macro '{}' ({} tokens)", name.text, repl.len());
            macros.define(&name, repl)?;
        }
        "#undef" => {
            void(ts, head);
            let name_id = next_meaningful(ts, head);
            let name = *ts.tok(name_id);
            if name.kind != TokenKind::Ident {
                return Err(CompileError::at(head_tok.pos, head_tok.len(), "invalid #undef use"));
            }
            void(ts, name_id);
            macros.undef(name.text);
        }
        "#if" | "#ifdef" | "#ifndef" => conditional_inclusion(ts, macros, head)?,
        "#elif" | "#else" | "#elifdef" | "#elifndef" | "#endif" => {
            // Live mid-group heads are consumed by the group walk; the lexer
            // rejects unbalanced groups before we get here.
            unreachable!("stray '{}' survived lexing", head_tok.text);
        }
        "#error" => {
            let line = take_line(ts, head);
            let text: String = line.iter().map(|t| t.text).collect();
            let msg = match text.trim() {
                "" => "#error".to_string(),
                rest => format!("#error: {rest}"),
            };
            return Err(CompileError::at(head_tok.pos, head_tok.len(), msg));
        }
        "#line" | "#pragma" | "#include" | "#warning" => {
            // Read and ignored.
            void(ts, head);
            take_line(ts, head);
        }
        _ => {
            return Err(CompileError::at(head_tok.pos, head_tok.len(), "unknown directive"));
        }
    }
    Ok(())
}

/// Handle one `#if*` group: evaluate the conditions, keep the first true
/// branch and suppress every other branch body (line breaks excepted).
fn conditional_inclusion(ts: &mut TokenStream, macros: &MacroTable, start: TokenId) -> Result<()> {
    let group = ts
        .cond_groups
        .pop_front()
        .unwrap_or_else(|| unreachable!("conditional head without a recorded group"));
    if group[0] != start {
        unreachable!("conditional group out of order");
    }

    let start_tok = *ts.tok(start);
    let first_taken = match start_tok.text {
        "#ifdef" | "#ifndef" => {
            void(ts, start);
            let name_id = next_meaningful(ts, start);
            let name = *ts.tok(name_id);
            if name.kind != TokenKind::Ident {
                return Err(CompileError::at(
                    start_tok.pos,
                    start_tok.len(),
                    format!("invalid {} use", start_tok.text),
                ));
            }
            void(ts, name_id);
            macros.is_defined(name.text) == (start_tok.text == "#ifdef")
        }
        "#if" => {
            return Err(CompileError::at(
                start_tok.pos,
                start_tok.len(),
                "'#if' conditional expressions are not implemented",
            ));
        }
        _ => unreachable!("not a conditional start: {}", start_tok.text),
    };

    // Decide which segment (branch body) survives.
    let mut taken = vec![first_taken];
    let mut any_taken = first_taken;
    for &mid in &group[1..group.len() - 1] {
        let mid_tok = *ts.tok(mid);
        match mid_tok.text {
            "#else" => {
                taken.push(!any_taken);
                any_taken = true;
                void(ts, mid);
            }
            "#elif" | "#elifdef" | "#elifndef" => {
                return Err(CompileError::at(
                    mid_tok.pos,
                    mid_tok.len(),
                    format!("'{}' is not implemented", mid_tok.text),
                ));
            }
            _ => unreachable!("not a conditional continuation: {}", mid_tok.text),
        }
    }
    void(ts, group[group.len() - 1]);

    for (i, &taken) in taken.iter().enumerate() {
        if !taken {
            suppress_between(ts, group[i], group[i + 1]);
        }
    }
    Ok(())
}

/// Suppress every token strictly between two heads, keeping line breaks.
/// Conditional groups opened inside the range are dead with it, so their
/// deque entries are dropped too.
fn suppress_between(ts: &mut TokenStream, from: TokenId, until: TokenId) {
    let mut id = from;
    loop {
        id = ts.tok(id).next.expect("token chain ends with eof");
        if id == until {
            return;
        }
        let tok = ts.tok(id);
        match tok.kind {
            TokenKind::Eof => unreachable!("conditional group ran past end of input"),
            TokenKind::LineBreak => {}
            TokenKind::Directive => {
                if matches!(tok.text, "#if" | "#ifdef" | "#ifndef") {
                    // The dead group is not necessarily the front one: a
                    // kept earlier branch may hold a still-pending group.
                    let pos = ts
                        .cond_groups
                        .iter()
                        .position(|g| g[0] == id)
                        .unwrap_or_else(|| unreachable!("nested group not recorded"));
                    ts.cond_groups.remove(pos);
                }
                void(ts, id);
            }
            _ => void(ts, id),
        }
    }
}

/// Serialize the (possibly edited) chain back to source text, skipping the
/// synthetic `-D`/`-g` prelude that sits before the real input.
pub fn write_preprocessed(ts: &TokenStream, skip_before: usize) -> String {
    let mut out = String::new();
    let mut started = skip_before == 0;
    let mut id = ts.head;
    loop {
        let tok = ts.tok(id);
        if tok.kind == TokenKind::Eof {
            return out;
        }
        if !started && tok.pos >= skip_before {
            started = true;
        }
        if started {
            out.push_str(tok.text);
        }
        match tok.next {
            Some(next) => id = next,
            None => return out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;

    fn run(src: &str) -> String {
        let mut ts = Lexer::new(src, true).tokenize().unwrap();
        preprocess(&mut ts).unwrap();
        write_preprocessed(&ts, 0)
    }

    fn run_err(src: &str) -> CompileError {
        let mut ts = Lexer::new(src, true).tokenize().unwrap();
        preprocess(&mut ts).unwrap_err()
    }

    #[test]
    fn no_directives_round_trips_byte_for_byte() {
        let src = "int main() { /* c */ return 1; } // done\n";
        assert_eq!(run(src), src);
    }

    #[test]
    fn object_like_macro_expands() {
        assert_eq!(run("#define N 42\nint x = N;\n"), "\nint x = 42;\n");
    }

    #[test]
    fn macro_expansion_rescans_the_splice_point() {
        let out = run("#define A B + 1\n#define B 2\nint x = A;\n");
        assert_eq!(out, "\n\nint x = 2 + 1;\n");
    }

    #[test]
    fn hide_set_stops_self_reference() {
        // A expands to B, B back to A; the hide set must stop the loop and
        // leave the second A alone.
        let out = run("#define A B\n#define B A\nint x = A;\n");
        assert_eq!(out, "\n\nint x = A;\n");
    }

    #[test]
    fn empty_macro_expands_to_nothing() {
        assert_eq!(run("#define NOTHING\nNOTHING int x;\n"), "\n int x;\n");
    }

    #[test]
    fn undef_removes_a_macro() {
        let out = run("#define N 1\n#undef N\nint x = N;\n");
        assert_eq!(out, "\n\nint x = N;\n");
    }

    #[test]
    fn redefinition_fails() {
        let err = run_err("#define N 1\n#define N 2\n");
        assert_eq!(err.msg, "macro 'N' is already defined");
    }

    #[test]
    fn function_like_macros_are_rejected() {
        let err = run_err("#define F(x) x\n");
        assert_eq!(err.msg, "function-like macros are not implemented");
    }

    #[test]
    fn ifdef_keeps_the_true_branch() {
        let out = run("#define X 1\n#ifdef X\nint a;\n#else\nint b;\n#endif\n");
        assert_eq!(out, "\n\nint a;\n\n\n\n");
    }

    #[test]
    fn ifdef_suppresses_the_false_branch() {
        let out = run("#ifdef X\nint a;\n#else\nint b;\n#endif\n");
        assert_eq!(out, "\n\n\nint b;\n\n");
    }

    #[test]
    fn ifndef_inverts_the_condition() {
        let out = run("#ifndef X\nint a;\n#endif\n");
        assert_eq!(out, "\nint a;\n\n");
    }

    #[test]
    fn nested_groups_inside_a_dead_branch_stay_dead() {
        let out = run("#ifdef X\n#ifdef Y\nint a;\n#endif\nint b;\n#endif\nint c;\n");
        assert_eq!(out, "\n\n\n\n\n\nint c;\n");
    }

    #[test]
    fn a_nested_group_in_the_kept_branch_still_runs() {
        // The suppressed else-branch holds its own nested group; dropping it
        // must not eat the pending group of the kept branch.
        let src = "#define A 1\n#define B 1\n\
                   #ifdef A\n#ifdef B\nint a;\n#endif\n\
                   #else\n#ifdef C\nint c;\n#endif\n#endif\n";
        let out = run(src);
        assert!(out.contains("int a;"));
        assert!(!out.contains("int c;"));
    }

    #[test]
    fn line_breaks_survive_suppression() {
        let out = run("#ifdef X\nint a;\nint b;\n#endif\n");
        assert_eq!(out.matches('\n').count(), 4);
    }

    #[test]
    fn error_directive_fails_with_the_line() {
        let err = run_err("#error no good\n");
        assert_eq!(err.msg, "#error: no good");
    }

    #[test]
    fn ignored_directives_disappear() {
        assert_eq!(run("#pragma once\nint x;\n"), "\nint x;\n");
    }

    #[test]
    fn unknown_directives_fail() {
        assert_eq!(run_err("#frobnicate\n").msg, "unknown directive");
    }

    #[test]
    fn hash_if_is_recognized_but_unimplemented() {
        let err = run_err("#if 1\nint a;\n#endif\n");
        assert_eq!(err.msg, "'#if' conditional expressions are not implemented");
    }
}
