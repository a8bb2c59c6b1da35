//! Tokenizer for the `.proto` subset.
//!
//! Splits on whitespace, treats `{ } ( ) ; =` as standalone tokens, and
//! drops `//` line comments. Quoted strings survive as single opaque
//! tokens, which is all the parser needs from `syntax = "proto3";`.

/// A token with the 1-based line it started on, for error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub text: String,
    pub line: usize,
}

const DELIMITERS: [char; 6] = ['{', '}', '(', ')', ';', '='];

pub(crate) fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let code = match raw_line.find("//") {
            Some(at) => &raw_line[..at],
            None => raw_line,
        };
        let mut current = String::new();
        for ch in code.chars() {
            if ch.is_whitespace() {
                flush(&mut current, line, &mut tokens);
            } else if DELIMITERS.contains(&ch) {
                flush(&mut current, line, &mut tokens);
                tokens.push(Token {
                    text: ch.to_string(),
                    line,
                });
            } else {
                current.push(ch);
            }
        }
        flush(&mut current, line, &mut tokens);
    }
    tokens
}

fn flush(current: &mut String, line: usize, tokens: &mut Vec<Token>) {
    if !current.is_empty() {
        tokens.push(Token {
            text: std::mem::take(current),
            line,
        });
    }
}

/// Cursor over the token stream.
pub(crate) struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    pub fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume the next token if it equals `text`.
    pub fn eat(&mut self, text: &str) -> bool {
        if self.peek().is_some_and(|t| t.text == text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Skip a brace-balanced `{ ... }` block; the opening brace must be
    /// the next token.
    pub fn skip_block(&mut self) -> bool {
        if !self.eat("{") {
            return false;
        }
        let mut depth = 1usize;
        while let Some(token) = self.next() {
            match token.text.as_str() {
                "{" => depth += 1,
                "}" => {
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(source: &str) -> Vec<String> {
        tokenize(source).into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn splits_delimiters() {
        assert_eq!(
            texts("service Greeter{rpc SayHello(HelloRequest) returns(HelloReply);}"),
            vec![
                "service", "Greeter", "{", "rpc", "SayHello", "(", "HelloRequest", ")",
                "returns", "(", "HelloReply", ")", ";", "}"
            ]
        );
    }

    #[test]
    fn drops_line_comments() {
        assert_eq!(
            texts("package a.b; // the package\n// whole line\nservice S {}"),
            vec!["package", "a.b", ";", "service", "S", "{", "}"]
        );
    }

    #[test]
    fn equals_is_a_token() {
        assert_eq!(
            texts("string name = 1;"),
            vec!["string", "name", "=", "1", ";"]
        );
    }

    #[test]
    fn tracks_lines() {
        let tokens = tokenize("a\nb\n\nc");
        let lines: Vec<usize> = tokens.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 2, 4]);
    }

    #[test]
    fn skip_block_balances() {
        let mut cursor = Cursor::new(tokenize("{ a { b } c } tail"));
        assert!(cursor.skip_block());
        assert_eq!(cursor.next().unwrap().text, "tail");
    }

    #[test]
    fn skip_block_unbalanced() {
        let mut cursor = Cursor::new(tokenize("{ a { b }"));
        assert!(!cursor.skip_block());
    }
}
