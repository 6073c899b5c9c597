use crate::token::{Kind, Token, KEYWORDS};

/// Hand-rolled scanner producing the token stream the parser consumes.
///
/// Invalid input never aborts the scan; it becomes an `Error`-kind token
/// carrying the message, and the parser stops on the first one it sees.
pub struct Lexer {
    chars: Vec<char>,
    current: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            current: 0,
            line: 1,
            column: 1,
        }
    }

    fn at(&self) -> char {
        if self.current >= self.chars.len() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    fn peek(&self) -> char {
        if self.current + 1 >= self.chars.len() {
            '\0'
        } else {
            self.chars[self.current + 1]
        }
    }

    fn advance(&mut self) -> char {
        let ch = self.at();
        self.current += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn is_eof(&self) -> bool {
        self.current >= self.chars.len()
    }

    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        while !self.is_eof() {
            let ch = self.at();

            if ch.is_whitespace() {
                self.advance();
                continue;
            }

            // Comments are elided from the stream entirely.
            if ch == '/' && self.peek() == '/' {
                while !self.is_eof() && self.at() != '\n' {
                    self.advance();
                }
                continue;
            }
            if ch == '/' && self.peek() == '*' {
                let (line, column) = (self.line, self.column);
                self.advance();
                self.advance();
                let mut closed = false;
                while !self.is_eof() {
                    if self.at() == '*' && self.peek() == '/' {
                        self.advance();
                        self.advance();
                        closed = true;
                        break;
                    }
                    self.advance();
                }
                if !closed {
                    tokens.push(Token::new(
                        Kind::Error,
                        "unterminated multi-line comment",
                        line,
                        column,
                    ));
                }
                continue;
            }

            let (line, column) = (self.line, self.column);
            match ch {
                '"' => tokens.push(self.scan_string(line, column)),
                '(' | ')' | ',' | '+' | '-' | '*' | '/' | '%' => {
                    self.advance();
                    tokens.push(Token::new(Kind::Punct, ch, line, column));
                }
                '=' | '!' | '<' | '>' => {
                    self.advance();
                    if self.at() == '=' {
                        self.advance();
                        tokens.push(Token::new(Kind::Punct, format!("{}=", ch), line, column));
                    } else if ch == '!' {
                        tokens.push(Token::new(
                            Kind::Error,
                            "unexpected character '!'",
                            line,
                            column,
                        ));
                    } else {
                        tokens.push(Token::new(Kind::Punct, ch, line, column));
                    }
                }
                c if c.is_ascii_digit() => tokens.push(self.scan_number(line, column)),
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while self.at().is_alphanumeric() || self.at() == '_' {
                        ident.push(self.advance());
                    }
                    let kind = if KEYWORDS.contains(&ident.as_str()) {
                        Kind::Keyword
                    } else {
                        Kind::Identifier
                    };
                    tokens.push(Token::new(kind, ident, line, column));
                }
                c => {
                    self.advance();
                    tokens.push(Token::new(
                        Kind::Error,
                        format!("unrecognized character '{}'", c),
                        line,
                        column,
                    ));
                }
            }
        }

        tokens.push(Token::new(Kind::Eof, "", self.line, self.column));
        tokens
    }

    /// Scans a quoted string. The token value keeps the surrounding quotes
    /// and raw escape sequences; the compiler decodes them when interning.
    /// Literal newlines are allowed inside strings.
    fn scan_string(&mut self, line: usize, column: usize) -> Token {
        let mut value = String::new();
        value.push(self.advance()); // opening quote

        while !self.is_eof() && self.at() != '"' {
            if self.at() == '\\' {
                value.push(self.advance());
                if self.is_eof() {
                    break;
                }
            }
            value.push(self.advance());
        }

        if self.is_eof() {
            return Token::new(Kind::Error, "unterminated string literal", line, column);
        }
        value.push(self.advance()); // closing quote
        Token::new(Kind::Str, value, line, column)
    }

    fn scan_number(&mut self, line: usize, column: usize) -> Token {
        let mut value = String::new();
        while self.at().is_ascii_digit() {
            value.push(self.advance());
        }
        if self.at() == '.' && self.peek().is_ascii_digit() {
            value.push(self.advance());
            while self.at().is_ascii_digit() {
                value.push(self.advance());
            }
            return Token::new(Kind::Float, value, line, column);
        }
        Token::new(Kind::Int, value, line, column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(Kind, String)> {
        Lexer::new(source)
            .tokenize()
            .into_iter()
            .map(|t| (t.kind, t.value))
            .collect()
    }

    #[test]
    fn scans_assignment() {
        let tokens = kinds("val answer = 42");
        assert_eq!(
            tokens,
            vec![
                (Kind::Keyword, "val".to_string()),
                (Kind::Identifier, "answer".to_string()),
                (Kind::Punct, "=".to_string()),
                (Kind::Int, "42".to_string()),
                (Kind::Eof, "".to_string()),
            ]
        );
    }

    #[test]
    fn scans_all_keywords() {
        for kw in ["val", "if", "then", "else", "end", "while", "do"] {
            let tokens = kinds(kw);
            assert_eq!(tokens[0], (Kind::Keyword, kw.to_string()));
        }
    }

    #[test]
    fn scans_two_char_operators() {
        let tokens = kinds("== != <= >= < > =");
        let ops: Vec<&str> = tokens
            .iter()
            .filter(|(k, _)| *k == Kind::Punct)
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(ops, vec!["==", "!=", "<=", ">=", "<", ">", "="]);
    }

    #[test]
    fn string_keeps_quotes_and_raw_escapes() {
        let tokens = kinds(r#"print("a\nb")"#);
        let string = tokens.iter().find(|(k, _)| *k == Kind::Str).unwrap();
        assert_eq!(string.1, r#""a\nb""#);
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        let tokens = kinds(r#""he said \"hi\"""#);
        assert_eq!(tokens[0], (Kind::Str, r#""he said \"hi\"""#.to_string()));
        assert_eq!(tokens[1].0, Kind::Eof);
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let tokens = kinds("\"oops");
        assert_eq!(tokens[0].0, Kind::Error);
        assert_eq!(tokens[0].1, "unterminated string literal");
    }

    #[test]
    fn string_may_span_lines() {
        let tokens = kinds("\"a\nb\"");
        assert_eq!(tokens[0], (Kind::Str, "\"a\nb\"".to_string()));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = kinds("val x = 1 // trailing\n/* block\ncomment */ val y = 2");
        let idents: Vec<&str> = tokens
            .iter()
            .filter(|(k, _)| *k == Kind::Identifier)
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(idents, vec!["x", "y"]);
    }

    #[test]
    fn unterminated_block_comment_is_error_token() {
        let tokens = kinds("/* never ends");
        assert_eq!(tokens[0].0, Kind::Error);
    }

    #[test]
    fn float_literal() {
        let tokens = kinds("3.25");
        assert_eq!(tokens[0], (Kind::Float, "3.25".to_string()));
    }

    #[test]
    fn integer_then_dot_without_digits_stays_int() {
        let tokens = kinds("3.x");
        assert_eq!(tokens[0], (Kind::Int, "3".to_string()));
    }

    #[test]
    fn unknown_character_is_error_token() {
        let tokens = kinds("val x = @");
        let err = tokens.iter().find(|(k, _)| *k == Kind::Error).unwrap();
        assert!(err.1.contains('@'));
    }

    #[test]
    fn positions_are_one_based_and_track_lines() {
        let tokens = Lexer::new("val a = 1\nval b = 2").tokenize();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        let b = tokens.iter().find(|t| t.value == "b").unwrap();
        assert_eq!((b.line, b.column), (2, 5));
    }
}
