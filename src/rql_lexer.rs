//! RQL Lexer
//!
//! Tokenizes resource query language expressions such as
//! ```text
//! and(eq(status,active),gt(owner.age,30)),sort(-created),limit(10)
//! ```

use crate::error::{RqlError, RqlErrorCode};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Unquoted run of characters: operator names, field paths, literals
    Word(String),
    /// Single or double quoted literal
    Quoted(String),
    LeftParen,
    RightParen,
    Comma,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(s) => write!(f, "Word({})", s),
            Token::Quoted(s) => write!(f, "Quoted(\"{}\")", s),
            _ => write!(f, "{:?}", self),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current = chars.first().copied();
        Lexer {
            input: chars,
            position: 0,
            current_char: current,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, RqlError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Token, RqlError> {
        self.skip_whitespace();
        match self.current_char {
            None => Ok(Token::Eof),
            Some('(') => {
                self.advance();
                Ok(Token::LeftParen)
            }
            Some(')') => {
                self.advance();
                Ok(Token::RightParen)
            }
            Some(',') => {
                self.advance();
                Ok(Token::Comma)
            }
            Some(quote) if quote == '\'' || quote == '"' => self.read_quoted(quote),
            Some(_) => Ok(self.read_word()),
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_word(&mut self) -> Token {
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | ',' | '\'' | '"') {
                break;
            }
            result.push(ch);
            self.advance();
        }
        Token::Word(result)
    }

    fn read_quoted(&mut self, quote: char) -> Result<Token, RqlError> {
        let start = self.position;
        self.advance();
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch == quote {
                self.advance();
                return Ok(Token::Quoted(result));
            }
            if ch == '\\' {
                self.advance();
                match self.current_char {
                    Some(escaped) => result.push(escaped),
                    None => break,
                }
            } else {
                result.push(ch);
            }
            self.advance();
        }
        Err(RqlError::new(
            RqlErrorCode::Wrong,
            format!("Unterminated string starting at position {}", start),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_call() {
        let tokens = Lexer::new("eq(a.b, 'x y')").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("eq".into()),
                Token::LeftParen,
                Token::Word("a.b".into()),
                Token::Comma,
                Token::Quoted("x y".into()),
                Token::RightParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_sort_prefixes_stay_in_words() {
        let tokens = Lexer::new("sort(-a,+b)").tokenize().unwrap();
        assert_eq!(tokens[2], Token::Word("-a".into()));
        assert_eq!(tokens[4], Token::Word("+b".into()));
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("eq(a,'x").tokenize().unwrap_err();
        assert_eq!(err.code, RqlErrorCode::Wrong);
    }
}
