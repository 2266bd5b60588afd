//! Lexer for the `${...}` expression sublanguage

use super::error::ExprError;

/// A lexical token
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Identifier (path root or segment, macro name, bound variable)
    Ident(String),
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal (single or double quoted)
    Str(String),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `.`
    Dot,
    /// `.?` - optional-chain access
    OptDot,
    /// `??` - null coalesce
    Coalesce,
    /// `?` - ternary
    Question,
    /// `:`
    Colon,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `!`
    Not,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
}

/// Tokenize an expression body (the text between `${` and `}`)
pub fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let Some(c) = src[i..].chars().next() else {
            break;
        };
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                if bytes.get(i + 1) == Some(&b'?') {
                    tokens.push(Token::OptDot);
                    i += 2;
                } else {
                    tokens.push(Token::Dot);
                    i += 1;
                }
            }
            '?' => {
                if bytes.get(i + 1) == Some(&b'?') {
                    tokens.push(Token::Coalesce);
                    i += 2;
                } else {
                    tokens.push(Token::Question);
                    i += 1;
                }
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::lex(i, "expected '==' (assignment is not supported)"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ExprError::lex(i, "expected '&&'"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ExprError::lex(i, "expected '||'"));
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(src, i, c)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let (tok, next) = lex_number(src, i)?;
                tokens.push(tok);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &src[start..i];
                tokens.push(match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(ExprError::lex(i, format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

/// Lex a quoted string starting at `start` (which holds the quote char)
fn lex_string(src: &str, start: usize, quote: char) -> Result<(String, usize), ExprError> {
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();

    while let Some((offset, c)) = chars.next() {
        let i = start + 1 + offset;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let (_, escaped) = chars
                .next()
                .ok_or_else(|| ExprError::lex(i, "unterminated escape"))?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                '\\' => out.push('\\'),
                '"' => out.push('"'),
                '\'' => out.push('\''),
                other => {
                    return Err(ExprError::lex(i, format!("unknown escape '\\{}'", other)));
                }
            }
        } else {
            out.push(c);
        }
    }

    Err(ExprError::lex(start, "unterminated string literal"))
}

/// Lex an integer or float literal starting at `start`
fn lex_number(src: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut is_float = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' && !is_float && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) {
            // a '.' is only part of the number when followed by a digit,
            // so `1.metadata` still lexes as Int(1) Dot Ident
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }

    let text = &src[start..i];
    if is_float {
        text.parse::<f64>()
            .map(|f| (Token::Float(f), i))
            .map_err(|_| ExprError::lex(start, format!("invalid number '{}'", text)))
    } else {
        text.parse::<i64>()
            .map(|n| (Token::Int(n), i))
            .map_err(|_| ExprError::lex(start, format!("invalid number '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_tokens() {
        let tokens = tokenize("schema.spec.name").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("schema".into()),
                Token::Dot,
                Token::Ident("spec".into()),
                Token::Dot,
                Token::Ident("name".into()),
            ]
        );
    }

    #[test]
    fn test_optional_chain_token() {
        let tokens = tokenize("db.status.?ready").unwrap();
        assert!(tokens.contains(&Token::OptDot));
        assert_eq!(tokens[3], Token::OptDot);
    }

    #[test]
    fn test_coalesce_vs_ternary() {
        assert!(tokenize("a ?? b").unwrap().contains(&Token::Coalesce));
        let ternary = tokenize("a ? b : c").unwrap();
        assert!(ternary.contains(&Token::Question));
        assert!(ternary.contains(&Token::Colon));
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("a == 1 && b != 2 || !c").unwrap();
        assert!(tokens.contains(&Token::Eq));
        assert!(tokens.contains(&Token::And));
        assert!(tokens.contains(&Token::Ne));
        assert!(tokens.contains(&Token::Or));
        assert!(tokens.contains(&Token::Not));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(tokenize("42").unwrap(), vec![Token::Int(42)]);
        assert_eq!(tokenize("2.5").unwrap(), vec![Token::Float(2.5)]);
    }

    #[test]
    fn test_string_literals_both_quotes() {
        assert_eq!(
            tokenize(r#""hello""#).unwrap(),
            vec![Token::Str("hello".into())]
        );
        assert_eq!(tokenize("'world'").unwrap(), vec![Token::Str("world".into())]);
    }

    #[test]
    fn test_string_literal_keeps_utf8() {
        assert_eq!(
            tokenize("'café' == 'café'").unwrap(),
            vec![
                Token::Str("café".into()),
                Token::Eq,
                Token::Str("café".into()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokenize(r#""a\"b\n""#).unwrap(),
            vec![Token::Str("a\"b\n".into())]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            tokenize("true false null").unwrap(),
            vec![Token::True, Token::False, Token::Null]
        );
    }

    #[test]
    fn test_bracket_access() {
        let tokens = tokenize("items[0]").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("items".into()),
                Token::LBracket,
                Token::Int(0),
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        let err = tokenize("'oops").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_single_ampersand_errors() {
        assert!(tokenize("a & b").is_err());
        assert!(tokenize("a = b").is_err());
    }
}
