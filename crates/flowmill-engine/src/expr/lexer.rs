use super::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Semi,
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Ident(s) => write!(f, "{}", s),
            Self::Dot => write!(f, "."),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Slash => write!(f, "/"),
            Self::Percent => write!(f, "%"),
            Self::Bang => write!(f, "!"),
            Self::Assign => write!(f, "="),
            Self::EqEq => write!(f, "=="),
            Self::NotEq => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::AndAnd => write!(f, "&&"),
            Self::OrOr => write!(f, "||"),
            Self::Semi => write!(f, ";"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// A token and the char offset it starts at.
pub type Spanned = (Token, usize);

/// Tokenize an expression or script. Newlines become statement separators.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, EvalError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c == '\n' {
            tokens.push((Token::Semi, start));
            pos += 1;
            continue;
        }
        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() {
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                // A dot only belongs to the number when a digit follows it.
                if chars[pos] == '.'
                    && !chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit())
                {
                    break;
                }
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let n = text.parse::<f64>().map_err(|_| EvalError::Parse {
                pos: start,
                message: format!("invalid number '{}'", text),
            })?;
            tokens.push((Token::Number(n), start));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            while pos < chars.len()
                && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$')
            {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            tokens.push((Token::Ident(text), start));
            continue;
        }

        if c == '"' || c == '\'' {
            pos += 1;
            let mut s = String::new();
            loop {
                match chars.get(pos) {
                    None => {
                        return Err(EvalError::Parse {
                            pos: start,
                            message: "unterminated string".into(),
                        })
                    }
                    Some(&q) if q == c => {
                        pos += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(pos + 1).copied().ok_or(EvalError::Parse {
                            pos,
                            message: "dangling escape".into(),
                        })?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        pos += 2;
                    }
                    Some(&other) => {
                        s.push(other);
                        pos += 1;
                    }
                }
            }
            tokens.push((Token::Str(s), start));
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let third = chars.get(pos + 2).copied();
        let (token, width) = match (c, next) {
            // `===` / `!==` are accepted as plain equality.
            ('=', Some('=')) if third == Some('=') => (Token::EqEq, 3),
            ('!', Some('=')) if third == Some('=') => (Token::NotEq, 3),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', _) => (Token::Bang, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('.', _) => (Token::Dot, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (';', _) => (Token::Semi, 1),
            (other, _) => {
                return Err(EvalError::Parse {
                    pos: start,
                    message: format!("unexpected character '{}'", other),
                })
            }
        };
        tokens.push((token, start));
        pos += width;
    }

    tokens.push((Token::Eof, chars.len()));
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_comparison_tokens() {
        assert_eq!(
            kinds("amount >= 100"),
            vec![
                Token::Ident("amount".into()),
                Token::Ge,
                Token::Number(100.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_strict_equality_folds() {
        assert_eq!(
            kinds("a === 'x'"),
            vec![
                Token::Ident("a".into()),
                Token::EqEq,
                Token::Str("x".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_dotted_path_and_decimal() {
        assert_eq!(
            kinds("order.total < 2.5"),
            vec![
                Token::Ident("order".into()),
                Token::Dot,
                Token::Ident("total".into()),
                Token::Lt,
                Token::Number(2.5),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(tokenize("'abc"), Err(EvalError::Parse { .. })));
    }

    #[test]
    fn test_rejects_unknown_characters() {
        assert!(tokenize("a ? b : c").is_err());
        assert!(tokenize("items[0]").is_err());
    }
}
