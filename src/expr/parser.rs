//! Parser for the `${...}` expression sublanguage
//!
//! Hand-written Pratt parser producing a small AST. Precedence, lowest to
//! highest: ternary, `??`, `||`, `&&`, equality, comparison, additive,
//! multiplicative, unary, postfix (member/index/macro).

use std::collections::BTreeSet;

use super::error::ExprError;
use super::lexer::{tokenize, Token};
use super::value::Value;

/// Unary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation
    Not,
    /// Arithmetic negation
    Neg,
}

/// Binary operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `??`
    Coalesce,
    /// `||`
    Or,
    /// `&&`
    And,
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
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

/// List predicate macros, CEL-style
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacroName {
    /// Every element satisfies the predicate
    All,
    /// At least one element satisfies the predicate
    Exists,
    /// Exactly one element satisfies the predicate
    ExistsOne,
    /// Elements satisfying the predicate
    Filter,
    /// Transform each element
    Map,
}

impl MacroName {
    fn from_ident(name: &str) -> Option<Self> {
        match name {
            "all" => Some(Self::All),
            "exists" => Some(Self::Exists),
            "exists_one" => Some(Self::ExistsOne),
            "filter" => Some(Self::Filter),
            "map" => Some(Self::Map),
            _ => None,
        }
    }
}

/// Expression AST
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(Value),
    /// Bare identifier: a namespace root or a macro-bound variable
    Ident(String),
    /// Member access `base.name` / optional `base.?name`
    Member {
        /// Expression yielding the object
        base: Box<Expr>,
        /// Field name
        name: String,
        /// True for `.?` - absent segments yield null instead of erroring
        optional: bool,
    },
    /// Bracket access `base[index]` with an integer or string index
    Index {
        /// Expression yielding the list or object
        base: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// List literal `[a, b, c]`
    List(Vec<Expr>),
    /// Unary operator application
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        expr: Box<Expr>,
    },
    /// Binary operator application
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Ternary conditional `cond ? then : otherwise`
    Ternary {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then: Box<Expr>,
        /// Value when false
        otherwise: Box<Expr>,
    },
    /// Built-in call: `size(x)`, `string(x)`, `int(x)`, `bool(x)`, `float(x)`
    Call {
        /// Function name
        name: String,
        /// Arguments
        args: Vec<Expr>,
    },
    /// List macro `base.all(v, pred)` and friends
    Macro {
        /// Expression yielding the list
        base: Box<Expr>,
        /// Which macro
        name: MacroName,
        /// Bound variable name
        var: String,
        /// Predicate/transform body
        body: Box<Expr>,
    },
}

impl Expr {
    /// Parse an expression body (the text between `${` and `}`)
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.ternary()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::parse(format!(
                "unexpected trailing input after expression in '{}'",
                src
            )));
        }
        Ok(expr)
    }

    /// Collect the root identifiers this expression reads
    ///
    /// Macro-bound variables are scoped out; the result is the set of
    /// environment names (namespaces or node ids) the expression depends on.
    pub fn roots(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut bound = Vec::new();
        self.collect_roots(&mut out, &mut bound);
        out
    }

    fn collect_roots(&self, out: &mut BTreeSet<String>, bound: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => {
                if !bound.iter().any(|b| b == name) {
                    out.insert(name.clone());
                }
            }
            Expr::Member { base, .. } => base.collect_roots(out, bound),
            Expr::Index { base, index } => {
                base.collect_roots(out, bound);
                index.collect_roots(out, bound);
            }
            Expr::List(items) => {
                for item in items {
                    item.collect_roots(out, bound);
                }
            }
            Expr::Unary { expr, .. } => expr.collect_roots(out, bound),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_roots(out, bound);
                rhs.collect_roots(out, bound);
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_roots(out, bound);
                then.collect_roots(out, bound);
                otherwise.collect_roots(out, bound);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_roots(out, bound);
                }
            }
            Expr::Macro {
                base, var, body, ..
            } => {
                base.collect_roots(out, bound);
                bound.push(var.clone());
                body.collect_roots(out, bound);
                bound.pop();
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, context: &str) -> Result<(), ExprError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExprError::parse(format!(
                "expected {:?} {} (found {:?})",
                expected,
                context,
                self.peek()
            )))
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.coalesce()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(Token::Colon, "in ternary")?;
            let otherwise = self.ternary()?;
            Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        } else {
            Ok(cond)
        }
    }

    fn coalesce(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.or()?;
        while self.eat(&Token::Coalesce) {
            let rhs = self.or()?;
            lhs = Expr::Binary {
                op: BinaryOp::Coalesce,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::And) {
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Minus) {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) | Some(Token::OptDot) => {
                    let optional = matches!(self.peek(), Some(Token::OptDot));
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(ExprError::parse(format!(
                                "expected field name after '.', found {:?}",
                                other
                            )));
                        }
                    };
                    // `base.all(v, pred)` is a macro, not a member access
                    if self.peek() == Some(&Token::LParen) {
                        if let Some(macro_name) = MacroName::from_ident(&name) {
                            self.pos += 1; // consume '('
                            let var = match self.next() {
                                Some(Token::Ident(v)) => v,
                                other => {
                                    return Err(ExprError::parse(format!(
                                        "expected bound variable in macro, found {:?}",
                                        other
                                    )));
                                }
                            };
                            self.expect(Token::Comma, "after macro variable")?;
                            let body = self.ternary()?;
                            self.expect(Token::RParen, "to close macro")?;
                            expr = Expr::Macro {
                                base: Box::new(expr),
                                name: macro_name,
                                var,
                                body: Box::new(body),
                            };
                            continue;
                        }
                        return Err(ExprError::parse(format!(
                            "unknown method '{}' (supported: all, exists, exists_one, filter, map)",
                            name
                        )));
                    }
                    expr = Expr::Member {
                        base: Box::new(expr),
                        name,
                        optional,
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.ternary()?;
                    self.expect(Token::RBracket, "to close index")?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let expr = self.ternary()?;
                self.expect(Token::RParen, "to close group")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket, "to close list")?;
                Ok(Expr::List(items))
            }
            Some(Token::Ident(name)) => {
                // `size(x)` and conversion built-ins are free functions
                if self.peek() == Some(&Token::LParen)
                    && matches!(name.as_str(), "size" | "string" | "int" | "bool" | "float")
                {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen, "to close call")?;
                    return Ok(Expr::Call { name, args });
                }
                Ok(Expr::Ident(name))
            }
            other => Err(ExprError::parse(format!(
                "expected expression, found {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_path() {
        let expr = Expr::parse("schema.spec.name").unwrap();
        assert_eq!(expr.roots(), BTreeSet::from(["schema".to_string()]));
    }

    #[test]
    fn test_parse_optional_chain() {
        let expr = Expr::parse("db.status.?ready == true").unwrap();
        match &expr {
            Expr::Binary { op, lhs, .. } => {
                assert_eq!(*op, BinaryOp::Eq);
                match lhs.as_ref() {
                    Expr::Member { optional, name, .. } => {
                        assert!(*optional);
                        assert_eq!(name, "ready");
                    }
                    other => panic!("expected optional member, got {:?}", other),
                }
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ternary_and_coalesce() {
        let expr = Expr::parse("a.?b ?? 'fallback'").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::Coalesce,
                ..
            }
        ));

        let expr = Expr::parse("x > 0 ? 'pos' : 'neg'").unwrap();
        assert!(matches!(expr, Expr::Ternary { .. }));
    }

    #[test]
    fn test_precedence_arithmetic_over_comparison() {
        // 1 + 2 * 3 == 7 parses as (1 + (2 * 3)) == 7
        let expr = Expr::parse("1 + 2 * 3 == 7").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Eq, lhs, .. } => match *lhs {
                Expr::Binary { op: BinaryOp::Add, .. } => {}
                other => panic!("expected add on lhs, got {:?}", other),
            },
            other => panic!("expected eq at top, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_macro() {
        let expr = Expr::parse("items.all(x, x.ready == true)").unwrap();
        match &expr {
            Expr::Macro { name, var, .. } => {
                assert_eq!(*name, MacroName::All);
                assert_eq!(var, "x");
            }
            other => panic!("expected macro, got {:?}", other),
        }
        // the bound variable is scoped out of root extraction
        assert_eq!(expr.roots(), BTreeSet::from(["items".to_string()]));
    }

    #[test]
    fn test_parse_builtin_calls() {
        assert!(matches!(
            Expr::parse("size(items)").unwrap(),
            Expr::Call { .. }
        ));
        assert!(matches!(
            Expr::parse("string(schema.spec.port)").unwrap(),
            Expr::Call { .. }
        ));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = Expr::parse("items.reduce(x, x)").unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }

    #[test]
    fn test_parse_list_literal() {
        let expr = Expr::parse("[1, 2, 3]").unwrap();
        assert!(matches!(expr, Expr::List(ref items) if items.len() == 3));
        assert_eq!(Expr::parse("[]").unwrap(), Expr::List(vec![]));

        // a leading bracket is a literal; after a primary it is still an index
        assert!(matches!(Expr::parse("[1, 2][0]").unwrap(), Expr::Index { .. }));

        let expr = Expr::parse("[db.url, config.url]").unwrap();
        assert_eq!(
            expr.roots(),
            BTreeSet::from(["db".to_string(), "config".to_string()])
        );
    }

    #[test]
    fn test_bracket_string_key() {
        let expr = Expr::parse("config.data['db-host']").unwrap();
        assert!(matches!(expr, Expr::Index { .. }));
    }

    #[test]
    fn test_roots_cover_all_operands() {
        let expr = Expr::parse("db.ready && config.done ? app.url : fallback.url").unwrap();
        assert_eq!(
            expr.roots(),
            BTreeSet::from([
                "db".to_string(),
                "config".to_string(),
                "app".to_string(),
                "fallback".to_string(),
            ])
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("a ?").is_err());
    }
}
