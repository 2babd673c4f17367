//! # Parser
//!
//! Recursive-descent parser for the logic dialect:
//!
//! - Declarations: `Decl name(A1, ..., An) bound [/t, ...] descr [external(), mode('+','-')].`
//! - Facts: `pred(term1, ..., termn).`
//! - Rules: `head :- lit1, ..., litn.` with `!` negation, `let X = fn:...`
//!   bindings, comparisons, and `|> do fn:group_by(...), let Y = fn:Sum(Z)`
//!   transform pipelines.
//! - Queries: `pred(args)?`
//! - Comments: `#` to end of line.
//!
//! All failures carry a typed error kind plus line/column.

mod lexer;

pub use lexer::{tokenize, Tok, Token};

use crate::ast::{
    AggLet, Atom, Clause, CmpOp, Decl, DescrBlock, Expr, Literal, Mode, Pipeline, Program, Unit,
};
use crate::error::{KernelError, KernelResult, Span};
use crate::term::{Term, TypeTag};
use tracing::debug;

/// Parse a full source text (schema files, rule registrations).
pub fn parse_program(source: &str) -> KernelResult<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let mut units = Vec::new();
    while !parser.at_end() {
        units.push(parser.parse_unit()?);
    }
    Ok(Program { units })
}

/// Parse a single query goal, with or without the trailing `?`.
pub fn parse_goal(source: &str) -> KernelResult<Atom> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    let atom = parser.parse_atom()?;
    // Accept `goal`, `goal?` and `goal.` so hosts can pass file-style text.
    if !parser.at_end() {
        let tok = parser.bump()?;
        if !matches!(tok.tok, Tok::Question | Tok::Period) {
            return Err(KernelError::parse(
                tok.span,
                format!("expected end of query, found {}", tok.tok.describe()),
            ));
        }
    }
    if !parser.at_end() {
        let tok = parser.bump()?;
        return Err(KernelError::parse(
            tok.span,
            format!("trailing input after query: {}", tok.tok.describe()),
        ));
    }
    Ok(atom)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Fresh-name counter so each `_` wildcard stays independent.
    wildcards: u32,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            wildcards: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn last_span(&self) -> Span {
        self.tokens
            .last()
            .map(|t| t.span)
            .unwrap_or_else(|| Span::new(1, 1))
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_ahead(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|t| &t.tok)
    }

    fn bump(&mut self) -> KernelResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| KernelError::parse(self.last_span(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> KernelResult<Token> {
        let token = self.bump()?;
        if &token.tok == expected {
            Ok(token)
        } else {
            Err(KernelError::parse(
                token.span,
                format!("expected {}, found {}", what, token.tok.describe()),
            ))
        }
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn fresh_wildcard(&mut self) -> String {
        let name = format!("_{}", self.wildcards);
        self.wildcards += 1;
        name
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn parse_unit(&mut self) -> KernelResult<Unit> {
        if let Some(Tok::Ident(word)) = self.peek() {
            if word == "Decl" {
                return self.parse_decl().map(Unit::Decl);
            }
        }

        let head = self.parse_atom()?;
        let token = self.bump()?;
        match token.tok {
            Tok::Question => Ok(Unit::Query(head)),
            Tok::Period => Ok(Unit::Clause(Clause {
                span: head.span,
                head,
                body: Vec::new(),
                pipeline: None,
            })),
            Tok::Implies => {
                let (body, pipeline) = self.parse_body()?;
                Ok(Unit::Clause(Clause {
                    span: head.span,
                    head,
                    body,
                    pipeline,
                }))
            }
            other => Err(KernelError::parse(
                token.span,
                format!("expected '.', '?' or ':-', found {}", other.describe()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_decl(&mut self) -> KernelResult<Decl> {
        let kw = self.bump()?; // `Decl`
        let name = self.parse_predicate_name()?;
        self.expect(&Tok::LParen, "'('")?;

        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                let token = self.bump()?;
                match token.tok {
                    Tok::Ident(arg) => args.push(arg),
                    other => {
                        return Err(KernelError::parse(
                            token.span,
                            format!("expected argument name, found {}", other.describe()),
                        ));
                    }
                }
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(&Tok::Comma, "','")?;
            }
        }

        let mut bound = None;
        let mut descr = DescrBlock::default();

        loop {
            match self.peek() {
                Some(Tok::Ident(word)) if word == "bound" => {
                    self.bump()?;
                    bound = Some(self.parse_type_vector(args.len())?);
                }
                Some(Tok::Ident(word)) if word == "descr" => {
                    self.bump()?;
                    descr = self.parse_descr_block()?;
                }
                _ => break,
            }
        }

        self.expect(&Tok::Period, "'.'")?;

        Ok(Decl {
            name,
            args,
            bound,
            descr,
            span: kw.span,
        })
    }

    fn parse_type_vector(&mut self, arity: usize) -> KernelResult<Vec<TypeTag>> {
        let open = self.expect(&Tok::LBracket, "'['")?;
        let mut types = Vec::new();
        if !self.eat(&Tok::RBracket) {
            loop {
                let token = self.bump()?;
                match token.tok {
                    Tok::NameConst(text) => {
                        let tag = TypeTag::parse(&text).ok_or_else(|| {
                            KernelError::parse(token.span, format!("unknown type '/{}'", text))
                        })?;
                        types.push(tag);
                    }
                    other => {
                        return Err(KernelError::parse(
                            token.span,
                            format!("expected type constant, found {}", other.describe()),
                        ));
                    }
                }
                if self.eat(&Tok::RBracket) {
                    break;
                }
                self.expect(&Tok::Comma, "','")?;
            }
        }
        if types.len() != arity {
            return Err(KernelError::parse(
                open.span,
                format!(
                    "bound vector has {} types but the predicate has {} arguments",
                    types.len(),
                    arity
                ),
            ));
        }
        Ok(types)
    }

    fn parse_descr_block(&mut self) -> KernelResult<DescrBlock> {
        self.expect(&Tok::LBracket, "'['")?;
        let mut block = DescrBlock::default();
        if self.eat(&Tok::RBracket) {
            return Ok(block);
        }
        loop {
            let token = self.bump()?;
            let tag = match token.tok {
                Tok::Ident(tag) => tag,
                other => {
                    return Err(KernelError::parse(
                        token.span,
                        format!("expected descr tag, found {}", other.describe()),
                    ));
                }
            };
            self.expect(&Tok::LParen, "'('")?;
            match tag.as_str() {
                "external" => {
                    self.expect(&Tok::RParen, "')'")?;
                    block.external = true;
                }
                "mode" => {
                    let mut modes = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            let token = self.bump()?;
                            match &token.tok {
                                Tok::Quoted(text) => {
                                    let mode = Mode::parse(text).ok_or_else(|| {
                                        KernelError::parse(
                                            token.span,
                                            format!("unknown mode '{}'", text),
                                        )
                                    })?;
                                    modes.push(mode);
                                }
                                other => {
                                    return Err(KernelError::parse(
                                        token.span,
                                        format!("expected mode symbol, found {}", other.describe()),
                                    ));
                                }
                            }
                            if self.eat(&Tok::RParen) {
                                break;
                            }
                            self.expect(&Tok::Comma, "','")?;
                        }
                    }
                    block.modes = Some(modes);
                }
                "doc" => {
                    let token = self.bump()?;
                    match token.tok {
                        Tok::Str(text) => block.doc = Some(text),
                        other => {
                            return Err(KernelError::parse(
                                token.span,
                                format!("expected string in doc(), found {}", other.describe()),
                            ));
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                }
                unknown => {
                    // Unknown annotations are tolerated; schema semantics do
                    // not depend on them.
                    debug!(tag = unknown, "ignoring unknown descr annotation");
                    let mut depth = 1usize;
                    while depth > 0 {
                        let token = self.bump()?;
                        match token.tok {
                            Tok::LParen => depth += 1,
                            Tok::RParen => depth -= 1,
                            _ => {}
                        }
                    }
                }
            }
            if self.eat(&Tok::RBracket) {
                break;
            }
            self.expect(&Tok::Comma, "','")?;
        }
        Ok(block)
    }

    // ------------------------------------------------------------------
    // Rule bodies
    // ------------------------------------------------------------------

    fn parse_body(&mut self) -> KernelResult<(Vec<Literal>, Option<Pipeline>)> {
        let mut body = Vec::new();
        let mut pipeline = None;

        loop {
            body.push(self.parse_literal()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            if let Some(Tok::Pipe) = self.peek() {
                let token = self.bump()?;
                pipeline = Some(self.parse_pipeline(token.span)?);
            }
            self.expect(&Tok::Period, "'.'")?;
            break;
        }

        Ok((body, pipeline))
    }

    fn parse_literal(&mut self) -> KernelResult<Literal> {
        match self.peek() {
            Some(Tok::Bang) => {
                self.bump()?;
                let atom = self.parse_atom()?;
                Ok(Literal::Neg(atom))
            }
            Some(Tok::Ident(word)) if word == "let" => {
                let kw = self.bump()?;
                let var = self.parse_variable_name()?;
                self.expect(&Tok::Eq, "'='")?;
                let expr = self.parse_expr()?;
                Ok(Literal::Let {
                    var,
                    expr,
                    span: kw.span,
                })
            }
            Some(Tok::Ident(_)) if matches!(self.peek_ahead(1), Some(Tok::LParen)) => {
                // Positive atoms look like `name(...)`; an uppercase
                // identifier before '(' can only be a comparison operand.
                if self.peek_is_lowercase_ident() {
                    let atom = self.parse_atom()?;
                    Ok(Literal::Pos(atom))
                } else {
                    self.parse_comparison()
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn peek_is_lowercase_ident(&self) -> bool {
        matches!(
            self.peek(),
            Some(Tok::Ident(word)) if word.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        )
    }

    fn parse_comparison(&mut self) -> KernelResult<Literal> {
        let lhs = self.parse_term()?;
        let token = self.bump()?;
        let op = match token.tok {
            Tok::Eq => CmpOp::Eq,
            Tok::Ne => CmpOp::Ne,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
            other => {
                return Err(KernelError::parse(
                    token.span,
                    format!("expected comparison operator, found {}", other.describe()),
                ));
            }
        };
        let rhs = self.parse_term()?;
        Ok(Literal::Cmp {
            op,
            lhs,
            rhs,
            span: token.span,
        })
    }

    fn parse_expr(&mut self) -> KernelResult<Expr> {
        if let Some(Tok::FnName(_)) = self.peek() {
            let token = self.bump()?;
            let Tok::FnName(func) = token.tok else {
                unreachable!("peeked FnName");
            };
            self.expect(&Tok::LParen, "'('")?;
            let mut args = Vec::new();
            if !self.eat(&Tok::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    if self.eat(&Tok::RParen) {
                        break;
                    }
                    self.expect(&Tok::Comma, "','")?;
                }
            }
            return Ok(Expr::Apply {
                func,
                args,
                span: token.span,
            });
        }
        Ok(Expr::Term(self.parse_term()?))
    }

    fn parse_pipeline(&mut self, span: Span) -> KernelResult<Pipeline> {
        // First stage must be `do fn:group_by(...)`.
        let token = self.bump()?;
        match &token.tok {
            Tok::Ident(word) if word == "do" => {}
            other => {
                return Err(KernelError::parse(
                    token.span,
                    format!("expected 'do' after '|>', found {}", other.describe()),
                ));
            }
        }
        let token = self.bump()?;
        match &token.tok {
            Tok::FnName(name) if name == "group_by" => {}
            other => {
                return Err(KernelError::parse(
                    token.span,
                    format!("expected 'fn:group_by', found {}", other.describe()),
                ));
            }
        }
        self.expect(&Tok::LParen, "'('")?;
        let mut group_by = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                group_by.push(self.parse_variable_name()?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(&Tok::Comma, "','")?;
            }
        }

        let mut lets = Vec::new();
        while self.eat(&Tok::Comma) {
            let token = self.bump()?;
            match &token.tok {
                Tok::Ident(word) if word == "let" => {}
                other => {
                    return Err(KernelError::parse(
                        token.span,
                        format!("expected 'let' in pipeline, found {}", other.describe()),
                    ));
                }
            }
            let var = self.parse_variable_name()?;
            self.expect(&Tok::Eq, "'='")?;
            let func_token = self.bump()?;
            let func = match func_token.tok {
                Tok::FnName(name) => name,
                other => {
                    return Err(KernelError::parse(
                        func_token.span,
                        format!("expected aggregate function, found {}", other.describe()),
                    ));
                }
            };
            self.expect(&Tok::LParen, "'('")?;
            let arg = if self.eat(&Tok::RParen) {
                None
            } else {
                let name = self.parse_variable_name()?;
                self.expect(&Tok::RParen, "')'")?;
                Some(name)
            };
            lets.push(AggLet {
                var,
                func,
                arg,
                span: token.span,
            });
        }

        if lets.is_empty() {
            return Err(KernelError::parse(
                span,
                "pipeline must bind at least one aggregate with 'let'",
            ));
        }

        Ok(Pipeline {
            group_by,
            lets,
            span,
        })
    }

    // ------------------------------------------------------------------
    // Atoms and terms
    // ------------------------------------------------------------------

    fn parse_predicate_name(&mut self) -> KernelResult<String> {
        let token = self.bump()?;
        match token.tok {
            Tok::Ident(name) => Ok(name),
            other => Err(KernelError::parse(
                token.span,
                format!("expected predicate name, found {}", other.describe()),
            )),
        }
    }

    fn parse_variable_name(&mut self) -> KernelResult<String> {
        let token = self.bump()?;
        match token.tok {
            Tok::Ident(name)
                if name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_uppercase() || c == '_') =>
            {
                if name == "_" {
                    Ok(self.fresh_wildcard())
                } else {
                    Ok(name)
                }
            }
            other => Err(KernelError::parse(
                token.span,
                format!("expected variable, found {}", other.describe()),
            )),
        }
    }

    fn parse_atom(&mut self) -> KernelResult<Atom> {
        let token = self.bump()?;
        let (pred, span) = match token.tok {
            Tok::Ident(name) => (name, token.span),
            other => {
                return Err(KernelError::parse(
                    token.span,
                    format!("expected predicate name, found {}", other.describe()),
                ));
            }
        };
        self.expect(&Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                args.push(self.parse_term()?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(&Tok::Comma, "','")?;
            }
        }
        Ok(Atom { pred, args, span })
    }

    fn parse_term(&mut self) -> KernelResult<Term> {
        let token = self.bump()?;
        match token.tok {
            Tok::NameConst(text) => Ok(Term::name(&text)),
            Tok::Str(text) => Ok(Term::string(&text)),
            Tok::Int(v) => Ok(Term::Int(v)),
            Tok::Float(v) => Ok(Term::Float(v)),
            Tok::Ident(name) => {
                let first = name.chars().next().unwrap_or('_');
                if name == "_" {
                    Ok(Term::Var(self.fresh_wildcard()))
                } else if first.is_ascii_uppercase() || first == '_' {
                    Ok(Term::Var(name))
                } else {
                    Err(KernelError::parse(
                        token.span,
                        format!(
                            "expected term, found identifier '{}' (name constants are written '/{}')",
                            name, name
                        ),
                    ))
                }
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_term()?);
                        if self.eat(&Tok::RBracket) {
                            break;
                        }
                        self.expect(&Tok::Comma, "','")?;
                    }
                }
                Ok(Term::List(items))
            }
            Tok::LBrace => {
                let mut fields = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key_token = self.bump()?;
                        let key = match key_token.tok {
                            Tok::NameConst(text) => crate::interner::Interner::global().name(&text),
                            other => {
                                return Err(KernelError::parse(
                                    key_token.span,
                                    format!(
                                        "expected name constant key, found {}",
                                        other.describe()
                                    ),
                                ));
                            }
                        };
                        self.expect(&Tok::Colon, "':'")?;
                        let value = self.parse_term()?;
                        fields.push((key, value));
                        if self.eat(&Tok::RBrace) {
                            break;
                        }
                        self.expect(&Tok::Comma, "','")?;
                    }
                }
                Ok(Term::Struct(fields))
            }
            other => Err(KernelError::parse(
                token.span,
                format!("expected term, found {}", other.describe()),
            )),
        }
    }
}
