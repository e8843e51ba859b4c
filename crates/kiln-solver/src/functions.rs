//! Coefficient function manager.
//!
//! User coefficients (`thermal source`, `thermal diffusion`, boundary data,
//! ...) are strings parsed once per (name, location) into an expression
//! tree, then decomposed into a postorder node list so every evaluation is
//! a single linear sweep. Terminals that reference the solution, its
//! gradient, or parameters produce AD values carrying whatever seeding the
//! gather pass established; purely spatial expressions can also be
//! evaluated at raw points (initial conditions, Dirichlet values).

use std::collections::HashMap;
use std::f64::consts::PI;

use kiln_model::ConfigError;

use crate::error::AssemblyError;
use crate::workset::Workset;
use crate::EvalScalar;

/// Where a registered function is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Ip,
    SideIp,
}

impl Location {
    fn label(&self) -> &'static str {
        match self {
            Location::Ip => "ip",
            Location::SideIp => "side ip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func1 {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func2 {
    Min,
    Max,
}

/// One node of the decomposed expression; operands refer to earlier nodes.
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Const(f64),
    Coord(usize),
    Time,
    Normal(usize),
    Soln(usize),
    SolnGrad(usize, usize),
    ScalarParam(usize),
    ParamField(usize),
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Pow(usize, usize),
    PowI(usize, i32),
    Neg(usize),
    Fn1(Func1, usize),
    Fn2(Func2, usize, usize),
}

/// A decomposed expression: postorder node list, result in the last node.
#[derive(Debug, Clone)]
pub struct Expression {
    terms: Vec<Term>,
    name: String,
}

impl Expression {
    /// True when no node references the solution, a gradient, or a normal.
    pub fn is_spatial(&self) -> bool {
        self.terms.iter().all(|t| {
            !matches!(
                t,
                Term::Soln(_) | Term::SolnGrad(_, _) | Term::Normal(_) | Term::ParamField(_)
            )
        })
    }

    /// Evaluate at plain points (no workset): used for initial conditions
    /// and Dirichlet values at mesh nodes.
    pub fn eval_at_points(
        &self,
        pts: &[[f64; 3]],
        time: f64,
        scalar_params: &[f64],
    ) -> Result<Vec<f64>, AssemblyError> {
        let n = pts.len();
        let mut vals: Vec<Vec<f64>> = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let field = match term {
                Term::Const(c) => vec![*c; n],
                Term::Coord(d) => pts.iter().map(|p| p[*d]).collect(),
                Term::Time => vec![time; n],
                Term::ScalarParam(i) => vec![scalar_params[*i]; n],
                Term::Soln(_) | Term::SolnGrad(_, _) | Term::Normal(_) | Term::ParamField(_) => {
                    return Err(AssemblyError::MissingCoefficient {
                        name: self.name.clone(),
                        location: "nodal evaluation (solution-dependent)".to_string(),
                    })
                }
                Term::Add(a, b) => binary(&vals[*a], &vals[*b], |x, y| x + y),
                Term::Sub(a, b) => binary(&vals[*a], &vals[*b], |x, y| x - y),
                Term::Mul(a, b) => binary(&vals[*a], &vals[*b], |x, y| x * y),
                Term::Div(a, b) => binary(&vals[*a], &vals[*b], |x, y| x / y),
                Term::Pow(a, b) => binary(&vals[*a], &vals[*b], |x, y| x.powf(y)),
                Term::PowI(a, p) => vals[*a].iter().map(|x| x.powi(*p)).collect(),
                Term::Neg(a) => vals[*a].iter().map(|x| -x).collect(),
                Term::Fn1(f, a) => vals[*a]
                    .iter()
                    .map(|x| match f {
                        Func1::Sin => x.sin(),
                        Func1::Cos => x.cos(),
                        Func1::Tan => x.tan(),
                        Func1::Exp => x.exp(),
                        Func1::Log => x.ln(),
                        Func1::Sqrt => x.sqrt(),
                        Func1::Abs => x.abs(),
                    })
                    .collect(),
                Term::Fn2(f, a, b) => binary(&vals[*a], &vals[*b], |x, y| match f {
                    Func2::Min => x.min(y),
                    Func2::Max => x.max(y),
                }),
            };
            vals.push(field);
        }
        Ok(vals.pop().unwrap_or_default())
    }

    /// Evaluate over the workset's current points, returning an AD field of
    /// length `num_elems * num_ip`.
    pub fn eval(&self, loc: Location, ws: &Workset) -> Result<Vec<EvalScalar>, AssemblyError> {
        let n = ws.num_elems * ws.num_ip;
        let coords: &[[f64; 3]] = match loc {
            Location::Ip => {
                &ws.geom
                    .as_ref()
                    .expect("volume geometry bound to workset")
                    .ip
            }
            Location::SideIp => {
                &ws.side_geom
                    .as_ref()
                    .expect("side geometry bound to workset")
                    .ip
            }
        };

        let mut vals: Vec<Vec<EvalScalar>> = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let field: Vec<EvalScalar> = match term {
                Term::Const(c) => vec![EvalScalar::constant(*c); n],
                Term::Coord(d) => (0..n)
                    .map(|p| EvalScalar::constant(coords[p][*d]))
                    .collect(),
                Term::Time => vec![EvalScalar::constant(ws.time); n],
                Term::Normal(d) => {
                    let sg = ws.side_geom.as_ref().ok_or_else(|| {
                        AssemblyError::MissingCoefficient {
                            name: self.name.clone(),
                            location: "normal outside side evaluation".to_string(),
                        }
                    })?;
                    (0..n)
                        .map(|p| EvalScalar::constant(sg.normals[p][*d]))
                        .collect()
                }
                Term::Soln(v) => ws.soln[*v].clone(),
                Term::SolnGrad(v, d) => ws.soln_grad[*v].iter().map(|g| g[*d]).collect(),
                Term::ScalarParam(i) => vec![ws.scalar_params[*i]; n],
                Term::ParamField(f) => ws.param_fields[*f].clone(),
                Term::Add(a, b) => binary(&vals[*a], &vals[*b], |x, y| x + y),
                Term::Sub(a, b) => binary(&vals[*a], &vals[*b], |x, y| x - y),
                Term::Mul(a, b) => binary(&vals[*a], &vals[*b], |x, y| x * y),
                Term::Div(a, b) => binary(&vals[*a], &vals[*b], |x, y| x / y),
                Term::Pow(a, b) => binary(&vals[*a], &vals[*b], |x, y| x.pow(y)),
                Term::PowI(a, p) => vals[*a].iter().map(|x| x.powi(*p)).collect(),
                Term::Neg(a) => vals[*a].iter().map(|x| -*x).collect(),
                Term::Fn1(f, a) => vals[*a]
                    .iter()
                    .map(|x| match f {
                        Func1::Sin => x.sin(),
                        Func1::Cos => x.cos(),
                        Func1::Tan => x.tan(),
                        Func1::Exp => x.exp(),
                        Func1::Log => x.ln(),
                        Func1::Sqrt => x.sqrt(),
                        Func1::Abs => x.abs(),
                    })
                    .collect(),
                Term::Fn2(f, a, b) => binary(&vals[*a], &vals[*b], |x, y| match f {
                    Func2::Min => x.min(y),
                    Func2::Max => x.max(y),
                }),
            };
            debug_assert_eq!(field.len(), n);
            vals.push(field);
        }
        Ok(vals.pop().unwrap_or_default())
    }
}

fn binary<T: Copy>(a: &[T], b: &[T], op: impl Fn(T, T) -> T) -> Vec<T> {
    a.iter().zip(b.iter()).map(|(x, y)| op(*x, *y)).collect()
}

/// Registry of decomposed coefficient functions for one element block.
#[derive(Debug, Clone, Default)]
pub struct FunctionManager {
    vars: Vec<String>,
    /// (name, flat offset, components) of the scalar parameters.
    scalar_params: Vec<(String, usize, usize)>,
    param_fields: Vec<String>,
    fns: HashMap<(String, Location), Expression>,
}

impl FunctionManager {
    pub fn new(
        vars: Vec<String>,
        scalar_params: Vec<(String, usize, usize)>,
        param_fields: Vec<String>,
    ) -> Self {
        Self {
            vars,
            scalar_params,
            param_fields,
            fns: HashMap::new(),
        }
    }

    /// Parse and decompose an expression. Registration happens once per
    /// (name, location).
    pub fn register(&mut self, name: &str, expr: &str, loc: Location) -> Result<(), ConfigError> {
        if self.fns.contains_key(&(name.to_string(), loc)) {
            return Ok(());
        }
        let ast = parse(expr).map_err(|reason| ConfigError::BadExpression {
            name: name.to_string(),
            reason,
        })?;
        let mut terms = Vec::new();
        self.flatten(&ast, &mut terms)
            .map_err(|reason| ConfigError::BadExpression {
                name: name.to_string(),
                reason,
            })?;
        self.fns.insert(
            (name.to_string(), loc),
            Expression {
                terms,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, name: &str, loc: Location) -> bool {
        self.fns.contains_key(&(name.to_string(), loc))
    }

    pub fn get(&self, name: &str, loc: Location) -> Result<&Expression, AssemblyError> {
        self.fns.get(&(name.to_string(), loc)).ok_or_else(|| {
            AssemblyError::MissingCoefficient {
                name: name.to_string(),
                location: loc.label().to_string(),
            }
        })
    }

    /// Evaluate a registered function over the workset's current points.
    pub fn evaluate(
        &self,
        name: &str,
        loc: Location,
        ws: &Workset,
    ) -> Result<Vec<EvalScalar>, AssemblyError> {
        self.get(name, loc)?.eval(loc, ws)
    }

    fn flatten(&self, ast: &Ast, terms: &mut Vec<Term>) -> Result<usize, String> {
        let term = match ast {
            Ast::Num(v) => Term::Const(*v),
            Ast::Ident(name) => self.resolve_ident(name)?,
            Ast::Neg(a) => {
                let ia = self.flatten(a, terms)?;
                Term::Neg(ia)
            }
            Ast::Bin(op, a, b) => {
                if *op == '^' {
                    if let Ast::Num(p) = **b {
                        if p.fract() == 0.0 && p.abs() < 1e6 {
                            let ia = self.flatten(a, terms)?;
                            terms.push(Term::PowI(ia, p as i32));
                            return Ok(terms.len() - 1);
                        }
                    }
                }
                let ia = self.flatten(a, terms)?;
                let ib = self.flatten(b, terms)?;
                match op {
                    '+' => Term::Add(ia, ib),
                    '-' => Term::Sub(ia, ib),
                    '*' => Term::Mul(ia, ib),
                    '/' => Term::Div(ia, ib),
                    '^' => Term::Pow(ia, ib),
                    _ => return Err(format!("unknown operator {op}")),
                }
            }
            Ast::Call(fname, args) => match fname.as_str() {
                "grad" => {
                    let v = self.grad_arg(args)?;
                    Term::SolnGrad(v, 0)
                }
                "min" | "max" => {
                    if args.len() != 2 {
                        return Err(format!("{fname} takes two arguments"));
                    }
                    let ia = self.flatten(&args[0], terms)?;
                    let ib = self.flatten(&args[1], terms)?;
                    let f = if fname == "min" { Func2::Min } else { Func2::Max };
                    Term::Fn2(f, ia, ib)
                }
                _ => {
                    if args.len() != 1 {
                        return Err(format!("{fname} takes one argument"));
                    }
                    let f = match fname.as_str() {
                        "sin" => Func1::Sin,
                        "cos" => Func1::Cos,
                        "tan" => Func1::Tan,
                        "exp" => Func1::Exp,
                        "log" => Func1::Log,
                        "sqrt" => Func1::Sqrt,
                        "abs" => Func1::Abs,
                        _ => return Err(format!("unknown function {fname}")),
                    };
                    let ia = self.flatten(&args[0], terms)?;
                    Term::Fn1(f, ia)
                }
            },
            Ast::Index(inner, idx) => match (&**inner, idx) {
                (Ast::Call(fname, args), IndexKind::Axis(d)) if fname == "grad" => {
                    let v = self.grad_arg(args)?;
                    Term::SolnGrad(v, *d)
                }
                (Ast::Ident(name), IndexKind::Int(i)) => {
                    let (_, offset, comps) = self
                        .scalar_params
                        .iter()
                        .find(|(n, _, _)| n == name)
                        .ok_or_else(|| format!("unknown parameter {name}"))?;
                    if *i >= *comps {
                        return Err(format!("parameter {name} has {comps} components"));
                    }
                    Term::ScalarParam(offset + i)
                }
                _ => return Err("unsupported indexing".to_string()),
            },
        };
        terms.push(term);
        Ok(terms.len() - 1)
    }

    fn grad_arg(&self, args: &[Ast]) -> Result<usize, String> {
        if args.len() != 1 {
            return Err("grad takes one variable argument".to_string());
        }
        match &args[0] {
            Ast::Ident(v) => self
                .vars
                .iter()
                .position(|n| n == v)
                .ok_or_else(|| format!("unknown variable {v}")),
            _ => Err("grad argument must be a variable".to_string()),
        }
    }

    fn resolve_ident(&self, name: &str) -> Result<Term, String> {
        match name {
            "x" => return Ok(Term::Coord(0)),
            "y" => return Ok(Term::Coord(1)),
            "z" => return Ok(Term::Coord(2)),
            "t" => return Ok(Term::Time),
            "pi" => return Ok(Term::Const(PI)),
            "nx" => return Ok(Term::Normal(0)),
            "ny" => return Ok(Term::Normal(1)),
            "nz" => return Ok(Term::Normal(2)),
            _ => {}
        }
        if let Some(v) = self.vars.iter().position(|n| n == name) {
            return Ok(Term::Soln(v));
        }
        if let Some(f) = self.param_fields.iter().position(|n| n == name) {
            return Ok(Term::ParamField(f));
        }
        if let Some((_, offset, comps)) = self.scalar_params.iter().find(|(n, _, _)| n == name) {
            if *comps != 1 {
                return Err(format!("parameter {name} is a vector; index it"));
            }
            return Ok(Term::ScalarParam(*offset));
        }
        Err(format!("unknown identifier {name}"))
    }
}

// --- parsing ---

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Num(f64),
    Ident(String),
    Call(String, Vec<Ast>),
    Index(Box<Ast>, IndexKind),
    Bin(char, Box<Ast>, Box<Ast>),
    Neg(Box<Ast>),
}

#[derive(Debug, Clone, PartialEq)]
enum IndexKind {
    Axis(usize),
    Int(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
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
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && i > start
                            && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let v = text.parse().map_err(|_| format!("bad number {text}"))?;
                tokens.push(Token::Num(v));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(format!("unexpected character {c}")),
        }
    }
    Ok(tokens)
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: Token) -> Result<(), String> {
        match self.next() {
            Some(found) if found == t => Ok(()),
            other => Err(format!("expected {:?}, found {:?}", t, other)),
        }
    }

    fn expr(&mut self) -> Result<Ast, String> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.next();
            let rhs = self.term()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Ast, String> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.next();
            let rhs = self.unary()?;
            lhs = Ast::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, String> {
        if let Some(Token::Op('-')) = self.peek() {
            self.next();
            return Ok(Ast::Neg(Box::new(self.unary()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Ast, String> {
        let base = self.postfix()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.next();
            // Right-associative.
            let exp = self.unary()?;
            return Ok(Ast::Bin('^', Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Ast, String> {
        let mut node = self.primary()?;
        while let Some(Token::LBracket) = self.peek() {
            self.next();
            let idx = match self.next() {
                Some(Token::Ident(s)) => match s.as_str() {
                    "x" => IndexKind::Axis(0),
                    "y" => IndexKind::Axis(1),
                    "z" => IndexKind::Axis(2),
                    _ => return Err(format!("bad index {s}")),
                },
                Some(Token::Num(v)) if v.fract() == 0.0 && v >= 0.0 => {
                    IndexKind::Int(v as usize)
                }
                other => return Err(format!("bad index {:?}", other)),
            };
            self.expect(Token::RBracket)?;
            node = Ast::Index(Box::new(node), idx);
        }
        Ok(node)
    }

    fn primary(&mut self) -> Result<Ast, String> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Ast::Num(v)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn parse(input: &str) -> Result<Ast, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("trailing input at token {}", parser.pos));
    }
    Ok(ast)
}
