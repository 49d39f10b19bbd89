//! Expression parsing and evaluation for formula parameters
//!
//! A formula parameter is computed from the other natural-scale parameters
//! of the same dataset, e.g. `c = a + b` or `k2 = k1 * exp(-dE)`. The fit
//! core only relies on the [`FormulaCompiler`] contract; [`ExpressionCompiler`]
//! is the built-in arithmetic implementation, parsed with `nom`.

use crate::error::{FitError, Result};
use nom::{
    character::complete::{char, multispace0},
    error::{Error as NomError, ErrorKind},
    number::complete::double,
    IResult, Parser,
};
use std::fmt;
use std::sync::Arc;

type PResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

/// A formula compiled against a list of variable names.
pub trait CompiledFormula: Send + Sync + fmt::Debug {
    /// Evaluates the formula. `values` follows the order of the names the
    /// formula was compiled against.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::Domain`] when the result is not finite.
    fn evaluate(&self, values: &[f64]) -> Result<f64>;

    /// Indices (into the compile-time name list) of the variables used.
    fn dependencies(&self) -> &[usize];

    /// The source text.
    fn source(&self) -> &str;
}

/// The scripting-evaluator contract needed by formula parameters.
pub trait FormulaCompiler: Send + Sync {
    /// Compiles `expression` where identifiers refer to `variables`.
    ///
    /// # Errors
    ///
    /// Returns [`FitError::Expression`] for syntax errors and for unknown
    /// identifiers, naming the offending identifier.
    fn compile(&self, expression: &str, variables: &[String]) -> Result<Arc<dyn CompiledFormula>>;
}

/// Expression AST node, generic over how variables are referred to
#[derive(Debug, Clone, PartialEq)]
pub enum Expression<V = String> {
    /// Constant number
    Number(f64),

    /// Variable reference
    Variable(V),

    /// Negation
    Neg(Box<Expression<V>>),

    /// Binary operations
    Binary(BinaryOp, Box<Expression<V>>, Box<Expression<V>>),

    /// Function call
    Function(MathFunction, Vec<Expression<V>>),
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Functions known to the built-in evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunction {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Abs,
    Min,
    Max,
    Pow,
}

impl MathFunction {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => MathFunction::Exp,
            "ln" | "log" => MathFunction::Ln,
            "log10" => MathFunction::Log10,
            "sqrt" => MathFunction::Sqrt,
            "sin" => MathFunction::Sin,
            "cos" => MathFunction::Cos,
            "tan" => MathFunction::Tan,
            "abs" => MathFunction::Abs,
            "min" => MathFunction::Min,
            "max" => MathFunction::Max,
            "pow" => MathFunction::Pow,
            _ => return None,
        })
    }

    fn arity(&self) -> usize {
        match self {
            MathFunction::Min | MathFunction::Max | MathFunction::Pow => 2,
            _ => 1,
        }
    }

    fn apply(&self, args: &[f64]) -> f64 {
        match self {
            MathFunction::Exp => args[0].exp(),
            MathFunction::Ln => args[0].ln(),
            MathFunction::Log10 => args[0].log10(),
            MathFunction::Sqrt => args[0].sqrt(),
            MathFunction::Sin => args[0].sin(),
            MathFunction::Cos => args[0].cos(),
            MathFunction::Tan => args[0].tan(),
            MathFunction::Abs => args[0].abs(),
            MathFunction::Min => args[0].min(args[1]),
            MathFunction::Max => args[0].max(args[1]),
            MathFunction::Pow => args[0].powf(args[1]),
        }
    }
}

impl Expression<String> {
    /// Parse an expression from a string
    pub fn parse(input: &str) -> Result<Self> {
        match expr_parser(input) {
            Ok((remainder, expr)) => {
                // Make sure the entire input was consumed
                if remainder.trim().is_empty() {
                    Ok(expr)
                } else {
                    Err(FitError::Expression(format!(
                        "unexpected trailing characters in '{}': '{}'",
                        input, remainder
                    )))
                }
            }
            Err(e) => Err(FitError::Expression(format!(
                "failed to parse '{}': {}",
                input, e
            ))),
        }
    }

    /// Replaces variable names by their position in `names`.
    pub fn resolve(&self, names: &[String]) -> Result<Expression<usize>> {
        Ok(match self {
            Expression::Number(v) => Expression::Number(*v),
            Expression::Variable(name) => match names.iter().position(|n| n == name) {
                Some(i) => Expression::Variable(i),
                None => {
                    return Err(FitError::Expression(format!(
                        "unknown parameter name '{}'",
                        name
                    )))
                }
            },
            Expression::Neg(e) => Expression::Neg(Box::new(e.resolve(names)?)),
            Expression::Binary(op, l, r) => {
                Expression::Binary(*op, Box::new(l.resolve(names)?), Box::new(r.resolve(names)?))
            }
            Expression::Function(f, args) => Expression::Function(
                *f,
                args.iter()
                    .map(|a| a.resolve(names))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

impl<V: Clone + PartialEq> Expression<V> {
    /// Variables used by the expression, without duplicates, in order of
    /// first appearance.
    pub fn variables(&self) -> Vec<V> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<V>) {
        match self {
            Expression::Number(_) => {}
            Expression::Variable(v) => {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            Expression::Neg(e) => e.collect_variables(out),
            Expression::Binary(_, l, r) => {
                l.collect_variables(out);
                r.collect_variables(out);
            }
            Expression::Function(_, args) => {
                for a in args {
                    a.collect_variables(out);
                }
            }
        }
    }
}

impl Expression<usize> {
    /// Evaluates with `values[i]` standing for variable `i`.
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        match self {
            Expression::Number(v) => *v,
            Expression::Variable(i) => values[*i],
            Expression::Neg(e) => -e.evaluate(values),
            Expression::Binary(op, l, r) => {
                let lhs = l.evaluate(values);
                let rhs = r.evaluate(values);
                match op {
                    BinaryOp::Add => lhs + rhs,
                    BinaryOp::Sub => lhs - rhs,
                    BinaryOp::Mul => lhs * rhs,
                    BinaryOp::Div => lhs / rhs,
                    BinaryOp::Pow => lhs.powf(rhs),
                }
            }
            Expression::Function(f, args) => {
                let mut evaluated = [0.0; 2];
                for (slot, a) in evaluated.iter_mut().zip(args) {
                    *slot = a.evaluate(values);
                }
                f.apply(&evaluated[..args.len()])
            }
        }
    }
}

/// A formula compiled by [`ExpressionCompiler`].
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: String,
    tree: Expression<usize>,
    dependencies: Vec<usize>,
}

impl CompiledFormula for CompiledExpression {
    fn evaluate(&self, values: &[f64]) -> Result<f64> {
        let v = self.tree.evaluate(values);
        if v.is_finite() {
            Ok(v)
        } else {
            Err(FitError::Domain(format!(
                "formula '{}' evaluates to {}",
                self.source, v
            )))
        }
    }

    fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    fn source(&self) -> &str {
        &self.source
    }
}

/// The built-in arithmetic formula compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionCompiler;

impl FormulaCompiler for ExpressionCompiler {
    fn compile(&self, expression: &str, variables: &[String]) -> Result<Arc<dyn CompiledFormula>> {
        let tree = Expression::parse(expression)?.resolve(variables)?;
        let dependencies = tree.variables();
        Ok(Arc::new(CompiledExpression {
            source: expression.trim().to_string(),
            tree,
            dependencies,
        }))
    }
}

// Parser implementation

fn ws(input: &str) -> PResult<'_, &str> {
    multispace0(input)
}

fn symbol(input: &str, c: char) -> PResult<'_, char> {
    let (input, _) = ws(input)?;
    char::<&str, NomError<&str>>(c).parse(input)
}

fn identifier(input: &str) -> PResult<'_, &str> {
    let mut end = 0;
    for (i, c) in input.char_indices() {
        let valid = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !valid {
            break;
        }
        end = i + c.len_utf8();
    }
    if end == 0 {
        return Err(nom::Err::Error(NomError::new(input, ErrorKind::Alpha)));
    }
    Ok((&input[end..], &input[..end]))
}

fn number(input: &str) -> PResult<'_, Expression> {
    let (input, value) = double(input)?;
    Ok((input, Expression::Number(value)))
}

fn call_or_variable(input: &str) -> PResult<'_, Expression> {
    let (input, name) = identifier(input)?;
    let Ok((mut rest, _)) = symbol(input, '(') else {
        return Ok((input, Expression::Variable(name.to_string())));
    };
    let function = MathFunction::lookup(name)
        .ok_or_else(|| nom::Err::Failure(NomError::new(input, ErrorKind::Tag)))?;

    let mut args = Vec::new();
    if let Ok((after, _)) = symbol(rest, ')') {
        rest = after;
    } else {
        loop {
            let (after, arg) = expr(rest)?;
            args.push(arg);
            if let Ok((after, _)) = symbol(after, ',') {
                rest = after;
                continue;
            }
            let (after, _) = symbol(after, ')')?;
            rest = after;
            break;
        }
    }
    if args.len() != function.arity() {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Count)));
    }
    Ok((rest, Expression::Function(function, args)))
}

fn primary(input: &str) -> PResult<'_, Expression> {
    let (input, _) = ws(input)?;
    match input.chars().next() {
        Some(c) if c.is_ascii_digit() || c == '.' => number(input),
        Some('(') => {
            let (input, _) = symbol(input, '(')?;
            let (input, e) = expr(input)?;
            let (input, _) = symbol(input, ')')?;
            Ok((input, e))
        }
        _ => call_or_variable(input),
    }
}

// power is right-associative, and binds tighter than unary minus
fn power(input: &str) -> PResult<'_, Expression> {
    let (input, base) = primary(input)?;
    match symbol(input, '^') {
        Ok((input, _)) => {
            let (input, exponent) = unary(input)?;
            Ok((
                input,
                Expression::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)),
            ))
        }
        Err(_) => Ok((input, base)),
    }
}

fn unary(input: &str) -> PResult<'_, Expression> {
    if let Ok((input, _)) = symbol(input, '-') {
        let (input, e) = unary(input)?;
        return Ok((input, Expression::Neg(Box::new(e))));
    }
    if let Ok((input, _)) = symbol(input, '+') {
        return unary(input);
    }
    power(input)
}

fn fold_left<'a>(
    input: &'a str,
    operand: fn(&'a str) -> PResult<'a, Expression>,
    ops: &[(char, BinaryOp)],
) -> PResult<'a, Expression> {
    let (mut input, mut acc) = operand(input)?;
    'outer: loop {
        for &(c, op) in ops {
            if let Ok((after, _)) = symbol(input, c) {
                let (after, rhs) = operand(after)?;
                acc = Expression::Binary(op, Box::new(acc), Box::new(rhs));
                input = after;
                continue 'outer;
            }
        }
        return Ok((input, acc));
    }
}

fn term(input: &str) -> PResult<'_, Expression> {
    fold_left(input, unary, &[('*', BinaryOp::Mul), ('/', BinaryOp::Div)])
}

fn expr(input: &str) -> PResult<'_, Expression> {
    fold_left(input, term, &[('+', BinaryOp::Add), ('-', BinaryOp::Sub)])
}

fn expr_parser(input: &str) -> PResult<'_, Expression> {
    let (input, e) = expr(input)?;
    let (input, _) = ws(input)?;
    Ok((input, e))
}
