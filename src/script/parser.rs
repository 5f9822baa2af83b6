// src/script/parser.rs

use super::{
    ScriptError,
    ast::{BinOp, ClassDef, Expr, FnDef, Program, Stmt, StmtKind, TemplatePart, UnaryOp},
};
use lazy_static::lazy_static;
use pest::{
    Parser,
    error::{Error, LineColLocation},
    iterators::Pair,
    pratt_parser::{Assoc, Op, PrattParser},
};
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "script/stm.pest"] // relative to src
struct StmParser;

lazy_static! {
    /// Binary and unary operators, loosest first.
    static ref PRATT: PrattParser<Rule> = PrattParser::new()
        .op(Op::infix(Rule::op_or, Assoc::Left))
        .op(Op::infix(Rule::op_and, Assoc::Left))
        .op(Op::prefix(Rule::op_not))
        .op(Op::infix(Rule::eq, Assoc::Left)
            | Op::infix(Rule::ne, Assoc::Left)
            | Op::infix(Rule::le, Assoc::Left)
            | Op::infix(Rule::ge, Assoc::Left)
            | Op::infix(Rule::lt, Assoc::Left)
            | Op::infix(Rule::gt, Assoc::Left))
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left)
            | Op::infix(Rule::div, Assoc::Left)
            | Op::infix(Rule::rem, Assoc::Left))
        .op(Op::prefix(Rule::neg));
}

/// Parses a whole module body.
pub fn parse_program(source: &str, origin: &str) -> Result<Program, ScriptError> {
    let lower = Lower::new(origin, 0);
    let program = lower.parse(Rule::program, source)?;
    let statements = program
        .into_inner()
        .filter(|pair| pair.as_rule() != Rule::EOI)
        .map(|pair| lower.statement(pair))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Program { statements })
}

/// Parses a single expression (used for definition-file bodies).
pub fn parse_expr(source: &str, origin: &str) -> Result<Expr, ScriptError> {
    let lower = Lower::new(origin, 0);
    let input = lower.parse(Rule::expr_input, source)?;
    let line = lower.line(&input);
    let expr = significant(input)
        .find(|pair| pair.as_rule() == Rule::expression)
        .ok_or_else(|| lower.error(line, "expected an expression"))?;
    lower.expression(expr)
}

/// Parses a bare interpolated text, such as a `run` command template.
pub fn parse_text_template(text: &str, origin: &str) -> Result<Expr, ScriptError> {
    Lower::new(origin, 0).template(text, 1)
}

/// Inner pairs without the keyword tokens, which carry no data.
fn significant(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|p| {
        !matches!(
            p.as_rule(),
            Rule::kw_import
                | Rule::kw_from
                | Rule::kw_as
                | Rule::kw_fn
                | Rule::kw_class
                | Rule::kw_if
                | Rule::kw_else
        )
    })
}

/// Resolves `\n`, `\t`, `\\` and quote escapes. Unknown escapes are kept as written.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(escaped @ ('\\' | '"' | '\'')) => out.push(escaped),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Turns pest pairs into [`ast`](super::ast) nodes.
///
/// `line_offset` shifts reported lines for text parsed out of a string
/// literal, so errors point at the literal in the original file.
struct Lower<'a> {
    origin: &'a str,
    line_offset: usize,
}

impl<'a> Lower<'a> {
    fn new(origin: &'a str, line_offset: usize) -> Self {
        Self { origin, line_offset }
    }

    fn parse<'i>(&self, rule: Rule, input: &'i str) -> Result<Pair<'i, Rule>, ScriptError> {
        let mut pairs = StmParser::parse(rule, input).map_err(|e| self.syntax_error(&e))?;
        pairs
            .next()
            .ok_or_else(|| self.error(self.line_offset + 1, "empty input"))
    }

    fn syntax_error(&self, error: &Error<Rule>) -> ScriptError {
        let line = match error.line_col {
            LineColLocation::Pos((line, _)) | LineColLocation::Span((line, _), _) => line,
        };
        self.error(line + self.line_offset, error.variant.message())
    }

    fn error(&self, line: usize, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            origin: self.origin.to_string(),
            line,
            message: message.into(),
        }
    }

    fn line(&self, pair: &Pair<'_, Rule>) -> usize {
        pair.line_col().0 + self.line_offset
    }

    fn end_line(&self, pair: &Pair<'_, Rule>) -> usize {
        pair.as_span().end_pos().line_col().0 + self.line_offset
    }

    fn child<'i>(
        &self,
        parts: &mut impl Iterator<Item = Pair<'i, Rule>>,
        line: usize,
        what: &str,
    ) -> Result<Pair<'i, Rule>, ScriptError> {
        parts
            .next()
            .ok_or_else(|| self.error(line, format!("expected {}", what)))
    }

    // --- Statements ---

    fn statement(&self, pair: Pair<'_, Rule>) -> Result<Stmt, ScriptError> {
        let line = self.line(&pair);
        let kind = match pair.as_rule() {
            Rule::import_stmt => {
                let mut parts = significant(pair);
                let module = self.child(&mut parts, line, "a module name")?.as_str().to_string();
                let alias = parts.next().map(|p| p.as_str().to_string());
                StmtKind::Import { module, alias }
            }
            Rule::from_stmt => {
                let mut parts = significant(pair);
                let module = self.child(&mut parts, line, "a module name")?.as_str().to_string();
                let names = parts.map(|p| p.as_str().to_string()).collect();
                StmtKind::FromImport { module, names }
            }
            Rule::assign => {
                let mut parts = significant(pair);
                let name = self.child(&mut parts, line, "a name")?.as_str().to_string();
                let value = self.expression(self.child(&mut parts, line, "a value")?)?;
                StmtKind::Assign { name, value }
            }
            Rule::fn_def => StmtKind::Fn(self.fn_def(pair)?),
            Rule::class_def => StmtKind::Class(self.class_def(pair)?),
            Rule::expression => StmtKind::Expr(self.expression(pair)?),
            other => return Err(self.error(line, format!("unexpected {:?}", other))),
        };
        Ok(Stmt { kind, line })
    }

    fn fn_def(&self, pair: Pair<'_, Rule>) -> Result<FnDef, ScriptError> {
        let line = self.line(&pair);
        let end_line = self.end_line(&pair);
        let source = pair.as_str().trim().to_string();
        let mut parts = significant(pair);
        let name = self.child(&mut parts, line, "a function name")?.as_str().to_string();
        let params = self
            .child(&mut parts, line, "a parameter list")?
            .into_inner()
            .map(|p| p.as_str().to_string())
            .collect();
        let body = self.expression(self.child(&mut parts, line, "a function body")?)?;
        Ok(FnDef {
            name,
            params,
            body,
            line,
            end_line,
            source,
        })
    }

    fn class_def(&self, pair: Pair<'_, Rule>) -> Result<ClassDef, ScriptError> {
        let line = self.line(&pair);
        let source = pair.as_str().trim().to_string();
        let mut parts = significant(pair);
        let name = self.child(&mut parts, line, "a class name")?.as_str().to_string();
        let members = parts.map(|p| self.statement(p)).collect::<Result<Vec<_>, _>>()?;
        Ok(ClassDef {
            name,
            members,
            line,
            source,
        })
    }

    // --- Expressions ---

    fn expression(&self, pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
        let line = self.line(&pair);
        let mut parts = significant(pair);
        let then = self.operators(self.child(&mut parts, line, "an expression")?)?;
        let Some(cond) = parts.next() else {
            return Ok(then);
        };
        let otherwise = self.child(&mut parts, line, "an 'else' branch")?;
        Ok(Expr::Conditional {
            cond: Box::new(self.operators(cond)?),
            then: Box::new(then),
            otherwise: Box::new(self.expression(otherwise)?),
        })
    }

    fn operators(&self, pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
        PRATT
            .map_primary(|operand| self.postfix(operand))
            .map_prefix(|op, operand| {
                let op = match op.as_rule() {
                    Rule::op_not => UnaryOp::Not,
                    _ => UnaryOp::Neg,
                };
                Ok(Expr::Unary(op, Box::new(operand?)))
            })
            .map_infix(|left, op, right| {
                let op = match op.as_rule() {
                    Rule::op_or => BinOp::Or,
                    Rule::op_and => BinOp::And,
                    Rule::eq => BinOp::Eq,
                    Rule::ne => BinOp::NotEq,
                    Rule::le => BinOp::LtEq,
                    Rule::ge => BinOp::GtEq,
                    Rule::lt => BinOp::Lt,
                    Rule::gt => BinOp::Gt,
                    Rule::add => BinOp::Add,
                    Rule::sub => BinOp::Sub,
                    Rule::mul => BinOp::Mul,
                    Rule::div => BinOp::Div,
                    Rule::rem => BinOp::Rem,
                    other => return Err(self.error(self.line(&op), format!("unknown operator {:?}", other))),
                };
                Ok(Expr::Binary(op, Box::new(left?), Box::new(right?)))
            })
            .parse(pair.into_inner())
    }

    fn postfix(&self, pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
        let line = self.line(&pair);
        let mut parts = pair.into_inner();
        let mut expr = self.primary(self.child(&mut parts, line, "an operand")?)?;
        for suffix in parts {
            let line = self.line(&suffix);
            expr = match suffix.as_rule() {
                Rule::attr => {
                    let name = self.child(&mut suffix.into_inner(), line, "an attribute name")?;
                    Expr::Attr(Box::new(expr), name.as_str().to_string())
                }
                Rule::call => Expr::Call(Box::new(expr), self.expressions(suffix)?),
                Rule::index => {
                    let index = self.child(&mut suffix.into_inner(), line, "an index")?;
                    Expr::Index(Box::new(expr), Box::new(self.expression(index)?))
                }
                other => return Err(self.error(line, format!("unexpected {:?}", other))),
            };
        }
        Ok(expr)
    }

    fn expressions(&self, pair: Pair<'_, Rule>) -> Result<Vec<Expr>, ScriptError> {
        pair.into_inner().map(|p| self.expression(p)).collect()
    }

    fn primary(&self, pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
        let line = self.line(&pair);
        match pair.as_rule() {
            Rule::null => Ok(Expr::Null),
            Rule::boolean => Ok(Expr::Bool(pair.as_str() == "true")),
            Rule::int => {
                let digits = pair.as_str().replace('_', "");
                digits
                    .parse()
                    .map(Expr::Int)
                    .map_err(|_| self.error(line, format!("invalid integer '{}'", digits)))
            }
            Rule::float => {
                let digits = pair.as_str().replace('_', "");
                digits
                    .parse()
                    .map(Expr::Float)
                    .map_err(|_| self.error(line, format!("invalid float '{}'", digits)))
            }
            Rule::string => {
                let body = self.child(&mut pair.into_inner(), line, "a string body")?;
                self.template(&unescape(body.as_str()), line)
            }
            Rule::ident => Ok(Expr::Name(pair.as_str().to_string())),
            Rule::list => Ok(Expr::List(self.expressions(pair)?)),
            Rule::dict => {
                let mut entries = Vec::new();
                for entry in pair.into_inner() {
                    let line = self.line(&entry);
                    let mut sides = entry.into_inner();
                    let key = self.expression(self.child(&mut sides, line, "a key")?)?;
                    let value = self.expression(self.child(&mut sides, line, "a value")?)?;
                    entries.push((key, value));
                }
                Ok(Expr::Dict(entries))
            }
            Rule::expression => self.expression(pair),
            other => Err(self.error(line, format!("unexpected {:?}", other))),
        }
    }

    /// Splits `text` into literal and `{expr}` parts. Returns a plain
    /// `Expr::Str` when nothing is interpolated.
    fn template(&self, text: &str, line: usize) -> Result<Expr, ScriptError> {
        let nested = Lower::new(self.origin, line.saturating_sub(1));
        let template = nested.parse(Rule::template, text)?;

        let mut parts = Vec::new();
        let mut literal = String::new();
        for part in template.into_inner() {
            match part.as_rule() {
                Rule::open_brace => literal.push('{'),
                Rule::close_brace => literal.push('}'),
                Rule::text => literal.push_str(part.as_str()),
                Rule::interpolation => {
                    let line = nested.line(&part);
                    let expr = nested.child(&mut part.into_inner(), line, "an expression")?;
                    if !literal.is_empty() {
                        parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(TemplatePart::Expr(nested.expression(expr)?));
                }
                _ => {}
            }
        }

        if parts.is_empty() {
            return Ok(Expr::Str(literal));
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Expr::Template(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(program: &Program) -> &StmtKind {
        &program.statements.first().unwrap().kind
    }

    #[test]
    fn test_parse_function_with_template_body() {
        let program = parse_program("fn fun(a, b) = \"{a}_{b}\"\n", "m").unwrap();
        let StmtKind::Fn(def) = first(&program) else {
            unreachable!("expected fn");
        };
        assert_eq!(def.name, "fun");
        assert_eq!(def.params, vec!["a", "b"]);
        assert_eq!(def.source, "fn fun(a, b) = \"{a}_{b}\"");
        assert!(matches!(&def.body, Expr::Template(parts) if parts.len() == 3));
    }

    #[test]
    fn test_parse_class_with_members() {
        let source = "class Car {\n    wheels = 4\n    fn describe(n) = \"car {n}\"\n}\n";
        let program = parse_program(source, "m").unwrap();
        let StmtKind::Class(class) = first(&program) else {
            unreachable!("expected class");
        };
        assert_eq!(class.name, "Car");
        assert_eq!(class.members.len(), 2);
        assert_eq!(class.members.get(1).unwrap().line, 3);
        assert!(class.source.starts_with("class Car {"));
        assert!(class.source.ends_with('}'));
    }

    #[test]
    fn test_parse_imports() {
        let program = parse_program("import carwash\nfrom car import a, b\nimport x.y as z", "m").unwrap();
        let kinds: Vec<&StmtKind> = program.statements.iter().map(|s| &s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &StmtKind::Import { module: "carwash".into(), alias: None },
                &StmtKind::FromImport { module: "car".into(), names: vec!["a".into(), "b".into()] },
                &StmtKind::Import { module: "x.y".into(), alias: Some("z".into()) },
            ]
        );
    }

    #[test]
    fn test_keyword_prefixed_names_are_identifiers() {
        let program = parse_program("important = 1\nnothing = not important", "m").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(first(&program), StmtKind::Assign { name, .. } if name == "important"));
    }

    #[test]
    fn test_precedence_of_arithmetic() {
        let expr = parse_expr("1 + 2 * 3", "e").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Binary(BinOp::Mul, Box::new(Expr::Int(2)), Box::new(Expr::Int(3))))
            )
        );
    }

    #[test]
    fn test_unary_minus_binds_tighter_than_multiplication() {
        let expr = parse_expr("-2 * 3", "e").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary(BinOp::Mul, left, _) if matches!(*left, Expr::Unary(UnaryOp::Neg, _))
        ));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse_expr("conf.ports[0](1, 2)", "e").unwrap();
        let Expr::Call(callee, args) = expr else {
            unreachable!("expected call");
        };
        assert_eq!(args.len(), 2);
        assert!(matches!(*callee, Expr::Index(..)));
    }

    #[test]
    fn test_conditional_and_dict_literal() {
        let expr = parse_expr("{\"a\": 1} if x else {}", "e").unwrap();
        assert!(matches!(expr, Expr::Conditional { .. }));
    }

    #[test]
    fn test_multiline_list_and_comments() {
        let program = parse_program("# ports\nports = [\n  8000, # web\n  8001,\n]\n", "m").unwrap();
        let StmtKind::Assign { value: Expr::List(items), .. } = first(&program) else {
            unreachable!("expected list assignment");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_escaped_braces_stay_literal() {
        let expr = parse_expr("\"{{literal}}\"", "e").unwrap();
        assert_eq!(expr, Expr::Str("{literal}".into()));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(parse_expr(r#"'q\'x\n'"#, "e").unwrap(), Expr::Str("q'x\n".into()));
    }

    #[test]
    fn test_text_template_keeps_spacing() {
        let expr = parse_text_template("echo {port}  > out", "run").unwrap();
        assert_eq!(
            expr,
            Expr::Template(vec![
                TemplatePart::Literal("echo ".into()),
                TemplatePart::Expr(Expr::Name("port".into())),
                TemplatePart::Literal("  > out".into()),
            ])
        );
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse_program("x = 1\ny = = 2\n", "broken.stm").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 2, .. }), "got {:?}", err);
    }

    #[test]
    fn test_error_inside_a_template_points_at_the_literal() {
        let err = parse_program("a = 1\n\nb = \"{a +}\"\n", "t.stm").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 3, .. }), "got {:?}", err);
    }

    #[test]
    fn test_unterminated_string_is_a_syntax_error() {
        let err = parse_program("x = \"oops", "mod.stm").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 1, .. }));
    }
}
