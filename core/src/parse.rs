//! The parser: source text to the typed syntax tree of [crate::ast]. Built
//! on nom, with a [Parse] impl per node type. Every node is stamped with the
//! [Span] of the source that produced it.

use crate::{
    ast::{
        Annotation, BinaryOp, Block, ClassDecl, CtorBody, CtorDecl, Dispatch,
        DtorDecl, Expr, FieldDecl, FunctionDecl, Item, Literal, Member,
        MethodDecl, Node, Param, PostfixOp, Program, SpanNode, Statement,
        TypeNode, TypeParam, UnaryOp, VarDecl, Visibility,
    },
    error::{CompileError, SourceErrorWrapper, WithSource},
    ty::Primitive,
    util::{RawSpan, Span},
    Compiler,
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{anychar, char, digit1, multispace1},
    combinator::{cut, map, map_res, not, opt, peek, recognize, verify},
    error::{context, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult, Offset, Slice,
};

type ParseResult<'a, T> = IResult<RawSpan<'a>, T, VerboseError<RawSpan<'a>>>;

/// Every keyword of the language. Identifiers are checked against this list,
/// so `class` can never be a variable name.
const KEYWORDS: &[&str] = &[
    "abstract", "bit", "boolean", "char", "class", "constructor", "default",
    "destroy", "destructor", "echo", "else", "extends", "false", "final",
    "float", "for", "function", "if", "int", "long", "measure", "new", "null",
    "override", "private", "protected", "public", "qubit", "reset", "return",
    "static", "string", "super", "this", "true", "virtual", "void", "while",
];

/// A trait for parsing into AST nodes. Any AST node that can be parsed from
/// the source should implement this trait.
trait Parse<'a>: Sized {
    /// Attempt to parse the input into the AST node. Parsers are expected to
    /// be called at a token boundary; surrounding whitespace is handled by
    /// `parse_node`.
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self>;

    /// Attempt to parse the input into the AST node, and include source span
    /// metadata as well. Leading whitespace/comments are skipped and excluded
    /// from the span.
    fn parse_node(input: RawSpan<'a>) -> ParseResult<'a, SpanNode<Self>> {
        let (input, _) = ws0(input)?;
        let new_input = input; // need to copy so we can compare old pos vs new
        let (i, value) = Self::parse(new_input)?;

        let index = input.offset(&i);
        let raw_span = input.slice(..index);

        Ok((i, Node(value, Span::from_raw_span(&raw_span))))
    }
}

// ===== Low-level token helpers =====

/// Parse a line comment, which starts with `//` and runs to the end of the
/// line. The line ending itself is not consumed.
fn line_comment(input: RawSpan<'_>) -> ParseResult<'_, RawSpan<'_>> {
    recognize(pair(tag("//"), opt(is_not("\r\n"))))(input)
}

/// Skip any amount of whitespace and line comments.
fn ws0(input: RawSpan<'_>) -> ParseResult<'_, RawSpan<'_>> {
    recognize(many0(alt((multispace1, line_comment))))(input)
}

/// Is this a character that can continue an identifier?
fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Match a keyword, making sure it isn't just the prefix of a longer
/// identifier.
fn keyword<'a>(
    kw: &'static str,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>> {
    preceded(
        ws0,
        terminated(tag(kw), not(peek(verify(anychar, |c| is_ident_char(*c))))),
    )
}

/// Match a punctuation token, skipping leading whitespace.
fn sym<'a>(
    s: &'static str,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>> {
    preceded(ws0, tag(s))
}

/// An identifier: letter or underscore, then letters/digits/underscores.
/// Keywords are rejected.
fn ident(input: RawSpan<'_>) -> ParseResult<'_, String> {
    map(
        verify(
            recognize(pair(
                verify(anychar, |c| c.is_alphabetic() || *c == '_'),
                many0(verify(anychar, |c| is_ident_char(*c))),
            )),
            |s: &RawSpan| !KEYWORDS.contains(s.fragment()),
        ),
        |s: RawSpan| (*s.fragment()).into(),
    )(input)
}

/// An identifier with a span attached.
fn ident_node(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<String>> {
    let (input, _) = ws0(input)?;
    let start = input;
    let (rest, name) = ident(start)?;
    let index = start.offset(&rest);
    let raw_span = start.slice(..index);
    Ok((rest, Node(name, Span::from_raw_span(&raw_span))))
}

/// Wrap a parser so its result carries the span of the consumed input.
/// Leading whitespace is skipped before the span starts.
fn spanned<'a, T>(
    mut parser: impl FnMut(RawSpan<'a>) -> ParseResult<'a, T>,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, SpanNode<T>> {
    move |input| {
        let (input, _) = ws0(input)?;
        let start = input;
        let (rest, value) = parser(start)?;
        let index = start.offset(&rest);
        let raw_span = start.slice(..index);
        Ok((rest, Node(value, Span::from_raw_span(&raw_span))))
    }
}

// ===== Literals =====

impl<'a> Parse<'a> for Literal {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            // Order matters: float (has a dot) before long (has a suffix)
            // before int
            map_res(
                recognize(tuple((digit1, char('.'), digit1))),
                |s: RawSpan| s.fragment().parse::<f64>().map(Literal::Float),
            ),
            map_res(terminated(digit1, char('L')), |s: RawSpan| {
                s.fragment().parse::<i64>().map(Literal::Long)
            }),
            map_res(digit1, |s: RawSpan| {
                s.fragment().parse::<i32>().map(Literal::Int)
            }),
            map(keyword("true"), |_| Literal::Boolean(true)),
            map(keyword("false"), |_| Literal::Boolean(false)),
            map(string_literal, Literal::Str),
            map(char_literal, Literal::Char),
        ))(input)
    }
}

/// One character inside a string or char literal, with escapes.
fn escaped_char(input: RawSpan<'_>) -> ParseResult<'_, char> {
    alt((
        preceded(
            char('\\'),
            alt((
                map(char('n'), |_| '\n'),
                map(char('t'), |_| '\t'),
                map(char('r'), |_| '\r'),
                map(char('0'), |_| '\0'),
                map(char('\\'), |_| '\\'),
                map(char('\''), |_| '\''),
                map(char('"'), |_| '"'),
            )),
        ),
        verify(anychar, |c| *c != '\\'),
    ))(input)
}

fn string_literal(input: RawSpan<'_>) -> ParseResult<'_, String> {
    delimited(
        char('"'),
        map(many0(verify(escaped_char, |c| *c != '"')), |chars| {
            chars.into_iter().collect()
        }),
        char('"'),
    )(input)
}

fn char_literal(input: RawSpan<'_>) -> ParseResult<'_, char> {
    delimited(char('\''), escaped_char, char('\''))(input)
}

// ===== Types =====

/// Primitive type keywords, excluding void (which is only valid in return
/// position and handled by [TypeNode]).
fn primitive_kw(input: RawSpan<'_>) -> ParseResult<'_, Primitive> {
    alt((
        map(keyword("int"), |_| Primitive::Int),
        map(keyword("long"), |_| Primitive::Long),
        map(keyword("float"), |_| Primitive::Float),
        map(keyword("bit"), |_| Primitive::Bit),
        map(keyword("boolean"), |_| Primitive::Boolean),
        map(keyword("string"), |_| Primitive::Str),
        map(keyword("char"), |_| Primitive::Char),
        map(keyword("qubit"), |_| Primitive::Qubit),
    ))(input)
}

/// The primitive kinds that can appear in a cast.
fn castable_kw(input: RawSpan<'_>) -> ParseResult<'_, Primitive> {
    alt((
        map(keyword("int"), |_| Primitive::Int),
        map(keyword("long"), |_| Primitive::Long),
        map(keyword("float"), |_| Primitive::Float),
        map(keyword("bit"), |_| Primitive::Bit),
    ))(input)
}

/// `<T, U<V>>` — type argument list on a named type.
fn type_args(
    input: RawSpan<'_>,
) -> ParseResult<'_, Vec<SpanNode<TypeNode>>> {
    delimited(
        sym("<"),
        separated_list0(sym(","), TypeNode::parse_node),
        sym(">"),
    )(input)
}

impl<'a> Parse<'a> for TypeNode {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        // Base type, then any number of array suffixes
        let (mut rest, base) = spanned(alt((
            map(keyword("void"), |_| TypeNode::Primitive(Primitive::Void)),
            map(primitive_kw, TypeNode::Primitive),
            map(pair(ident, opt(type_args)), |(name, args)| {
                TypeNode::Named {
                    name,
                    type_args: args.unwrap_or_default(),
                }
            }),
        )))(input)?;

        let mut node = base;
        loop {
            let suffix: ParseResult<'_, Option<SpanNode<Expr>>> = delimited(
                sym("["),
                opt(Expr::parse_node),
                sym("]"),
            )(rest);
            match suffix {
                Ok((i, size)) => {
                    let span = *node.metadata();
                    node = Node(
                        TypeNode::Array {
                            element: Box::new(node),
                            size: size.map(Box::new),
                        },
                        span,
                    );
                    rest = i;
                }
                Err(_) => break,
            }
        }
        Ok((rest, node.0))
    }
}

// ===== Annotations =====

impl<'a> Parse<'a> for Annotation {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, _) = char('@')(input)?;
        let (input, name) = cut(context("annotation name", ident))(input)?;
        match name.as_str() {
            "quantum" => Ok((input, Annotation::Quantum)),
            "tracked" => Ok((input, Annotation::Tracked)),
            "shots" => {
                // @shots requires an integer argument
                let (input, n) = cut(context(
                    "shot count",
                    delimited(
                        sym("("),
                        map_res(preceded(ws0, digit1), |s: RawSpan| {
                            s.fragment().parse::<u64>()
                        }),
                        sym(")"),
                    ),
                ))(input)?;
                Ok((input, Annotation::Shots(n)))
            }
            // Unknown annotations fail at parse
            _ => Err(nom::Err::Failure(VerboseError {
                errors: vec![(
                    input,
                    VerboseErrorKind::Context("known annotation"),
                )],
            })),
        }
    }
}

// ===== Expressions =====

/// Argument list of a call: `(a, b, c)`.
fn call_args(input: RawSpan<'_>) -> ParseResult<'_, Vec<SpanNode<Expr>>> {
    delimited(
        sym("("),
        separated_list0(sym(","), Expr::parse_node),
        context("closing `)`", cut(sym(")"))),
    )(input)
}

/// Primary expressions: everything that doesn't involve an operator.
fn primary(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    alt((
        spanned(map(Literal::parse, Expr::Literal)),
        spanned(map(keyword("null"), |_| Expr::Null)),
        spanned(map(keyword("this"), |_| Expr::This)),
        // measure in expression position binds to a postfix expression
        spanned(map(preceded(keyword("measure"), cut(postfix)), |e| {
            Expr::Measure(Box::new(e))
        })),
        spanned(map(
            preceded(
                keyword("new"),
                cut(context(
                    "class instantiation",
                    tuple((ident_node, opt(type_args), call_args)),
                )),
            ),
            |(class, type_args, args)| Expr::New {
                class,
                type_args: type_args.unwrap_or_default(),
                args,
            },
        )),
        // super.m(...) and super(...)
        spanned(preceded(
            keyword("super"),
            cut(context(
                "super call",
                alt((
                    map(
                        pair(preceded(sym("."), ident_node), call_args),
                        |(method, args)| Expr::SuperCall { method, args },
                    ),
                    map(call_args, |args| Expr::SuperConstructor { args }),
                )),
            )),
        )),
        // Function call before plain variable, so `f(x)` isn't read as `f`
        spanned(map(pair(ident_node, call_args), |(function, args)| {
            Expr::Call { function, args }
        })),
        spanned(map(ident, Expr::Variable)),
        // Array literal
        spanned(map(
            delimited(
                sym("["),
                separated_list0(sym(","), Expr::parse_node),
                sym("]"),
            ),
            Expr::ArrayLiteral,
        )),
        // Parenthesized
        delimited(sym("("), Expr::parse_node, sym(")")),
    ))(input)
}

/// Postfix chains: member access, method calls, indexing, `++`/`--`.
fn postfix(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    let (mut rest, mut node) = primary(input)?;
    loop {
        // `.member` or `.method(args)`
        let member_parse: ParseResult<'_, SpanNode<String>> =
            preceded(sym("."), ident_node)(rest);
        if let Ok((i, member)) = member_parse {
            let args_parse: ParseResult<'_, Vec<SpanNode<Expr>>> =
                call_args(i);
            if let Ok((i2, args)) = args_parse {
                let span = node.metadata().merge(member.1);
                node = Node(
                    Expr::MethodCall {
                        object: Box::new(node),
                        method: member,
                        args,
                    },
                    span,
                );
                rest = i2;
            } else {
                let span = node.metadata().merge(member.1);
                node = Node(
                    Expr::Member {
                        object: Box::new(node),
                        member,
                    },
                    span,
                );
                rest = i;
            }
            continue;
        }
        // `[index]`
        let index_parse: ParseResult<'_, SpanNode<Expr>> =
            delimited(sym("["), Expr::parse_node, sym("]"))(rest);
        if let Ok((i, index)) = index_parse {
            let span = node.metadata().merge(index.1);
            node = Node(
                Expr::Index {
                    array: Box::new(node),
                    index: Box::new(index),
                },
                span,
            );
            rest = i;
            continue;
        }
        // `++` / `--`
        let op_parse: ParseResult<'_, PostfixOp> = preceded(
            ws0,
            alt((
                map(tag("++"), |_| PostfixOp::Inc),
                map(tag("--"), |_| PostfixOp::Dec),
            )),
        )(rest);
        if let Ok((i, op)) = op_parse {
            let span = *node.metadata();
            node = Node(
                Expr::Postfix {
                    op,
                    target: Box::new(node),
                },
                span,
            );
            rest = i;
            continue;
        }
        break;
    }
    Ok((rest, node))
}

/// Casts and unary operators. A cast is only tried for the four castable
/// primitive keywords, so `(x)` still parses as parentheses.
fn unary(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    alt((
        spanned(map(
            pair(
                spanned(delimited(sym("("), preceded(ws0, castable_kw), sym(")"))),
                unary,
            ),
            |(prim, operand)| Expr::Cast {
                ty: prim.map(TypeNode::Primitive),
                expr: Box::new(operand),
            },
        )),
        spanned(map(preceded(sym("!"), unary), |operand| Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        })),
        spanned(map(preceded(sym("-"), unary), |operand| Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(operand),
        })),
        postfix,
    ))(input)
}

/// Build a left-associative binary operator level.
fn binary_level<'a>(
    mut operand: impl FnMut(RawSpan<'a>) -> ParseResult<'a, SpanNode<Expr>>,
    mut op: impl FnMut(RawSpan<'a>) -> ParseResult<'a, BinaryOp>,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, SpanNode<Expr>> {
    move |input| {
        let (mut rest, mut lhs) = operand(input)?;
        while let Ok((i, operator)) = preceded(ws0, &mut op)(rest) {
            let (i2, rhs) = operand(i)?;
            let span = lhs.metadata().merge(rhs.1);
            lhs = Node(
                Expr::Binary {
                    op: operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
            rest = i2;
        }
        Ok((rest, lhs))
    }
}

/// An operator token that must not be followed by any of `excluded` (so `|`
/// isn't confused with `||`, `+` with `+=`, and so on).
fn op_token<'a>(
    token: &'static str,
    excluded: &'static str,
    op: BinaryOp,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, BinaryOp> {
    map(
        terminated(
            tag(token),
            not(peek(verify(anychar, move |c| excluded.contains(*c)))),
        ),
        move |_| op,
    )
}

fn multiplicative(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(
        unary,
        alt((
            op_token("*", "=", BinaryOp::Mul),
            op_token("/", "=/", BinaryOp::Div),
            op_token("%", "=", BinaryOp::Mod),
        )),
    )(input)
}

fn additive(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(
        multiplicative,
        alt((
            op_token("+", "=+", BinaryOp::Add),
            op_token("-", "=-", BinaryOp::Sub),
        )),
    )(input)
}

fn relational(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(
        additive,
        alt((
            map(tag("<="), |_| BinaryOp::Lte),
            map(tag(">="), |_| BinaryOp::Gte),
            map(tag("<"), |_| BinaryOp::Lt),
            map(tag(">"), |_| BinaryOp::Gt),
        )),
    )(input)
}

fn equality(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(
        relational,
        alt((
            map(tag("=="), |_| BinaryOp::Eq),
            map(tag("!="), |_| BinaryOp::Neq),
        )),
    )(input)
}

fn bitand(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(equality, op_token("&", "&=", BinaryOp::BitAnd))(input)
}

fn bitxor(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(bitand, op_token("^", "=", BinaryOp::BitXor))(input)
}

fn bitor(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(bitxor, op_token("|", "|=", BinaryOp::BitOr))(input)
}

fn logical_and(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(bitor, map(tag("&&"), |_| BinaryOp::And))(input)
}

fn logical_or(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    binary_level(logical_and, map(tag("||"), |_| BinaryOp::Or))(input)
}

fn ternary(input: RawSpan<'_>) -> ParseResult<'_, SpanNode<Expr>> {
    let (rest, condition) = logical_or(input)?;
    let question: ParseResult<'_, RawSpan<'_>> = sym("?")(rest);
    match question {
        Ok((i, _)) => {
            let (i, then_expr) = cut(Expr::parse_node)(i)?;
            let (i, _) = cut(context("`:`", sym(":")))(i)?;
            let (i, else_expr) = cut(Expr::parse_node)(i)?;
            let span = condition.metadata().merge(else_expr.1);
            Ok((
                i,
                Node(
                    Expr::Ternary {
                        condition: Box::new(condition),
                        then_expr: Box::new(then_expr),
                        else_expr: Box::new(else_expr),
                    },
                    span,
                ),
            ))
        }
        Err(_) => Ok((rest, condition)),
    }
}

/// The assignment operators, mapped to the underlying binary op for the
/// compound forms.
fn assign_op(input: RawSpan<'_>) -> ParseResult<'_, Option<BinaryOp>> {
    preceded(
        ws0,
        alt((
            map(tag("+="), |_| Some(BinaryOp::Add)),
            map(tag("-="), |_| Some(BinaryOp::Sub)),
            map(tag("*="), |_| Some(BinaryOp::Mul)),
            map(tag("/="), |_| Some(BinaryOp::Div)),
            map(terminated(tag("="), not(peek(char('=')))), |_| None),
        )),
    )(input)
}

impl<'a> Parse<'a> for Expr {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        // Assignment is right-associative and lowest-precedence
        let (rest, target) = ternary(input)?;
        match assign_op(rest) {
            Ok((i, op)) => {
                let (i, value) = cut(Expr::parse_node)(i)?;
                Ok((
                    i,
                    Expr::Assign {
                        target: Box::new(target),
                        op,
                        value: Box::new(value),
                    },
                ))
            }
            Err(_) => Ok((rest, target.0)),
        }
    }
}

// ===== Statements =====

fn semicolon(input: RawSpan<'_>) -> ParseResult<'_, RawSpan<'_>> {
    context("`;`", cut(sym(";")))(input)
}

impl<'a> Parse<'a> for VarDecl {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, annotations) = many0(Annotation::parse_node)(input)?;
        let (input, is_final) = map(opt(keyword("final")), |f| f.is_some())(input)?;
        let (input, ty) = TypeNode::parse_node(input)?;
        let (input, name) = ident_node(input)?;
        let (input, init) =
            opt(preceded(
                preceded(ws0, terminated(tag("="), not(peek(char('='))))),
                Expr::parse_node,
            ))(input)?;
        let (input, _) = sym(";")(input)?;
        Ok((
            input,
            VarDecl {
                annotations,
                is_final,
                ty,
                name,
                init,
            },
        ))
    }
}

impl<'a> Parse<'a> for Block {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, _) = sym("{")(input)?;
        let (input, statements) = many0(Statement::parse_node)(input)?;
        let (input, _) = context("closing `}`", cut(sym("}")))(input)?;
        Ok((input, Block { statements }))
    }
}

/// The pieces of a `for` header that come before the body.
fn for_header(
    input: RawSpan<'_>,
) -> ParseResult<
    '_,
    (
        Option<SpanNode<Statement>>,
        Option<SpanNode<Expr>>,
        Option<SpanNode<Expr>>,
    ),
> {
    let (input, _) = sym("(")(input)?;
    // Initializer: a var declaration, an expression statement, or empty
    let (input, init) = alt((
        map(spanned(map(VarDecl::parse, Statement::VarDecl)), Some),
        map(
            spanned(map(terminated(Expr::parse_node, sym(";")), Statement::Expr)),
            Some,
        ),
        map(sym(";"), |_| None),
    ))(input)?;
    let (input, condition) = opt(Expr::parse_node)(input)?;
    let (input, _) = sym(";")(input)?;
    let (input, update) = opt(Expr::parse_node)(input)?;
    let (input, _) = context("closing `)`", cut(sym(")")))(input)?;
    Ok((input, (init, condition, update)))
}

impl<'a> Parse<'a> for Statement {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            map(Block::parse, Statement::Block),
            // if / else
            map(
                preceded(
                    keyword("if"),
                    cut(context(
                        "if statement",
                        tuple((
                            delimited(sym("("), Expr::parse_node, sym(")")),
                            Statement::parse_node,
                            opt(preceded(
                                keyword("else"),
                                Statement::parse_node,
                            )),
                        )),
                    )),
                ),
                |(condition, then_body, else_body)| Statement::If {
                    condition,
                    then_body: Box::new(then_body),
                    else_body: else_body.map(Box::new),
                },
            ),
            map(
                preceded(
                    keyword("while"),
                    cut(context(
                        "while statement",
                        pair(
                            delimited(sym("("), Expr::parse_node, sym(")")),
                            Statement::parse_node,
                        ),
                    )),
                ),
                |(condition, body)| Statement::While {
                    condition,
                    body: Box::new(body),
                },
            ),
            map(
                preceded(
                    keyword("for"),
                    cut(context(
                        "for statement",
                        pair(for_header, Statement::parse_node),
                    )),
                ),
                |((init, condition, update), body)| Statement::For {
                    init: init.map(Box::new),
                    condition,
                    update,
                    body: Box::new(body),
                },
            ),
            map(
                preceded(
                    keyword("return"),
                    cut(terminated(opt(Expr::parse_node), semicolon)),
                ),
                Statement::Return,
            ),
            map(
                preceded(
                    keyword("echo"),
                    cut(terminated(
                        delimited(sym("("), Expr::parse_node, sym(")")),
                        semicolon,
                    )),
                ),
                Statement::Echo,
            ),
            map(
                preceded(
                    keyword("reset"),
                    cut(terminated(Expr::parse_node, semicolon)),
                ),
                Statement::Reset,
            ),
            map(
                preceded(
                    keyword("destroy"),
                    cut(terminated(Expr::parse_node, semicolon)),
                ),
                Statement::Destroy,
            ),
            // `measure q;` — only a statement when directly followed by `;`,
            // otherwise it's the expression form (e.g. `bit b = measure q;`)
            map(
                preceded(
                    keyword("measure"),
                    terminated(Expr::parse_node, sym(";")),
                ),
                Statement::Measure,
            ),
            map(VarDecl::parse, Statement::VarDecl),
            map(terminated(Expr::parse_node, semicolon), Statement::Expr),
        ))(input)
    }
}

// ===== Items =====

fn visibility(input: RawSpan<'_>) -> ParseResult<'_, Visibility> {
    map(
        opt(alt((
            map(keyword("public"), |_| Visibility::Public),
            map(keyword("private"), |_| Visibility::Private),
            map(keyword("protected"), |_| Visibility::Protected),
        ))),
        |v| v.unwrap_or(Visibility::Public),
    )(input)
}

fn params(input: RawSpan<'_>) -> ParseResult<'_, Vec<SpanNode<Param>>> {
    delimited(
        sym("("),
        separated_list0(
            sym(","),
            spanned(map(
                pair(TypeNode::parse_node, ident_node),
                |(ty, name)| Param { ty, name },
            )),
        ),
        context("closing `)`", cut(sym(")"))),
    )(input)
}

impl<'a> Parse<'a> for FunctionDecl {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, annotations) = many0(Annotation::parse_node)(input)?;
        let (input, _) = keyword("function")(input)?;
        let (input, (name, params, _, return_type, body)) =
            cut(context(
                "function declaration",
                tuple((
                    ident_node,
                    params,
                    sym("->"),
                    TypeNode::parse_node,
                    Block::parse_node,
                )),
            ))(input)?;
        Ok((
            input,
            FunctionDecl {
                annotations,
                name,
                params,
                return_type,
                body,
            },
        ))
    }
}

impl<'a> Parse<'a> for Member {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            // Methods carry the `function` keyword
            map(
                tuple((
                    visibility,
                    opt(alt((
                        map(keyword("virtual"), |_| Dispatch::Virtual),
                        map(keyword("override"), |_| Dispatch::Override),
                    ))),
                    map(opt(keyword("static")), |s| s.is_some()),
                    preceded(
                        keyword("function"),
                        cut(context(
                            "method declaration",
                            tuple((
                                ident_node,
                                params,
                                sym("->"),
                                TypeNode::parse_node,
                                alt((
                                    map(Block::parse_node, Some),
                                    map(sym(";"), |_| None),
                                )),
                            )),
                        )),
                    ),
                )),
                |(vis, dispatch, is_static, (name, params, _, ret, body))| {
                    Member::Method(MethodDecl {
                        visibility: vis,
                        dispatch: dispatch.unwrap_or(Dispatch::Static),
                        is_static,
                        name,
                        params,
                        return_type: ret,
                        body,
                    })
                },
            ),
            // Constructors
            map(
                pair(
                    visibility,
                    preceded(
                        keyword("constructor"),
                        cut(context(
                            "constructor declaration",
                            tuple((
                                params,
                                sym("->"),
                                TypeNode::parse_node,
                                alt((
                                    map(Block::parse_node, CtorBody::Block),
                                    map(
                                        tuple((
                                            sym("="),
                                            keyword("default"),
                                            semicolon,
                                        )),
                                        |_| CtorBody::Default,
                                    ),
                                )),
                            )),
                        )),
                    ),
                ),
                |(vis, (params, _, class_type, body))| {
                    Member::Constructor(CtorDecl {
                        visibility: vis,
                        params,
                        class_type,
                        body,
                    })
                },
            ),
            // Destructors
            map(
                preceded(
                    keyword("destructor"),
                    cut(context(
                        "destructor declaration",
                        preceded(pair(sym("("), sym(")")), Block::parse_node),
                    )),
                ),
                |body| Member::Destructor(DtorDecl { body }),
            ),
            // Fields
            map(
                tuple((
                    many0(Annotation::parse_node),
                    visibility,
                    map(opt(keyword("static")), |s| s.is_some()),
                    map(opt(keyword("final")), |f| f.is_some()),
                    TypeNode::parse_node,
                    ident_node,
                    opt(preceded(
                        preceded(
                            ws0,
                            terminated(tag("="), not(peek(char('=')))),
                        ),
                        Expr::parse_node,
                    )),
                    semicolon,
                )),
                |(annotations, vis, is_static, is_final, ty, name, init, _)| {
                    Member::Field(FieldDecl {
                        annotations,
                        visibility: vis,
                        is_static,
                        is_final,
                        ty,
                        name,
                        init,
                    })
                },
            ),
        ))(input)
    }
}

impl<'a> Parse<'a> for TypeParam {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        map(
            pair(
                ident_node,
                opt(preceded(keyword("extends"), TypeNode::parse_node)),
            ),
            |(name, bound)| TypeParam { name, bound },
        )(input)
    }
}

impl<'a> Parse<'a> for ClassDecl {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, modifiers) = many0(alt((
            map(keyword("static"), |_| "static"),
            map(keyword("abstract"), |_| "abstract"),
        )))(input)?;
        let (input, _) = keyword("class")(input)?;
        let (input, (name, type_params, base, members)) = cut(context(
            "class declaration",
            tuple((
                ident_node,
                map(
                    opt(delimited(
                        sym("<"),
                        separated_list0(sym(","), TypeParam::parse_node),
                        sym(">"),
                    )),
                    Option::unwrap_or_default,
                ),
                opt(preceded(keyword("extends"), ident_node)),
                delimited(
                    sym("{"),
                    many0(Member::parse_node),
                    context("closing `}`", cut(sym("}"))),
                ),
            )),
        ))(input)?;
        Ok((
            input,
            ClassDecl {
                is_static: modifiers.contains(&"static"),
                is_abstract: modifiers.contains(&"abstract"),
                name,
                type_params,
                base,
                members,
            },
        ))
    }
}

impl<'a> Parse<'a> for Item {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        context(
            "declaration",
            alt((
                map(ClassDecl::parse, Item::Class),
                map(FunctionDecl::parse, Item::Function),
            )),
        )(input)
    }
}

impl<'a> Parse<'a> for Program {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        let (input, items) = many0(Item::parse_node)(input)?;
        let (input, _) = ws0(input)?;
        if input.fragment().is_empty() {
            Ok((input, Program { items }))
        } else {
            // Leftover input that doesn't start a declaration. Report the
            // error at that position rather than the program start.
            Err(nom::Err::Failure(VerboseError {
                errors: vec![(
                    input,
                    VerboseErrorKind::Context("declaration"),
                )],
            }))
        }
    }
}

// ===== Entry point =====

/// Parse a full program.
fn parse(
    input: &str,
) -> Result<Program, Vec<SourceErrorWrapper<CompileError>>> {
    match Program::parse(RawSpan::new(input)) {
        Ok((_, program)) => Ok(program),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            // Grab the first error in the chain that is a Context, which
            // means we labelled it ourselves. Everything else is generated by
            // nom, which means it's useless to the user.
            let (raw_span, context) = e
                .errors
                .iter()
                .filter_map(|err| match err {
                    (span, VerboseErrorKind::Context(context)) => {
                        Some((span, context))
                    }
                    _ => None,
                })
                .next()
                // This indicates we're missing a context() call somewhere
                .expect("No context errors available");

            Err(vec![SourceErrorWrapper::new(
                CompileError::Syntax { expected: context },
                // the actual fragment here is just the remaining source, so
                // it's not useful - just use the position from it
                Span::from_position(raw_span),
                input,
            )])
        }
        // only possible in streaming mode
        Err(nom::Err::Incomplete(_needed)) => unreachable!(),
    }
}

impl Compiler<()> {
    /// Parses source code from the given input, into an abstract syntax
    /// tree.
    pub(crate) fn parse(
        self,
    ) -> Result<Compiler<Program>, WithSource<CompileError>> {
        match parse(&self.source) {
            Ok(program) => Ok(Compiler {
                source: self.source,
                ast: program,
            }),
            Err(errors) => Err(WithSource::new(errors, self.source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        match parse(src) {
            Ok(program) => program,
            Err(errors) => panic!(
                "Parse failed: {}",
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        }
    }

    /// Dig the only function out of a program.
    fn only_function(program: &Program) -> &FunctionDecl {
        match program.items.as_slice() {
            [Node(Item::Function(function), _)] => function,
            items => panic!("Expected exactly one function, got {:?}", items),
        }
    }

    #[test]
    fn test_empty_main() {
        let program = parse_ok("function main() -> void {}");
        let function = only_function(&program);
        assert_eq!(*function.name.value(), "main");
        assert!(function.params.is_empty());
        assert_eq!(
            *function.return_type.value(),
            TypeNode::Primitive(Primitive::Void)
        );
        assert!(function.body.value().statements.is_empty());
    }

    #[test]
    fn test_annotations() {
        let program = parse_ok(
            "@shots(8)\nfunction main() -> void { @tracked qubit q; h(q); }",
        );
        let function = only_function(&program);
        assert_eq!(
            *function.annotations[0].value(),
            Annotation::Shots(8)
        );
        match function.body.value().statements[0].value() {
            Statement::VarDecl(decl) => {
                assert_eq!(
                    *decl.annotations[0].value(),
                    Annotation::Tracked
                );
                assert_eq!(
                    *decl.ty.value(),
                    TypeNode::Primitive(Primitive::Qubit)
                );
            }
            other => panic!("Expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_annotation_rejected() {
        assert!(parse("@wibble function main() -> void {}").is_err());
    }

    #[test]
    fn test_measure_expression_vs_statement() {
        let program = parse_ok(
            "function main() -> void {
                qubit q;
                bit b = measure q;
                measure q;
            }",
        );
        let function = only_function(&program);
        let stmts = &function.body.value().statements;
        match stmts[1].value() {
            Statement::VarDecl(decl) => match decl.init.as_ref().unwrap() {
                Node(Expr::Measure(_), _) => {}
                other => panic!("Expected measure expr, got {:?}", other),
            },
            other => panic!("Expected var decl, got {:?}", other),
        }
        assert!(matches!(stmts[2].value(), Statement::Measure(_)));
    }

    #[test]
    fn test_operator_precedence() {
        let program =
            parse_ok("function main() -> void { int x = 1 + 2 * 3; }");
        let function = only_function(&program);
        match function.body.value().statements[0].value() {
            Statement::VarDecl(decl) => {
                match decl.init.as_ref().unwrap().value() {
                    Expr::Binary {
                        op: BinaryOp::Add,
                        rhs,
                        ..
                    } => {
                        assert!(matches!(
                            rhs.value(),
                            Expr::Binary {
                                op: BinaryOp::Mul,
                                ..
                            }
                        ));
                    }
                    other => panic!("Expected +, got {:?}", other),
                }
            }
            other => panic!("Expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_vs_parens() {
        let program = parse_ok(
            "function main() -> void { int x = (int) 1L; int y = (x); }",
        );
        let function = only_function(&program);
        match function.body.value().statements[0].value() {
            Statement::VarDecl(decl) => {
                assert!(matches!(
                    decl.init.as_ref().unwrap().value(),
                    Expr::Cast { .. }
                ));
            }
            other => panic!("Expected var decl, got {:?}", other),
        }
        match function.body.value().statements[1].value() {
            Statement::VarDecl(decl) => {
                assert!(matches!(
                    decl.init.as_ref().unwrap().value(),
                    Expr::Variable(name) if name == "x"
                ));
            }
            other => panic!("Expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_class_with_members() {
        let program = parse_ok(
            "class Counter extends Object {
                private final int start;
                @tracked qubit probe;
                constructor(int start) -> Counter {
                    this.start = start;
                }
                virtual function next() -> int { return this.start; }
                destructor() { echo(\"bye\"); }
            }",
        );
        match program.items[0].value() {
            Item::Class(class) => {
                assert_eq!(*class.name.value(), "Counter");
                assert_eq!(
                    class.base.as_ref().map(|b| b.value().as_str()),
                    Some("Object")
                );
                assert_eq!(class.members.len(), 5);
                assert!(matches!(
                    class.members[0].value(),
                    Member::Field(FieldDecl {
                        visibility: Visibility::Private,
                        is_final: true,
                        ..
                    })
                ));
                assert!(matches!(
                    class.members[2].value(),
                    Member::Constructor(_)
                ));
                assert!(matches!(
                    class.members[3].value(),
                    Member::Method(MethodDecl {
                        dispatch: Dispatch::Virtual,
                        ..
                    })
                ));
                assert!(matches!(
                    class.members[4].value(),
                    Member::Destructor(_)
                ));
            }
            other => panic!("Expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_class_and_new() {
        let program = parse_ok(
            "class Box<T extends Object> {
                public T v;
                constructor(T v) -> Box<T> { this.v = v; }
            }
            function main() -> void {
                Box<Object> b = new Box<Object>(new Object());
            }",
        );
        match program.items[0].value() {
            Item::Class(class) => {
                assert_eq!(class.type_params.len(), 1);
                let param = class.type_params[0].value();
                assert_eq!(*param.name.value(), "T");
                assert!(param.bound.is_some());
            }
            other => panic!("Expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_default_constructor() {
        let program = parse_ok(
            "class Point {
                public int x;
                public int y;
                constructor(int x, int y) -> Point = default;
            }",
        );
        match program.items[0].value() {
            Item::Class(class) => {
                assert!(matches!(
                    class.members[2].value(),
                    Member::Constructor(CtorDecl {
                        body: CtorBody::Default,
                        ..
                    })
                ));
            }
            other => panic!("Expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_fixed_size_array_decl() {
        let program =
            parse_ok("function main() -> void { int[4] regs; regs[0] = 1; }");
        let function = only_function(&program);
        match function.body.value().statements[0].value() {
            Statement::VarDecl(decl) => match decl.ty.value() {
                TypeNode::Array { size, .. } => assert!(size.is_some()),
                other => panic!("Expected array type, got {:?}", other),
            },
            other => panic!("Expected var decl, got {:?}", other),
        }
        assert!(matches!(
            function.body.value().statements[1].value(),
            Statement::Expr(Node(Expr::Assign { .. }, _))
        ));
    }

    #[test]
    fn test_super_forms() {
        let program = parse_ok(
            "class B extends A {
                constructor() -> B {
                    super(1);
                }
                override function f() -> int { return super.f() + 1; }
            }",
        );
        match program.items[0].value() {
            Item::Class(class) => {
                match class.members[0].value() {
                    Member::Constructor(CtorDecl {
                        body: CtorBody::Block(block),
                        ..
                    }) => {
                        assert!(matches!(
                            block.value().statements[0].value(),
                            Statement::Expr(Node(
                                Expr::SuperConstructor { .. },
                                _
                            ))
                        ));
                    }
                    other => panic!("Expected constructor, got {:?}", other),
                }
            }
            other => panic!("Expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_comments() {
        let program = parse_ok(
            "// leading comment
            function main() -> void {
                int x = 1; // trailing comment
            }",
        );
        let function = only_function(&program);
        assert_eq!(function.body.value().statements.len(), 1);
    }

    #[test]
    fn test_spans_point_at_source() {
        let src = "function main() -> void { echo(1); }";
        let program = parse_ok(src);
        let function = only_function(&program);
        let stmt = &function.body.value().statements[0];
        assert_eq!(stmt.metadata().get_source_slice(src), "echo(1);");
    }

    #[test]
    fn test_syntax_error_position() {
        let errors = parse("function main() -> void { if }").unwrap_err();
        assert_eq!(errors.len(), 1);
        // The error must carry a usable line/col
        assert_eq!(errors[0].span().start_line, 1);
    }
}
