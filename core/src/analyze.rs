//! The semantic analyser. Walks the parsed tree against the class registry
//! and either returns normally (the program is valid) or fails with a single
//! error. Establishes the pre-conditions the runtime relies on: every name
//! resolves, every expression has a deducible type, every non-void
//! function/method returns on all paths, every final field is written exactly
//! once per constructor path, and all annotation rules hold.

use crate::{
    ast::{
        Annotation, BinaryOp, Block, ClassDecl, CtorBody, CtorDecl, Expr,
        FunctionDecl, Item, Member, MethodDecl, Program, SpanNode, Statement,
        TypeNode, UnaryOp, VarDecl, Visibility,
    },
    consts::{GATE_NAMES, MAIN_FUNCTION, ROTATION_GATES},
    error::{CompileError, SourceErrorWrapper, WithSource},
    registry::{
        ClassInfo, Errored, Registry, ResolveFailure, TypeParamInfo,
        TypeResolver,
    },
    ty::{Primitive, TypeInfo},
    util::Span,
    Compiler,
};
use std::collections::HashMap;

/// One entry in the symbol table.
#[derive(Clone, Debug)]
struct Symbol {
    ty: TypeInfo,
    is_final: bool,
    is_type_name: bool,
    /// Compile-time constant value, for array-size folding. Only set for
    /// final int/long variables with constant initializers.
    const_int: Option<i64>,
    initialized: bool,
    span: Span,
}

/// What kind of body is being analysed; drives `this`/`super`/final rules.
#[derive(Clone, Debug, PartialEq)]
enum BodyKind {
    Function,
    Method { is_static: bool },
    Constructor,
    Destructor,
    StaticInit,
    InstanceInit,
}

struct Analyzer<'a> {
    registry: &'a Registry,
    scopes: Vec<HashMap<String, Symbol>>,
    /// Class whose member body is being analysed
    current_class: Option<&'a ClassInfo>,
    body_kind: BodyKind,
    return_type: TypeInfo,
}

/// Full-program entry point.
pub(crate) fn check(
    program: &Program,
    registry: &Registry,
) -> Result<(), Errored> {
    let mut analyzer = Analyzer {
        registry,
        scopes: Vec::new(),
        current_class: None,
        body_kind: BodyKind::Function,
        return_type: TypeInfo::primitive(Primitive::Void),
    };
    analyzer.check_program(program)
}

impl<'a> Analyzer<'a> {
    fn check_program(&mut self, program: &Program) -> Result<(), Errored> {
        // The outermost scope holds class names as type references
        let mut globals = HashMap::new();
        for (name, class) in &self.registry.classes {
            globals.insert(
                name.clone(),
                Symbol {
                    ty: TypeInfo::class(name.clone(), Vec::new()),
                    is_final: true,
                    is_type_name: true,
                    const_int: None,
                    initialized: true,
                    span: class.span,
                },
            );
        }
        self.scopes.push(globals);

        // Entry point checks
        let main = self
            .registry
            .main_function()
            .ok_or((CompileError::MissingMain, Span::none()))?;
        if !main.params.is_empty() {
            return Err((
                CompileError::TypeMismatch {
                    expected: "main()".into(),
                    actual: format!("{} parameter(s)", main.params.len()),
                },
                main.span,
            ));
        }
        if !main.return_type.is_void() {
            return Err((
                CompileError::TypeMismatch {
                    expected: "void".into(),
                    actual: main.return_type.to_string(),
                },
                main.span,
            ));
        }

        for item in &program.items {
            match item.value() {
                Item::Function(function) => self.check_function(function)?,
                Item::Class(class) => self.check_class(class)?,
            }
        }
        Ok(())
    }

    // ===== Declarations =====

    fn check_function(
        &mut self,
        function: &FunctionDecl,
    ) -> Result<(), Errored> {
        let name = function.name.value();
        let info = &self.registry.functions[name];

        // Annotation placement
        for annotation in &function.annotations {
            let span = *annotation.metadata();
            match annotation.value() {
                Annotation::Shots(_) if name != MAIN_FUNCTION => {
                    return Err((
                        CompileError::BadAnnotation {
                            detail: "@shots only annotates main",
                        },
                        span,
                    ));
                }
                Annotation::Quantum if name == MAIN_FUNCTION => {
                    return Err((
                        CompileError::BadAnnotation {
                            detail: "@quantum cannot annotate main",
                        },
                        span,
                    ));
                }
                Annotation::Quantum => {
                    // Quantum functions return bit, bit[], or void
                    let ret = &info.return_type;
                    let bit = TypeInfo::primitive(Primitive::Bit);
                    let ok = ret.is_void()
                        || *ret == bit
                        || ret.element() == Some(&bit);
                    if !ok {
                        return Err((
                            CompileError::BadAnnotation {
                                detail:
                                    "@quantum functions must return bit, \
                                     bit[], or void",
                            },
                            span,
                        ));
                    }
                }
                Annotation::Tracked => {
                    return Err((
                        CompileError::BadAnnotation {
                            detail:
                                "@tracked only annotates variables and \
                                 fields",
                        },
                        span,
                    ));
                }
                _ => {}
            }
        }

        self.current_class = None;
        self.body_kind = BodyKind::Function;
        self.return_type = info.return_type.clone();
        self.scopes.push(HashMap::new());
        for (param, ty) in function.params.iter().zip(&info.params) {
            self.declare_param(param.value().name.value(), ty.clone(), *param.metadata())?;
        }
        self.check_block(function.body.value())?;
        self.scopes.pop();

        if !info.return_type.is_void()
            && !block_guarantees_return(function.body.value())
        {
            return Err((
                CompileError::MissingReturn { name: name.clone() },
                *function.name.metadata(),
            ));
        }
        Ok(())
    }

    fn check_class(&mut self, class: &ClassDecl) -> Result<(), Errored> {
        let info = &self.registry.classes[class.name.value()];
        self.current_class = Some(info);

        for (member_index, member) in class.members.iter().enumerate() {
            match member.value() {
                Member::Field(field) => {
                    // Variable-style annotations were already filtered by the
                    // registry; here the initializer expression is typed
                    if let Some(init) = &field.init {
                        let field_info = info
                            .instance_fields
                            .iter()
                            .chain(info.static_fields.iter())
                            .find(|f| f.member_index == member_index)
                            .expect("field missing from registry");
                        self.body_kind = if field.is_static {
                            BodyKind::StaticInit
                        } else {
                            BodyKind::InstanceInit
                        };
                        self.scopes.push(HashMap::new());
                        let actual = self.infer(init)?;
                        self.scopes.pop();
                        self.require_assignable(
                            &field_info.ty,
                            &actual,
                            *init.metadata(),
                        )?;
                        // Qubits are owned by their declaration; they can't
                        // be seeded from another expression
                        if field_info.ty.primitive == Primitive::Qubit {
                            return Err((
                                CompileError::TypeMismatch {
                                    expected: "fresh qubit (no initializer)"
                                        .into(),
                                    actual: actual.to_string(),
                                },
                                *init.metadata(),
                            ));
                        }
                    }
                    // Fixed-size array fields need const sizes
                    self.check_array_sizes(&field.ty)?;
                }
                Member::Method(method) => {
                    self.check_method(info, method, member_index)?;
                }
                Member::Constructor(ctor) => {
                    self.check_constructor(info, ctor, member_index)?;
                }
                Member::Destructor(dtor) => {
                    self.body_kind = BodyKind::Destructor;
                    self.return_type = TypeInfo::primitive(Primitive::Void);
                    self.scopes.push(HashMap::new());
                    self.check_block(dtor.body.value())?;
                    self.scopes.pop();
                }
            }
        }

        self.current_class = None;
        Ok(())
    }

    fn check_method(
        &mut self,
        class: &'a ClassInfo,
        method: &MethodDecl,
        member_index: usize,
    ) -> Result<(), Errored> {
        let info = class
            .methods
            .values()
            .flatten()
            .find(|m| m.member_index == member_index)
            .expect("method missing from registry");
        let body = match &method.body {
            Some(body) => body,
            None => return Ok(()), // abstract
        };

        self.body_kind = BodyKind::Method {
            is_static: info.is_static,
        };
        self.return_type = info.return_type.clone();
        self.scopes.push(HashMap::new());
        for (param, ty) in method.params.iter().zip(&info.params) {
            self.declare_param(
                param.value().name.value(),
                ty.clone(),
                *param.metadata(),
            )?;
        }
        self.check_block(body.value())?;
        self.scopes.pop();

        if !info.return_type.is_void()
            && !block_guarantees_return(body.value())
        {
            return Err((
                CompileError::MissingReturn {
                    name: info.name.clone(),
                },
                info.span,
            ));
        }
        Ok(())
    }

    fn check_constructor(
        &mut self,
        class: &'a ClassInfo,
        ctor: &CtorDecl,
        member_index: usize,
    ) -> Result<(), Errored> {
        let info = class
            .constructors
            .iter()
            .find(|c| c.member_index == member_index)
            .expect("constructor missing from registry");

        match &ctor.body {
            CtorBody::Default => {
                // Each parameter must equal a non-static, non-qubit field of
                // matching type; final fields with initializers can't be
                // bound
                for (param, ty) in ctor.params.iter().zip(&info.params) {
                    let param_name = param.value().name.value();
                    let field = class
                        .instance_fields
                        .iter()
                        .find(|f| &f.name == param_name)
                        .ok_or((
                            CompileError::DefaultConstructorParam {
                                detail: "no matching field",
                            },
                            *param.metadata(),
                        ))?;
                    if field.ty.primitive == Primitive::Qubit {
                        return Err((
                            CompileError::DefaultConstructorParam {
                                detail: "qubit fields cannot be bound",
                            },
                            *param.metadata(),
                        ));
                    }
                    if field.ty != *ty {
                        return Err((
                            CompileError::DefaultConstructorParam {
                                detail: "parameter type differs from field",
                            },
                            *param.metadata(),
                        ));
                    }
                    if field.is_final && field.has_init {
                        return Err((
                            CompileError::DefaultConstructorParam {
                                detail:
                                    "final fields with initializers cannot \
                                     be bound",
                            },
                            *param.metadata(),
                        ));
                    }
                }
                // Every final field without an initializer must be covered
                for field in &class.instance_fields {
                    let bound = ctor
                        .params
                        .iter()
                        .any(|p| p.value().name.value() == &field.name);
                    if field.is_final && !field.has_init && !bound {
                        return Err((
                            CompileError::FinalFieldUnassigned {
                                field: field.name.clone(),
                            },
                            info.span,
                        ));
                    }
                }
                Ok(())
            }
            CtorBody::Block(body) => {
                self.body_kind = BodyKind::Constructor;
                self.return_type = TypeInfo::primitive(Primitive::Void);
                self.scopes.push(HashMap::new());
                for (param, ty) in ctor.params.iter().zip(&info.params) {
                    self.declare_param(
                        param.value().name.value(),
                        ty.clone(),
                        *param.metadata(),
                    )?;
                }

                let statements = &body.value().statements;
                // `super(...)` is only valid as the very first statement
                let mut rest = &statements[..];
                if let Some(first) = statements.first() {
                    if let Statement::Expr(expr) = first.value() {
                        if let Expr::SuperConstructor { args } = expr.value()
                        {
                            self.check_super_constructor(
                                class,
                                args,
                                *expr.metadata(),
                            )?;
                            rest = &statements[1..];
                        }
                    }
                }
                if rest.len() == statements.len() {
                    // No explicit super call: the implicit zero-argument
                    // base constructor must resolve
                    if let Some(base) = &class.base {
                        let base_info = &self.registry.classes[base];
                        self.registry
                            .resolve_constructor(
                                base_info,
                                &[],
                                &HashMap::new(),
                            )
                            .map_err(|_| {
                                (
                                    CompileError::NoMatchingOverload {
                                        name: base.clone(),
                                    },
                                    info.span,
                                )
                            })?;
                    }
                }
                for statement in rest {
                    self.check_statement(statement)?;
                }
                self.scopes.pop();

                // Final-field flow for this class's own final fields
                self.check_final_field_flow(
                    class,
                    &info.param_names,
                    rest,
                    info.span,
                )?;
                Ok(())
            }
        }
    }

    fn check_super_constructor(
        &mut self,
        class: &ClassInfo,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> Result<(), Errored> {
        let base = class.base.as_ref().ok_or((
            CompileError::UnknownMember {
                class: class.name.clone(),
            },
            span,
        ))?;
        let base_info = &self.registry.classes[base];
        let arg_types = args
            .iter()
            .map(|arg| self.infer(arg))
            .collect::<Result<Vec<_>, _>>()?;
        self.registry
            .resolve_constructor(base_info, &arg_types, &HashMap::new())
            .map_err(|failure| {
                let error = match failure {
                    ResolveFailure::Ambiguous => CompileError::AmbiguousCall {
                        name: base.clone(),
                    },
                    _ => CompileError::NoMatchingOverload {
                        name: base.clone(),
                    },
                };
                (error, span)
            })?;
        Ok(())
    }

    /// Enforce the final-field flow rules over a constructor body: a final
    /// field without initializer is assigned exactly once, as a top-level
    /// statement; a final field with initializer is never reassigned.
    fn check_final_field_flow(
        &self,
        class: &ClassInfo,
        param_names: &[String],
        top_level: &[SpanNode<Statement>],
        ctor_span: Span,
    ) -> Result<(), Errored> {
        let finals: Vec<_> = class
            .instance_fields
            .iter()
            .filter(|f| f.is_final)
            .collect();
        if finals.is_empty() {
            return Ok(());
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for statement in top_level {
            if let Statement::Expr(expr) = statement.value() {
                if let Expr::Assign {
                    target,
                    op: None,
                    value,
                } = expr.value()
                {
                    if let Some(name) =
                        own_field_target(target, param_names)
                    {
                        if let Some(field) =
                            finals.iter().find(|f| f.name == name)
                        {
                            if field.has_init {
                                return Err((
                                    CompileError::FinalReassignment,
                                    *expr.metadata(),
                                ));
                            }
                            let count =
                                counts.entry(field.name.as_str()).or_insert(0);
                            *count += 1;
                            if *count > 1 {
                                return Err((
                                    CompileError::FinalReassignment,
                                    *expr.metadata(),
                                ));
                            }
                            // The right-hand side must not smuggle nested
                            // final-field assignments
                            find_final_assignment_in_expr(
                                value,
                                &finals,
                                param_names,
                            )
                            .map_or(Ok(()), |span| {
                                Err((
                                    CompileError::FinalFieldConditionalAssignment,
                                    span,
                                ))
                            })?;
                            continue;
                        }
                    }
                }
            }
            // Any other statement shape: a final-field assignment inside it
            // is not top-level
            if let Some(span) = find_final_assignment_in_statement(
                statement,
                &finals,
                param_names,
            ) {
                return Err((
                    CompileError::FinalFieldConditionalAssignment,
                    span,
                ));
            }
        }

        for field in &finals {
            if !field.has_init
                && counts.get(field.name.as_str()).copied().unwrap_or(0) == 0
            {
                return Err((
                    CompileError::FinalFieldUnassigned {
                        field: field.name.clone(),
                    },
                    ctor_span,
                ));
            }
        }
        Ok(())
    }

    // ===== Statements =====

    fn check_block(&mut self, block: &Block) -> Result<(), Errored> {
        self.scopes.push(HashMap::new());
        for statement in &block.statements {
            self.check_statement(statement)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn check_statement(
        &mut self,
        statement: &SpanNode<Statement>,
    ) -> Result<(), Errored> {
        match statement.value() {
            Statement::Block(block) => self.check_block(block),
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                self.require_condition(condition)?;
                self.check_statement(then_body)?;
                if let Some(else_body) = else_body {
                    self.check_statement(else_body)?;
                }
                Ok(())
            }
            Statement::While { condition, body } => {
                self.require_condition(condition)?;
                self.check_statement(body)
            }
            Statement::For {
                init,
                condition,
                update,
                body,
            } => {
                self.scopes.push(HashMap::new());
                if let Some(init) = init {
                    self.check_statement(init)?;
                }
                if let Some(condition) = condition {
                    self.require_condition(condition)?;
                }
                if let Some(update) = update {
                    self.infer(update)?;
                }
                self.check_statement(body)?;
                self.scopes.pop();
                Ok(())
            }
            Statement::Return(value) => {
                let span = *statement.metadata();
                match (value, self.return_type.is_void()) {
                    (None, true) => Ok(()),
                    (None, false) => Err((
                        CompileError::TypeMismatch {
                            expected: self.return_type.to_string(),
                            actual: "void".into(),
                        },
                        span,
                    )),
                    (Some(value), true) => {
                        let actual = self.infer(value)?;
                        Err((
                            CompileError::TypeMismatch {
                                expected: "void".into(),
                                actual: actual.to_string(),
                            },
                            *value.metadata(),
                        ))
                    }
                    (Some(value), false) => {
                        let actual = self.infer(value)?;
                        let expected = self.return_type.clone();
                        self.require_assignable(
                            &expected,
                            &actual,
                            *value.metadata(),
                        )
                    }
                }
            }
            Statement::Echo(value) => {
                let ty = self.infer(value)?;
                if ty.is_void() {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: "a printable value".into(),
                            actual: ty.to_string(),
                        },
                        *value.metadata(),
                    ));
                }
                Ok(())
            }
            Statement::Reset(target) | Statement::Measure(target) => {
                let ty = self.infer(target)?;
                if ty.primitive != Primitive::Qubit {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: "qubit".into(),
                            actual: ty.to_string(),
                        },
                        *target.metadata(),
                    ));
                }
                Ok(())
            }
            Statement::Destroy(target) => {
                if !is_lvalue(target.value()) {
                    return Err((
                        CompileError::InvalidAssignTarget,
                        *target.metadata(),
                    ));
                }
                let ty = self.infer(target)?;
                if !(ty.is_class_ref() || ty.is_type_param || ty.is_array())
                {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: "a class reference".into(),
                            actual: ty.to_string(),
                        },
                        *target.metadata(),
                    ));
                }
                Ok(())
            }
            Statement::VarDecl(decl) => self.check_var_decl(decl),
            Statement::Expr(expr) => {
                self.infer(expr)?;
                Ok(())
            }
        }
    }

    fn check_var_decl(&mut self, decl: &VarDecl) -> Result<(), Errored> {
        // Tracking is a runtime concern; here only the placement rule
        // matters
        for annotation in &decl.annotations {
            if !matches!(annotation.value(), Annotation::Tracked) {
                return Err((
                    CompileError::BadAnnotation {
                        detail: "only @tracked is valid on a variable",
                    },
                    *annotation.metadata(),
                ));
            }
        }

        let ty = self.resolve_type(&decl.ty)?;
        if ty.is_void() {
            return Err((
                CompileError::TypeMismatch {
                    expected: "non-void type".into(),
                    actual: ty.to_string(),
                },
                *decl.ty.metadata(),
            ));
        }
        self.registry
            .validate_generic_application(&ty, *decl.ty.metadata())?;
        self.check_array_sizes(&decl.ty)?;

        let mut const_int = None;
        if let Some(init) = &decl.init {
            let actual = self.infer(init)?;
            // Qubits are owned by the scope that declares them; they can't
            // be initialized from another expression
            if ty.primitive == Primitive::Qubit {
                return Err((
                    CompileError::TypeMismatch {
                        expected: "fresh qubit (no initializer)".into(),
                        actual: actual.to_string(),
                    },
                    *init.metadata(),
                ));
            }
            if actual.is_null() && !self.registry.is_assignable(&ty, &actual)
            {
                return Err((CompileError::NullMisuse, *init.metadata()));
            }
            self.require_assignable(&ty, &actual, *init.metadata())?;
            if decl.is_final && ty.is_integer() {
                const_int = self.const_int(init);
            }
        }

        let name = decl.name.value().clone();
        let span = *decl.name.metadata();
        let scope = self.scopes.last_mut().expect("no scope");
        if let Some(original) = scope.get(&name) {
            return Err((
                CompileError::DuplicateDeclaration {
                    original: original.span,
                },
                span,
            ));
        }
        let initialized = decl.init.is_some()
            || ty.primitive == Primitive::Qubit
            || ty.is_array();
        scope.insert(
            name,
            Symbol {
                ty,
                is_final: decl.is_final,
                is_type_name: false,
                const_int,
                initialized,
                span,
            },
        );
        Ok(())
    }

    // ===== Expressions =====

    fn infer(&mut self, expr: &SpanNode<Expr>) -> Result<TypeInfo, Errored> {
        let span = *expr.metadata();
        match expr.value() {
            Expr::Literal(literal) => Ok(TypeInfo::primitive(match literal {
                crate::ast::Literal::Int(_) => Primitive::Int,
                crate::ast::Literal::Long(_) => Primitive::Long,
                crate::ast::Literal::Float(_) => Primitive::Float,
                crate::ast::Literal::Boolean(_) => Primitive::Boolean,
                crate::ast::Literal::Str(_) => Primitive::Str,
                crate::ast::Literal::Char(_) => Primitive::Char,
            })),
            Expr::Null => Ok(TypeInfo::primitive(Primitive::Null)),
            Expr::This => self.this_type(span),
            Expr::Variable(name) => {
                if let Some(symbol) = self.lookup(name) {
                    if symbol.is_type_name {
                        // A bare class name is only meaningful as a static
                        // member access receiver, which is handled by the
                        // member/call cases
                        return Err((CompileError::UnknownName, span));
                    }
                    return Ok(symbol.ty.clone());
                }
                // Implicit `this.field` / static field of the enclosing
                // class
                if let Some(class) = self.current_class {
                    if let Some((_, field, is_static)) =
                        self.registry.find_field(&class.name, name)
                    {
                        if !is_static && self.in_static_context() {
                            return Err((
                                CompileError::StaticContext {
                                    what: "this",
                                },
                                span,
                            ));
                        }
                        return Ok(field.ty.clone());
                    }
                }
                Err((CompileError::UnknownName, span))
            }
            Expr::Member { object, member } => {
                let (ty, _, _) = self.member_field(object, member)?;
                Ok(ty)
            }
            Expr::Index { array, index } => {
                let array_ty = self.infer(array)?;
                let index_ty = self.infer(index)?;
                if !index_ty.is_integer() {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: "int or long".into(),
                            actual: index_ty.to_string(),
                        },
                        *index.metadata(),
                    ));
                }
                match array_ty.element() {
                    Some(element) => Ok(element.clone()),
                    None => Err((
                        CompileError::TypeMismatch {
                            expected: "an array".into(),
                            actual: array_ty.to_string(),
                        },
                        *array.metadata(),
                    )),
                }
            }
            Expr::Call { function, args } => self.infer_call(function, args),
            Expr::MethodCall {
                object,
                method,
                args,
            } => self.infer_method_call(object, method, args, span),
            Expr::SuperCall { method, args } => {
                self.infer_super_call(method, args, span)
            }
            Expr::SuperConstructor { .. } => {
                // Only legal as the first statement of a constructor body,
                // which is handled before expressions are reached
                Err((CompileError::SuperNotFirst, span))
            }
            Expr::New {
                class,
                type_args,
                args,
            } => self.infer_new(class, type_args, args),
            Expr::Assign { target, op, value } => {
                self.infer_assign(target, *op, value, span)
            }
            Expr::Unary { op, operand } => {
                let ty = self.infer(operand)?;
                match op {
                    UnaryOp::Not if ty.is_condition() => Ok(ty),
                    UnaryOp::Neg if ty.is_numeric() => {
                        Ok(if ty.primitive == Primitive::Bit {
                            TypeInfo::primitive(Primitive::Int)
                        } else {
                            ty
                        })
                    }
                    _ => Err((
                        CompileError::InvalidOperands {
                            op: match op {
                                UnaryOp::Not => "!".into(),
                                UnaryOp::Neg => "-".into(),
                            },
                            lhs: ty.to_string(),
                            rhs: "".into(),
                        },
                        span,
                    )),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs_ty = self.infer(lhs)?;
                let rhs_ty = self.infer(rhs)?;
                self.binary_result(*op, &lhs_ty, &rhs_ty, span)
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.require_condition(condition)?;
                let then_ty = self.infer(then_expr)?;
                let else_ty = self.infer(else_expr)?;
                if then_ty == else_ty {
                    Ok(then_ty)
                } else if self.registry.is_assignable(&then_ty, &else_ty) {
                    Ok(then_ty)
                } else if self.registry.is_assignable(&else_ty, &then_ty) {
                    Ok(else_ty)
                } else {
                    Err((
                        CompileError::TypeMismatch {
                            expected: then_ty.to_string(),
                            actual: else_ty.to_string(),
                        },
                        *else_expr.metadata(),
                    ))
                }
            }
            Expr::Postfix { target, .. } => {
                // Only variables and fields; array elements don't qualify
                let valid_target = matches!(
                    target.value(),
                    Expr::Variable(_) | Expr::Member { .. }
                );
                if !valid_target {
                    return Err((
                        CompileError::InvalidPostfixTarget,
                        span,
                    ));
                }
                let ty = self.infer(target)?;
                if !ty.is_integer() {
                    return Err((
                        CompileError::InvalidPostfixTarget,
                        span,
                    ));
                }
                self.require_mutable(target)?;
                Ok(ty)
            }
            Expr::Cast { ty, expr: inner } => {
                let source = self.infer(inner)?;
                let target = self.resolve_type(ty)?;
                if source.primitive.is_castable()
                    && target.primitive.is_castable()
                {
                    Ok(target)
                } else {
                    Err((
                        CompileError::InvalidCast {
                            from: source.to_string(),
                            to: target.to_string(),
                        },
                        span,
                    ))
                }
            }
            Expr::Measure(target) => {
                let ty = self.infer(target)?;
                if ty.primitive != Primitive::Qubit {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: "qubit".into(),
                            actual: ty.to_string(),
                        },
                        *target.metadata(),
                    ));
                }
                Ok(TypeInfo::primitive(Primitive::Bit))
            }
            Expr::ArrayLiteral(elements) => {
                let mut element_ty = TypeInfo::unknown();
                for element in elements {
                    let ty = self.infer(element)?;
                    if element_ty.is_unknown() {
                        element_ty = ty;
                    } else if ty != element_ty {
                        return Err((
                            CompileError::TypeMismatch {
                                expected: element_ty.to_string(),
                                actual: ty.to_string(),
                            },
                            *element.metadata(),
                        ));
                    }
                }
                Ok(TypeInfo::array(element_ty))
            }
        }
    }

    fn infer_call(
        &mut self,
        function: &SpanNode<String>,
        args: &[SpanNode<Expr>],
    ) -> Result<TypeInfo, Errored> {
        let name = function.value().as_str();
        let span = *function.metadata();
        let arg_types = args
            .iter()
            .map(|arg| self.infer(arg))
            .collect::<Result<Vec<_>, _>>()?;

        if GATE_NAMES.contains(&name) {
            let expected: Vec<TypeInfo> = if name == "cx" {
                vec![
                    TypeInfo::primitive(Primitive::Qubit),
                    TypeInfo::primitive(Primitive::Qubit),
                ]
            } else if ROTATION_GATES.contains(&name) {
                vec![
                    TypeInfo::primitive(Primitive::Qubit),
                    TypeInfo::primitive(Primitive::Float),
                ]
            } else {
                vec![TypeInfo::primitive(Primitive::Qubit)]
            };
            if arg_types.len() != expected.len() {
                return Err((
                    CompileError::NoMatchingOverload { name: name.into() },
                    span,
                ));
            }
            for ((expected, actual), arg) in
                expected.iter().zip(&arg_types).zip(args)
            {
                if expected != actual {
                    return Err((
                        CompileError::TypeMismatch {
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        },
                        *arg.metadata(),
                    ));
                }
            }
            return Ok(TypeInfo::primitive(Primitive::Void));
        }

        let info = self
            .registry
            .functions
            .get(name)
            .ok_or((CompileError::UnknownName, span))?;
        if info.params.len() != arg_types.len() {
            return Err((
                CompileError::NoMatchingOverload { name: name.into() },
                span,
            ));
        }
        for ((param, actual), arg) in
            info.params.iter().zip(&arg_types).zip(args)
        {
            if !self.registry.is_assignable(param, actual) {
                return Err((
                    CompileError::TypeMismatch {
                        expected: param.to_string(),
                        actual: actual.to_string(),
                    },
                    *arg.metadata(),
                ));
            }
        }
        Ok(info.return_type.clone())
    }

    fn infer_method_call(
        &mut self,
        object: &SpanNode<Expr>,
        method: &SpanNode<String>,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> Result<TypeInfo, Errored> {
        let arg_types = args
            .iter()
            .map(|arg| self.infer(arg))
            .collect::<Result<Vec<_>, _>>()?;

        // Static call through a class name?
        if let Some(class_name) = self.class_name_receiver(object) {
            let resolved = self
                .registry
                .resolve_method_call(
                    &class_name,
                    method.value(),
                    &arg_types,
                    &HashMap::new(),
                )
                .map_err(|failure| {
                    self.resolve_error(
                        failure,
                        &class_name,
                        method.value(),
                        *method.metadata(),
                    )
                })?;
            if !resolved.info.is_static {
                return Err((
                    CompileError::StaticContext {
                        what: "instance method",
                    },
                    span,
                ));
            }
            self.check_member_visibility(
                resolved.info.visibility,
                &resolved.info.defined_in,
                *method.metadata(),
            )?;
            return Ok(resolved.return_type);
        }

        let receiver = self.infer(object)?;
        let dispatch_class = self.dispatch_class_of(&receiver, object)?;
        let subst = self.registry.substitution_for(&receiver);
        let resolved = self
            .registry
            .resolve_method_call(
                &dispatch_class,
                method.value(),
                &arg_types,
                &subst,
            )
            .map_err(|failure| {
                self.resolve_error(
                    failure,
                    &dispatch_class,
                    method.value(),
                    *method.metadata(),
                )
            })?;
        if resolved.info.is_static {
            return Err((
                CompileError::UnknownMember {
                    class: dispatch_class,
                },
                *method.metadata(),
            ));
        }
        self.check_member_visibility(
            resolved.info.visibility,
            &resolved.info.defined_in,
            *method.metadata(),
        )?;
        Ok(resolved.return_type)
    }

    fn infer_super_call(
        &mut self,
        method: &SpanNode<String>,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> Result<TypeInfo, Errored> {
        if self.in_static_context() {
            return Err((CompileError::StaticContext { what: "super" }, span));
        }
        let class = self
            .current_class
            .ok_or((CompileError::StaticContext { what: "super" }, span))?;
        let base = class.base.as_ref().ok_or((
            CompileError::UnknownMember {
                class: class.name.clone(),
            },
            span,
        ))?;
        let arg_types = args
            .iter()
            .map(|arg| self.infer(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let resolved = self
            .registry
            .resolve_method_call(
                base,
                method.value(),
                &arg_types,
                &HashMap::new(),
            )
            .map_err(|failure| {
                self.resolve_error(
                    failure,
                    base,
                    method.value(),
                    *method.metadata(),
                )
            })?;
        self.check_member_visibility(
            resolved.info.visibility,
            &resolved.info.defined_in,
            *method.metadata(),
        )?;
        Ok(resolved.return_type)
    }

    fn infer_new(
        &mut self,
        class: &SpanNode<String>,
        type_args: &[SpanNode<TypeNode>],
        args: &[SpanNode<Expr>],
    ) -> Result<TypeInfo, Errored> {
        let span = *class.metadata();
        let info = self
            .registry
            .class(class.value())
            .ok_or((CompileError::UnknownType, span))?;
        if info.is_static {
            return Err((
                CompileError::StaticInstantiation {
                    class: info.name.clone(),
                },
                span,
            ));
        }
        if info.is_effectively_abstract() {
            let missing = info
                .abstract_methods
                .iter()
                .next()
                .cloned()
                .unwrap_or_else(|| "declared abstract".into());
            return Err((
                CompileError::AbstractInstantiation {
                    class: info.name.clone(),
                    missing,
                },
                span,
            ));
        }
        let resolved_args = type_args
            .iter()
            .map(|arg| self.resolve_type(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let ty = TypeInfo::class(info.name.clone(), resolved_args);
        self.registry.validate_generic_application(&ty, span)?;

        let arg_types = args
            .iter()
            .map(|arg| self.infer(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let subst = self.registry.substitution_for(&ty);
        let resolved = self
            .registry
            .resolve_constructor(info, &arg_types, &subst)
            .map_err(|failure| {
                let error = match failure {
                    ResolveFailure::Ambiguous => CompileError::AmbiguousCall {
                        name: info.name.clone(),
                    },
                    _ => CompileError::NoMatchingOverload {
                        name: info.name.clone(),
                    },
                };
                (error, span)
            })?;
        self.check_member_visibility(
            resolved.info.visibility,
            &info.name,
            span,
        )?;
        Ok(ty)
    }

    fn infer_assign(
        &mut self,
        target: &SpanNode<Expr>,
        op: Option<BinaryOp>,
        value: &SpanNode<Expr>,
        span: Span,
    ) -> Result<TypeInfo, Errored> {
        if !is_lvalue(target.value()) {
            return Err((
                CompileError::InvalidAssignTarget,
                *target.metadata(),
            ));
        }
        let target_ty = self.infer(target)?;
        let value_ty = self.infer(value)?;
        self.require_mutable(target)?;

        // Qubit slots are never assignment targets; they're bound at
        // declaration and only mutated through gates/measure/reset
        if target_ty.primitive == Primitive::Qubit {
            return Err((
                CompileError::TypeMismatch {
                    expected: "a non-qubit assignment target".into(),
                    actual: target_ty.to_string(),
                },
                *target.metadata(),
            ));
        }

        let effective = match op {
            Some(op) => self.binary_result(op, &target_ty, &value_ty, span)?,
            None => value_ty.clone(),
        };
        if value_ty.is_null()
            && op.is_none()
            && !self.registry.is_assignable(&target_ty, &value_ty)
        {
            return Err((CompileError::NullMisuse, *value.metadata()));
        }
        self.require_assignable(&target_ty, &effective, *value.metadata())?;
        Ok(target_ty)
    }

    fn binary_result(
        &self,
        op: BinaryOp,
        lhs: &TypeInfo,
        rhs: &TypeInfo,
        span: Span,
    ) -> Result<TypeInfo, Errored> {
        use BinaryOp::*;
        let invalid = || {
            (
                CompileError::InvalidOperands {
                    op: op.symbol().into(),
                    lhs: lhs.to_string(),
                    rhs: rhs.to_string(),
                },
                span,
            )
        };
        match op {
            Add if lhs.primitive == Primitive::Str
                || rhs.primitive == Primitive::Str =>
            {
                // String concatenation accepts any printable operand
                if lhs.is_void() || rhs.is_void() {
                    Err(invalid())
                } else {
                    Ok(TypeInfo::primitive(Primitive::Str))
                }
            }
            Add | Sub | Mul => {
                let rank = numeric_rank(lhs, rhs).ok_or_else(invalid)?;
                Ok(TypeInfo::primitive(rank))
            }
            Div => {
                // `/` on two integers yields integer; with any float
                // operand it yields float
                let rank = numeric_rank(lhs, rhs).ok_or_else(invalid)?;
                Ok(TypeInfo::primitive(rank))
            }
            Mod => {
                if lhs.is_numeric()
                    && rhs.is_numeric()
                    && numeric_rank(lhs, rhs) != Some(Primitive::Float)
                {
                    Ok(TypeInfo::primitive(
                        numeric_rank(lhs, rhs).expect("checked"),
                    ))
                } else {
                    Err(invalid())
                }
            }
            Lt | Lte | Gt | Gte => {
                if lhs.is_numeric() && rhs.is_numeric() {
                    Ok(TypeInfo::primitive(Primitive::Boolean))
                } else if lhs.primitive == Primitive::Char
                    && rhs.primitive == Primitive::Char
                {
                    Ok(TypeInfo::primitive(Primitive::Boolean))
                } else {
                    Err(invalid())
                }
            }
            Eq | Neq => {
                if lhs.is_array() || rhs.is_array() {
                    return Err((CompileError::ArrayEquality, span));
                }
                let class_like = |t: &TypeInfo| {
                    t.is_class_ref() || t.is_type_param || t.is_null()
                };
                if class_like(lhs) && class_like(rhs) {
                    // Null compares against any class reference; two
                    // references need a subtyping relation
                    if lhs.is_null()
                        || rhs.is_null()
                        || self.registry.is_assignable(lhs, rhs)
                        || self.registry.is_assignable(rhs, lhs)
                    {
                        return Ok(TypeInfo::primitive(Primitive::Boolean));
                    }
                    return Err(invalid());
                }
                if lhs.is_null() || rhs.is_null() {
                    // Null is only comparable with class references
                    return Err((CompileError::NullMisuse, span));
                }
                if lhs.primitive == rhs.primitive
                    || (lhs.is_numeric() && rhs.is_numeric())
                {
                    Ok(TypeInfo::primitive(Primitive::Boolean))
                } else {
                    Err(invalid())
                }
            }
            And | Or => {
                if lhs.is_condition() && rhs.is_condition() {
                    Ok(TypeInfo::primitive(Primitive::Boolean))
                } else {
                    Err(invalid())
                }
            }
            BitAnd | BitOr | BitXor => {
                let bit = TypeInfo::primitive(Primitive::Bit);
                if *lhs == bit && *rhs == bit {
                    Ok(bit)
                } else if lhs.element() == Some(&bit)
                    && rhs.element() == Some(&bit)
                {
                    // bit[] op bit[] yields bit[]; sizes are checked at
                    // runtime
                    Ok(TypeInfo::array(bit))
                } else {
                    Err(invalid())
                }
            }
        }
    }

    // ===== Helpers =====

    fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
    }

    fn in_static_context(&self) -> bool {
        matches!(
            self.body_kind,
            BodyKind::Function
                | BodyKind::StaticInit
                | BodyKind::Method { is_static: true }
        )
    }

    fn this_type(&self, span: Span) -> Result<TypeInfo, Errored> {
        if self.in_static_context() {
            return Err((CompileError::StaticContext { what: "this" }, span));
        }
        let class = self
            .current_class
            .ok_or((CompileError::StaticContext { what: "this" }, span))?;
        let args = class
            .type_params
            .iter()
            .map(|param| match &param.bound {
                Some(bound) => TypeInfo::bounded_type_param(
                    param.name.clone(),
                    bound.clone(),
                ),
                None => TypeInfo::type_param(param.name.clone()),
            })
            .collect();
        Ok(TypeInfo::class(class.name.clone(), args))
    }

    /// If `object` is a bare class name (not shadowed by a local), return
    /// that class name: the receiver of a static member access.
    fn class_name_receiver(&self, object: &SpanNode<Expr>) -> Option<String> {
        if let Expr::Variable(name) = object.value() {
            if let Some(symbol) = self.lookup(name) {
                if symbol.is_type_name {
                    return Some(name.clone());
                }
            }
        }
        None
    }

    /// The class whose hierarchy a member access should search: the
    /// receiver's class, or a type parameter's bound.
    fn dispatch_class_of(
        &self,
        receiver: &TypeInfo,
        object: &SpanNode<Expr>,
    ) -> Result<String, Errored> {
        let span = *object.metadata();
        if receiver.is_type_param {
            return receiver
                .param_bound()
                .and_then(|bound| bound.class_name.clone())
                .ok_or((
                    CompileError::TypeMismatch {
                        expected: "a bounded type parameter".into(),
                        actual: receiver.to_string(),
                    },
                    span,
                ));
        }
        if receiver.is_class_ref() {
            return Ok(receiver
                .class_name
                .clone()
                .expect("class ref without name"));
        }
        Err((
            CompileError::TypeMismatch {
                expected: "a class reference".into(),
                actual: receiver.to_string(),
            },
            span,
        ))
    }

    /// Type a `object.member` field access; returns (type, declaring class,
    /// is_static).
    fn member_field(
        &mut self,
        object: &SpanNode<Expr>,
        member: &SpanNode<String>,
    ) -> Result<(TypeInfo, String, bool), Errored> {
        let member_span = *member.metadata();

        if let Some(class_name) = self.class_name_receiver(object) {
            let (declaring, field, is_static) = self
                .registry
                .find_field(&class_name, member.value())
                .ok_or((
                    CompileError::UnknownMember {
                        class: class_name.clone(),
                    },
                    member_span,
                ))?;
            if !is_static {
                return Err((
                    CompileError::StaticContext {
                        what: "instance field",
                    },
                    member_span,
                ));
            }
            let declaring = declaring.name.clone();
            let ty = field.ty.clone();
            let visibility = field.visibility;
            self.check_member_visibility(visibility, &declaring, member_span)?;
            return Ok((ty, declaring, true));
        }

        let receiver = self.infer(object)?;
        let class_name = self.dispatch_class_of(&receiver, object)?;
        let (declaring, field, is_static) = self
            .registry
            .find_field(&class_name, member.value())
            .ok_or((
                CompileError::UnknownMember {
                    class: class_name.clone(),
                },
                member_span,
            ))?;
        if is_static {
            return Err((
                CompileError::UnknownMember { class: class_name },
                member_span,
            ));
        }
        let declaring = declaring.name.clone();
        let visibility = field.visibility;
        let subst = self.registry.substitution_for(&receiver);
        let ty = crate::registry::substitute(&field.ty, &subst);
        self.check_member_visibility(visibility, &declaring, member_span)?;
        Ok((ty, declaring, false))
    }

    fn check_member_visibility(
        &self,
        visibility: Visibility,
        declaring: &str,
        span: Span,
    ) -> Result<(), Errored> {
        let ok = match visibility {
            Visibility::Public => true,
            Visibility::Private => self
                .current_class
                .map(|c| c.name == declaring)
                .unwrap_or(false),
            Visibility::Protected => self
                .current_class
                .map(|c| {
                    c.name == declaring
                        || self.registry.is_subclass(&c.name, declaring)
                })
                .unwrap_or(false),
        };
        if ok {
            Ok(())
        } else {
            Err((
                CompileError::VisibilityViolation {
                    class: declaring.into(),
                },
                span,
            ))
        }
    }

    /// Reject writes to finals. Assignment counting for final fields
    /// without initializers happens in the constructor flow pass; here only
    /// the immediately-wrong cases error.
    fn require_mutable(
        &mut self,
        target: &SpanNode<Expr>,
    ) -> Result<(), Errored> {
        let span = *target.metadata();
        match target.value() {
            Expr::Variable(name) => {
                // Local?
                let local = self
                    .scopes
                    .iter_mut()
                    .rev()
                    .find_map(|scope| scope.get_mut(name));
                if let Some(symbol) = local {
                    if symbol.is_type_name {
                        return Err((
                            CompileError::InvalidAssignTarget,
                            span,
                        ));
                    }
                    if symbol.is_final && symbol.initialized {
                        return Err((CompileError::FinalReassignment, span));
                    }
                    symbol.initialized = true;
                    return Ok(());
                }
                // Implicit field of the current class
                self.require_field_mutable(name, span)
            }
            Expr::Member { object, member } => {
                // Only `this.field` participates in final-field flow;
                // any other receiver can't touch a final field at all
                let class = self.current_class.map(|c| c.name.clone());
                let is_this = matches!(object.value(), Expr::This);
                if is_this {
                    if class.is_some() {
                        return self
                            .require_field_mutable(member.value(), span);
                    }
                    return Ok(());
                }
                // Re-resolve the field to check finality
                let (_, declaring, _) = self.member_field(object, member)?;
                let field = self
                    .registry
                    .find_field(&declaring, member.value())
                    .map(|(_, f, _)| f);
                if let Some(field) = field {
                    if field.is_final {
                        return Err((CompileError::FinalReassignment, span));
                    }
                }
                Ok(())
            }
            // Array elements are always mutable slots
            Expr::Index { .. } => Ok(()),
            _ => Ok(()),
        }
    }

    fn require_field_mutable(
        &self,
        name: &str,
        span: Span,
    ) -> Result<(), Errored> {
        let class = match self.current_class {
            Some(class) => class,
            None => return Ok(()),
        };
        if let Some((declaring, field, _)) =
            self.registry.find_field(&class.name, name)
        {
            if field.is_final {
                let own_ctor = self.body_kind == BodyKind::Constructor
                    && declaring.name == class.name;
                if field.has_init || !own_ctor {
                    return Err((CompileError::FinalReassignment, span));
                }
                // No-initializer final assigned in its own constructor:
                // counted by the flow pass
            }
        }
        Ok(())
    }

    fn require_condition(
        &mut self,
        condition: &SpanNode<Expr>,
    ) -> Result<(), Errored> {
        let ty = self.infer(condition)?;
        if ty.is_condition() {
            Ok(())
        } else {
            Err((
                CompileError::InvalidCondition {
                    actual: ty.to_string(),
                },
                *condition.metadata(),
            ))
        }
    }

    fn require_assignable(
        &self,
        expected: &TypeInfo,
        actual: &TypeInfo,
        span: Span,
    ) -> Result<(), Errored> {
        if self.registry.is_assignable(expected, actual) {
            Ok(())
        } else {
            Err((
                CompileError::TypeMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                },
                span,
            ))
        }
    }

    fn resolve_type(
        &self,
        node: &SpanNode<TypeNode>,
    ) -> Result<TypeInfo, Errored> {
        let arity: HashMap<String, usize> = self
            .registry
            .classes
            .iter()
            .map(|(name, class)| (name.clone(), class.type_params.len()))
            .collect();
        let empty: Vec<TypeParamInfo> = Vec::new();
        let params = self
            .current_class
            .map(|class| &class.type_params)
            .unwrap_or(&empty);
        TypeResolver::new(&arity, params).resolve(node)
    }

    fn declare_param(
        &mut self,
        name: &str,
        ty: TypeInfo,
        span: Span,
    ) -> Result<(), Errored> {
        let scope = self.scopes.last_mut().expect("no scope");
        if let Some(original) = scope.get(name) {
            return Err((
                CompileError::DuplicateDeclaration {
                    original: original.span,
                },
                span,
            ));
        }
        scope.insert(
            name.into(),
            Symbol {
                ty,
                is_final: false,
                is_type_name: false,
                const_int: None,
                initialized: true,
                span,
            },
        );
        Ok(())
    }

    /// Fold a compile-time constant integer: literals, final int variables
    /// with known values, and arithmetic over those.
    fn const_int(&self, expr: &SpanNode<Expr>) -> Option<i64> {
        match expr.value() {
            Expr::Literal(crate::ast::Literal::Int(v)) => Some(*v as i64),
            Expr::Literal(crate::ast::Literal::Long(v)) => Some(*v),
            Expr::Variable(name) => {
                let symbol = self.lookup(name)?;
                if symbol.is_final {
                    symbol.const_int
                } else {
                    None
                }
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => self.const_int(operand).map(|v| -v),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.const_int(lhs)?;
                let rhs = self.const_int(rhs)?;
                match op {
                    BinaryOp::Add => lhs.checked_add(rhs),
                    BinaryOp::Sub => lhs.checked_sub(rhs),
                    BinaryOp::Mul => lhs.checked_mul(rhs),
                    BinaryOp::Div if rhs != 0 => Some(lhs / rhs),
                    BinaryOp::Mod if rhs != 0 => Some(lhs % rhs),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Every fixed-size array dimension in a declared type must be a
    /// compile-time const-int.
    fn check_array_sizes(
        &self,
        node: &SpanNode<TypeNode>,
    ) -> Result<(), Errored> {
        match node.value() {
            TypeNode::Array { element, size } => {
                if let Some(size) = size {
                    if self.const_int(size).is_none() {
                        return Err((
                            CompileError::NonConstArraySize,
                            *size.metadata(),
                        ));
                    }
                }
                self.check_array_sizes(element)
            }
            TypeNode::Named { type_args, .. } => {
                for arg in type_args {
                    self.check_array_sizes(arg)?;
                }
                Ok(())
            }
            TypeNode::Primitive(_) => Ok(()),
        }
    }

    fn resolve_error(
        &self,
        failure: ResolveFailure,
        class: &str,
        method: &str,
        span: Span,
    ) -> Errored {
        let error = match failure {
            ResolveFailure::UnknownName => CompileError::UnknownMember {
                class: class.into(),
            },
            ResolveFailure::NoMatch => CompileError::NoMatchingOverload {
                name: method.into(),
            },
            ResolveFailure::Ambiguous => CompileError::AmbiguousCall {
                name: method.into(),
            },
        };
        (error, span)
    }
}

// ===== Free helpers =====

/// Can this expression be the target of an assignment?
fn is_lvalue(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Variable(_) | Expr::Member { .. } | Expr::Index { .. }
    )
}

/// `x` or `this.x` targets, for final-field flow. A bare name that matches a
/// constructor parameter refers to the parameter, not the field.
fn own_field_target<'e>(
    target: &'e SpanNode<Expr>,
    param_names: &[String],
) -> Option<&'e str> {
    match target.value() {
        Expr::Variable(name) => {
            if param_names.iter().any(|p| p == name) {
                None
            } else {
                Some(name)
            }
        }
        Expr::Member { object, member } => {
            if matches!(object.value(), Expr::This) {
                Some(member.value())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Does this block guarantee a return on every path?
fn block_guarantees_return(block: &Block) -> bool {
    block
        .statements
        .iter()
        .any(|statement| statement_guarantees_return(statement.value()))
}

fn statement_guarantees_return(statement: &Statement) -> bool {
    match statement {
        Statement::Return(_) => true,
        Statement::Block(block) => block_guarantees_return(block),
        Statement::If {
            then_body,
            else_body: Some(else_body),
            ..
        } => {
            statement_guarantees_return(then_body.value())
                && statement_guarantees_return(else_body.value())
        }
        _ => false,
    }
}

/// Search a statement subtree for an assignment to one of the given final
/// fields. Returns the span of the first hit.
fn find_final_assignment_in_statement(
    statement: &SpanNode<Statement>,
    finals: &[&crate::registry::FieldInfo],
    param_names: &[String],
) -> Option<Span> {
    let in_stmt = |s: &SpanNode<Statement>| {
        find_final_assignment_in_statement(s, finals, param_names)
    };
    let in_expr = |e: &SpanNode<Expr>| {
        find_final_assignment_in_expr(e, finals, param_names)
    };
    match statement.value() {
        Statement::Block(block) => {
            block.statements.iter().find_map(in_stmt)
        }
        Statement::If {
            condition,
            then_body,
            else_body,
        } => in_expr(condition)
            .or_else(|| in_stmt(then_body))
            .or_else(|| else_body.as_deref().and_then(in_stmt)),
        Statement::While { condition, body } => {
            in_expr(condition).or_else(|| in_stmt(body))
        }
        Statement::For {
            init,
            condition,
            update,
            body,
        } => init
            .as_deref()
            .and_then(in_stmt)
            .or_else(|| condition.as_ref().and_then(in_expr))
            .or_else(|| update.as_ref().and_then(in_expr))
            .or_else(|| in_stmt(body)),
        Statement::Return(value) => value.as_ref().and_then(in_expr),
        Statement::Echo(e)
        | Statement::Reset(e)
        | Statement::Measure(e)
        | Statement::Destroy(e) => in_expr(e),
        Statement::VarDecl(decl) => decl.init.as_ref().and_then(in_expr),
        Statement::Expr(e) => in_expr(e),
    }
}

fn find_final_assignment_in_expr(
    expr: &SpanNode<Expr>,
    finals: &[&crate::registry::FieldInfo],
    param_names: &[String],
) -> Option<Span> {
    let recurse = |e: &SpanNode<Expr>| {
        find_final_assignment_in_expr(e, finals, param_names)
    };
    match expr.value() {
        Expr::Assign { target, value, .. } => {
            if let Some(name) = own_field_target(target, param_names) {
                if finals.iter().any(|f| f.name == name) {
                    return Some(*expr.metadata());
                }
            }
            recurse(target).or_else(|| recurse(value))
        }
        Expr::Unary { operand, .. } => recurse(operand),
        Expr::Binary { lhs, rhs, .. } => recurse(lhs).or_else(|| recurse(rhs)),
        Expr::Ternary {
            condition,
            then_expr,
            else_expr,
        } => recurse(condition)
            .or_else(|| recurse(then_expr))
            .or_else(|| recurse(else_expr)),
        Expr::Member { object, .. } => recurse(object),
        Expr::Index { array, index } => {
            recurse(array).or_else(|| recurse(index))
        }
        Expr::Call { args, .. }
        | Expr::SuperCall { args, .. }
        | Expr::SuperConstructor { args } => args.iter().find_map(recurse),
        Expr::MethodCall { object, args, .. } => {
            recurse(object).or_else(|| args.iter().find_map(recurse))
        }
        Expr::New { args, .. } => args.iter().find_map(recurse),
        Expr::Postfix { target, .. } => recurse(target),
        Expr::Cast { expr: inner, .. } => recurse(inner),
        Expr::Measure(inner) => recurse(inner),
        Expr::ArrayLiteral(elements) => elements.iter().find_map(recurse),
        _ => None,
    }
}

/// Arithmetic promotion by rank: int < long < float, with bit promoting to
/// int. Returns `None` if either side isn't numeric.
fn numeric_rank(lhs: &TypeInfo, rhs: &TypeInfo) -> Option<Primitive> {
    let rank = |t: &TypeInfo| t.primitive.rank();
    let (l, r) = (rank(lhs)?, rank(rhs)?);
    Some(match l.max(r) {
        0 => Primitive::Int,
        1 => Primitive::Long,
        _ => Primitive::Float,
    })
}

impl Compiler<Program> {
    /// Run semantic analysis: build the class registry, then check every
    /// declaration and body. On success, the checked program can allocate a
    /// machine.
    pub(crate) fn analyze(
        self,
    ) -> Result<Compiler<crate::CheckedProgram>, WithSource<CompileError>>
    {
        let build = Registry::build(&self.ast)
            .and_then(|registry| {
                check(&self.ast, &registry).map(|()| registry)
            });
        match build {
            Ok(registry) => Ok(Compiler {
                source: self.source,
                ast: crate::CheckedProgram {
                    program: self.ast,
                    registry,
                },
            }),
            Err((error, span)) => {
                let wrapper =
                    SourceErrorWrapper::new(error, span, &self.source);
                Err(WithSource::new(Some(wrapper), self.source))
            }
        }
    }
}
