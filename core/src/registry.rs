//! The class registry: compile-time metadata for every class in the program,
//! built once before semantic analysis. Holds fields, method overload sets,
//! constructors, type parameters, and the abstract-method bookkeeping, and
//! answers the type questions that need the hierarchy: assignability,
//! conversion cost, overload resolution, and generic substitution.

use crate::{
    ast::{
        Annotation, ClassDecl, CtorDecl, Dispatch, FieldDecl, FunctionDecl,
        Item, Member, MethodDecl, Program, SpanNode, TypeNode, Visibility,
    },
    consts::{GATE_NAMES, MAIN_FUNCTION, OBJECT_CLASS},
    error::CompileError,
    ty::{Primitive, TypeInfo},
    util::Span,
};
use std::collections::{HashMap, HashSet};

/// The error-with-location pair used internally by compilation stages, before
/// it gets wrapped with source context.
pub(crate) type Errored = (CompileError, Span);

/// A generic type parameter and its resolved bound.
#[derive(Clone, Debug)]
pub(crate) struct TypeParamInfo {
    pub name: String,
    pub bound: Option<TypeInfo>,
}

/// Compile-time record of a field declaration.
#[derive(Clone, Debug)]
pub(crate) struct FieldInfo {
    pub name: String,
    pub visibility: Visibility,
    pub is_final: bool,
    pub is_tracked: bool,
    pub ty: TypeInfo,
    pub has_init: bool,
    /// Index into the declaring class's member list (for the initializer)
    pub member_index: usize,
    pub span: Span,
}

/// Compile-time record of a method declaration.
#[derive(Clone, Debug)]
pub(crate) struct MethodInfo {
    pub name: String,
    pub visibility: Visibility,
    pub dispatch: Dispatch,
    pub is_static: bool,
    pub params: Vec<TypeInfo>,
    pub param_names: Vec<String>,
    pub return_type: TypeInfo,
    pub has_body: bool,
    pub member_index: usize,
    /// Name of the class that declared this method
    pub defined_in: String,
    pub span: Span,
}

impl MethodInfo {
    /// Does this method participate in dynamic dispatch?
    pub fn is_virtual(&self) -> bool {
        matches!(self.dispatch, Dispatch::Virtual | Dispatch::Override)
    }

    /// The signature key used for override matching, duplicate detection,
    /// and vtable slot assignment: name plus parameter types.
    pub fn signature(&self) -> String {
        signature_key(&self.name, &self.params)
    }
}

/// Compile-time record of a constructor.
#[derive(Clone, Debug)]
pub(crate) struct CtorInfo {
    pub visibility: Visibility,
    pub params: Vec<TypeInfo>,
    pub param_names: Vec<String>,
    pub member_index: usize,
    pub span: Span,
}

/// Compile-time record of one class.
#[derive(Clone, Debug)]
pub(crate) struct ClassInfo {
    pub name: String,
    pub base: Option<String>,
    pub is_static: bool,
    /// Declared abstract. A class is *effectively* abstract when this is set
    /// or when it has unimplemented abstract methods.
    pub is_abstract: bool,
    pub type_params: Vec<TypeParamInfo>,
    /// Instance fields declared by this class (not inherited ones)
    pub instance_fields: Vec<FieldInfo>,
    pub static_fields: Vec<FieldInfo>,
    /// Overload sets, keyed by method name
    pub methods: HashMap<String, Vec<MethodInfo>>,
    pub constructors: Vec<CtorInfo>,
    /// Member index of the destructor, if the class declares one
    pub destructor: Option<usize>,
    /// Signatures that remain abstract at this level (inherited ones minus
    /// concrete implementations, plus this class's own bodyless virtuals)
    pub abstract_methods: HashSet<String>,
    /// All signatures declared directly in this class (duplicate detection)
    pub declared_signatures: HashSet<String>,
    /// Index of the class declaration in the program's item list. `None`
    /// for the injected Object root.
    pub item_index: Option<usize>,
    pub span: Span,
}

impl ClassInfo {
    pub fn is_effectively_abstract(&self) -> bool {
        self.is_abstract || !self.abstract_methods.is_empty()
    }

    /// Does this class declare a tracked field (its own, not inherited)?
    pub fn has_own_tracked_fields(&self) -> bool {
        self.instance_fields.iter().any(|f| f.is_tracked)
    }
}

/// Compile-time record of a free function.
#[derive(Clone, Debug)]
pub(crate) struct FunctionInfo {
    pub name: String,
    pub params: Vec<TypeInfo>,
    pub param_names: Vec<String>,
    pub return_type: TypeInfo,
    pub shots: Option<u64>,
    pub item_index: usize,
    pub span: Span,
}

/// The registry itself: every class and free function in the program, in
/// declaration order.
#[derive(Clone, Debug)]
pub(crate) struct Registry {
    pub classes: HashMap<String, ClassInfo>,
    /// Class names in a base-before-derived order, used for deterministic
    /// static initialization and runtime table construction
    pub order: Vec<String>,
    pub functions: HashMap<String, FunctionInfo>,
}

/// Render a signature key: `name(type,type)`.
pub(crate) fn signature_key(name: &str, params: &[TypeInfo]) -> String {
    let params: Vec<String> = params.iter().map(TypeInfo::to_string).collect();
    format!("{}({})", name, params.join(","))
}

// ===== Type resolution =====

/// Resolves [TypeNode]s from the AST into [TypeInfo]s, against a known set
/// of class names and the type parameters in scope.
pub(crate) struct TypeResolver<'a> {
    /// Class name -> number of type parameters
    arity: &'a HashMap<String, usize>,
    type_params: &'a [TypeParamInfo],
}

impl<'a> TypeResolver<'a> {
    pub fn new(
        arity: &'a HashMap<String, usize>,
        type_params: &'a [TypeParamInfo],
    ) -> Self {
        Self { arity, type_params }
    }

    pub fn resolve(
        &self,
        node: &SpanNode<TypeNode>,
    ) -> Result<TypeInfo, Errored> {
        let span = *node.metadata();
        match node.value() {
            TypeNode::Primitive(primitive) => {
                Ok(TypeInfo::primitive(*primitive))
            }
            TypeNode::Named { name, type_args } => {
                // Type parameters shadow class names
                if let Some(param) =
                    self.type_params.iter().find(|p| &p.name == name)
                {
                    if !type_args.is_empty() {
                        return Err((
                            CompileError::GenericArity {
                                class: name.clone(),
                                expected: 0,
                                actual: type_args.len(),
                            },
                            span,
                        ));
                    }
                    return Ok(match &param.bound {
                        Some(bound) => TypeInfo::bounded_type_param(
                            name.clone(),
                            bound.clone(),
                        ),
                        None => TypeInfo::type_param(name.clone()),
                    });
                }
                let expected = *self
                    .arity
                    .get(name)
                    .ok_or((CompileError::UnknownType, span))?;
                if type_args.len() != expected {
                    return Err((
                        CompileError::GenericArity {
                            class: name.clone(),
                            expected,
                            actual: type_args.len(),
                        },
                        span,
                    ));
                }
                let args = type_args
                    .iter()
                    .map(|arg| self.resolve(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TypeInfo::class(name.clone(), args))
            }
            TypeNode::Array { element, size: _ } => {
                // The size expression is checked by the analyser; here only
                // the element type matters
                let element = self.resolve(element)?;
                Ok(TypeInfo::array(element))
            }
        }
    }
}

// ===== Registry construction =====

/// Extract the flags this stage cares about from an annotation list.
fn annotation_flags(
    annotations: &[SpanNode<Annotation>],
) -> (bool, Option<u64>, bool) {
    let mut quantum = false;
    let mut shots = None;
    let mut tracked = false;
    for node in annotations {
        match node.value() {
            Annotation::Quantum => quantum = true,
            Annotation::Shots(n) => shots = Some(*n),
            Annotation::Tracked => tracked = true,
        }
    }
    (quantum, shots, tracked)
}

impl Registry {
    /// Build the registry from a parsed program. Performs all class-level
    /// validation: duplicate/unknown names, inheritance cycles, Object
    /// rules, static-class rules, constructor/destructor counts, override
    /// and abstractness checks. Body-level checks are the analyser's job.
    pub fn build(program: &Program) -> Result<Self, Errored> {
        // Pass 1: class names and generic arity, so types can be resolved
        // before the full records exist
        let mut arity: HashMap<String, usize> = HashMap::new();
        let mut spans: HashMap<String, Span> = HashMap::new();
        for item in &program.items {
            if let Item::Class(class) = item.value() {
                let name = class.name.value().clone();
                if let Some(original) = spans.get(&name) {
                    return Err((
                        CompileError::DuplicateDeclaration {
                            original: *original,
                        },
                        *class.name.metadata(),
                    ));
                }
                spans.insert(name.clone(), *class.name.metadata());
                arity.insert(name, class.type_params.len());
            }
        }
        // The implicit root
        arity.entry(OBJECT_CLASS.into()).or_insert(0);

        // Pass 2: build per-class records
        let mut classes: HashMap<String, ClassInfo> = HashMap::new();
        let mut declared_order: Vec<String> = Vec::new();
        if !spans.contains_key(OBJECT_CLASS) {
            classes.insert(OBJECT_CLASS.into(), ClassInfo::object_root());
            declared_order.push(OBJECT_CLASS.into());
        }
        for (index, item) in program.items.iter().enumerate() {
            if let Item::Class(class) = item.value() {
                let info = ClassInfo::from_decl(class, index, &arity)?;
                declared_order.push(info.name.clone());
                classes.insert(info.name.clone(), info);
            }
        }

        // Pass 3: base links and cycle detection
        for name in &declared_order {
            let class = &classes[name];
            if let Some(base) = &class.base {
                if !classes.contains_key(base) {
                    return Err((
                        CompileError::UnknownBaseClass,
                        class.span,
                    ));
                }
            }
        }
        for name in &declared_order {
            let mut seen = HashSet::new();
            let mut current = Some(name.clone());
            while let Some(class_name) = current {
                if !seen.insert(class_name.clone()) {
                    return Err((
                        CompileError::InheritanceCycle,
                        classes[name].span,
                    ));
                }
                current = classes[&class_name].base.clone();
            }
        }

        // Base-before-derived order for abstract propagation and later for
        // runtime table construction
        let order = topo_order(&declared_order, &classes);

        let mut registry = Self {
            classes,
            order,
            functions: HashMap::new(),
        };

        // Pass 4: propagate abstract sets and validate overrides, walking
        // base-first so each base is finished before its subclasses
        for name in registry.order.clone() {
            registry.validate_class_methods(&name)?;
        }

        // Pass 5: free functions
        let resolver_arity = arity;
        for (index, item) in program.items.iter().enumerate() {
            if let Item::Function(function) = item.value() {
                let info = build_function(function, index, &resolver_arity)?;
                if GATE_NAMES.contains(&info.name.as_str()) {
                    // Built-in gates can't be shadowed
                    return Err((
                        CompileError::DuplicateDeclaration {
                            original: Span::none(),
                        },
                        *function.name.metadata(),
                    ));
                }
                if let Some(original) = registry.functions.get(&info.name) {
                    return Err((
                        CompileError::DuplicateDeclaration {
                            original: original.span,
                        },
                        *function.name.metadata(),
                    ));
                }
                registry.functions.insert(info.name.clone(), info);
            }
        }

        // Pass 6: now that every class is known, check generic bounds in
        // all recorded member types
        registry.validate_recorded_bounds()?;

        Ok(registry)
    }

    /// Override/abstract validation for one class. Its base must already be
    /// validated.
    fn validate_class_methods(&mut self, name: &str) -> Result<(), Errored> {
        let class = &self.classes[name];
        let mut abstract_set: HashSet<String> = class
            .base
            .as_ref()
            .map(|base| self.classes[base].abstract_methods.clone())
            .unwrap_or_default();

        // Collect (signature, info) pairs sorted by member index so errors
        // point at the first offender
        let mut own: Vec<MethodInfo> =
            class.methods.values().flatten().cloned().collect();
        own.sort_by_key(|m| m.member_index);

        for method in &own {
            let signature = method.signature();
            if method.dispatch == Dispatch::Override {
                let base_method = class
                    .base
                    .as_ref()
                    .and_then(|base| {
                        self.find_exact_method(base, &method.name, &method.params)
                    });
                let base_method = base_method.ok_or((
                    CompileError::InvalidOverride {
                        detail: "no base method with this signature",
                    },
                    method.span,
                ))?;
                if !base_method.is_virtual() {
                    return Err((
                        CompileError::InvalidOverride {
                            detail: "base method is not virtual",
                        },
                        method.span,
                    ));
                }
                if base_method.is_static {
                    return Err((
                        CompileError::InvalidOverride {
                            detail: "base method is static",
                        },
                        method.span,
                    ));
                }
                if base_method.return_type != method.return_type {
                    return Err((
                        CompileError::InvalidOverride {
                            detail: "return type differs from base method",
                        },
                        method.span,
                    ));
                }
            }
            if method.is_virtual() && method.is_static {
                return Err((
                    CompileError::InvalidOverride {
                        detail: "static methods cannot be virtual",
                    },
                    method.span,
                ));
            }
            if method.is_virtual() && !method.has_body {
                abstract_set.insert(signature.clone());
            }
            if method.has_body {
                abstract_set.remove(&signature);
            }
            // A bodyless method that isn't virtual is meaningless
            if !method.is_virtual() && !method.has_body {
                return Err((
                    CompileError::InvalidOverride {
                        detail: "only virtual methods can omit a body",
                    },
                    method.span,
                ));
            }
        }

        self.classes.get_mut(name).unwrap().abstract_methods = abstract_set;
        Ok(())
    }

    /// After all classes exist: walk every recorded member type and check
    /// generic bounds on class applications.
    fn validate_recorded_bounds(&self) -> Result<(), Errored> {
        for name in &self.order {
            let class = &self.classes[name];
            for field in class
                .instance_fields
                .iter()
                .chain(class.static_fields.iter())
            {
                self.validate_generic_application(&field.ty, field.span)?;
            }
            for method in class.methods.values().flatten() {
                for param in &method.params {
                    self.validate_generic_application(param, method.span)?;
                }
                self.validate_generic_application(
                    &method.return_type,
                    method.span,
                )?;
            }
            for ctor in &class.constructors {
                for param in &ctor.params {
                    self.validate_generic_application(param, ctor.span)?;
                }
            }
        }
        for function in self.functions.values() {
            for param in &function.params {
                self.validate_generic_application(param, function.span)?;
            }
            self.validate_generic_application(
                &function.return_type,
                function.span,
            )?;
        }
        Ok(())
    }

    // ===== Lookup =====

    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    /// Walk the base chain from `class` to the root, inclusive.
    pub fn base_chain<'a>(
        &'a self,
        class: &str,
    ) -> impl Iterator<Item = &'a ClassInfo> {
        let mut current = self.classes.get(class);
        std::iter::from_fn(move || {
            let class = current?;
            current = class.base.as_ref().and_then(|b| self.classes.get(b));
            Some(class)
        })
    }

    /// Number of inheritance steps from `sub` up to `sup`, if `sup` is on
    /// `sub`'s base chain.
    pub fn inheritance_distance(
        &self,
        sub: &str,
        sup: &str,
    ) -> Option<usize> {
        self.base_chain(sub).position(|class| class.name == sup)
    }

    pub fn is_subclass(&self, sub: &str, sup: &str) -> bool {
        matches!(self.inheritance_distance(sub, sup), Some(d) if d > 0)
    }

    /// Find an instance or static field by name, walking the hierarchy.
    /// Returns the declaring class and the field record.
    pub fn find_field(
        &self,
        class: &str,
        name: &str,
    ) -> Option<(&ClassInfo, &FieldInfo, bool)> {
        for level in self.base_chain(class) {
            if let Some(field) =
                level.instance_fields.iter().find(|f| f.name == name)
            {
                return Some((level, field, false));
            }
            if let Some(field) =
                level.static_fields.iter().find(|f| f.name == name)
            {
                return Some((level, field, true));
            }
        }
        None
    }

    /// Find a method with exactly these parameter types, walking the
    /// hierarchy from `class` upward.
    pub fn find_exact_method(
        &self,
        class: &str,
        name: &str,
        params: &[TypeInfo],
    ) -> Option<&MethodInfo> {
        for level in self.base_chain(class) {
            if let Some(methods) = level.methods.get(name) {
                if let Some(found) =
                    methods.iter().find(|m| m.params == params)
                {
                    return Some(found);
                }
            }
        }
        None
    }

    // ===== Assignability and conversion =====

    /// Is a value of type `actual` assignable to a slot of type `expected`
    /// without an explicit cast?
    pub fn is_assignable(
        &self,
        expected: &TypeInfo,
        actual: &TypeInfo,
    ) -> bool {
        self.conversion_cost(expected, actual).is_some()
    }

    /// The conversion cost used for overload resolution: 0 for exact (or
    /// unknown, so error recovery doesn't cascade), +1 per primitive
    /// widening, +k for inheritance distance k, +3 for null-to-reference.
    /// `None` means not convertible.
    pub fn conversion_cost(
        &self,
        expected: &TypeInfo,
        actual: &TypeInfo,
    ) -> Option<u32> {
        if expected.is_unknown() || actual.is_unknown() {
            return Some(0);
        }
        // null fits any non-array class-reference slot (including type
        // parameters, which always stand for classes)
        if actual.is_null() {
            return if expected.is_class_ref() || expected.is_type_param {
                Some(3)
            } else {
                None
            };
        }
        // Type parameters: assignable to themselves by name; a bounded
        // parameter is assignable to any supertype of its bound
        if actual.is_type_param {
            if expected.is_type_param {
                return if expected.class_name == actual.class_name {
                    Some(0)
                } else {
                    None
                };
            }
            if let (Some(bound), Some(expected_name)) =
                (actual.param_bound(), expected.class_name.as_deref())
            {
                if let Some(bound_name) = bound.class_name.as_deref() {
                    if bound_name == expected_name
                        || self.is_subclass(bound_name, expected_name)
                    {
                        return Some(
                            self.inheritance_distance(
                                bound_name,
                                expected_name,
                            )? as u32
                                + 1,
                        );
                    }
                }
            }
            return None;
        }
        if expected.is_type_param {
            return None;
        }
        // Arrays require identical element types
        if expected.is_array() || actual.is_array() {
            return if expected.is_array()
                && actual.is_array()
                && expected.element() == actual.element()
            {
                Some(0)
            } else {
                None
            };
        }
        match (&expected.class_name, &actual.class_name) {
            (Some(expected_name), Some(actual_name)) => {
                if expected_name == actual_name
                    && expected.type_args == actual.type_args
                {
                    Some(0)
                } else if expected.type_args.is_empty()
                    && actual.type_args.is_empty()
                {
                    // Strict subclassing, only between non-generic
                    // applications
                    match self
                        .inheritance_distance(actual_name, expected_name)
                    {
                        Some(distance) if distance > 0 => {
                            Some(distance as u32)
                        }
                        _ => None,
                    }
                } else {
                    None
                }
            }
            (None, None) => {
                if expected.primitive == actual.primitive {
                    Some(0)
                } else if expected.primitive == Primitive::Long
                    && actual.primitive == Primitive::Int
                {
                    // The only implicit widening
                    Some(1)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    // ===== Generic application =====

    /// Verify arity and bounds for a class application (recursively through
    /// its arguments).
    pub fn validate_generic_application(
        &self,
        ty: &TypeInfo,
        span: Span,
    ) -> Result<(), Errored> {
        if ty.is_type_param {
            return Ok(());
        }
        if ty.is_array() {
            if let Some(element) = ty.element() {
                return self.validate_generic_application(element, span);
            }
            return Ok(());
        }
        let class_name = match ty.class_name.as_deref() {
            Some(name) => name,
            None => return Ok(()),
        };
        let class = self
            .classes
            .get(class_name)
            .ok_or((CompileError::UnknownType, span))?;
        if class.type_params.len() != ty.type_args.len() {
            return Err((
                CompileError::GenericArity {
                    class: class_name.into(),
                    expected: class.type_params.len(),
                    actual: ty.type_args.len(),
                },
                span,
            ));
        }
        for (param, arg) in class.type_params.iter().zip(&ty.type_args) {
            if let Some(bound) = &param.bound {
                let satisfied = match (
                    bound.class_name.as_deref(),
                    arg.class_name.as_deref(),
                ) {
                    (Some(bound_name), Some(arg_name)) => {
                        // The argument is the bound, a subclass of it, or a
                        // type parameter whose own bound fits
                        if arg.is_type_param {
                            arg.param_bound()
                                .and_then(|b| b.class_name.as_deref())
                                .map(|inner| {
                                    inner == bound_name
                                        || self
                                            .is_subclass(inner, bound_name)
                                })
                                .unwrap_or(false)
                        } else {
                            arg_name == bound_name
                                || self.is_subclass(arg_name, bound_name)
                        }
                    }
                    _ => false,
                };
                if !satisfied {
                    return Err((
                        CompileError::GenericBound {
                            param: param.name.clone(),
                            bound: bound.to_string(),
                            actual: arg.to_string(),
                        },
                        span,
                    ));
                }
            }
            self.validate_generic_application(arg, span)?;
        }
        Ok(())
    }

    /// Build the substitution map for a generic class application.
    pub fn substitution_for(
        &self,
        receiver: &TypeInfo,
    ) -> HashMap<String, TypeInfo> {
        let mut map = HashMap::new();
        if let Some(class_name) = receiver.class_name.as_deref() {
            if let Some(class) = self.classes.get(class_name) {
                for (param, arg) in
                    class.type_params.iter().zip(&receiver.type_args)
                {
                    map.insert(param.name.clone(), arg.clone());
                }
            }
        }
        map
    }

    // ===== Overload resolution =====

    /// Resolve a method call by conversion cost across the visible
    /// hierarchy, starting at `class`. `subst` maps type-parameter names to
    /// the receiver's type arguments. Derived signatures mask identical base
    /// signatures. The winner must be the unique minimum-cost candidate.
    pub fn resolve_method_call(
        &self,
        class: &str,
        name: &str,
        args: &[TypeInfo],
        subst: &HashMap<String, TypeInfo>,
    ) -> Result<ResolvedMethod, ResolveFailure> {
        let mut masked: HashSet<String> = HashSet::new();
        let mut best: Option<(u32, ResolvedMethod)> = None;
        let mut tie = false;
        let mut found_name = false;

        for level in self.base_chain(class) {
            if let Some(methods) = level.methods.get(name) {
                found_name = true;
                for method in methods {
                    let signature = method.signature();
                    // Same parameter-type list in a derived class masks the
                    // base entry; the derived slot wins
                    if !masked.insert(signature) {
                        continue;
                    }
                    if method.params.len() != args.len() {
                        continue;
                    }
                    let params: Vec<TypeInfo> = method
                        .params
                        .iter()
                        .map(|p| substitute(p, subst))
                        .collect();
                    let mut cost = 0u32;
                    let mut fits = true;
                    for (param, arg) in params.iter().zip(args) {
                        match self.conversion_cost(param, arg) {
                            Some(c) => cost += c,
                            None => {
                                fits = false;
                                break;
                            }
                        }
                    }
                    if !fits {
                        continue;
                    }
                    let resolved = ResolvedMethod {
                        info: method.clone(),
                        return_type: substitute(&method.return_type, subst),
                    };
                    match &best {
                        Some((best_cost, _)) if cost > *best_cost => {}
                        Some((best_cost, _)) if cost == *best_cost => {
                            tie = true;
                        }
                        _ => {
                            best = Some((cost, resolved));
                            tie = false;
                        }
                    }
                }
            }
        }

        match best {
            Some(_) if tie => Err(ResolveFailure::Ambiguous),
            Some((_, resolved)) => Ok(resolved),
            None if found_name => Err(ResolveFailure::NoMatch),
            None => Err(ResolveFailure::UnknownName),
        }
    }

    /// Resolve a constructor call on `class` by conversion cost.
    pub fn resolve_constructor(
        &self,
        class: &ClassInfo,
        args: &[TypeInfo],
        subst: &HashMap<String, TypeInfo>,
    ) -> Result<ResolvedCtor, ResolveFailure> {
        let mut best: Option<(u32, ResolvedCtor)> = None;
        let mut tie = false;
        for ctor in &class.constructors {
            if ctor.params.len() != args.len() {
                continue;
            }
            let params: Vec<TypeInfo> =
                ctor.params.iter().map(|p| substitute(p, subst)).collect();
            let mut cost = 0u32;
            let mut fits = true;
            for (param, arg) in params.iter().zip(args) {
                match self.conversion_cost(param, arg) {
                    Some(c) => cost += c,
                    None => {
                        fits = false;
                        break;
                    }
                }
            }
            if !fits {
                continue;
            }
            let resolved = ResolvedCtor {
                info: ctor.clone(),
                params,
            };
            match &best {
                Some((best_cost, _)) if cost > *best_cost => {}
                Some((best_cost, _)) if cost == *best_cost => tie = true,
                _ => {
                    best = Some((cost, resolved));
                    tie = false;
                }
            }
        }
        match best {
            Some(_) if tie => Err(ResolveFailure::Ambiguous),
            Some((_, resolved)) => Ok(resolved),
            None => Err(ResolveFailure::NoMatch),
        }
    }
}

/// A method resolved against a receiver type: the method record plus its
/// parameter/return types after generic substitution.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedMethod {
    pub info: MethodInfo,
    pub return_type: TypeInfo,
}

#[derive(Clone, Debug)]
pub(crate) struct ResolvedCtor {
    pub info: CtorInfo,
    pub params: Vec<TypeInfo>,
}

/// Why overload resolution failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ResolveFailure {
    /// No method with that name anywhere in the hierarchy
    UnknownName,
    /// Methods with that name exist, but none accept these arguments
    NoMatch,
    /// Two candidates tied at minimum cost
    Ambiguous,
}

/// Structural type-parameter substitution: replace any type-param node whose
/// name is in the map, descending through type arguments.
pub(crate) fn substitute(
    ty: &TypeInfo,
    map: &HashMap<String, TypeInfo>,
) -> TypeInfo {
    if ty.is_type_param {
        if let Some(name) = ty.class_name.as_deref() {
            if let Some(replacement) = map.get(name) {
                return replacement.clone();
            }
        }
        return ty.clone();
    }
    if ty.is_array() {
        if let Some(element) = ty.element() {
            return TypeInfo::array(substitute(element, map));
        }
        return ty.clone();
    }
    let mut out = ty.clone();
    out.type_args = ty.type_args.iter().map(|a| substitute(a, map)).collect();
    out
}

// ===== Per-declaration builders =====

impl ClassInfo {
    /// The injected `Object` root: no fields, no methods, one implicit
    /// zero-argument constructor.
    fn object_root() -> Self {
        Self {
            name: OBJECT_CLASS.into(),
            base: None,
            is_static: false,
            is_abstract: false,
            type_params: Vec::new(),
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: HashMap::new(),
            constructors: vec![CtorInfo {
                visibility: Visibility::Public,
                params: Vec::new(),
                param_names: Vec::new(),
                member_index: usize::MAX,
                span: Span::none(),
            }],
            destructor: None,
            abstract_methods: HashSet::new(),
            declared_signatures: HashSet::new(),
            item_index: None,
            span: Span::none(),
        }
    }

    fn from_decl(
        class: &ClassDecl,
        item_index: usize,
        arity: &HashMap<String, usize>,
    ) -> Result<Self, Errored> {
        let name = class.name.value().clone();
        let span = *class.name.metadata();

        if name == OBJECT_CLASS {
            if !class.type_params.is_empty() {
                return Err((
                    CompileError::InvalidObjectClass {
                        detail: "the root class cannot be generic",
                    },
                    span,
                ));
            }
            if class.base.is_some() {
                return Err((
                    CompileError::InvalidObjectClass {
                        detail: "the root class cannot declare a base",
                    },
                    span,
                ));
            }
        }

        // Resolve type parameter bounds first (bounds can only name
        // classes, not sibling parameters)
        let empty: Vec<TypeParamInfo> = Vec::new();
        let bound_resolver = TypeResolver::new(arity, &empty);
        let mut type_params = Vec::new();
        for param in &class.type_params {
            let value = param.value();
            let bound = match &value.bound {
                Some(node) => {
                    let bound = bound_resolver.resolve(node)?;
                    if !bound.is_class_ref() {
                        return Err((
                            CompileError::TypeMismatch {
                                expected: "class type".into(),
                                actual: bound.to_string(),
                            },
                            *node.metadata(),
                        ));
                    }
                    Some(bound)
                }
                None => None,
            };
            type_params.push(TypeParamInfo {
                name: value.name.value().clone(),
                bound,
            });
        }

        let resolver = TypeResolver::new(arity, &type_params);
        let mut info = Self {
            name: name.clone(),
            base: match &class.base {
                Some(base) => Some(base.value().clone()),
                None if name == OBJECT_CLASS => None,
                None => Some(OBJECT_CLASS.into()),
            },
            is_static: class.is_static,
            is_abstract: class.is_abstract,
            type_params: type_params.clone(),
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: HashMap::new(),
            constructors: Vec::new(),
            destructor: None,
            abstract_methods: HashSet::new(),
            declared_signatures: HashSet::new(),
            item_index: Some(item_index),
            span,
        };

        let mut field_spans: HashMap<String, Span> = HashMap::new();
        for (member_index, member) in class.members.iter().enumerate() {
            let member_span = *member.metadata();
            match member.value() {
                Member::Field(field) => {
                    info.add_field(
                        field,
                        member_index,
                        &resolver,
                        &mut field_spans,
                    )?;
                }
                Member::Method(method) => {
                    info.add_method(method, member_index, &resolver)?;
                }
                Member::Constructor(ctor) => {
                    info.add_constructor(ctor, member_index, &resolver)?;
                }
                Member::Destructor(_) => {
                    if info.is_static {
                        return Err((
                            CompileError::StaticClassMember,
                            member_span,
                        ));
                    }
                    if info.destructor.is_some() {
                        return Err((
                            CompileError::MultipleDestructors,
                            member_span,
                        ));
                    }
                    info.destructor = Some(member_index);
                }
            }
        }

        // A non-static class needs at least one constructor to be
        // instantiable down the chain
        if !info.is_static
            && info.constructors.is_empty()
            && info.name != OBJECT_CLASS
        {
            return Err((CompileError::MissingConstructor, span));
        }
        if info.name == OBJECT_CLASS && info.constructors.is_empty() {
            // A user-declared root still needs the implicit zero-arg ctor
            info.constructors.push(CtorInfo {
                visibility: Visibility::Public,
                params: Vec::new(),
                param_names: Vec::new(),
                member_index: usize::MAX,
                span: Span::none(),
            });
        }

        Ok(info)
    }

    fn add_field(
        &mut self,
        field: &FieldDecl,
        member_index: usize,
        resolver: &TypeResolver<'_>,
        field_spans: &mut HashMap<String, Span>,
    ) -> Result<(), Errored> {
        let name = field.name.value().clone();
        let name_span = *field.name.metadata();
        if self.is_static && !field.is_static {
            return Err((CompileError::StaticClassMember, name_span));
        }
        if let Some(original) = field_spans.get(&name) {
            return Err((
                CompileError::DuplicateDeclaration {
                    original: *original,
                },
                name_span,
            ));
        }
        field_spans.insert(name.clone(), name_span);

        let (quantum, shots, tracked) = annotation_flags(&field.annotations);
        if quantum || shots.is_some() {
            return Err((
                CompileError::BadAnnotation {
                    detail: "only @tracked is valid on a field",
                },
                name_span,
            ));
        }
        let ty = resolver.resolve(&field.ty)?;
        if ty.is_void() {
            return Err((
                CompileError::TypeMismatch {
                    expected: "non-void type".into(),
                    actual: ty.to_string(),
                },
                *field.ty.metadata(),
            ));
        }
        let info = FieldInfo {
            name,
            visibility: field.visibility,
            is_final: field.is_final,
            is_tracked: tracked,
            ty,
            has_init: field.init.is_some(),
            member_index,
            span: name_span,
        };
        if field.is_static {
            self.static_fields.push(info);
        } else {
            self.instance_fields.push(info);
        }
        Ok(())
    }

    fn add_method(
        &mut self,
        method: &MethodDecl,
        member_index: usize,
        resolver: &TypeResolver<'_>,
    ) -> Result<(), Errored> {
        let name = method.name.value().clone();
        let name_span = *method.name.metadata();
        if self.is_static && !method.is_static {
            return Err((CompileError::StaticClassMember, name_span));
        }
        let params = method
            .params
            .iter()
            .map(|p| resolver.resolve(&p.value().ty))
            .collect::<Result<Vec<_>, _>>()?;
        let param_names = method
            .params
            .iter()
            .map(|p| p.value().name.value().clone())
            .collect();
        let return_type = resolver.resolve(&method.return_type)?;
        let info = MethodInfo {
            name: name.clone(),
            visibility: method.visibility,
            dispatch: method.dispatch,
            is_static: method.is_static,
            params,
            param_names,
            return_type,
            has_body: method.body.is_some(),
            member_index,
            defined_in: self.name.clone(),
            span: name_span,
        };
        let signature = info.signature();
        if !self.declared_signatures.insert(signature) {
            return Err((
                CompileError::DuplicateDeclaration {
                    original: Span::none(),
                },
                name_span,
            ));
        }
        self.methods.entry(name).or_insert_with(Vec::new).push(info);
        Ok(())
    }

    fn add_constructor(
        &mut self,
        ctor: &CtorDecl,
        member_index: usize,
        resolver: &TypeResolver<'_>,
    ) -> Result<(), Errored> {
        let span = *ctor.class_type.metadata();
        if self.is_static {
            return Err((CompileError::StaticClassMember, span));
        }
        // The constructor's "return type" must name its own class
        let declared = resolver.resolve(&ctor.class_type)?;
        let names_own_class = declared.class_name.as_deref()
            == Some(self.name.as_str())
            && declared
                .type_args
                .iter()
                .zip(&self.type_params)
                .all(|(arg, param)| {
                    arg.is_type_param
                        && arg.class_name.as_deref()
                            == Some(param.name.as_str())
                })
            && declared.type_args.len() == self.type_params.len();
        if !names_own_class {
            return Err((
                CompileError::TypeMismatch {
                    expected: self.name.clone(),
                    actual: declared.to_string(),
                },
                span,
            ));
        }
        let params = ctor
            .params
            .iter()
            .map(|p| resolver.resolve(&p.value().ty))
            .collect::<Result<Vec<_>, _>>()?;
        let param_names: Vec<String> = ctor
            .params
            .iter()
            .map(|p| p.value().name.value().clone())
            .collect();
        if self
            .constructors
            .iter()
            .any(|existing| existing.params == params)
        {
            return Err((
                CompileError::DuplicateDeclaration {
                    original: Span::none(),
                },
                span,
            ));
        }
        self.constructors.push(CtorInfo {
            visibility: ctor.visibility,
            params,
            param_names,
            member_index,
            span,
        });
        Ok(())
    }
}

fn build_function(
    function: &FunctionDecl,
    item_index: usize,
    arity: &HashMap<String, usize>,
) -> Result<FunctionInfo, Errored> {
    let empty: Vec<TypeParamInfo> = Vec::new();
    let resolver = TypeResolver::new(arity, &empty);
    let params = function
        .params
        .iter()
        .map(|p| resolver.resolve(&p.value().ty))
        .collect::<Result<Vec<_>, _>>()?;
    let param_names = function
        .params
        .iter()
        .map(|p| p.value().name.value().clone())
        .collect();
    let return_type = resolver.resolve(&function.return_type)?;
    let (_, shots, tracked) = annotation_flags(&function.annotations);
    if tracked {
        return Err((
            CompileError::BadAnnotation {
                detail: "@tracked only annotates variables and fields",
            },
            *function.name.metadata(),
        ));
    }
    Ok(FunctionInfo {
        name: function.name.value().clone(),
        params,
        param_names,
        return_type,
        shots,
        item_index,
        span: *function.name.metadata(),
    })
}

/// Order class names so every base comes before its subclasses, preserving
/// declaration order among unrelated classes.
fn topo_order(
    declared: &[String],
    classes: &HashMap<String, ClassInfo>,
) -> Vec<String> {
    let mut order = Vec::with_capacity(declared.len());
    let mut placed: HashSet<String> = HashSet::new();
    fn place(
        name: &str,
        classes: &HashMap<String, ClassInfo>,
        placed: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if placed.contains(name) {
            return;
        }
        if let Some(base) = &classes[name].base {
            place(base, classes, placed, order);
        }
        placed.insert(name.into());
        order.push(name.into());
    }
    for name in declared {
        place(name, classes, &mut placed, &mut order);
    }
    order
}

/// Free functions that have a `main` entry point check. Used by the
/// analyser; lives here because the registry owns the function table.
impl Registry {
    pub fn main_function(&self) -> Option<&FunctionInfo> {
        self.functions.get(MAIN_FUNCTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;

    fn registry_for(src: &str) -> Result<Registry, Errored> {
        let program: Program = {
            let compiler = crate::Compiler::for_source(src.into());
            compiler.parse().expect("parse failed").ast
        };
        Registry::build(&program)
    }

    #[test]
    fn test_object_injected() {
        let registry = registry_for("function main() -> void {}").unwrap();
        assert!(registry.class(OBJECT_CLASS).is_some());
    }

    #[test]
    fn test_base_defaults_to_object() {
        let registry = registry_for(
            "class A { constructor() -> A {} }
            function main() -> void {}",
        )
        .unwrap();
        assert_eq!(
            registry.class("A").unwrap().base.as_deref(),
            Some(OBJECT_CLASS)
        );
        assert_eq!(registry.inheritance_distance("A", OBJECT_CLASS), Some(1));
    }

    #[test]
    fn test_inheritance_cycle_rejected() {
        let result = registry_for(
            "class A extends B { constructor() -> A {} }
            class B extends A { constructor() -> B {} }",
        );
        assert!(matches!(
            result,
            Err((CompileError::InheritanceCycle, _))
        ));
    }

    #[test]
    fn test_missing_constructor_rejected() {
        let result = registry_for("class A { public int x; }");
        assert!(matches!(
            result,
            Err((CompileError::MissingConstructor, _))
        ));
    }

    #[test]
    fn test_abstract_set_propagation() {
        let registry = registry_for(
            "abstract class A {
                constructor() -> A {}
                virtual function f() -> int;
            }
            class B extends A {
                constructor() -> B {}
                override function f() -> int { return 1; }
            }",
        )
        .unwrap();
        assert!(registry.class("A").unwrap().is_effectively_abstract());
        assert!(!registry.class("B").unwrap().is_effectively_abstract());
    }

    #[test]
    fn test_override_requires_virtual_base() {
        let result = registry_for(
            "class A {
                constructor() -> A {}
                function f() -> int { return 1; }
            }
            class B extends A {
                constructor() -> B {}
                override function f() -> int { return 2; }
            }",
        );
        assert!(matches!(
            result,
            Err((CompileError::InvalidOverride { .. }, _))
        ));
    }

    #[test]
    fn test_widening_cost() {
        let registry = registry_for("function main() -> void {}").unwrap();
        let int = TypeInfo::primitive(Primitive::Int);
        let long = TypeInfo::primitive(Primitive::Long);
        let float = TypeInfo::primitive(Primitive::Float);
        assert_eq!(registry.conversion_cost(&long, &int), Some(1));
        assert_eq!(registry.conversion_cost(&int, &long), None);
        assert_eq!(registry.conversion_cost(&float, &int), None);
        assert_eq!(registry.conversion_cost(&int, &float), None);
    }

    #[test]
    fn test_overload_resolution_prefers_exact() {
        let registry = registry_for(
            "class A {
                constructor() -> A {}
                function f(int x) -> int { return 1; }
                function f(long x) -> int { return 2; }
            }
            function main() -> void {}",
        )
        .unwrap();
        let resolved = registry
            .resolve_method_call(
                "A",
                "f",
                &[TypeInfo::primitive(Primitive::Int)],
                &HashMap::new(),
            )
            .unwrap();
        assert_eq!(
            resolved.info.params,
            vec![TypeInfo::primitive(Primitive::Int)]
        );
    }

    #[test]
    fn test_generic_bound_validation() {
        let registry = registry_for(
            "class A { constructor() -> A {} }
            class B extends A { constructor() -> B {} }
            class Box<T extends A> {
                public T v;
                constructor(T v) -> Box<T> { this.v = v; }
            }
            function main() -> void {}",
        )
        .unwrap();
        let good = TypeInfo::class("Box", vec![TypeInfo::class("B", vec![])]);
        assert!(registry
            .validate_generic_application(&good, Span::none())
            .is_ok());
        let bad =
            TypeInfo::class("Box", vec![TypeInfo::class("Object", vec![])]);
        assert!(matches!(
            registry.validate_generic_application(&bad, Span::none()),
            Err((CompileError::GenericBound { .. }, _))
        ));
    }

    #[test]
    fn test_substitution() {
        let mut map = HashMap::new();
        map.insert("T".to_string(), TypeInfo::class("A", vec![]));
        let ty = TypeInfo::array(TypeInfo::type_param("T"));
        let substituted = substitute(&ty, &map);
        assert_eq!(
            substituted,
            TypeInfo::array(TypeInfo::class("A", vec![]))
        );
    }
}
