//! The runtime evaluator. A [Machine] executes a checked program exactly
//! once: it builds a runtime mirror of the class registry (field layouts,
//! static storage, vtables), interprets classical statements, drives the
//! statevector simulator for gates/measure/reset, runs constructor and
//! destructor chains, and aggregates tracked outcomes at scope exit.

use crate::{
    ast::{
        BinaryOp, Block, CtorBody, Expr, Item, Member, PostfixOp, Program,
        SpanNode, Statement, TypeNode, UnaryOp,
    },
    consts::{GATE_NAMES, OBJECT_CLASS},
    debug,
    error::{RuntimeError, SourceErrorWrapper, WithSource},
    heap::{Collector, Heap, Object},
    registry::{
        CtorInfo, Registry, ResolveFailure, ResolvedCtor, TypeParamInfo,
        TypeResolver,
    },
    simulator::Simulator,
    ty::{Primitive, TypeInfo},
    util::Span,
    value::{ArrayValue, ObjRef, Value},
    CheckedProgram,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type EvalResult = Result<Value, (RuntimeError, Span)>;
type ExecResult = Result<Flow, (RuntimeError, Span)>;
type UnitResult = Result<(), (RuntimeError, Span)>;

/// Control-flow outcome of a statement.
#[derive(Clone, Debug)]
enum Flow {
    Normal,
    Return(Value),
}

/// One instance-field slot in a runtime class layout. Positions in
/// [Object::fields] match positions here.
#[derive(Clone, Debug)]
struct LayoutField {
    name: String,
    ty: TypeInfo,
    tracked: bool,
    declared_in: String,
    member_index: usize,
    has_init: bool,
}

/// Runtime mirror of a class: inherited layout, vtable, derived bits.
#[derive(Clone, Debug)]
struct RuntimeClass {
    layout: Vec<LayoutField>,
    /// Slot -> most-derived implementation (class name, member index)
    vtable: Vec<(String, usize)>,
    /// Signature key -> vtable slot
    vslots: HashMap<String, usize>,
    /// This class or any base declares a tracked field
    has_tracked_fields: bool,
}

/// One environment slot.
#[derive(Clone, Debug)]
struct VarSlot {
    value: Value,
    ty: TypeInfo,
    tracked: bool,
}

#[derive(Debug, Default)]
struct Scope {
    vars: Vec<(String, VarSlot)>,
}

/// A call frame: the scopes of one function/method activation plus the
/// class context its body runs in.
#[derive(Debug)]
struct Frame {
    class: Option<String>,
    scopes: Vec<Scope>,
}

/// A single-use interpreter for one program execution (one shot).
pub struct Machine {
    source: String,
    program: Rc<Program>,
    registry: Rc<Registry>,

    // Runtime state
    classes: HashMap<String, RuntimeClass>,
    statics: HashMap<String, Vec<Value>>,
    frames: Vec<Frame>,
    sim: Simulator,
    heap: Heap,
    collector: Option<Collector>,
    executed: bool,

    // Host-facing knobs and outputs
    echo_enabled: bool,
    echo_buffer: Vec<String>,
    warn_on_exit: bool,
    warnings: Vec<String>,
    /// Tracked-variable label -> outcome string -> count
    tracked_counts: HashMap<String, HashMap<String, u64>>,
    /// Every measured bit, in program order
    measurements: Vec<u8>,
    /// Last measured bit per qubit; cleared by reset
    last_measured: HashMap<usize, u8>,
}

impl Machine {
    pub(crate) fn new(
        checked: CheckedProgram,
        source: String,
        seed: Option<u64>,
    ) -> Self {
        Self {
            source,
            program: Rc::new(checked.program),
            registry: Rc::new(checked.registry),
            classes: HashMap::new(),
            statics: HashMap::new(),
            frames: Vec::new(),
            sim: Simulator::new(seed),
            heap: Heap::new(),
            collector: None,
            executed: false,
            echo_enabled: true,
            echo_buffer: Vec::new(),
            warn_on_exit: true,
            warnings: Vec::new(),
            tracked_counts: HashMap::new(),
            measurements: Vec::new(),
            last_measured: HashMap::new(),
        }
    }

    // ===== Host interface =====

    /// Execute the program. A machine runs exactly once; calling this a
    /// second time fails with a Runtime error.
    pub fn execute(&mut self) -> Result<(), WithSource<RuntimeError>> {
        match self.execute_inner() {
            Ok(()) => Ok(()),
            Err((error, span)) => {
                let wrapper =
                    SourceErrorWrapper::new(error, span, &self.source);
                Err(WithSource::new(Some(wrapper), self.source.clone()))
            }
        }
    }

    /// The OpenQASM 2.0 transcript accumulated so far.
    pub fn qasm(&self) -> String {
        self.sim.qasm()
    }

    /// Tracked-variable histograms: label -> outcome string -> count.
    pub fn tracked_counts(&self) -> &HashMap<String, HashMap<String, u64>> {
        &self.tracked_counts
    }

    /// Every measurement result, in the order the measurements ran.
    pub fn measurements(&self) -> &[u8] {
        &self.measurements
    }

    /// Buffered `echo` output, one entry per statement. The driver flushes
    /// this after warnings so program output follows diagnostics.
    pub fn echo_output(&self) -> &[String] {
        &self.echo_buffer
    }

    /// Diagnostic lines produced at program exit (e.g. unmeasured qubits).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn set_echo(&mut self, enabled: bool) {
        self.echo_enabled = enabled;
    }

    pub fn set_warn_on_exit(&mut self, enabled: bool) {
        self.warn_on_exit = enabled;
    }

    /// Toggle QASM statement logging. Register sizes are reported either
    /// way.
    pub fn set_transcript(&mut self, enabled: bool) {
        self.sim.set_logging(enabled);
    }

    /// Number of live heap objects. Test probe.
    pub fn heap_size(&mut self) -> usize {
        self.heap.len()
    }

    // ===== Execution driver =====

    fn execute_inner(&mut self) -> UnitResult {
        if self.executed {
            return Err((RuntimeError::MachineReused, Span::none()));
        }
        self.executed = true;

        self.build_class_table();
        self.init_statics()?;

        // The collector worker only exists when there are classes to
        // collect
        let has_user_classes = self
            .program
            .items
            .iter()
            .any(|item| matches!(item.value(), Item::Class(_)));
        if has_user_classes {
            self.collector = Some(Collector::start());
        }

        let main = self
            .registry
            .main_function()
            .expect("analysis guarantees main")
            .clone();
        let program = Rc::clone(&self.program);
        let main_decl = match program.items[main.item_index].value() {
            Item::Function(function) => function,
            _ => panic!("main is not a function"),
        };

        self.push_frame(None);
        let result = self.exec_block(main_decl.body.value());
        let pop_result = self.pop_frame();

        // Wind down the collector before surfacing any error: join the
        // worker, then run one final pass
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }
        result?;
        pop_result?;
        self.collect_cycles();

        if self.warn_on_exit {
            for qubit in 0..self.sim.num_qubits() {
                if !self.sim.was_ever_measured(qubit) {
                    self.warnings.push(format!(
                        "warning: qubit {} was never measured",
                        qubit
                    ));
                }
            }
        }
        debug!(println!("Tracked counts: {:?}", self.tracked_counts));
        Ok(())
    }

    /// Build the runtime class table in base-before-derived order:
    /// inherited layout, vtable slot assignment, tracked-field bit.
    fn build_class_table(&mut self) {
        let registry = Rc::clone(&self.registry);
        for name in &registry.order {
            let info = &registry.classes[name];
            let (mut layout, mut vtable, mut vslots, base_tracked) =
                match &info.base {
                    Some(base) => {
                        let base_rt = &self.classes[base];
                        (
                            base_rt.layout.clone(),
                            base_rt.vtable.clone(),
                            base_rt.vslots.clone(),
                            base_rt.has_tracked_fields,
                        )
                    }
                    None => (Vec::new(), Vec::new(), HashMap::new(), false),
                };

            for field in &info.instance_fields {
                layout.push(LayoutField {
                    name: field.name.clone(),
                    ty: field.ty.clone(),
                    tracked: field.is_tracked,
                    declared_in: name.clone(),
                    member_index: field.member_index,
                    has_init: field.has_init,
                });
            }

            // Vtable: reuse the overridden base slot, otherwise append
            let mut own_methods: Vec<_> =
                info.methods.values().flatten().collect();
            own_methods.sort_by_key(|m| m.member_index);
            for method in own_methods {
                if !method.is_virtual() {
                    continue;
                }
                let signature = method.signature();
                let entry = (name.clone(), method.member_index);
                match vslots.get(&signature) {
                    Some(&slot) => vtable[slot] = entry,
                    None => {
                        vslots.insert(signature, vtable.len());
                        vtable.push(entry);
                    }
                }
            }

            self.classes.insert(
                name.clone(),
                RuntimeClass {
                    layout,
                    vtable,
                    vslots,
                    has_tracked_fields: base_tracked
                        || info.has_own_tracked_fields(),
                },
            );
        }
    }

    /// Seed static storage with defaults, then run declared initializers
    /// (each exactly once, in registry order, under a static context).
    fn init_statics(&mut self) -> UnitResult {
        let registry = Rc::clone(&self.registry);
        for name in &registry.order {
            let info = &registry.classes[name];
            let mut storage = Vec::with_capacity(info.static_fields.len());
            self.push_frame(Some(name.clone()));
            for field in &info.static_fields {
                let decl = self.field_decl(name, field.member_index);
                let default = self.default_from_type_node(&decl.ty)?;
                storage.push(default);
            }
            self.pop_frame()?;
            self.statics.insert(name.clone(), storage);
        }
        for name in &registry.order {
            let info = &registry.classes[name];
            for (index, field) in info.static_fields.iter().enumerate() {
                if !field.has_init {
                    continue;
                }
                let decl = self.field_decl(name, field.member_index);
                let init =
                    decl.init.clone().expect("registry says initializer");
                self.push_frame(Some(name.clone()));
                let value = self.eval_expr(&init)?;
                self.pop_frame()?;
                let old = std::mem::replace(
                    &mut self
                        .statics
                        .get_mut(name)
                        .expect("statics seeded")[index],
                    value,
                );
                self.release_value(old)?;
            }
        }
        Ok(())
    }

    // ===== AST accessors =====

    fn class_item_index(&self, class: &str) -> usize {
        self.registry.classes[class]
            .item_index
            .expect("injected root has no declaration")
    }

    fn field_decl(
        &self,
        class: &str,
        member_index: usize,
    ) -> crate::ast::FieldDecl {
        let item = self.class_item_index(class);
        match self.program.items[item].value() {
            Item::Class(decl) => match decl.members[member_index].value() {
                Member::Field(field) => field.clone(),
                _ => panic!("member {} of {} is not a field", member_index, class),
            },
            _ => panic!("item {} is not a class", item),
        }
    }

    // ===== Environment =====

    fn push_frame(&mut self, class: Option<String>) {
        self.frames.push(Frame {
            class,
            scopes: vec![Scope::default()],
        });
    }

    fn pop_frame(&mut self) -> UnitResult {
        let mut frame = self.frames.pop().expect("no frame to pop");
        while let Some(scope) = frame.scopes.pop() {
            self.drain_scope(scope)?;
        }
        Ok(())
    }

    fn push_scope(&mut self) {
        self.frames
            .last_mut()
            .expect("no frame")
            .scopes
            .push(Scope::default());
    }

    fn pop_scope(&mut self) -> UnitResult {
        let scope = self
            .frames
            .last_mut()
            .expect("no frame")
            .scopes
            .pop()
            .expect("no scope to pop");
        self.drain_scope(scope)
    }

    /// Scope exit: aggregate tracked variables, then release every value.
    fn drain_scope(&mut self, scope: Scope) -> UnitResult {
        for (name, slot) in scope.vars.into_iter().rev() {
            if slot.tracked {
                self.aggregate_tracked(&slot.ty, &name, &slot.value);
            }
            self.release_value(slot.value)?;
        }
        Ok(())
    }

    fn bind(&mut self, name: &str, slot: VarSlot) {
        self.frames
            .last_mut()
            .expect("no frame")
            .scopes
            .last_mut()
            .expect("no scope")
            .vars
            .push((name.into(), slot));
    }

    fn lookup(&self, name: &str) -> Option<&VarSlot> {
        let frame = self.frames.last()?;
        frame.scopes.iter().rev().find_map(|scope| {
            scope
                .vars
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, slot)| slot)
        })
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut VarSlot> {
        let frame = self.frames.last_mut()?;
        frame.scopes.iter_mut().rev().find_map(|scope| {
            scope
                .vars
                .iter_mut()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, slot)| slot)
        })
    }

    fn current_class(&self) -> Option<&str> {
        self.frames.last().and_then(|f| f.class.as_deref())
    }

    fn this_value(&self) -> Value {
        self.lookup("this")
            .expect("analysis guarantees this is bound")
            .value
            .clone()
    }

    /// Resolve a declared type in the current class context. Sizes are
    /// handled separately; this only yields the [TypeInfo].
    fn resolve_type(&self, node: &SpanNode<TypeNode>) -> TypeInfo {
        let arity: HashMap<String, usize> = self
            .registry
            .classes
            .iter()
            .map(|(name, class)| (name.clone(), class.type_params.len()))
            .collect();
        let empty: Vec<TypeParamInfo> = Vec::new();
        let params = self
            .current_class()
            .and_then(|name| self.registry.classes.get(name))
            .map(|class| &class.type_params)
            .unwrap_or(&empty);
        TypeResolver::new(&arity, params)
            .resolve(node)
            .expect("analysis resolved this type")
    }

    // ===== Statements =====

    fn exec_block(&mut self, block: &Block) -> ExecResult {
        self.push_scope();
        let mut flow = Flow::Normal;
        for statement in &block.statements {
            flow = self.exec_statement(statement)?;
            if !matches!(flow, Flow::Normal) {
                break;
            }
        }
        self.pop_scope()?;
        Ok(flow)
    }

    fn exec_statement(
        &mut self,
        statement: &SpanNode<Statement>,
    ) -> ExecResult {
        // Statement boundary: honor a pending collection request
        let pending = self
            .collector
            .as_ref()
            .map(Collector::take_pending)
            .unwrap_or(false);
        if pending {
            self.collect_cycles();
        }

        let span = *statement.metadata();
        match statement.value() {
            Statement::Block(block) => self.exec_block(block),
            Statement::If {
                condition,
                then_body,
                else_body,
            } => {
                if self.eval_expr(condition)?.truthy() {
                    self.exec_statement(then_body)
                } else if let Some(else_body) = else_body {
                    self.exec_statement(else_body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Statement::While { condition, body } => {
                while self.eval_expr(condition)?.truthy() {
                    let flow = self.exec_statement(body)?;
                    if !matches!(flow, Flow::Normal) {
                        return Ok(flow);
                    }
                }
                Ok(Flow::Normal)
            }
            Statement::For {
                init,
                condition,
                update,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.exec_statement(init)?;
                }
                loop {
                    if let Some(condition) = condition {
                        if !self.eval_expr(condition)?.truthy() {
                            break;
                        }
                    }
                    let flow = self.exec_statement(body)?;
                    if !matches!(flow, Flow::Normal) {
                        self.pop_scope()?;
                        return Ok(flow);
                    }
                    if let Some(update) = update {
                        let value = self.eval_expr(update)?;
                        self.release_value(value)?;
                    }
                }
                self.pop_scope()?;
                Ok(Flow::Normal)
            }
            Statement::Return(value) => {
                let value = match value {
                    Some(value) => self.eval_expr(value)?,
                    None => Value::Void,
                };
                Ok(Flow::Return(value))
            }
            Statement::Echo(value) => {
                let value = self.eval_expr(value)?;
                if self.echo_enabled {
                    self.echo_buffer.push(value.to_string());
                }
                self.release_value(value)?;
                Ok(Flow::Normal)
            }
            Statement::Reset(target) => {
                let qubit = self.eval_qubit(target)?;
                self.sim.reset(qubit).map_err(|e| (e, span))?;
                self.last_measured.remove(&qubit);
                Ok(Flow::Normal)
            }
            Statement::Measure(target) => {
                self.measure_expr(target)?;
                Ok(Flow::Normal)
            }
            Statement::Destroy(target) => {
                self.exec_destroy(target)?;
                if let Some(collector) = &self.collector {
                    collector.request();
                }
                Ok(Flow::Normal)
            }
            Statement::VarDecl(decl) => {
                self.exec_var_decl(decl)?;
                Ok(Flow::Normal)
            }
            Statement::Expr(expr) => {
                let value = self.eval_expr(expr)?;
                self.release_value(value)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_var_decl(
        &mut self,
        decl: &crate::ast::VarDecl,
    ) -> UnitResult {
        let ty = self.resolve_type(&decl.ty);
        let tracked = decl
            .annotations
            .iter()
            .any(|a| matches!(a.value(), crate::ast::Annotation::Tracked));
        let value = match &decl.init {
            Some(init) => self.eval_expr(init)?,
            None => self.default_from_type_node(&decl.ty)?,
        };
        self.bind(
            decl.name.value(),
            VarSlot {
                value,
                ty,
                tracked,
            },
        );
        Ok(())
    }

    /// `destroy e`: clear the referenced variable/field/element. A second
    /// destroy of the same reference finds null and is a no-op.
    fn exec_destroy(&mut self, target: &SpanNode<Expr>) -> UnitResult {
        match target.value() {
            Expr::Variable(name) => {
                if self.lookup(name).is_some() {
                    let slot =
                        self.lookup_mut(name).expect("checked just above");
                    let old =
                        std::mem::replace(&mut slot.value, Value::Null);
                    return self.release_value(old);
                }
                // Implicit field of `this` or a static
                self.clear_field_of_this_or_static(name, target)
            }
            Expr::Member { object, member } => {
                let receiver = self.eval_expr(object)?;
                match receiver {
                    Value::Class(class) => {
                        self.clear_static(&class, member.value())
                    }
                    Value::Object { obj, .. } => {
                        self.clear_object_field(&obj, member.value())
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *object.metadata(),
                    )),
                    other => panic!("destroy through {:?}", other),
                }
            }
            Expr::Index { array, index } => {
                let array_value = self.eval_expr(array)?;
                let index_value = self.eval_expr(index)?;
                match array_value {
                    Value::Array(items) => {
                        let i = self.array_index(
                            &items,
                            &index_value,
                            *index.metadata(),
                        )?;
                        let old = std::mem::replace(
                            &mut items.items.borrow_mut()[i],
                            Value::Null,
                        );
                        self.release_value(old)
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *array.metadata(),
                    )),
                    _ => Err((
                        RuntimeError::IndexNonArray,
                        *array.metadata(),
                    )),
                }
            }
            other => panic!("destroy target {:?} not an lvalue", other),
        }
    }

    fn clear_field_of_this_or_static(
        &mut self,
        name: &str,
        target: &SpanNode<Expr>,
    ) -> UnitResult {
        if let Some(Value::Object { obj, .. }) =
            self.lookup("this").map(|slot| slot.value.clone())
        {
            if self
                .classes[&obj.borrow().class]
                .layout
                .iter()
                .any(|f| f.name == name)
            {
                return self.clear_object_field(&obj, name);
            }
        }
        if let Some(class) = self.current_class().map(String::from) {
            return self.clear_static(&class, name);
        }
        panic!("destroy of unresolvable name at {:?}", target.metadata());
    }

    fn clear_object_field(&mut self, obj: &ObjRef, name: &str) -> UnitResult {
        let index = self.classes[&obj.borrow().class]
            .layout
            .iter()
            .position(|f| f.name == name)
            .expect("analysis resolved this field");
        let old = std::mem::replace(
            &mut obj.borrow_mut().fields[index],
            Value::Null,
        );
        self.release_value(old)
    }

    fn clear_static(&mut self, class: &str, name: &str) -> UnitResult {
        let (owner, index) = self
            .find_static_slot(class, name)
            .expect("analysis resolved this static");
        let old = std::mem::replace(
            &mut self.statics.get_mut(&owner).expect("statics seeded")
                [index],
            Value::Null,
        );
        self.release_value(old)
    }

    /// Walk the base chain for a static field slot: (declaring class,
    /// index).
    fn find_static_slot(
        &self,
        class: &str,
        name: &str,
    ) -> Option<(String, usize)> {
        for level in self.registry.base_chain(class) {
            if let Some(index) = level
                .static_fields
                .iter()
                .position(|field| field.name == name)
            {
                return Some((level.name.clone(), index));
            }
        }
        None
    }

    // ===== Expressions =====

    fn eval_expr(&mut self, expr: &SpanNode<Expr>) -> EvalResult {
        let span = *expr.metadata();
        match expr.value() {
            Expr::Literal(literal) => Ok(match literal {
                crate::ast::Literal::Int(v) => Value::Int(*v),
                crate::ast::Literal::Long(v) => Value::Long(*v),
                crate::ast::Literal::Float(v) => Value::Float(*v),
                crate::ast::Literal::Boolean(v) => Value::Boolean(*v),
                crate::ast::Literal::Str(v) => Value::Str(v.clone()),
                crate::ast::Literal::Char(v) => Value::Char(*v),
            }),
            Expr::Null => Ok(Value::Null),
            Expr::This => Ok(self.this_value()),
            Expr::Variable(name) => {
                if let Some(slot) = self.lookup(name) {
                    return Ok(slot.value.clone());
                }
                // Bare class name: a class reference (static receiver)
                if self.registry.classes.contains_key(name) {
                    return Ok(Value::Class(name.clone()));
                }
                // Implicit field of `this`, or a static of the current
                // class hierarchy
                if let Some(Value::Object { obj, .. }) =
                    self.lookup("this").map(|slot| slot.value.clone())
                {
                    let layout_index = self.classes[&obj.borrow().class]
                        .layout
                        .iter()
                        .position(|f| f.name == *name);
                    if let Some(index) = layout_index {
                        return Ok(obj.borrow().fields[index].clone());
                    }
                }
                let class = self
                    .current_class()
                    .map(String::from)
                    .expect("analysis resolved this name");
                let (owner, index) = self
                    .find_static_slot(&class, name)
                    .expect("analysis resolved this name");
                Ok(self.statics[&owner][index].clone())
            }
            Expr::Member { object, member } => {
                let receiver = self.eval_expr(object)?;
                match receiver {
                    Value::Class(class) => {
                        let (owner, index) = self
                            .find_static_slot(&class, member.value())
                            .expect("analysis resolved this static");
                        Ok(self.statics[&owner][index].clone())
                    }
                    Value::Object { obj, .. } => {
                        let index = self.classes[&obj.borrow().class]
                            .layout
                            .iter()
                            .position(|f| f.name == *member.value())
                            .expect("analysis resolved this field");
                        Ok(obj.borrow().fields[index].clone())
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *object.metadata(),
                    )),
                    other => panic!("member access on {:?}", other),
                }
            }
            Expr::Index { array, index } => {
                let array_value = self.eval_expr(array)?;
                let index_value = self.eval_expr(index)?;
                match array_value {
                    Value::Array(items) => {
                        let i = self.array_index(
                            &items,
                            &index_value,
                            *index.metadata(),
                        )?;
                        let value = items.items.borrow()[i].clone();
                        Ok(value)
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *array.metadata(),
                    )),
                    _ => Err((
                        RuntimeError::IndexNonArray,
                        *array.metadata(),
                    )),
                }
            }
            Expr::Call { function, args } => {
                let name = function.value().as_str();
                if GATE_NAMES.contains(&name) {
                    return self.eval_gate(name, args, span);
                }
                self.call_function(name, args)
            }
            Expr::MethodCall {
                object,
                method,
                args,
            } => self.eval_method_call(object, method, args, span),
            Expr::SuperCall { method, args } => {
                self.eval_super_call(method, args, span)
            }
            Expr::SuperConstructor { .. } => {
                panic!("super constructor call outside constructor prologue")
            }
            Expr::New { class, args, .. } => {
                self.eval_new(class.value(), args, span)
            }
            Expr::Assign { target, op, value } => {
                // Left-to-right: the target is read before the value for
                // the compound forms
                let new_value = match op {
                    Some(op) => {
                        let current = self.eval_expr(target)?;
                        let rhs = self.eval_expr(value)?;
                        self.binary_values(*op, current, rhs, span)?
                    }
                    None => self.eval_expr(value)?,
                };
                self.store(target, new_value.clone())?;
                Ok(new_value)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval_expr(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Boolean(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
                        Value::Long(v) => Ok(Value::Long(v.wrapping_neg())),
                        Value::Float(v) => Ok(Value::Float(-v)),
                        Value::Bit(v) => {
                            Ok(Value::Int(-(i32::from(v))))
                        }
                        other => panic!("negating {:?}", other),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                // Short-circuit the logical operators
                match op {
                    BinaryOp::And => {
                        let lhs = self.eval_expr(lhs)?;
                        if !lhs.truthy() {
                            return Ok(Value::Boolean(false));
                        }
                        let rhs = self.eval_expr(rhs)?;
                        Ok(Value::Boolean(rhs.truthy()))
                    }
                    BinaryOp::Or => {
                        let lhs = self.eval_expr(lhs)?;
                        if lhs.truthy() {
                            return Ok(Value::Boolean(true));
                        }
                        let rhs = self.eval_expr(rhs)?;
                        Ok(Value::Boolean(rhs.truthy()))
                    }
                    _ => {
                        let lhs = self.eval_expr(lhs)?;
                        let rhs = self.eval_expr(rhs)?;
                        self.binary_values(*op, lhs, rhs, span)
                    }
                }
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval_expr(condition)?.truthy() {
                    self.eval_expr(then_expr)
                } else {
                    self.eval_expr(else_expr)
                }
            }
            Expr::Postfix { op, target } => {
                let current = self.eval_expr(target)?;
                let updated = match (&current, op) {
                    (Value::Int(v), PostfixOp::Inc) => {
                        Value::Int(v.wrapping_add(1))
                    }
                    (Value::Int(v), PostfixOp::Dec) => {
                        Value::Int(v.wrapping_sub(1))
                    }
                    (Value::Long(v), PostfixOp::Inc) => {
                        Value::Long(v.wrapping_add(1))
                    }
                    (Value::Long(v), PostfixOp::Dec) => {
                        Value::Long(v.wrapping_sub(1))
                    }
                    (other, _) => panic!("postfix on {:?}", other),
                };
                self.store(target, updated)?;
                Ok(current)
            }
            Expr::Cast { ty, expr: inner } => {
                let value = self.eval_expr(inner)?;
                let target = self.resolve_type(ty);
                self.cast_value(value, &target, span)
            }
            Expr::Measure(target) => self.measure_expr(target),
            Expr::ArrayLiteral(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expr(element)?);
                }
                let element_ty = values
                    .first()
                    .map(runtime_type_of)
                    .unwrap_or_else(TypeInfo::unknown);
                Ok(Value::Array(ArrayValue::new(element_ty, values)))
            }
        }
    }

    fn array_index(
        &self,
        array: &Rc<ArrayValue>,
        index: &Value,
        span: Span,
    ) -> Result<usize, (RuntimeError, Span)> {
        let index = match index {
            Value::Int(v) => i64::from(*v),
            Value::Long(v) => *v,
            other => panic!("array index {:?}", other),
        };
        let length = array.items.borrow().len();
        if index < 0 || index as usize >= length {
            return Err((
                RuntimeError::IndexOutOfBounds { index, length },
                span,
            ));
        }
        Ok(index as usize)
    }

    // ===== Calls =====

    fn eval_args(
        &mut self,
        args: &[SpanNode<Expr>],
    ) -> Result<Vec<Value>, (RuntimeError, Span)> {
        args.iter().map(|arg| self.eval_expr(arg)).collect()
    }

    fn eval_gate(
        &mut self,
        name: &str,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> EvalResult {
        match name {
            "h" | "x" | "y" | "z" => {
                let qubit = self.eval_qubit(&args[0])?;
                let result = match name {
                    "h" => self.sim.h(qubit),
                    "x" => self.sim.x(qubit),
                    "y" => self.sim.y(qubit),
                    _ => self.sim.z(qubit),
                };
                result.map_err(|e| (e, span))?;
            }
            "rx" | "ry" | "rz" => {
                let qubit = self.eval_qubit(&args[0])?;
                let theta = match self.eval_expr(&args[1])? {
                    Value::Float(theta) => theta,
                    other => panic!("rotation angle {:?}", other),
                };
                let result = match name {
                    "rx" => self.sim.rx(qubit, theta),
                    "ry" => self.sim.ry(qubit, theta),
                    _ => self.sim.rz(qubit, theta),
                };
                result.map_err(|e| (e, span))?;
            }
            "cx" => {
                let control = self.eval_qubit(&args[0])?;
                let target = self.eval_qubit(&args[1])?;
                self.sim.cx(control, target).map_err(|e| (e, span))?;
            }
            other => panic!("unknown gate {}", other),
        }
        Ok(Value::Void)
    }

    fn eval_qubit(
        &mut self,
        expr: &SpanNode<Expr>,
    ) -> Result<usize, (RuntimeError, Span)> {
        match self.eval_expr(expr)? {
            Value::Qubit(qubit) => Ok(qubit),
            other => panic!("expected qubit, got {:?}", other),
        }
    }

    fn measure_expr(&mut self, target: &SpanNode<Expr>) -> EvalResult {
        let span = *target.metadata();
        let qubit = self.eval_qubit(target)?;
        let bit = self.sim.measure(qubit).map_err(|e| (e, span))?;
        self.last_measured.insert(qubit, bit);
        self.measurements.push(bit);
        Ok(Value::Bit(bit))
    }

    fn call_function(
        &mut self,
        name: &str,
        args: &[SpanNode<Expr>],
    ) -> EvalResult {
        let arg_values = self.eval_args(args)?;
        let info = self.registry.functions[name].clone();
        let program = Rc::clone(&self.program);
        let decl = match program.items[info.item_index].value() {
            Item::Function(function) => function,
            _ => panic!("function item expected"),
        };
        self.push_frame(None);
        for ((param_name, param_ty), value) in info
            .param_names
            .iter()
            .zip(&info.params)
            .zip(arg_values)
        {
            self.bind(
                param_name,
                VarSlot {
                    value,
                    ty: param_ty.clone(),
                    tracked: false,
                },
            );
        }
        let flow = self.exec_block(decl.body.value())?;
        self.pop_frame()?;
        Ok(match flow {
            Flow::Return(value) => value,
            Flow::Normal => Value::Void,
        })
    }

    /// Erasure substitution for runtime overload resolution: every type
    /// parameter is replaced by its bound (or the root class).
    fn erasure_subst(&self, class: &str) -> HashMap<String, TypeInfo> {
        self.registry.classes[class]
            .type_params
            .iter()
            .map(|param| {
                let replacement = param
                    .bound
                    .clone()
                    .unwrap_or_else(|| TypeInfo::class(OBJECT_CLASS, vec![]));
                (param.name.clone(), replacement)
            })
            .collect()
    }

    fn eval_method_call(
        &mut self,
        object: &SpanNode<Expr>,
        method: &SpanNode<String>,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> EvalResult {
        let receiver = self.eval_expr(object)?;
        let arg_values = self.eval_args(args)?;
        let arg_types: Vec<TypeInfo> =
            arg_values.iter().map(runtime_type_of).collect();

        match receiver {
            Value::Class(class) => {
                let subst = self.erasure_subst(&class);
                let resolved = self
                    .registry
                    .resolve_method_call(
                        &class,
                        method.value(),
                        &arg_types,
                        &subst,
                    )
                    .map_err(|failure| {
                        runtime_resolve_error(failure, method.value(), span)
                    })?;
                self.invoke_method(
                    None,
                    &resolved.info.defined_in.clone(),
                    resolved.info.member_index,
                    arg_values,
                )
            }
            Value::Object { obj, class } => {
                // Static resolution against the declared class, then
                // virtual re-dispatch through the dynamic class's vtable
                let subst = self.erasure_subst(&class);
                let resolved = self
                    .registry
                    .resolve_method_call(
                        &class,
                        method.value(),
                        &arg_types,
                        &subst,
                    )
                    .map_err(|failure| {
                        runtime_resolve_error(failure, method.value(), span)
                    })?;
                let (impl_class, member_index) =
                    if resolved.info.is_virtual() {
                        let signature = resolved.info.signature();
                        let dynamic = obj.borrow().class.clone();
                        let slot = self.classes[&class].vslots[&signature];
                        self.classes[&dynamic].vtable[slot].clone()
                    } else {
                        (
                            resolved.info.defined_in.clone(),
                            resolved.info.member_index,
                        )
                    };
                let this = Value::Object {
                    obj,
                    class: impl_class.clone(),
                };
                self.invoke_method(
                    Some(this),
                    &impl_class,
                    member_index,
                    arg_values,
                )
            }
            Value::Null => {
                Err((RuntimeError::NullReference, *object.metadata()))
            }
            other => panic!("method call on {:?}", other),
        }
    }

    fn eval_super_call(
        &mut self,
        method: &SpanNode<String>,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> EvalResult {
        let this = self.this_value();
        let current = self
            .current_class()
            .map(String::from)
            .expect("super outside class context");
        let base = self.registry.classes[&current]
            .base
            .clone()
            .expect("analysis guarantees a base");
        let arg_values = self.eval_args(args)?;
        let arg_types: Vec<TypeInfo> =
            arg_values.iter().map(runtime_type_of).collect();
        let subst = self.erasure_subst(&base);
        // `super.m(...)` forces non-virtual dispatch from the base class
        let resolved = self
            .registry
            .resolve_method_call(&base, method.value(), &arg_types, &subst)
            .map_err(|failure| {
                runtime_resolve_error(failure, method.value(), span)
            })?;
        let this = match this {
            Value::Object { obj, .. } => Value::Object {
                obj,
                class: resolved.info.defined_in.clone(),
            },
            other => panic!("super with this = {:?}", other),
        };
        self.invoke_method(
            Some(this),
            &resolved.info.defined_in.clone(),
            resolved.info.member_index,
            arg_values,
        )
    }

    fn invoke_method(
        &mut self,
        this: Option<Value>,
        class: &str,
        member_index: usize,
        args: Vec<Value>,
    ) -> EvalResult {
        let program = Rc::clone(&self.program);
        let item = self.class_item_index(class);
        let decl = match program.items[item].value() {
            Item::Class(decl) => match decl.members[member_index].value() {
                Member::Method(method) => method,
                _ => panic!("member {} of {} is not a method", member_index, class),
            },
            _ => panic!("class item expected"),
        };
        let info = self.registry.classes[class]
            .methods
            .values()
            .flatten()
            .find(|m| m.member_index == member_index)
            .expect("method in registry")
            .clone();
        let body = decl
            .body
            .as_ref()
            .expect("abstract methods are never invoked")
            .clone();

        self.push_frame(Some(class.into()));
        if let Some(this) = this {
            self.bind(
                "this",
                VarSlot {
                    value: this,
                    ty: TypeInfo::class(class, vec![]),
                    tracked: false,
                },
            );
        }
        for ((param_name, param_ty), value) in
            info.param_names.iter().zip(&info.params).zip(args)
        {
            self.bind(
                param_name,
                VarSlot {
                    value,
                    ty: param_ty.clone(),
                    tracked: false,
                },
            );
        }
        let flow = self.exec_block(body.value())?;
        self.pop_frame()?;
        Ok(match flow {
            Flow::Return(value) => value,
            Flow::Normal => Value::Void,
        })
    }

    // ===== Instantiation and destruction =====

    fn eval_new(
        &mut self,
        class: &str,
        args: &[SpanNode<Expr>],
        span: Span,
    ) -> EvalResult {
        let arg_values = self.eval_args(args)?;
        let arg_types: Vec<TypeInfo> =
            arg_values.iter().map(runtime_type_of).collect();
        let info = self.registry.classes[class].clone();
        let subst = self.erasure_subst(class);
        let resolved = self
            .registry
            .resolve_constructor(&info, &arg_types, &subst)
            .map_err(|_| {
                // Semantic analysis rules ambiguity out; guard anyway
                (
                    RuntimeError::AmbiguousOverload {
                        name: class.into(),
                    },
                    span,
                )
            })?;

        let obj = self.allocate_object(class)?;
        self.heap.register(&obj);
        self.run_constructor(&obj, class, &resolved, arg_values)?;
        // The value's className is the static type: the class named by
        // `new`
        Ok(Value::Object {
            obj,
            class: class.into(),
        })
    }

    /// Allocate an object with type-appropriate zero values in every slot.
    fn allocate_object(&mut self, class: &str) -> Result<ObjRef, (RuntimeError, Span)> {
        let layout = self.classes[class].layout.clone();
        let mut fields = Vec::with_capacity(layout.len());
        for field in &layout {
            let decl = self.field_decl(&field.declared_in, field.member_index);
            self.push_frame(Some(field.declared_in.clone()));
            let default = self.default_from_type_node(&decl.ty);
            self.pop_frame()?;
            fields.push(default?);
        }
        Ok(Rc::new(RefCell::new(Object::new(class.into(), fields))))
    }

    /// Type-appropriate zero value. Qubit slots allocate a fresh qubit;
    /// fixed-size arrays are built from their declared size.
    fn default_from_type_node(
        &mut self,
        node: &SpanNode<TypeNode>,
    ) -> EvalResult {
        match node.value() {
            TypeNode::Primitive(primitive) => Ok(match primitive {
                Primitive::Int => Value::Int(0),
                Primitive::Long => Value::Long(0),
                Primitive::Float => Value::Float(0.0),
                Primitive::Bit => Value::Bit(0),
                Primitive::Boolean => Value::Boolean(false),
                Primitive::Str => Value::Str(String::new()),
                Primitive::Char => Value::Char('\0'),
                Primitive::Qubit => {
                    Value::Qubit(self.sim.allocate_qubit())
                }
                other => panic!("no default for {:?}", other),
            }),
            TypeNode::Named { .. } => Ok(Value::Null),
            TypeNode::Array { element, size } => {
                let element_ty = self.resolve_type(element);
                let length = match size {
                    Some(size_expr) => {
                        let size_span = *size_expr.metadata();
                        let value = self.eval_expr(size_expr)?;
                        let size = match value {
                            Value::Int(v) => i64::from(v),
                            Value::Long(v) => v,
                            other => panic!("array size {:?}", other),
                        };
                        if size < 0 {
                            return Err((
                                RuntimeError::NegativeArraySize { size },
                                size_span,
                            ));
                        }
                        size as usize
                    }
                    None => 0,
                };
                let mut items = Vec::with_capacity(length);
                for _ in 0..length {
                    items.push(self.default_from_type_node(element)?);
                }
                Ok(Value::Array(ArrayValue::new(element_ty, items)))
            }
        }
    }

    /// Run the constructor chain for one level. Order per level: base
    /// constructor first (explicit `super(...)` or the implicit zero-arg
    /// one), then this level's field initializers, then the body.
    fn run_constructor(
        &mut self,
        obj: &ObjRef,
        class: &str,
        resolved: &ResolvedCtor,
        args: Vec<Value>,
    ) -> UnitResult {
        let info: &CtorInfo = &resolved.info;
        if info.member_index == usize::MAX {
            // The implicit root constructor: nothing to run
            return Ok(());
        }
        let program = Rc::clone(&self.program);
        let item = self.class_item_index(class);
        let decl = match program.items[item].value() {
            Item::Class(decl) => {
                match decl.members[info.member_index].value() {
                    Member::Constructor(ctor) => ctor,
                    _ => panic!("constructor member expected"),
                }
            }
            _ => panic!("class item expected"),
        };
        let base = self.registry.classes[class].base.clone();

        self.push_frame(Some(class.into()));
        self.bind(
            "this",
            VarSlot {
                value: Value::Object {
                    obj: Rc::clone(obj),
                    class: class.into(),
                },
                ty: TypeInfo::class(class, vec![]),
                tracked: false,
            },
        );
        let param_names = info.param_names.clone();
        let param_types = resolved.params.clone();
        for ((param_name, param_ty), value) in
            param_names.iter().zip(&param_types).zip(args)
        {
            self.bind(
                param_name,
                VarSlot {
                    value,
                    ty: param_ty.clone(),
                    tracked: false,
                },
            );
        }

        let result = (|| -> UnitResult {
            match &decl.body {
                CtorBody::Default => {
                    self.invoke_implicit_base_ctor(obj, &base)?;
                    self.run_field_initializers(obj, class)?;
                    // Bind each parameter to its same-named field
                    let layout = self.classes[class].layout.clone();
                    for param_name in &param_names {
                        let index = layout
                            .iter()
                            .position(|f| &f.name == param_name)
                            .expect("analysis matched fields");
                        let value = self
                            .lookup(param_name)
                            .expect("parameter bound")
                            .value
                            .clone();
                        let old = std::mem::replace(
                            &mut obj.borrow_mut().fields[index],
                            value,
                        );
                        self.release_value(old)?;
                    }
                    Ok(())
                }
                CtorBody::Block(body) => {
                    let statements = &body.value().statements;
                    let mut rest = &statements[..];
                    let mut explicit_super = false;
                    if let Some(first) = statements.first() {
                        if let Statement::Expr(expr) = first.value() {
                            if let Expr::SuperConstructor { args } =
                                expr.value()
                            {
                                let base_name = base
                                    .as_ref()
                                    .expect("analysis checked the base");
                                let super_args = self.eval_args(args)?;
                                let super_types: Vec<TypeInfo> = super_args
                                    .iter()
                                    .map(runtime_type_of)
                                    .collect();
                                let base_info =
                                    self.registry.classes[base_name].clone();
                                let base_resolved = self
                                    .registry
                                    .resolve_constructor(
                                        &base_info,
                                        &super_types,
                                        &HashMap::new(),
                                    )
                                    .map_err(|_| {
                                        (
                                            RuntimeError::AmbiguousOverload {
                                                name: base_name.clone(),
                                            },
                                            *expr.metadata(),
                                        )
                                    })?;
                                self.run_constructor(
                                    obj,
                                    base_name,
                                    &base_resolved,
                                    super_args,
                                )?;
                                explicit_super = true;
                                rest = &statements[1..];
                            }
                        }
                    }
                    if !explicit_super {
                        self.invoke_implicit_base_ctor(obj, &base)?;
                    }
                    self.run_field_initializers(obj, class)?;
                    for statement in rest {
                        let flow = self.exec_statement(statement)?;
                        if !matches!(flow, Flow::Normal) {
                            break;
                        }
                    }
                    Ok(())
                }
            }
        })();
        self.pop_frame()?;
        result
    }

    fn invoke_implicit_base_ctor(
        &mut self,
        obj: &ObjRef,
        base: &Option<String>,
    ) -> UnitResult {
        let base = match base {
            Some(base) => base,
            None => return Ok(()),
        };
        let base_info = self.registry.classes[base].clone();
        let resolved = self
            .registry
            .resolve_constructor(&base_info, &[], &HashMap::new())
            .expect("analysis checked the zero-arg base constructor");
        self.run_constructor(obj, base, &resolved, Vec::new())
    }

    /// Evaluate this level's own field initializers into the object.
    fn run_field_initializers(
        &mut self,
        obj: &ObjRef,
        class: &str,
    ) -> UnitResult {
        let layout = self.classes[class].layout.clone();
        for (index, field) in layout.iter().enumerate() {
            if field.declared_in != class || !field.has_init {
                continue;
            }
            let decl = self.field_decl(class, field.member_index);
            let init = decl.init.expect("layout says initializer");
            let value = self.eval_expr(&init)?;
            let old =
                std::mem::replace(&mut obj.borrow_mut().fields[index], value);
            self.release_value(old)?;
        }
        Ok(())
    }

    /// Release a value that's leaving its last strong holder. Objects run
    /// their destructor chain; arrays cascade into their elements.
    fn release_value(&mut self, value: Value) -> UnitResult {
        match value {
            Value::Object { obj, .. } => {
                if Rc::strong_count(&obj) == 1 {
                    self.destroy_object(obj)?;
                }
            }
            Value::Array(array) => {
                if Rc::strong_count(&array) == 1 {
                    let items = array.items.replace(Vec::new());
                    for item in items {
                        self.release_value(item)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Run destruction for an object: user destructors derived-first (and
    /// not at all when the collector decided so), tracked-outcome
    /// aggregation, qubit retirement, then field teardown.
    fn destroy_object(&mut self, obj: ObjRef) -> UnitResult {
        {
            let mut borrowed = obj.borrow_mut();
            if borrowed.destroyed {
                return Ok(());
            }
            borrowed.destroyed = true;
        }
        let dynamic = obj.borrow().class.clone();
        let skip = obj.borrow().skip_destructor;

        if !skip {
            // Derived-first: walk the chain from the dynamic class down
            let chain: Vec<String> = self
                .registry
                .base_chain(&dynamic)
                .map(|class| class.name.clone())
                .collect();
            for level in chain {
                let dtor_index =
                    match self.registry.classes[&level].destructor {
                        Some(index) => index,
                        None => continue,
                    };
                let program = Rc::clone(&self.program);
                let item = self.class_item_index(&level);
                let body = match program.items[item].value() {
                    Item::Class(decl) => {
                        match decl.members[dtor_index].value() {
                            Member::Destructor(dtor) => dtor.body.clone(),
                            _ => panic!("destructor member expected"),
                        }
                    }
                    _ => panic!("class item expected"),
                };
                self.push_frame(Some(level.clone()));
                self.bind(
                    "this",
                    VarSlot {
                        value: Value::Object {
                            obj: Rc::clone(&obj),
                            class: level.clone(),
                        },
                        ty: TypeInfo::class(level.clone(), vec![]),
                        tracked: false,
                    },
                );
                let result = self.exec_block(body.value());
                self.pop_frame()?;
                result?;
            }
        }

        // Tracked fields contribute their outcomes, owned qubits are
        // retired, and the field vector is torn down
        let layout = self.classes[&dynamic].layout.clone();
        let fields = std::mem::take(&mut obj.borrow_mut().fields);
        for (field, value) in layout.iter().zip(fields) {
            if field.tracked {
                self.aggregate_tracked(&field.ty, &field.name, &value);
            }
            self.retire_qubits(&value);
            self.release_value(value)?;
        }
        Ok(())
    }

    /// Reset and bar further gates on every qubit owned by this value.
    fn retire_qubits(&mut self, value: &Value) {
        match value {
            Value::Qubit(qubit) => self.sim.retire(*qubit),
            Value::Array(array) => {
                let items = array.items.borrow();
                for item in items.iter() {
                    if let Value::Qubit(qubit) = item {
                        self.sim.retire(*qubit);
                    }
                }
            }
            _ => {}
        }
    }

    // ===== Tracked outcomes =====

    /// One histogram entry per tracked qubit/qubit-array, keyed by
    /// "<type> <name>". Tracked non-quantum variables are not aggregated.
    fn aggregate_tracked(&mut self, ty: &TypeInfo, name: &str, value: &Value) {
        let outcome = match value {
            Value::Qubit(qubit) => match self.last_measured.get(qubit) {
                Some(bit) => bit.to_string(),
                None => "?".into(),
            },
            Value::Array(array) => {
                let items = array.items.borrow();
                let mut bits = String::with_capacity(items.len());
                let mut complete = !items.is_empty();
                for item in items.iter() {
                    match item {
                        Value::Qubit(qubit) => {
                            match self.last_measured.get(qubit) {
                                Some(bit) => {
                                    bits.push_str(&bit.to_string())
                                }
                                None => {
                                    complete = false;
                                    break;
                                }
                            }
                        }
                        _ => return,
                    }
                }
                if complete {
                    bits
                } else {
                    "?".into()
                }
            }
            _ => return,
        };
        let label = format!("{} {}", ty, name);
        *self
            .tracked_counts
            .entry(label)
            .or_insert_with(HashMap::new)
            .entry(outcome)
            .or_insert(0) += 1;
    }

    // ===== Stores =====

    /// Write a value into an assignment target, releasing whatever it
    /// overwrites.
    fn store(&mut self, target: &SpanNode<Expr>, value: Value) -> UnitResult {
        match target.value() {
            Expr::Variable(name) => {
                if self.lookup(name).is_some() {
                    let slot =
                        self.lookup_mut(name).expect("checked just above");
                    let old = std::mem::replace(&mut slot.value, value);
                    return self.release_value(old);
                }
                // Implicit field of `this`, or a static
                if let Some(Value::Object { obj, .. }) =
                    self.lookup("this").map(|slot| slot.value.clone())
                {
                    let dynamic = obj.borrow().class.clone();
                    let layout_index = self.classes[&dynamic]
                        .layout
                        .iter()
                        .position(|f| f.name == *name);
                    if let Some(index) = layout_index {
                        let old = std::mem::replace(
                            &mut obj.borrow_mut().fields[index],
                            value,
                        );
                        return self.release_value(old);
                    }
                }
                let class = self
                    .current_class()
                    .map(String::from)
                    .expect("analysis resolved this name");
                let (owner, index) = self
                    .find_static_slot(&class, name)
                    .expect("analysis resolved this name");
                let old = std::mem::replace(
                    &mut self
                        .statics
                        .get_mut(&owner)
                        .expect("statics seeded")[index],
                    value,
                );
                self.release_value(old)
            }
            Expr::Member { object, member } => {
                let receiver = self.eval_expr(object)?;
                match receiver {
                    Value::Class(class) => {
                        let (owner, index) = self
                            .find_static_slot(&class, member.value())
                            .expect("analysis resolved this static");
                        let old = std::mem::replace(
                            &mut self
                                .statics
                                .get_mut(&owner)
                                .expect("statics seeded")[index],
                            value,
                        );
                        self.release_value(old)
                    }
                    Value::Object { obj, .. } => {
                        let dynamic = obj.borrow().class.clone();
                        let index = self.classes[&dynamic]
                            .layout
                            .iter()
                            .position(|f| f.name == *member.value())
                            .expect("analysis resolved this field");
                        let old = std::mem::replace(
                            &mut obj.borrow_mut().fields[index],
                            value,
                        );
                        self.release_value(old)
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *object.metadata(),
                    )),
                    other => panic!("member store on {:?}", other),
                }
            }
            Expr::Index { array, index } => {
                let array_value = self.eval_expr(array)?;
                let index_value = self.eval_expr(index)?;
                match array_value {
                    Value::Array(items) => {
                        let i = self.array_index(
                            &items,
                            &index_value,
                            *index.metadata(),
                        )?;
                        // Element assignments are type-checked at runtime:
                        // the static type of an array slot can be wider
                        // than its element type
                        let actual = runtime_type_of(&value);
                        if !self
                            .registry
                            .is_assignable(&items.element, &actual)
                            && !items.element.is_unknown()
                            && !items.element.is_type_param
                        {
                            return Err((
                                RuntimeError::ArrayElementType {
                                    expected: items.element.to_string(),
                                    actual: actual.to_string(),
                                },
                                *target.metadata(),
                            ));
                        }
                        let old = std::mem::replace(
                            &mut items.items.borrow_mut()[i],
                            value,
                        );
                        self.release_value(old)
                    }
                    Value::Null => Err((
                        RuntimeError::NullReference,
                        *array.metadata(),
                    )),
                    _ => Err((
                        RuntimeError::IndexNonArray,
                        *array.metadata(),
                    )),
                }
            }
            other => panic!("store target {:?} not an lvalue", other),
        }
    }

    // ===== Operators =====

    fn cast_value(
        &self,
        value: Value,
        target: &TypeInfo,
        span: Span,
    ) -> EvalResult {
        let as_f64 = |v: &Value| match v {
            Value::Int(v) => f64::from(*v),
            Value::Long(v) => *v as f64,
            Value::Float(v) => *v,
            Value::Bit(v) => f64::from(*v),
            _ => f64::NAN,
        };
        let as_i64 = |v: &Value| match v {
            Value::Int(v) => i64::from(*v),
            Value::Long(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Bit(v) => i64::from(*v),
            _ => 0,
        };
        let castable = matches!(
            value,
            Value::Int(_) | Value::Long(_) | Value::Float(_) | Value::Bit(_)
        );
        if !castable {
            return Err((
                RuntimeError::InvalidCast {
                    from: runtime_type_of(&value).to_string(),
                    to: target.to_string(),
                },
                span,
            ));
        }
        Ok(match target.primitive {
            Primitive::Int => Value::Int(as_i64(&value) as i32),
            Primitive::Long => Value::Long(as_i64(&value)),
            Primitive::Float => Value::Float(as_f64(&value)),
            Primitive::Bit => {
                Value::Bit(if as_i64(&value) != 0 { 1 } else { 0 })
            }
            _ => {
                return Err((
                    RuntimeError::InvalidCast {
                        from: runtime_type_of(&value).to_string(),
                        to: target.to_string(),
                    },
                    span,
                ))
            }
        })
    }

    fn binary_values(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        span: Span,
    ) -> EvalResult {
        use BinaryOp::*;

        // String concatenation
        if op == Add
            && (matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)))
        {
            return Ok(Value::Str(format!("{}{}", lhs, rhs)));
        }

        // Bitwise on bits and bit arrays
        if matches!(op, BitAnd | BitOr | BitXor) {
            return self.bitwise_values(op, lhs, rhs, span);
        }

        if matches!(op, Eq | Neq) {
            let equal = values_equal(&lhs, &rhs);
            return Ok(Value::Boolean(if op == Eq { equal } else { !equal }));
        }

        // Character ordering, before the numeric promotion path
        if let (Value::Char(l), Value::Char(r)) = (&lhs, &rhs) {
            return Ok(Value::Boolean(match op {
                Lt => l < r,
                Lte => l <= r,
                Gt => l > r,
                Gte => l >= r,
                other => panic!("char operator {:?}", other),
            }));
        }

        // Numeric promotion: any float -> float, else any long -> long,
        // else int (bit promotes to int)
        let is_float =
            matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_));
        let is_long =
            matches!(lhs, Value::Long(_)) || matches!(rhs, Value::Long(_));

        if is_float {
            let l = to_f64(&lhs);
            let r = to_f64(&rhs);
            return match op {
                Add => Ok(Value::Float(l + r)),
                Sub => Ok(Value::Float(l - r)),
                Mul => Ok(Value::Float(l * r)),
                Div => {
                    if r == 0.0 {
                        Err((RuntimeError::DivideByZero, span))
                    } else {
                        Ok(Value::Float(l / r))
                    }
                }
                Lt => Ok(Value::Boolean(l < r)),
                Lte => Ok(Value::Boolean(l <= r)),
                Gt => Ok(Value::Boolean(l > r)),
                Gte => Ok(Value::Boolean(l >= r)),
                other => panic!("float operator {:?}", other),
            };
        }

        let l = to_i64(&lhs);
        let r = to_i64(&rhs);
        let wrap = |v: i64| {
            if is_long {
                Value::Long(v)
            } else {
                Value::Int(v as i32)
            }
        };
        match op {
            Add => Ok(wrap(l.wrapping_add(r))),
            Sub => Ok(wrap(l.wrapping_sub(r))),
            Mul => Ok(wrap(l.wrapping_mul(r))),
            Div => {
                if r == 0 {
                    Err((RuntimeError::DivideByZero, span))
                } else {
                    Ok(wrap(l.wrapping_div(r)))
                }
            }
            Mod => {
                if r == 0 {
                    Err((RuntimeError::DivideByZero, span))
                } else {
                    Ok(wrap(l.wrapping_rem(r)))
                }
            }
            Lt => Ok(Value::Boolean(l < r)),
            Lte => Ok(Value::Boolean(l <= r)),
            Gt => Ok(Value::Boolean(l > r)),
            Gte => Ok(Value::Boolean(l >= r)),
            other => panic!("integer operator {:?}", other),
        }
    }

    fn bitwise_values(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        span: Span,
    ) -> EvalResult {
        let apply = |op: BinaryOp, l: u8, r: u8| match op {
            BinaryOp::BitAnd => l & r,
            BinaryOp::BitOr => l | r,
            BinaryOp::BitXor => l ^ r,
            other => panic!("bitwise operator {:?}", other),
        };
        match (lhs, rhs) {
            (Value::Bit(l), Value::Bit(r)) => {
                Ok(Value::Bit(apply(op, l, r)))
            }
            (Value::Array(l), Value::Array(r)) => {
                let left = l.items.borrow();
                let right = r.items.borrow();
                if left.len() != right.len() {
                    return Err((
                        RuntimeError::BitArrayLength {
                            lhs: left.len(),
                            rhs: right.len(),
                        },
                        span,
                    ));
                }
                let items: Vec<Value> = left
                    .iter()
                    .zip(right.iter())
                    .map(|(l, r)| match (l, r) {
                        (Value::Bit(l), Value::Bit(r)) => {
                            Value::Bit(apply(op, *l, *r))
                        }
                        other => panic!("bitwise on {:?}", other),
                    })
                    .collect();
                Ok(Value::Array(ArrayValue::new(
                    TypeInfo::primitive(Primitive::Bit),
                    items,
                )))
            }
            other => panic!("bitwise on {:?}", other),
        }
    }

    // ===== Cycle collection =====

    /// Mark-and-sweep over the weak heap list. Roots are every environment
    /// slot and every static storage slot. Unmarked objects with no
    /// tracked fields (transitively) get their destructor skipped and
    /// their fields cleared, which breaks reference cycles; unmarked
    /// objects *with* tracked fields are retained so their outcomes still
    /// aggregate at program end.
    fn collect_cycles(&mut self) {
        let live = self.heap.live();
        if live.is_empty() {
            return;
        }
        for obj in &live {
            obj.borrow_mut().marked = false;
        }

        let mut roots: Vec<Value> = Vec::new();
        for frame in &self.frames {
            for scope in &frame.scopes {
                for (_, slot) in &scope.vars {
                    roots.push(slot.value.clone());
                }
            }
        }
        for storage in self.statics.values() {
            roots.extend(storage.iter().cloned());
        }
        for root in &roots {
            mark_value(root);
        }

        for obj in &live {
            let (marked, class) = {
                let borrowed = obj.borrow();
                (borrowed.marked, borrowed.class.clone())
            };
            if marked || self.classes[&class].has_tracked_fields {
                continue;
            }
            let mut borrowed = obj.borrow_mut();
            borrowed.skip_destructor = true;
            let fields = std::mem::take(&mut borrowed.fields);
            drop(borrowed);
            // Dropping the fields severs the cycle; the objects they
            // referenced free once their last holder goes away
            drop(fields);
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }
    }
}

// ===== Free helpers =====

/// Mark every object reachable from this value.
fn mark_value(value: &Value) {
    match value {
        Value::Object { obj, .. } => {
            {
                let mut borrowed = obj.borrow_mut();
                if borrowed.marked {
                    return;
                }
                borrowed.marked = true;
            }
            let children: Vec<Value> = obj.borrow().fields.clone();
            for child in &children {
                mark_value(child);
            }
        }
        Value::Array(array) => {
            let items: Vec<Value> = array.items.borrow().clone();
            for item in &items {
                mark_value(item);
            }
        }
        _ => {}
    }
}

/// The runtime type of a value, with generic arguments erased.
fn runtime_type_of(value: &Value) -> TypeInfo {
    match value {
        Value::Int(_) => TypeInfo::primitive(Primitive::Int),
        Value::Long(_) => TypeInfo::primitive(Primitive::Long),
        Value::Float(_) => TypeInfo::primitive(Primitive::Float),
        Value::Bit(_) => TypeInfo::primitive(Primitive::Bit),
        Value::Boolean(_) => TypeInfo::primitive(Primitive::Boolean),
        Value::Str(_) => TypeInfo::primitive(Primitive::Str),
        Value::Char(_) => TypeInfo::primitive(Primitive::Char),
        Value::Qubit(_) => TypeInfo::primitive(Primitive::Qubit),
        Value::Array(array) => TypeInfo::array(array.element.clone()),
        Value::Object { class, .. } => TypeInfo::class(class.clone(), vec![]),
        Value::Class(name) => TypeInfo::class(name.clone(), vec![]),
        Value::Null => TypeInfo::primitive(Primitive::Null),
        Value::Void => TypeInfo::primitive(Primitive::Void),
    }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Int(v) => f64::from(*v),
        Value::Long(v) => *v as f64,
        Value::Float(v) => *v,
        Value::Bit(v) => f64::from(*v),
        other => panic!("numeric value expected, got {:?}", other),
    }
}

fn to_i64(value: &Value) -> i64 {
    match value {
        Value::Int(v) => i64::from(*v),
        Value::Long(v) => *v,
        Value::Bit(v) => i64::from(*v),
        other => panic!("integer value expected, got {:?}", other),
    }
}

/// Runtime equality. Objects compare by identity; null only equals null.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Null, Value::Object { .. })
        | (Value::Object { .. }, Value::Null) => false,
        (Value::Object { obj: l, .. }, Value::Object { obj: r, .. }) => {
            Rc::ptr_eq(l, r)
        }
        (Value::Str(l), Value::Str(r)) => l == r,
        (Value::Char(l), Value::Char(r)) => l == r,
        (Value::Boolean(l), Value::Boolean(r)) => l == r,
        (Value::Qubit(l), Value::Qubit(r)) => l == r,
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            to_f64(lhs) == to_f64(rhs)
        }
        _ => to_i64(lhs) == to_i64(rhs),
    }
}

fn runtime_resolve_error(
    failure: ResolveFailure,
    name: &str,
    span: Span,
) -> (RuntimeError, Span) {
    // Semantic analysis rules all three cases out; the guard stays because
    // runtime resolution works on erased types
    let _ = failure;
    (
        RuntimeError::AmbiguousOverload { name: name.into() },
        span,
    )
}
