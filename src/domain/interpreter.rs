//! Tree-walking interpreter over a validated [`Program`].
//!
//! One `Interpreter` is one evaluation scope: it is created per (script, row)
//! call, owns every value the script creates and is dropped afterwards. The
//! wall-clock deadline is checked at statements, loop iterations,
//! comprehension steps and calls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use crate::domain::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, Constant, ExceptHandler, Expr, ExprKind, FunctionDef,
    Param, Program, Stmt, StmtKind, Target,
};
use crate::domain::builtins;
use crate::domain::capability::{Capability, CapabilityRegistry, ExcType};
use crate::domain::sandbox_config::SandboxConfig;
use crate::domain::subscript::{self, SliceSpec};
use crate::domain::value::{
    binary_op, unary_op, Dict, Exception, Frame, Function, FunctionCode, RangeValue, Set, Value,
    Vars,
};

/// Statements executed between two clock reads.
const DEADLINE_STRIDE: u32 = 64;

/// Why execution stopped early.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// A script-level exception; catchable by `try`.
    Exception(Exception),
    /// The deadline passed. Never catchable by the script.
    Timeout,
}

impl From<Exception> for Interrupt {
    fn from(e: Exception) -> Self {
        Interrupt::Exception(e)
    }
}

pub type Exec<T> = Result<T, Interrupt>;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Name resolution context of the code being executed.
#[derive(Clone, Default)]
struct Env {
    /// Enclosing function and comprehension frames, innermost last.
    frames: Vec<Frame>,
    /// Function whose `global` declarations apply.
    function: Option<Arc<FunctionDef>>,
}

impl Env {
    fn declares_global(&self, name: &str) -> bool {
        self.function
            .as_ref()
            .is_some_and(|f| f.globals.iter().any(|g| g == name))
    }
}

/// Items of an iterable. Ranges are produced lazily so a long `for` loop
/// runs into the deadline instead of the collection limit.
pub enum ValueIter {
    Range { range: RangeValue, next: usize },
    Items(std::vec::IntoIter<Value>),
}

impl ValueIter {
    pub fn new(value: &Value, limit: usize) -> Result<Self, Exception> {
        match value {
            Value::Range(range) => Ok(ValueIter::Range {
                range: *range,
                next: 0,
            }),
            other => Ok(ValueIter::Items(other.iterate(limit)?.into_iter())),
        }
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Range { range, next } => {
                if *next >= range.len() {
                    return None;
                }
                let value = range.get(*next);
                *next += 1;
                Some(Value::Int(value))
            }
            ValueIter::Items(items) => items.next(),
        }
    }
}

pub struct Interpreter<'r> {
    registry: &'r CapabilityRegistry,
    limits: &'r SandboxConfig,
    deadline: Instant,
    globals: Frame,
    /// Frames captured by closures; cleared on drop to break reference cycles.
    captured: Vec<Weak<RefCell<Vars>>>,
    /// Exceptions being handled, for bare `raise`.
    handling: Vec<Rc<Exception>>,
    depth: usize,
    ticks: u32,
    /// Elements allocated so far, checked against `max_total_elements`.
    allocated: usize,
}

impl<'r> Interpreter<'r> {
    pub fn new(registry: &'r CapabilityRegistry, limits: &'r SandboxConfig, deadline: Instant) -> Self {
        Self {
            registry,
            limits,
            deadline,
            globals: Rc::new(RefCell::new(HashMap::new())),
            captured: Vec::new(),
            handling: Vec::new(),
            depth: 0,
            ticks: 0,
            allocated: 0,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.registry
    }

    pub fn collection_limit(&self) -> usize {
        self.limits.max_collection_len
    }

    /// Counts `n` newly allocated elements against the evaluation's total.
    pub fn charge(&mut self, n: usize) -> Result<(), Exception> {
        self.allocated = self.allocated.saturating_add(n);
        if self.allocated > self.limits.max_total_elements {
            return Err(Exception::allocation(self.limits.max_total_elements));
        }
        Ok(())
    }

    /// Charges `value` if it was just built and nothing else holds it.
    fn charge_fresh(&mut self, value: &Value) -> Result<(), Exception> {
        self.charge(fresh_len(value))
    }

    /// Iterates `value`, charging the copy unless it is a lazy range.
    fn iter_over(&mut self, value: &Value) -> Exec<ValueIter> {
        let iter = ValueIter::new(value, self.collection_limit())?;
        if let ValueIter::Items(items) = &iter {
            self.charge(items.len())?;
        }
        Ok(iter)
    }

    pub fn bind_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    /// Module-level bindings as a fresh dict, ordered by name.
    pub fn globals_snapshot(&self) -> Result<Value, Exception> {
        let vars = self.globals.borrow();
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        let mut dict = Dict::new();
        for name in names {
            if let Some(value) = vars.get(name) {
                dict.insert(Value::str(name), value.clone())?;
            }
        }
        Ok(Value::dict(dict))
    }

    pub fn run(&mut self, program: &Program) -> Exec<()> {
        self.exec_block(&program.body, &Env::default())?;
        Ok(())
    }

    pub fn check_deadline(&self) -> Exec<()> {
        if Instant::now() >= self.deadline {
            return Err(Interrupt::Timeout);
        }
        Ok(())
    }

    pub fn tick(&mut self) -> Exec<()> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % DEADLINE_STRIDE == 0 {
            self.check_deadline()?;
        }
        Ok(())
    }

    // ---- names ----

    fn load(&self, name: &str, env: &Env) -> Result<Value, Exception> {
        if !env.declares_global(name) {
            for frame in env.frames.iter().rev() {
                if let Some(v) = frame.borrow().get(name) {
                    return Ok(v.clone());
                }
            }
        }
        if let Some(v) = self.globals.borrow().get(name) {
            return Ok(v.clone());
        }
        match self.registry.lookup(name) {
            Some(Capability::Builtin(b)) => Ok(Value::Builtin(b)),
            Some(Capability::Exception(t)) => Ok(Value::ExceptionType(t)),
            Some(Capability::MathModule) => Ok(Value::MathModule),
            None => Err(Exception::new(
                ExcType::NameError,
                format!("name '{name}' is not defined"),
            )),
        }
    }

    fn store(&self, name: &str, value: Value, env: &Env) {
        match env.frames.last() {
            Some(frame) if !env.declares_global(name) => {
                frame.borrow_mut().insert(name.to_string(), value);
            }
            _ => {
                self.globals.borrow_mut().insert(name.to_string(), value);
            }
        }
    }

    fn remove(&self, name: &str, env: &Env) -> Result<(), Exception> {
        let removed = match env.frames.last() {
            Some(frame) if !env.declares_global(name) => frame.borrow_mut().remove(name),
            _ => self.globals.borrow_mut().remove(name),
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(Exception::new(
                ExcType::NameError,
                format!("name '{name}' is not defined"),
            )),
        }
    }

    fn capture(&mut self, env: &Env) -> Vec<Frame> {
        for frame in &env.frames {
            let seen = self
                .captured
                .iter()
                .rev()
                .take(8)
                .any(|w| std::ptr::eq(w.as_ptr(), Rc::as_ptr(frame)));
            if !seen {
                self.captured.push(Rc::downgrade(frame));
            }
        }
        env.frames.clone()
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt], env: &Env) -> Exec<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &Env) -> Exec<Flow> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, env)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, env)?;
            }
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, env)?.truthy() {
                    body
                } else {
                    orelse
                };
                return self.exec_block(branch, env);
            }
            StmtKind::While { test, body, orelse } => loop {
                self.tick()?;
                if !self.eval(test, env)?.truthy() {
                    return self.exec_block(orelse, env);
                }
                match self.exec_block(body, env)? {
                    Flow::Break => return Ok(Flow::Normal),
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, env)?;
                for item in self.iter_over(&iterable)? {
                    self.tick()?;
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                return self.exec_block(orelse, env);
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass | StmtKind::Global(_) => {}
            StmtKind::FunctionDef(def) => {
                let defaults = self.eval_defaults(&def.params, env)?;
                let func = Function {
                    name: def.name.clone(),
                    code: FunctionCode::Def(def.clone()),
                    defaults,
                    captured: self.capture(env),
                };
                self.store(&def.name, Value::Function(Rc::new(func)), env);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Raise(expr) => {
                let exc = match expr {
                    Some(expr) => {
                        let value = self.eval(expr, env)?;
                        to_exception(value)?
                    }
                    None => match self.handling.last() {
                        Some(active) => (**active).clone(),
                        None => Exception::new(
                            ExcType::RuntimeError,
                            "No active exception to reraise",
                        ),
                    },
                };
                return Err(exc.into());
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, env),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, env)?.truthy() {
                    let message = match msg {
                        Some(m) => self.eval(m, env)?.to_display(),
                        None => String::new(),
                    };
                    return Err(Exception::new(ExcType::AssertionError, message).into());
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
            StmtKind::Nonlocal(_) | StmtKind::Import(_) => {
                return Err(Exception::new(
                    ExcType::RuntimeError,
                    "statement is not available in scripts",
                )
                .into());
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        env: &Env,
    ) -> Exec<Flow> {
        let outcome = match self.exec_block(body, env) {
            Ok(Flow::Normal) => self.exec_block(orelse, env),
            Err(Interrupt::Exception(exc)) => self.handle(exc, handlers, env),
            other => other,
        };
        if matches!(outcome, Err(Interrupt::Timeout)) || finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(finalbody, env)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(&mut self, exc: Exception, handlers: &[ExceptHandler], env: &Env) -> Exec<Flow> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(kind) => {
                    let class = self.eval(kind, env)?;
                    exception_matches(&class, exc.kind)?
                }
            };
            if !matched {
                continue;
            }
            let exc = Rc::new(exc);
            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(exc.clone()), env);
            }
            self.handling.push(exc);
            let outcome = self.exec_block(&handler.body, env);
            self.handling.pop();
            return outcome;
        }
        Err(exc.into())
    }

    fn assign(&mut self, target: &Target, value: Value, env: &Env) -> Exec<()> {
        match target {
            Target::Name(name) => self.store(name, value, env),
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, env)?;
                let limit = self.collection_limit();
                let before = shallow_len(&container);
                match &index.kind {
                    ExprKind::Slice { lower, upper, step } => {
                        let spec = self.eval_slice(lower, upper, step, env)?;
                        subscript::set_slice(&container, &spec, value, limit)?;
                    }
                    _ => {
                        let key = self.eval(index, env)?;
                        subscript::set_item(&container, key, value, limit)?;
                    }
                }
                self.charge(shallow_len(&container).saturating_sub(before))?;
            }
            Target::Tuple(targets) => {
                let items = value.iterate(self.collection_limit())?;
                self.charge(items.len())?;
                if items.len() < targets.len() {
                    return Err(Exception::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    ))
                    .into());
                }
                if items.len() > targets.len() {
                    return Err(Exception::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    ))
                    .into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr, env: &Env) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let current = self.load(name, env)?;
                let rhs = self.eval(value, env)?;
                let updated = self.augmented(op, &current, &rhs)?;
                self.store(name, updated, env);
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, env)?;
                let key = self.eval(index, env)?;
                let current = subscript::get_item(&container, &key)?;
                let rhs = self.eval(value, env)?;
                let updated = self.augmented(op, &current, &rhs)?;
                subscript::set_item(&container, key, updated, self.collection_limit())?;
            }
            Target::Tuple(_) => {
                return Err(Exception::type_error(
                    "illegal expression for augmented assignment",
                )
                .into());
            }
        }
        Ok(())
    }

    /// `+=` extends a list in place; every other operator rebinds.
    fn augmented(&mut self, op: BinOp, current: &Value, rhs: &Value) -> Exec<Value> {
        let limit = self.collection_limit();
        if let (BinOp::Add, Value::List(list)) = (op, current) {
            let extra = rhs.iterate(limit)?;
            if list.borrow().len() + extra.len() > limit {
                return Err(Exception::memory(limit).into());
            }
            self.charge(extra.len())?;
            list.borrow_mut().extend(extra);
            return Ok(current.clone());
        }
        let value = binary_op(op, current, rhs, limit)?;
        self.charge_fresh(&value)?;
        Ok(value)
    }

    fn delete(&mut self, target: &Target, env: &Env) -> Exec<()> {
        match target {
            Target::Name(name) => self.remove(name, env)?,
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, env)?;
                match &index.kind {
                    ExprKind::Slice { lower, upper, step } => {
                        let spec = self.eval_slice(lower, upper, step, env)?;
                        subscript::del_slice(&container, &spec)?;
                    }
                    _ => {
                        let key = self.eval(index, env)?;
                        subscript::del_item(&container, &key)?;
                    }
                }
            }
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn eval_all(&mut self, exprs: &[Expr], env: &Env) -> Exec<Vec<Value>> {
        let mut out = Vec::with_capacity(exprs.len());
        for expr in exprs {
            out.push(self.eval(expr, env)?);
        }
        Ok(out)
    }

    fn eval_defaults(&mut self, params: &[Param], env: &Env) -> Exec<Vec<Option<Value>>> {
        let mut defaults = Vec::with_capacity(params.len());
        for param in params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, env)?),
                None => None,
            });
        }
        Ok(defaults)
    }

    fn eval_slice(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
        env: &Env,
    ) -> Exec<SliceSpec> {
        let bound = |interp: &mut Self, part: &Option<Box<Expr>>| -> Exec<Option<i64>> {
            let Some(expr) = part else {
                return Ok(None);
            };
            match interp.eval(expr, env)? {
                Value::None => Ok(None),
                v => match v.as_int() {
                    Some(i) => Ok(Some(i)),
                    None => Err(Exception::type_error(
                        "slice indices must be integers or None",
                    )
                    .into()),
                },
            }
        };
        Ok(SliceSpec {
            lower: bound(self, lower)?,
            upper: bound(self, upper)?,
            step: bound(self, step)?,
        })
    }

    fn eval(&mut self, expr: &Expr, env: &Env) -> Exec<Value> {
        match &expr.kind {
            ExprKind::Constant(c) => Ok(constant(c)),
            ExprKind::Name(name) => Ok(self.load(name, env)?),
            ExprKind::List(items) => {
                let items = self.eval_all(items, env)?;
                self.charge(items.len())?;
                Ok(Value::list(items))
            }
            ExprKind::Tuple(items) => {
                let items = self.eval_all(items, env)?;
                self.charge(items.len())?;
                Ok(Value::tuple(items))
            }
            ExprKind::Set(items) => {
                let items = self.eval_all(items, env)?;
                self.charge(items.len())?;
                Ok(Value::set(Set::from_values(items)?))
            }
            ExprKind::Dict(pairs) => {
                self.charge(pairs.len())?;
                let mut dict = Dict::new();
                for (k, v) in pairs {
                    let key = self.eval(k, env)?;
                    let value = self.eval(v, env)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            ExprKind::BinOp { left, op, right } => {
                let l = self.eval(left, env)?;
                let r = self.eval(right, env)?;
                let value = binary_op(*op, &l, &r, self.collection_limit())?;
                self.charge_fresh(&value)?;
                Ok(value)
            }
            ExprKind::UnaryOp { op, operand } => {
                let v = self.eval(operand, env)?;
                Ok(unary_op(*op, &v)?)
            }
            ExprKind::BoolOp { op, values } => {
                let mut last = Value::None;
                for value in values {
                    last = self.eval(value, env)?;
                    let short_circuit = match op {
                        BoolOp::And => !last.truthy(),
                        BoolOp::Or => last.truthy(),
                    };
                    if short_circuit {
                        break;
                    }
                }
                Ok(last)
            }
            ExprKind::Compare { left, ops } => {
                let mut lhs = self.eval(left, env)?;
                for (op, right) in ops {
                    let rhs = self.eval(right, env)?;
                    if !compare(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, env)?.truthy() {
                    self.eval(body, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let callee = self.eval(func, env)?;
                let args = self.eval_all(args, env)?;
                let mut kwargs = Vec::with_capacity(keywords.len());
                for (name, value) in keywords {
                    kwargs.push((name.clone(), self.eval(value, env)?));
                }
                self.call(&callee, args, kwargs)
            }
            ExprKind::Attribute { value, attr } => {
                let value = self.eval(value, env)?;
                Ok(builtins::get_attribute(self.registry, value, attr)?)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value, env)?;
                match &index.kind {
                    ExprKind::Slice { lower, upper, step } => {
                        let spec = self.eval_slice(lower, upper, step, env)?;
                        let value = subscript::get_slice(&container, &spec)?;
                        self.charge_fresh(&value)?;
                        Ok(value)
                    }
                    _ => {
                        let key = self.eval(index, env)?;
                        Ok(subscript::get_item(&container, &key)?)
                    }
                }
            }
            ExprKind::Slice { .. } => {
                Err(Exception::type_error("slice is only valid inside a subscript").into())
            }
            ExprKind::Lambda(lambda) => {
                let defaults = self.eval_defaults(&lambda.params, env)?;
                let func = Function {
                    name: "<lambda>".into(),
                    code: FunctionCode::Lambda(lambda.clone()),
                    defaults,
                    captured: self.capture(env),
                };
                Ok(Value::Function(Rc::new(func)))
            }
            ExprKind::ListComp {
                element,
                generators,
            }
            | ExprKind::GeneratorExp {
                element,
                generators,
            } => {
                let limit = self.collection_limit();
                let mut out = Vec::new();
                self.comprehend(generators, env, &mut |interp: &mut Self, env: &Env| {
                    if out.len() >= limit {
                        return Err(Exception::memory(limit).into());
                    }
                    interp.charge(1)?;
                    out.push(interp.eval(element, env)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::SetComp {
                element,
                generators,
            } => {
                let limit = self.collection_limit();
                let mut out = Set::new();
                self.comprehend(generators, env, &mut |interp: &mut Self, env: &Env| {
                    if out.len() >= limit {
                        return Err(Exception::memory(limit).into());
                    }
                    interp.charge(1)?;
                    out.add(interp.eval(element, env)?)?;
                    Ok(())
                })?;
                Ok(Value::set(out))
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                let limit = self.collection_limit();
                let mut out = Dict::new();
                self.comprehend(generators, env, &mut |interp: &mut Self, env: &Env| {
                    if out.len() >= limit {
                        return Err(Exception::memory(limit).into());
                    }
                    interp.charge(1)?;
                    let k = interp.eval(key, env)?;
                    let v = interp.eval(value, env)?;
                    out.insert(k, v)?;
                    Ok(())
                })?;
                Ok(Value::dict(out))
            }
        }
    }

    /// Runs `emit` once per combination of the generators, inside a private
    /// frame so loop variables do not leak.
    fn comprehend(
        &mut self,
        generators: &[Comprehension],
        env: &Env,
        emit: &mut dyn FnMut(&mut Self, &Env) -> Exec<()>,
    ) -> Exec<()> {
        let mut inner = env.clone();
        inner.frames.push(Rc::new(RefCell::new(HashMap::new())));
        self.comprehend_level(generators, &inner, emit)
    }

    fn comprehend_level(
        &mut self,
        generators: &[Comprehension],
        env: &Env,
        emit: &mut dyn FnMut(&mut Self, &Env) -> Exec<()>,
    ) -> Exec<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self, env);
        };
        let iterable = self.eval(&first.iter, env)?;
        'items: for item in self.iter_over(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item, env)?;
            for cond in &first.ifs {
                if !self.eval(cond, env)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehend_level(rest, env, emit)?;
        }
        Ok(())
    }

    // ---- calls ----

    pub fn call(&mut self, func: &Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Exec<Value> {
        match func {
            Value::Function(f) => self.call_function(f.clone(), args, kwargs),
            Value::Builtin(b) => {
                let value = builtins::call_builtin(self, *b, args, kwargs)?;
                self.charge_fresh(&value)?;
                Ok(value)
            }
            Value::MathFn(m) => Ok(builtins::call_math(*m, &args, &kwargs)?),
            Value::Method(m) => {
                let before = shallow_len(&m.receiver);
                let value = builtins::call_method(self, &m.receiver, &m.name, args, kwargs)?;
                let grown = shallow_len(&m.receiver).saturating_sub(before);
                self.charge(grown.saturating_add(fresh_len(&value)))?;
                Ok(value)
            }
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return Err(Exception::type_error(format!(
                        "{}() takes no keyword arguments",
                        kind.name()
                    ))
                    .into());
                }
                let message = args.first().map(Value::to_display).unwrap_or_default();
                Ok(Value::Exception(Rc::new(Exception::new(*kind, message))))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn call_function(
        &mut self,
        func: Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Exec<Value> {
        self.tick()?;
        if self.depth >= self.limits.max_call_depth {
            return Err(Exception::new(
                ExcType::RecursionError,
                "maximum recursion depth exceeded",
            )
            .into());
        }
        let locals = bind_arguments(&func, args, kwargs)?;
        let mut frames = func.captured.clone();
        frames.push(Rc::new(RefCell::new(locals)));

        self.depth += 1;
        let outcome = match &func.code {
            FunctionCode::Def(def) => {
                let env = Env {
                    frames,
                    function: Some(def.clone()),
                };
                self.exec_block(&def.body, &env).map(|flow| match flow {
                    Flow::Return(value) => value,
                    _ => Value::None,
                })
            }
            FunctionCode::Lambda(lambda) => {
                let env = Env {
                    frames,
                    function: None,
                };
                self.eval(&lambda.body, &env)
            }
        };
        self.depth -= 1;
        outcome
    }
}

impl Drop for Interpreter<'_> {
    fn drop(&mut self) {
        self.handling.clear();
        self.globals.borrow_mut().clear();
        for frame in self.captured.drain(..) {
            if let Some(frame) = frame.upgrade() {
                frame.borrow_mut().clear();
            }
        }
    }
}

/// Elements directly held by a collection value; zero for scalars.
fn shallow_len(value: &Value) -> usize {
    match value {
        Value::Str(s) => s.len(),
        Value::List(l) => l.borrow().len(),
        Value::Tuple(t) => t.len(),
        Value::Dict(d) => d.borrow().len(),
        Value::Set(s) => s.borrow().len(),
        _ => 0,
    }
}

/// Size of a collection nothing else refers to yet. Results that alias an
/// existing value cost nothing.
fn fresh_len(value: &Value) -> usize {
    let unique = match value {
        Value::Str(s) => Rc::strong_count(s) == 1,
        Value::List(l) => Rc::strong_count(l) == 1,
        Value::Tuple(t) => Rc::strong_count(t) == 1,
        Value::Dict(d) => Rc::strong_count(d) == 1,
        Value::Set(s) => Rc::strong_count(s) == 1,
        _ => false,
    };
    if unique { shallow_len(value) } else { 0 }
}

fn constant(c: &Constant) -> Value {
    match c {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::str(s),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, Exception> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => l.py_eq(r),
        CmpOp::NotEq => !l.py_eq(r),
        CmpOp::Lt => matches!(l.py_cmp(r, "<")?, Some(Less)),
        CmpOp::LtE => matches!(l.py_cmp(r, "<=")?, Some(Less | Equal)),
        CmpOp::Gt => matches!(l.py_cmp(r, ">")?, Some(Greater)),
        CmpOp::GtE => matches!(l.py_cmp(r, ">=")?, Some(Greater | Equal)),
        CmpOp::In => r.contains(l)?,
        CmpOp::NotIn => !r.contains(l)?,
        CmpOp::Is => l.is_same(r),
        CmpOp::IsNot => !l.is_same(r),
    })
}

fn to_exception(value: Value) -> Result<Exception, Exception> {
    match value {
        Value::ExceptionType(kind) => Ok(Exception::new(kind, "")),
        Value::Exception(exc) => Ok((*exc).clone()),
        _ => Err(Exception::type_error(
            "exceptions must derive from BaseException",
        )),
    }
}

fn exception_matches(class: &Value, kind: ExcType) -> Result<bool, Exception> {
    match class {
        Value::ExceptionType(t) => Ok(kind.is_subclass_of(*t)),
        Value::Tuple(classes) => {
            for c in classes.iter() {
                if exception_matches(c, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn bind_arguments(
    func: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Vars, Exception> {
    let params = func.params();
    if args.len() > params.len() {
        return Err(Exception::type_error(format!(
            "{}() takes {} positional argument(s) but {} were given",
            func.name,
            params.len(),
            args.len()
        )));
    }
    let mut vars: Vars = HashMap::with_capacity(params.len());
    for (param, arg) in params.iter().zip(args) {
        vars.insert(param.name.clone(), arg);
    }
    for (name, value) in kwargs {
        if !params.iter().any(|p| p.name == name) {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{name}'",
                func.name
            )));
        }
        if vars.contains_key(&name) {
            return Err(Exception::type_error(format!(
                "{}() got multiple values for argument '{name}'",
                func.name
            )));
        }
        vars.insert(name, value);
    }
    for (param, default) in params.iter().zip(&func.defaults) {
        if vars.contains_key(&param.name) {
            continue;
        }
        match default {
            Some(value) => {
                vars.insert(param.name.clone(), value.clone());
            }
            None => {
                return Err(Exception::type_error(format!(
                    "{}() missing required argument: '{}'",
                    func.name, param.name
                )));
            }
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::tests::empty_registry;
    use crate::domain::parser::parse;
    use std::time::Duration;

    fn run_with(source: &str, limits: &SandboxConfig) -> (Exec<()>, Option<Value>) {
        let registry = empty_registry();
        let program = parse(source).unwrap();
        let mut interp = Interpreter::new(&registry, limits, Instant::now() + limits.timeout);
        let outcome = interp.run(&program);
        let result = interp.global("result");
        (outcome, result)
    }

    fn result_of(source: &str) -> Value {
        let (outcome, result) = run_with(source, &SandboxConfig::default());
        outcome.unwrap();
        result.expect("result assigned")
    }

    fn raised(source: &str) -> Exception {
        match run_with(source, &SandboxConfig::default()).0 {
            Err(Interrupt::Exception(e)) => e,
            other => panic!("expected exception, got {other:?}"),
        }
    }

    mod statements {
        use super::*;

        #[test]
        fn arithmetic_and_assignment() {
            assert_eq!(result_of("result = 1 + 2 + 3").repr(), "6");
            assert_eq!(result_of("a = b = 2\nresult = a * b").repr(), "4");
            assert_eq!(result_of("x = 5\nx += 2\nx *= 3\nresult = x").repr(), "21");
        }

        #[test]
        fn loops_with_else_and_break() {
            let src = "\
total = 0
for i in range(10):
    if i == 5:
        break
    total += i
else:
    total = -1
result = total
";
            assert_eq!(result_of(src).repr(), "10");
            let src = "n = 0\nwhile n < 3:\n    n += 1\nelse:\n    n = 100\nresult = n";
            assert_eq!(result_of(src).repr(), "100");
        }

        #[test]
        fn tuple_unpacking() {
            assert_eq!(result_of("a, (b, c) = 1, (2, 3)\nresult = a + b + c").repr(), "6");
            let e = raised("a, b = [1, 2, 3]");
            assert_eq!(e.kind, ExcType::ValueError);
            assert_eq!(e.message, "too many values to unpack (expected 2)");
        }

        #[test]
        fn list_augmented_add_is_in_place() {
            let src = "a = [1]\nb = a\na += [2]\nresult = len(b)";
            assert_eq!(result_of(src).repr(), "2");
        }

        #[test]
        fn subscript_assignment_and_delete() {
            let src = "\
d = {'a': 1}
d['b'] = 2
del d['a']
xs = [1, 2, 3, 4]
xs[0] = 10
del xs[1:3]
result = (d, xs)
";
            assert_eq!(result_of(src).repr(), "({'b': 2}, [10, 4])");
        }
    }

    mod functions {
        use super::*;

        #[test]
        fn defaults_keywords_and_closures() {
            let src = "\
def scale(x, factor=2):
    return x * factor
def make_adder(n):
    return lambda x: x + n
add3 = make_adder(3)
result = scale(5) + scale(x=1, factor=10) + add3(1)
";
            assert_eq!(result_of(src).repr(), "24");
        }

        #[test]
        fn global_declaration_rebinds_module_name() {
            let src = "\
result = 0
def set_result():
    global result
    result = 42
set_result()
";
            assert_eq!(result_of(src).repr(), "42");
        }

        #[test]
        fn locals_do_not_leak() {
            let src = "def f():\n    inner = 1\n    return inner\nf()\nresult = inner";
            assert_eq!(raised(src).kind, ExcType::NameError);
        }

        #[test]
        fn comprehension_variables_stay_private() {
            let src = "xs = [i * i for i in range(4) if i % 2 == 0]\nresult = i";
            assert_eq!(raised(src).message, "name 'i' is not defined");
            let src = "result = {k: v for k, v in zip('ab', [1, 2])}";
            assert_eq!(result_of(src).repr(), "{'a': 1, 'b': 2}");
        }

        #[test]
        fn argument_errors() {
            let e = raised("def f(a):\n    return a\nf(1, 2)");
            assert!(e.message.contains("takes 1 positional argument"));
            let e = raised("def f(a):\n    return a\nf()");
            assert_eq!(e.message, "f() missing required argument: 'a'");
        }

        #[test]
        fn recursion_limit() {
            let limits = SandboxConfig {
                max_call_depth: 10,
                ..SandboxConfig::default()
            };
            let (outcome, _) = run_with("def f(n):\n    return f(n + 1)\nf(0)", &limits);
            match outcome {
                Err(Interrupt::Exception(e)) => assert_eq!(e.kind, ExcType::RecursionError),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    mod exceptions {
        use super::*;

        #[test]
        fn try_except_catches_by_hierarchy() {
            let src = "\
try:
    x = 1 / 0
except ArithmeticError as e:
    result = str(e)
";
            assert_eq!(result_of(src).to_display(), "division by zero");
        }

        #[test]
        fn finally_runs_and_else_branch() {
            let src = "\
log = []
try:
    log.append('body')
except ValueError:
    log.append('handler')
else:
    log.append('else')
finally:
    log.append('finally')
result = log
";
            assert_eq!(result_of(src).repr(), "['body', 'else', 'finally']");
        }

        #[test]
        fn raise_and_reraise() {
            let e = raised("raise ValueError('not enough data')");
            assert_eq!(e.kind, ExcType::ValueError);
            assert_eq!(e.message, "not enough data");
            let e = raised("try:\n    [][1]\nexcept IndexError:\n    raise");
            assert_eq!(e.kind, ExcType::IndexError);
        }

        #[test]
        fn unmatched_handler_propagates() {
            let e = raised("try:\n    {}['k']\nexcept (ValueError, TypeError):\n    pass");
            assert_eq!(e.kind, ExcType::KeyError);
            assert_eq!(e.message, "'k'");
        }

        #[test]
        fn assert_failure() {
            let e = raised("assert 1 > 2, 'impossible'");
            assert_eq!(e.kind, ExcType::AssertionError);
            assert_eq!(e.message, "impossible");
        }
    }

    mod limits {
        use super::*;

        #[test]
        fn infinite_loop_times_out_even_inside_try() {
            let limits = SandboxConfig::default().with_timeout(Duration::from_millis(50));
            let src = "try:\n    while True:\n        pass\nexcept Exception:\n    result = 1";
            let (outcome, result) = run_with(src, &limits);
            assert_eq!(outcome, Err(Interrupt::Timeout));
            assert!(result.is_none());
        }

        #[test]
        fn collection_limit_raises_memory_error() {
            let limits = SandboxConfig {
                max_collection_len: 100,
                ..SandboxConfig::default()
            };
            let (outcome, _) = run_with("xs = [0 for _ in range(1000)]", &limits);
            match outcome {
                Err(Interrupt::Exception(e)) => assert_eq!(e.kind, ExcType::MemoryError),
                other => panic!("unexpected {other:?}"),
            }
        }

        fn memory_error(src: &str, limits: &SandboxConfig) -> Exception {
            match run_with(src, limits).0 {
                Err(Interrupt::Exception(e)) if e.kind == ExcType::MemoryError => e,
                other => panic!("expected MemoryError, got {other:?}"),
            }
        }

        #[test]
        fn repeated_copies_exhaust_the_total_budget() {
            let src = "x = [0]*999999\na = [x[:] for i in range(999999)]";
            let e = memory_error(src, &SandboxConfig::default());
            assert_eq!(e.message, "evaluation allocated more than 10000000 elements");
        }

        #[test]
        fn total_budget_counts_every_allocation_path() {
            let limits = SandboxConfig {
                max_total_elements: 1_000,
                ..SandboxConfig::default()
            };
            memory_error("x = [0]*100\na = [x + x for i in range(10)]", &limits);
            memory_error("s = 'ab'*100\nparts = [s[1:] for i in range(10)]", &limits);
            memory_error("xs = []\nfor i in range(2000):\n    xs.append(i)", &limits);
            memory_error("d = {}\nfor i in range(2000):\n    d[i] = i", &limits);
            memory_error("x = [0]*600\nys = list(x)", &limits);
        }

        #[test]
        fn aliases_are_not_charged() {
            let limits = SandboxConfig {
                max_total_elements: 1_000,
                ..SandboxConfig::default()
            };
            let src = "x = [0]*500\nn = 0\nfor i in range(5000):\n    y = x\n    n += len(y)\nresult = n";
            let (outcome, result) = run_with(src, &limits);
            outcome.unwrap();
            assert_eq!(result.unwrap().repr(), "2500000");
        }

        #[test]
        fn long_range_loop_is_lazy() {
            let limits = SandboxConfig {
                max_collection_len: 100,
                ..SandboxConfig::default()
            };
            let src = "n = 0\nfor i in range(1000):\n    n += 1\nresult = n";
            let (outcome, result) = run_with(src, &limits);
            outcome.unwrap();
            assert_eq!(result.unwrap().repr(), "1000");
        }
    }

    #[test]
    fn globals_snapshot_lists_module_names_only() {
        let registry = empty_registry();
        let limits = SandboxConfig::default();
        let program = parse("def helper():\n    return 1\nx = 2").unwrap();
        let mut interp = Interpreter::new(&registry, &limits, Instant::now() + limits.timeout);
        interp.run(&program).unwrap();
        let snapshot = interp.globals_snapshot().unwrap();
        let Value::Dict(d) = snapshot else {
            panic!("expected dict");
        };
        let keys: Vec<String> = d.borrow().keys().iter().map(Value::to_display).collect();
        assert_eq!(keys, vec!["helper", "x"]);
    }
}
