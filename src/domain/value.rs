//! Runtime values of the script interpreter.
//!
//! Values are single-threaded (`Rc`/`RefCell`) and never leave the worker
//! that created them; only the converted [`ScriptValue`](crate::domain::evaluator::ScriptValue)
//! crosses threads. Operator semantics follow Python for the supported types.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::domain::ast::{BinOp, FunctionDef, Lambda, Param, UnaryOp};
use crate::domain::capability::{Builtin, ExcType, MathFn};

pub type Vars = HashMap<String, Value>;
pub type Frame = Rc<RefCell<Vars>>;

/// Nesting depth after which `repr` stops descending.
const REPR_DEPTH: usize = 64;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Set>>),
    Range(RangeValue),
    Function(Rc<Function>),
    Builtin(Builtin),
    MathFn(MathFn),
    MathModule,
    Method(Rc<BoundMethod>),
    ExceptionType(ExcType),
    Exception(Rc<Exception>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

/// A raised script exception.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    pub kind: ExcType,
    pub message: String,
}

impl Exception {
    pub fn new(kind: ExcType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ExcType::ZeroDivisionError, message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new(ExcType::OverflowError, message)
    }

    pub fn memory(limit: usize) -> Self {
        Self::new(
            ExcType::MemoryError,
            format!("collection exceeds the limit of {limit} elements"),
        )
    }

    pub fn allocation(budget: usize) -> Self {
        Self::new(
            ExcType::MemoryError,
            format!("evaluation allocated more than {budget} elements"),
        )
    }
}

pub enum FunctionCode {
    Def(Arc<FunctionDef>),
    Lambda(Arc<Lambda>),
}

/// A user function or lambda together with its evaluated defaults and the
/// enclosing function frames it closes over.
pub struct Function {
    pub name: String,
    pub code: FunctionCode,
    pub defaults: Vec<Option<Value>>,
    pub captured: Vec<Frame>,
}

impl Function {
    pub fn params(&self) -> &[Param] {
        match &self.code {
            FunctionCode::Def(def) => &def.params,
            FunctionCode::Lambda(lambda) => &lambda.params,
        }
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / (-step)
        } else {
            0
        };
        n as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> i64 {
        (self.start as i128 + index as i128 * self.step as i128) as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        let (v, start, step) = (value as i128, self.start as i128, self.step as i128);
        let in_bounds = if step > 0 {
            v >= start && v < self.stop as i128
        } else {
            v <= start && v > self.stop as i128
        };
        in_bounds && (v - start) % step == 0
    }
}

/// Hashable projection of a value. Numbers that compare equal (`1`, `1.0`,
/// `True`) share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
}

/// Insertion-ordered mapping.
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, Exception> {
        let hk = key.hash_key()?;
        Ok(self.index.get(&hk).map(|&i| self.entries[i].1.clone()))
    }

    pub fn contains(&self, key: &Value) -> Result<bool, Exception> {
        Ok(self.index.contains_key(&key.hash_key()?))
    }

    /// Inserts or replaces; an existing key keeps its position.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), Exception> {
        let hk = key.hash_key()?;
        match self.index.get(&hk) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hk, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>, Exception> {
        let hk = key.hash_key()?;
        let Some(i) = self.index.remove(&hk) else {
            return Ok(None);
        };
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Ok(Some(value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Insertion-ordered set.
#[derive(Clone, Default)]
pub struct Set {
    inner: Dict,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, item: &Value) -> Result<bool, Exception> {
        self.inner.contains(item)
    }

    pub fn add(&mut self, item: Value) -> Result<(), Exception> {
        self.inner.insert(item, Value::None)
    }

    pub fn remove(&mut self, item: &Value) -> Result<bool, Exception> {
        Ok(self.inner.remove(item)?.is_some())
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn items(&self) -> Vec<Value> {
        self.inner.keys()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Result<Self, Exception> {
        let mut set = Set::new();
        for v in values {
            set.add(v)?;
        }
        Ok(set)
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn set(set: Set) -> Value {
        Value::Set(Rc::new(RefCell::new(set)))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Set(_) => "set".into(),
            Value::Range(_) => "range".into(),
            Value::Function(_) => "function".into(),
            Value::Builtin(_) | Value::MathFn(_) => "builtin_function_or_method".into(),
            Value::Method(_) => "method".into(),
            Value::MathModule => "module".into(),
            Value::ExceptionType(_) => "type".into(),
            Value::Exception(e) => e.kind.name().into(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float view of any number.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_num().map(Num::to_f64)
    }

    pub fn hash_key(&self) -> Result<HashKey, Exception> {
        match self {
            Value::None => Ok(HashKey::None),
            Value::Bool(b) => Ok(HashKey::Int(i64::from(*b))),
            Value::Int(i) => Ok(HashKey::Int(*i)),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Ok(HashKey::Int(*f as i64))
                } else {
                    Ok(HashKey::Float(f.to_bits()))
                }
            }
            Value::Str(s) => Ok(HashKey::Str(s.clone())),
            Value::Tuple(items) => Ok(HashKey::Tuple(
                items.iter().map(Value::hash_key).collect::<Result<_, _>>()?,
            )),
            other => Err(Exception::type_error(format!(
                "unhashable type: '{}'",
                other.type_name()
            ))),
        }
    }

    // ---- text ----

    pub fn repr(&self) -> String {
        self.repr_at(0)
    }

    fn repr_at(&self, depth: usize) -> String {
        if depth > REPR_DEPTH {
            return "...".into();
        }
        let join = |items: &[Value]| {
            items
                .iter()
                .map(|v| v.repr_at(depth + 1))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote(s),
            Value::List(l) => format!("[{}]", join(&l.borrow())),
            Value::Tuple(t) if t.len() == 1 => format!("({},)", t[0].repr_at(depth + 1)),
            Value::Tuple(t) => format!("({})", join(t)),
            Value::Dict(d) => {
                let body = d
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr_at(depth + 1), v.repr_at(depth + 1)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{body}}}")
            }
            Value::Set(s) => {
                let items = s.borrow().items();
                if items.is_empty() {
                    "set()".into()
                } else {
                    format!("{{{}}}", join(&items))
                }
            }
            Value::Range(r) if r.step == 1 => format!("range({}, {})", r.start, r.stop),
            Value::Range(r) => format!("range({}, {}, {})", r.start, r.stop, r.step),
            Value::Function(func) => format!("<function {}>", func.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::MathFn(m) => format!("<built-in function {}>", m.name()),
            Value::Method(m) => format!("<method {} of {}>", m.name, m.receiver.type_name()),
            Value::MathModule => "<module 'math'>".into(),
            Value::ExceptionType(t) => format!("<class '{}'>", t.name()),
            Value::Exception(e) => format!("{}({})", e.kind.name(), quote(&e.message)),
        }
    }

    /// `str(value)`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message.clone(),
            other => other.repr(),
        }
    }

    // ---- comparison ----

    pub fn py_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return match (a, b) {
                (Num::Int(x), Num::Int(y)) => x == y,
                _ => a.to_f64() == b.to_f64(),
            };
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        matches!(b.get(k), Ok(Some(ref other)) if v.py_eq(other))
                    })
            }
            (Value::Set(a), Value::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.items().iter().all(|v| b.contains(v).unwrap_or(false))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::MathFn(a), Value::MathFn(b)) => a == b,
            (Value::MathModule, Value::MathModule) => true,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Identity as seen by `is`.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self.py_eq(other) && self.type_name() == other.type_name(),
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=` and sorting. `Ok(None)` means the
    /// values are unordered (NaN).
    pub fn py_cmp(&self, other: &Value, symbol: &str) -> Result<Option<Ordering>, Exception> {
        if let (Some(a), Some(b)) = (self.as_num(), other.as_num()) {
            return Ok(match (a, b) {
                (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
                _ => a.to_f64().partial_cmp(&b.to_f64()),
            });
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow(), symbol),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b, symbol),
            _ => Err(Exception::type_error(format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// `item in self`.
    pub fn contains(&self, item: &Value) -> Result<bool, Exception> {
        match self {
            Value::Str(s) => match item {
                Value::Str(sub) => Ok(s.contains(&**sub)),
                other => Err(Exception::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(l) => Ok(l.borrow().iter().any(|v| v.py_eq(item))),
            Value::Tuple(t) => Ok(t.iter().any(|v| v.py_eq(item))),
            Value::Dict(d) => d.borrow().contains(item),
            Value::Set(s) => s.borrow().contains(item),
            Value::Range(r) => Ok(match item.as_num() {
                Some(Num::Int(i)) => r.contains(i),
                Some(Num::Float(f)) if f.fract() == 0.0 => r.contains(f as i64),
                _ => false,
            }),
            other => Err(Exception::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Snapshot of the items produced by iterating this value.
    pub fn iterate(&self, limit: usize) -> Result<Vec<Value>, Exception> {
        match self {
            Value::List(l) => Ok(l.borrow().clone()),
            Value::Tuple(t) => Ok(t.to_vec()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect()),
            Value::Dict(d) => Ok(d.borrow().keys()),
            Value::Set(s) => Ok(s.borrow().items()),
            Value::Range(r) => {
                if r.len() > limit {
                    return Err(Exception::memory(limit));
                }
                Ok((0..r.len()).map(|i| Value::Int(r.get(i))).collect())
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn seq_cmp(a: &[Value], b: &[Value], symbol: &str) -> Result<Option<Ordering>, Exception> {
    for (x, y) in a.iter().zip(b) {
        if !x.py_eq(y) {
            return x.py_cmp(y, symbol);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    let delim = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Formats a float the way Python's `repr` does.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let formatted = format!("{f:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let exp: i32 = exponent.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    if f.fract() == 0.0 {
        return format!("{f:.1}");
    }
    format!("{f}")
}

fn num_result(value: f64, op: &str) -> Result<Value, Exception> {
    if value.is_infinite() {
        return Err(Exception::overflow(format!("float result of '{op}' out of range")));
    }
    Ok(Value::Float(value))
}

fn int_overflow() -> Exception {
    Exception::overflow("integer result out of 64-bit range")
}

fn repeat(items: &[Value], times: i64, limit: usize) -> Result<Vec<Value>, Exception> {
    if times <= 0 || items.is_empty() {
        return Ok(Vec::new());
    }
    let total = items.len().saturating_mul(times as usize);
    if total > limit {
        return Err(Exception::memory(limit));
    }
    let mut out = Vec::with_capacity(total);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn floor_div_int(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(Exception::zero_division("integer division or modulo by zero"));
    }
    let q = a.checked_div(b).ok_or_else(int_overflow)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn mod_int(a: i64, b: i64) -> Result<i64, Exception> {
    if b == 0 {
        return Err(Exception::zero_division("integer division or modulo by zero"));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn mod_float(a: f64, b: f64) -> Result<f64, Exception> {
    if b == 0.0 {
        return Err(Exception::zero_division("float modulo"));
    }
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

/// `base ** exp` on numbers.
pub fn power(base: &Value, exp: &Value) -> Result<Value, Exception> {
    let (Some(a), Some(b)) = (base.as_num(), exp.as_num()) else {
        return Err(unsupported(BinOp::Pow, base, exp));
    };
    match (a, b) {
        (Num::Int(x), Num::Int(y)) if y >= 0 => {
            let y = u32::try_from(y).map_err(|_| int_overflow())?;
            x.checked_pow(y).map(Value::Int).ok_or_else(int_overflow)
        }
        _ => {
            let (x, y) = (a.to_f64(), b.to_f64());
            if x == 0.0 && y < 0.0 {
                return Err(Exception::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Exception::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            let r = x.powf(y);
            if r.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Exception::overflow("numerical result out of range"));
            }
            Ok(Value::Float(r))
        }
    }
}

fn unsupported(op: BinOp, l: &Value, r: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        l.type_name(),
        r.type_name()
    ))
}

/// Applies a binary operator. `limit` caps the length of built sequences.
pub fn binary_op(op: BinOp, l: &Value, r: &Value, limit: usize) -> Result<Value, Exception> {
    if op == BinOp::Pow {
        return power(l, r);
    }

    // bool & bool stays bool
    if let (Value::Bool(a), Value::Bool(b)) = (l, r) {
        match op {
            BinOp::BitAnd => return Ok(Value::Bool(*a & *b)),
            BinOp::BitOr => return Ok(Value::Bool(*a | *b)),
            BinOp::BitXor => return Ok(Value::Bool(*a ^ *b)),
            _ => {}
        }
    }

    if let (Some(a), Some(b)) = (l.as_num(), r.as_num()) {
        return numeric_op(op, a, b, l, r);
    }

    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            if a.len() + b.len() > limit {
                return Err(Exception::memory(limit));
            }
            Ok(Value::Str(Rc::from(format!("{a}{b}"))))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            if a.len() + b.len() > limit {
                return Err(Exception::memory(limit));
            }
            Ok(Value::list(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            if a.len() + b.len() > limit {
                return Err(Exception::memory(limit));
            }
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinOp::Mult, Value::List(items), n) | (BinOp::Mult, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let times = n.as_int().unwrap_or(0);
            Ok(Value::list(repeat(&items.borrow(), times, limit)?))
        }
        (BinOp::Mult, Value::Tuple(items), n) | (BinOp::Mult, n, Value::Tuple(items))
            if n.as_int().is_some() =>
        {
            let times = n.as_int().unwrap_or(0);
            Ok(Value::tuple(repeat(items, times, limit)?))
        }
        (BinOp::Mult, Value::Str(s), n) | (BinOp::Mult, n, Value::Str(s))
            if n.as_int().is_some() =>
        {
            let times = n.as_int().unwrap_or(0).max(0) as usize;
            if s.len().saturating_mul(times) > limit {
                return Err(Exception::memory(limit));
            }
            Ok(Value::Str(Rc::from(s.repeat(times))))
        }
        (BinOp::Sub | BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor, Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let items = match op {
                BinOp::Sub => a
                    .items()
                    .into_iter()
                    .filter(|v| !b.contains(v).unwrap_or(false))
                    .collect::<Vec<_>>(),
                BinOp::BitAnd => a
                    .items()
                    .into_iter()
                    .filter(|v| b.contains(v).unwrap_or(false))
                    .collect(),
                BinOp::BitOr => a.items().into_iter().chain(b.items()).collect(),
                _ => a
                    .items()
                    .into_iter()
                    .filter(|v| !b.contains(v).unwrap_or(false))
                    .chain(
                        b.items()
                            .into_iter()
                            .filter(|v| !a.contains(v).unwrap_or(false)),
                    )
                    .collect(),
            };
            Ok(Value::set(Set::from_values(items)?))
        }
        _ => Err(unsupported(op, l, r)),
    }
}

fn numeric_op(op: BinOp, a: Num, b: Num, l: &Value, r: &Value) -> Result<Value, Exception> {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(int_overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(int_overflow),
            BinOp::Mult => x.checked_mul(y).map(Value::Int).ok_or_else(int_overflow),
            BinOp::Div => {
                if y == 0 {
                    return Err(Exception::zero_division("division by zero"));
                }
                Ok(Value::Float(x as f64 / y as f64))
            }
            BinOp::FloorDiv => floor_div_int(x, y).map(Value::Int),
            BinOp::Mod => mod_int(x, y).map(Value::Int),
            BinOp::BitAnd => Ok(Value::Int(x & y)),
            BinOp::BitOr => Ok(Value::Int(x | y)),
            BinOp::BitXor => Ok(Value::Int(x ^ y)),
            BinOp::LShift => shift_left(x, y),
            BinOp::RShift => {
                if y < 0 {
                    return Err(Exception::value_error("negative shift count"));
                }
                Ok(Value::Int(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y }))
            }
            BinOp::Pow => power(l, r),
        };
    }

    let (x, y) = (a.to_f64(), b.to_f64());
    match op {
        BinOp::Add => num_result(x + y, "+"),
        BinOp::Sub => num_result(x - y, "-"),
        BinOp::Mult => num_result(x * y, "*"),
        BinOp::Div => {
            if y == 0.0 {
                return Err(Exception::zero_division("float division by zero"));
            }
            num_result(x / y, "/")
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            Ok(Value::Float((x / y).floor()))
        }
        BinOp::Mod => mod_float(x, y).map(Value::Float),
        BinOp::Pow => power(l, r),
        _ => Err(unsupported(op, l, r)),
    }
}

/// Applies `-`, `+` or `~`; `not` is handled by the interpreter.
pub fn unary_op(op: UnaryOp, operand: &Value) -> Result<Value, Exception> {
    let bad = || {
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        Exception::type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            operand.type_name()
        ))
    };
    match (op, operand.as_num()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!operand.truthy())),
        (UnaryOp::Neg, Some(Num::Int(i))) => i.checked_neg().map(Value::Int).ok_or_else(int_overflow),
        (UnaryOp::Neg, Some(Num::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Num::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Num::Float(f))) => Ok(Value::Float(f)),
        (UnaryOp::Invert, Some(Num::Int(i))) => Ok(Value::Int(!i)),
        _ => Err(bad()),
    }
}

fn shift_left(x: i64, y: i64) -> Result<Value, Exception> {
    if y < 0 {
        return Err(Exception::value_error("negative shift count"));
    }
    if x == 0 {
        return Ok(Value::Int(0));
    }
    if y >= 63 {
        return Err(int_overflow());
    }
    let shifted = x << y;
    if shifted >> y != x {
        return Err(int_overflow());
    }
    Ok(Value::Int(shifted))
}
