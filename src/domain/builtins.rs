//! Builtin functions, the `math` namespace and the method surface of
//! container and string values.

use std::cmp::Ordering;
use std::rc::Rc;
use std::cell::RefCell;

use crate::domain::ast::BinOp;
use crate::domain::capability::{Builtin, CapabilityRegistry, ExcType, MathFn};
use crate::domain::history::RequestedDays;
use crate::domain::interpreter::{Exec, Interpreter, Interrupt};
use crate::domain::row::HistoryPoint;
use crate::domain::value::{
    binary_op, power, BoundMethod, Dict, Exception, RangeValue, Set, Value,
};

type Kwargs = Vec<(String, Value)>;

fn take_kw(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    kwargs
        .iter()
        .position(|(k, _)| k == key)
        .map(|i| kwargs.remove(i).1)
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> Result<(), Exception> {
    match kwargs.first() {
        Some((key, _)) => Err(Exception::type_error(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        ))),
        None => Ok(()),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    let given = args.len();
    if given >= min && given <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {min}")
    } else if given < min {
        format!("at least {min}")
    } else {
        format!("at most {max}")
    };
    Err(Exception::type_error(format!(
        "{name}() takes {expected} argument(s) ({given} given)"
    )))
}

fn int_arg(value: &Value) -> Result<i64, Exception> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn str_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, Exception> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(Exception::type_error(format!(
            "{name}() argument must be str, not {}",
            other.type_name()
        ))),
    }
}

/// Converts a float to an int the way `int()` does after truncation.
pub(crate) fn float_to_int(f: f64) -> Result<i64, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::overflow("cannot convert float infinity to integer"));
    }
    if f >= i64::MAX as f64 || f < i64::MIN as f64 {
        return Err(Exception::overflow("integer result out of 64-bit range"));
    }
    Ok(f as i64)
}

/// Resolves `value.attr` against the method surface and the `math` module.
pub fn get_attribute(
    registry: &CapabilityRegistry,
    value: Value,
    attr: &str,
) -> Result<Value, Exception> {
    if let Value::MathModule = value {
        if let Some(f) = registry.math_function(attr) {
            return Ok(Value::MathFn(f));
        }
        if let Some(c) = registry.math_constant(attr) {
            return Ok(Value::Float(c));
        }
        return Err(Exception::new(
            ExcType::AttributeError,
            format!("module 'math' has no attribute '{attr}'"),
        ));
    }
    let type_name = value.type_name();
    if registry.methods_of(&type_name).contains(&attr) {
        return Ok(Value::Method(Rc::new(BoundMethod {
            receiver: value,
            name: attr.to_string(),
        })));
    }
    Err(Exception::new(
        ExcType::AttributeError,
        format!("'{type_name}' object has no attribute '{attr}'"),
    ))
}

// ---- builtin functions ----

pub fn call_builtin(
    interp: &mut Interpreter<'_>,
    builtin: Builtin,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Exec<Value> {
    let name = builtin.name();
    let limit = interp.collection_limit();
    let value = match builtin {
        Builtin::Min | Builtin::Max => return extremum(interp, builtin, args, kwargs),
        Builtin::GetHistory => return get_history(interp, args, kwargs),
        Builtin::Sorted => {
            let key = take_kw(&mut kwargs, "key");
            let reverse = take_kw(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let items = args[0].iterate(limit)?;
            Value::list(sort_values(interp, items, key, reverse)?)
        }
        Builtin::Globals => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 0)?;
            interp.globals_snapshot()?
        }
        Builtin::Sum => {
            let start = take_kw(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
            for item in args[0].iterate(limit)? {
                total = binary_op(BinOp::Add, &total, &item, limit)?;
            }
            total
        }
        Builtin::Enumerate => {
            let start = take_kw(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let first = match args.get(1).or(start.as_ref()) {
                Some(v) => int_arg(v)?,
                None => 0,
            };
            let mut out = Vec::new();
            for (i, item) in args[0].iterate(limit)?.into_iter().enumerate() {
                let index = first
                    .checked_add(i as i64)
                    .ok_or_else(|| Exception::overflow("enumerate index overflow"))?;
                out.push(Value::tuple(vec![Value::Int(index), item]));
            }
            Value::list(out)
        }
        Builtin::Round => {
            let ndigits = take_kw(&mut kwargs, "ndigits");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            round(&args[0], args.get(1).or(ndigits.as_ref()))?
        }
        Builtin::Int => {
            let base = take_kw(&mut kwargs, "base");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 2)?;
            match args.first() {
                Some(v) => to_int(v, args.get(1).or(base.as_ref()))?,
                None => Value::Int(0),
            }
        }
        Builtin::Dict => {
            arity(name, &args, 0, 1)?;
            let mut dict = match args.first() {
                Some(source) => dict_from(source, limit)?,
                None => Dict::new(),
            };
            for (key, value) in kwargs {
                dict.insert(Value::str(&key), value)?;
            }
            Value::dict(dict)
        }
        _ => {
            no_kwargs(name, &kwargs)?;
            plain_builtin(builtin, &args, limit)?
        }
    };
    Ok(value)
}

fn plain_builtin(builtin: Builtin, args: &[Value], limit: usize) -> Result<Value, Exception> {
    let name = builtin.name();
    match builtin {
        Builtin::Abs => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Exception::overflow("integer result out of 64-bit range")),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(Exception::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Len => {
            arity(name, args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(l) => l.borrow().len(),
                Value::Tuple(t) => t.len(),
                Value::Dict(d) => d.borrow().len(),
                Value::Set(s) => s.borrow().len(),
                Value::Range(r) => r.len(),
                other => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Range => {
            arity(name, args, 1, 3)?;
            let ints = args.iter().map(int_arg).collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(Exception::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        Builtin::Zip => {
            let columns = args
                .iter()
                .map(|a| a.iterate(limit))
                .collect::<Result<Vec<_>, _>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let out = (0..rows)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::list(out))
        }
        Builtin::Reversed => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_) | Value::Dict(_) => {
                    let mut items = args[0].iterate(limit)?;
                    items.reverse();
                    Ok(Value::list(items))
                }
                other => Err(Exception::type_error(format!(
                    "'{}' object is not reversible",
                    other.type_name()
                ))),
            }
        }
        Builtin::List => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::list(v.iterate(limit)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        Builtin::Tuple => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::tuple(v.iterate(limit)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        Builtin::Set => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::set(Set::from_values(v.iterate(limit)?)?)),
                None => Ok(Value::set(Set::new())),
            }
        }
        Builtin::Str => {
            arity(name, args, 0, 1)?;
            Ok(Value::str(
                &args.first().map(Value::to_display).unwrap_or_default(),
            ))
        }
        Builtin::Float => {
            arity(name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    Exception::value_error(format!(
                        "could not convert string to float: {}",
                        Value::Str(s.clone()).repr()
                    ))
                }),
                Some(v) => v.as_f64().map(Value::Float).ok_or_else(|| {
                    Exception::type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        Builtin::Bool => {
            arity(name, args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Builtin::Isinstance => {
            arity(name, args, 2, 2)?;
            Ok(Value::Bool(isinstance(&args[0], &args[1])?))
        }
        Builtin::Pow => {
            arity(name, args, 2, 3)?;
            match args.get(2) {
                Some(m) if !matches!(m, Value::None) => mod_pow(&args[0], &args[1], m),
                _ => power(&args[0], &args[1]),
            }
        }
        Builtin::Divmod => {
            arity(name, args, 2, 2)?;
            let q = binary_op(BinOp::FloorDiv, &args[0], &args[1], limit)?;
            let r = binary_op(BinOp::Mod, &args[0], &args[1], limit)?;
            Ok(Value::tuple(vec![q, r]))
        }
        Builtin::Any => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate(limit)?.iter().any(Value::truthy)))
        }
        Builtin::All => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(args[0].iterate(limit)?.iter().all(Value::truthy)))
        }
        other => Err(Exception::type_error(format!(
            "{}() cannot be called here",
            other.name()
        ))),
    }
}

fn extremum(
    interp: &mut Interpreter<'_>,
    builtin: Builtin,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Exec<Value> {
    let name = builtin.name();
    let key = take_kw(&mut kwargs, "key").filter(|k| !matches!(k, Value::None));
    let default = take_kw(&mut kwargs, "default");
    no_kwargs(name, &kwargs)?;
    let items = match args.len() {
        0 => {
            return Err(Exception::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            ))
            .into());
        }
        1 => args[0].iterate(interp.collection_limit())?,
        _ => {
            if default.is_some() {
                return Err(Exception::type_error(format!(
                    "Cannot specify a default for {name}() with multiple positional arguments"
                ))
                .into());
            }
            args
        }
    };
    let (wanted, symbol) = match builtin {
        Builtin::Min => (Ordering::Less, "<"),
        _ => (Ordering::Greater, ">"),
    };
    let mut items = items.into_iter();
    let Some(mut best) = items.next() else {
        return default.ok_or_else(|| {
            Interrupt::from(Exception::value_error(format!(
                "{name}() arg is an empty sequence"
            )))
        });
    };
    let mut best_key = key_of(interp, key.as_ref(), &best)?;
    for item in items {
        let k = key_of(interp, key.as_ref(), &item)?;
        if k.py_cmp(&best_key, symbol)? == Some(wanted) {
            best = item;
            best_key = k;
        }
    }
    Ok(best)
}

fn key_of(interp: &mut Interpreter<'_>, key: Option<&Value>, item: &Value) -> Exec<Value> {
    match key {
        Some(f) => interp.call(f, vec![item.clone()], Vec::new()),
        None => Ok(item.clone()),
    }
}

/// Stable sort with an optional key function; `reverse` keeps equal items
/// in their original order.
fn sort_values(
    interp: &mut Interpreter<'_>,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Exec<Vec<Value>> {
    let key = key.filter(|k| !matches!(k, Value::None));
    let mut keys = Vec::with_capacity(items.len());
    for item in &items {
        interp.tick()?;
        keys.push(key_of(interp, key.as_ref(), item)?);
    }
    let mut order: Vec<usize> = (0..items.len()).collect();
    merge_sort(&mut order, &mut |a, b| {
        let (x, y) = if reverse { (&keys[b], &keys[a]) } else { (&keys[a], &keys[b]) };
        Ok(x.py_cmp(y, "<")? == Some(Ordering::Less))
    })?;
    Ok(order.into_iter().map(|i| items[i].clone()).collect())
}

fn merge_sort(
    v: &mut Vec<usize>,
    less: &mut dyn FnMut(usize, usize) -> Result<bool, Exception>,
) -> Result<(), Exception> {
    if v.len() <= 1 {
        return Ok(());
    }
    let mut right = v.split_off(v.len() / 2);
    merge_sort(v, less)?;
    merge_sort(&mut right, less)?;
    let left = std::mem::take(v);
    v.reserve(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if less(right[j], left[i])? {
            v.push(right[j]);
            j += 1;
        } else {
            v.push(left[i]);
            i += 1;
        }
    }
    v.extend_from_slice(&left[i..]);
    v.extend_from_slice(&right[j..]);
    Ok(())
}

fn round(number: &Value, ndigits: Option<&Value>) -> Result<Value, Exception> {
    let ndigits = match ndigits {
        None | Some(Value::None) => None,
        Some(v) => Some(int_arg(v)?),
    };
    if let Value::Float(f) = number {
        return match ndigits {
            None => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
            Some(nd) => Ok(Value::Float(round_float(*f, nd))),
        };
    }
    let Some(i) = number.as_int() else {
        return Err(Exception::type_error(format!(
            "type {} doesn't define __round__ method",
            number.type_name()
        )));
    };
    match ndigits {
        Some(nd) if nd < 0 => round_int(i, nd).map(Value::Int),
        _ => Ok(Value::Int(i)),
    }
}

fn round_float(f: f64, ndigits: i64) -> f64 {
    if !f.is_finite() || ndigits > 308 {
        return f;
    }
    if ndigits < -308 {
        return 0.0 * f.signum();
    }
    let p = 10f64.powi(ndigits.unsigned_abs() as i32);
    if ndigits >= 0 {
        let scaled = f * p;
        if !scaled.is_finite() {
            return f;
        }
        scaled.round_ties_even() / p
    } else {
        (f / p).round_ties_even() * p
    }
}

fn round_int(i: i64, ndigits: i64) -> Result<i64, Exception> {
    let exp = ndigits.unsigned_abs();
    if exp > 18 {
        return Ok(0);
    }
    let p = 10i128.pow(exp as u32);
    let x = i128::from(i);
    let mut q = x.div_euclid(p);
    let r = x.rem_euclid(p);
    if 2 * r > p || (2 * r == p && q % 2 != 0) {
        q += 1;
    }
    i64::try_from(q * p).map_err(|_| Exception::overflow("integer result out of 64-bit range"))
}

fn to_int(value: &Value, base: Option<&Value>) -> Result<Value, Exception> {
    if let Some(base) = base {
        let Value::Str(s) = value else {
            return Err(Exception::type_error(
                "int() can't convert non-string with explicit base",
            ));
        };
        let base = int_arg(base)?;
        if !(2..=36).contains(&base) {
            return Err(Exception::value_error("int() base must be >= 2 and <= 36"));
        }
        return parse_int(s, base as u32);
    }
    match value {
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(float_to_int(f.trunc())?)),
        Value::Str(s) => parse_int(s, 10),
        other => Err(Exception::type_error(format!(
            "int() argument must be a string or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn parse_int(s: &str, base: u32) -> Result<Value, Exception> {
    let cleaned: String = s.trim().chars().filter(|c| *c != '_').collect();
    i64::from_str_radix(&cleaned, base)
        .map(Value::Int)
        .map_err(|_| {
            Exception::value_error(format!(
                "invalid literal for int() with base {base}: {}",
                Value::str(s).repr()
            ))
        })
}

fn dict_from(source: &Value, limit: usize) -> Result<Dict, Exception> {
    if let Value::Dict(d) = source {
        return Ok(d.borrow().clone());
    }
    let mut dict = Dict::new();
    for (i, item) in source.iterate(limit)?.into_iter().enumerate() {
        let pair = item.iterate(limit).map_err(|_| {
            Exception::type_error(format!(
                "cannot convert dictionary update sequence element #{i} to a sequence"
            ))
        })?;
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            Exception::value_error(format!(
                "dictionary update sequence element #{i} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        dict.insert(key, value)?;
    }
    Ok(dict)
}

fn isinstance(value: &Value, class: &Value) -> Result<bool, Exception> {
    match class {
        Value::Tuple(classes) => {
            for c in classes.iter() {
                if isinstance(value, c)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Builtin(b) => {
            let matched = match b {
                Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
                Builtin::Float => matches!(value, Value::Float(_)),
                Builtin::Bool => matches!(value, Value::Bool(_)),
                Builtin::Str => matches!(value, Value::Str(_)),
                Builtin::List => matches!(value, Value::List(_)),
                Builtin::Tuple => matches!(value, Value::Tuple(_)),
                Builtin::Dict => matches!(value, Value::Dict(_)),
                Builtin::Set => matches!(value, Value::Set(_)),
                Builtin::Range => matches!(value, Value::Range(_)),
                _ => {
                    return Err(Exception::type_error(
                        "isinstance() arg 2 must be a type or tuple of types",
                    ));
                }
            };
            Ok(matched)
        }
        Value::ExceptionType(t) => {
            Ok(matches!(value, Value::Exception(e) if e.kind.is_subclass_of(*t)))
        }
        _ => Err(Exception::type_error(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

fn mod_pow(base: &Value, exp: &Value, modulus: &Value) -> Result<Value, Exception> {
    let (Some(b), Some(e), Some(m)) = (base.as_int(), exp.as_int(), modulus.as_int()) else {
        return Err(Exception::type_error(
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if m == 0 {
        return Err(Exception::value_error("pow() 3rd argument cannot be 0"));
    }
    if e < 0 {
        return Err(Exception::value_error(
            "pow() 2nd argument cannot be negative when 3rd argument specified",
        ));
    }
    let m_abs = i128::from(m).abs();
    let mut result = 1 % m_abs;
    let mut base = i128::from(b).rem_euclid(m_abs);
    let mut e = e;
    while e > 0 {
        if e & 1 == 1 {
            result = result * base % m_abs;
        }
        base = base * base % m_abs;
        e >>= 1;
    }
    if m < 0 && result != 0 {
        result += i128::from(m);
    }
    Ok(Value::Int(result as i64))
}

fn get_history(interp: &mut Interpreter<'_>, args: Vec<Value>, mut kwargs: Kwargs) -> Exec<Value> {
    let symbol_kw = take_kw(&mut kwargs, "symbol");
    let days_kw = take_kw(&mut kwargs, "days");
    no_kwargs("get_history", &kwargs)?;
    arity("get_history", &args, 0, 2)?;
    let mut args = args.into_iter();
    let symbol = args.next().or(symbol_kw);
    let days = match args.next().or(days_kw) {
        Some(Value::Int(n)) => RequestedDays::Int(n),
        Some(Value::Bool(b)) => RequestedDays::Int(i64::from(b)),
        Some(Value::Float(f)) => RequestedDays::Float(f),
        _ => RequestedDays::Invalid,
    };
    let Some(Value::Str(symbol)) = symbol else {
        return Ok(Value::list(Vec::new()));
    };
    let points = interp.registry().history().get_history(&symbol, days);
    interp.check_deadline()?;
    Ok(history_value(points)?)
}

/// History points as the list of dicts scripts see.
pub(crate) fn history_value(points: Vec<HistoryPoint>) -> Result<Value, Exception> {
    let optional = |v: Option<f64>| v.map_or(Value::None, Value::Float);
    let mut out = Vec::with_capacity(points.len());
    for p in points {
        let mut d = Dict::new();
        d.insert(Value::str("close_price"), optional(p.close_price))?;
        d.insert(
            Value::str("trade_date"),
            Value::str(&p.trade_date.format("%Y-%m-%d").to_string()),
        )?;
        d.insert(Value::str("volume"), Value::Int(p.volume))?;
        d.insert(Value::str("price_change_pct"), optional(p.price_change_pct))?;
        out.push(Value::dict(d));
    }
    Ok(Value::list(out))
}

// ---- math ----

pub fn call_math(func: MathFn, args: &[Value], kwargs: &Kwargs) -> Result<Value, Exception> {
    let name = func.name();
    no_kwargs(name, kwargs)?;
    let real = |i: usize| -> Result<f64, Exception> {
        args[i].as_f64().ok_or_else(|| {
            Exception::type_error(format!(
                "must be real number, not {}",
                args[i].type_name()
            ))
        })
    };
    let domain = || Exception::value_error("math domain error");
    let range = || Exception::overflow("math range error");

    let two_args = matches!(func, MathFn::Pow | MathFn::Atan2);
    match func {
        MathFn::Log => arity(name, args, 1, 2)?,
        _ if two_args => arity(name, args, 2, 2)?,
        _ => arity(name, args, 1, 1)?,
    }

    let value = match func {
        MathFn::Exp => {
            let x = real(0)?;
            let v = x.exp();
            if v.is_infinite() && x.is_finite() {
                return Err(range());
            }
            v
        }
        MathFn::Log => {
            let x = real(0)?;
            if x <= 0.0 {
                return Err(domain());
            }
            match args.get(1) {
                Some(_) => {
                    let base = real(1)?;
                    if base <= 0.0 {
                        return Err(domain());
                    }
                    if base == 1.0 {
                        return Err(Exception::zero_division("float division by zero"));
                    }
                    x.ln() / base.ln()
                }
                None => x.ln(),
            }
        }
        MathFn::Log10 | MathFn::Log2 => {
            let x = real(0)?;
            if x <= 0.0 {
                return Err(domain());
            }
            if func == MathFn::Log10 { x.log10() } else { x.log2() }
        }
        MathFn::Pow => {
            let (x, y) = (real(0)?, real(1)?);
            if x == 0.0 && y < 0.0 {
                return Err(domain());
            }
            if x < 0.0 && y.is_finite() && y.fract() != 0.0 {
                return Err(domain());
            }
            let v = x.powf(y);
            if v.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(range());
            }
            v
        }
        MathFn::Sqrt => {
            let x = real(0)?;
            if x < 0.0 {
                return Err(domain());
            }
            x.sqrt()
        }
        MathFn::Sin | MathFn::Cos | MathFn::Tan => {
            let x = real(0)?;
            if x.is_infinite() {
                return Err(domain());
            }
            match func {
                MathFn::Sin => x.sin(),
                MathFn::Cos => x.cos(),
                _ => x.tan(),
            }
        }
        MathFn::Asin | MathFn::Acos => {
            let x = real(0)?;
            if x.abs() > 1.0 {
                return Err(domain());
            }
            if func == MathFn::Asin { x.asin() } else { x.acos() }
        }
        MathFn::Atan => real(0)?.atan(),
        MathFn::Atan2 => real(0)?.atan2(real(1)?),
        MathFn::Floor | MathFn::Ceil => {
            if let Some(i) = args[0].as_int() {
                return Ok(Value::Int(i));
            }
            let x = real(0)?;
            let rounded = if func == MathFn::Floor { x.floor() } else { x.ceil() };
            return Ok(Value::Int(float_to_int(rounded)?));
        }
        MathFn::Fabs => real(0)?.abs(),
        MathFn::IsNan => return Ok(Value::Bool(real(0)?.is_nan())),
        MathFn::IsInf => return Ok(Value::Bool(real(0)?.is_infinite())),
        MathFn::IsFinite => return Ok(Value::Bool(real(0)?.is_finite())),
    };
    Ok(Value::Float(value))
}

// ---- methods ----

pub fn call_method(
    interp: &mut Interpreter<'_>,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Exec<Value> {
    let limit = interp.collection_limit();
    match receiver {
        Value::List(list) if name == "sort" => {
            let key = take_kw(&mut kwargs, "key");
            let reverse = take_kw(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 0)?;
            let items = list.borrow().clone();
            let sorted = sort_values(interp, items, key, reverse)?;
            *list.borrow_mut() = sorted;
            Ok(Value::None)
        }
        Value::List(list) => {
            no_kwargs(name, &kwargs)?;
            Ok(list_method(list, name, &args, limit)?)
        }
        Value::Dict(dict) => Ok(dict_method(dict, name, &args, kwargs, limit)?),
        Value::Str(s) => Ok(str_method(s, name, &args, kwargs, limit)?),
        Value::Set(set) => {
            no_kwargs(name, &kwargs)?;
            Ok(set_method(set, name, &args, limit)?)
        }
        other => Err(Exception::new(
            ExcType::AttributeError,
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )
        .into()),
    }
}

fn no_method(type_name: &str, name: &str) -> Exception {
    Exception::new(
        ExcType::AttributeError,
        format!("'{type_name}' object has no attribute '{name}'"),
    )
}

fn list_method(
    list: &Rc<RefCell<Vec<Value>>>,
    name: &str,
    args: &[Value],
    limit: usize,
) -> Result<Value, Exception> {
    match name {
        "append" => {
            arity(name, args, 1, 1)?;
            let mut items = list.borrow_mut();
            if items.len() >= limit {
                return Err(Exception::memory(limit));
            }
            items.push(args[0].clone());
            Ok(Value::None)
        }
        "extend" => {
            arity(name, args, 1, 1)?;
            let extra = args[0].iterate(limit)?;
            let mut items = list.borrow_mut();
            if items.len() + extra.len() > limit {
                return Err(Exception::memory(limit));
            }
            items.extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            arity(name, args, 2, 2)?;
            let index = int_arg(&args[0])?;
            let mut items = list.borrow_mut();
            if items.len() >= limit {
                return Err(Exception::memory(limit));
            }
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, args[1].clone());
            Ok(Value::None)
        }
        "pop" => {
            arity(name, args, 0, 1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(Exception::new(ExcType::IndexError, "pop from empty list"));
            }
            let len = items.len() as i64;
            let index = match args.first() {
                Some(v) => int_arg(v)?,
                None => -1,
            };
            let at = if index < 0 { index + len } else { index };
            if at < 0 || at >= len {
                return Err(Exception::new(ExcType::IndexError, "pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "remove" => {
            arity(name, args, 1, 1)?;
            let position = list.borrow().iter().position(|v| v.py_eq(&args[0]));
            match position {
                Some(i) => {
                    list.borrow_mut().remove(i);
                    Ok(Value::None)
                }
                None => Err(Exception::value_error("list.remove(x): x not in list")),
            }
        }
        "index" => {
            arity(name, args, 1, 1)?;
            let position = list.borrow().iter().position(|v| v.py_eq(&args[0]));
            position.map(|i| Value::Int(i as i64)).ok_or_else(|| {
                Exception::value_error(format!("{} is not in list", args[0].repr()))
            })
        }
        "count" => {
            arity(name, args, 1, 1)?;
            let n = list.borrow().iter().filter(|v| v.py_eq(&args[0])).count();
            Ok(Value::Int(n as i64))
        }
        "reverse" => {
            arity(name, args, 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(list.borrow().clone()))
        }
        "clear" => {
            arity(name, args, 0, 0)?;
            list.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_method("list", name)),
    }
}

fn dict_method(
    dict: &Rc<RefCell<Dict>>,
    name: &str,
    args: &[Value],
    kwargs: Kwargs,
    limit: usize,
) -> Result<Value, Exception> {
    if name != "update" {
        no_kwargs(name, &kwargs)?;
    }
    match name {
        "get" => {
            arity(name, args, 1, 2)?;
            let found = dict.borrow().get(&args[0])?;
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            arity(name, args, 0, 0)?;
            Ok(Value::list(dict.borrow().values()))
        }
        "items" => {
            arity(name, args, 0, 0)?;
            let items = dict
                .borrow()
                .items()
                .into_iter()
                .map(|(k, v)| Value::tuple(vec![k, v]))
                .collect();
            Ok(Value::list(items))
        }
        "update" => {
            arity(name, args, 0, 1)?;
            let mut source = match args.first() {
                Some(v) => dict_from(v, limit)?,
                None => Dict::new(),
            };
            for (key, value) in kwargs {
                source.insert(Value::str(&key), value)?;
            }
            let mut target = dict.borrow_mut();
            for (key, value) in source.items() {
                if target.len() >= limit && !target.contains(&key)? {
                    return Err(Exception::memory(limit));
                }
                target.insert(key, value)?;
            }
            Ok(Value::None)
        }
        "pop" => {
            arity(name, args, 1, 2)?;
            let removed = dict.borrow_mut().remove(&args[0])?;
            match (removed, args.get(1)) {
                (Some(v), _) => Ok(v),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Exception::new(ExcType::KeyError, args[0].repr())),
            }
        }
        "setdefault" => {
            arity(name, args, 1, 2)?;
            if let Some(existing) = dict.borrow().get(&args[0])? {
                return Ok(existing);
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            let mut d = dict.borrow_mut();
            if d.len() >= limit {
                return Err(Exception::memory(limit));
            }
            d.insert(args[0].clone(), default.clone())?;
            Ok(default)
        }
        "copy" => {
            arity(name, args, 0, 0)?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        "clear" => {
            arity(name, args, 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_method("dict", name)),
    }
}

fn split_whitespace(s: &str, maxsplit: i64) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && out.len() as i64 == maxsplit {
            out.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(i) => {
                out.push(Value::str(&rest[..i]));
                rest = rest[i..].trim_start();
            }
            None => {
                out.push(Value::str(rest));
                break;
            }
        }
    }
    out
}

fn char_index(s: &str, byte_index: usize) -> i64 {
    s[..byte_index].chars().count() as i64
}

fn affix_matches(name: &str, s: &str, affix: &Value, starts: bool) -> Result<bool, Exception> {
    match affix {
        Value::Str(a) => Ok(if starts { s.starts_with(&**a) } else { s.ends_with(&**a) }),
        Value::Tuple(options) => {
            for option in options.iter() {
                if affix_matches(name, s, option, starts)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(Exception::type_error(format!(
            "{name} first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn str_method(
    s: &Rc<str>,
    name: &str,
    args: &[Value],
    mut kwargs: Kwargs,
    limit: usize,
) -> Result<Value, Exception> {
    if name == "split" {
        let sep_kw = take_kw(&mut kwargs, "sep");
        let maxsplit_kw = take_kw(&mut kwargs, "maxsplit");
        no_kwargs(name, &kwargs)?;
        arity(name, args, 0, 2)?;
        let sep = args.first().cloned().or(sep_kw).unwrap_or(Value::None);
        let maxsplit = match args.get(1).or(maxsplit_kw.as_ref()) {
            Some(v) => int_arg(v)?,
            None => -1,
        };
        let parts = match sep {
            Value::None => split_whitespace(s, maxsplit),
            Value::Str(sep) if sep.is_empty() => {
                return Err(Exception::value_error("empty separator"));
            }
            Value::Str(sep) => {
                if maxsplit < 0 {
                    s.split(&*sep).map(Value::str).collect()
                } else {
                    s.splitn(maxsplit as usize + 1, &*sep).map(Value::str).collect()
                }
            }
            other => {
                return Err(Exception::type_error(format!(
                    "must be str or None, not {}",
                    other.type_name()
                )));
            }
        };
        return Ok(Value::list(parts));
    }
    no_kwargs(name, &kwargs)?;

    let strip_chars = |args: &[Value]| -> Result<Option<Vec<char>>, Exception> {
        match args.first() {
            None | Some(Value::None) => Ok(None),
            Some(v) => Ok(Some(str_arg(name, v)?.chars().collect())),
        }
    };

    match name {
        "lower" => {
            arity(name, args, 0, 0)?;
            Ok(Value::str(&s.to_lowercase()))
        }
        "upper" => {
            arity(name, args, 0, 0)?;
            Ok(Value::str(&s.to_uppercase()))
        }
        "strip" | "lstrip" | "rstrip" => {
            arity(name, args, 0, 1)?;
            let stripped = match strip_chars(args)? {
                None => match name {
                    "strip" => s.trim(),
                    "lstrip" => s.trim_start(),
                    _ => s.trim_end(),
                },
                Some(chars) => {
                    let pred = |c: char| chars.contains(&c);
                    match name {
                        "strip" => s.trim_matches(pred),
                        "lstrip" => s.trim_start_matches(pred),
                        _ => s.trim_end_matches(pred),
                    }
                }
            };
            Ok(Value::str(stripped))
        }
        "join" => {
            arity(name, args, 1, 1)?;
            let items = args[0].iterate(limit)?;
            let mut parts = Vec::with_capacity(items.len());
            let mut total = 0usize;
            for (i, item) in items.iter().enumerate() {
                let Value::Str(part) = item else {
                    return Err(Exception::type_error(format!(
                        "sequence item {i}: expected str instance, {} found",
                        item.type_name()
                    )));
                };
                total += part.len() + s.len();
                if total > limit {
                    return Err(Exception::memory(limit));
                }
                parts.push(&**part);
            }
            Ok(Value::str(&parts.join(s)))
        }
        "startswith" | "endswith" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(affix_matches(
                name,
                s,
                &args[0],
                name == "startswith",
            )?))
        }
        "replace" => {
            arity(name, args, 2, 3)?;
            let old = str_arg(name, &args[0])?;
            let new = str_arg(name, &args[1])?;
            let count = match args.get(2) {
                Some(v) => int_arg(v)?,
                None => -1,
            };
            let occurrences = if old.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(old).count()
            };
            let estimated = s.len() + occurrences.saturating_mul(new.len());
            if estimated > limit {
                return Err(Exception::memory(limit));
            }
            let replaced = if count < 0 {
                s.replace(old, new)
            } else {
                s.replacen(old, new, count as usize)
            };
            Ok(Value::str(&replaced))
        }
        "find" | "index" => {
            arity(name, args, 1, 1)?;
            let sub = str_arg(name, &args[0])?;
            match s.find(sub) {
                Some(byte) => Ok(Value::Int(char_index(s, byte))),
                None if name == "find" => Ok(Value::Int(-1)),
                None => Err(Exception::value_error("substring not found")),
            }
        }
        "count" => {
            arity(name, args, 1, 1)?;
            let sub = str_arg(name, &args[0])?;
            let n = if sub.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(sub).count()
            };
            Ok(Value::Int(n as i64))
        }
        "isdigit" => {
            arity(name, args, 0, 0)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
        }
        _ => Err(no_method("str", name)),
    }
}

fn set_method(
    set: &Rc<RefCell<Set>>,
    name: &str,
    args: &[Value],
    limit: usize,
) -> Result<Value, Exception> {
    match name {
        "add" => {
            arity(name, args, 1, 1)?;
            let mut s = set.borrow_mut();
            if s.len() >= limit && !s.contains(&args[0])? {
                return Err(Exception::memory(limit));
            }
            s.add(args[0].clone())?;
            Ok(Value::None)
        }
        "discard" => {
            arity(name, args, 1, 1)?;
            set.borrow_mut().remove(&args[0])?;
            Ok(Value::None)
        }
        "remove" => {
            arity(name, args, 1, 1)?;
            if set.borrow_mut().remove(&args[0])? {
                Ok(Value::None)
            } else {
                Err(Exception::new(ExcType::KeyError, args[0].repr()))
            }
        }
        "union" => {
            let mut out = set.borrow().clone();
            for other in args {
                for item in other.iterate(limit)? {
                    out.add(item)?;
                }
                if out.len() > limit {
                    return Err(Exception::memory(limit));
                }
            }
            Ok(Value::set(out))
        }
        "intersection" | "difference" => {
            let mut items = set.borrow().items();
            for other in args {
                let other = Set::from_values(other.iterate(limit)?)?;
                let keep_members = name == "intersection";
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    if other.contains(&item)? == keep_members {
                        kept.push(item);
                    }
                }
                items = kept;
            }
            Ok(Value::set(Set::from_values(items)?))
        }
        "copy" => {
            arity(name, args, 0, 0)?;
            Ok(Value::set(set.borrow().clone()))
        }
        "clear" => {
            arity(name, args, 0, 0)?;
            set.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_method("set", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::tests::empty_registry;
    use crate::domain::parser::parse;
    use crate::domain::sandbox_config::SandboxConfig;
    use std::time::Instant;

    fn eval_with(registry: &CapabilityRegistry, source: &str) -> Result<Value, Exception> {
        let limits = SandboxConfig::default();
        let program = parse(source).unwrap();
        let mut interp = Interpreter::new(registry, &limits, Instant::now() + limits.timeout);
        match interp.run(&program) {
            Ok(()) => Ok(interp.global("result").unwrap_or(Value::None)),
            Err(Interrupt::Exception(e)) => Err(e),
            Err(Interrupt::Timeout) => panic!("unexpected timeout"),
        }
    }

    fn eval(source: &str) -> Value {
        eval_with(&empty_registry(), source).unwrap()
    }

    fn eval_err(source: &str) -> Exception {
        eval_with(&empty_registry(), source).unwrap_err()
    }

    mod functions {
        use super::*;

        #[test]
        fn aggregates() {
            assert_eq!(eval("result = sum([1, 2, 3], 10)").repr(), "16");
            assert_eq!(eval("result = sum(x * 0.5 for x in range(4))").repr(), "3.0");
            assert_eq!(eval("result = min(3, 1, 2)").repr(), "1");
            assert_eq!(eval("result = max(['aa', 'b'], key=len)").repr(), "'aa'");
            assert_eq!(eval("result = max([], default=None)").repr(), "None");
            assert_eq!(eval("result = (any([0, 1]), all([]))").repr(), "(True, True)");
            let e = eval_err("result = min([])");
            assert_eq!(e.message, "min() arg is an empty sequence");
        }

        #[test]
        fn sorted_is_stable_and_supports_reverse() {
            let src = "pairs = [(1, 'a'), (0, 'b'), (1, 'c')]\nresult = sorted(pairs, key=lambda p: p[0], reverse=True)";
            assert_eq!(eval(src).repr(), "[(1, 'a'), (1, 'c'), (0, 'b')]");
            let e = eval_err("result = sorted([1, 'a'])");
            assert_eq!(e.kind, ExcType::TypeError);
        }

        #[test]
        fn rounding_is_half_even() {
            assert_eq!(eval("result = round(2.5)").repr(), "2");
            assert_eq!(eval("result = round(3.5)").repr(), "4");
            assert_eq!(eval("result = round(2.675, 2)").repr(), "2.67");
            assert_eq!(eval("result = round(1250, -2)").repr(), "1200");
            assert_eq!(eval_err("result = round(float('nan'))").kind, ExcType::ValueError);
        }

        #[test]
        fn conversions() {
            assert_eq!(eval("result = int('  42 ')").repr(), "42");
            assert_eq!(eval("result = int(-3.9)").repr(), "-3");
            assert_eq!(eval("result = int('ff', 16)").repr(), "255");
            assert_eq!(eval("result = float('1e3')").repr(), "1000.0");
            assert_eq!(eval("result = str(1.0) + str(None)").repr(), "'1.0None'");
            assert_eq!(eval("result = dict([('a', 1)], b=2)").repr(), "{'a': 1, 'b': 2}");
            let e = eval_err("result = int('abc')");
            assert_eq!(e.message, "invalid literal for int() with base 10: 'abc'");
        }

        #[test]
        fn sequences() {
            assert_eq!(eval("result = list(range(5, 0, -2))").repr(), "[5, 3, 1]");
            assert_eq!(eval("result = list(enumerate('ab', 1))").repr(), "[(1, 'a'), (2, 'b')]");
            assert_eq!(eval("result = list(zip([1, 2, 3], 'xy'))").repr(), "[(1, 'x'), (2, 'y')]");
            assert_eq!(eval("result = reversed((1, 2))").repr(), "[2, 1]");
            assert_eq!(eval("result = len({'a': 1, 'b': 2})").repr(), "2");
            assert_eq!(eval_err("result = range(1, 2, 0)").kind, ExcType::ValueError);
        }

        #[test]
        fn numeric_helpers() {
            assert_eq!(eval("result = divmod(-7, 2)").repr(), "(-4, 1)");
            assert_eq!(eval("result = pow(3, 4, 5)").repr(), "1");
            assert_eq!(eval("result = pow(2, -1)").repr(), "0.5");
            assert_eq!(eval("result = abs(-2.5)").repr(), "2.5");
        }

        #[test]
        fn isinstance_checks() {
            assert_eq!(eval("result = isinstance(True, int)").repr(), "True");
            assert_eq!(eval("result = isinstance(1.5, (int, float))").repr(), "True");
            assert_eq!(eval("result = isinstance(ValueError('x'), Exception)").repr(), "True");
            assert_eq!(eval_err("result = isinstance(1, len)").kind, ExcType::TypeError);
        }

        #[test]
        fn globals_lookup_of_helper() {
            let src = "\
def handle_error(n):
    return n * 2
handler = globals().get('handle_error', None)
result = handler(21) if handler else None
";
            assert_eq!(eval(src).repr(), "42");
        }
    }

    mod math {
        use super::*;
        use approx::assert_relative_eq;

        fn float(source: &str) -> f64 {
            match eval(source) {
                Value::Float(f) => f,
                other => panic!("expected float, got {other:?}"),
            }
        }

        #[test]
        fn functions_and_constants() {
            assert_relative_eq!(float("result = math.exp(1)"), std::f64::consts::E);
            assert_relative_eq!(float("result = math.log(100, 10)"), 2.0);
            assert_relative_eq!(float("result = math.sqrt(2) ** 2"), 2.0, epsilon = 1e-12);
            assert_relative_eq!(float("result = math.atan2(1, 1)"), std::f64::consts::FRAC_PI_4);
            assert_eq!(eval("result = math.floor(-1.5)").repr(), "-2");
            assert_eq!(eval("result = math.isnan(math.nan)").repr(), "True");
        }

        #[test]
        fn domain_and_range_errors() {
            assert_eq!(eval_err("result = math.log(0)").message, "math domain error");
            assert_eq!(eval_err("result = math.sqrt(-1)").kind, ExcType::ValueError);
            assert_eq!(eval_err("result = math.exp(1000)").kind, ExcType::OverflowError);
            assert_eq!(eval_err("result = math.log('x')").kind, ExcType::TypeError);
            assert_eq!(eval_err("result = math.nope").kind, ExcType::AttributeError);
        }
    }

    mod methods {
        use super::*;

        #[test]
        fn list_methods() {
            let src = "\
xs = [3, 1, 2]
xs.append(4)
xs.extend([5])
xs.insert(0, 0)
last = xs.pop()
xs.remove(3)
xs.sort(reverse=True)
result = (xs, last, xs.index(2), xs.count(1))
";
            assert_eq!(eval(src).repr(), "([4, 2, 1, 0], 5, 1, 1)");
            assert_eq!(eval_err("[].pop()").message, "pop from empty list");
        }

        #[test]
        fn dict_methods() {
            let src = "\
d = {'a': 1}
d.update({'b': 2}, c=3)
d.setdefault('a', 100)
removed = d.pop('b')
result = (sorted(d.keys()), d.get('zz', 0), removed, list(d.items())[0])
";
            assert_eq!(eval(src).repr(), "(['a', 'c'], 0, 2, ('a', 1))");
            assert_eq!(eval_err("{}.pop('x')").kind, ExcType::KeyError);
        }

        #[test]
        fn str_methods() {
            assert_eq!(eval("result = ' a b  c '.split()").repr(), "['a', 'b', 'c']");
            assert_eq!(eval("result = 'a,b,c'.split(',', 1)").repr(), "['a', 'b,c']");
            assert_eq!(eval("result = '-'.join(['x', 'y'])").repr(), "'x-y'");
            assert_eq!(eval("result = 'xxhixx'.strip('x').upper()").repr(), "'HI'");
            assert_eq!(eval("result = 'SH.600519'.startswith(('SZ', 'SH'))").repr(), "True");
            assert_eq!(eval("result = 'banana'.replace('a', 'o', 2)").repr(), "'bonona'");
            assert_eq!(eval("result = ('abc'.find('c'), 'abc'.find('z'))").repr(), "(2, -1)");
            assert_eq!(eval("result = '600519'.isdigit()").repr(), "True");
            assert_eq!(eval_err("result = '-'.join([1])").kind, ExcType::TypeError);
        }

        #[test]
        fn set_methods() {
            let src = "\
s = {1, 2}
s.add(3)
s.discard(1)
result = (s.union([9]), s.intersection({2, 7}), s.difference([3]))
";
            assert_eq!(eval(src).repr(), "({2, 3, 9}, {2}, {2})");
            assert_eq!(eval_err("set().remove(1)").kind, ExcType::KeyError);
        }

        #[test]
        fn unknown_attribute() {
            let e = eval_err("result = [].nope");
            assert_eq!(e.kind, ExcType::AttributeError);
            assert_eq!(e.message, "'list' object has no attribute 'nope'");
        }
    }

    mod history {
        use super::*;
        use crate::domain::error::QuantscriptError;
        use crate::domain::history::HistoryProvider;
        use crate::domain::row::{ListQuery, RowPage, StockRow};
        use crate::ports::data_port::DataPort;
        use chrono::NaiveDate;
        use std::sync::Arc;

        struct TwoDays;

        impl DataPort for TwoDays {
            fn fetch_latest_row(&self, _: &str) -> Result<Option<StockRow>, QuantscriptError> {
                Ok(None)
            }
            fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
                Ok(Vec::new())
            }
            fn fetch_history(
                &self,
                _: &str,
                limit: usize,
            ) -> Result<Vec<HistoryPoint>, QuantscriptError> {
                let base = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
                Ok((0..2)
                    .map(|i| HistoryPoint {
                        trade_date: base - chrono::Duration::days(i),
                        close_price: Some(10.0 + i as f64),
                        volume: 1_000,
                        price_change_pct: None,
                    })
                    .take(limit)
                    .collect())
            }
            fn list_rows(&self, _: &ListQuery) -> Result<RowPage, QuantscriptError> {
                Ok(RowPage::default())
            }
        }

        fn registry() -> CapabilityRegistry {
            CapabilityRegistry::new(Arc::new(HistoryProvider::new(Arc::new(TwoDays))))
        }

        #[test]
        fn returns_list_of_dicts_most_recent_first() {
            let src = "h = get_history('SH.600519', 30)\nresult = (len(h), h[0]['trade_date'], h[1].get('close_price'), h[0]['price_change_pct'])";
            let v = eval_with(&registry(), src).unwrap();
            assert_eq!(v.repr(), "(2, '2024-03-01', 11.0, None)");
        }

        #[test]
        fn bad_arguments_degrade_gracefully() {
            let v = eval_with(&registry(), "result = len(get_history(123, 5))").unwrap();
            assert_eq!(v.repr(), "0");
            let v = eval_with(&registry(), "result = len(get_history('X', days='ten'))").unwrap();
            assert_eq!(v.repr(), "2");
            let v = eval_with(&registry(), "result = len(get_history('X', 1))").unwrap();
            assert_eq!(v.repr(), "1");
        }

        #[test]
        fn bool_days_count_as_integers() {
            let v = eval_with(&registry(), "result = len(get_history('X', True))").unwrap();
            assert_eq!(v.repr(), "1");
            // False clamps up to a single day.
            let v = eval_with(&registry(), "result = len(get_history('X', days=False))").unwrap();
            assert_eq!(v.repr(), "1");
        }
    }
}
