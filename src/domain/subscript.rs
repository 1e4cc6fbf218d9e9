//! Indexing and slicing of script values.

use crate::domain::capability::ExcType;
use crate::domain::value::{Exception, Value};

/// Evaluated `lower:upper:step` bounds; `None` means omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SliceSpec {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub step: Option<i64>,
}

impl SliceSpec {
    /// Normalised `(start, stop, step)` for a sequence of `len` items.
    fn bounds(&self, len: usize) -> Result<(i64, i64, i64), Exception> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Exception::value_error("slice step cannot be zero"));
        }
        let len = len as i64;
        let adjust = |bound: i64| {
            let b = if bound < 0 { bound.saturating_add(len) } else { bound };
            if step > 0 {
                b.clamp(0, len)
            } else {
                b.clamp(-1, len - 1)
            }
        };
        let (start, stop) = if step > 0 {
            (
                self.lower.map_or(0, adjust),
                self.upper.map_or(len, adjust),
            )
        } else {
            (
                self.lower.map_or(len - 1, adjust),
                self.upper.map_or(-1, adjust),
            )
        };
        Ok((start, stop, step))
    }

    /// Positions selected by the slice, in iteration order.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>, Exception> {
        let (start, stop, step) = self.bounds(len)?;
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(out)
    }
}

fn index_of(index: &Value, len: usize, what: &str) -> Result<usize, Exception> {
    let Some(i) = index.as_int() else {
        return Err(Exception::type_error(format!(
            "{what} indices must be integers or slices, not {}",
            index.type_name()
        )));
    };
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    if i < 0 || i >= len {
        return Err(Exception::new(
            ExcType::IndexError,
            format!("{what} index out of range"),
        ));
    }
    Ok(i as usize)
}

fn key_error(key: &Value) -> Exception {
    Exception::new(ExcType::KeyError, key.repr())
}

/// `container[key]`.
pub fn get_item(container: &Value, key: &Value) -> Result<Value, Exception> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let i = index_of(key, items.len(), "list")?;
            Ok(items[i].clone())
        }
        Value::Tuple(items) => {
            let i = index_of(key, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let len = s.chars().count();
            let i = index_of(key, len, "string")?;
            let c = s.chars().nth(i).unwrap_or_default();
            Ok(Value::str(c.encode_utf8(&mut [0; 4])))
        }
        Value::Range(r) => {
            let i = index_of(key, r.len(), "range object")?;
            Ok(Value::Int(r.get(i)))
        }
        Value::Dict(d) => d.borrow().get(key)?.ok_or_else(|| key_error(key)),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[lower:upper:step]`.
pub fn get_slice(container: &Value, spec: &SliceSpec) -> Result<Value, Exception> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let picked = spec.indices(items.len())?;
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = spec.indices(items.len())?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = spec.indices(chars.len())?;
            let out: String = picked.into_iter().map(|i| chars[i]).collect();
            Ok(Value::str(&out))
        }
        Value::Range(r) => {
            let picked = spec.indices(r.len())?;
            Ok(Value::list(
                picked.into_iter().map(|i| Value::Int(r.get(i))).collect(),
            ))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// `container[key] = value`.
pub fn set_item(container: &Value, key: Value, value: Value, limit: usize) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let i = index_of(&key, len, "list").map_err(|e| match e.kind {
                ExcType::IndexError => {
                    Exception::new(ExcType::IndexError, "list assignment index out of range")
                }
                _ => e,
            })?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(d) => {
            let mut d = d.borrow_mut();
            if d.len() >= limit && !d.contains(&key)? {
                return Err(Exception::memory(limit));
            }
            d.insert(key, value)
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `list[lower:upper:step] = iterable`.
pub fn set_slice(
    container: &Value,
    spec: &SliceSpec,
    value: Value,
    limit: usize,
) -> Result<(), Exception> {
    let Value::List(items) = container else {
        return Err(Exception::type_error(format!(
            "'{}' object does not support slice assignment",
            container.type_name()
        )));
    };
    let replacement = value.iterate(limit)?;
    let mut items = items.borrow_mut();
    let (start, stop, step) = spec.bounds(items.len())?;
    if step == 1 {
        let start = start as usize;
        let stop = (stop.max(start as i64)) as usize;
        if items.len() - (stop - start) + replacement.len() > limit {
            return Err(Exception::memory(limit));
        }
        items.splice(start..stop, replacement);
        return Ok(());
    }
    let picked = spec.indices(items.len())?;
    if picked.len() != replacement.len() {
        return Err(Exception::value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            replacement.len(),
            picked.len()
        )));
    }
    for (i, v) in picked.into_iter().zip(replacement) {
        items[i] = v;
    }
    Ok(())
}

/// `del container[key]`.
pub fn del_item(container: &Value, key: &Value) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = index_of(key, items.len(), "list")?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(d) => match d.borrow_mut().remove(key)? {
            Some(_) => Ok(()),
            None => Err(key_error(key)),
        },
        other => Err(Exception::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

/// `del list[lower:upper:step]`.
pub fn del_slice(container: &Value, spec: &SliceSpec) -> Result<(), Exception> {
    let Value::List(items) = container else {
        return Err(Exception::type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name()
        )));
    };
    let mut items = items.borrow_mut();
    let mut picked = spec.indices(items.len())?;
    picked.sort_unstable();
    for i in picked.into_iter().rev() {
        items.remove(i);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|v| Value::Int(*v)).collect())
    }

    fn slice(lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> SliceSpec {
        SliceSpec { lower, upper, step }
    }

    #[test]
    fn negative_indices_count_from_end() {
        let xs = ints(&[1, 2, 3]);
        assert_eq!(get_item(&xs, &Value::Int(-1)).unwrap().repr(), "3");
        let e = get_item(&xs, &Value::Int(3)).unwrap_err();
        assert_eq!(e.kind, ExcType::IndexError);
        assert_eq!(e.message, "list index out of range");
    }

    #[test]
    fn slices_follow_python_bounds() {
        let xs = ints(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(get_slice(&xs, &slice(Some(-3), None, None)).unwrap().repr(), "[3, 4, 5]");
        assert_eq!(get_slice(&xs, &slice(None, None, Some(-2))).unwrap().repr(), "[5, 3, 1]");
        assert_eq!(get_slice(&xs, &slice(Some(10), Some(20), None)).unwrap().repr(), "[]");
        assert_eq!(get_slice(&xs, &slice(Some(4), Some(1), Some(-1))).unwrap().repr(), "[4, 3, 2]");
        let s = Value::str("momentum");
        assert_eq!(get_slice(&s, &slice(None, Some(3), None)).unwrap().to_display(), "mom");
        assert!(get_slice(&xs, &slice(None, None, Some(0))).is_err());
    }

    #[test]
    fn slice_assignment_resizes_list() {
        let xs = ints(&[0, 1, 2, 3]);
        set_slice(&xs, &slice(Some(1), Some(3), None), ints(&[9]), 100).unwrap();
        assert_eq!(xs.repr(), "[0, 9, 3]");
        let e = set_slice(&xs, &slice(None, None, Some(2)), ints(&[1]), 100).unwrap_err();
        assert_eq!(e.kind, ExcType::ValueError);
    }

    #[test]
    fn dict_access_and_missing_key() {
        let d = Value::dict(Default::default());
        set_item(&d, Value::str("k"), Value::Int(1), 10).unwrap();
        assert_eq!(get_item(&d, &Value::str("k")).unwrap().repr(), "1");
        let e = get_item(&d, &Value::str("missing")).unwrap_err();
        assert_eq!(e.kind, ExcType::KeyError);
        assert_eq!(e.message, "'missing'");
        del_item(&d, &Value::str("k")).unwrap();
        assert!(del_item(&d, &Value::str("k")).is_err());
    }

    #[test]
    fn tuples_are_immutable() {
        let t = Value::tuple(vec![Value::Int(1)]);
        let e = set_item(&t, Value::Int(0), Value::Int(2), 10).unwrap_err();
        assert_eq!(e.message, "'tuple' object does not support item assignment");
    }

    #[test]
    fn delete_extended_slice() {
        let xs = ints(&[0, 1, 2, 3, 4]);
        del_slice(&xs, &slice(None, None, Some(2))).unwrap();
        assert_eq!(xs.repr(), "[1, 3]");
    }
}
