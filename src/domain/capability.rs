//! Capability registry: the closed set of names a script can see.
//!
//! Built once, never mutated, and shared by every evaluation through an
//! `Arc`. Anything not listed here is unreachable from script code.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::domain::history::HistoryProvider;
use crate::domain::row::StockRow;

/// Name under which the current row is bound.
pub const ROW_BINDING: &str = "row";

/// Reserved variable a script assigns its answer to.
pub const RESULT_BINDING: &str = "result";

/// Names that are never exposed and are rejected wherever they appear.
pub const DENIED_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "file",
    "input",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "vars",
    "locals",
    "dir",
    "type",
    "id",
    "object",
    "super",
    "breakpoint",
    "memoryview",
    "help",
    "exit",
    "quit",
    "__import__",
    "__builtins__",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Abs,
    Min,
    Max,
    Sum,
    Round,
    Len,
    Range,
    Zip,
    Enumerate,
    Reversed,
    Sorted,
    List,
    Dict,
    Tuple,
    Set,
    Str,
    Int,
    Float,
    Bool,
    Isinstance,
    Pow,
    Divmod,
    Any,
    All,
    Globals,
    GetHistory,
}

const BUILTINS: &[(&str, Builtin, &str)] = &[
    ("abs", Builtin::Abs, "absolute value"),
    ("min", Builtin::Min, "smallest item (key=, default= supported)"),
    ("max", Builtin::Max, "largest item (key=, default= supported)"),
    ("sum", Builtin::Sum, "sum of an iterable, with optional start"),
    ("round", Builtin::Round, "round half to even, optional digits"),
    ("len", Builtin::Len, "number of items"),
    ("range", Builtin::Range, "arithmetic progression of integers"),
    ("zip", Builtin::Zip, "pairs items of several iterables"),
    ("enumerate", Builtin::Enumerate, "(index, item) pairs"),
    ("reversed", Builtin::Reversed, "items in reverse order"),
    ("sorted", Builtin::Sorted, "sorted list (key=, reverse= supported)"),
    ("list", Builtin::List, "list constructor"),
    ("dict", Builtin::Dict, "dict constructor"),
    ("tuple", Builtin::Tuple, "tuple constructor"),
    ("set", Builtin::Set, "set constructor"),
    ("str", Builtin::Str, "string conversion"),
    ("int", Builtin::Int, "integer conversion"),
    ("float", Builtin::Float, "float conversion"),
    ("bool", Builtin::Bool, "truth value"),
    ("isinstance", Builtin::Isinstance, "type test against builtin types"),
    ("pow", Builtin::Pow, "power, optional modulus"),
    ("divmod", Builtin::Divmod, "(quotient, remainder) pair"),
    ("any", Builtin::Any, "true if any item is true"),
    ("all", Builtin::All, "true if every item is true"),
    ("globals", Builtin::Globals, "snapshot of the script's module-level names"),
    ("get_history", Builtin::GetHistory, "history series for a symbol"),
];

impl Builtin {
    pub fn name(self) -> &'static str {
        BUILTINS
            .iter()
            .find(|(_, b, _)| *b == self)
            .map(|(n, _, _)| *n)
            .unwrap_or("<builtin>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Exp,
    Log,
    Log10,
    Log2,
    Pow,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Floor,
    Ceil,
    Fabs,
    IsNan,
    IsInf,
    IsFinite,
}

const MATH_FUNCTIONS: &[(&str, MathFn, &str)] = &[
    ("exp", MathFn::Exp, "e raised to x"),
    ("log", MathFn::Log, "natural logarithm, optional base"),
    ("log10", MathFn::Log10, "base-10 logarithm"),
    ("log2", MathFn::Log2, "base-2 logarithm"),
    ("pow", MathFn::Pow, "x raised to y, as float"),
    ("sqrt", MathFn::Sqrt, "square root"),
    ("sin", MathFn::Sin, "sine"),
    ("cos", MathFn::Cos, "cosine"),
    ("tan", MathFn::Tan, "tangent"),
    ("asin", MathFn::Asin, "arc sine"),
    ("acos", MathFn::Acos, "arc cosine"),
    ("atan", MathFn::Atan, "arc tangent"),
    ("atan2", MathFn::Atan2, "arc tangent of y/x"),
    ("floor", MathFn::Floor, "largest integer <= x"),
    ("ceil", MathFn::Ceil, "smallest integer >= x"),
    ("fabs", MathFn::Fabs, "absolute value, as float"),
    ("isnan", MathFn::IsNan, "true for NaN"),
    ("isinf", MathFn::IsInf, "true for infinities"),
    ("isfinite", MathFn::IsFinite, "true unless NaN or infinite"),
];

const MATH_CONSTANTS: &[(&str, f64)] = &[
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

impl MathFn {
    pub fn name(self) -> &'static str {
        MATH_FUNCTIONS
            .iter()
            .find(|(_, f, _)| *f == self)
            .map(|(n, _, _)| *n)
            .unwrap_or("<math>")
    }
}

/// Exception classes a script can raise and catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcType {
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    IndexError,
    KeyError,
    ValueError,
    TypeError,
    NameError,
    AttributeError,
    AssertionError,
    RuntimeError,
    RecursionError,
    MemoryError,
}

const EXCEPTIONS: &[(&str, ExcType)] = &[
    ("Exception", ExcType::Exception),
    ("ArithmeticError", ExcType::ArithmeticError),
    ("ZeroDivisionError", ExcType::ZeroDivisionError),
    ("OverflowError", ExcType::OverflowError),
    ("LookupError", ExcType::LookupError),
    ("IndexError", ExcType::IndexError),
    ("KeyError", ExcType::KeyError),
    ("ValueError", ExcType::ValueError),
    ("TypeError", ExcType::TypeError),
    ("NameError", ExcType::NameError),
    ("AttributeError", ExcType::AttributeError),
    ("AssertionError", ExcType::AssertionError),
    ("RuntimeError", ExcType::RuntimeError),
    ("RecursionError", ExcType::RecursionError),
    ("MemoryError", ExcType::MemoryError),
];

impl ExcType {
    pub fn name(self) -> &'static str {
        EXCEPTIONS
            .iter()
            .find(|(_, e)| *e == self)
            .map(|(n, _)| *n)
            .unwrap_or("Exception")
    }

    pub fn parent(self) -> Option<ExcType> {
        use ExcType::*;
        match self {
            Exception => None,
            ZeroDivisionError | OverflowError => Some(ArithmeticError),
            IndexError | KeyError => Some(LookupError),
            RecursionError => Some(RuntimeError),
            _ => Some(Exception),
        }
    }

    /// True when `self` is `other` or derives from it.
    pub fn is_subclass_of(self, other: ExcType) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == other {
                return true;
            }
            current = t.parent();
        }
        false
    }
}

/// What a registry-provided global name resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capability {
    Builtin(Builtin),
    Exception(ExcType),
    MathModule,
}

/// Method names callable on container and string values.
const METHODS: &[(&str, &[&str])] = &[
    (
        "list",
        &[
            "append", "extend", "insert", "pop", "remove", "index", "count", "reverse", "sort",
            "copy", "clear",
        ],
    ),
    (
        "dict",
        &[
            "get", "keys", "values", "items", "update", "pop", "setdefault", "copy", "clear",
        ],
    ),
    (
        "str",
        &[
            "lower", "upper", "strip", "lstrip", "rstrip", "split", "join", "startswith",
            "endswith", "replace", "find", "isdigit", "count", "index",
        ],
    ),
    (
        "set",
        &[
            "add", "discard", "remove", "union", "intersection", "difference", "copy", "clear",
        ],
    ),
];

#[derive(Debug)]
pub struct CapabilityRegistry {
    globals: BTreeMap<&'static str, Capability>,
    attributes: BTreeSet<&'static str>,
    history: Arc<HistoryProvider>,
}

impl CapabilityRegistry {
    pub fn new(history: Arc<HistoryProvider>) -> Self {
        let mut globals = BTreeMap::new();
        for (name, builtin, _) in BUILTINS {
            globals.insert(*name, Capability::Builtin(*builtin));
        }
        for (name, exc) in EXCEPTIONS {
            globals.insert(*name, Capability::Exception(*exc));
        }
        globals.insert("math", Capability::MathModule);

        let mut attributes = BTreeSet::new();
        for (_, names) in METHODS {
            attributes.extend(names.iter().copied());
        }
        attributes.extend(MATH_FUNCTIONS.iter().map(|(n, _, _)| *n));
        attributes.extend(MATH_CONSTANTS.iter().map(|(n, _)| *n));

        Self {
            globals,
            attributes,
            history,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Capability> {
        self.globals.get(name).copied()
    }

    pub fn is_context_name(&self, name: &str) -> bool {
        name == ROW_BINDING
    }

    pub fn is_denied(&self, name: &str) -> bool {
        DENIED_NAMES.contains(&name)
    }

    /// Whether `attr` may follow a `.` in script code.
    pub fn allows_attribute(&self, attr: &str) -> bool {
        self.attributes.contains(attr)
    }

    pub fn math_function(&self, name: &str) -> Option<MathFn> {
        MATH_FUNCTIONS
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, f, _)| *f)
    }

    pub fn math_constant(&self, name: &str) -> Option<f64> {
        MATH_CONSTANTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// Methods available on values of the given type name.
    pub fn methods_of(&self, type_name: &str) -> &'static [&'static str] {
        METHODS
            .iter()
            .find(|(t, _)| *t == type_name)
            .map(|(_, m)| *m)
            .unwrap_or(&[])
    }

    pub fn history(&self) -> &HistoryProvider {
        &self.history
    }

    /// Help catalogue for script authors.
    pub fn describe(&self) -> FunctionCatalog {
        FunctionCatalog {
            functions: vec![FunctionDoc {
                name: "get_history".into(),
                signature: "get_history(symbol: str, days: int) -> list".into(),
                description: "History of daily prices for a symbol, most recent first".into(),
                parameters: vec![
                    ParamDoc {
                        name: "symbol".into(),
                        kind: "str".into(),
                        description: "Symbol such as 'SH.600519'".into(),
                    },
                    ParamDoc {
                        name: "days".into(),
                        kind: "int".into(),
                        description: "Number of trading days (1-1000, default 250)".into(),
                    },
                ],
                returns: "list of dicts with close_price, trade_date, volume, price_change_pct"
                    .into(),
                example: "history = get_history('SH.600519', 250)".into(),
            }],
            modules: vec![ModuleDoc {
                name: "math".into(),
                description: "Math functions and constants".into(),
                functions: MATH_FUNCTIONS
                    .iter()
                    .map(|(n, _, d)| NamedDoc {
                        name: (*n).into(),
                        description: (*d).into(),
                    })
                    .chain(MATH_CONSTANTS.iter().map(|(n, _)| NamedDoc {
                        name: (*n).into(),
                        description: "constant".into(),
                    }))
                    .collect(),
            }],
            builtins: BUILTINS
                .iter()
                .filter(|(_, b, _)| *b != Builtin::GetHistory)
                .map(|(n, _, d)| NamedDoc {
                    name: (*n).into(),
                    description: (*d).into(),
                })
                .collect(),
            exceptions: EXCEPTIONS.iter().map(|(n, _)| (*n).to_string()).collect(),
            context: ContextDoc {
                name: ROW_BINDING.into(),
                description: "Latest daily row of the entity being evaluated".into(),
                properties: StockRow::FIELDS
                    .iter()
                    .map(|f| PropertyDoc {
                        name: (*f).into(),
                        kind: row_field_type(f).into(),
                    })
                    .collect(),
                example: "price = row['close_price']".into(),
            },
        }
    }
}

fn row_field_type(field: &str) -> &'static str {
    match field {
        "symbol" | "stock_name" | "trade_date" | "market_code" => "str",
        "volume" => "int",
        "close_price" | "turnover" => "float",
        _ => "float | None",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionCatalog {
    pub functions: Vec<FunctionDoc>,
    pub modules: Vec<ModuleDoc>,
    pub builtins: Vec<NamedDoc>,
    pub exceptions: Vec<String>,
    pub context: ContextDoc,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDoc {
    pub name: String,
    pub signature: String,
    pub description: String,
    pub parameters: Vec<ParamDoc>,
    pub returns: String,
    pub example: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDoc {
    pub name: String,
    pub description: String,
    pub functions: Vec<NamedDoc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedDoc {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextDoc {
    pub name: String,
    pub description: String,
    pub properties: Vec<PropertyDoc>,
    pub example: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}
