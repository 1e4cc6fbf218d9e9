//! Static script validation.
//!
//! Parses the source and walks the tree once, rejecting anything that reaches
//! outside the capability registry. Nothing is executed. A script that passes
//! may still fail at run time (bad arithmetic, missing keys, timeouts) but it
//! cannot name anything the registry does not provide.

use std::collections::HashSet;

use crate::domain::ast::{
    Comprehension, Expr, ExprKind, FunctionDef, Param, Program, Stmt, StmtKind, Target,
};
use crate::domain::capability::{CapabilityRegistry, RESULT_BINDING};
use crate::domain::error::CompileError;
use crate::domain::parser::parse;

/// Parses and checks `source`, returning the approved program.
pub fn validate(registry: &CapabilityRegistry, source: &str) -> Result<Program, CompileError> {
    let program = parse(source)?;
    let mut bound = HashSet::new();
    collect_block(&program.body, &mut bound);
    let checker = Checker {
        registry,
        bound: &bound,
    };
    checker.check_block(&program.body, Scope::MODULE)?;
    Ok(program)
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    in_function: bool,
    in_loop: bool,
}

impl Scope {
    const MODULE: Scope = Scope {
        in_function: false,
        in_loop: false,
    };
}

// ---- pass 1: every name the script binds, in any scope ----

fn collect_block(stmts: &[Stmt], out: &mut HashSet<String>) {
    for stmt in stmts {
        collect_stmt(stmt, out);
    }
}

fn collect_target(target: &Target, out: &mut HashSet<String>) {
    for name in target.bound_names() {
        out.insert(name.to_string());
    }
    if let Target::Subscript { value, index } = target {
        collect_expr(value, out);
        collect_expr(index, out);
    }
}

fn collect_params(params: &[Param], out: &mut HashSet<String>) {
    for p in params {
        out.insert(p.name.clone());
        if let Some(d) = &p.default {
            collect_expr(d, out);
        }
    }
}

fn collect_stmt(stmt: &Stmt, out: &mut HashSet<String>) {
    match &stmt.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) | StmtKind::Raise(Some(e)) => {
            collect_expr(e, out)
        }
        StmtKind::Assign { targets, value } => {
            targets.iter().for_each(|t| collect_target(t, out));
            collect_expr(value, out);
        }
        StmtKind::AugAssign { target, value, .. } => {
            collect_target(target, out);
            collect_expr(value, out);
        }
        StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
            collect_expr(test, out);
            collect_block(body, out);
            collect_block(orelse, out);
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
        } => {
            collect_target(target, out);
            collect_expr(iter, out);
            collect_block(body, out);
            collect_block(orelse, out);
        }
        StmtKind::FunctionDef(def) => {
            out.insert(def.name.clone());
            collect_params(&def.params, out);
            collect_block(&def.body, out);
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            collect_block(body, out);
            for h in handlers {
                if let Some(name) = &h.name {
                    out.insert(name.clone());
                }
                collect_block(&h.body, out);
            }
            collect_block(orelse, out);
            collect_block(finalbody, out);
        }
        StmtKind::Assert { test, msg } => {
            collect_expr(test, out);
            if let Some(m) = msg {
                collect_expr(m, out);
            }
        }
        StmtKind::Global(names) => out.extend(names.iter().cloned()),
        _ => {}
    }
}

fn collect_generators(generators: &[Comprehension], out: &mut HashSet<String>) {
    for g in generators {
        collect_target(&g.target, out);
        collect_expr(&g.iter, out);
        g.ifs.iter().for_each(|e| collect_expr(e, out));
    }
}

/// Only lambdas and comprehensions bind names inside expressions.
fn collect_expr(expr: &Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Lambda(lambda) => {
            collect_params(&lambda.params, out);
            collect_expr(&lambda.body, out);
        }
        ExprKind::ListComp {
            element,
            generators,
        }
        | ExprKind::SetComp {
            element,
            generators,
        }
        | ExprKind::GeneratorExp {
            element,
            generators,
        } => {
            collect_generators(generators, out);
            collect_expr(element, out);
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            collect_generators(generators, out);
            collect_expr(key, out);
            collect_expr(value, out);
        }
        _ => for_each_child(expr, |child| collect_expr(child, out)),
    }
}

/// Visits the direct sub-expressions of a non-binding expression.
fn for_each_child(expr: &Expr, mut f: impl FnMut(&Expr)) {
    match &expr.kind {
        ExprKind::Constant(_) | ExprKind::Name(_) => {}
        ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
            items.iter().for_each(f)
        }
        ExprKind::Dict(entries) => {
            for (k, v) in entries {
                f(k);
                f(v);
            }
        }
        ExprKind::BinOp { left, right, .. } => {
            f(left);
            f(right);
        }
        ExprKind::UnaryOp { operand, .. } => f(operand),
        ExprKind::BoolOp { values, .. } => values.iter().for_each(f),
        ExprKind::Compare { left, ops } => {
            f(left);
            ops.iter().for_each(|(_, e)| f(e));
        }
        ExprKind::IfExp { test, body, orelse } => {
            f(test);
            f(body);
            f(orelse);
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            f(func);
            args.iter().for_each(&mut f);
            keywords.iter().for_each(|(_, e)| f(e));
        }
        ExprKind::Attribute { value, .. } => f(value),
        ExprKind::Subscript { value, index } => {
            f(value);
            f(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            for part in [lower, upper, step].into_iter().flatten() {
                f(part);
            }
        }
        ExprKind::Lambda(lambda) => f(&lambda.body),
        ExprKind::ListComp {
            element,
            generators,
        }
        | ExprKind::SetComp {
            element,
            generators,
        }
        | ExprKind::GeneratorExp {
            element,
            generators,
        } => {
            for g in generators {
                f(&g.iter);
                g.ifs.iter().for_each(&mut f);
            }
            f(element);
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            for g in generators {
                f(&g.iter);
                g.ifs.iter().for_each(&mut f);
            }
            f(key);
            f(value);
        }
    }
}

// ---- pass 2: enforce the capability surface ----

struct Checker<'a> {
    registry: &'a CapabilityRegistry,
    bound: &'a HashSet<String>,
}

impl Checker<'_> {
    fn check_block(&self, stmts: &[Stmt], scope: Scope) -> Result<(), CompileError> {
        stmts.iter().try_for_each(|s| self.check_stmt(s, scope))
    }

    /// Underscore and deny-list checks shared by every identifier position.
    fn check_identifier(&self, name: &str, line: usize) -> Result<(), CompileError> {
        if name.starts_with('_') {
            return Err(CompileError::forbidden(
                format!("name '{name}' is invalid: names starting with '_' are not allowed"),
                line,
            ));
        }
        if self.registry.is_denied(name) {
            return Err(CompileError::forbidden(
                format!("use of '{name}' is not allowed"),
                line,
            ));
        }
        Ok(())
    }

    fn check_load(&self, name: &str, line: usize) -> Result<(), CompileError> {
        self.check_identifier(name, line)?;
        let known = self.bound.contains(name)
            || self.registry.lookup(name).is_some()
            || self.registry.is_context_name(name);
        if !known {
            return Err(CompileError::forbidden(
                format!("name '{name}' is not defined"),
                line,
            ));
        }
        Ok(())
    }

    fn check_target(&self, target: &Target, line: usize) -> Result<(), CompileError> {
        match target {
            Target::Name(n) => self.check_identifier(n, line),
            Target::Subscript { value, index } => {
                self.check_expr(value)?;
                self.check_expr(index)
            }
            Target::Tuple(items) => items.iter().try_for_each(|t| self.check_target(t, line)),
        }
    }

    fn check_params(&self, params: &[Param], line: usize) -> Result<(), CompileError> {
        for p in params {
            self.check_identifier(&p.name, line)?;
            if let Some(d) = &p.default {
                self.check_expr(d)?;
            }
        }
        Ok(())
    }

    fn check_function(&self, def: &FunctionDef) -> Result<(), CompileError> {
        self.check_identifier(&def.name, def.line)?;
        self.check_params(&def.params, def.line)?;
        self.check_block(
            &def.body,
            Scope {
                in_function: true,
                in_loop: false,
            },
        )
    }

    fn check_stmt(&self, stmt: &Stmt, scope: Scope) -> Result<(), CompileError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(e) => self.check_expr(e),
            StmtKind::Assign { targets, value } => {
                targets
                    .iter()
                    .try_for_each(|t| self.check_target(t, line))?;
                self.check_expr(value)
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.check_target(target, line)?;
                self.check_expr(value)
            }
            StmtKind::If { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_block(body, scope)?;
                self.check_block(orelse, scope)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.check_target(target, line)?;
                self.check_expr(iter)?;
                self.check_block(
                    body,
                    Scope {
                        in_loop: true,
                        ..scope
                    },
                )?;
                self.check_block(orelse, scope)
            }
            StmtKind::While { test, body, orelse } => {
                self.check_expr(test)?;
                self.check_block(
                    body,
                    Scope {
                        in_loop: true,
                        ..scope
                    },
                )?;
                self.check_block(orelse, scope)
            }
            StmtKind::Break | StmtKind::Continue if !scope.in_loop => {
                let word = if matches!(stmt.kind, StmtKind::Break) {
                    "break"
                } else {
                    "continue"
                };
                Err(CompileError::forbidden(
                    format!("'{word}' outside loop"),
                    line,
                ))
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => Ok(()),
            StmtKind::FunctionDef(def) => self.check_function(def),
            StmtKind::Return(_) if !scope.in_function => {
                Err(CompileError::forbidden("'return' outside function", line))
            }
            StmtKind::Return(value) | StmtKind::Raise(value) => match value {
                Some(e) => self.check_expr(e),
                None => Ok(()),
            },
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.check_block(body, scope)?;
                for h in handlers {
                    if let Some(kind) = &h.kind {
                        self.check_expr(kind)?;
                    }
                    if let Some(name) = &h.name {
                        self.check_identifier(name, h.line)?;
                    }
                    self.check_block(&h.body, scope)?;
                }
                self.check_block(orelse, scope)?;
                self.check_block(finalbody, scope)
            }
            StmtKind::Assert { test, msg } => {
                self.check_expr(test)?;
                match msg {
                    Some(m) => self.check_expr(m),
                    None => Ok(()),
                }
            }
            StmtKind::Delete(targets) => targets
                .iter()
                .try_for_each(|t| self.check_target(t, line)),
            StmtKind::Global(names) => {
                for name in names {
                    if name != RESULT_BINDING {
                        return Err(CompileError::forbidden(
                            format!("global rebinding of '{name}' is not allowed"),
                            line,
                        ));
                    }
                }
                Ok(())
            }
            StmtKind::Nonlocal(_) => Err(CompileError::forbidden(
                "nonlocal statements are not allowed",
                line,
            )),
            StmtKind::Import(_) => Err(CompileError::forbidden(
                "import statements are not allowed",
                line,
            )),
        }
    }

    fn check_generators(&self, generators: &[Comprehension]) -> Result<(), CompileError> {
        for g in generators {
            self.check_target(&g.target, g.iter.line)?;
            self.check_expr(&g.iter)?;
            g.ifs.iter().try_for_each(|e| self.check_expr(e))?;
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), CompileError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Name(name) => self.check_load(name, line),
            ExprKind::Attribute { value, attr } => {
                self.check_expr(value)?;
                if attr.starts_with('_') {
                    return Err(CompileError::forbidden(
                        format!("name '{attr}' is invalid: names starting with '_' are not allowed"),
                        line,
                    ));
                }
                if !self.registry.allows_attribute(attr) {
                    return Err(CompileError::forbidden(
                        format!("attribute '{attr}' is not available"),
                        line,
                    ));
                }
                Ok(())
            }
            ExprKind::Call { keywords, .. } => {
                for (name, _) in keywords {
                    self.check_identifier(name, line)?;
                }
                self.check_children(expr)
            }
            ExprKind::Lambda(lambda) => {
                self.check_params(&lambda.params, lambda.line)?;
                self.check_expr(&lambda.body)
            }
            ExprKind::ListComp { generators, .. }
            | ExprKind::SetComp { generators, .. }
            | ExprKind::GeneratorExp { generators, .. }
            | ExprKind::DictComp { generators, .. } => {
                self.check_generators(generators)?;
                self.check_children(expr)
            }
            _ => self.check_children(expr),
        }
    }

    fn check_children(&self, expr: &Expr) -> Result<(), CompileError> {
        let mut result = Ok(());
        for_each_child(expr, |child| {
            if result.is_ok() {
                result = self.check_expr(child);
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::tests::empty_registry;
    use proptest::prelude::*;

    fn check(src: &str) -> Result<Program, CompileError> {
        validate(&empty_registry(), src)
    }

    fn rejection(src: &str) -> String {
        check(src).unwrap_err().to_string()
    }

    mod accepts {
        use super::*;

        #[test]
        fn simple_arithmetic() {
            assert!(check("result = 1 + 2 + 3").is_ok());
        }

        #[test]
        fn row_access() {
            assert!(check("result = row['close_price'] * 2").is_ok());
        }

        #[test]
        fn functions_loops_and_comprehensions() {
            let src = r#"
WINDOW = 20

def mean(xs):
    return sum(xs) / len(xs) if xs else 0

def score(row):
    history = get_history(row['symbol'], WINDOW)
    prices = [h['close_price'] for h in history if h.get('close_price')]
    if len(prices) < 2:
        return None
    logs = [math.log(p) for p in prices]
    total = 0
    for i, v in enumerate(logs):
        total += v * i
    pairs = sorted(zip(prices, logs), key=lambda pair: pair[1], reverse=True)
    return total / mean(prices) + len(pairs)

result = score(row)
"#;
            assert!(check(src).is_ok(), "{:?}", check(src).err());
        }

        #[test]
        fn global_result_and_exceptions() {
            let src = "def f():\n    global result\n    try:\n        result = 1 / 0\n    except ZeroDivisionError as e:\n        result = None\nf()\n";
            assert!(check(src).is_ok());
        }

        #[test]
        fn globals_lookup_of_handler() {
            let src = "def handle_error(a, b, c):\n    return None\nh = globals().get('handle_error', None)\nresult = h(1, 2, 'x') if h else None\n";
            assert!(check(src).is_ok());
        }

        #[test]
        fn names_bound_later_in_module() {
            let src = "def f():\n    return LIMIT * 2\nLIMIT = 3\nresult = f()\n";
            assert!(check(src).is_ok());
        }
    }

    mod rejects {
        use super::*;

        #[test]
        fn import_statements() {
            let msg = rejection("import os\nresult = 1");
            assert_eq!(msg, "line 1: import statements are not allowed");
            assert!(rejection("from os import path").contains("import statements"));
            assert!(rejection("def f():\n    import sys\n").contains("line 2"));
        }

        #[test]
        fn dunder_attribute_escape() {
            let msg = rejection("x = ().__class__.__bases__[0].__subclasses__()");
            assert!(msg.contains("names starting with '_'"), "{msg}");
            assert!(rejection("result = row.__dict__").contains("'__dict__'"));
        }

        #[test]
        fn underscore_names() {
            assert!(rejection("_x = 1").contains("'_x'"));
            assert!(rejection("for _ in range(3):\n    pass\n").contains("'_'"));
            assert!(rejection("result = __import__('os')").contains("__import__"));
        }

        #[test]
        fn dynamic_evaluation() {
            assert_eq!(
                rejection("result = eval('1 + 1')"),
                "line 1: use of 'eval' is not allowed"
            );
            assert!(rejection("exec('x = 1')").contains("'exec'"));
            assert!(rejection("f = open('/etc/passwd')").contains("'open'"));
            assert!(rejection("t = type(1)").contains("'type'"));
            assert!(rejection("getattr = 1").contains("'getattr'"));
        }

        #[test]
        fn unknown_attribute() {
            assert_eq!(
                rejection("x = 'a'\ny = x.format(1)"),
                "line 2: attribute 'format' is not available"
            );
        }

        #[test]
        fn undefined_name() {
            assert_eq!(
                rejection("result = os.getcwd()"),
                "line 1: name 'os' is not defined"
            );
        }

        #[test]
        fn global_and_nonlocal() {
            assert!(rejection("def f():\n    global total\n").contains("global rebinding of 'total'"));
            assert!(rejection("def f():\n    x = 1\n    def g():\n        nonlocal x\n").contains("nonlocal"));
        }

        #[test]
        fn misplaced_control_flow() {
            assert!(rejection("return 1").contains("'return' outside function"));
            assert!(rejection("break").contains("'break' outside loop"));
            assert!(
                rejection("for i in range(3):\n    def f():\n        continue\n")
                    .contains("'continue' outside loop")
            );
        }

        #[test]
        fn syntax_errors_carry_position() {
            let err = check("result = (1 +").unwrap_err();
            assert!(matches!(err, CompileError::Syntax(_)));
            assert_eq!(err.line(), Some(1));
            assert!(err.to_string().starts_with("SyntaxError:"));
        }

        #[test]
        fn keyword_argument_names() {
            assert!(rejection("result = sorted([1], _key=None)").contains("'_key'"));
        }
    }

    proptest! {
        #[test]
        fn registry_surface_scripts_pass(
            a in -1000i64..1000,
            b in 1i64..1000,
            func in prop::sample::select(vec!["abs", "round", "float", "int", "bool"]),
            reducer in prop::sample::select(vec!["min", "max", "sum"]),
        ) {
            let src = format!(
                "x = {a}\ny = {func}(x) + {b}\nvalues = [x, y, {b}]\nresult = {reducer}(values) / {b}\n"
            );
            prop_assert!(check(&src).is_ok());
        }

        #[test]
        fn dunder_attributes_always_fail(attr in "__[a-z]{1,10}__") {
            let src = format!("x = row.{attr}\nresult = 1\n");
            prop_assert!(check(&src).is_err());
        }

        #[test]
        fn imports_always_fail(module in "[a-z]{1,10}", nested in any::<bool>()) {
            let src = if nested {
                format!("def f():\n    import {module}\n    return 1\nresult = f()\n")
            } else {
                format!("import {module}\nresult = 1\n")
            };
            prop_assert!(check(&src).is_err());
        }
    }
}
