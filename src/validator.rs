//! Static validation of submitted tool source
//!
//! Pure static analysis: the source is scanned and parsed, never executed.
//! Two passes run over every submission:
//!
//! 1. A lexical pass over the raw source (skipping string literals and
//!    comments) that flags internal-convention identifiers and known
//!    dangerous names wherever they appear, including inside function
//!    bodies.
//! 2. An AST pass over the parsed tree that enforces the construct
//!    allow-list (no `import`/`export`, no `try`/`catch`, no
//!    module-qualified calls) and checks every call target against the
//!    allowed function set.
//!
//! Anything the validator misses is still unreachable at runtime: the
//! capability engine's namespace contains nothing beyond the whitelisted
//! primitives and bridge functions.

use std::collections::HashSet;

use rhai::{ASTNode, Engine, Expr, FnCallExpr, Position, Stmt, AST};
use tracing::debug;

use crate::types::{ValidationOutcome, Violation, ViolationKind};

/// Functions from the whitelisted packages that scripts may call.
const SAFE_BUILTINS: &[&str] = &[
    // inspection and conversion
    "len", "is_empty", "type_of", "to_string", "to_int", "to_float", "to_char",
    "parse_int", "parse_float", "to_debug",
    // math
    "abs", "min", "max", "floor", "ceiling", "round", "sqrt", "pow", "sign",
    // arrays
    "push", "pop", "shift", "insert", "remove", "clear", "contains", "sort",
    "reverse", "filter", "map", "reduce", "some", "all", "find", "index_of",
    "extract", "split", "truncate", "range",
    // maps
    "keys", "values", "get", "set", "mixin", "fill_with",
    // strings
    "to_upper", "to_lower", "trim", "sub_string", "starts_with", "ends_with",
    "replace", "pad", "crop", "chars",
    // diagnostics (no-ops in the capability engine unless the host wires them)
    "print", "debug",
];

/// Rhai keywords; skipped by the lexical pass (constructs are judged on the
/// parsed tree instead). `import`/`export` are deliberately absent so the
/// lexical pass flags them even when the surrounding source fails to parse.
const KEYWORDS: &[&str] = &[
    "let", "const", "if", "else", "switch", "while", "do", "until", "loop",
    "for", "in", "break", "continue", "return", "fn", "private", "true",
    "false", "throw", "try", "catch", "as", "global", "this",
];

/// Known-dangerous call targets with their violation kinds.
///
/// None of these exist in the capability engine; rejecting them statically
/// gives the submitter a precise reason instead of a runtime fault.
fn denied_name(name: &str) -> Option<(ViolationKind, &'static str)> {
    match name {
        "eval" => Some((
            ViolationKind::DisallowedBuiltin,
            "code evaluation is not allowed",
        )),
        "Fn" | "curry" | "call" | "is_def_fn" | "is_def_var" => Some((
            ViolationKind::DisallowedBuiltin,
            "dynamic function dispatch is not allowed",
        )),
        "require" | "include" | "load" | "load_module" | "use" => Some((
            ViolationKind::DisallowedImport,
            "module loading is not allowed",
        )),
        "exec" | "system" | "spawn" | "command" | "shell" | "popen" => Some((
            ViolationKind::DisallowedBuiltin,
            "process execution is not allowed",
        )),
        "open" | "read_file" | "write_file" | "remove_file" | "mkdir" | "dir" => Some((
            ViolationKind::DisallowedBuiltin,
            "file-system access is not allowed",
        )),
        "connect" | "fetch" | "request" | "socket" | "http_get" | "http_post"
        | "download" => Some((
            ViolationKind::DisallowedBuiltin,
            "network access is not allowed",
        )),
        "sleep" | "exit" | "abort" => Some((
            ViolationKind::DisallowedBuiltin,
            "host control primitives are not allowed",
        )),
        _ => None,
    }
}

/// Policy knobs for static validation.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Largest accepted source text, in bytes
    pub max_source_bytes: usize,
    /// Expression nesting depth accepted by the parser
    pub max_expr_depth: usize,
    /// Host-bridge functions scripts may call
    pub bridge_functions: HashSet<String>,
}

impl ValidationPolicy {
    pub fn new(max_source_bytes: usize, max_expr_depth: usize) -> Self {
        Self {
            max_source_bytes,
            max_expr_depth,
            bridge_functions: HashSet::new(),
        }
    }

    /// Builder: set the callable bridge-function names.
    pub fn with_bridge_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bridge_functions = names.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::new(64 * 1024, 64)
    }
}

/// Validates submitted source against the capability policy.
#[derive(Debug, Clone)]
pub struct StaticValidator {
    policy: ValidationPolicy,
}

impl StaticValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Validate raw source text.
    ///
    /// Returns the outcome and, when validation passes, the parsed tree.
    pub fn validate(&self, source: &str) -> (ValidationOutcome, Option<AST>) {
        if source.len() > self.policy.max_source_bytes {
            let violation = Violation::new(
                ViolationKind::SourceTooLarge,
                "<source>",
                None,
                None,
                format!(
                    "source is {} bytes, limit is {}",
                    source.len(),
                    self.policy.max_source_bytes
                ),
            );
            return (ValidationOutcome::fail(vec![violation]), None);
        }

        let mut violations = Vec::new();
        scan_identifiers(source, &mut violations);

        // Parse with a bare engine: no namespace exists at validation time,
        // so parsing cannot trigger any host behavior.
        let mut engine = Engine::new_raw();
        engine.set_max_expr_depths(self.policy.max_expr_depth, self.policy.max_expr_depth);

        let ast = match engine.compile(source) {
            Ok(ast) => ast,
            Err(err) => {
                let (line, column) = position_of(err.1);
                violations.push(Violation::new(
                    ViolationKind::SyntaxError,
                    "<syntax>",
                    line,
                    column,
                    err.to_string(),
                ));
                sort_violations(&mut violations);
                return (ValidationOutcome::fail(violations), None);
            }
        };

        let script_fns: HashSet<String> = ast
            .iter_functions()
            .map(|f| f.name.to_string())
            .collect();

        self.walk_tree(&ast, &script_fns, &mut violations);
        sort_violations(&mut violations);

        if violations.is_empty() {
            (ValidationOutcome::pass(), Some(ast))
        } else {
            debug!(count = violations.len(), "source rejected by static validation");
            (ValidationOutcome::fail(violations), None)
        }
    }

    fn walk_tree(&self, ast: &AST, script_fns: &HashSet<String>, violations: &mut Vec<Violation>) {
        let mut on_node = |path: &[ASTNode]| {
            let Some(node) = path.last() else {
                return true;
            };
            match node {
                ASTNode::Stmt(stmt) => match stmt {
                    // Statement-level calls are their own node kind, not a
                    // wrapped expression.
                    Stmt::FnCall(call, pos) => {
                        self.check_call(call, *pos, script_fns, violations);
                    }
                    Stmt::Import(..) => {
                        let (line, column) = position_of(stmt.position());
                        violations.push(Violation::new(
                            ViolationKind::DisallowedImport,
                            "import",
                            line,
                            column,
                            "importing modules is not allowed",
                        ));
                    }
                    Stmt::Export(..) => {
                        let (line, column) = position_of(stmt.position());
                        violations.push(Violation::new(
                            ViolationKind::DisallowedImport,
                            "export",
                            line,
                            column,
                            "exporting symbols is not allowed",
                        ));
                    }
                    Stmt::TryCatch(..) => {
                        let (line, column) = position_of(stmt.position());
                        violations.push(Violation::new(
                            ViolationKind::DisallowedConstruct,
                            "try/catch",
                            line,
                            column,
                            "error suppression is not allowed; errors surface as structured results",
                        ));
                    }
                    _ => {}
                },
                ASTNode::Expr(expr) => match expr {
                    Expr::FnCall(call, pos) | Expr::MethodCall(call, pos) => {
                        self.check_call(call, *pos, script_fns, violations);
                    }
                    _ => {}
                },
                _ => {}
            }
            true
        };

        ast.walk(&mut on_node);

        // Function bodies face the same policy as the main flow; any
        // duplicate findings collapse in the final sort/dedup.
        let mut path = Vec::new();
        for def in ast.iter_fn_def() {
            for stmt in def.body.iter() {
                stmt.walk(&mut path, &mut on_node);
            }
        }
    }

    fn check_call(
        &self,
        call: &FnCallExpr,
        pos: Position,
        script_fns: &HashSet<String>,
        violations: &mut Vec<Violation>,
    ) {
        let name = call.name.as_str();
        let (line, column) = position_of(pos);

        if !call.namespace.is_empty() {
            violations.push(Violation::new(
                ViolationKind::DisallowedImport,
                name,
                line,
                column,
                "module-qualified calls are not allowed",
            ));
            return;
        }

        // Operators surface as calls with symbolic names; they are part of
        // the whitelisted packages.
        if !name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        {
            return;
        }

        // Capturing closures lower to a compiler-generated `curry` call; the
        // user-written form is caught by the lexical pass.
        if name == "curry" {
            return;
        }

        if let Some((kind, reason)) = denied_name(name) {
            violations.push(Violation::new(kind, name, line, column, reason));
            return;
        }

        if script_fns.contains(name)
            || self.policy.bridge_functions.contains(name)
            || SAFE_BUILTINS.contains(&name)
        {
            return;
        }

        violations.push(Violation::new(
            ViolationKind::DisallowedBuiltin,
            name,
            line,
            column,
            format!("'{name}' is not in the allowed function set"),
        ));
    }
}

fn position_of(pos: Position) -> (Option<usize>, Option<usize>) {
    (pos.line(), pos.position())
}

fn sort_violations(violations: &mut Vec<Violation>) {
    violations.sort_by_key(|v| (v.line.unwrap_or(usize::MAX), v.column.unwrap_or(usize::MAX)));
    // The lexical and tree passes can flag the same name; report it once.
    violations.dedup_by(|a, b| a.kind == b.kind && a.construct == b.construct && a.line == b.line);
}

// ============================================================================
// Lexical pass
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum LexState {
    Normal,
    LineComment,
    BlockComment,
    Str,
    Backtick,
    /// Inside `${ ... }` of an interpolated string
    Interp,
}

/// Scan identifiers outside strings and comments, flagging
/// internal-convention names and known dangerous names.
///
/// Runs on the raw source so it also covers function bodies and any region
/// the tree walk might not reach.
fn scan_identifiers(source: &str, violations: &mut Vec<Violation>) {
    let mut state = LexState::Normal;
    // Where to return after a string ends (Normal or Interp)
    let mut string_return = LexState::Normal;
    let mut comment_return = LexState::Normal;
    let mut block_depth = 0usize;
    let mut brace_depth = 0usize;

    let mut line = 1usize;
    let mut column = 0usize;

    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\n' {
            line += 1;
            column = 0;
            if state == LexState::LineComment {
                state = comment_return;
            }
            continue;
        }
        column += 1;

        match state {
            LexState::LineComment => {}
            LexState::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    column += 1;
                    block_depth -= 1;
                    if block_depth == 0 {
                        state = comment_return;
                    }
                } else if ch == '/' && chars.peek() == Some(&'*') {
                    chars.next();
                    column += 1;
                    block_depth += 1;
                }
            }
            LexState::Str => {
                if ch == '\\' {
                    chars.next();
                    column += 1;
                } else if ch == '"' {
                    state = string_return;
                }
            }
            LexState::Backtick => {
                if ch == '`' {
                    state = LexState::Normal;
                } else if ch == '$' && chars.peek() == Some(&'{') {
                    chars.next();
                    column += 1;
                    state = LexState::Interp;
                    brace_depth = 1;
                }
            }
            LexState::Normal | LexState::Interp => {
                match ch {
                    '/' if chars.peek() == Some(&'/') => {
                        chars.next();
                        column += 1;
                        comment_return = state;
                        state = LexState::LineComment;
                    }
                    '/' if chars.peek() == Some(&'*') => {
                        chars.next();
                        column += 1;
                        comment_return = state;
                        state = LexState::BlockComment;
                        block_depth = 1;
                    }
                    '"' => {
                        string_return = state;
                        state = LexState::Str;
                    }
                    '`' => {
                        state = LexState::Backtick;
                    }
                    '{' if state == LexState::Interp => {
                        brace_depth += 1;
                    }
                    '}' if state == LexState::Interp => {
                        brace_depth -= 1;
                        if brace_depth == 0 {
                            state = LexState::Backtick;
                        }
                    }
                    c if c.is_ascii_digit() => {
                        // numeric literal (digit separators, hex, suffixes)
                        while chars
                            .peek()
                            .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_' || *n == '.')
                        {
                            chars.next();
                            column += 1;
                        }
                    }
                    c if c.is_ascii_alphabetic() || c == '_' => {
                        let start_column = column;
                        let mut ident = String::new();
                        ident.push(c);
                        while chars
                            .peek()
                            .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_')
                        {
                            ident.push(chars.next().unwrap_or_default());
                            column += 1;
                        }
                        check_identifier(&ident, line, start_column, violations);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn check_identifier(ident: &str, line: usize, column: usize, violations: &mut Vec<Violation>) {
    if ident == "import" || ident == "export" {
        violations.push(Violation::new(
            ViolationKind::DisallowedImport,
            ident,
            Some(line),
            Some(column),
            "module import/export is not allowed",
        ));
        return;
    }
    if KEYWORDS.contains(&ident) {
        return;
    }
    if ident.starts_with('_') || ident.contains("__") {
        violations.push(Violation::new(
            ViolationKind::DisallowedAttribute,
            ident,
            Some(line),
            Some(column),
            "internal-convention names are not allowed",
        ));
        return;
    }
    if let Some((kind, reason)) = denied_name(ident) {
        violations.push(Violation::new(kind, ident, Some(line), Some(column), reason));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> StaticValidator {
        StaticValidator::new(
            ValidationPolicy::default()
                .with_bridge_functions(crate::bridge::BRIDGE_FUNCTIONS.iter().copied()),
        )
    }

    fn kinds(outcome: &ValidationOutcome) -> Vec<ViolationKind> {
        outcome.violations.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn test_import_rejected() {
        let (outcome, ast) = validator().validate("import os");
        assert!(!outcome.passed);
        assert!(ast.is_none());
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedImport));
    }

    #[test]
    fn test_eval_rejected() {
        let (outcome, _) = validator().validate(r#"eval("1 + 1")"#);
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedBuiltin));
        assert_eq!(outcome.violations[0].construct, "eval");
    }

    #[test]
    fn test_internal_names_rejected() {
        let (outcome, _) = validator().validate("let _secret = 1; _secret");
        assert!(!outcome.passed);
        assert!(kinds(&outcome)
            .iter()
            .all(|k| *k == ViolationKind::DisallowedAttribute));

        let (outcome, _) = validator().validate("let a = #{}; a.__internal");
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedAttribute));
    }

    #[test]
    fn test_try_catch_rejected() {
        let (outcome, _) = validator().validate("try { 1 } catch { 2 }");
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedConstruct));
    }

    #[test]
    fn test_file_and_process_primitives_rejected() {
        let (outcome, _) = validator().validate(r#"open("/etc/passwd")"#);
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedBuiltin));

        let (outcome, _) = validator().validate(r#"system("rm -rf /")"#);
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedBuiltin));
    }

    #[test]
    fn test_unknown_call_rejected_by_allow_list() {
        let (outcome, _) = validator().validate("frobnicate(1)");
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, ViolationKind::DisallowedBuiltin);
        assert_eq!(outcome.violations[0].construct, "frobnicate");
    }

    #[test]
    fn test_module_qualified_call_rejected() {
        let (outcome, _) = validator().validate(r#"foo::bar(1)"#);
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedImport));
    }

    #[test]
    fn test_syntax_error_reported_with_position() {
        let (outcome, ast) = validator().validate("let x = {{{{");
        assert!(!outcome.passed);
        assert!(ast.is_none());
        assert_eq!(outcome.violations[0].kind, ViolationKind::SyntaxError);
        assert!(outcome.violations[0].line.is_some());
    }

    #[test]
    fn test_source_too_large() {
        let policy = ValidationPolicy::new(16, 64);
        let (outcome, _) = StaticValidator::new(policy).validate("let abcdefgh = 12345;");
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, ViolationKind::SourceTooLarge);
    }

    #[test]
    fn test_valid_source_passes() {
        let source = r#"
            fn total(xs) {
                let sum = 0;
                for x in xs {
                    sum += x;
                }
                sum
            }
            let records = fetch_records(args.owner);
            total([1, 2, 3])
        "#;
        let (outcome, ast) = validator().validate(source);
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
        assert!(ast.is_some());
    }

    #[test]
    fn test_names_inside_strings_ignored() {
        let (outcome, _) = validator().validate(r#"let x = "eval system __proto__"; x"#);
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
    }

    #[test]
    fn test_names_inside_comments_ignored() {
        let source = "// eval system\n/* __internal */\nlet x = 1; x";
        let (outcome, _) = validator().validate(source);
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
    }

    #[test]
    fn test_interpolated_strings_scanned() {
        let (outcome, _) = validator().validate("let x = `value: ${_hidden}`; x");
        assert!(!outcome.passed);
        assert!(kinds(&outcome).contains(&ViolationKind::DisallowedAttribute));
    }

    #[test]
    fn test_violations_ordered_by_position() {
        let source = "let a = 1;\neval(\"x\");\nopen(\"f\")";
        let (outcome, _) = validator().validate(source);
        assert!(!outcome.passed);
        let lines: Vec<_> = outcome.violations.iter().filter_map(|v| v.line).collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
    }

    #[test]
    fn test_capturing_closure_passes() {
        let source = "let limit = 1; [1, 2, 3].filter(|x| x > limit)";
        let (outcome, ast) = validator().validate(source);
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
        assert!(ast.is_some());
    }

    #[test]
    fn test_calls_inside_fn_bodies_checked() {
        let (outcome, _) = validator().validate("fn helper() { frobnicate() } helper()");
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].kind, ViolationKind::DisallowedBuiltin);
        assert_eq!(outcome.violations[0].construct, "frobnicate");
    }

    #[test]
    fn test_user_written_curry_rejected() {
        let (outcome, _) = validator().validate("let f = |x| x; curry(f, 1)");
        assert!(!outcome.passed);
        assert!(outcome.violations.iter().any(|v| v.construct == "curry"));
    }

    #[test]
    fn test_numeric_separators_not_identifiers() {
        let (outcome, _) = validator().validate("let x = 1_000_000; x");
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
    }
}
