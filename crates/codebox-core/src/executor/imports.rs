//! Static scan of Python source for top-level module imports.

use std::sync::OnceLock;

use regex::Regex;

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*import\s+(.+)").expect("static regex"))
}

fn from_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import\b").expect("static regex")
    })
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Top-level module names referenced by `import` / `from ... import` statements,
/// in first-seen order without duplicates.
///
/// Relative imports (`from . import x`) are skipped: they never name an
/// installable distribution.
pub fn scan_imports(source_code: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        let top = name.trim().split('.').next().unwrap_or("").trim();
        if identifier_re().is_match(top) && !modules.iter().any(|m| m == top) {
            modules.push(top.to_string());
        }
    };

    let statements = source_code
        .lines()
        .flat_map(|line| line.split('#').next().unwrap_or("").split(';'));

    for statement in statements {
        if let Some(caps) = from_import_re().captures(statement) {
            push(&caps[1]);
        } else if let Some(caps) = import_re().captures(statement) {
            for clause in caps[1].split(',') {
                // `numpy as np` -> `numpy`
                let module = clause.split_whitespace().next().unwrap_or("");
                push(module);
            }
        }
    }

    modules
}
