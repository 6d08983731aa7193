use std::fmt::Write as _;

use super::compiler::Op;
use super::typeck::Type;

/// What a builtin parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// String or capture.
    Str,
    /// Integer; a capture is parsed as an integer.
    Int,
    /// Any scalar value: int, float, string, capture or bool.
    Any,
}

/// Built-in function: single source of truth for name, type signature, AND opcode.
/// Adding a builtin means adding ONE entry here; typeck, compiler and the
/// `compile --builtins` listing all read from this.
#[derive(Debug, Clone)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub params: &'static [(&'static str, Param)],
    pub ret: Type,
    pub op: Op,
    pub category: &'static str,
    pub description: &'static str,
}

/// All built-in functions available in programs.
pub static BUILTINS: &[BuiltinFn] = &[
    // ── Time ────────────────────────────────────────────────────
    BuiltinFn {
        name: "strptime", params: &[("s", Param::Str), ("format", Param::Str)], ret: Type::Int,
        op: Op::Strptime, category: "time",
        description: "Parse s with a strftime-style format, use it as the line's timestamp, and return it as unix seconds",
    },
    BuiltinFn {
        name: "timestamp", params: &[], ret: Type::Int,
        op: Op::Timestamp, category: "time",
        description: "The line's timestamp in unix seconds (the current time unless strptime or settime set it)",
    },
    BuiltinFn {
        name: "settime", params: &[("seconds", Param::Int)], ret: Type::Void,
        op: Op::Settime, category: "time",
        description: "Set the line's timestamp from unix seconds",
    },
    // ── Conversion ──────────────────────────────────────────────
    BuiltinFn {
        name: "int", params: &[("x", Param::Any)], ret: Type::Int,
        op: Op::ToInt, category: "conversion",
        description: "Convert to integer; floats truncate, strings are parsed",
    },
    BuiltinFn {
        name: "float", params: &[("x", Param::Any)], ret: Type::Float,
        op: Op::ToFloat, category: "conversion",
        description: "Convert to float; strings are parsed",
    },
    BuiltinFn {
        name: "string", params: &[("x", Param::Any)], ret: Type::Str,
        op: Op::ToStr, category: "conversion",
        description: "Convert to string",
    },
    BuiltinFn {
        name: "strtol", params: &[("s", Param::Str), ("base", Param::Int)], ret: Type::Int,
        op: Op::Strtol, category: "conversion",
        description: "Parse s as an integer in the given base (2 to 36)",
    },
    // ── String ──────────────────────────────────────────────────
    BuiltinFn {
        name: "len", params: &[("s", Param::Str)], ret: Type::Int,
        op: Op::Len, category: "string",
        description: "Length of s in characters",
    },
    BuiltinFn {
        name: "tolower", params: &[("s", Param::Str)], ret: Type::Str,
        op: Op::ToLower, category: "string",
        description: "Lowercase copy of s",
    },
    BuiltinFn {
        name: "toupper", params: &[("s", Param::Str)], ret: Type::Str,
        op: Op::ToUpper, category: "string",
        description: "Uppercase copy of s",
    },
    BuiltinFn {
        name: "subst", params: &[("old", Param::Str), ("new", Param::Str), ("s", Param::Str)], ret: Type::Str,
        op: Op::Subst, category: "string",
        description: "Replace every occurrence of old in s with new; old may also be a regex",
    },
    // ── Source ──────────────────────────────────────────────────
    BuiltinFn {
        name: "getfilename", params: &[], ret: Type::Str,
        op: Op::GetFilename, category: "source",
        description: "Path of the log file the current line came from",
    },
];

pub fn lookup_builtin(name: &str) -> Option<&'static BuiltinFn> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// One line per builtin, for `logmill compile --builtins`.
pub fn reference() -> String {
    let mut out = String::new();
    let mut category = "";
    for b in BUILTINS {
        if b.category != category {
            category = b.category;
            let _ = writeln!(out, "# {category}");
        }
        let params: Vec<&str> = b.params.iter().map(|(name, _)| *name).collect();
        let _ = writeln!(out, "{}({}) -> {}  {}", b.name, params.join(", "), b.ret, b.description);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, a) in BUILTINS.iter().enumerate() {
            assert!(
                BUILTINS.iter().skip(i + 1).all(|b| b.name != a.name),
                "duplicate builtin {}",
                a.name
            );
        }
    }

    #[test]
    fn lookup() {
        assert_eq!(lookup_builtin("strptime").map(|b| b.op), Some(Op::Strptime));
        assert!(lookup_builtin("nope").is_none());
    }

    #[test]
    fn reference_lists_every_builtin() {
        let text = reference();
        for b in BUILTINS {
            assert!(text.contains(&format!("{}(", b.name)));
        }
    }
}
