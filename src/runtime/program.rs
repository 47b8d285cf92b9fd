//! Kernel program sources and build options.
//!
//! Programs are WGSL with a small preprocessing layer driven by build options
//! of the form `-DNAME` or `-DNAME=VALUE`:
//!
//! - `#ifdef NAME`, `#ifndef NAME`, `#else`, `#endif` lines select blocks
//! - every identifier that names a defined option is replaced by its value
//! - each `KERNEL_ARG` token becomes the next binding index, so argument
//!   positions follow declaration order after conditional blocks are resolved
//!
//! `LOCAL_SIZE_X`, `LOCAL_SIZE_Y` and `LOCAL_SIZE_Z` are left in place; devices
//! substitute them for each launch shape with [`substitute_tokens`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use briny::prelude::*;

use crate::error::{Error, Result};

/// Token numbered sequentially to produce positional binding indices.
pub const KERNEL_ARG_TOKEN: &str = "KERNEL_ARG";

/// Tokens a device replaces with the launch's local size.
pub const LOCAL_SIZE_TOKENS: [&str; 3] = ["LOCAL_SIZE_X", "LOCAL_SIZE_Y", "LOCAL_SIZE_Z"];

const CHANNEL_SHUFFLE: &str = include_str!("shaders/channel_shuffle.wgsl");
const SLICE: &str = include_str!("shaders/slice.wgsl");

lazy_static::lazy_static! {
    static ref PROGRAM_SOURCES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("channel_shuffle", CHANNEL_SHUFFLE);
        m.insert("slice", SLICE);
        m
    };
}

/// Built-in source of `program`, if one exists.
pub fn program_source(program: &str) -> Option<&'static str> {
    PROGRAM_SOURCES.get(program).copied()
}

/// Ordered set of build options; the order-independent part of a kernel identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildOptions(BTreeSet<String>);

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `-DNAME`.
    pub fn define(&mut self, name: &str) -> &mut Self {
        self.0.insert(format!("-D{name}"));
        self
    }

    /// Adds `-DNAME=VALUE`.
    pub fn define_value(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.0.insert(format!("-D{name}={value}"));
        self
    }

    /// Whether `name` is defined, with or without a value.
    pub fn is_defined(&self, name: &str) -> bool {
        self.defines().iter().any(|(n, _)| *n == name)
    }

    /// Value given to `name`, if it was defined with one.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.defines()
            .into_iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    fn defines(&self) -> Vec<(&str, Option<&str>)> {
        self.0
            .iter()
            .filter_map(|opt| opt.strip_prefix("-D"))
            .map(|def| match def.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (def, None),
            })
            .collect()
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(" "))
    }
}

/// Renames a kernel symbol. With the `obfuscate` feature the result is a hash
/// of the name; otherwise the name is returned unchanged.
pub fn obfuscate_symbol(name: &str) -> String {
    if cfg!(feature = "obfuscate") {
        format!("k{:016x}", fnv1a(name.as_bytes()))
    } else {
        name.to_string()
    }
}

/// 64-bit FNV-1a; stable across runs and platforms.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Sanity checks applied to every source before preprocessing.
struct KernelText<'a>(&'a str);

impl Validate for KernelText<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let src = self.0;
        if src.is_empty() || src.len() > 1 << 16 {
            return Err(ValidationError);
        }
        if !src.contains("@compute") {
            return Err(ValidationError);
        }
        if src.contains("#include") {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Applies `options` to `source`.
///
/// # Errors
/// Fails on unbalanced or unknown directives.
pub fn preprocess(program: &str, source: &str, options: &BuildOptions) -> Result<String> {
    KernelText(source).validate().map_err(|_| Error::Compile {
        program: program.to_string(),
        msg: "source rejected by sanity check".to_string(),
    })?;

    let compile_err = |line: usize, msg: &str| Error::Compile {
        program: program.to_string(),
        msg: format!("line {}: {msg}", line + 1),
    };

    let defines: HashMap<&str, &str> = options
        .defines()
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or("1")))
        .collect();

    // One entry per open block: (parent active, this branch active, seen #else)
    let mut stack: Vec<(bool, bool, bool)> = Vec::new();
    let mut active = true;
    let mut out = String::with_capacity(source.len());
    let mut next_arg = 0u32;

    for (n, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(directive) = trimmed.strip_prefix('#') {
            let mut parts = directive.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("ifdef"), Some(name)) => {
                    let taken = defines.contains_key(name);
                    stack.push((active, taken, false));
                    active = active && taken;
                }
                (Some("ifndef"), Some(name)) => {
                    let taken = !defines.contains_key(name);
                    stack.push((active, taken, false));
                    active = active && taken;
                }
                (Some("else"), None) => {
                    let top = stack.last_mut().ok_or_else(|| compile_err(n, "#else without #ifdef"))?;
                    if top.2 {
                        return Err(compile_err(n, "duplicate #else"));
                    }
                    top.1 = !top.1;
                    top.2 = true;
                    active = top.0 && top.1;
                }
                (Some("endif"), None) => {
                    let (parent, _, _) = stack.pop().ok_or_else(|| compile_err(n, "#endif without #ifdef"))?;
                    active = parent;
                }
                _ => return Err(compile_err(n, "unknown directive")),
            }
            continue;
        }
        if !active {
            continue;
        }
        let replaced = replace_identifiers(line, |ident| {
            if ident == KERNEL_ARG_TOKEN {
                let idx = next_arg;
                next_arg += 1;
                Some(idx.to_string())
            } else {
                defines.get(ident).map(|v| (*v).to_string())
            }
        });
        out.push_str(&replaced);
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(Error::Compile {
            program: program.to_string(),
            msg: "unterminated #ifdef".to_string(),
        });
    }
    Ok(out)
}

/// Replaces whole identifiers listed in `tokens`.
pub fn substitute_tokens(text: &str, tokens: &[(&str, String)]) -> String {
    replace_identifiers(text, |ident| {
        tokens
            .iter()
            .find(|(name, _)| *name == ident)
            .map(|(_, value)| value.clone())
    })
}

fn replace_identifiers(text: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = start + c.len_utf8();
            while let Some(&(i, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    end = i + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let ident = &text[start..end];
            match lookup(ident) {
                Some(value) => out.push_str(&value),
                None => out.push_str(ident),
            }
        } else if c.is_ascii_digit() {
            // numeric literals such as `4u` must not be split into an identifier
            out.push(c);
            while let Some(&(_, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' || next == '.' {
                    out.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
