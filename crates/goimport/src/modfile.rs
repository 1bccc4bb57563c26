//! A lax reader for `go.mod` and `go.sum`.
//!
//! Only the directives the resolver needs are kept: `module`, `go`,
//! `require` and `replace`. Unknown directives are skipped.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{ImportError, Result};

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^v(0|[1-9]\d*)(?:\.(0|[1-9]\d*)(?:\.(0|[1-9]\d*)(?:-[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?(?:\+[0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*)?)?)?$",
    )
    .expect("semver pattern")
});

/// Reports whether `v` is a valid semantic version such as `v1.2.3`.
pub fn semver_is_valid(v: &str) -> bool {
    SEMVER.is_match(v)
}

/// Escapes upper-case letters as `!` + lower-case, the module cache layout.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Require {
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replace {
    pub old_path: String,
    pub old_version: Option<String>,
    pub new_path: String,
    pub new_version: Option<String>,
}

impl Replace {
    /// Local replacements name a directory rather than a module.
    pub fn is_local(&self) -> bool {
        self.new_path.starts_with('/') || self.new_path.starts_with('.')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModFile {
    pub module: String,
    pub go: Option<String>,
    pub require: Vec<Require>,
    pub replace: Vec<Replace>,
}

fn unquote(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '`')
}

fn strip_comment(line: &str) -> &str {
    let line = match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    };
    line.trim()
}

pub fn parse_go_mod(src: &str) -> Result<ModFile> {
    let mut mf = ModFile::default();
    let mut block: Option<String> = None;
    for (i, raw) in src.lines().enumerate() {
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        if let Some(verb) = &block {
            if line == ")" {
                block = None;
                continue;
            }
            apply(&mut mf, verb, line, i)?;
            continue;
        }
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((v, r)) => (v, r.trim()),
            None => (line, ""),
        };
        if rest == "(" {
            block = Some(verb.to_string());
            continue;
        }
        apply(&mut mf, verb, rest, i)?;
    }
    if mf.module.is_empty() {
        return Err(ImportError::Other(
            "go.mod: no module declaration".to_string(),
        ));
    }
    Ok(mf)
}

fn apply(mf: &mut ModFile, verb: &str, args: &str, line: usize) -> Result<()> {
    let bad = |what: &str| {
        ImportError::Other(format!("go.mod:{}: malformed {what} directive", line + 1))
    };
    let fields: Vec<&str> = args.split_whitespace().map(unquote).collect();
    match verb {
        "module" => {
            mf.module = fields.first().ok_or_else(|| bad("module"))?.to_string();
        }
        "go" => mf.go = fields.first().map(|s| s.to_string()),
        "require" => {
            let [path, version, ..] = fields.as_slice() else {
                return Err(bad("require"));
            };
            mf.require.push(Require {
                path: path.to_string(),
                version: version.to_string(),
            });
        }
        "replace" => {
            let arrow = fields
                .iter()
                .position(|f| *f == "=>")
                .ok_or_else(|| bad("replace"))?;
            let (old, new) = (&fields[..arrow], &fields[arrow + 1..]);
            if old.is_empty() || new.is_empty() || old.len() > 2 || new.len() > 2 {
                return Err(bad("replace"));
            }
            mf.replace.push(Replace {
                old_path: old[0].to_string(),
                old_version: old.get(1).map(|s| s.to_string()),
                new_path: new[0].to_string(),
                new_version: new.get(1).map(|s| s.to_string()),
            });
        }
        other => log::debug!("go.mod: skipping `{other}` directive"),
    }
    Ok(())
}

/// Module versions listed in `go.sum`, skipping `/go.mod` hash lines.
pub fn parse_go_sum(src: &str) -> Vec<Require> {
    src.lines()
        .filter_map(|ln| {
            let fields: Vec<&str> = ln.split_whitespace().collect();
            let [path, version, _hash] = fields.as_slice() else {
                return None;
            };
            semver_is_valid(version).then(|| Require {
                path: path.to_string(),
                version: version.to_string(),
            })
        })
        .collect()
}
