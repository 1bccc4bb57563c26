use loupe_store::{EnvMap, View};
use loupe_vfs::{Node, Vfs};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use crate::error::Result;

pub const GOROOT_UNDEFINED: &str = "GOROOT-is-not-defined";
pub const GOPATH_UNDEFINED: &str = "GOPATH-is-not-defined";

/// Tags every import is built with.
pub const DEFAULT_TAGS: &[&str] = &["netgo", "osusergo"];

pub const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js", "linux",
    "nacl", "netbsd", "openbsd", "plan9", "solaris", "wasip1", "windows", "zos",
];

pub const KNOWN_ARCH: &[&str] = &[
    "386", "amd64", "amd64p32", "arm", "armbe", "arm64", "arm64be", "loong64", "mips", "mipsle",
    "mips64", "mips64le", "mips64p32", "mips64p32le", "ppc", "ppc64", "ppc64le", "riscv",
    "riscv64", "s390", "s390x", "sparc", "sparc64", "wasm",
];

const UNIX_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "linux",
    "netbsd", "openbsd", "solaris",
];

#[cfg(windows)]
const LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const LIST_SEPARATOR: &str = ":";

static WARN_GOROOT: Once = Once::new();
static WARN_GOPATH: Once = Once::new();

/// The running platform under its Go name.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

/// Identifies a source directory under one GOROOT/GOPATH pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrcDirKey {
    pub goroot: PathBuf,
    pub gopath: String,
    pub src_dir: PathBuf,
}

/// The build environment derived from the agent's environment variables.
///
/// GOROOT and GOPATH must be forwarded by the editor. When they are missing a
/// sentinel value is used instead so lookups fail rather than silently reading
/// the agent's own process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub goroot: PathBuf,
    pub gopath: Vec<PathBuf>,
    pub goos: String,
    pub goarch: String,
    pub tags: Vec<String>,
    pub cgo_enabled: bool,
    env: EnvMap,
}

impl BuildContext {
    pub fn from_env(env: &EnvMap) -> Self {
        let goroot = match env.get("GOROOT").filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None => {
                WARN_GOROOT.call_once(|| log::warn!("{GOROOT_UNDEFINED}"));
                GOROOT_UNDEFINED.to_string()
            }
        };
        let mut gopath: Vec<PathBuf> = env.list("GOPATH").into_iter().map(PathBuf::from).collect();
        if gopath.is_empty() {
            WARN_GOPATH.call_once(|| log::warn!("{GOPATH_UNDEFINED}"));
            gopath.push(PathBuf::from(GOPATH_UNDEFINED));
        }
        let goos = env.get_or("GOOS", host_os()).to_string();
        let goarch = env.get_or("GOARCH", host_arch()).to_string();
        let cgo_enabled = match env.get("CGO_ENABLED") {
            Some("0") => false,
            Some("1") => true,
            _ => goos == host_os() && goarch == host_arch(),
        };
        Self {
            goroot: PathBuf::from(goroot),
            gopath,
            goos,
            goarch,
            tags: DEFAULT_TAGS.iter().map(|t| t.to_string()).collect(),
            cgo_enabled,
            env: env.clone(),
        }
    }

    pub fn env(&self) -> &EnvMap {
        &self.env
    }

    /// GOPATH joined with the platform list separator.
    pub fn gopath_str(&self) -> String {
        self.gopath
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(LIST_SEPARATOR)
    }

    /// Build tags sorted and space separated.
    pub fn tags_str(&self) -> String {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.join(" ")
    }

    /// Returns a copy targeting another platform.
    pub fn with_target(&self, goos: &str, goarch: &str) -> Self {
        Self {
            goos: goos.to_string(),
            goarch: goarch.to_string(),
            ..self.clone()
        }
    }

    pub fn goroot_src(&self) -> PathBuf {
        self.goroot.join("src")
    }

    pub fn src_dir_key(&self, src_dir: &Path) -> SrcDirKey {
        SrcDirKey {
            goroot: self.goroot.clone(),
            gopath: self.gopath_str(),
            src_dir: clean_path(src_dir),
        }
    }

    /// The tool version from `GOVERSION` (`go1.12.3` → `(1, 12)`).
    pub fn go_version(&self) -> Option<(u32, u32)> {
        let v = self.env.get("GOVERSION")?.trim().strip_prefix("go")?;
        let mut parts = v.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some((major, minor))
    }

    /// Reports whether `tag` is satisfied in this context.
    pub fn match_tag(&self, tag: &str) -> bool {
        if tag == self.goos || tag == self.goarch || tag == "gc" {
            return true;
        }
        match tag {
            "unix" => UNIX_OS.contains(&self.goos.as_str()),
            "cgo" => self.cgo_enabled,
            "linux" => self.goos == "android",
            "solaris" => self.goos == "illumos",
            "darwin" => self.goos == "ios",
            _ if tag.starts_with("go1.") => tag[4..].chars().all(|c| c.is_ascii_digit()),
            _ => self.tags.iter().any(|t| t == tag),
        }
    }

    /// Applies the `_GOOS`, `_GOARCH` and `_GOOS_GOARCH` file name rules.
    pub fn match_file_name(&self, name: &str) -> bool {
        let stem = name.strip_suffix(".go").unwrap_or(name);
        let stem = stem.strip_suffix("_test").unwrap_or(stem);
        let Some(i) = stem.find('_') else {
            return true;
        };
        let parts: Vec<&str> = stem[i..].split('_').collect();
        let n = parts.len();
        if n >= 2 && KNOWN_OS.contains(&parts[n - 2]) && KNOWN_ARCH.contains(&parts[n - 1]) {
            return self.match_tag(parts[n - 2]) && self.match_tag(parts[n - 1]);
        }
        if KNOWN_OS.contains(&parts[n - 1]) || KNOWN_ARCH.contains(&parts[n - 1]) {
            return self.match_tag(parts[n - 1]);
        }
        true
    }

    /// Evaluates the build constraints in the file header.
    ///
    /// A `//go:build` line takes precedence over `// +build` lines. A malformed
    /// expression excludes the file.
    pub fn match_constraints(&self, src: &[u8]) -> bool {
        let text = String::from_utf8_lossy(header(src));
        let mut plus_build = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(expr) = line.strip_prefix("//go:build") {
                if !expr.is_empty() && !expr.starts_with(char::is_whitespace) {
                    continue;
                }
                return match constraint::parse(expr) {
                    Some(expr) => expr.eval(&|tag| self.match_tag(tag)),
                    None => {
                        log::debug!("goimport: malformed //go:build line: {line}");
                        false
                    }
                };
            }
            if let Some(rest) = line.strip_prefix("//") {
                if let Some(expr) = rest.trim_start().strip_prefix("+build") {
                    plus_build.push(expr.trim().to_string());
                }
            }
        }
        plus_build.iter().all(|line| {
            line.split_whitespace().any(|alt| {
                alt.split(',').all(|term| match term.strip_prefix('!') {
                    Some(t) => !self.match_tag(t),
                    None => self.match_tag(term),
                })
            })
        })
    }

    /// Reports whether module mode applies to `src_dir`.
    pub fn mod_enabled(&self, vfs: &Vfs, src_dir: &Path) -> bool {
        match self.env.get("GO111MODULE") {
            Some("on") => return true,
            Some("off") => return false,
            _ => {}
        }

        #[derive(Clone, PartialEq)]
        struct ModEnabledKey(SrcDirKey);

        let key = self.src_dir_key(src_dir);
        let nd = vfs.poke(&key.src_dir);
        let enabled = nd.memo().read(ModEnabledKey(key.clone()), || {
            if let Some((major, minor)) = self.go_version() {
                if major <= 1 && minor <= 12 {
                    let in_gopath = self.gopath.iter().any(|gp| {
                        let src = gp.join("src");
                        key.src_dir.starts_with(&src)
                    });
                    if in_gopath {
                        return false;
                    }
                }
            }
            self.mod_file(vfs, &key.src_dir).is_some()
        });
        *enabled
    }

    /// The nearest `go.mod` at or above `src_dir`.
    pub fn mod_file(&self, vfs: &Vfs, src_dir: &Path) -> Option<Arc<Node>> {
        vfs.poke(clean_path(src_dir))
            .locate("go.mod")
            .filter(|nd| nd.is_file())
    }
}

/// Everything before the package clause: blank lines and `//` comments.
fn header(src: &[u8]) -> &[u8] {
    let mut end = 0;
    let mut in_block = false;
    for line in src.split_inclusive(|&b| b == b'\n') {
        let t = String::from_utf8_lossy(line);
        let t = t.trim();
        if in_block {
            if t.contains("*/") {
                in_block = false;
            }
        } else if t.starts_with("/*") {
            in_block = !t.contains("*/");
        } else if !t.is_empty() && !t.starts_with("//") {
            break;
        }
        end += line.len();
    }
    &src[..end]
}

/// Reads source files the way the type checker should see them: the active
/// view's buffer first, then in-memory overrides, then the VFS blob cache,
/// then the disk.
#[derive(Clone, Default)]
pub struct SourceReader {
    vfs: Vfs,
    view: Option<View>,
    overrides: Arc<HashMap<PathBuf, Vec<u8>>>,
}

impl SourceReader {
    pub fn new(vfs: Vfs) -> Self {
        Self {
            vfs,
            ..Default::default()
        }
    }

    pub fn with_view(mut self, view: Option<View>) -> Self {
        self.view = view;
        self
    }

    pub fn with_overrides(mut self, overrides: Arc<HashMap<PathBuf, Vec<u8>>>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn view(&self) -> Option<&View> {
        self.view.as_ref()
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn read(&self, path: &Path) -> Result<Arc<Vec<u8>>> {
        if let Some(v) = &self.view {
            if v.path == path && !v.src.is_empty() {
                return Ok(Arc::new(v.src.clone()));
            }
        }
        if let Some(src) = self.overrides.get(path) {
            return Ok(Arc::new(src.clone()));
        }
        match self.vfs.blob(path) {
            Ok(b) => Ok(b),
            Err(err) => {
                log::debug!("goimport: vfs read of {} failed: {err}", path.display());
                Ok(Arc::new(fs::read(path)?))
            }
        }
    }
}

/// Lexically cleans a path: drops `.` and resolves `..` where possible.
pub fn clean_path(p: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

mod constraint {
    //! `//go:build` expressions: `!`, `&&`, `||`, parentheses and tags.

    #[derive(Debug, Clone, PartialEq)]
    pub enum Expr {
        Tag(String),
        Not(Box<Expr>),
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
    }

    impl Expr {
        pub fn eval(&self, ok: &dyn Fn(&str) -> bool) -> bool {
            match self {
                Self::Tag(t) => ok(t),
                Self::Not(x) => !x.eval(ok),
                Self::And(a, b) => a.eval(ok) && b.eval(ok),
                Self::Or(a, b) => a.eval(ok) || b.eval(ok),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Tok {
        LParen,
        RParen,
        Not,
        And,
        Or,
        Tag(String),
    }

    fn lex(s: &str) -> Option<Vec<Tok>> {
        let mut out = Vec::new();
        let mut chars = s.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' => {
                    chars.next();
                }
                '(' => {
                    chars.next();
                    out.push(Tok::LParen);
                }
                ')' => {
                    chars.next();
                    out.push(Tok::RParen);
                }
                '!' => {
                    chars.next();
                    out.push(Tok::Not);
                }
                '&' | '|' => {
                    chars.next();
                    if chars.next() != Some(c) {
                        return None;
                    }
                    out.push(if c == '&' { Tok::And } else { Tok::Or });
                }
                c if c.is_alphanumeric() || c == '_' || c == '.' => {
                    let mut tag = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '.' {
                            tag.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push(Tok::Tag(tag));
                }
                _ => return None,
            }
        }
        Some(out)
    }

    struct Parser {
        toks: Vec<Tok>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<&Tok> {
            self.toks.get(self.pos)
        }

        fn or(&mut self) -> Option<Expr> {
            let mut x = self.and()?;
            while self.peek() == Some(&Tok::Or) {
                self.pos += 1;
                x = Expr::Or(Box::new(x), Box::new(self.and()?));
            }
            Some(x)
        }

        fn and(&mut self) -> Option<Expr> {
            let mut x = self.not()?;
            while self.peek() == Some(&Tok::And) {
                self.pos += 1;
                x = Expr::And(Box::new(x), Box::new(self.not()?));
            }
            Some(x)
        }

        fn not(&mut self) -> Option<Expr> {
            if self.peek() == Some(&Tok::Not) {
                self.pos += 1;
                return Some(Expr::Not(Box::new(self.not()?)));
            }
            self.atom()
        }

        fn atom(&mut self) -> Option<Expr> {
            let tok = self.toks.get(self.pos).cloned()?;
            self.pos += 1;
            match tok {
                Tok::LParen => {
                    let x = self.or()?;
                    if self.peek() != Some(&Tok::RParen) {
                        return None;
                    }
                    self.pos += 1;
                    Some(x)
                }
                Tok::Tag(t) => Some(Expr::Tag(t)),
                _ => None,
            }
        }
    }

    pub fn parse(s: &str) -> Option<Expr> {
        let mut p = Parser {
            toks: lex(s)?,
            pos: 0,
        };
        let x = p.or()?;
        (p.pos == p.toks.len()).then_some(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn linux_amd64() -> BuildContext {
        let env = EnvMap::new()
            .add("GOROOT", "/usr/lib/go")
            .add("GOPATH", "/home/u/go")
            .add("GOOS", "linux")
            .add("GOARCH", "amd64");
        BuildContext::from_env(&env)
    }

    #[test]
    fn missing_roots_use_sentinels() {
        let bld = BuildContext::from_env(&EnvMap::new());
        assert_eq!(bld.goroot, PathBuf::from(GOROOT_UNDEFINED));
        assert_eq!(bld.gopath, vec![PathBuf::from(GOPATH_UNDEFINED)]);
        assert_eq!(bld.tags_str(), "netgo osusergo");
    }

    #[test]
    fn file_name_suffixes() {
        let bld = linux_amd64();
        assert!(bld.match_file_name("a.go"));
        assert!(bld.match_file_name("linux.go"));
        assert!(bld.match_file_name("a_linux.go"));
        assert!(bld.match_file_name("a_linux_amd64_test.go"));
        assert!(!bld.match_file_name("a_windows.go"));
        assert!(!bld.match_file_name("a_linux_arm64.go"));
        assert!(!bld.match_file_name("a_386.go"));
        assert!(bld.match_file_name("a_unknown.go"));
    }

    #[test]
    fn go_build_lines() {
        let bld = linux_amd64();
        assert!(!bld.match_constraints(b"//go:build ignore\n\npackage main\n"));
        assert!(bld.match_constraints(b"//go:build linux && (amd64 || arm64)\n\npackage a\n"));
        assert!(!bld.match_constraints(b"//go:build !unix\n\npackage a\n"));
        assert!(bld.match_constraints(b"// Copyright\n\n//go:build netgo\n\npackage a\n"));
        assert!(!bld.match_constraints(b"//go:build linux &&\npackage a\n"));
        assert!(bld.match_constraints(b"package a\n\n//go:build ignore\n"));
    }

    #[test]
    fn plus_build_lines() {
        let bld = linux_amd64();
        assert!(bld.match_constraints(b"// +build linux darwin\n\npackage a\n"));
        assert!(!bld.match_constraints(b"// +build windows\n\npackage a\n"));
        assert!(!bld.match_constraints(b"// +build linux,!amd64\n\npackage a\n"));
    }

    #[test]
    fn go_version_parses_release_strings() {
        let bld = BuildContext::from_env(&EnvMap::new().add("GOVERSION", "go1.12.3"));
        assert_eq!(bld.go_version(), Some((1, 12)));
        let bld = BuildContext::from_env(&EnvMap::new());
        assert_eq!(bld.go_version(), None);
    }

    #[test]
    fn module_mode_follows_go111module_and_go_mod() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("m/sub")).unwrap();
        std::fs::write(root.join("m/go.mod"), "module example.com/m\n").unwrap();
        std::fs::create_dir_all(root.join("plain")).unwrap();

        let vfs = Vfs::new();
        let bld = linux_amd64();
        assert!(bld.mod_enabled(&vfs, &root.join("m/sub")));
        assert!(!bld.mod_enabled(&vfs, &root.join("plain")));

        let off = BuildContext::from_env(&bld.env().add("GO111MODULE", "off"));
        assert!(!off.mod_enabled(&vfs, &root.join("m/sub")));
        let on = BuildContext::from_env(&bld.env().add("GO111MODULE", "on"));
        assert!(on.mod_enabled(&vfs, &root.join("plain")));
    }

    #[test]
    fn legacy_versions_ignore_modules_inside_gopath() {
        let dir = tempfile::tempdir().unwrap();
        let gp = dir.path().join("gp");
        let pkg = gp.join("src/example.com/p");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("go.mod"), "module example.com/p\n").unwrap();

        let env = EnvMap::new()
            .add("GOROOT", "/usr/lib/go")
            .add("GOPATH", gp.to_string_lossy())
            .add("GOVERSION", "go1.11");
        let vfs = Vfs::new();
        assert!(!BuildContext::from_env(&env).mod_enabled(&vfs, &pkg));
        let modern = env.add("GOVERSION", "go1.21.0");
        assert!(BuildContext::from_env(&modern).mod_enabled(&Vfs::new(), &pkg));
    }

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(clean_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path(Path::new("a/..")), PathBuf::from("."));
    }

    #[test]
    fn reader_prefers_the_view_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.go");
        std::fs::write(&path, "package disk\n").unwrap();
        let view = View::new(&path, "package buffer\n");
        let r = SourceReader::new(Vfs::new()).with_view(Some(view));
        assert_eq!(r.read(&path).unwrap().as_slice(), b"package buffer\n");
        let other = dir.path().join("b.go");
        std::fs::write(&other, "package disk\n").unwrap();
        assert_eq!(r.read(&other).unwrap().as_slice(), b"package disk\n");
    }
}
