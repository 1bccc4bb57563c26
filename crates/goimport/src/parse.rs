use loupe_vfs::Memo;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tree_sitter::{Node, Parser, Tree};

/// How much of a file the importer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseMode {
    Full,
    /// Syntax errors inside function bodies are ignored.
    SkipFuncBodies,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub path: String,
    /// Explicit package name, `.` or `_`.
    pub name: Option<String>,
    pub row: usize,
    pub col: usize,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decl {
    pub name: String,
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub row: usize,
    pub col: usize,
    pub message: String,
}

/// The result of parsing one Go source file.
///
/// Entries are shared between files with identical contents, so nothing here
/// refers to the file's path.
pub struct ParsedFile {
    pub package: String,
    pub imports: Vec<ImportSpec>,
    pub decls: Vec<Decl>,
    /// Identifiers referenced outside the package clause and imports.
    pub uses: BTreeSet<String>,
    pub error: Option<SyntaxError>,
    pub tree: Option<Tree>,
    /// Set for empty sources.
    pub stub: bool,
}

impl ParsedFile {
    fn stub() -> Self {
        Self {
            package: String::new(),
            imports: Vec::new(),
            decls: Vec::new(),
            uses: BTreeSet::new(),
            error: None,
            tree: None,
            stub: true,
        }
    }

    pub fn is_cgo(&self) -> bool {
        self.imports.iter().any(|i| i.path == "C")
    }

    pub fn import_paths(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().map(|i| i.path.as_str())
    }
}

impl fmt::Debug for ParsedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedFile")
            .field("package", &self.package)
            .field("imports", &self.imports)
            .field("decls", &self.decls.len())
            .field("error", &self.error)
            .field("stub", &self.stub)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
struct ParseKey {
    hash: Vec<u8>,
    mode: ParseMode,
}

/// Parses `src`, memoising the result in `cache` under the content hash.
///
/// Without a cache every call parses again.
pub fn parse_file(cache: Option<&Memo>, src: &[u8], mode: ParseMode) -> Arc<ParsedFile> {
    let Some(cache) = cache else {
        return Arc::new(parse(src, mode));
    };
    let key = ParseKey {
        hash: Sha256::digest(src).to_vec(),
        mode,
    };
    cache.read(key, || parse(src, mode))
}

fn parse(src: &[u8], mode: ParseMode) -> ParsedFile {
    if src.is_empty() {
        return ParsedFile::stub();
    }
    let mut parser = Parser::new();
    let mut file = ParsedFile::stub();
    file.stub = false;
    if let Err(e) = parser.set_language(&tree_sitter_go::LANGUAGE.into()) {
        file.error = Some(SyntaxError {
            row: 0,
            col: 0,
            message: format!("Failed to set language: {e}"),
        });
        return file;
    }
    let Some(tree) = parser.parse(src, None) else {
        file.error = Some(SyntaxError {
            row: 0,
            col: 0,
            message: "Failed to parse source code".to_string(),
        });
        return file;
    };

    file.error = {
        let root = tree.root_node();
        let mut cursor = root.walk();
        for child in root.named_children(&mut cursor) {
            match child.kind() {
                "package_clause" => {
                    let mut c = child.walk();
                    let id = child
                        .named_children(&mut c)
                        .find(|n| n.kind() == "package_identifier");
                    if let Some(id) = id {
                        file.package = text(id, src).to_string();
                    }
                }
                "import_declaration" => collect_imports(child, src, &mut file.imports),
                "function_declaration" | "type_declaration" | "var_declaration"
                | "const_declaration" => {
                    collect_decls(child, src, &mut file.decls);
                    collect_uses(child, src, &mut file.uses);
                }
                _ => collect_uses(child, src, &mut file.uses),
            }
        }
        first_error(root, mode)
    };
    file.tree = Some(tree);
    file
}

fn text<'a>(n: Node<'_>, src: &'a [u8]) -> &'a str {
    n.utf8_text(src).unwrap_or("")
}

fn collect_imports(decl: Node<'_>, src: &[u8], out: &mut Vec<ImportSpec>) {
    let mut cursor = decl.walk();
    for n in decl.named_children(&mut cursor) {
        match n.kind() {
            "import_spec" => {
                if let Some(spec) = import_spec(n, src) {
                    out.push(spec);
                }
            }
            "import_spec_list" => collect_imports(n, src, out),
            _ => {}
        }
    }
}

fn import_spec(n: Node<'_>, src: &[u8]) -> Option<ImportSpec> {
    let path = n.child_by_field_name("path")?;
    let path = text(path, src).trim_matches(|c| c == '"' || c == '`');
    if path.is_empty() {
        return None;
    }
    let pos = n.start_position();
    Some(ImportSpec {
        path: path.to_string(),
        name: n
            .child_by_field_name("name")
            .map(|id| text(id, src).to_string()),
        row: pos.row,
        col: pos.column,
    })
}

fn collect_decls(n: Node<'_>, src: &[u8], out: &mut Vec<Decl>) {
    let mut push = |id: Node<'_>| {
        let name = text(id, src);
        if name.is_empty() || name == "_" {
            return;
        }
        let pos = id.start_position();
        out.push(Decl {
            name: name.to_string(),
            row: pos.row,
            col: pos.column,
        });
    };
    let mut cursor = n.walk();
    match n.kind() {
        "function_declaration" => {
            if let Some(id) = n.child_by_field_name("name") {
                if text(id, src) != "init" {
                    push(id);
                }
            }
        }
        _ => {
            let specs: Vec<Node<'_>> = n.named_children(&mut cursor).collect();
            for spec in specs {
                let specs = if spec.kind().ends_with("_spec_list") {
                    let mut c = spec.walk();
                    let list: Vec<Node<'_>> = spec.named_children(&mut c).collect();
                    list
                } else {
                    vec![spec]
                };
                for spec in specs {
                    let mut c = spec.walk();
                    for id in spec.children_by_field_name("name", &mut c) {
                        push(id);
                    }
                }
            }
        }
    }
}

fn collect_uses(n: Node<'_>, src: &[u8], out: &mut BTreeSet<String>) {
    let mut stack = vec![n];
    while let Some(n) = stack.pop() {
        if matches!(n.kind(), "identifier" | "package_identifier") {
            out.insert(text(n, src).to_string());
        }
        let mut cursor = n.walk();
        stack.extend(n.named_children(&mut cursor));
    }
}

fn is_func_body(n: Node<'_>) -> bool {
    n.kind() == "block"
        && n.parent().is_some_and(|p| {
            matches!(
                p.kind(),
                "function_declaration" | "method_declaration" | "func_literal"
            )
        })
}

fn first_error(root: Node<'_>, mode: ParseMode) -> Option<SyntaxError> {
    if !root.has_error() {
        return None;
    }
    let mut stack = vec![root];
    while let Some(n) = stack.pop() {
        if mode == ParseMode::SkipFuncBodies && is_func_body(n) {
            continue;
        }
        if n.is_error() || n.is_missing() {
            let pos = n.start_position();
            let message = if n.is_missing() {
                format!("syntax error: missing {}", n.kind())
            } else {
                "syntax error: unexpected input".to_string()
            };
            return Some(SyntaxError {
                row: pos.row,
                col: pos.column,
                message,
            });
        }
        if !n.has_error() {
            continue;
        }
        let mut cursor = n.walk();
        let children: Vec<Node<'_>> = n.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}
