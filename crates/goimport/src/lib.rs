//! # Loupe Go Import
//!
//! Resolves, parses and checks Go packages for editor diagnostics.
//!
//! ## Architecture
//!
//! ```text
//! Importer::import_from(ip, src_dir)
//!     │
//!     ├──> find_pkg            GOROOT → module (go.mod/go.sum, vendor, pkg/mod)
//!     │                        → module cache siblings → GOPATH
//!     │
//!     ├──> detect_cycle        walk the chain of packages being imported
//!     │
//!     └──> PkgState            shared per (package, build config), stored in
//!            │                 the directory's VFS memo, invalidated with it
//!            ├─ parse_dir      tree-sitter-go, cached by content hash
//!            ├─ import_deps    fan out over workers, first error wins
//!            ├─ cgo fallback   `go list -export` + export data reader
//!            └─ TypeChecker    first hard error becomes the package error
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use loupe_goimport::{BuildContext, Config, Importer};
//! use loupe_store::EnvMap;
//! use loupe_vfs::Vfs;
//! use std::path::Path;
//!
//! let env = EnvMap::from_os();
//! let kp = Importer::new(BuildContext::from_env(&env), Vfs::new(), Config::default());
//! let pkg = kp.import_from("fmt", Path::new("/tmp"), 0).unwrap();
//! println!("{} complete={}", pkg.name, pkg.complete);
//! ```

mod build;
mod cgo;
mod check;
mod error;
mod kimporter;
mod limits;
mod modfile;
mod parse;
mod pkg;
mod resolve;
mod typecheck;

pub use build::{
    clean_path, host_arch, host_os, BuildContext, SourceReader, SrcDirKey, DEFAULT_TAGS,
    GOPATH_UNDEFINED, GOROOT_UNDEFINED,
};
pub use check::{
    ArchiveReader, CheckConfig, CheckRequest, ExportDataReader, Package, PackageImporter,
    ShallowChecker, SourceFile, TypeChecker, TypeError,
};
pub use error::{ImportError, Result};
pub use kimporter::{Config, Importer};
pub use limits::{import_concurrency, ENV_IMPORT_CONCURRENCY};
pub use modfile::{encode_path, parse_go_mod, parse_go_sum, semver_is_valid, ModFile, Replace, Require};
pub use parse::{parse_file, Decl, ImportSpec, ParseMode, ParsedFile, SyntaxError};
pub use pkg::{import_dir, import_path_for_dir, Pkg, PkgPath};
pub use resolve::{find_pkg, is_local_import};
pub use typecheck::GoTypeCheck;
