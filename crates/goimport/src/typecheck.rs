use loupe_store::{
    Ctx, Issue, QueryIssues, Reducer, State, ViewActivated, ViewLoaded, ViewSaved,
};
use std::path::PathBuf;

use crate::kimporter::{Config, Importer};

/// Type-checks the package of the active Go view and reports the first
/// problem as an issue.
///
/// Checks run when a view is loaded, activated or saved; the latest issues
/// are repeated for every `QueryIssues` on the same file.
#[derive(Debug, Default)]
pub struct GoTypeCheck {
    concurrency: usize,
    path: PathBuf,
    issues: Vec<Issue>,
}

impl GoTypeCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps dependency import workers; 0 keeps the process default.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    fn run(&mut self, mx: &Ctx) {
        let view = mx.view();
        if mx.action_is::<ViewSaved>() {
            let nd = mx.vfs.poke(view.filename());
            nd.invalidate();
            if let Err(err) = nd.stat() {
                log::debug!("{}: {err}", mx.label());
            }
        }
        let cfg = Config {
            check_funcs: true,
            check_imports: true,
            tests: true,
            concurrency: self.concurrency,
            ..Default::default()
        };
        let kp = Importer::from_ctx(mx, cfg);
        self.path = view.filename();
        self.issues = match kp.import_from(".", view.dir(), 0) {
            Ok(_) => Vec::new(),
            Err(err) => {
                log::debug!("{}: {err}", mx.label());
                let mut issue = err.issue().unwrap_or_else(|| {
                    let mut issue = Issue::error(err.to_string());
                    issue.path = self.path.display().to_string();
                    issue
                });
                issue.label = "go/types".to_string();
                vec![issue]
            }
        };
    }
}

impl Reducer for GoTypeCheck {
    fn label(&self) -> String {
        "GoTypeCheck".to_string()
    }

    fn cond(&mut self, mx: &Ctx) -> bool {
        mx.view().lang_is(&["go"])
    }

    fn unmount(&mut self, _mx: &Ctx) {
        self.path = PathBuf::new();
        self.issues.clear();
    }

    fn reduce(&mut self, mx: &Ctx) -> State {
        if mx.action_is::<ViewSaved>() || mx.action_is::<ViewLoaded>() || mx.action_is::<ViewActivated>() {
            self.run(mx);
        } else if !mx.action_is::<QueryIssues>() {
            return mx.state.clone();
        }
        if self.path != mx.view().filename() {
            return mx.state.clone();
        }
        mx.state.clone().add_issues(self.issues.iter().cloned())
    }
}
