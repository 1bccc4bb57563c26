use crate::env::EnvMap;
use crate::view::View;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Editor configuration supplied by reducers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EditorConfig {
    /// Languages the editor should forward events for; empty means all.
    pub enabled_for_langs: Vec<String>,
    /// Editor-specific settings, passed through untouched.
    pub settings: serde_json::Value,
}

impl EditorConfig {
    pub fn enabled_for(mut self, langs: &[&str]) -> Self {
        self.enabled_for_langs = langs.iter().map(|l| l.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Completion {
    pub query: String,
    pub title: String,
    pub src: String,
    pub tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueTag {
    #[default]
    Error,
    Warning,
    Notice,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Issue {
    pub path: String,
    pub name: String,
    pub row: usize,
    pub col: usize,
    pub end: usize,
    pub tag: IssueTag,
    pub label: String,
    pub message: String,
}

impl Issue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            tag: IssueTag::Warning,
            message: message.into(),
            ..Default::default()
        }
    }

    /// An issue needs a location (path or buffer name) and a message.
    pub fn is_valid(&self) -> bool {
        (!self.path.is_empty() || !self.name.is_empty()) && !self.message.is_empty()
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = if self.path.is_empty() { &self.name } else { &self.path };
        write!(f, "{}:{}:{}: {}", loc, self.row + 1, self.col + 1, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Tooltip {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserCmd {
    pub title: String,
    pub desc: String,
    pub name: String,
    pub args: Vec<String>,
}

/// An immutable snapshot of everything the editor sees.
///
/// `status`, `errors`, `completions`, `issues` and `tooltips` are ephemeral:
/// they are reset before every reduction. The other fields persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct State {
    pub status: Vec<String>,
    pub errors: Vec<String>,
    pub completions: Vec<Completion>,
    pub issues: Vec<Issue>,
    pub tooltips: Vec<Tooltip>,
    pub user_cmds: Vec<UserCmd>,
    pub config: Option<EditorConfig>,
    pub view: View,
    pub env: EnvMap,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the ephemeral fields, keeping config, commands, view and env.
    pub fn reset_ephemeral(&self) -> Self {
        Self {
            user_cmds: self.user_cmds.clone(),
            config: self.config.clone(),
            view: self.view.clone(),
            env: self.env.clone(),
            ..Default::default()
        }
    }

    /// Appends status entries, skipping empty strings and duplicates.
    pub fn add_status<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for s in items {
            let s = s.into();
            if !s.is_empty() && !self.status.contains(&s) {
                self.status.push(s);
            }
        }
        self
    }

    pub fn add_error(mut self, err: impl fmt::Display) -> Self {
        let msg = err.to_string();
        if !msg.is_empty() {
            self.errors.push(msg);
        }
        self
    }

    pub fn add_completions(mut self, items: impl IntoIterator<Item = Completion>) -> Self {
        self.completions.extend(items);
        self
    }

    pub fn add_issues(mut self, items: impl IntoIterator<Item = Issue>) -> Self {
        self.issues.extend(items);
        self
    }

    pub fn add_tooltips(mut self, items: impl IntoIterator<Item = Tooltip>) -> Self {
        self.tooltips.extend(items);
        self
    }

    pub fn add_user_cmds(mut self, items: impl IntoIterator<Item = UserCmd>) -> Self {
        self.user_cmds.extend(items);
        self
    }

    pub fn set_config(mut self, config: EditorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn set_view(mut self, view: View) -> Self {
        self.view = view;
        self
    }

    pub fn set_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }

    /// Replaces the active view's source, e.g. after formatting.
    pub fn set_src(mut self, src: impl Into<Vec<u8>>) -> Self {
        self.view = self.view.set_src(src);
        self
    }

    /// All errors joined into one message, as sent in a response.
    pub fn joined_errors(&self) -> String {
        self.errors.join("\n")
    }
}
