//! Stage hook registry
//!
//! Every factory stage is bracketed by `pre_<stage>` and `post_<stage>`
//! hooks. A `pre_` hook returning false aborts its stage; `post_` hooks
//! always run and receive the stage status.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// The fixed parameter set handed to every hook
#[derive(Debug, Default, Clone)]
pub struct HookContext {
    /// Hook point name (e.g. "pre_stage")
    pub name: String,
    /// Source path the factory is working on
    pub path: Option<PathBuf>,
    /// Stage outcome; set for `post_` hooks only
    pub status: Option<bool>,
    /// Message-ID of the article in flight, when one applies
    pub article_id: Option<String>,
    /// File the article belongs to, when one applies
    pub segment: Option<String>,
    /// Manifest path, once one exists
    pub nzb: Option<PathBuf>,
}

impl HookContext {
    /// A context for the named hook point
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Attach the source path
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the stage status
    pub fn with_status(mut self, status: bool) -> Self {
        self.status = Some(status);
        self
    }
}

/// A registered hook callable
pub type Hook = Box<dyn Fn(&HookContext) -> bool + Send + Sync>;

/// Hooks keyed by stage hook point
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Hook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut points: Vec<(&String, usize)> =
            self.hooks.iter().map(|(k, v)| (k, v.len())).collect();
        points.sort();
        f.debug_struct("HookRegistry").field("points", &points).finish()
    }
}

impl HookRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook at a hook point (e.g. "pre_upload")
    pub fn add(&mut self, point: impl Into<String>, hook: Hook) {
        self.hooks.entry(point.into()).or_default().push(hook);
    }

    /// Invoke every hook at a point; the result is the conjunction of
    /// their returns (an empty point is true)
    pub fn call(&self, context: &HookContext) -> bool {
        let Some(hooks) = self.hooks.get(&context.name) else {
            return true;
        };
        let mut verdict = true;
        for hook in hooks {
            if !hook(context) {
                debug!("hook {} voted false", context.name);
                verdict = false;
            }
        }
        verdict
    }
}
