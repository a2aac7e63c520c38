//! Named lifecycle hooks.
//!
//! Startup and shutdown hooks run once per consumer (and once per child
//! process under process workers). Pre-execute hooks run before every task
//! body and may cancel it by returning [`TaskError::Cancel`]; post-execute
//! hooks run after every body run with its outcome. Hooks keep registration
//! order; registering an existing name replaces it in place.

use crate::error::TaskError;
use crate::task::Task;
use crate::utils::panic_message;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

/// Consumer lifecycle hook.
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Runs before a task body.
pub type PreExecuteHook = Arc<dyn Fn(&Task) -> Result<(), TaskError> + Send + Sync>;

/// Runs after a task body with its value or error.
pub type PostExecuteHook = Arc<dyn Fn(&Task, Option<&Value>, Option<&TaskError>) + Send + Sync>;

struct HookList<H> {
    entries: RwLock<Vec<(String, H)>>,
}

impl<H: Clone> HookList<H> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, name: String, hook: H) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = hook,
            None => entries.push((name, hook)),
        }
    }

    fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| existing != name);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<(String, H)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Every hook registered on one engine.
pub struct Hooks {
    startup: HookList<LifecycleHook>,
    shutdown: HookList<LifecycleHook>,
    pre_execute: HookList<PreExecuteHook>,
    post_execute: HookList<PostExecuteHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("startup", &self.startup.names())
            .field("shutdown", &self.shutdown.names())
            .field("pre_execute", &self.pre_execute.names())
            .field("post_execute", &self.post_execute.names())
            .finish()
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Hooks {
    /// No hooks.
    pub fn new() -> Self {
        Self {
            startup: HookList::new(),
            shutdown: HookList::new(),
            pre_execute: HookList::new(),
            post_execute: HookList::new(),
        }
    }

    pub(crate) fn add_startup(&self, name: String, hook: LifecycleHook) {
        self.startup.add(name, hook);
    }

    pub(crate) fn add_shutdown(&self, name: String, hook: LifecycleHook) {
        self.shutdown.add(name, hook);
    }

    pub(crate) fn add_pre_execute(&self, name: String, hook: PreExecuteHook) {
        self.pre_execute.add(name, hook);
    }

    pub(crate) fn add_post_execute(&self, name: String, hook: PostExecuteHook) {
        self.post_execute.add(name, hook);
    }

    pub(crate) fn remove_pre_execute(&self, name: &str) -> bool {
        self.pre_execute.remove(name)
    }

    pub(crate) fn remove_post_execute(&self, name: &str) -> bool {
        self.post_execute.remove(name)
    }

    /// Names of the registered startup hooks.
    pub fn startup_names(&self) -> Vec<String> {
        self.startup.names()
    }

    /// Names of the registered pre-execute hooks.
    pub fn pre_execute_names(&self) -> Vec<String> {
        self.pre_execute.names()
    }

    /// Names of the registered post-execute hooks.
    pub fn post_execute_names(&self) -> Vec<String> {
        self.post_execute.names()
    }

    pub(crate) fn run_startup(&self) {
        run_lifecycle("startup", self.startup.snapshot());
    }

    pub(crate) fn run_shutdown(&self) {
        run_lifecycle("shutdown", self.shutdown.snapshot());
    }

    /// Run every pre-execute hook. The first cancellation stops the chain and
    /// is returned; any other failure is logged and ignored.
    pub(crate) fn run_pre_execute(&self, task: &Task) -> Result<(), TaskError> {
        for (name, hook) in self.pre_execute.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| hook(task))) {
                Ok(Ok(())) => {}
                Ok(Err(cancel @ TaskError::Cancel { .. })) => {
                    tracing::info!("Pre-execute hook '{}' canceled task {}", name, task.id);
                    return Err(cancel);
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        "Pre-execute hook '{}' failed for task {}: {}",
                        name,
                        task.id,
                        error
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        "Pre-execute hook '{}' panicked for task {}: {}",
                        name,
                        task.id,
                        panic_message(&*panic)
                    );
                }
            }
        }
        Ok(())
    }

    pub(crate) fn run_post_execute(&self, task: &Task, value: Option<&Value>, error: Option<&TaskError>) {
        for (name, hook) in self.post_execute.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(task, value, error))) {
                tracing::error!(
                    "Post-execute hook '{}' panicked for task {}: {}",
                    name,
                    task.id,
                    panic_message(&*panic)
                );
            }
        }
    }
}

fn run_lifecycle(kind: &str, hooks: Vec<(String, LifecycleHook)>) {
    for (name, hook) in hooks {
        tracing::debug!("Running {} hook '{}'", kind, name);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook())) {
            tracing::error!(
                "{} hook '{}' panicked: {}",
                kind,
                name,
                panic_message(&*panic)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_pre_execute_cancel_stops_chain() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&log);
        hooks.add_pre_execute(
            "fails".to_string(),
            Arc::new(move |_: &Task| {
                first.lock().unwrap().push("fails");
                Err::<(), _>(TaskError::failed("ignored"))
            }),
        );
        hooks.add_pre_execute(
            "cancels".to_string(),
            Arc::new(|task: &Task| {
                if task.name == "blocked" {
                    Err(TaskError::cancel())
                } else {
                    Ok(())
                }
            }),
        );
        let last = Arc::clone(&log);
        hooks.add_pre_execute(
            "after".to_string(),
            Arc::new(move |_: &Task| {
                last.lock().unwrap().push("after");
                Ok(())
            }),
        );

        let allowed = Task::new("allowed", Value::Null);
        assert!(hooks.run_pre_execute(&allowed).is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["fails", "after"]);

        let blocked = Task::new("blocked", Value::Null);
        assert_eq!(
            hooks.run_pre_execute(&blocked),
            Err(TaskError::Cancel { retry: false })
        );
        assert_eq!(*log.lock().unwrap(), vec!["fails", "after", "fails"]);
    }

    #[test]
    fn test_replace_and_remove() {
        let hooks = Hooks::new();
        let hits = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&hits);
        hooks.add_post_execute(
            "count".to_string(),
            Arc::new(move |_: &Task, _: Option<&Value>, _: Option<&TaskError>| {
                *counter.lock().unwrap() += 1
            }),
        );
        let counter = Arc::clone(&hits);
        hooks.add_post_execute(
            "count".to_string(),
            Arc::new(move |_: &Task, _: Option<&Value>, _: Option<&TaskError>| {
                *counter.lock().unwrap() += 10
            }),
        );
        assert_eq!(hooks.post_execute_names(), vec!["count".to_string()]);

        let task = Task::new("t", Value::Null);
        hooks.run_post_execute(&task, None, None);
        assert_eq!(*hits.lock().unwrap(), 10);

        assert!(hooks.remove_post_execute("count"));
        assert!(!hooks.remove_post_execute("count"));
        hooks.run_post_execute(&task, None, None);
        assert_eq!(*hits.lock().unwrap(), 10);
    }

    #[test]
    fn test_panicking_lifecycle_hook_is_contained() {
        let hooks = Hooks::new();
        let ran = Arc::new(Mutex::new(false));
        fn explode() {
            panic!("startup failure");
        }
        hooks.add_startup("boom".to_string(), Arc::new(explode));
        let flag = Arc::clone(&ran);
        hooks.add_startup("ok".to_string(), Arc::new(move || *flag.lock().unwrap() = true));

        hooks.run_startup();
        assert!(*ran.lock().unwrap());
        assert_eq!(hooks.startup_names(), vec!["boom".to_string(), "ok".to_string()]);
    }
}
