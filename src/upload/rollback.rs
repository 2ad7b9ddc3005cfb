//! Compensating actions and the rollback runner.

use crate::core::hooks::{HookArgs, HookContext, RollbackHook};
use crate::provider::ObjectStorage;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;

/// Undo for one forward action that succeeded. Bound at registration.
#[derive(Clone)]
pub enum RollbackAction {
    DeleteObject {
        storage: Arc<dyn ObjectStorage>,
        bucket: String,
        key: String,
    },
}

impl RollbackAction {
    pub fn delete_object(storage: Arc<dyn ObjectStorage>, bucket: &str, key: &str) -> Self {
        Self::DeleteObject {
            storage,
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::DeleteObject { bucket, key, .. } => format!("delete s3://{}/{}", bucket, key),
        }
    }

    pub async fn run(self) -> Result<(), String> {
        match self {
            Self::DeleteObject {
                storage,
                bucket,
                key,
            } => storage.delete(&bucket, &key).await,
        }
    }
}

impl fmt::Debug for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Actions registered in the order their forward operations succeeded.
#[derive(Debug, Clone, Default)]
pub struct RollbackLedger {
    actions: Arc<Mutex<Vec<RollbackAction>>>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<RollbackAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, action: RollbackAction) {
        tracing::debug!(action = %action.describe(), "registered rollback action");
        self.guard().push(action);
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.guard().iter().map(RollbackAction::describe).collect()
    }

    /// Drain every action. A second call returns nothing.
    pub fn take(&self) -> Vec<RollbackAction> {
        std::mem::take(&mut *self.guard())
    }
}

/// Run every action and every rollback hook concurrently and wait for all.
/// Failures are logged and counted, never returned.
pub async fn rollback_all(
    actions: Vec<RollbackAction>,
    hooks: &[Arc<dyn RollbackHook>],
    ctx: &HookContext,
    args: &HookArgs,
) -> usize {
    let mut tasks: JoinSet<Result<(), String>> = JoinSet::new();

    for action in actions {
        let description = action.describe();
        tasks.spawn(async move {
            action
                .run()
                .await
                .map_err(|e| format!("{}: {}", description, e))
        });
    }

    for hook in hooks {
        let hook = Arc::clone(hook);
        let ctx = ctx.clone();
        let args = args.clone();
        tasks.spawn_blocking(move || {
            hook.rollback(&ctx, &args);
            Ok(())
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(error = %e, "rollback action failed");
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, "rollback task aborted");
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryObjectStorage;
    use crate::provider::LifecyclePolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenStorage;

    #[async_trait]
    impl ObjectStorage for BrokenStorage {
        async fn put(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), String> {
            Ok(())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), String> {
            Err("access denied".into())
        }
        async fn lifecycle_policy(&self, _: &str) -> Result<LifecyclePolicy, String> {
            Ok(LifecyclePolicy::NotConfigured)
        }
    }

    fn args() -> HookArgs {
        HookArgs {
            service_name: "svc".into(),
            bucket: "b".into(),
            build_id: "1".into(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_rollback_runs_every_action() {
        let storage = Arc::new(MemoryObjectStorage::new());
        storage.put("b", "svc/a.zip", vec![1]).await.unwrap();
        storage.put("b", "svc/site.zip", vec![2]).await.unwrap();
        let ledger = RollbackLedger::new();
        ledger.register(RollbackAction::delete_object(storage.clone(), "b", "svc/a.zip"));
        ledger.register(RollbackAction::delete_object(storage.clone(), "b", "svc/site.zip"));
        assert_eq!(
            ledger.describe(),
            vec!["delete s3://b/svc/a.zip", "delete s3://b/svc/site.zip"]
        );

        let failures = rollback_all(ledger.take(), &[], &HookContext::new(), &args()).await;
        assert_eq!(failures, 0);
        assert!(storage.keys().is_empty());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failures_counted_not_fatal() {
        let broken: Arc<dyn ObjectStorage> = Arc::new(BrokenStorage);
        let good = Arc::new(MemoryObjectStorage::new());
        let actions = vec![
            RollbackAction::delete_object(broken, "b", "x"),
            RollbackAction::delete_object(good.clone(), "b", "y"),
        ];
        let failures = rollback_all(actions, &[], &HookContext::new(), &args()).await;
        assert_eq!(failures, 1);
        assert_eq!(good.deleted(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_rollback_hooks_run_alongside_actions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let hook: Arc<dyn RollbackHook> = Arc::new(move |ctx: &HookContext, args: &HookArgs| {
            assert_eq!(args.service_name, "svc");
            assert!(ctx.contains_key("marker"));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut ctx = HookContext::new();
        ctx.insert("marker".into(), serde_json::json!(true));
        let failures = rollback_all(Vec::new(), &[hook.clone(), hook], &ctx, &args()).await;
        assert_eq!(failures, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let hook: Arc<dyn RollbackHook> = Arc::new(|ctx: &HookContext, _: &HookArgs| {
            if ctx.is_empty() {
                panic!("hook exploded");
            }
        });
        let failures = rollback_all(Vec::new(), &[hook], &HookContext::new(), &args()).await;
        assert_eq!(failures, 1);
    }
}
