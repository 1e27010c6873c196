use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::command::{CommandRunner, SystemCommandRunner};
use crate::error::{DeleteError, StrategyError};
use crate::model::DeleteOutcome;
use crate::safety::{is_dangerous_with_home, is_safe_to_delete};
use crate::strategy::{default_strategies, DeletionStrategy, Platform};

struct RankedStrategy {
    strategy: Box<dyn DeletionStrategy>,
    available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyAvailability {
    pub name: String,
    pub available: bool,
}

/// Ordered fallback chain of deletion strategies. Availability is checked
/// once when the manager is built and never re-ranked afterwards.
pub struct DeletionStrategyManager {
    strategies: Vec<RankedStrategy>,
    targets: Vec<String>,
    dry_run: bool,
    home: Option<PathBuf>,
}

impl DeletionStrategyManager {
    pub async fn new(
        strategies: Vec<Box<dyn DeletionStrategy>>,
        targets: Vec<String>,
        dry_run: bool,
    ) -> Self {
        let mut ranked = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let available = strategy.is_available().await;
            debug!(strategy = strategy.name(), available, "checked deletion strategy");
            ranked.push(RankedStrategy {
                strategy,
                available,
            });
        }

        Self {
            strategies: ranked,
            targets,
            dry_run,
            home: dirs::home_dir(),
        }
    }

    /// Manager with the built-in chain for the running platform.
    pub async fn for_current_platform(targets: Vec<String>, dry_run: bool) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        Self::new(
            default_strategies(Platform::current(), runner),
            targets,
            dry_run,
        )
        .await
    }

    /// Overrides the home directory used by the dangerous-path check.
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn availability(&self) -> Vec<StrategyAvailability> {
        self.strategies
            .iter()
            .map(|ranked| StrategyAvailability {
                name: ranked.strategy.name().to_string(),
                available: ranked.available,
            })
            .collect()
    }

    /// The gate every deletion passes, dry runs included.
    pub fn check_safety(&self, path: &Path) -> Result<(), DeleteError> {
        if !is_safe_to_delete(path, &self.targets) {
            return Err(DeleteError::Unsafe {
                path: path.to_path_buf(),
                reason: "folder name is not one of the configured targets".to_string(),
            });
        }
        if is_dangerous_with_home(path, self.home.as_deref()) {
            return Err(DeleteError::Unsafe {
                path: path.to_path_buf(),
                reason: "path is a root, home or system directory".to_string(),
            });
        }
        Ok(())
    }

    pub async fn delete_folder(&self, path: &Path) -> Result<DeleteOutcome, DeleteError> {
        if let Err(err) = self.check_safety(path) {
            warn!(path = %path.display(), error = %err, "deletion rejected");
            return Err(err);
        }

        if self.dry_run {
            info!(path = %path.display(), "dry run: skipping deletion");
            return Ok(DeleteOutcome {
                path: path.to_path_buf(),
                strategy: None,
                dry_run: true,
            });
        }

        let mut attempts = Vec::new();
        for ranked in self.strategies.iter().filter(|ranked| ranked.available) {
            let name = ranked.strategy.name();
            match ranked.strategy.delete(path).await {
                Ok(()) => {
                    info!(path = %path.display(), strategy = name, "folder deleted");
                    return Ok(self.outcome(path, name));
                }
                Err(StrategyError::NotFound) => {
                    info!(path = %path.display(), strategy = name, "folder already gone");
                    return Ok(self.outcome(path, name));
                }
                Err(err @ StrategyError::Recoverable { .. }) => {
                    warn!(path = %path.display(), strategy = name, error = %err, "deletion strategy failed, trying next");
                    attempts.push(err.to_string());
                }
                Err(err @ StrategyError::Fatal { .. }) => {
                    error!(path = %path.display(), strategy = name, error = %err, "deletion strategy failed fatally");
                    attempts.push(err.to_string());
                    return Err(DeleteError::Exhausted {
                        path: path.to_path_buf(),
                        attempts,
                    });
                }
            }
        }

        if attempts.is_empty() {
            error!(path = %path.display(), "no deletion strategy available");
            return Err(DeleteError::NoStrategyAvailable);
        }
        error!(path = %path.display(), attempts = attempts.len(), "all deletion strategies failed");
        Err(DeleteError::Exhausted {
            path: path.to_path_buf(),
            attempts,
        })
    }

    fn outcome(&self, path: &Path, strategy: &str) -> DeleteOutcome {
        DeleteOutcome {
            path: path.to_path_buf(),
            strategy: Some(strategy.to_string()),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Recoverable,
        Fatal,
        Gone,
    }

    struct Stub {
        name: &'static str,
        available: bool,
        behaviour: Behaviour,
        checks: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl Stub {
        fn boxed(
            name: &'static str,
            available: bool,
            behaviour: Behaviour,
        ) -> (Box<dyn DeletionStrategy>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let checks = Arc::new(AtomicUsize::new(0));
            let calls = Arc::new(AtomicUsize::new(0));
            let stub = Stub {
                name,
                available,
                behaviour,
                checks: Arc::clone(&checks),
                calls: Arc::clone(&calls),
            };
            (Box::new(stub), checks, calls)
        }
    }

    #[async_trait]
    impl DeletionStrategy for Stub {
        fn name(&self) -> &str {
            self.name
        }

        async fn is_available(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.available
        }

        async fn delete(&self, _path: &Path) -> Result<(), StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Recoverable => Err(StrategyError::recoverable(self.name, "busy")),
                Behaviour::Fatal => Err(StrategyError::fatal(self.name, "denied")),
                Behaviour::Gone => Err(StrategyError::NotFound),
            }
        }
    }

    fn targets() -> Vec<String> {
        vec!["node_modules".to_string()]
    }

    const SAFE: &str = "/srv/app/node_modules";

    #[tokio::test]
    async fn falls_through_recoverable_failures_in_order() {
        let (a, a_checks, a_calls) = Stub::boxed("a", false, Behaviour::Succeed);
        let (b, _, b_calls) = Stub::boxed("b", true, Behaviour::Recoverable);
        let (c, _, c_calls) = Stub::boxed("c", true, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![a, b, c], targets(), false)
            .await
            .with_home(None);

        let outcome = manager.delete_folder(Path::new(SAFE)).await.unwrap();
        assert_eq!(outcome.strategy.as_deref(), Some("c"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 1);

        manager.delete_folder(Path::new(SAFE)).await.unwrap();
        assert_eq!(a_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_validates_but_never_calls_a_strategy() {
        let (a, _, a_calls) = Stub::boxed("a", true, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![a], targets(), true)
            .await
            .with_home(None);

        let outcome = manager.delete_folder(Path::new(SAFE)).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.strategy, None);

        let rejected = manager.delete_folder(Path::new("/srv/app/src")).await;
        assert!(matches!(rejected, Err(DeleteError::Unsafe { .. })));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dangerous_paths_are_rejected_even_when_the_name_matches() {
        let (a, _, a_calls) = Stub::boxed("a", true, Behaviour::Succeed);
        let home = PathBuf::from("/home/node_modules");
        let manager = DeletionStrategyManager::new(vec![a], targets(), false)
            .await
            .with_home(Some(home.clone()));

        assert!(is_safe_to_delete(&home, manager.targets()));
        let result = manager.delete_folder(&home).await;
        assert!(matches!(result, Err(DeleteError::Unsafe { .. })));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn already_gone_counts_as_success() {
        let (a, _, _) = Stub::boxed("a", true, Behaviour::Gone);
        let (b, _, b_calls) = Stub::boxed("b", true, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![a, b], targets(), false)
            .await
            .with_home(None);

        let outcome = manager.delete_folder(Path::new(SAFE)).await.unwrap();
        assert_eq!(outcome.strategy.as_deref(), Some("a"));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_failure_stops_the_chain() {
        let (a, _, _) = Stub::boxed("a", true, Behaviour::Fatal);
        let (b, _, b_calls) = Stub::boxed("b", true, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![a, b], targets(), false)
            .await
            .with_home(None);

        let result = manager.delete_folder(Path::new(SAFE)).await;
        match result {
            Err(DeleteError::Exhausted { attempts, .. }) => assert_eq!(attempts.len(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausting_every_strategy_is_reported() {
        let (a, _, _) = Stub::boxed("a", true, Behaviour::Recoverable);
        let (b, _, _) = Stub::boxed("b", true, Behaviour::Recoverable);
        let manager = DeletionStrategyManager::new(vec![a, b], targets(), false)
            .await
            .with_home(None);
        match manager.delete_folder(Path::new(SAFE)).await {
            Err(DeleteError::Exhausted { attempts, .. }) => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let (c, _, _) = Stub::boxed("c", false, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![c], targets(), false)
            .await
            .with_home(None);
        assert!(matches!(
            manager.delete_folder(Path::new(SAFE)).await,
            Err(DeleteError::NoStrategyAvailable)
        ));
    }

    #[tokio::test]
    async fn availability_is_reported_in_priority_order() {
        let (a, _, _) = Stub::boxed("a", false, Behaviour::Succeed);
        let (b, _, _) = Stub::boxed("b", true, Behaviour::Succeed);
        let manager = DeletionStrategyManager::new(vec![a, b], targets(), false).await;
        let names: Vec<_> = manager
            .availability()
            .into_iter()
            .map(|entry| (entry.name, entry.available))
            .collect();
        assert_eq!(
            names,
            vec![("a".to_string(), false), ("b".to_string(), true)]
        );
    }
}
