// Per-integration credential managers

use dashmap::DashMap;
use std::sync::Arc;

use super::authorizer::AuthorizationCallback;
use super::manager::CredentialManager;
use super::types::CredentialStatus;

/// Integration identity to manager map.
///
/// Every manager owns its own lock, so integrations never block each other.
#[derive(Clone, Default)]
pub struct CredentialRegistry {
    managers: Arc<DashMap<String, Arc<CredentialManager>>>,
    callbacks: Arc<DashMap<String, AuthorizationCallback>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manager: CredentialManager) -> Arc<CredentialManager> {
        let manager = Arc::new(manager);
        let id = manager.integration().to_string();
        if self.managers.insert(id.clone(), manager.clone()).is_some() {
            tracing::warn!(integration = %id, "Replaced existing credential manager");
        }
        manager
    }

    /// Route OAuth callbacks for `integration` to a code-flow authorizer
    pub fn register_callback(&self, integration: &str, callback: AuthorizationCallback) {
        self.callbacks.insert(integration.to_string(), callback);
    }

    pub fn get(&self, integration: &str) -> Option<Arc<CredentialManager>> {
        self.managers.get(integration).map(|m| m.value().clone())
    }

    pub fn callback(&self, integration: &str) -> Option<AuthorizationCallback> {
        self.callbacks.get(integration).map(|c| c.value().clone())
    }

    /// Registered integration identities, sorted
    pub fn integrations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn managers(&self) -> Vec<Arc<CredentialManager>> {
        self.integrations()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub async fn statuses(&self) -> Vec<CredentialStatus> {
        let mut statuses = Vec::new();
        for manager in self.managers() {
            statuses.push(manager.status().await);
        }
        statuses
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorizer::FullAuthorizer;
    use crate::auth::testing::{granted, ScriptedExchange};
    use crate::auth::types::ManagerSettings;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn manager(
        id: &str,
        endpoint: Arc<ScriptedExchange>,
        authorizer: Arc<ScriptedExchange>,
    ) -> CredentialManager {
        CredentialManager::new(
            id,
            ManagerSettings::default(),
            endpoint,
            Arc::new(MemoryStore::new()),
            Some(authorizer as Arc<dyn FullAuthorizer>),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = CredentialRegistry::new();
        assert!(registry.is_empty());

        let scripted = Arc::new(ScriptedExchange::new(vec![]));
        registry.register(manager("digisac", scripted.clone(), scripted.clone()));
        registry.register(manager("conta_azul", scripted.clone(), scripted));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.integrations(), vec!["conta_azul", "digisac"]);
        assert!(registry.get("bitrix24").is_none());

        let statuses = registry.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.has_access_token));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identities_do_not_block_each_other() {
        let registry = CredentialRegistry::new();
        let blocked = Arc::new(ScriptedExchange::gated(vec![granted("slow", None, 3600)]));
        let open = Arc::new(ScriptedExchange::new(vec![granted("fast", None, 3600)]));
        let unused = Arc::new(ScriptedExchange::new(vec![]));

        let slow = registry.register(manager("conta_azul", unused.clone(), blocked.clone()));
        let fast = registry.register(manager("digisac", unused, open));

        let pending = tokio::spawn(async move { slow.get_valid_token().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let token = tokio::time::timeout(Duration::from_secs(1), fast.get_valid_token())
            .await
            .expect("digisac must not wait on conta_azul")
            .unwrap();
        assert_eq!(token, "fast");

        blocked.release(1);
        assert_eq!(pending.await.unwrap().unwrap(), "slow");
    }
}
