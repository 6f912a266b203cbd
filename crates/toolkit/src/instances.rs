//! Process-wide store of named toolkit clients, populated by the host at
//! startup and read by framework adapters that expose tool context.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, RwLock},
};

use crate::client::ToolkitClient;

static CLIENTS: LazyLock<RwLock<HashMap<String, Arc<ToolkitClient>>>> =
    LazyLock::new(Default::default);

/// Store `client` under `name`, returning the client it replaced.
pub fn register_client(
    name: impl Into<String>,
    client: Arc<ToolkitClient>,
) -> Option<Arc<ToolkitClient>> {
    CLIENTS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.into(), client)
}

pub fn get_client(name: &str) -> Option<Arc<ToolkitClient>> {
    CLIENTS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

pub fn remove_client(name: &str) -> Option<Arc<ToolkitClient>> {
    CLIENTS
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .remove(name)
}

/// Registered names, sorted.
pub fn client_names() -> Vec<String> {
    let mut names: Vec<String> = CLIENTS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, atp_config::AtpConfig};

    #[test]
    fn register_lookup_and_remove() {
        let crm = Arc::new(ToolkitClient::new(AtpConfig::new("k", "crm")));
        assert!(register_client("instances-test-crm", Arc::clone(&crm)).is_none());

        let found = get_client("instances-test-crm").unwrap();
        assert!(Arc::ptr_eq(&found, &crm));
        assert!(client_names().contains(&"instances-test-crm".to_string()));

        let replacement = Arc::new(ToolkitClient::new(AtpConfig::new("k", "crm-v2")));
        let old = register_client("instances-test-crm", Arc::clone(&replacement)).unwrap();
        assert!(Arc::ptr_eq(&old, &crm));
        assert_eq!(get_client("instances-test-crm").unwrap().app_name(), "crm-v2");

        assert!(remove_client("instances-test-crm").is_some());
        assert!(get_client("instances-test-crm").is_none());
        assert!(remove_client("instances-test-crm").is_none());
    }
}
