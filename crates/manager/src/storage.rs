//! Endpoint, host and link records in the coordination store.

use crate::Error;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};
use vipd_model::{Endpoint, Host, KeyLayout};
use vipd_store::{CoordinationStore, LeaseId};

/// Reads and writes this host's records.
#[derive(Clone, Debug)]
pub struct Storage<S> {
    store: S,
    layout: KeyLayout,
    hostname: String,
    timeout: Duration,
}

impl<S> Storage<S>
where
    S: CoordinationStore,
{
    /// Creates storage for `hostname`'s records.
    pub fn new(store: S, layout: KeyLayout, hostname: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            layout,
            hostname: hostname.into(),
            timeout,
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The key layout in use.
    pub const fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// The host these records belong to.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, E>> + Send,
    ) -> Result<T, Error>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Store(Box::new(e))),
            Err(_elapsed) => Err(Error::StoreTimeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }

    /// Every endpoint configured on this host. Records that fail to decode
    /// are skipped.
    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let prefix = self.layout.host_endpoints(&self.hostname);
        let records = self
            .bounded("get_prefix", self.store.get_prefix(&prefix))
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|kv| match Endpoint::from_bytes(&kv.value) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping unreadable endpoint record");
                    None
                }
            })
            .collect())
    }

    /// One endpoint configured on this host.
    pub async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, Error> {
        let key = self.layout.endpoint(&self.hostname, id);

        self.bounded("get", self.store.get(&key))
            .await?
            .map(|kv| Endpoint::from_bytes(&kv.value))
            .transpose()
            .map_err(Error::from)
    }

    /// Stores a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if an endpoint with the same id is
    /// already stored.
    pub async fn add_endpoint(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let key = self.layout.endpoint(&self.hostname, &endpoint.id);
        let created = self
            .bounded("create", self.store.create(&key, endpoint.to_bytes()?, None))
            .await?;

        if created {
            debug!(%key, "endpoint stored");
            Ok(())
        } else {
            Err(Error::AlreadyExists(endpoint.id.clone()))
        }
    }

    /// Overwrites a stored endpoint.
    pub async fn put_endpoint(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let key = self.layout.endpoint(&self.hostname, &endpoint.id);
        self.bounded("put", self.store.put(&key, endpoint.to_bytes()?, None))
            .await
    }

    /// Deletes a stored endpoint. Returns whether it existed.
    pub async fn remove_endpoint(&self, id: &str) -> Result<bool, Error> {
        let key = self.layout.endpoint(&self.hostname, id);
        self.bounded("delete", self.store.delete(&key)).await
    }

    /// This host's record.
    pub async fn get_host(&self) -> Result<Option<Host>, Error> {
        let key = self.layout.host(&self.hostname);

        self.bounded("get", self.store.get(&key))
            .await?
            .map(|kv| Host::from_bytes(&kv.value))
            .transpose()
            .map_err(Error::from)
    }

    /// Writes this host's record.
    pub async fn put_host(&self, host: &Host) -> Result<(), Error> {
        let key = self.layout.host(&self.hostname);
        self.bounded("put", self.store.put(&key, host.to_bytes()?, None))
            .await
    }

    /// Marks this host as serving `resource`, for as long as `lease` lives.
    pub async fn put_link(&self, resource: &str, lease: LeaseId) -> Result<(), Error> {
        let key = self.layout.link(resource, &self.hostname);
        let value = Bytes::from(self.hostname.clone());

        self.bounded("put", self.store.put(&key, value, Some(lease)))
            .await
    }

    /// Removes this host's link to `resource`.
    pub async fn remove_link(&self, resource: &str) -> Result<(), Error> {
        let key = self.layout.link(resource, &self.hostname);
        self.bounded("delete", self.store.delete(&key))
            .await
            .map(|_| ())
    }

    /// Hosts currently linked to `resource`.
    pub async fn linked_hosts(&self, resource: &str) -> Result<Vec<String>, Error> {
        let prefix = self.layout.links(resource);
        let records = self
            .bounded("get_prefix", self.store.get_prefix(&prefix))
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|kv| kv.key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Grants a lease of `ttl`.
    pub async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Error> {
        self.bounded("grant_lease", self.store.grant_lease(ttl))
            .await
    }

    /// Revokes `lease`.
    pub async fn revoke_lease(&self, lease: LeaseId) -> Result<(), Error> {
        self.bounded("revoke_lease", self.store.revoke_lease(lease))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde_json::json;
    use vipd_store_memory::MemoryStore;

    fn storage(store: &MemoryStore, hostname: &str) -> Storage<MemoryStore> {
        Storage::new(
            store.clone(),
            KeyLayout::default(),
            hostname,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_endpoint_records_are_per_host() {
        let store = MemoryStore::new();
        let a = storage(&store, "host-a");
        let b = storage(&store, "host-b");

        let endpoint = Endpoint::new("mock", json!({ "key": "k1" }));
        a.add_endpoint(&endpoint).await.unwrap();

        assert_eq!(a.list_endpoints().await.unwrap(), vec![endpoint.clone()]);
        assert!(b.list_endpoints().await.unwrap().is_empty());

        let raw = store
            .get(&format!("/vipd/hosts/host-a/{}", endpoint.id))
            .await
            .unwrap();
        assert!(raw.is_some());
    }

    #[tokio::test]
    async fn test_add_existing_endpoint_conflicts() {
        let store = MemoryStore::new();
        let a = storage(&store, "host-a");

        let endpoint = Endpoint::new("mock", json!({ "key": "k1" }));
        a.add_endpoint(&endpoint).await.unwrap();

        assert_matches!(a.add_endpoint(&endpoint).await, Err(Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let store = MemoryStore::new();
        let a = storage(&store, "host-a");

        store
            .put("/vipd/hosts/host-a/broken", Bytes::from_static(b"{"), None)
            .await
            .unwrap();
        let endpoint = Endpoint::new("mock", json!({ "key": "k1" }));
        a.put_endpoint(&endpoint).await.unwrap();

        assert_eq!(a.list_endpoints().await.unwrap(), vec![endpoint]);
    }

    #[tokio::test]
    async fn test_links_follow_the_lease() {
        let store = MemoryStore::new();
        let a = storage(&store, "host-a");

        let lease = a.grant_lease(Duration::from_secs(6)).await.unwrap();
        a.put_link("10.0.0.10/32", lease).await.unwrap();

        assert!(
            store
                .get("/vipd/ips/10.0.0.10%2F32/host-a")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            a.linked_hosts("10.0.0.10/32").await.unwrap(),
            vec!["host-a".to_string()]
        );

        a.revoke_lease(lease).await.unwrap();
        assert!(a.linked_hosts("10.0.0.10/32").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_record_round_trip() {
        let store = MemoryStore::new();
        let a = storage(&store, "host-a");

        assert_eq!(a.get_host().await.unwrap(), None);

        let host = Host::new("host-a", 7);
        a.put_host(&host).await.unwrap();
        assert_eq!(a.get_host().await.unwrap(), Some(host));
    }
}
