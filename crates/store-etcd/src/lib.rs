//! Coordination store backed by an etcd v3 cluster.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};
use vipd_store::{
    CoordinationStore, KeyValue, LeaseId, LeaseKeeper, WatchEvent, WatchEventKind, WatchStream,
};

use error::is_retriable_etcd_error;

/// Configuration for the `EtcdStore`.
#[derive(Clone, Debug)]
pub struct EtcdStoreConfig {
    /// Cluster endpoints, e.g. `http://127.0.0.1:2379`.
    pub endpoints: Vec<String>,

    /// User name and password, if the cluster has auth enabled.
    pub credentials: Option<(String, String)>,

    /// Timeout for a single attempt of an operation. Defaults to 5 seconds.
    pub operation_timeout: Option<Duration>,

    /// Maximum number of attempts per operation. Defaults to 3.
    pub max_retries: Option<usize>,

    /// Base delay for exponential backoff between retries. Defaults to 100ms.
    pub retry_base_delay: Option<Duration>,

    /// Maximum delay for exponential backoff. Defaults to 2 seconds.
    pub retry_max_delay: Option<Duration>,
}

/// A coordination store talking to etcd.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    operation_timeout: Duration,
    max_retries: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("operation_timeout", &self.operation_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connects to the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if no endpoint can be reached.
    pub async fn connect(
        EtcdStoreConfig {
            endpoints,
            credentials,
            operation_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
        }: EtcdStoreConfig,
    ) -> Result<Self, Error> {
        let operation_timeout = operation_timeout.unwrap_or(Duration::from_secs(5));

        let mut options = ConnectOptions::new()
            .with_connect_timeout(operation_timeout)
            .with_timeout(operation_timeout);
        if let Some((user, password)) = credentials {
            options = options.with_user(user, password);
        }

        let client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(Error::Connect)?;

        info!(?endpoints, "connected to etcd");

        Ok(Self {
            client,
            operation_timeout,
            max_retries: max_retries.unwrap_or(3).max(1),
            retry_base_delay: retry_base_delay.unwrap_or(Duration::from_millis(100)),
            retry_max_delay: retry_max_delay.unwrap_or(Duration::from_secs(2)),
        })
    }

    /// Executes an operation with retry logic and exponential backoff.
    async fn with_retry<F, Fut, R>(&self, operation_name: &'static str, operation: F) -> Result<R, Error>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<R, etcd_client::Error>>,
    {
        let mut attempts = 0;
        let mut delay = self.retry_base_delay;

        loop {
            attempts += 1;

            match tokio::time::timeout(self.operation_timeout, operation(self.client.clone())).await
            {
                Ok(Ok(result)) => {
                    if attempts > 1 {
                        debug!(operation = operation_name, attempts, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    if !is_retriable_etcd_error(&e.to_string()) || attempts >= self.max_retries {
                        debug!(operation = operation_name, attempts, error = %e, "operation failed");
                        return Err(Error::Etcd {
                            operation: operation_name,
                            attempts,
                            source: e,
                        });
                    }

                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = self.max_retries,
                        ?delay,
                        error = %e,
                        "operation failed, retrying"
                    );
                }
                Err(_timeout) => {
                    if attempts >= self.max_retries {
                        error!(
                            operation = operation_name,
                            attempts,
                            timeout = ?self.operation_timeout,
                            "operation timed out after maximum retries"
                        );
                        return Err(Error::Timeout {
                            operation: operation_name,
                            attempts,
                        });
                    }

                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        timeout = ?self.operation_timeout,
                        ?delay,
                        "operation timed out, retrying"
                    );
                }
            }

            tokio::time::sleep(delay).await;

            // Exponential backoff with 0-10% jitter
            delay = std::cmp::min(
                delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
                self.retry_max_delay,
            );
        }
    }
}

fn lease_option(lease: Option<LeaseId>) -> Option<PutOptions> {
    lease.map(|id| PutOptions::new().with_lease(id))
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: Bytes::copy_from_slice(kv.value()),
        lease: (kv.lease() != 0).then(|| kv.lease()),
    }
}

/// etcd grants leases in whole seconds; round up and never go below one.
fn ttl_seconds(ttl: Duration) -> i64 {
    let seconds = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(seconds.max(1)).unwrap_or(i64::MAX)
}

/// Keeps an etcd lease alive over a bidirectional keep-alive stream.
pub struct EtcdLeaseKeeper {
    keeper: etcd_client::LeaseKeeper,
    responses: etcd_client::LeaseKeepAliveStream,
    timeout: Duration,
}

#[async_trait]
impl LeaseKeeper for EtcdLeaseKeeper {
    type Error = Error;

    async fn keep_alive(&mut self) -> Result<Duration, Self::Error> {
        let exchange = async {
            self.keeper.keep_alive().await?;
            self.responses.message().await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(Some(response))) => Ok(Duration::from_secs(
                u64::try_from(response.ttl()).unwrap_or(0),
            )),
            Ok(Ok(None)) => Err(Error::KeepAliveClosed),
            Ok(Err(source)) => Err(Error::Etcd {
                operation: "keep_alive",
                attempts: 1,
                source,
            }),
            Err(_timeout) => Err(Error::Timeout {
                operation: "keep_alive",
                attempts: 1,
            }),
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    type Error = Error;
    type Keeper = EtcdLeaseKeeper;

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, Self::Error> {
        let response = self
            .with_retry("get", |mut client| async move { client.get(key, None).await })
            .await?;

        Ok(response.kvs().first().map(to_key_value))
    }

    #[instrument(skip(self))]
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, Self::Error> {
        let response = self
            .with_retry("get_prefix", |mut client| async move {
                client
                    .get(prefix, Some(GetOptions::new().with_prefix()))
                    .await
            })
            .await?;

        Ok(response.kvs().iter().map(to_key_value).collect())
    }

    #[instrument(skip(self, value))]
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<(), Self::Error> {
        self.with_retry("put", |mut client| {
            let value = value.to_vec();
            async move { client.put(key, value, lease_option(lease)).await }
        })
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let response = self
            .with_retry("delete", |mut client| async move {
                client.delete(key, None).await
            })
            .await?;

        Ok(response.deleted() > 0)
    }

    #[instrument(skip(self, value))]
    async fn create(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<bool, Self::Error> {
        let response = self
            .with_retry("create", |mut client| {
                let txn = Txn::new()
                    .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
                    .and_then(vec![TxnOp::put(key, value.to_vec(), lease_option(lease))]);
                async move { client.txn(txn).await }
            })
            .await?;

        Ok(response.succeeded())
    }

    #[instrument(skip(self))]
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, Self::Error> {
        let seconds = ttl_seconds(ttl);
        let response = self
            .with_retry("lease_grant", |mut client| async move {
                client.lease_grant(seconds, None).await
            })
            .await?;

        Ok(response.id())
    }

    #[instrument(skip(self))]
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), Self::Error> {
        self.with_retry("lease_revoke", |mut client| async move {
            client.lease_revoke(lease).await
        })
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn keep_alive(&self, lease: LeaseId) -> Result<Self::Keeper, Self::Error> {
        let (keeper, responses) = self
            .with_retry("lease_keep_alive", |mut client| async move {
                client.lease_keep_alive(lease).await
            })
            .await?;

        Ok(EtcdLeaseKeeper {
            keeper,
            responses,
            timeout: self.operation_timeout,
        })
    }

    #[instrument(skip(self))]
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream<Self::Error>, Self::Error> {
        let (watcher, stream) = self
            .with_retry("watch", |mut client| async move {
                client
                    .watch(prefix, Some(WatchOptions::new().with_prefix()))
                    .await
            })
            .await?;

        // The watcher handle must outlive the stream or etcd cancels the watch.
        let stream = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;

            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            let reason = response.cancel_reason().to_string();
                            return Some((Err(Error::WatchCanceled(reason)), None));
                        }

                        let events: Vec<WatchEvent> = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kind = match event.event_type() {
                                    EventType::Put => WatchEventKind::Put,
                                    EventType::Delete => WatchEventKind::Delete,
                                };
                                event.kv().map(|kv| WatchEvent {
                                    kind,
                                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                                })
                            })
                            .collect();

                        // Progress notifications carry no events.
                        if !events.is_empty() {
                            return Some((Ok(events), Some((watcher, stream))));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(Error::Watch(e)), None)),
                }
            }
        });

        Ok(stream.boxed())
    }
}
