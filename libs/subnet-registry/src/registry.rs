//! Host and subnet registry over the backing store.
//!
//! Owns the single live store client. Every operation takes a snapshot of the
//! client under the lock and releases the lock before touching the network,
//! so a reset racing with an in-flight call only leaves that call on the old
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EtcdConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::etcd::EtcdConnector;
use crate::metrics;
use crate::models::{self, SubnetRecord, join_key, key_leaf};
use crate::store::{Connector, KvStore};

/// Key holding the overlay CIDR under the subnet-config directory.
pub const CONTAINER_NETWORK_KEY: &str = "ContainerNetwork";
/// Key holding the per-host prefix length under the subnet-config directory.
pub const SUBNET_LENGTH_KEY: &str = "SubnetLength";

/// Interval between cluster health probes in [`SubnetRegistry::is_alive`].
const ALIVE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of [`SubnetRegistry::list_subnets`].
///
/// Entries that fail to decode are skipped; the last such failure is kept so
/// callers can tell a clean listing from a partial one.
#[derive(Debug, Default)]
pub struct SubnetListing {
    pub subnets: Vec<SubnetRecord>,
    pub last_error: Option<RegistryError>,
}

/// Registry of hosts, their subnets and the network-wide configuration.
#[derive(Debug)]
pub struct SubnetRegistry<C: Connector = EtcdConnector> {
    connector: C,
    config: EtcdConfig,
    client: Mutex<Arc<C::Store>>,
    generation: AtomicU64,
}

impl SubnetRegistry<EtcdConnector> {
    /// Connect to the etcd cluster described by `config`.
    pub fn new(config: EtcdConfig) -> RegistryResult<Self> {
        Self::with_connector(EtcdConnector, config)
    }
}

impl<C: Connector> SubnetRegistry<C> {
    /// Build a registry whose clients come from `connector`.
    pub fn with_connector(connector: C, config: EtcdConfig) -> RegistryResult<Self> {
        config.validate()?;
        let client = connector.connect(&config)?;
        info!(endpoints = ?config.endpoints, tls = config.uses_tls(), "registry store client created");
        Ok(Self {
            connector,
            config,
            client: Mutex::new(Arc::new(client)),
            generation: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    /// Number of clients built so far, including the first one.
    pub fn client_generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Snapshot of the live client.
    pub(crate) fn client(&self) -> Arc<C::Store> {
        Arc::clone(&self.client.lock())
    }

    /// Replace the live client with a fresh one built from the stored
    /// configuration.
    ///
    /// A failure here is fatal: the registry cannot do anything without a
    /// client, and the caller is expected to stop the process.
    pub fn reset_client(&self) -> RegistryResult<()> {
        let mut client = self.client.lock();
        match self.connector.connect(&self.config) {
            Ok(fresh) => {
                *client = Arc::new(fresh);
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::CLIENT_RESETS.inc();
                debug!(generation, "store client recreated");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed recreating store client, registry cannot continue");
                Err(match err {
                    RegistryError::ClientConstruction(_) => err,
                    other => RegistryError::ClientConstruction(other.to_string()),
                })
            }
        }
    }

    /// Poll cluster health every 5 seconds until it answers or
    /// `timeout_secs` runs out. A timeout of 0 still checks once.
    pub async fn is_alive(&self, timeout_secs: u64) -> bool {
        let mut remaining = timeout_secs;
        loop {
            let status = self.client().sync_cluster().await;
            info!(status, remaining_secs = remaining, "etcd cluster status");
            if status {
                return true;
            }
            if remaining == 0 {
                return false;
            }
            tokio::time::sleep(ALIVE_POLL_INTERVAL).await;
            remaining = remaining.saturating_sub(ALIVE_POLL_INTERVAL.as_secs());
        }
    }

    // -----------------------------------------------------------------------
    // Key space
    // -----------------------------------------------------------------------

    async fn ensure_dir(&self, key: &str) -> RegistryResult<()> {
        match self.client().set_dir(key, 0).await {
            Ok(_) => {
                info!(%key, "created registry directory");
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                debug!(%key, "registry directory already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Create the subnet and subnet-config directories. Existing directories
    /// are left alone.
    pub async fn init_subnets_namespace(&self) -> RegistryResult<()> {
        self.ensure_dir(&self.config.subnet_path).await?;
        self.ensure_dir(&self.config.subnet_config_path).await
    }

    /// Create the host directory. An existing directory is left alone.
    pub async fn init_hosts_namespace(&self) -> RegistryResult<()> {
        self.ensure_dir(&self.config.host_path).await
    }

    // -----------------------------------------------------------------------
    // Hosts
    // -----------------------------------------------------------------------

    /// Identifiers of every host under the host directory.
    pub async fn list_hosts(&self) -> RegistryResult<Vec<String>> {
        let key = &self.config.host_path;
        let resp = self.client().get(key, true, false).await?;
        if !resp.node.dir {
            return Err(RegistryError::NotADirectory(key.clone()));
        }

        let mut hosts = Vec::with_capacity(resp.node.nodes.len());
        for node in &resp.node.nodes {
            if node.key.is_empty() {
                warn!(dir = %key, ?node, "skipping host entry without a key");
                continue;
            }
            hosts.push(key_leaf(&node.key).to_owned());
        }
        Ok(hosts)
    }

    /// Register a host unless it is already present.
    ///
    /// Any failure to read the key is taken to mean the host is absent, so a
    /// read that fails for another reason still leads to a create attempt.
    pub async fn create_host(&self, host: &str, data: &str) -> RegistryResult<()> {
        let key = join_key(&self.config.host_path, host);
        let client = self.client();
        if let Err(read_err) = client.get(&key, false, false).await {
            debug!(%key, error = %read_err, "host not readable, creating it");
            if let Err(err) = client.create(&key, data, 0).await {
                error!(%key, error = %err, "failed to write new host");
                return Err(err);
            }
            info!(host, "registered host");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subnets
    // -----------------------------------------------------------------------

    /// Every decodable subnet record under the subnet directory.
    pub async fn list_subnets(&self) -> RegistryResult<SubnetListing> {
        let key = &self.config.subnet_path;
        let resp = self.client().get(key, true, false).await?;
        if !resp.node.dir {
            return Err(RegistryError::NotADirectory(key.clone()));
        }

        let mut listing = SubnetListing::default();
        for node in &resp.node.nodes {
            if node.dir {
                // the subnet-config directory may live under the subnet directory
                debug!(key = %node.key, "skipping nested directory in subnet listing");
                continue;
            }
            match models::decode::<SubnetRecord>(&node.key, node.value()) {
                Ok(record) => listing.subnets.push(record),
                Err(err) => {
                    error!(key = %node.key, value = node.value(), error = %err, "failed to decode subnet entry");
                    listing.last_error = Some(err);
                }
            }
        }
        Ok(listing)
    }

    /// Subnet assigned to `host`.
    pub async fn get_subnet(&self, host: &str) -> RegistryResult<SubnetRecord> {
        let key = join_key(&self.config.subnet_path, host);
        let resp = self.client().get(&key, false, false).await?;
        info!(%key, value = resp.node.value(), "decoding subnet record");
        models::decode(&key, resp.node.value())
    }

    /// Remove the subnet assigned to `host`.
    pub async fn delete_subnet(&self, host: &str) -> RegistryResult<()> {
        let key = join_key(&self.config.subnet_path, host);
        self.client().delete(&key, false).await?;
        info!(host, "deleted subnet");
        Ok(())
    }

    /// Store the subnet for `host`, replacing any previous assignment.
    pub async fn create_or_update_subnet(
        &self,
        host: &str,
        subnet: &SubnetRecord,
    ) -> RegistryResult<()> {
        let key = join_key(&self.config.subnet_path, host);
        let data = models::encode(&key, subnet)?;
        info!(host, subnet = %data, "writing host subnet");
        self.create_or_update(&key, &data).await.inspect_err(|err| {
            error!(%key, error = %err, "failed to write subnet");
        })
    }

    // -----------------------------------------------------------------------
    // Network configuration
    // -----------------------------------------------------------------------

    /// Store the overlay CIDR and per-host prefix length.
    ///
    /// The two keys are written one after the other; if the second write
    /// fails the first one stays in place.
    pub async fn write_network_config(&self, network: &str, subnet_length: u32) -> RegistryResult<()> {
        let key = join_key(&self.config.subnet_config_path, CONTAINER_NETWORK_KEY);
        self.create_or_update(&key, network).await.inspect_err(|err| {
            error!(%key, error = %err, "failed to write network configuration");
        })?;

        let key = join_key(&self.config.subnet_config_path, SUBNET_LENGTH_KEY);
        self.create_or_update(&key, &subnet_length.to_string())
            .await
            .inspect_err(|err| {
                error!(%key, error = %err, "failed to write network configuration");
            })?;
        info!(network, subnet_length, "network configuration written");
        Ok(())
    }

    /// Overlay CIDR.
    pub async fn get_container_network(&self) -> RegistryResult<String> {
        let key = join_key(&self.config.subnet_config_path, CONTAINER_NETWORK_KEY);
        let resp = self.client().get(&key, false, false).await?;
        Ok(resp.node.value().to_owned())
    }

    /// Per-host subnet prefix length.
    pub async fn get_subnet_length(&self) -> RegistryResult<u64> {
        let key = join_key(&self.config.subnet_config_path, SUBNET_LENGTH_KEY);
        let resp = self.client().get(&key, false, false).await?;
        resp.node
            .value()
            .parse()
            .map_err(|e| RegistryError::decode(key, e))
    }

    /// Create `key`, and overwrite it if the create fails. There is no
    /// versioning, concurrent writers race and the last one wins.
    async fn create_or_update(&self, key: &str, value: &str) -> RegistryResult<()> {
        let client = self.client();
        if let Err(create_err) = client.create(key, value, 0).await {
            warn!(%key, error = %create_err, "found existing value, overwriting it");
            client.update(key, value, 0).await?;
        }
        Ok(())
    }
}
