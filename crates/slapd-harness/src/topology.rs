//! Multi-provider replication wiring.
//!
//! A [`ReplicationTopology`] is a validated directed graph of server
//! identifiers (consumer → providers). Applying it gives every participant
//! its server id, an identical database with the sync provider overlay, and
//! one `olcSyncrepl` value per provider it consumes from, written in a
//! single replace together with the multi-provider flag.

use crate::convergence::ConvergenceWaiter;
use crate::directory::Modification;
use crate::entities::{BackendKind, Database, Overlay, OverlayKind, OverlayPosition};
use crate::error::{HarnessError, Result};
use crate::pool::ServerPool;
use crate::server::ServerInstance;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Consumer id → provider ids.
pub type Adjacency = BTreeMap<u32, BTreeSet<u32>>;

/// Largest identifier `olcServerID` accepts.
pub const MAX_SERVER_ID: u32 = 4095;

/// One replication source of a consumer, rendered as an `olcSyncrepl` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReplSource {
    pub rid: u32,
    pub provider: String,
    pub search_base: String,
    pub bind_dn: String,
    pub credentials: String,
}

impl fmt::Display for SyncReplSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rid={} provider={} searchbase=\"{}\" type=refreshAndPersist retry=\"1 +\" \
             bindmethod=simple binddn=\"{}\" credentials=\"{}\"",
            self.rid, self.provider, self.search_base, self.bind_dn, self.credentials
        )
    }
}

/// What a consumer needs to know about a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub uri: String,
    pub bind_dn: String,
    pub credentials: String,
}

impl From<&Database> for ProviderInfo {
    fn from(database: &Database) -> Self {
        Self {
            uri: database.server_uri().to_string(),
            bind_dn: database.root_dn().to_string(),
            credentials: database.secret().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTopology {
    server_ids: Vec<u32>,
    adjacency: Adjacency,
}

fn topology_error(reason: String) -> HarnessError {
    HarnessError::Topology { reason }
}

impl ReplicationTopology {
    /// Every server consumes from every other server.
    pub fn full_mesh(server_ids: Vec<u32>) -> Result<Self> {
        Self::new(server_ids, None)
    }

    pub fn new(server_ids: Vec<u32>, adjacency: Option<Adjacency>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for &id in &server_ids {
            if id == 0 || id > MAX_SERVER_ID {
                return Err(topology_error(format!(
                    "server id {id} outside 1..={MAX_SERVER_ID}"
                )));
            }
            if !seen.insert(id) {
                return Err(topology_error(format!("server id {id} assigned twice")));
            }
        }

        let adjacency = match adjacency {
            Some(adjacency) => adjacency,
            None => server_ids
                .iter()
                .map(|&consumer| {
                    let providers = server_ids
                        .iter()
                        .copied()
                        .filter(|&provider| provider != consumer)
                        .collect();
                    (consumer, providers)
                })
                .collect(),
        };

        for (consumer, providers) in &adjacency {
            if !seen.contains(consumer) {
                return Err(topology_error(format!(
                    "consumer {consumer} is not a participating server"
                )));
            }
            for provider in providers {
                if provider == consumer {
                    return Err(topology_error(format!(
                        "server {consumer} cannot replicate from itself"
                    )));
                }
                if !seen.contains(provider) {
                    return Err(topology_error(format!(
                        "provider {provider} of {consumer} is not a participating server"
                    )));
                }
            }
        }

        Ok(Self {
            server_ids,
            adjacency,
        })
    }

    pub fn server_ids(&self) -> &[u32] {
        &self.server_ids
    }

    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    pub fn providers_of(&self, consumer: u32) -> impl Iterator<Item = u32> + '_ {
        self.adjacency
            .get(&consumer)
            .into_iter()
            .flat_map(|providers| providers.iter().copied())
    }

    /// Replication sources for `consumer`, one per provider edge.
    pub fn descriptors_for(
        &self,
        consumer: u32,
        search_base: &str,
        providers: &BTreeMap<u32, ProviderInfo>,
    ) -> Result<Vec<SyncReplSource>> {
        self.providers_of(consumer)
            .map(|provider| {
                let info = providers.get(&provider).ok_or_else(|| {
                    topology_error(format!("no database known for provider {provider}"))
                })?;
                Ok(SyncReplSource {
                    rid: provider,
                    provider: info.uri.clone(),
                    search_base: search_base.to_string(),
                    bind_dn: info.bind_dn.clone(),
                    credentials: info.credentials.clone(),
                })
            })
            .collect()
    }

    /// Configure replication on running servers keyed by their assigned id.
    ///
    /// Not transactional across servers: a failure part way leaves the
    /// servers already configured as they are.
    #[tracing::instrument(level = "info", skip(self, servers, backend), fields(servers = self.server_ids.len()))]
    pub fn apply(
        &self,
        servers: &mut BTreeMap<u32, ServerInstance>,
        suffix: &str,
        backend: &BackendKind,
    ) -> Result<BTreeMap<u32, Database>> {
        if let Some(missing) = self.server_ids.iter().find(|&&id| !servers.contains_key(&id)) {
            return Err(topology_error(format!("no server supplied for id {missing}")));
        }

        let mut databases = BTreeMap::new();
        for &id in &self.server_ids {
            let Some(server) = servers.get_mut(&id) else {
                continue;
            };
            server.set_server_id(id)?;
            let mut database = Database::create(server, suffix, backend.clone(), Vec::new())?;
            let overlay = Overlay::create(
                server,
                &database,
                OverlayKind::syncprov(),
                OverlayPosition::Append,
            )?;
            database.push_overlay(overlay);
            debug!("Server {id} provides {suffix} as {}", database.dn());
            databases.insert(id, database);
        }

        let providers: BTreeMap<u32, ProviderInfo> = databases
            .iter()
            .map(|(&id, database)| (id, ProviderInfo::from(database)))
            .collect();

        for &consumer in &self.server_ids {
            let sources = self.descriptors_for(consumer, suffix, &providers)?;
            if sources.is_empty() {
                debug!("Server {consumer} consumes from nobody");
                continue;
            }
            let (Some(server), Some(database)) = (servers.get(&consumer), databases.get(&consumer))
            else {
                continue;
            };
            server.admin_client()?.modify(
                database.dn(),
                &[
                    Modification::Replace(
                        "olcSyncrepl".to_string(),
                        sources.iter().map(ToString::to_string).collect(),
                    ),
                    Modification::Replace("olcMultiProvider".to_string(), vec!["TRUE".to_string()]),
                ],
            )?;
            debug!("Server {consumer} replicates from {} providers", sources.len());
        }

        info!("Replication configured for {suffix}");
        Ok(databases)
    }
}

/// Parameters of a replicated group of servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSpec {
    /// Number of servers; ignored when `server_ids` is given.
    pub count: usize,
    pub server_ids: Option<Vec<u32>>,
    pub adjacency: Option<Adjacency>,
    pub suffix: String,
    pub backend: BackendKind,
}

impl Default for MeshSpec {
    fn default() -> Self {
        Self {
            count: 4,
            server_ids: None,
            adjacency: None,
            suffix: "dc=example,dc=com".to_string(),
            backend: BackendKind::default(),
        }
    }
}

impl MeshSpec {
    pub fn ids(&self) -> Vec<u32> {
        match &self.server_ids {
            Some(ids) => ids.clone(),
            None => (1..).take(self.count).collect(),
        }
    }

    pub fn topology(&self) -> Result<ReplicationTopology> {
        ReplicationTopology::new(self.ids(), self.adjacency.clone())
    }
}

/// A mesh that could not be built, with the servers it had already started.
///
/// Returned servers keep running until the caller stops or drops them. They
/// are keyed by server id, or by 1-based position when the ids could not be
/// assigned.
#[derive(Debug)]
pub struct MeshBuildError {
    pub error: HarnessError,
    pub servers: BTreeMap<u32, ServerInstance>,
}

impl MeshBuildError {
    fn with_servers(error: HarnessError, servers: BTreeMap<u32, ServerInstance>) -> Self {
        Self { error, servers }
    }

    fn positional(error: HarnessError, servers: Vec<ServerInstance>) -> Self {
        Self::with_servers(error, (1..).zip(servers).collect())
    }
}

impl From<HarnessError> for MeshBuildError {
    fn from(error: HarnessError) -> Self {
        Self::with_servers(error, BTreeMap::new())
    }
}

impl fmt::Display for MeshBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mesh build failed with {} servers left running: {}", self.servers.len(), self.error)
    }
}

impl std::error::Error for MeshBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Running replicated servers, stopped when the mesh goes away.
pub struct Mesh {
    topology: ReplicationTopology,
    suffix: String,
    databases: BTreeMap<u32, Database>,
    servers: BTreeMap<u32, ServerInstance>,
}

impl Mesh {
    /// Create, start and wire up the servers described by `spec`.
    pub fn build(pool: &mut ServerPool, spec: MeshSpec) -> std::result::Result<Mesh, MeshBuildError> {
        let topology = spec.topology()?;
        let mut servers = BTreeMap::new();
        for &id in topology.server_ids() {
            let started = pool.new_server().and_then(|mut server| {
                server.start(None)?;
                Ok(server)
            });
            match started {
                Ok(server) => {
                    servers.insert(id, server);
                }
                Err(error) => return Err(MeshBuildError::with_servers(error, servers)),
            }
        }
        Self::assemble(topology, servers, &spec)
    }

    /// Wire up servers the caller already created; they are started if needed.
    pub fn from_servers(
        servers: Vec<ServerInstance>,
        spec: MeshSpec,
    ) -> std::result::Result<Mesh, MeshBuildError> {
        let topology = match spec.topology() {
            Ok(topology) => topology,
            Err(error) => return Err(MeshBuildError::positional(error, servers)),
        };
        if servers.len() != topology.server_ids().len() {
            let error = topology_error(format!(
                "{} servers supplied for {} ids",
                servers.len(),
                topology.server_ids().len()
            ));
            return Err(MeshBuildError::positional(error, servers));
        }
        let servers = topology.server_ids().iter().copied().zip(servers).collect();
        Self::assemble(topology, servers, &spec)
    }

    fn assemble(
        topology: ReplicationTopology,
        mut servers: BTreeMap<u32, ServerInstance>,
        spec: &MeshSpec,
    ) -> std::result::Result<Mesh, MeshBuildError> {
        let failed = servers
            .values_mut()
            .filter(|server| !server.is_running())
            .find_map(|server| server.start(None).err());
        if let Some(error) = failed {
            return Err(MeshBuildError::with_servers(error, servers));
        }

        match topology.apply(&mut servers, &spec.suffix, &spec.backend) {
            Ok(databases) => Ok(Mesh {
                topology,
                suffix: spec.suffix.clone(),
                databases,
                servers,
            }),
            Err(error) => Err(MeshBuildError::with_servers(error, servers)),
        }
    }

    pub fn topology(&self) -> &ReplicationTopology {
        &self.topology
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn server(&self, id: u32) -> Option<&ServerInstance> {
        self.servers.get(&id)
    }

    pub fn server_mut(&mut self, id: u32) -> Option<&mut ServerInstance> {
        self.servers.get_mut(&id)
    }

    pub fn servers(&self) -> impl Iterator<Item = (u32, &ServerInstance)> {
        self.servers.iter().map(|(&id, server)| (id, server))
    }

    pub fn database(&self, id: u32) -> Option<&Database> {
        self.databases.get(&id)
    }

    pub fn uris(&self) -> Vec<String> {
        self.servers.values().map(ServerInstance::uri).collect()
    }

    pub fn wait_for_convergence(&self, waiter: &ConvergenceWaiter, timeout: Duration) -> Result<()> {
        waiter.wait_for_convergence(&self.suffix, &self.uris(), timeout)
    }

    /// Stop every server; the first failure is returned after all were tried.
    pub fn shutdown(mut self) -> Result<()> {
        let mut first_error = None;
        for (id, server) in self.servers.iter_mut() {
            if let Err(e) = server.stop() {
                warn!("Failed to stop mesh server {id}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
