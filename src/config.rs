use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Static agent configuration, assembled from the command line at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub network_name: String,
    /// Base URLs of the naming services used to resolve head-service endpoints.
    pub naming_endpoints: Vec<String>,
    /// Initial backoff of the naming resolver; doubles per failed attempt.
    pub naming_backoff_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub register_interval_secs: u64,
    pub metric_interval_secs: u64,
    pub hosts_fetch_interval_secs: u64,
    /// Local hosts file the hosts manager rewrites.
    pub hosts_file_path: PathBuf,
    /// Cgroup filesystem root; tests point this at a scratch directory.
    pub cgroup_root: PathBuf,
    /// Whether task processes get a per-task cgroup. Off only in tests.
    pub use_cgroups: bool,
    /// Directory holding the MPI container helper scripts.
    pub script_dir: PathBuf,
    /// Where head-service endpoints are persisted across Ping/Metric updates.
    pub endpoints_file: Option<PathBuf>,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:40000".parse().unwrap(),
            network_name: String::new(),
            naming_endpoints: Vec::new(),
            naming_backoff_secs: 1,
            heartbeat_interval_secs: 30,
            register_interval_secs: 300,
            metric_interval_secs: 60,
            hosts_fetch_interval_secs: 120,
            hosts_file_path: PathBuf::from("/etc/hosts"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            use_cgroups: true,
            script_dir: PathBuf::from("/opt/hpcagent"),
            endpoints_file: None,
            debug: false,
        }
    }
}

/// Head-service endpoint URIs the agent reports to.
///
/// Updated at runtime by `Ping`/`Metric` calls and persisted so a restarted
/// agent resumes reporting to the most recent head service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub heartbeat_uri: String,
    #[serde(default)]
    pub register_uri: String,
    #[serde(default)]
    pub metric_uri: String,
    #[serde(default)]
    pub hosts_file_uri: String,
}

/// Mutable endpoint store backed by an optional JSON file.
#[derive(Debug)]
pub struct EndpointStore {
    path: Option<PathBuf>,
    inner: Mutex<Endpoints>,
}

impl EndpointStore {
    pub fn new(initial: Endpoints, path: Option<PathBuf>) -> Self {
        Self {
            path,
            inner: Mutex::new(initial),
        }
    }

    /// Load endpoints from `path`, falling back to `initial` when the file is
    /// absent or unreadable.
    pub fn load(initial: Endpoints, path: Option<PathBuf>) -> Self {
        let loaded = path
            .as_deref()
            .and_then(|p| Self::read_file(p))
            .unwrap_or(initial);
        Self::new(loaded, path)
    }

    fn read_file(path: &Path) -> Option<Endpoints> {
        let body = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&body) {
            Ok(endpoints) => Some(endpoints),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed endpoints file");
                None
            }
        }
    }

    pub fn get(&self) -> Endpoints {
        self.inner.lock().expect("endpoint store poisoned").clone()
    }

    /// Update the heartbeat URI. Returns true if the stored value changed.
    pub fn set_heartbeat_uri(&self, uri: &str) -> bool {
        self.update(|e| {
            if e.heartbeat_uri == uri {
                false
            } else {
                e.heartbeat_uri = uri.to_string();
                true
            }
        })
    }

    /// Update the metric URI. Returns true if the stored value changed.
    pub fn set_metric_uri(&self, uri: &str) -> bool {
        self.update(|e| {
            if e.metric_uri == uri {
                false
            } else {
                e.metric_uri = uri.to_string();
                true
            }
        })
    }

    fn update(&self, f: impl FnOnce(&mut Endpoints) -> bool) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock().expect("endpoint store poisoned");
            if !f(&mut inner) {
                return false;
            }
            inner.clone()
        };
        self.save(&snapshot);
        true
    }

    fn save(&self, endpoints: &Endpoints) {
        let Some(path) = &self.path else { return };
        let result = serde_json::to_vec_pretty(endpoints)
            .map_err(std::io::Error::other)
            .and_then(|body| {
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, body)?;
                std::fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist endpoints");
        }
    }
}
