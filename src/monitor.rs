//! Node monitoring: register payloads and metric packets.
//!
//! The monitor owns the host inventory sampled through `sysinfo` and turns
//! it into the register document POSTed to the head service and the binary
//! metric datagrams sent over UDP.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysinfo::System;
use uuid::Uuid;

/// Ids of the counters sampled when the head has not pushed a configuration.
const CPU_USAGE_METRIC_ID: u16 = 1;
const AVAILABLE_MEMORY_METRIC_ID: u16 = 2;

const METRIC_PACKET_VERSION: u8 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MetricCounter {
    pub metric_id: u16,
    pub instance_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MetricCountersConfig {
    pub metric_counters: Vec<MetricCounter>,
}

pub struct NodeMonitor {
    node_name: String,
    network_name: String,
    node_uuid: Mutex<Option<Uuid>>,
    counters: Mutex<Vec<MetricCounter>>,
    system: tokio::sync::Mutex<System>,
}

impl NodeMonitor {
    pub fn new(network_name: String) -> Self {
        let node_name = System::host_name().unwrap_or_else(|| "localhost".to_string());
        Self {
            node_name,
            network_name,
            node_uuid: Mutex::new(None),
            counters: Mutex::new(default_counters()),
            system: tokio::sync::Mutex::new(System::new_all()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Node UUID carried in metric packets, parsed from the metric URI.
    pub fn set_node_uuid(&self, id: Uuid) {
        *self.node_uuid.lock().expect("monitor state poisoned") = Some(id);
    }

    pub fn apply_metric_config(&self, config: MetricCountersConfig) {
        let mut counters = self.counters.lock().expect("monitor state poisoned");
        if config.metric_counters.is_empty() {
            *counters = default_counters();
        } else {
            *counters = config.metric_counters;
        }
        tracing::info!(count = counters.len(), "Metric counter set updated");
    }

    /// Register document describing this node's inventory.
    pub async fn register_info(&self) -> Value {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        system.refresh_cpu();

        json!({
            "NodeName": self.node_name,
            "NetworkName": self.network_name,
            "CoreCount": system.cpus().len(),
            "PhysicalCoreCount": system.physical_core_count().unwrap_or(0),
            "SocketCount": 1,
            "MemoryMegabytes": system.total_memory() / (1024 * 1024),
            "DistroInfo": System::long_os_version().unwrap_or_default(),
            "Time": Utc::now().to_rfc3339(),
        })
    }

    /// Binary metric datagram: version byte, node UUID, counter count, then
    /// `(metric_id: u16 LE, value: f32 LE)` per configured counter.
    pub async fn metric_packet(&self) -> Vec<u8> {
        let counters = self
            .counters
            .lock()
            .expect("monitor state poisoned")
            .clone();
        let uuid = self
            .node_uuid
            .lock()
            .expect("monitor state poisoned")
            .unwrap_or(Uuid::nil());

        let mut system = self.system.lock().await;
        system.refresh_cpu();
        system.refresh_memory();

        let mut packet = Vec::with_capacity(18 + counters.len() * 6);
        packet.push(METRIC_PACKET_VERSION);
        packet.extend_from_slice(uuid.as_bytes());
        packet.push(counters.len() as u8);
        for counter in &counters {
            packet.extend_from_slice(&counter.metric_id.to_le_bytes());
            packet.extend_from_slice(&self.sample(&system, counter.metric_id).to_le_bytes());
        }
        packet
    }

    fn sample(&self, system: &System, metric_id: u16) -> f32 {
        match metric_id {
            CPU_USAGE_METRIC_ID => system.global_cpu_info().cpu_usage(),
            AVAILABLE_MEMORY_METRIC_ID => (system.available_memory() / (1024 * 1024)) as f32,
            _ => 0.0,
        }
    }
}

fn default_counters() -> Vec<MetricCounter> {
    vec![
        MetricCounter {
            metric_id: CPU_USAGE_METRIC_ID,
            instance_name: "_Total".to_string(),
        },
        MetricCounter {
            metric_id: AVAILABLE_MEMORY_METRIC_ID,
            instance_name: "_Total".to_string(),
        },
    ]
}
