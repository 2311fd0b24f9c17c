// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Startup configuration (`spec.md` §6.4). Immutable for the lifetime of
//! the process once loaded.

use std::{fs, net::IpAddr, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::transport::NodeId;

/// One entry of the `node_table` used to seed `add_peer` calls at
/// startup (`SPEC_FULL.md` §6.4 supplement).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub ip: IpAddr,
}

/// `net_type = "TCP=<KiB>"` (`spec.md` §6.1/§6.4), parsed into an
/// absolute byte count by [`crate::transport::parse_net_type`].
fn default_net_type() -> String {
    "TCP=64".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "NodeId")]
    pub node_id: NodeId,

    #[serde(rename = "BindIp")]
    pub bind_ip: IpAddr,

    #[serde(rename = "DataPort")]
    pub data_port: u16,

    #[serde(rename = "BdBufferSize", default = "default_bd_buffer_size")]
    pub bd_buffer_size: u32,

    #[serde(rename = "MaxRequests", default = "default_server_max_requests")]
    pub max_requests: u32,

    #[serde(rename = "NetType", default = "default_net_type")]
    pub net_type: String,

    #[serde(rename = "BarrierEnable", default = "default_true")]
    pub barrier_enable: bool,

    /// Server receive-pool depth (`SPEC_FULL.md` §6.4 supplement);
    /// exercised directly by the receive-pool-exhaustion scenario.
    #[serde(rename = "NumReceiveHeaders", default = "default_num_receive_headers")]
    pub num_receive_headers: usize,

    #[serde(rename = "RingCapacity", default = "default_ring_capacity")]
    pub ring_capacity: usize,

    #[serde(rename = "Nodes", default)]
    pub node_table: Vec<NodeEntry>,

    #[serde(skip, default)]
    pub send_buf_bytes: u32,
    #[serde(skip, default)]
    pub recv_buf_bytes: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(rename = "NodeId")]
    pub node_id: NodeId,

    #[serde(rename = "BindIp")]
    pub bind_ip: IpAddr,

    #[serde(rename = "DataPort")]
    pub data_port: u16,

    #[serde(rename = "BdBufferSize", default = "default_bd_buffer_size")]
    pub bd_buffer_size: u32,

    #[serde(rename = "MaxRequests", default = "default_client_max_requests")]
    pub max_requests: u32,

    #[serde(rename = "NetType", default = "default_net_type")]
    pub net_type: String,

    #[serde(rename = "BarrierEnable", default = "default_true")]
    pub barrier_enable: bool,

    #[serde(rename = "Nodes", default)]
    pub node_table: Vec<NodeEntry>,

    #[serde(skip, default)]
    pub send_buf_bytes: u32,
    #[serde(skip, default)]
    pub recv_buf_bytes: u32,
}

fn default_bd_buffer_size() -> u32 {
    131_072
}

fn default_server_max_requests() -> u32 {
    300
}

fn default_client_max_requests() -> u32 {
    64
}

fn default_num_receive_headers() -> usize {
    16
}

fn default_ring_capacity() -> usize {
    crate::rdev::DEFAULT_RING_CAPACITY
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&s).context("parsing server config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.bd_buffer_size % 4096 == 0,
            "BdBufferSize must be a multiple of 4096"
        );
        ensure!(self.max_requests >= 1, "MaxRequests must be >= 1");
        ensure!(self.num_receive_headers >= 1, "NumReceiveHeaders must be >= 1");
        ensure!(self.ring_capacity >= 1, "RingCapacity must be >= 1");
        self.send_buf_bytes = crate::transport::parse_net_type(&self.net_type)?;
        self.recv_buf_bytes = self.send_buf_bytes;
        for node in &self.node_table {
            ensure!(node.node_id != self.node_id, "node_table must not list self");
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&s).context("parsing client config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.bd_buffer_size % 4096 == 0,
            "BdBufferSize must be a multiple of 4096"
        );
        ensure!(self.max_requests >= 1, "MaxRequests must be >= 1");
        self.send_buf_bytes = crate::transport::parse_net_type(&self.net_type)?;
        self.recv_buf_bytes = self.send_buf_bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_buffer_size() {
        let mut cfg = ServerConfig {
            node_id: 1,
            bind_ip: "0.0.0.0".parse().unwrap(),
            data_port: 4000,
            bd_buffer_size: 4097,
            max_requests: 300,
            net_type: default_net_type(),
            barrier_enable: true,
            num_receive_headers: 16,
            ring_capacity: 128,
            node_table: vec![],
            send_buf_bytes: 0,
            recv_buf_bytes: 0,
        };
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn normalizes_net_type_into_buffer_sizes() {
        let mut cfg = ServerConfig {
            node_id: 1,
            bind_ip: "0.0.0.0".parse().unwrap(),
            data_port: 4000,
            bd_buffer_size: 131_072,
            max_requests: 300,
            net_type: "TCP=128".to_string(),
            barrier_enable: true,
            num_receive_headers: 16,
            ring_capacity: 128,
            node_table: vec![],
            send_buf_bytes: 0,
            recv_buf_bytes: 0,
        };
        cfg.validate_and_normalize().expect("valid config");
        assert_eq!(cfg.send_buf_bytes, 128 * 1024);
    }
}
