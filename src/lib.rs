// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `pdud`: an event-driven power distribution daemon core. Dialogues with
//! remote power controllers over scripted send/expect sessions and answers
//! client queries about node power state. The client-facing wire listener
//! and config-file parser are out of scope (spec §1) — this crate is the
//! engine a listener is built on top of.

pub mod action;
pub mod buffer;
pub mod cluster;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod queue;
pub mod script;

use std::time::Duration;

use cluster::{Cluster, Node};
use config::ClusterSpec;
use device::{Device, PlugRole};
use error::ConfigError;

/// Build a `Cluster` and its devices from a parsed `ClusterSpec`: compile
/// every device's scripts, then resolve each node's hard/soft bindings to
/// plug handles. This is the one place device indices and plug handles get
/// wired together; everything downstream only ever sees stable handles.
pub fn build_cluster(
    spec: &ClusterSpec,
    update_interval: Duration,
    default_expect_timeout: Duration,
    logit: bool,
) -> Result<(Cluster, Vec<Device>), ConfigError> {
    let mut devices = Vec::with_capacity(spec.devices.len());
    let mut device_index = std::collections::HashMap::new();
    for device_spec in &spec.devices {
        let device = Device::new(device_spec, default_expect_timeout, logit)?;
        device_index.insert(device_spec.name.clone(), devices.len());
        devices.push(device);
    }

    let mut cluster = Cluster::new(spec.name.clone(), update_interval);
    for node_spec in &spec.nodes {
        let handle = cluster.insert(Node::new(node_spec.name.clone()));

        if let Some(device_name) = &node_spec.hard_device {
            let plug_name = node_spec.hard_plug.as_deref().ok_or_else(|| ConfigError::UnknownPlug {
                node: node_spec.name.clone(),
                device: device_name.clone(),
                plug: String::new(),
            })?;
            bind(&mut devices, &device_index, node_spec, device_name, plug_name, handle, PlugRole::Hard)?;
        }

        if let Some(device_name) = &node_spec.soft_device {
            let plug_name = node_spec.soft_plug.as_deref().ok_or_else(|| ConfigError::UnknownPlug {
                node: node_spec.name.clone(),
                device: device_name.clone(),
                plug: String::new(),
            })?;
            bind(&mut devices, &device_index, node_spec, device_name, plug_name, handle, PlugRole::Soft)?;
        }
    }

    Ok((cluster, devices))
}

fn bind(
    devices: &mut [Device],
    device_index: &std::collections::HashMap<String, usize>,
    node_spec: &config::NodeSpec,
    device_name: &str,
    plug_name: &str,
    node: cluster::NodeHandle,
    role: PlugRole,
) -> Result<(), ConfigError> {
    let &device_idx = device_index.get(device_name).ok_or_else(|| ConfigError::UnknownDevice {
        node: node_spec.name.clone(),
        device: device_name.to_string(),
    })?;
    let device = &mut devices[device_idx];
    let plug_handle = device.plug_handle(plug_name).ok_or_else(|| ConfigError::UnknownPlug {
        node: node_spec.name.clone(),
        device: device_name.to_string(),
        plug: plug_name.to_string(),
    })?;
    device.bind_plug(plug_handle, node, role);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceSpec, NodeSpec, PlugSpec, TargetMode, TransportKind};

    fn minimal_device(name: &str) -> DeviceSpec {
        DeviceSpec {
            name: name.to_string(),
            transport: TransportKind::Tcp,
            host: "localhost".to_string(),
            service: "6969".to_string(),
            mode: TargetMode::Literal,
            all_token: "all".to_string(),
            on_regex: "on".to_string(),
            off_regex: "off".to_string(),
            expect_timeout_ms: None,
            plugs: vec![PlugSpec { name: "1".to_string(), node: Some("web1".to_string()) }],
            scripts: Vec::new(),
        }
    }

    #[test]
    fn binds_node_to_its_devices_plug() {
        let spec = ClusterSpec {
            name: "test".to_string(),
            devices: vec![minimal_device("pdu0")],
            nodes: vec![NodeSpec {
                name: "web1".to_string(),
                hard_device: Some("pdu0".to_string()),
                hard_plug: Some("1".to_string()),
                soft_device: None,
                soft_plug: None,
            }],
        };
        let (cluster, devices) = build_cluster(&spec, Duration::from_secs(100), Duration::from_secs(10), false).unwrap();
        let handle = cluster.find("web1").unwrap();
        let plug_handle = devices[0].plug_handle("1").unwrap();
        assert_eq!(devices[0].status(), device::DeviceStatus::NotConnected);
        let _ = (handle, plug_handle);
    }

    #[test]
    fn unknown_device_reference_is_rejected() {
        let spec = ClusterSpec {
            name: "test".to_string(),
            devices: vec![minimal_device("pdu0")],
            nodes: vec![NodeSpec {
                name: "web1".to_string(),
                hard_device: Some("nonexistent".to_string()),
                hard_plug: Some("1".to_string()),
                soft_device: None,
                soft_plug: None,
            }],
        };
        let err = build_cluster(&spec, Duration::from_secs(100), Duration::from_secs(10), false).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDevice { .. }));
    }

    #[test]
    fn unknown_plug_reference_is_rejected() {
        let spec = ClusterSpec {
            name: "test".to_string(),
            devices: vec![minimal_device("pdu0")],
            nodes: vec![NodeSpec {
                name: "web1".to_string(),
                hard_device: Some("pdu0".to_string()),
                hard_plug: Some("99".to_string()),
                soft_device: None,
                soft_plug: None,
            }],
        };
        let err = build_cluster(&spec, Duration::from_secs(100), Duration::from_secs(10), false).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPlug { .. }));
    }
}
