//! CNI network attachment for runner VMs.
//!
//! Each VM gets its own network namespace named after its id. The named
//! conflist's plugin chain runs with `ADD` on attach and `DEL`, in reverse,
//! on detach. The chain must end in a plugin that leaves a tap device in the
//! namespace (e.g. `tc-redirect-tap`); the hypervisor runs inside the
//! namespace and binds the guest NIC to that tap.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use firepool_core::VmId;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::ExecutorError;

/// Interface name inside the namespace and inside the guest.
pub const DEFAULT_IFNAME: &str = "eth0";

const NETNS_DIR: &str = "/var/run/netns";

/// A CNI network configuration list (`*.conflist`).
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfigList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<Value>,
}

/// A named CNI network VMs attach to.
#[derive(Debug, Clone)]
pub struct CniNetwork {
    conf_dir: PathBuf,
    bin_dir: PathBuf,
    network_name: String,
    ifname: String,
    ip_binary: PathBuf,
}

/// Result of attaching one VM.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub netns: String,
    pub netns_path: PathBuf,
    /// Tap device the guest NIC binds to.
    pub tap: String,
    pub guest_mac: Option<String>,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    config: NetworkConfigList,
    result: Value,
}

impl Attachment {
    /// Kernel `ip=` argument configuring the guest NIC statically.
    #[must_use]
    pub fn kernel_ip_arg(&self) -> String {
        let gateway = self.gateway.map(|g| g.to_string()).unwrap_or_default();
        format!(
            "ip={}::{gateway}:{}::{DEFAULT_IFNAME}:off",
            self.address,
            netmask(self.prefix_len)
        )
    }
}

#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Deserialize)]
struct CniInterface {
    name: String,
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    sandbox: Option<String>,
}

#[derive(Deserialize)]
struct CniIp {
    address: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    interface: Option<usize>,
}

/// Addressing extracted from a final CNI result.
#[derive(Debug, PartialEq, Eq)]
struct ParsedResult {
    tap: String,
    guest_mac: Option<String>,
    address: Ipv4Addr,
    prefix_len: u8,
    gateway: Option<Ipv4Addr>,
}

impl CniNetwork {
    #[must_use]
    pub fn new(conf_dir: PathBuf, bin_dir: PathBuf, network_name: impl Into<String>) -> Self {
        Self {
            conf_dir,
            bin_dir,
            network_name: network_name.into(),
            ifname: DEFAULT_IFNAME.to_owned(),
            ip_binary: PathBuf::from("ip"),
        }
    }

    #[must_use]
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Find the conflist whose `name` matches the network.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Network`] if the directory cannot be read or
    /// no conflist carries the name.
    pub async fn load_config(&self) -> Result<NetworkConfigList, ExecutorError> {
        let mut entries = tokio::fs::read_dir(&self.conf_dir).await.map_err(|e| {
            ExecutorError::Network(format!("read {}: {e}", self.conf_dir.display()))
        })?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
                candidates.push(path);
            }
        }
        candidates.sort();

        for path in candidates {
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<NetworkConfigList>(&raw) {
                Ok(list) if list.name == self.network_name => return Ok(list),
                Ok(_) => {}
                Err(e) => tracing::debug!(file = %path.display(), error = %e, "skipping invalid conflist"),
            }
        }
        Err(ExecutorError::Network(format!(
            "no conflist named '{}' in {}",
            self.network_name,
            self.conf_dir.display()
        )))
    }

    /// Create a namespace for the VM and run the plugin chain.
    ///
    /// On failure everything created so far is torn down before returning.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Network`] if any step fails or the final
    /// result lacks a tap device or an IPv4 address.
    pub async fn attach(&self, vm_id: &VmId) -> Result<Attachment, ExecutorError> {
        let config = self.load_config().await?;
        let netns = vm_id.to_string();
        let netns_path = Path::new(NETNS_DIR).join(&netns);

        self.run_ip(&["netns", "add", &netns]).await?;

        let mut prev: Option<Value> = None;
        for plugin in &config.plugins {
            let conf = plugin_conf(plugin, &config, prev.as_ref());
            match self.exec_plugin("ADD", conf, vm_id.as_str(), &netns_path).await {
                Ok(result) => prev = Some(result),
                Err(e) => {
                    self.teardown(&config, &netns, vm_id.as_str(), prev.as_ref()).await;
                    return Err(e);
                }
            }
        }

        let result = prev.unwrap_or(Value::Null);
        let parsed = match parse_result(&result, vm_id.as_str(), &netns_path, &self.ifname) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.teardown(&config, &netns, vm_id.as_str(), Some(&result)).await;
                return Err(e);
            }
        };

        tracing::debug!(
            vm_id = %vm_id,
            network = %self.network_name,
            tap = %parsed.tap,
            address = %parsed.address,
            "network attached"
        );

        Ok(Attachment {
            netns,
            netns_path,
            tap: parsed.tap,
            guest_mac: parsed.guest_mac,
            address: parsed.address,
            prefix_len: parsed.prefix_len,
            gateway: parsed.gateway,
            config,
            result,
        })
    }

    /// Run `DEL` for every plugin and delete the namespace.
    ///
    /// # Errors
    /// Returns the first failure after attempting every step.
    pub async fn detach(&self, vm_id: &VmId, attachment: &Attachment) -> Result<(), ExecutorError> {
        let mut first_err = None;
        for plugin in attachment.config.plugins.iter().rev() {
            let conf = plugin_conf(plugin, &attachment.config, Some(&attachment.result));
            if let Err(e) = self.exec_plugin("DEL", conf, vm_id.as_str(), &attachment.netns_path).await {
                tracing::warn!(vm_id = %vm_id, error = %e, "CNI DEL failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.run_ip(&["netns", "delete", &attachment.netns]).await {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn teardown(&self, config: &NetworkConfigList, netns: &str, container_id: &str, prev: Option<&Value>) {
        let netns_path = Path::new(NETNS_DIR).join(netns);
        for plugin in config.plugins.iter().rev() {
            let conf = plugin_conf(plugin, config, prev);
            if let Err(e) = self.exec_plugin("DEL", conf, container_id, &netns_path).await {
                tracing::debug!(netns, error = %e, "CNI DEL during rollback failed");
            }
        }
        if let Err(e) = self.run_ip(&["netns", "delete", netns]).await {
            tracing::warn!(netns, error = %e, "failed to delete network namespace");
        }
    }

    async fn exec_plugin(
        &self,
        command: &str,
        conf: Value,
        container_id: &str,
        netns_path: &Path,
    ) -> Result<Value, ExecutorError> {
        let plugin_type = conf
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Network("plugin without a type".to_owned()))?
            .to_owned();
        let binary = self.bin_dir.join(&plugin_type);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", &self.ifname)
            .env("CNI_PATH", &self.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Network(format!("exec {}: {e}", binary.display())))?;

        let stdin_bytes = serde_json::to_vec(&conf)
            .map_err(|e| ExecutorError::Network(format!("encode {plugin_type} config: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_bytes).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let detail = plugin_error(&output.stdout)
                .unwrap_or_else(|| String::from_utf8_lossy(&output.stderr).trim().to_owned());
            return Err(ExecutorError::Network(format!("{plugin_type} {command}: {detail}")));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ExecutorError::Network(format!("{plugin_type} {command} result: {e}")))
    }

    async fn run_ip(&self, args: &[&str]) -> Result<(), ExecutorError> {
        let output = Command::new(&self.ip_binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecutorError::Network(format!("exec {}: {e}", self.ip_binary.display())))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Network(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Plugin stdin: the plugin object plus the list's name and version, and
/// the previous plugin's result when chaining.
fn plugin_conf(plugin: &Value, list: &NetworkConfigList, prev: Option<&Value>) -> Value {
    let mut conf = plugin.clone();
    if let Some(obj) = conf.as_object_mut() {
        obj.insert("name".to_owned(), Value::String(list.name.clone()));
        obj.insert("cniVersion".to_owned(), Value::String(list.cni_version.clone()));
        if let Some(prev) = prev.filter(|p| !p.is_null()) {
            obj.insert("prevResult".to_owned(), prev.clone());
        }
    }
    conf
}

fn plugin_error(stdout: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(stdout).ok()?;
    let msg = value.get("msg")?.as_str()?;
    match value.get("details").and_then(Value::as_str) {
        Some(details) if !details.is_empty() => Some(format!("{msg}: {details}")),
        _ => Some(msg.to_owned()),
    }
}

fn parse_result(
    result: &Value,
    container_id: &str,
    netns_path: &Path,
    ifname: &str,
) -> Result<ParsedResult, ExecutorError> {
    let parsed: CniResult = serde_json::from_value(result.clone())
        .map_err(|e| ExecutorError::Network(format!("decode CNI result: {e}")))?;
    let netns = netns_path.to_string_lossy();
    let in_netns = |i: &CniInterface| i.sandbox.as_deref() == Some(netns.as_ref());

    let tap = parsed
        .interfaces
        .iter()
        .find(|i| in_netns(*i) && i.name != ifname)
        .map(|i| i.name.clone())
        .ok_or_else(|| ExecutorError::Network("CNI result has no tap device in the namespace".to_owned()))?;

    // tc-redirect-tap reports the VM side with the container id as sandbox.
    let vm_iface = parsed
        .interfaces
        .iter()
        .position(|i| i.sandbox.as_deref() == Some(container_id))
        .or_else(|| parsed.interfaces.iter().position(|i| in_netns(i) && i.name == ifname));

    let ipv4 = |ip: &&CniIp| parse_cidr(&ip.address).is_some();
    let chosen = parsed
        .ips
        .iter()
        .filter(ipv4)
        .find(|ip| vm_iface.is_some() && ip.interface == vm_iface)
        .or_else(|| parsed.ips.iter().find(ipv4))
        .ok_or_else(|| ExecutorError::Network("CNI result has no IPv4 address".to_owned()))?;

    let (address, prefix_len) = parse_cidr(&chosen.address)
        .ok_or_else(|| ExecutorError::Network(format!("bad address {}", chosen.address)))?;
    let gateway = chosen.gateway.as_deref().and_then(|g| g.parse().ok());
    let guest_mac = vm_iface
        .and_then(|i| parsed.interfaces.get(i))
        .and_then(|i| i.mac.clone())
        .filter(|m| !m.is_empty());

    Ok(ParsedResult { tap, guest_mac, address, prefix_len, gateway })
}

/// Parse `a.b.c.d/len`.
fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let prefix_len: u8 = len.parse().ok()?;
    if prefix_len > 32 {
        return None;
    }
    Some((addr.parse().ok()?, prefix_len))
}

fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - u32::from(n)),
    };
    Ipv4Addr::from(bits)
}
