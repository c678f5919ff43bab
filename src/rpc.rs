//! The operator command surface (SPEC_FULL.md §6). Five plain async methods
//! on `RpcHandler` — no transport wrapper, matching the spec's explicit
//! "a thin JSON-RPC/HTTP front-end is assumed external" boundary. Every
//! command first checks the local node is running as a control node, then
//! that the chain isn't syncing and the wallet isn't locked.

use crate::error::{OperatorError, OperatorResult};
use crate::node::control::ControlNode;
use crate::node::service::ServiceNode;
use crate::node::UtilityNode;
use crate::registry::{Entry, State};
use std::sync::Arc;

/// Which role this process is actually running, so the RPC layer (and the
/// timer loop in `main.rs`) can dispatch without runtime type tags
/// (SPEC_FULL.md §9 redesign flag).
#[derive(Clone)]
pub enum NodeHandle {
    Utility(Arc<UtilityNode>),
    Service(Arc<ServiceNode>),
    Control(Arc<ControlNode>),
}

impl NodeHandle {
    fn as_control(&self) -> OperatorResult<&ControlNode> {
        match self {
            NodeHandle::Control(c) => Ok(c),
            _ => Err(OperatorError::NotControlNode),
        }
    }

    /// Every RPC command requires the node be a control node, the chain not
    /// syncing, and the wallet unlocked (SPEC_FULL.md §6) — checked here
    /// rather than per-command so no handler can skip it.
    async fn ready_control(&self) -> OperatorResult<&ControlNode> {
        let control = self.as_control()?;
        if control.base.services.chain.is_initial_block_download().await {
            return Err(OperatorError::ChainSyncing);
        }
        if control.base.services.wallet.is_locked().await {
            return Err(OperatorError::WalletLocked);
        }
        Ok(control)
    }

    pub fn base(&self) -> &UtilityNode {
        match self {
            NodeHandle::Utility(n) => n,
            NodeHandle::Service(n) => &n.base,
            NodeHandle::Control(n) => &n.base,
        }
    }
}

pub struct RpcHandler {
    node: NodeHandle,
}

impl RpcHandler {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    /// `generatesharedkey`: mint and return a new compressed private key (WIF).
    pub async fn generate_shared_key(&self) -> OperatorResult<String> {
        let control = self.node.ready_control().await?;
        Ok(control.generate_shared_key())
    }

    /// `startservicenodes [alias…]` (empty = all).
    pub async fn start_service_nodes(&self, aliases: &[String]) -> OperatorResult<String> {
        let control = self.node.ready_control().await?;
        let targets = self.resolve_aliases(control, aliases).await;
        let mut lines = Vec::with_capacity(targets.len());
        for alias in targets {
            match control.start_slave_node(&alias).await {
                Ok(()) => lines.push(format!("{alias}: starting")),
                Err(err) => lines.push(format!("{alias}: {err}")),
            }
        }
        Ok(lines.join("\n"))
    }

    /// `stopservicenodes [alias…]` (empty = all).
    pub async fn stop_service_nodes(&self, aliases: &[String]) -> OperatorResult<String> {
        let control = self.node.ready_control().await?;
        let targets = self.resolve_aliases(control, aliases).await;
        let mut lines = Vec::with_capacity(targets.len());
        for alias in targets {
            match control.stop_slave_node(&alias).await {
                Ok(()) => lines.push(format!("{alias}: stopping")),
                Err(err) => lines.push(format!("{alias}: {err}")),
            }
        }
        Ok(lines.join("\n"))
    }

    /// `listservicenodes [extensive=false]`.
    pub async fn list_service_nodes(&self, extensive: bool) -> OperatorResult<String> {
        self.node.ready_control().await?;
        let registry = self.node.base().registry.lock().await;
        let mut lines = Vec::new();
        for (_, entry) in registry.iter() {
            lines.push(render_entry(entry, extensive));
        }
        if lines.is_empty() {
            return Ok("(no service nodes)".to_string());
        }
        Ok(lines.join("\n"))
    }

    /// `test`: diagnostic no-op.
    pub async fn test(&self) -> OperatorResult<String> {
        self.node.ready_control().await?;
        Ok("finished".to_string())
    }

    async fn resolve_aliases(&self, control: &ControlNode, aliases: &[String]) -> Vec<String> {
        if !aliases.is_empty() {
            return aliases.to_vec();
        }
        control.base.registry.lock().await.slave_aliases()
    }
}

fn render_entry(entry: &Entry, extensive: bool) -> String {
    let info = entry.info();
    let state = match info.state {
        State::Stopped => "stopped",
        State::Started => "started",
        State::ProcessingStart => "processing-start",
        State::ProcessingStop => "processing-stop",
    };
    let label = match entry {
        Entry::Slave(s) => s.alias.clone(),
        Entry::Generic(_) => info.tx_in.to_string(),
    };
    if extensive {
        format!(
            "{label}: {state} addr={} wallet_pub={} shared_pub={} last_seen={} tx_in={}",
            info.inet_address, info.wallet_public_key, info.shared_public_key, info.last_seen, info.tx_in
        )
    } else {
        format!("{label}: {state}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::control::SlaveConfig;
    use crate::net::types::NetAddress;
    use crate::services::{OverlayParams, Services};
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_slave(alias: &str) -> SlaveConfig {
        SlaveConfig {
            alias: alias.to_string(),
            wallet_address: "n1tJYLcLrVYSCXsEkFCtFmUJWdmRA1WqsL".to_string(),
            inet_address: NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 19999),
            shared_private_key: bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
        }
    }

    #[tokio::test]
    async fn non_control_node_rejects_every_command() {
        let (services, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        let handler = RpcHandler::new(NodeHandle::Utility(Arc::new(UtilityNode::new(services))));
        assert!(matches!(
            handler.generate_shared_key().await,
            Err(OperatorError::NotControlNode)
        ));
        assert!(matches!(
            handler.test().await,
            Err(OperatorError::NotControlNode)
        ));
    }

    #[tokio::test]
    async fn test_command_returns_finished_for_control_node() {
        let (services, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        let control = Arc::new(ControlNode::new(services));
        let handler = RpcHandler::new(NodeHandle::Control(control));
        assert_eq!(handler.test().await.unwrap(), "finished");
    }

    #[tokio::test]
    async fn list_service_nodes_renders_loaded_slaves() {
        let (services, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        let control = ControlNode::new(services);
        control.load_slaves(vec![sample_slave("alpha")]).await.unwrap();
        let handler = RpcHandler::new(NodeHandle::Control(Arc::new(control)));
        let rendered = handler.list_service_nodes(false).await.unwrap();
        assert!(rendered.contains("alpha: stopped"));
    }

    #[tokio::test]
    async fn start_service_nodes_empty_alias_list_targets_all_slaves() {
        let (services, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        let control = ControlNode::new(services);
        control.load_slaves(vec![sample_slave("alpha"), sample_slave("beta")]).await.unwrap();
        let handler = RpcHandler::new(NodeHandle::Control(Arc::new(control)));
        let rendered = handler.start_service_nodes(&[]).await.unwrap();
        assert!(rendered.contains("alpha:"));
        assert!(rendered.contains("beta:"));
    }

    #[tokio::test]
    async fn every_command_rejects_while_chain_is_syncing() {
        let (services, chain, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        chain.set_ibd(true);
        let control = ControlNode::new(services);
        control.load_slaves(vec![sample_slave("alpha")]).await.unwrap();
        let handler = RpcHandler::new(NodeHandle::Control(Arc::new(control)));

        assert!(matches!(
            handler.generate_shared_key().await,
            Err(OperatorError::ChainSyncing)
        ));
        assert!(matches!(
            handler.list_service_nodes(false).await,
            Err(OperatorError::ChainSyncing)
        ));
        assert!(matches!(handler.test().await, Err(OperatorError::ChainSyncing)));
    }

    #[tokio::test]
    async fn every_command_rejects_while_wallet_is_locked() {
        let (services, _chain, _mempool, wallet, ..) = Services::test_doubles(OverlayParams::new(
            crate::services::ChainParams::testnet(),
        ));
        wallet.locked.store(true, std::sync::atomic::Ordering::SeqCst);
        let control = ControlNode::new(services);
        control.load_slaves(vec![sample_slave("alpha")]).await.unwrap();
        let handler = RpcHandler::new(NodeHandle::Control(Arc::new(control)));

        assert!(matches!(
            handler.generate_shared_key().await,
            Err(OperatorError::WalletLocked)
        ));
        assert!(matches!(
            handler.list_service_nodes(false).await,
            Err(OperatorError::WalletLocked)
        ));
        assert!(matches!(handler.test().await, Err(OperatorError::WalletLocked)));
    }
}
