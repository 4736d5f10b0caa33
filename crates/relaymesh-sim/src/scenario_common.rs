/// Common types and helpers for mesh scenarios.
use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use relaymesh_protocol::{MemoryNetwork, MeshConfig, MeshEvent, MeshNode, PeerId};
use serde::Serialize;
use tokio::sync::mpsc;

/// Result of a scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
    }

    pub fn emit_jsonl(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{json}");
        }
    }
}

/// Run a timed async step.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    match f().await {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            detail: if detail.is_empty() { None } else { Some(detail) },
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            detail: Some(detail),
        },
    }
}

/// Turn a boolean check into a step outcome.
pub fn check(ok: bool, detail: String) -> Result<String, String> {
    if ok {
        Ok(detail)
    } else {
        Err(detail)
    }
}

// ── Mesh setup ───────────────────────────────────────────────────────

/// A node under simulation plus its event stream.
pub struct SimNode {
    pub node: Arc<MeshNode>,
    pub events: mpsc::Receiver<MeshEvent>,
}

impl SimNode {
    pub fn id(&self) -> PeerId {
        self.node.local_id().clone()
    }

    /// Wait for the first event matching `pred`.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut pred: F) -> Result<MeshEvent, String>
    where
        F: FnMut(&MeshEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| "timeout".to_string())?
                .ok_or_else(|| "channel closed".to_string())?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// Events already queued, without waiting.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// How nodes get their identity.
#[derive(Debug, Clone, Copy)]
pub enum Identity {
    /// Short readable ids, no ledger.
    Named,
    /// Fresh Ed25519 keys; ids are hex verifying keys.
    Keyed,
}

/// Register `count` nodes on `net`. Nothing is linked or started yet.
pub fn build_nodes(
    net: &MemoryNetwork,
    count: usize,
    config: &MeshConfig,
    identity: Identity,
) -> Vec<(SimNode, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>)> {
    (0..count)
        .map(|i| {
            let (node, events, inbox) = match identity {
                Identity::Named => {
                    let id = PeerId::new(format!("n{i:02}"));
                    let (transport, inbox) = net.register(id.clone());
                    let (node, events) = MeshNode::new(id, config.clone(), Arc::new(transport));
                    (node, events, inbox)
                }
                Identity::Keyed => {
                    let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
                    let id = PeerId::from_verifying_key(&key.verifying_key());
                    let (transport, inbox) = net.register(id);
                    let (node, events) = MeshNode::with_key(key, config.clone(), Arc::new(transport));
                    (node, events, inbox)
                }
            };
            (SimNode { node, events }, inbox)
        })
        .collect()
}

/// Start every node and pump its inbox.
pub async fn start_nodes(
    registered: Vec<(SimNode, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>)>,
) -> Vec<SimNode> {
    let mut nodes = Vec::with_capacity(registered.len());
    for (sim, inbox) in registered {
        sim.node.start().await;
        sim.node.spawn_inbox(inbox);
        nodes.push(sim);
    }
    nodes
}

pub async fn stop_nodes(nodes: &[SimNode]) {
    for sim in nodes {
        sim.node.shutdown().await;
    }
}

/// Let in-flight frames settle.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
