//! Scenarios run by the CLI, each over a fresh in-process driver.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use clap::Subcommand;
use fabric::driver::local::LocalDriver;
use fabric::driver::{Driver, DriverObject};
use fabric::{ConnectFlags, Node, NodeConfig, NodeName, NodeType};
use serde_json::json;
use tracing::info;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Connect nodes to a broker and introduce every pair.
    Mesh {
        #[arg(long, default_value_t = 4)]
        nodes: usize,
    },
    /// Allocate and free fragments from both ends of one link.
    Alloc {
        #[arg(long, default_value_t = 256)]
        size: usize,
        #[arg(long, default_value_t = 10_000)]
        rounds: usize,
        /// Threads per link peer.
        #[arg(long, default_value_t = 2)]
        threads: usize,
        /// How many fragments each thread holds before freeing them.
        #[arg(long, default_value_t = 64)]
        hold: usize,
    },
    /// Print the effective node configuration.
    Config,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub summary: String,
    pub details: serde_json::Value,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

impl Command {
    pub async fn execute(&self, config: NodeConfig) -> anyhow::Result<CommandResult> {
        match *self {
            Command::Mesh { nodes } => mesh(config, nodes).await,
            Command::Alloc {
                size,
                rounds,
                threads,
                hold,
            } => alloc(config, size, rounds, threads, hold),
            Command::Config => Ok(CommandResult {
                summary: serde_json::to_string_pretty(&config)?,
                details: serde_json::to_value(&config)?,
            }),
        }
    }
}

/// A broker plus `count` normal nodes, each connected to it.
fn cluster(
    driver: &Arc<LocalDriver>,
    config: &NodeConfig,
    count: usize,
) -> anyhow::Result<(Arc<Node>, Vec<Arc<Node>>)> {
    let broker = Node::builder(NodeType::Broker, driver.clone())
        .with_config(config.clone())
        .build()?;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let node = Node::builder(NodeType::Normal, driver.clone())
            .with_config(config.clone())
            .build()?;
        let (for_broker, for_node) = driver.create_transports()?;
        broker.connect_node(for_broker, ConnectFlags::NONE, &[])?;
        node.connect_node(for_node, ConnectFlags::TO_BROKER, &[])?;
        nodes.push(node);
    }
    Ok((broker, nodes))
}

fn name_of(node: &Node) -> anyhow::Result<NodeName> {
    node.assigned_name()
        .ok_or_else(|| anyhow!("node finished connecting without a name"))
}

async fn mesh(config: NodeConfig, count: usize) -> anyhow::Result<CommandResult> {
    if count < 2 {
        bail!("a mesh needs at least two nodes, got {count}");
    }
    let driver = LocalDriver::new();
    let started = Instant::now();
    let (broker, nodes) = cluster(&driver, &config, count)?;
    let names = nodes
        .iter()
        .map(|n| name_of(n))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut introduced = 0;
    for (i, node) in nodes.iter().enumerate() {
        for name in &names[i + 1..] {
            match node.establish_link_async(*name).await {
                Some(_) => introduced += 1,
                None => bail!("introduction of {} to {name} failed", names[i]),
            }
        }
    }

    let relayed = Arc::new(AtomicUsize::new(0));
    let counter = relayed.clone();
    let last = &nodes[count - 1];
    last.set_routed_message_handler(Arc::new(
        move |from: NodeName, payload: Bytes, _objects: Vec<DriverObject>| -> fabric::Result<()> {
            info!(%from, bytes = payload.len(), "relayed payload");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    ));
    nodes[0].send_relayed(names[count - 1], b"hello through the broker", Vec::new())?;

    let links: Vec<usize> = nodes.iter().map(|n| n.links().len()).collect();
    let elapsed = started.elapsed();
    info!(nodes = count, introduced, ?elapsed, "mesh complete");

    for node in &nodes {
        node.shut_down();
    }
    broker.shut_down();

    Ok(CommandResult {
        summary: format!(
            "{count} nodes, {introduced} introductions, {} relayed in {elapsed:?}",
            relayed.load(Ordering::SeqCst)
        ),
        details: json!({
            "nodes": names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
            "introductions": introduced,
            "links_per_node": links,
            "relayed": relayed.load(Ordering::SeqCst),
            "elapsed_us": elapsed.as_micros() as u64,
        }),
    })
}

fn alloc(
    config: NodeConfig,
    size: usize,
    rounds: usize,
    threads: usize,
    hold: usize,
) -> anyhow::Result<CommandResult> {
    let driver = LocalDriver::new();
    let (broker, nodes) = cluster(&driver, &config, 1)?;
    let node = &nodes[0];
    let ours = node
        .broker_link()
        .ok_or_else(|| anyhow!("node has no broker link"))?
        .memory()
        .clone();
    let theirs = broker
        .link(name_of(node)?)
        .ok_or_else(|| anyhow!("broker has no link to the node"))?
        .memory()
        .clone();

    let allocated = AtomicUsize::new(0);
    let misses = AtomicUsize::new(0);
    let started = Instant::now();
    std::thread::scope(|scope| {
        for i in 0..threads * 2 {
            let memory = if i % 2 == 0 { &ours } else { &theirs };
            let (allocated, misses) = (&allocated, &misses);
            scope.spawn(move || {
                let mut held = Vec::with_capacity(hold.max(1));
                for _ in 0..rounds {
                    let fragment = memory.allocate_fragment(size);
                    if fragment.is_null() {
                        misses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        allocated.fetch_add(1, Ordering::Relaxed);
                        held.push(fragment);
                    }
                    if held.len() >= hold.max(1) {
                        for fragment in held.drain(..) {
                            memory.free_fragment(&fragment);
                        }
                    }
                }
                for fragment in held.drain(..) {
                    memory.free_fragment(&fragment);
                }
            });
        }
    });
    let elapsed = started.elapsed();

    let allocated = allocated.into_inner();
    let misses = misses.into_inner();
    let buffers = ours.buffer_count();
    let capacity = ours.block_capacity(size);
    info!(allocated, misses, buffers, ?elapsed, "allocation stress complete");

    node.shut_down();
    broker.shut_down();

    Ok(CommandResult {
        summary: format!(
            "{allocated} fragments of {size} bytes ({misses} misses) across {buffers} buffers in {elapsed:?}"
        ),
        details: json!({
            "size": size,
            "allocated": allocated,
            "misses": misses,
            "buffers": buffers,
            "class_capacity_bytes": capacity,
            "driver_bytes": driver.allocated_bytes(),
            "elapsed_us": elapsed.as_micros() as u64,
        }),
    })
}
