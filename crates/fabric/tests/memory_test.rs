//! Link memory exercised through real links.
//!
//! # Test Strategy
//!
//! 1. **Size classes**: rounding, zero and oversized requests
//! 2. **Sharing**: fragments resolve and free from either peer
//! 3. **Expansion**: new buffers reach the peer, classes converge
//! 4. **Delegation**: a sandboxed node allocates through its broker
//! 5. **Concurrency**: both peers allocate and free at once

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fabric::driver::local::LocalDriver;
use fabric::message::Message;
use fabric::{
    BufferId, ConnectFlags, Fragment, FragmentDescriptor, MemoryConfig, Node, NodeConfig,
    NodeType,
};
use parking_lot::Mutex;
use proptest::prelude::*;

use common::{name, Cluster};

// ============================================================================
// Size classes
// ============================================================================

#[test]
fn test_size_rounding_over_a_link() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();

    assert!(memory.allocate_fragment(0).is_null());
    for size in 1..=63 {
        assert_eq!(memory.allocate_fragment(size).size(), 64);
    }
    assert_eq!(memory.allocate_fragment(250).size(), 256);
}

#[test]
fn test_oversized_request_never_expands() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();
    let before = cluster.driver.allocated_bytes();

    for _ in 0..3 {
        assert!(memory.allocate_fragment(64 * 1024 * 1024).is_null());
    }
    assert_eq!(cluster.driver.allocated_bytes(), before);
    assert_eq!(memory.buffer_count(), 1);
}

// ============================================================================
// Sharing
// ============================================================================

#[test]
fn test_fragment_resolves_and_frees_from_either_peer() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let ours = node.broker_link().unwrap().memory().clone();
    let theirs = cluster.broker.link(name(&node)).unwrap().memory().clone();

    let fragment = ours.allocate_fragment(500);
    assert!(fragment.write_bytes(0, b"shared"));
    let resolved = theirs.get_fragment(fragment.descriptor());
    assert_eq!(resolved.descriptor(), fragment.descriptor());
    assert_eq!(&resolved.read_bytes().unwrap()[..6], b"shared");

    assert!(theirs.free_fragment(&resolved));
    assert!(!ours.free_fragment(&fragment), "already freed by the peer");
}

#[test]
fn test_bogus_free_does_not_corrupt_allocator() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();

    // Never allocated, misaligned, wrong size, unknown buffer.
    for descriptor in [
        FragmentDescriptor::new(BufferId::PRIMARY, 64 * 40, 64),
        FragmentDescriptor::new(BufferId::PRIMARY, 64 * 3 + 8, 64),
        FragmentDescriptor::new(BufferId::PRIMARY, 0, 256),
        FragmentDescriptor::new(BufferId(99), 0, 64),
    ] {
        let fragment = memory.get_fragment(descriptor);
        assert!(!memory.free_fragment(&fragment));
    }

    let mut seen = HashSet::new();
    let mut held = Vec::new();
    loop {
        let fragment = memory.allocate_fragment(64);
        if fragment.is_null() || fragment.buffer_id() != BufferId::PRIMARY {
            break;
        }
        assert!(seen.insert(fragment.offset()), "block handed out twice");
        held.push(fragment);
    }
    // (8 KiB - 8 byte head) / (64 byte block + 4 byte state word)
    assert_eq!(held.len(), 120);
    for fragment in &held {
        assert!(memory.free_fragment(fragment));
    }
}

// ============================================================================
// Expansion
// ============================================================================

#[test]
fn test_exhaustion_expands_into_higher_buffer() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();
    let peer = cluster.broker.link(name(&node)).unwrap().memory().clone();

    let mut held = Vec::new();
    let mut first_failure = None;
    for attempt in 0..1000 {
        let fragment = memory.allocate_fragment(1024);
        if fragment.is_null() {
            first_failure = Some(attempt);
            break;
        }
        held.push(fragment);
    }
    // 8 KiB of 1 KiB blocks, minus the allocator's own metadata block.
    assert_eq!(first_failure, Some(7));
    assert!(held.iter().all(|f| f.buffer_id() == BufferId::PRIMARY));

    let next = memory.allocate_fragment(1024);
    assert!(next.is_addressable());
    assert!(next.buffer_id() > BufferId::PRIMARY);
    assert_eq!(memory.buffer_count(), 2, "one expansion for one exhaustion");
    assert_eq!(peer.buffer_count(), 2);

    // The peer learned about the new buffer and can use it.
    assert!(peer.has_buffer(next.buffer_id()));
    assert!(next.write_bytes(1000, b"tail"));
    let resolved = peer.get_fragment(next.descriptor());
    assert_eq!(&resolved.read_bytes().unwrap()[1000..1004], b"tail");
    assert!(peer.free_fragment(&resolved));
}

#[test]
fn test_pending_expansion_is_requested_once() {
    let cluster = Cluster::new();
    // Expansion can only go through the delegate, whose replies we hold back.
    let node = Node::new(NodeType::Normal, LocalDriver::with_memory_limit(0));
    let transport = cluster.connect_held(
        &node,
        ConnectFlags::TO_BROKER | ConnectFlags::TO_ALLOCATION_DELEGATE,
    );
    let memory = node.broker_link().unwrap().memory().clone();
    let peer = cluster.broker.link(name(&node)).unwrap().memory().clone();
    assert_eq!(memory.block_capacity(4096), 0);

    transport.hold();
    let added = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let memory = &memory;
            let added = added.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    assert!(memory.allocate_fragment(4096).is_null());
                }
                memory.request_block_capacity(
                    4096,
                    Box::new(move |ok| {
                        if ok {
                            added.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                );
            });
        }
    });

    let sent = transport.held();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0], Message::RequestMemory { .. }));
    assert_eq!(added.load(Ordering::SeqCst), 0);
    assert_eq!(memory.buffer_count(), 1);

    transport.release();
    assert_eq!(added.load(Ordering::SeqCst), 4, "every waiter hears of the one buffer");
    assert_eq!(memory.buffer_count(), 2);
    assert_eq!(peer.buffer_count(), 2);
    assert!(peer.has_buffer(BufferId(1)));
    assert_eq!(memory.allocate_fragment(4096).buffer_id(), BufferId(1));
}

#[test]
fn test_zero_capacity_class_succeeds_after_expansion() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();

    assert_eq!(memory.block_capacity(16 * 1024), 0);
    assert!(memory.allocate_fragment(16 * 1024).is_null());
    let fragment = memory.allocate_fragment(16 * 1024);
    assert!(!fragment.is_null());
    assert_eq!(fragment.size(), 16 * 1024);
    assert!(fragment.buffer_id() > BufferId::PRIMARY);
}

#[test]
fn test_both_peers_expand_without_id_collisions() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let ours = node.broker_link().unwrap().memory().clone();
    let theirs = cluster.broker.link(name(&node)).unwrap().memory().clone();

    let ours_done = Arc::new(AtomicBool::new(false));
    let flag = ours_done.clone();
    ours.request_block_capacity(4096, Box::new(move |ok| flag.store(ok, Ordering::SeqCst)));
    let theirs_done = Arc::new(AtomicBool::new(false));
    let flag = theirs_done.clone();
    theirs.request_block_capacity(8192, Box::new(move |ok| flag.store(ok, Ordering::SeqCst)));
    assert!(ours_done.load(Ordering::SeqCst));
    assert!(theirs_done.load(Ordering::SeqCst));

    assert_eq!(ours.buffer_count(), 3);
    assert_eq!(theirs.buffer_count(), 3);
    for id in [BufferId(1), BufferId(2)] {
        assert!(ours.has_buffer(id));
        assert!(theirs.has_buffer(id));
    }
    assert_eq!(ours.block_capacity(4096), theirs.block_capacity(4096));
}

#[test]
fn test_class_exhaustion_is_permanent_and_isolated() {
    let config = NodeConfig::default().with_memory(
        MemoryConfig::default()
            .with_expansion_buffer_size(4096)
            .with_max_class_capacity(16 * 1024),
    );
    let cluster = Cluster::with_config(config);
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();

    let mut held: Vec<Fragment> = Vec::new();
    for _ in 0..100 {
        let fragment = memory.allocate_fragment(4096);
        if !fragment.is_null() {
            held.push(fragment);
        }
    }
    assert!(memory.is_class_exhausted(4096));
    assert_eq!(held.len() * 4096, memory.block_capacity(4096));
    assert!(memory.allocate_fragment(4096).is_null());

    assert!(!memory.is_class_exhausted(64));
    assert!(!memory.allocate_fragment(64).is_null());
}

#[test]
fn test_failed_memory_allocation_exhausts_class() {
    // Enough for the primary buffer of one link and nothing else.
    let driver = LocalDriver::with_memory_limit(64 * 1024);
    let cluster = Cluster::with_driver(driver);
    let node = cluster.join();
    let memory = node.broker_link().unwrap().memory().clone();

    let added = Arc::new(Mutex::new(None));
    let slot = added.clone();
    memory.request_block_capacity(2048, Box::new(move |ok| *slot.lock() = Some(ok)));
    assert_eq!(*added.lock(), Some(false));
    assert!(memory.is_class_exhausted(2048));
    assert!(!memory.allocate_fragment(2048).is_null(), "primary blocks remain");
}

// ============================================================================
// Delegation
// ============================================================================

#[test]
fn test_allocation_delegate_serves_memory() {
    let cluster = Cluster::new();
    // The sandboxed node's own driver cannot allocate anything.
    let sandboxed = LocalDriver::with_memory_limit(0);
    let node = Node::new(NodeType::Normal, sandboxed.clone());
    cluster.connect(
        &node,
        ConnectFlags::TO_BROKER | ConnectFlags::TO_ALLOCATION_DELEGATE,
        &[],
        &[],
    );
    assert!(node.allocation_delegate_link().is_some());

    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    node.allocate_shared_memory(
        4096,
        Box::new(move |memory| *slot.lock() = Some(memory.map(|m| m.size()))),
    );
    assert_eq!(*result.lock(), Some(Some(4096)));

    // Expansion goes through the delegate too.
    let memory = node.broker_link().unwrap().memory().clone();
    assert!(memory.allocate_fragment(8192).is_null());
    assert!(!memory.allocate_fragment(8192).is_null());
    assert_eq!(sandboxed.allocated_bytes(), 0);
}

#[test]
fn test_without_delegate_sandboxed_allocation_fails() {
    let cluster = Cluster::new();
    let node = Node::new(NodeType::Normal, LocalDriver::with_memory_limit(0));
    cluster.connect(&node, ConnectFlags::TO_BROKER, &[], &[]);

    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    node.allocate_shared_memory(
        4096,
        Box::new(move |memory| *slot.lock() = Some(memory.is_some())),
    );
    assert_eq!(*result.lock(), Some(false));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_peers_allocate_and_free_concurrently() {
    let cluster = Cluster::new();
    let node = cluster.join();
    let ours = node.broker_link().unwrap().memory().clone();
    let theirs = cluster.broker.link(name(&node)).unwrap().memory().clone();

    let handed_out = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for memory in [&ours, &theirs, &ours, &theirs] {
            let handed_out = &handed_out;
            let other = if Arc::ptr_eq(memory, &ours) { &theirs } else { &ours };
            scope.spawn(move || {
                let mut mine = Vec::new();
                for round in 0..300 {
                    let fragment = memory.allocate_fragment(200);
                    if !fragment.is_null() {
                        mine.push(fragment.descriptor());
                    }
                    if round % 2 == 1 {
                        if let Some(descriptor) = mine.pop() {
                            // Free through the other peer half the time, once
                            // it has heard of the buffer.
                            let freer = if round % 4 == 1 && other.has_buffer(descriptor.buffer_id) {
                                other
                            } else {
                                memory
                            };
                            assert!(freer.free_fragment(&freer.get_fragment(descriptor)));
                        }
                    }
                }
                handed_out.lock().extend(mine);
            });
        }
    });

    let held = handed_out.into_inner();
    let unique: HashSet<FragmentDescriptor> = held.iter().copied().collect();
    assert_eq!(unique.len(), held.len());
    for descriptor in held {
        assert!(theirs.free_fragment(&theirs.get_fragment(descriptor)));
    }
}

proptest! {
    #[test]
    fn prop_fragment_size_is_covering_power_of_two(size in 1usize..=4096) {
        let cluster = Cluster::new();
        let node = cluster.join();
        let memory = node.broker_link().unwrap().memory().clone();
        let mut fragment = memory.allocate_fragment(size);
        if fragment.is_null() {
            fragment = memory.allocate_fragment(size);
        }
        let got = fragment.size() as usize;
        prop_assert!(got.is_power_of_two());
        prop_assert!(got >= size.max(64));
        prop_assert!(got / 2 < size.max(64));
    }
}
