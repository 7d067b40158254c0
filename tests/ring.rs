use std::{sync::Arc, time::Duration};

use orbit::{
    aggregate::{AggregationMode, Coordinator, MemberOutcome},
    checkpoint::Checkpoint,
    codec::{Blob, CodecPolicy},
    engine::DirectiveEngine,
    identity::NodeIdentity,
    net::{local::LocalNetwork, PeerClient, Request, Response, Service},
    node::{NodeOptions, PeerNode, RegionalNode, TickOutcome},
    ring::{collect_members, insert_after, Topology},
    work::{ContextFrame, WorkUnit},
    Error,
};

struct Ring {
    net: Arc<LocalNetwork>,
    client: PeerClient,
    nodes: Vec<Arc<PeerNode>>,
}

impl Ring {
    fn build(addresses: &[&str], options: NodeOptions) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let net = LocalNetwork::new();
        let client = PeerClient::new(net.clone(), Duration::from_secs(2));
        let nodes: Vec<_> = addresses
            .iter()
            .map(|address| {
                let node = PeerNode::new(*address, client.clone(), Arc::new(DirectiveEngine), options.clone());
                net.register(*address, node.clone());
                node
            })
            .collect();
        for (i, node) in nodes.iter().enumerate() {
            node.set_next(addresses[(i + 1) % addresses.len()]);
        }
        Self { net, client, nodes }
    }

    fn new(addresses: &[&str]) -> Self {
        Self::build(addresses, NodeOptions::default())
    }

    async fn depths(&self) -> Vec<usize> {
        let mut depths = Vec::new();
        for node in &self.nodes {
            depths.push(node.queue_depth().await);
        }
        depths
    }
}

fn units(prefix: &str, n: usize) -> Vec<WorkUnit> {
    (0..n)
        .map(|i| WorkUnit::new(format!("{prefix}-{i}"), format!("emit {prefix}-{i} on {{address}}")))
        .collect()
}

#[tokio::test]
async fn surplus_above_threshold_moves_exactly_half() {
    let ring = Ring::new(&["a", "b"]);
    let (a, b) = (&ring.nodes[0], &ring.nodes[1]);
    a.prime(units("a", 6)).await;
    b.prime(units("b", 2)).await;

    assert_eq!(
        a.tick().await,
        TickOutcome::Transferred {
            moved: 3,
            remaining: 3
        }
    );
    assert_eq!(ring.depths().await, vec![3, 5]);
    assert_eq!(a.queued().await, vec!["a-3", "a-4", "a-5"]);
    assert!(b.queued().await.contains(&"a-0".to_string()));
    assert_eq!(a.stats().units_sent, 3);
    assert_eq!(b.stats().units_received, 3);

    assert_eq!(
        b.tick().await,
        TickOutcome::Transferred {
            moved: 2,
            remaining: 3
        }
    );
    assert_eq!(ring.depths().await, vec![5, 3]);
}

#[tokio::test]
async fn below_threshold_nothing_moves() {
    let ring = Ring::new(&["a", "b"]);
    ring.nodes[0].prime(units("a", 5)).await;
    ring.nodes[1].prime(units("b", 4)).await;
    assert_eq!(
        ring.nodes[0].tick().await,
        TickOutcome::Stable {
            local: 5,
            neighbor: 4
        }
    );
    ring.nodes[1].purge(&["b-0".into(), "b-1".into(), "b-2".into(), "b-3".into()]).await;
    ring.nodes[0].purge(&["a-0".into(), "a-1".into(), "a-2".into(), "a-3".into()]).await;
    // one unit against none: half of one is zero
    assert_eq!(
        ring.nodes[0].tick().await,
        TickOutcome::Stable {
            local: 1,
            neighbor: 0
        }
    );
}

#[tokio::test]
async fn failed_transfers_keep_every_unit() {
    let ring = Ring::new(&["a", "b"]);
    let a = &ring.nodes[0];
    a.prime(units("a", 6)).await;
    ring.net.take_down("b");

    assert_eq!(a.tick().await, TickOutcome::Failed);
    assert_eq!(a.tick().await, TickOutcome::Failed);
    assert_eq!(a.queue_depth().await, 6);
    assert_eq!(a.stats().consecutive_failures, 2);
    assert_eq!(a.stats().transfer_failures, 2);

    ring.net.bring_up("b");
    assert!(matches!(a.tick().await, TickOutcome::Transferred { moved: 3, .. }));
    assert_eq!(a.stats().consecutive_failures, 0);
    assert_eq!(ring.depths().await, vec![3, 3]);
}

#[tokio::test]
async fn lone_node_skips_balancing() {
    let ring = Ring::new(&["a"]);
    ring.nodes[0].prime(units("a", 4)).await;
    assert_eq!(ring.nodes[0].tick().await, TickOutcome::Skipped);
}

#[tokio::test]
async fn ten_units_spread_over_three_nodes() {
    let ring = Ring::new(&["a", "b", "c"]);
    ring.nodes[0].prime(units("u", 10)).await;

    for _ in 0..20 {
        for node in &ring.nodes {
            node.tick().await;
        }
    }
    let depths = ring.depths().await;
    assert_eq!(depths.iter().sum::<usize>(), 10, "units lost or duplicated: {:?}", depths);
    assert!(depths.iter().all(|&d| d >= 2 && d <= 5), "unbalanced: {:?}", depths);

    let mut names = Vec::new();
    for node in &ring.nodes {
        names.extend(node.queued().await);
    }
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 10);
}

#[tokio::test]
async fn sealed_transfers_reach_the_neighbor() {
    let options = NodeOptions::builder().codec(CodecPolicy::Seal).build();
    let ring = Ring::build(&["a", "b"], options);
    ring.nodes[0].prime(units("s", 4)).await;
    assert!(matches!(ring.nodes[0].tick().await, TickOutcome::Transferred { moved: 2, .. }));
    assert_eq!(ring.depths().await, vec![2, 2]);
    assert_eq!(ring.nodes[1].stats().undecodable_dropped, 0);
}

#[tokio::test]
async fn request_blob_pulls_surplus() {
    let ring = Ring::new(&["a", "b"]);
    ring.nodes[0].prime(units("a", 6)).await;
    ring.client.receive_blob("a", Blob::request("b")).await.unwrap();

    let b = ring.nodes[1].clone();
    tokio::time::timeout(Duration::from_secs(2), async move {
        while b.queue_depth().await < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("surplus never arrived");
    assert_eq!(ring.depths().await, vec![3, 3]);
}

/// Answers like the wrapped node but holds every `Balance` for a while.
struct SlowToAccept {
    node: Arc<PeerNode>,
    delay: Duration,
}

#[async_trait::async_trait]
impl Service for SlowToAccept {
    async fn handle(&self, request: Request) -> Response {
        if let Request::Balance(_) = request {
            tokio::time::sleep(self.delay).await;
        }
        self.node.handle(request).await
    }
}

fn slow_ring(addresses: &[&str], delay: Duration) -> Ring {
    let ring = Ring::new(addresses);
    for (address, node) in addresses.iter().zip(&ring.nodes).skip(1) {
        let slow = SlowToAccept {
            node: node.clone(),
            delay,
        };
        ring.net.register(*address, Arc::new(slow));
    }
    ring
}

async fn all_names(ring: &Ring) -> Vec<String> {
    let mut names = Vec::new();
    for node in &ring.nodes {
        names.extend(node.queued().await);
    }
    names.sort();
    names
}

#[tokio::test]
async fn concurrent_migrations_never_copy_a_unit() {
    let ring = slow_ring(&["a", "b", "c"], Duration::from_millis(100));
    let a = &ring.nodes[0];
    a.prime(units("u", 2)).await;

    let (tick, request) = tokio::join!(a.tick(), ring.client.receive_blob("a", Blob::request("c")));
    request.unwrap();
    assert!(
        matches!(tick, TickOutcome::Transferred { moved: 1, .. } | TickOutcome::Busy),
        "unexpected {:?}",
        tick
    );
    // let the background answer to the request finish
    tokio::time::sleep(Duration::from_millis(300)).await;

    let names = all_names(&ring).await;
    assert_eq!(names, vec!["u-0", "u-1"], "depths {:?}", ring.depths().await);
    assert_eq!(a.queue_depth().await, 1);
    assert_eq!(a.stats().units_sent, 1);
}

#[tokio::test]
async fn second_transfer_waits_for_the_first() {
    let ring = slow_ring(&["a", "b"], Duration::from_millis(200));
    let a = ring.nodes[0].clone();
    a.prime(units("u", 4)).await;

    let first = tokio::spawn({
        let a = a.clone();
        async move { a.tick().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.tick().await, TickOutcome::Busy);
    // in-flight units still show up in a checkpoint of the sender
    assert_eq!(a.snapshot().await.queue.len(), 4);
    assert_eq!(a.queue_depth().await, 2);

    assert!(matches!(first.await.unwrap(), TickOutcome::Transferred { moved: 2, .. }));
    assert_eq!(ring.depths().await, vec![2, 2]);
    assert_eq!(a.snapshot().await.queue.len(), 2);
}

#[tokio::test]
async fn failed_transfer_puts_units_back_in_order() {
    let ring = slow_ring(&["a", "b"], Duration::from_millis(50));
    let client = PeerClient::new(ring.net.clone(), Duration::from_millis(10));
    let a = PeerNode::new("a", client, Arc::new(DirectiveEngine), NodeOptions::default());
    ring.net.register("a", a.clone());
    a.set_next("b");
    a.prime(units("u", 4)).await;

    // b takes longer to accept than a is willing to wait
    assert_eq!(a.tick().await, TickOutcome::Failed);
    assert_eq!(a.queued().await, vec!["u-0", "u-1", "u-2", "u-3"]);
}

#[tokio::test]
async fn second_run_of_a_round_is_a_no_op() {
    let ring = Ring::new(&["a", "b", "c"]);
    for node in &ring.nodes {
        node.prime(vec![WorkUnit::new("trail", "set trail = {data.trail}{address}")])
            .await;
    }
    let frame = ContextFrame::originate(NodeIdentity::anonymous("origin"));
    let first = ring.nodes[0].run(frame.clone(), vec![]).await.unwrap();
    assert_eq!(first.data.get("trail").map(String::as_str), Some("abc"));
    assert_eq!(first.contributions.len(), 3);

    for node in &ring.nodes {
        assert!(node.run(frame.clone(), vec![]).await.is_none());
        assert_eq!(node.stats().rounds_executed, 1);
    }
}

#[tokio::test]
async fn fan_out_contains_one_entry_per_member() {
    let ring = Ring::new(&["n1", "n2", "n3", "n4"]);
    for (i, node) in ring.nodes.iter().enumerate() {
        let code = if i == 1 {
            "fail n2 exploded".to_string()
        } else {
            "emit ok from {address}".to_string()
        };
        node.prime(vec![WorkUnit::new("report", code)]).await;
    }

    let coordinator = Coordinator::new(ring.client.clone(), 16);
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.round(AggregationMode::FanOut, "n1", NodeIdentity::anonymous("cli"), vec![]),
    )
    .await
    .expect("round hung")
    .unwrap();

    let entries = report.entries();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries.iter().filter(|e| e.starts_with("<error:")).count(), 1);
    assert_eq!(entries[1], "<error: n2 exploded>");
    assert_eq!(entries[3], "ok from n4");
    assert_eq!(report.error_count(), 1);
    let addresses: Vec<_> = report.members.iter().map(|m| m.address.as_str()).collect();
    assert_eq!(addresses, vec!["n1", "n2", "n3", "n4"]);
}

#[tokio::test]
async fn fan_out_slots_follow_members_not_units() {
    let ring = Ring::new(&["n1", "n2", "n3"]);
    ring.nodes[1]
        .prime(vec![
            WorkUnit::new("first", "emit one on {address}"),
            WorkUnit::new("second", "emit two on {address}"),
        ])
        .await;
    ring.nodes[2].prime(vec![WorkUnit::new("only", "emit {address}")]).await;

    let report = Coordinator::new(ring.client.clone(), 16)
        .round(AggregationMode::FanOut, "n1", NodeIdentity::anonymous("cli"), vec![])
        .await
        .unwrap();
    assert_eq!(report.entries(), vec!["", "one on n2 | two on n2", "n3"]);
    assert_eq!(report.joined(), "\none on n2 | two on n2\nn3");
    assert!(!report.is_error());
}

#[tokio::test]
async fn fan_out_aborts_on_a_broken_ring() {
    let ring = Ring::new(&["a", "b", "c"]);
    ring.nodes[2].set_next("b");
    let coordinator = Coordinator::new(ring.client.clone(), 8);
    let err = coordinator
        .round(AggregationMode::FanOut, "a", NodeIdentity::anonymous("cli"), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RingIntegrity { cap: 8, .. }));
}

#[tokio::test]
async fn relay_collects_in_ring_order() {
    let ring = Ring::new(&["a", "b", "c"]);
    for node in &ring.nodes {
        node.prime(vec![WorkUnit::new("hop", "set trail = {data.trail}{address}\nemit {data.trail}")])
            .await;
    }
    let coordinator = Coordinator::new(ring.client.clone(), 16);
    let report = coordinator
        .round(AggregationMode::Relay, "a", NodeIdentity::anonymous("cli"), vec![])
        .await
        .unwrap();

    let addresses: Vec<_> = report.members.iter().map(|m| m.address.as_str()).collect();
    assert_eq!(addresses, vec!["b", "c", "a"]);
    assert_eq!(report.joined(), "b\nbc\nbca");
    assert!(!report.is_error());
}

#[tokio::test]
async fn relay_on_a_single_node() {
    let ring = Ring::new(&["solo"]);
    ring.nodes[0].prime(units("x", 2)).await;
    let report = Coordinator::new(ring.client.clone(), 4)
        .round(AggregationMode::Relay, "solo", NodeIdentity::anonymous("cli"), vec!["x-1".into()])
        .await
        .unwrap();
    assert_eq!(report.members.len(), 1);
    match &report.members[0].outcome {
        MemberOutcome::Contributed(list) => assert_eq!(list.len(), 1),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(report.joined(), "x-1 on solo");
}

#[tokio::test]
async fn inserting_after_an_anchor_keeps_the_ring_closed() {
    let ring = Ring::new(&["A", "B", "C"]);
    let d = PeerNode::new("D", ring.client.clone(), Arc::new(DirectiveEngine), NodeOptions::default());
    ring.net.register("D", d.clone());

    insert_after(&ring.client, "A", "D").await.unwrap();
    assert_eq!(
        collect_members(&ring.client, "A", 16).await.unwrap(),
        vec!["A", "D", "B", "C"]
    );
    for start in ["A", "B", "C", "D"] {
        let mut members = collect_members(&ring.client, start, 16).await.unwrap();
        assert_eq!(members[0], start);
        members.sort();
        assert_eq!(members, vec!["A", "B", "C", "D"]);
    }
}

#[tokio::test]
async fn traversal_reports_unreachable_members() {
    let ring = Ring::new(&["a", "b", "c"]);
    ring.net.take_down("b");
    let err = collect_members(&ring.client, "a", 16).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

struct Regions {
    net: Arc<LocalNetwork>,
    a1: Arc<RegionalNode>,
    a2: Arc<PeerNode>,
    b1: Arc<RegionalNode>,
}

fn regions() -> Regions {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let net = LocalNetwork::new();
    let client = PeerClient::new(net.clone(), Duration::from_secs(2));
    let node = |address: &str| {
        PeerNode::new(address, client.clone(), Arc::new(DirectiveEngine), NodeOptions::default())
    };
    let a1 = RegionalNode::new(node("a1"), Some("b1".into()));
    let a2 = node("a2");
    let b1 = RegionalNode::new(node("b1"), Some("a1".into()));
    a1.node().set_next("a2");
    a2.set_next("a1");
    net.register("a1", a1.clone());
    net.register("a2", a2.clone());
    net.register("b1", b1.clone());
    Regions { net, a1, a2, b1 }
}

#[tokio::test]
async fn regional_tick_moves_work_between_rings() {
    let r = regions();
    r.a1.node().prime(units("a1", 8)).await;
    r.a2.prime(units("a2", 8)).await;

    assert_eq!(r.a1.regional_queue_depth().await.unwrap(), 16);
    assert_eq!(
        r.a1.regional_tick().await,
        TickOutcome::Transferred {
            moved: 4,
            remaining: 4
        }
    );
    assert_eq!(r.b1.node().queue_depth().await, 4);
    assert_eq!(r.a1.regional_queue_depth().await.unwrap(), 12);

    // b1 now holds 4 against a1's 4: nothing to do
    assert!(matches!(r.b1.regional_tick().await, TickOutcome::Stable { .. }));
}

#[tokio::test]
async fn local_ring_goes_before_the_regional_one() {
    let r = regions();
    r.a1.node().prime(units("a1", 8)).await;

    assert_eq!(r.a1.regional_tick().await, TickOutcome::Deferred);
    assert_eq!(r.b1.node().queue_depth().await, 0);

    assert!(matches!(r.a1.node().tick().await, TickOutcome::Transferred { moved: 4, .. }));
    assert_eq!(r.a2.queue_depth().await, 4);
}

#[tokio::test]
async fn regional_requests_need_a_regional_node() {
    let r = regions();
    r.a2.prime(units("a2", 3)).await;
    let client = PeerClient::new(r.net.clone(), Duration::from_secs(1));
    assert_eq!(client.regional_queue_depth("a1").await.unwrap(), 3);
    assert!(client.regional_queue_depth("a2").await.is_err());

    client.set_regional_next("b1", "somewhere").await.unwrap();
    assert_eq!(r.b1.regional_next().as_deref(), Some("somewhere"));
    assert!(matches!(
        r.a2.handle(Request::SetRegionalNext("x".into())).await,
        Response::Rejected(_)
    ));
}

#[tokio::test]
async fn checkpoints_bring_a_ring_back() {
    let r = regions();
    r.a1.node().prime(units("a1", 2)).await;
    r.a2.prime(units("a2", 1)).await;

    let checkpoint = Checkpoint::new(vec![
        r.a1.snapshot().await,
        r.a2.snapshot().await,
        r.b1.snapshot().await,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.ckpt");
    checkpoint.write(&path).await.unwrap();

    let restored = Checkpoint::read(&path).await.unwrap().unwrap();
    assert_eq!(restored, checkpoint);
    assert_eq!(restored.unit_count(), 3);
    assert_eq!(
        Topology::from_checkpoint(&restored).rings().unwrap(),
        vec![vec!["a1".to_string(), "a2".to_string()], vec!["b1".to_string()]]
    );
    assert!(Topology::regional_from_checkpoint(&restored).is_single_ring());

    let net = LocalNetwork::new();
    let client = PeerClient::new(net.clone(), Duration::from_secs(1));
    let a1 = restored.node("a1").unwrap().clone();
    let node = PeerNode::restore(a1.clone(), client, Arc::new(DirectiveEngine), NodeOptions::default());
    assert_eq!(node.info(), a1.identity);
    assert_eq!(node.neighbor(), "a2");
    assert_eq!(node.queued().await, vec!["a1-0", "a1-1"]);
}
