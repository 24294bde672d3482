use sum_rs::proto::{self, sum_internal_service_client::SumInternalServiceClient};
use sum_rs::test_support::MemoryNode;
use sum_rs::OrchestratorError;

mod support;

use support::{bootstrap, data_client, numbered, record, spawn_orchestrator, tagged, TestNodes};

#[tokio::test(flavor = "multi_thread")]
async fn test_record_crud_over_grpc() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(vec![MemoryNode::new(), MemoryNode::new()]).await?;
    let cluster = bootstrap(&nodes).await?;
    let (addr, server) = spawn_orchestrator(cluster.clone()).await?;
    let mut client = data_client(addr).await?;

    let created = client.create_record(record(0, vec![1.0, 2.0])).await?.into_inner();
    assert!(created.success, "{}", created.msg);
    assert_eq!(created.msg, "1");
    let second = client.create_record(record(0, vec![3.0])).await?.into_inner();
    assert_eq!(second.msg, "2");

    // Each record went to the node holding fewer records at the time.
    let owners = cluster.owners().await;
    assert_eq!(owners.get(&1), Some(&1));
    assert_eq!(owners.get(&2), Some(&2));
    assert_eq!(nodes.nodes[0].record_ids(), vec![1]);
    assert_eq!(nodes.nodes[1].record_ids(), vec![2]);

    let read = client.read_record(proto::ById { id: 1 }).await?.into_inner();
    assert!(read.success);
    assert_eq!(read.record.unwrap().data, vec![1.0, 2.0]);

    let updated = client
        .update_record(tagged(2, vec![4.0, 5.0], &[("kind", "updated")]))
        .await?
        .into_inner();
    assert!(updated.success, "{}", updated.msg);
    let read = client.read_record(proto::ById { id: 2 }).await?.into_inner();
    let stored = read.record.unwrap();
    assert_eq!(stored.data, vec![4.0, 5.0]);
    assert_eq!(stored.meta.get("kind").map(String::as_str), Some("updated"));

    let deleted = client.delete_record(proto::ById { id: 1 }).await?.into_inner();
    assert!(deleted.success, "{}", deleted.msg);
    assert!(nodes.nodes[0].record_ids().is_empty());

    let missing = client.read_record(proto::ById { id: 1 }).await?.into_inner();
    assert!(!missing.success);
    assert_eq!(missing.msg, "record 1 not found.");

    let missing = client.delete_record(proto::ById { id: 42 }).await?.into_inner();
    assert!(!missing.success);
    assert_eq!(missing.msg, "record 42 not found.");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_cluster_refuses_records() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(Vec::new()).await?;
    let cluster = bootstrap(&nodes).await?;
    let err = cluster.create_record(record(0, vec![1.0])).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoNodes));
    assert_eq!(err.to_string(), "No nodes available, try later");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_create_balances_and_lists_in_node_order() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(vec![MemoryNode::new(), MemoryNode::new()]).await?;
    let cluster = bootstrap(&nodes).await?;

    let ids = cluster.create_records(numbered(0, 10)).await?;
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    // Everything landed on node 1, then the first five moved to node 2.
    assert_eq!(nodes.nodes[0].record_ids(), vec![6, 7, 8, 9, 10]);
    assert_eq!(nodes.nodes[1].record_ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(cluster.owners().await.len(), 10);

    let page = cluster.list_records(1, 4).await;
    assert_eq!((page.total, page.pages), (10, 3));
    let listed: Vec<u64> = page.records.iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![6, 7, 8, 9]);

    let page = cluster.list_records(2, 4).await;
    let listed: Vec<u64> = page.records.iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![10, 1, 2, 3]);

    let page = cluster.list_records(3, 4).await;
    let listed: Vec<u64> = page.records.iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![4, 5]);

    let past = cluster.list_records(9, 4).await;
    assert_eq!((past.total, past.pages), (10, 3));
    assert!(past.records.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_find_records_by_meta() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(vec![
        MemoryNode::with_records(vec![
            tagged(1, vec![1.0], &[("color", "red")]),
            tagged(2, vec![2.0], &[("color", "blue")]),
        ]),
        MemoryNode::with_records(vec![
            tagged(3, vec![3.0], &[("color", "red")]),
            record(4, vec![4.0]),
        ]),
    ])
    .await?;
    let cluster = bootstrap(&nodes).await?;

    let found = cluster.find_records("color", "red").await?;
    let ids: Vec<u64> = found.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3]);

    // A key no node indexes is not an error.
    assert!(cluster.find_records("shape", "round").await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_caller_assigned_ids() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(vec![
        MemoryNode::with_records(numbered(1, 3)),
        MemoryNode::new(),
    ])
    .await?;
    let cluster = bootstrap(&nodes).await?;
    let (addr, server) = spawn_orchestrator(cluster.clone()).await?;
    let mut internal = SumInternalServiceClient::connect(format!("http://{}", addr)).await?;

    let taken = internal.create_record_with_id(record(2, vec![9.0])).await?.into_inner();
    assert!(!taken.success);
    assert_eq!(taken.msg, "record 2 already exists.");

    let placed = internal.create_record_with_id(record(100, vec![9.0])).await?.into_inner();
    assert!(placed.success, "{}", placed.msg);
    assert_eq!(placed.msg, "100");

    // Fresh ids continue above the highest caller-assigned one.
    assert_eq!(cluster.create_record(record(0, vec![1.0])).await?, 101);

    let batch: Vec<proto::Record> = numbered(200, 6);
    let resp = internal
        .create_records_with_id(proto::Records { records: batch })
        .await?
        .into_inner();
    assert!(resp.success, "{}", resp.msg);
    for id in 200..206 {
        assert_eq!(cluster.read_record(id).await?.data, vec![id as f32]);
    }
    assert_eq!(cluster.info().await.next_record_id, 206);

    let resp = internal
        .delete_records(proto::RecordIds { ids: vec![1, 200, 999] })
        .await?
        .into_inner();
    assert!(!resp.success);
    assert_eq!(resp.msg, "2");

    let resp = internal
        .delete_records(proto::RecordIds { ids: vec![2, 3] })
        .await?
        .into_inner();
    assert!(resp.success);
    assert_eq!(resp.msg, "2");

    let remaining: usize = nodes.nodes.iter().map(|n| n.record_ids().len()).sum();
    assert_eq!(remaining, 7);
    assert_eq!(cluster.owners().await.len(), 7);

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_info_aggregates_cluster_counters() -> anyhow::Result<()> {
    let nodes = TestNodes::spawn(vec![
        MemoryNode::with_records(numbered(1, 4)),
        MemoryNode::with_records(numbered(5, 4)),
    ])
    .await?;
    let cluster = bootstrap(&nodes).await?;
    cluster
        .create_oracle("noop", "function noop() { return 1; }")
        .await?;

    let info = cluster.info().await;
    assert_eq!(info.records, 8);
    assert_eq!(info.oracles, 1);
    assert_eq!(info.next_record_id, 9);
    assert_eq!(info.next_oracle_id, 2);
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    Ok(())
}
