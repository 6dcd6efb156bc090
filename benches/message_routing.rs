//! Benchmarks for the hot paths of task delegation: agent selection over
//! the live registry (C3) and the broker's pending-queue round trip (C1).

use std::collections::BTreeSet;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use delegate_engine::config::EngineConfig;
use delegate_engine::domain::{
    AgentId, AgentRegistration, Capability, ConnectionId, MaxConcurrentTasks, NewTaskRequest,
    RoutingContext, Task, TaskId, TaskPriority, Timestamp,
};
use delegate_engine::registry::{Registry, SelectionCriteria};
use delegate_engine::store::{Broker, SqliteBroker};
use tokio::runtime::Runtime;

fn populate_registry(registry: &Registry, count: usize) -> Vec<AgentId> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let agent_id = AgentId::generate();
        let mut capabilities = BTreeSet::new();
        capabilities.insert(Capability::try_new("render".to_string()).unwrap());
        if i % 3 == 0 {
            capabilities.insert(Capability::try_new("gpu".to_string()).unwrap());
        }
        registry
            .register(
                agent_id,
                ConnectionId::generate(),
                AgentRegistration {
                    name: format!("agent-{i}"),
                    version: "1.0.0".to_string(),
                    capabilities,
                    max_concurrent_tasks: MaxConcurrentTasks::try_new(4).unwrap(),
                    description: None,
                    tags: vec![],
                },
            )
            .unwrap();
        ids.push(agent_id);
    }
    ids
}

fn bench_find_best_agent(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_find_best_agent");
    for &count in &[10usize, 100, 1_000] {
        let registry = Registry::new();
        populate_registry(&registry, count);
        let criteria = SelectionCriteria {
            required_capabilities: [Capability::try_new("render".to_string()).unwrap()].into_iter().collect(),
            require_all: true,
        };
        let ctx = RoutingContext {
            now: Timestamp::now(),
            heartbeat_interval_ms: 30_000,
        };

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| registry.find_best_agent(&criteria, ctx));
        });
    }
    group.finish();
}

fn bench_pending_queue_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broker_pending_queue");

    for &count in &[10u32, 100, 500] {
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter_batched_ref(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    let mut config = EngineConfig::testing();
                    config.store_database_path = dir.path().join("bench.db");
                    (dir, config)
                },
                |(_dir, config)| async move {
                    let broker = SqliteBroker::connect(config).await.unwrap();
                    for i in 0..count {
                        let task = Task::try_new(
                            TaskId::generate(),
                            NewTaskRequest {
                                name: format!("task-{i}"),
                                priority: Some(TaskPriority::try_new((i % 10) as i32).unwrap()),
                                ..Default::default()
                            },
                        )
                        .unwrap();
                        broker.publish_task_request(&task).await.unwrap();
                    }
                    broker.get_pending_tasks(count).await.unwrap()
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_find_best_agent, bench_pending_queue_round_trip);
criterion_main!(benches);
