use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::time::Duration;

use chrono::Utc;
use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RunId, SuspensionToken};
use batchflow_infra::collaborators::{InMemoryInferenceService, InMemoryRecordTable};
use batchflow_infra::{
    Collaborators, InMemoryMetadataStore, InMemoryRunStore, MetadataStore, Orchestrator,
};
use batchflow_workflow::{
    Completion, Job, RetryPolicy, RunEvent, RunState, Step, StepBudgets, transition,
};
use tokio::runtime::Runtime;

fn pending_job(run_id: RunId, n: usize) -> Job {
    let now = Utc::now();
    Job::pending(
        run_id,
        Parameter::new("pm25").unwrap(),
        ExternalJobId::new(format!("batch-{n:06}")).unwrap(),
        SuspensionToken::generate(),
        RecordBatchRef::new(format!("retrieved/{n}.csv")).unwrap(),
        now,
        now + chrono::Duration::hours(1),
    )
}

fn bench_state_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine");
    group.sample_size(1000);

    let batch_ref = RecordBatchRef::new("retrieved/pm25.csv").unwrap();
    let output_ref = OutputRef::new("predicted/pm25.csv").unwrap();
    let events = vec![
        RunEvent::Started,
        RunEvent::RecordsFound {
            record_count: 10,
            batch_ref,
        },
        RunEvent::JobSubmitted {
            job_id: ExternalJobId::new("batch-0001").unwrap(),
        },
        RunEvent::JobSucceeded { output_ref },
        RunEvent::ResultsCommitted { records_written: 10 },
    ];

    group.bench_function("happy_path", |b| {
        b.iter(|| {
            let mut state = RunState::default();
            for event in &events {
                state = transition(black_box(&state), black_box(event)).unwrap();
            }
            assert_eq!(state, RunState::Succeeded);
        })
    });

    group.bench_function("rejected_event", |b| {
        let state = RunState::Active(Step::AwaitingCompletion);
        b.iter(|| transition(black_box(&state), black_box(&RunEvent::Started)).is_err())
    });

    group.finish();
}

fn bench_metadata_store(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("metadata_store");

    for pending in [10usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("put_resolve", pending),
            pending,
            |b, &pending| {
                let store = InMemoryMetadataStore::new();
                rt.block_on(async {
                    for n in 0..pending {
                        let run_id = RunId::new();
                        store.put(run_id, pending_job(run_id, n)).await.unwrap();
                    }
                });
                let mut n = pending;
                b.iter(|| {
                    n += 1;
                    let run_id = RunId::new();
                    let job = pending_job(run_id, n);
                    let token = job.suspension_token.clone();
                    rt.block_on(async {
                        store.put(run_id, job).await.unwrap();
                        let completion = Completion::Failure {
                            message: "bench".to_string(),
                        };
                        black_box(store.resolve(&token, &completion).await.unwrap());
                    });
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("list_expired", pending),
            pending,
            |b, &pending| {
                let store = InMemoryMetadataStore::new();
                rt.block_on(async {
                    for n in 0..pending {
                        let run_id = RunId::new();
                        store.put(run_id, pending_job(run_id, n)).await.unwrap();
                    }
                });
                let later = Utc::now() + chrono::Duration::hours(2);
                b.iter(|| rt.block_on(store.list_expired(black_box(later))).unwrap().len())
            },
        );
    }

    group.finish();
}

fn bench_run_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("run_round_trip");
    group.sample_size(200);

    for records in [1usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::new("start_to_succeeded", records), records, |b, &records| {
            b.iter(|| {
                rt.block_on(async {
                    let table = InMemoryRecordTable::arc();
                    let metadata = InMemoryMetadataStore::arc();
                    let orchestrator = Orchestrator::new(
                        InMemoryRunStore::arc(),
                        metadata.clone(),
                        Collaborators {
                            records: table.clone(),
                            inference: InMemoryInferenceService::arc(),
                            writer: table.clone(),
                        },
                        StepBudgets::default(),
                        RetryPolicy::fixed(0, Duration::ZERO),
                    );
                    let parameter = Parameter::new("pm25").unwrap();
                    table.seed(&parameter, records);

                    let run_id = orchestrator.start_run(parameter).await.unwrap();
                    let run = orchestrator.run(run_id).await.unwrap();
                    let job = metadata.get(run_id).await.unwrap().unwrap();
                    let output_ref = table.predict(run.record_batch_ref.as_ref().unwrap()).unwrap();
                    metadata
                        .resolve(&job.suspension_token, &Completion::Success { output_ref })
                        .await
                        .unwrap();
                    let run = orchestrator.resume(run_id).await.unwrap();
                    assert_eq!(run.state, RunState::Succeeded);
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_state_machine,
    bench_metadata_store,
    bench_run_round_trip
);
criterion_main!(benches);

