use std::sync::Arc;

use common::{CorrelationKey, CustomerId, Money};
use contracts::{Initiate, Message, MessageEnvelope};
use criterion::{Criterion, criterion_group, criterion_main};
use orchestrator::{
    Engine, InMemoryNotifier, OrchestratorConfig, OrderSaga, OrderState, RequestCoordinator,
    StateMachine,
};
use saga_store::InMemorySagaStore;
use tokio::sync::{Notify, mpsc};

fn make_initiate(key: CorrelationKey) -> Message {
    Message::Initiate(Initiate::new(
        key,
        CustomerId::new(),
        Money::from_dollars(200),
        false,
    ))
}

fn bench_evaluate_transition(c: &mut Criterion) {
    let machine = StateMachine::default();
    let mut saga = OrderSaga::new(CorrelationKey::new());
    saga.state = OrderState::CreditChecking;
    let approved = Message::credit_check_result(saga.correlation_key, true, None);

    c.bench_function("machine/evaluate_credit_approved", |b| {
        b.iter(|| machine.evaluate(&saga, &approved).unwrap());
    });
}

fn bench_handle_initiate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("engine/handle_initiate", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let (tx, _rx) = mpsc::channel(16);
                let engine = Engine::new(
                    store.clone(),
                    &OrchestratorConfig::default(),
                    RequestCoordinator::new(store, tx),
                    Arc::new(InMemoryNotifier::new()),
                    Arc::new(Notify::new()),
                );
                let envelope = MessageEnvelope::new(make_initiate(CorrelationKey::new()));
                engine.handle(&envelope).await.unwrap();
            });
        });
    });
}

fn bench_handle_duplicate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();
    let (tx, _rx) = mpsc::channel(16);
    let engine = Engine::new(
        store.clone(),
        &OrchestratorConfig::default(),
        RequestCoordinator::new(store, tx),
        Arc::new(InMemoryNotifier::new()),
        Arc::new(Notify::new()),
    );
    let envelope = MessageEnvelope::new(make_initiate(CorrelationKey::new()));
    rt.block_on(async {
        engine.handle(&envelope).await.unwrap();
    });

    c.bench_function("engine/handle_duplicate", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.handle(&envelope).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_evaluate_transition,
    bench_handle_initiate,
    bench_handle_duplicate
);
criterion_main!(benches);
