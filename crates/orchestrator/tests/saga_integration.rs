//! Integration tests for the order fulfillment saga running on the host.

use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationKey, CustomerId, Money};
use contracts::addresses::{CREDIT_CHECK_QUEUE, PAYMENT_REFUND_QUEUE};
use contracts::{Initiate, Message, MessageEnvelope, MessageKind, ShippingCompleted};
use orchestrator::capabilities::{
    CreditBehavior, SimulatedCreditCheck, SimulatedInventory, SimulatedPayment, SimulatedShipping,
    serve,
};
use orchestrator::{
    ForwardStep, IgnoreReason, InMemoryBus, InMemoryNotifier, Notification, OrchestratorConfig,
    OrderSaga, OrderState, Outcome, RetryPolicy, SagaHost,
};
use saga_store::{InMemorySagaStore, SagaStore};
use tokio::task::JoinHandle;

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        credit_check_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy::fixed(3, Duration::from_millis(10)),
        relay_poll_interval: Duration::from_millis(50),
        redelivery_delay: Duration::from_millis(10),
        ..OrchestratorConfig::default()
    }
}

struct TestHarness {
    host: SagaHost<InMemorySagaStore>,
    store: InMemorySagaStore,
    bus: InMemoryBus,
    credit: SimulatedCreditCheck,
    payment: SimulatedPayment,
    inventory: SimulatedInventory,
    shipping: SimulatedShipping,
    notifier: InMemoryNotifier,
    _capabilities: Vec<JoinHandle<()>>,
}

impl TestHarness {
    async fn new() -> Self {
        Self::build(fast_config(), true, InMemorySagaStore::new()).await
    }

    async fn with_config(config: OrchestratorConfig) -> Self {
        Self::build(config, true, InMemorySagaStore::new()).await
    }

    /// A harness where nothing consumes the shipping queue.
    async fn without_shipping() -> Self {
        Self::build(fast_config(), false, InMemorySagaStore::new()).await
    }

    async fn build(config: OrchestratorConfig, with_shipping: bool, store: InMemorySagaStore) -> Self {
        let bus = InMemoryBus::new();
        let credit = SimulatedCreditCheck::new();
        let payment = SimulatedPayment::new();
        let inventory = SimulatedInventory::new();
        let shipping = SimulatedShipping::new();
        let notifier = InMemoryNotifier::new();

        let mut capabilities = serve(credit.clone(), &bus);
        capabilities.extend(serve(payment.clone(), &bus));
        capabilities.extend(serve(inventory.clone(), &bus));
        if with_shipping {
            capabilities.extend(serve(shipping.clone(), &bus));
        }

        let host = SagaHost::start(
            store.clone(),
            bus.clone(),
            config,
            Arc::new(notifier.clone()),
        )
        .await
        .unwrap();

        Self {
            host,
            store,
            bus,
            credit,
            payment,
            inventory,
            shipping,
            notifier,
            _capabilities: capabilities,
        }
    }

    async fn submit(&self, amount: Money, digital_only: bool) -> CorrelationKey {
        let key = CorrelationKey::new();
        let initiate = Initiate::new(key, CustomerId::new(), amount, digital_only);
        self.host
            .submit(&MessageEnvelope::new(Message::Initiate(initiate)))
            .await
            .unwrap();
        key
    }

    async fn load(&self, key: CorrelationKey) -> Option<OrderSaga> {
        self.host.engine().load(key).await.unwrap()
    }

    /// Waits until the saga reaches the given state.
    async fn wait_for(&self, key: CorrelationKey, state: OrderState) -> OrderSaga {
        for _ in 0..500 {
            if let Some(saga) = self.load(key).await {
                if saga.state == state {
                    return saga;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "saga {key} never reached {state}, last seen {:?}",
            self.load(key).await.map(|s| s.state)
        );
    }

    async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn published_for(&self, key: CorrelationKey, kind: MessageKind) -> usize {
        self.bus
            .published()
            .iter()
            .filter(|e| e.correlation_key == key && e.payload.kind() == kind)
            .count()
    }
}

#[tokio::test]
async fn test_happy_path_physical_order() {
    let h = TestHarness::new().await;
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Completed).await;
    assert_eq!(saga.payment_reference.as_deref(), Some("PAY-0001"));
    assert_eq!(
        saga.completed_steps,
        vec![ForwardStep::Payment, ForwardStep::Inventory]
    );
    assert!(saga.failure_reason.is_none());

    assert_eq!(h.credit.request_count(), 1);
    assert_eq!(h.payment.payment_count(), 1);
    assert_eq!(h.inventory.reservation_count(), 1);
    assert_eq!(h.shipping.shipment_count(), 1);

    h.wait_until(|| h.published_for(key, MessageKind::TransactionConfirmed) == 1)
        .await;
    // Let further relay polls run; the confirmation must not repeat
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.published_for(key, MessageKind::TransactionConfirmed), 1);
    assert_eq!(h.published_for(key, MessageKind::TransactionFailed), 0);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_happy_path_digital_order_skips_shipping() {
    let h = TestHarness::new().await;
    let key = h.submit(Money::from_dollars(200), true).await;

    h.wait_for(key, OrderState::Completed).await;
    h.wait_until(|| h.published_for(key, MessageKind::TransactionConfirmed) == 1)
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.published_for(key, MessageKind::TransactionConfirmed), 1);
    assert_eq!(h.published_for(key, MessageKind::DigitalDelivery), 1);
    assert_eq!(h.shipping.shipment_count(), 0);
}

#[tokio::test]
async fn test_credit_decline_fails_without_payment() {
    let h = TestHarness::new().await;
    h.credit
        .set_behavior(CreditBehavior::Decline(Some("limit exceeded".to_string())));
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    assert_eq!(
        saga.failure_reason.as_deref(),
        Some("Credit check declined by agency: limit exceeded")
    );
    assert_eq!(h.payment.payment_count(), 0);

    h.wait_until(|| h.published_for(key, MessageKind::TransactionFailed) == 1)
        .await;
}

#[tokio::test]
async fn test_credit_fault_fails_with_detail() {
    let h = TestHarness::new().await;
    h.credit
        .set_behavior(CreditBehavior::Fault("agency unreachable".to_string()));
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    assert_eq!(
        saga.failure_reason.as_deref(),
        Some("Credit check service faulted: agency unreachable")
    );
}

#[tokio::test]
async fn test_inventory_failure_refunds_payment() {
    let h = TestHarness::new().await;
    h.inventory.set_fail_on_reserve(true);
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    assert_eq!(saga.failure_reason.as_deref(), Some("Insufficient stock"));
    assert_eq!(saga.compensations, vec![ForwardStep::Payment]);

    h.wait_until(|| h.payment.refund_count() == 1).await;
    assert_eq!(h.inventory.release_count(), 0);
    assert_eq!(h.shipping.shipment_count(), 0);
}

#[tokio::test]
async fn test_payment_failure_needs_no_compensation() {
    let h = TestHarness::new().await;
    h.payment.set_fail_on_charge(true);
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    assert_eq!(saga.failure_reason.as_deref(), Some("Payment declined"));
    assert!(saga.compensations.is_empty());
    assert_eq!(h.inventory.reservation_count(), 0);
}

#[tokio::test]
async fn test_credit_timeout_and_late_response() {
    let config = OrchestratorConfig {
        credit_check_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let h = TestHarness::with_config(config).await;
    h.credit.set_behavior(CreditBehavior::Silent);
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    assert_eq!(saga.failure_reason.as_deref(), Some("Credit check timed out"));
    assert!(h.store.pending_request(key, "credit_check").await.unwrap().is_none());

    // The agency finally answers the original request
    let request = h
        .bus
        .sent_to(CREDIT_CHECK_QUEUE)
        .into_iter()
        .find(|e| e.correlation_key == key)
        .unwrap();
    let late = request.reply(Message::credit_check_result(key, true, None));
    let outcome = h.host.engine().handle(&late).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Ignored(IgnoreReason::Terminal(OrderState::Failed))
    );

    let after = h.load(key).await.unwrap();
    assert_eq!(after.version, saga.version);
    h.wait_until(|| h.published_for(key, MessageKind::TransactionFailed) == 1)
        .await;
    assert_eq!(h.payment.payment_count(), 0);
}

#[tokio::test]
async fn test_redelivered_initiate_is_processed_once() {
    let h = TestHarness::new().await;
    h.credit.set_behavior(CreditBehavior::Silent);

    let key = CorrelationKey::new();
    let envelope = MessageEnvelope::new(Message::Initiate(Initiate::new(
        key,
        CustomerId::new(),
        Money::from_dollars(200),
        false,
    )));
    h.host.submit(&envelope).await.unwrap();
    h.host.submit(&envelope).await.unwrap();

    let saga = h.wait_for(key, OrderState::CreditChecking).await;
    h.wait_until(|| h.credit.request_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.credit.request_count(), 1);
    assert_eq!(h.load(key).await.unwrap().version, saga.version);
    assert_eq!(h.store.outbox_for(key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_completed_saga_absorbs_late_messages() {
    let h = TestHarness::new().await;
    let key = h.submit(Money::from_dollars(200), false).await;
    let saga = h.wait_for(key, OrderState::Completed).await;

    let stray = MessageEnvelope::new(Message::ShippingCompleted(ShippingCompleted {
        correlation_key: key,
    }));
    assert_eq!(
        h.host.engine().handle(&stray).await.unwrap(),
        Outcome::Ignored(IgnoreReason::Terminal(OrderState::Completed))
    );
    assert_eq!(h.load(key).await.unwrap().version, saga.version);
}

#[tokio::test]
async fn test_many_orders_run_concurrently() {
    let h = TestHarness::new().await;

    let mut keys = Vec::new();
    for i in 0..20 {
        keys.push(h.submit(Money::from_dollars(100 + i), i % 2 == 0).await);
    }
    for key in &keys {
        h.wait_for(*key, OrderState::Completed).await;
    }

    assert_eq!(h.payment.payment_count(), 20);
    assert_eq!(h.inventory.reservation_count(), 20);
    assert_eq!(h.shipping.shipment_count(), 10);
}

#[tokio::test]
async fn test_undeliverable_shipping_fails_and_compensates() {
    let h = TestHarness::without_shipping().await;
    let key = h.submit(Money::from_dollars(200), false).await;

    let saga = h.wait_for(key, OrderState::Failed).await;
    let reason = saga.failure_reason.unwrap();
    assert!(
        reason.starts_with("InitiateShipping could not be delivered after 3 attempts"),
        "unexpected reason: {reason}"
    );
    assert_eq!(
        saga.compensations,
        vec![ForwardStep::Inventory, ForwardStep::Payment]
    );

    h.wait_until(|| h.inventory.release_count() == 1 && h.payment.refund_count() == 1)
        .await;

    let dead = h.store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_type, "InitiateShipping");
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test]
async fn test_undeliverable_compensation_is_dead_lettered() {
    let h = TestHarness::new().await;
    h.inventory.set_fail_on_reserve(true);
    // Replace the refund consumer with a closed queue
    drop(h.bus.queue(PAYMENT_REFUND_QUEUE));

    let key = h.submit(Money::from_dollars(200), false).await;
    h.wait_for(key, OrderState::Failed).await;

    for _ in 0..500 {
        if !h.store.dead_letters().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let dead = h.store.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_type, "RefundPayment");
    assert_eq!(dead[0].correlation_key, key);

    // The saga stays failed; nothing re-enters it
    assert_eq!(h.load(key).await.unwrap().state, OrderState::Failed);
    assert_eq!(h.payment.refund_count(), 0);
}

#[tokio::test]
async fn test_high_value_order_notifies() {
    let h = TestHarness::new().await;
    let key = h.submit(Money::from_dollars(1500), false).await;

    h.wait_for(key, OrderState::Completed).await;
    h.wait_until(|| !h.notifier.sent().is_empty()).await;

    assert_eq!(
        h.notifier.sent(),
        vec![Notification::HighValueOrder {
            correlation_key: key,
            amount: Money::from_dollars(1500),
            threshold: Money::from_dollars(1000),
        }]
    );
}

#[tokio::test]
async fn test_pending_timers_recovered_on_restart() {
    let config = OrchestratorConfig {
        credit_check_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let store = InMemorySagaStore::new();

    let first = TestHarness::build(config.clone(), true, store.clone()).await;
    first.credit.set_behavior(CreditBehavior::Silent);
    let key = first.submit(Money::from_dollars(200), false).await;
    first.wait_for(key, OrderState::CreditChecking).await;
    first.host.shutdown().await;

    // A fresh host over the same store re-arms the deadline
    let second = TestHarness::build(config, true, store.clone()).await;
    let saga = second.wait_for(key, OrderState::Failed).await;
    assert_eq!(saga.failure_reason.as_deref(), Some("Credit check timed out"));
}
