//! Declarative state machine for the order fulfillment saga.
//!
//! The model is a pure table keyed by `(OrderState, MessageKind)`. Each entry
//! holds an ordered list of guarded alternatives; the first alternative whose
//! guard passes wins. Evaluating a message never touches storage or the
//! transport: it returns the next state, the mutated saga and the effects
//! the engine must stage.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use common::Money;
use contracts::addresses::{CREDIT_CHECK_QUEUE, INVENTORY_QUEUE, PAYMENT_QUEUE, SHIPPING_QUEUE};
use contracts::{
    CreditCheckRequest, DigitalDelivery, InitiateShipping, Message, MessageKind, ProcessPayment,
    ReserveInventory,
};
use saga_store::RetryPolicy;

use crate::compensation::{CompensationController, ForwardStep};
use crate::config::OrchestratorConfig;
use crate::instance::OrderSaga;
use crate::notification::Notification;
use crate::request::RequestSlot;
use crate::state::OrderState;

/// Something a transition asks the engine to do once it commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish an event to every subscriber.
    Publish(Message),
    /// Send a command point-to-point, optionally with a retry policy.
    Send {
        address: String,
        message: Message,
        retry: Option<RetryPolicy>,
    },
    /// Send a request and wait for its response, fault, or deadline.
    Request {
        slot: RequestSlot,
        address: String,
        message: Message,
        timeout: Duration,
    },
    /// Fire a side-channel notification.
    Notify(Notification),
}

/// Settings the transition actions read.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub high_value_threshold: Money,
    pub credit_check_timeout: Duration,
    /// Policy attached to forward commands.
    pub retry_policy: RetryPolicy,
    pub compensation: CompensationController,
}

impl TransitionContext {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            high_value_threshold: config.high_value_threshold,
            credit_check_timeout: config.credit_check_timeout,
            retry_policy: config.retry_policy.clone(),
            compensation: CompensationController::new(config.retry_policy.clone()),
        }
    }
}

impl Default for TransitionContext {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

type Guard = fn(&OrderSaga, &Message) -> bool;
type Action = fn(&mut OrderSaga, &Message, &TransitionContext) -> Vec<Effect>;

/// One guarded alternative of a table entry.
#[derive(Clone)]
struct Transition {
    name: &'static str,
    guard: Guard,
    action: Action,
    next: OrderState,
}

/// The result of evaluating a message that matched a transition.
#[derive(Debug, Clone)]
pub struct Step {
    /// Name of the transition that fired.
    pub transition: &'static str,
    pub from: OrderState,
    pub to: OrderState,
    /// The saga after the transition, in state `to`.
    pub saga: OrderSaga,
    pub effects: Vec<Effect>,
}

/// Transition table of the order fulfillment saga.
pub struct StateMachine {
    table: HashMap<(OrderState, MessageKind), Vec<Transition>>,
    context: TransitionContext,
}

impl StateMachine {
    /// Builds the order fulfillment transition table.
    #[rustfmt::skip]
    pub fn new(context: TransitionContext) -> Self {
        use MessageKind as K;
        use OrderState as S;

        let mut machine = Self {
            table: HashMap::new(),
            context,
        };

        machine.on(S::Submitted, K::Initiate, "initiate", always, initiate, S::CreditChecking);

        machine.on(S::CreditChecking, K::CreditCheckResult, "credit_approved", credit_approved, process_payment, S::PaymentProcessing);
        machine.on(S::CreditChecking, K::CreditCheckResult, "credit_declined", credit_declined, credit_declined_failure, S::Failed);
        machine.on(S::CreditChecking, K::CreditCheckFault, "credit_faulted", always, credit_fault_failure, S::Failed);
        machine.on(S::CreditChecking, K::CreditCheckTimedOut, "credit_timed_out", always, credit_timeout_failure, S::Failed);

        machine.on(S::PaymentProcessing, K::PaymentProcessed, "payment_processed", always, reserve_inventory, S::InventoryReservation);
        machine.on(S::PaymentProcessing, K::PaymentFailed, "payment_failed", always, payment_failure, S::Failed);
        machine.on(S::PaymentProcessing, K::RetriesExhausted, "payment_undeliverable", exhausted_process_payment, exhausted_failure, S::Failed);

        machine.on(S::InventoryReservation, K::InventoryReserved, "digital_delivery", digital_only, deliver_digitally, S::Completed);
        machine.on(S::InventoryReservation, K::InventoryReserved, "inventory_reserved", physical, initiate_shipping, S::ShippingProcessing);
        machine.on(S::InventoryReservation, K::InventoryReservationFailed, "inventory_failed", always, inventory_failure, S::Failed);
        machine.on(S::InventoryReservation, K::RetriesExhausted, "inventory_undeliverable", exhausted_reserve_inventory, exhausted_failure, S::Failed);

        machine.on(S::ShippingProcessing, K::ShippingCompleted, "shipping_completed", always, confirm, S::Completed);
        machine.on(S::ShippingProcessing, K::RetriesExhausted, "shipping_undeliverable", exhausted_initiate_shipping, exhausted_failure, S::Failed);

        machine
    }

    /// Builds the table with settings taken from the configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(TransitionContext::from_config(config))
    }

    fn on(
        &mut self,
        state: OrderState,
        kind: MessageKind,
        name: &'static str,
        guard: Guard,
        action: Action,
        next: OrderState,
    ) {
        self.table.entry((state, kind)).or_default().push(Transition {
            name,
            guard,
            action,
            next,
        });
    }

    /// Evaluates a message against the saga's current state.
    ///
    /// Returns None when no alternative applies; the caller acknowledges the
    /// message as a no-op.
    pub fn evaluate(&self, saga: &OrderSaga, message: &Message) -> Option<Step> {
        let alternatives = self.table.get(&(saga.state, message.kind()))?;
        let transition = alternatives.iter().find(|t| (t.guard)(saga, message))?;

        let mut next = saga.clone();
        let effects = (transition.action)(&mut next, message, &self.context);
        next.state = transition.next;

        Some(Step {
            transition: transition.name,
            from: saga.state,
            to: transition.next,
            saga: next,
            effects,
        })
    }

    /// Returns true if the table has any entry for the pair.
    pub fn handles(&self, state: OrderState, kind: MessageKind) -> bool {
        self.table.contains_key(&(state, kind))
    }

    /// Message kinds the saga consumes, excluding synthetic ones.
    pub fn inbound_kinds(&self) -> Vec<MessageKind> {
        let mut kinds: Vec<MessageKind> = self
            .table
            .keys()
            .map(|(_, kind)| *kind)
            .filter(|kind| {
                !matches!(
                    kind,
                    MessageKind::CreditCheckTimedOut | MessageKind::RetriesExhausted
                )
            })
            .collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds.dedup();
        kinds
    }

    pub fn context(&self) -> &TransitionContext {
        &self.context
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(TransitionContext::default())
    }
}

/// Returns true for forward commands whose exhausted delivery must fail the
/// saga through a `RetriesExhausted` event.
pub fn reports_exhaustion(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::ProcessPayment | MessageKind::ReserveInventory | MessageKind::InitiateShipping
    )
}

// Guards

fn always(_: &OrderSaga, _: &Message) -> bool {
    true
}

fn credit_approved(_: &OrderSaga, message: &Message) -> bool {
    matches!(message, Message::CreditCheckResult(result) if result.approved)
}

fn credit_declined(_: &OrderSaga, message: &Message) -> bool {
    matches!(message, Message::CreditCheckResult(result) if !result.approved)
}

fn digital_only(saga: &OrderSaga, _: &Message) -> bool {
    saga.digital_only
}

fn physical(saga: &OrderSaga, _: &Message) -> bool {
    !saga.digital_only
}

fn exhausted(message: &Message, command: MessageKind) -> bool {
    matches!(message, Message::RetriesExhausted(e) if e.message_type == command.as_str())
}

fn exhausted_process_payment(_: &OrderSaga, message: &Message) -> bool {
    exhausted(message, MessageKind::ProcessPayment)
}

fn exhausted_reserve_inventory(_: &OrderSaga, message: &Message) -> bool {
    exhausted(message, MessageKind::ReserveInventory)
}

fn exhausted_initiate_shipping(_: &OrderSaga, message: &Message) -> bool {
    exhausted(message, MessageKind::InitiateShipping)
}

// Actions

fn initiate(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let Message::Initiate(cmd) = message else {
        return Vec::new();
    };

    saga.customer_id = Some(cmd.customer_id);
    saga.amount = cmd.amount;
    saga.digital_only = cmd.digital_only;
    saga.item_ids = cmd.item_ids.clone();
    saga.submitted_at = Some(Utc::now());

    let mut effects = vec![Effect::Request {
        slot: RequestSlot::CreditCheck,
        address: CREDIT_CHECK_QUEUE.to_string(),
        message: Message::CreditCheckRequest(CreditCheckRequest {
            correlation_key: saga.correlation_key,
            customer_id: cmd.customer_id,
            amount: cmd.amount,
        }),
        timeout: ctx.credit_check_timeout,
    }];

    if cmd.amount > ctx.high_value_threshold {
        effects.push(Effect::Notify(Notification::HighValueOrder {
            correlation_key: saga.correlation_key,
            amount: cmd.amount,
            threshold: ctx.high_value_threshold,
        }));
    }
    effects
}

fn process_payment(saga: &mut OrderSaga, _: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    vec![Effect::Send {
        address: PAYMENT_QUEUE.to_string(),
        message: Message::ProcessPayment(ProcessPayment {
            correlation_key: saga.correlation_key,
            amount: saga.amount,
        }),
        retry: Some(ctx.retry_policy.clone()),
    }]
}

fn reserve_inventory(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    if let Message::PaymentProcessed(processed) = message {
        saga.payment_reference = Some(processed.reference.clone());
    }
    saga.complete_step(ForwardStep::Payment);

    vec![Effect::Send {
        address: INVENTORY_QUEUE.to_string(),
        message: Message::ReserveInventory(ReserveInventory {
            correlation_key: saga.correlation_key,
            item_ids: saga.item_ids.clone(),
        }),
        retry: Some(ctx.retry_policy.clone()),
    }]
}

fn deliver_digitally(saga: &mut OrderSaga, _: &Message, _: &TransitionContext) -> Vec<Effect> {
    saga.complete_step(ForwardStep::Inventory);
    vec![
        Effect::Publish(Message::DigitalDelivery(DigitalDelivery {
            correlation_key: saga.correlation_key,
        })),
        Effect::Publish(Message::transaction_confirmed(saga.correlation_key)),
    ]
}

fn initiate_shipping(saga: &mut OrderSaga, _: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    saga.complete_step(ForwardStep::Inventory);
    vec![Effect::Send {
        address: SHIPPING_QUEUE.to_string(),
        message: Message::InitiateShipping(InitiateShipping {
            correlation_key: saga.correlation_key,
        }),
        retry: Some(ctx.retry_policy.clone()),
    }]
}

fn confirm(saga: &mut OrderSaga, _: &Message, _: &TransitionContext) -> Vec<Effect> {
    vec![Effect::Publish(Message::transaction_confirmed(
        saga.correlation_key,
    ))]
}

/// Records the reason, announces the failure and compensates completed steps.
fn fail(saga: &mut OrderSaga, reason: String, ctx: &TransitionContext) -> Vec<Effect> {
    let mut effects = vec![Effect::Publish(Message::transaction_failed(
        saga.correlation_key,
        reason.clone(),
    ))];
    saga.failure_reason = Some(reason);
    effects.extend(ctx.compensation.plan(saga));
    effects
}

fn non_empty_or(reason: &str, fallback: &str) -> String {
    if reason.trim().is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

fn credit_declined_failure(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let reason = match message {
        Message::CreditCheckResult(result) => match result.reason.as_deref() {
            Some(detail) if !detail.trim().is_empty() => {
                format!("Credit check declined by agency: {detail}")
            }
            _ => "Credit check declined by agency".to_string(),
        },
        _ => "Credit check declined by agency".to_string(),
    };
    fail(saga, reason, ctx)
}

fn credit_fault_failure(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let detail = match message {
        Message::CreditCheckFault(fault) => fault.message.as_str(),
        _ => "unknown fault",
    };
    fail(saga, format!("Credit check service faulted: {detail}"), ctx)
}

fn credit_timeout_failure(saga: &mut OrderSaga, _: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    fail(saga, "Credit check timed out".to_string(), ctx)
}

fn payment_failure(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let reason = match message {
        Message::PaymentFailed(failed) => non_empty_or(&failed.reason, "Payment failed"),
        _ => "Payment failed".to_string(),
    };
    fail(saga, reason, ctx)
}

fn inventory_failure(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let reason = match message {
        Message::InventoryReservationFailed(failed) => {
            non_empty_or(&failed.reason, "Inventory reservation failed")
        }
        _ => "Inventory reservation failed".to_string(),
    };
    fail(saga, reason, ctx)
}

fn exhausted_failure(saga: &mut OrderSaga, message: &Message, ctx: &TransitionContext) -> Vec<Effect> {
    let reason = match message {
        Message::RetriesExhausted(e) => format!(
            "{} could not be delivered after {} attempts: {}",
            e.message_type, e.attempts, e.reason
        ),
        _ => "Command could not be delivered".to_string(),
    };
    fail(saga, reason, ctx)
}
