//! Subscription Engine
//!
//! Recurring crypto billing: plans, subscriptions, the periodic billing
//! sweep state machine, trial handling, and settlement bookkeeping.

pub mod interval;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use models::{
    BillingInterval, NewPlan, NewSubscription, Plan, PlanChanges, Subscription,
    SubscriptionPayment, SubscriptionPaymentStatus, SubscriptionStats, SubscriptionStatus,
    SweepReport,
};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use service::{ChargeRequest, EngineConfig, PaymentPort, SubscriptionEngine};
pub use storage::{BillingStore, MemoryBillingStore, RedisBillingStore};
