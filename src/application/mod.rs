pub mod dto;
pub mod event_bus;
pub mod lifecycle_service;
pub mod payment_service;
pub mod renewal_scheduler;

pub use dto::{
    CreatePaymentRequest, CreateRefundRequest, ErrorResponse, PaymentResponse,
    RefundResponse, RenewalTaskResponse, TaskFilter,
};
pub use event_bus::{EventBus, EventFilter, HandlerId};
pub use lifecycle_service::LifecycleService;
pub use payment_service::PaymentService;
pub use renewal_scheduler::{RenewalConfig, RenewalScheduler};
