pub mod coupon;
pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

pub use entities::{PaymentOrder, RenewalTask, Subscription, Transaction};
pub use errors::{DomainError, DomainResult};
pub use events::{EventType, PaymentEvent};
pub use value_objects::{
    Currency, Money, OrderStatus, OrderType, PayProvider, ProviderNotification,
};
