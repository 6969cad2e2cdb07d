pub mod error;
pub mod gateway;
pub mod worker;

pub use error::{DeliveryError, Result};
pub use gateway::{GatewayError, OutboundGateway, SendReceipt};
pub use worker::{DeliveryReport, DeliveryWorker};
