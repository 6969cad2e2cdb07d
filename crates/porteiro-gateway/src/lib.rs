pub mod app;
pub mod flusher;
pub mod http;
pub mod ingress;

pub use app::AppState;
pub use ingress::IngressOutcome;
