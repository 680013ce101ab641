pub mod guard;
pub mod reviews;
pub mod service;
pub mod store;
pub mod types;

pub use guard::OfferIntakeGuard;
pub use reviews::ReviewLinker;
pub use service::{ContractError, ContractLifecycleManager};
