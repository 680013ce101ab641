pub mod dispatcher;
pub mod sink;
pub mod types;

pub use dispatcher::{DispatchOutcome, NotificationDispatcher, NotificationDispatcherConfig};
pub use sink::{HttpNotificationSink, LogNotificationSink, NotificationSink, NotificationSinkError};

#[cfg(test)]
mod tests;
