pub mod dispatch;
pub mod queue;
pub mod reconcile;

pub use dispatch::DispatchWorker;
pub use queue::OrderQueue;
pub use reconcile::ReconciliationEngine;
