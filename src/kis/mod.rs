pub mod broker;
pub mod rest;
pub mod ws;

pub use broker::{KisOrderAdapter, KisPortfolioProvider, KisStatusProvider};
pub use rest::KisRestClient;
pub use ws::KisWsClient;
