pub mod broker;
pub mod strategy;

pub use broker::PaperBroker;
pub use strategy::PassiveStrategy;
