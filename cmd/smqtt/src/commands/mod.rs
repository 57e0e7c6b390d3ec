//! CLI commands module.

mod broker;
mod publish;
mod subscribe;
mod util;

pub use broker::BrokerCommand;
pub use publish::PublishCommand;
pub use subscribe::SubscribeCommand;

pub(crate) use util::*;
