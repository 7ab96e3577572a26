pub mod egress_channel;
pub mod history_log;
pub mod mqtt;
pub mod mqtt_egress;

pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use history_log::HistoryLog;
pub use mqtt_egress::MqttPublisher;
