pub mod rabbitmq;
pub mod topology;
