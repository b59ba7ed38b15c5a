//! AMQP channel provider.
//!
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

mod lapin;

pub use self::lapin::create_connection as create_lapin_connection;
