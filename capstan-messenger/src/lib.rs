//! Capstan messenger
//!
//! A bidirectional message-correlation layer over an abstract duplex
//! connection. Both master and worker speak through it: requests block the
//! caller until the peer responds, updates are fire-and-forget, and disposal
//! resolves every outstanding exchange with a cancellation error so no caller
//! ever hangs on a dead connection.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use capstan_messenger::{Messenger, connection::TcpConnection, NullHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), capstan_messenger::MessengerError> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:7700").await?;
//!     let connection = Arc::new(TcpConnection::new(stream));
//!     let messenger = Messenger::new(connection, Arc::new(NullHandler));
//!
//!     let pump = messenger.clone();
//!     tokio::spawn(async move { pump.run().await });
//!
//!     let reply = messenger.send_request(serde_json::json!({"command": "describe"})).await?;
//!     println!("peer says: {reply}");
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod envelope;
pub mod error;
mod messenger;

pub use connection::Connection;
pub use envelope::{Envelope, MessageKind};
pub use error::{MessengerError, Result};
pub use messenger::{MessageHandler, Messenger, NullHandler};
