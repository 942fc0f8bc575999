//! User-space WireGuard endpoint
//!
//! The device terminates on the in-process network stack on one side
//! (plaintext IP packets over the link endpoint) and an OS UDP socket on the
//! other (ciphertext datagrams). Configuration is applied with the
//! newline-delimited `ipc_set` key=value protocol.

pub mod cookie;
pub mod device;
pub mod handshake;
pub mod messages;
pub mod peer;
pub mod timers;
pub mod transport;

pub use device::{Device, DeviceConfig};
pub use handshake::{HandshakeOutcome, InitiatorHandshake};
pub use messages::{CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader};
pub use transport::{ReplayWindow, Session};
