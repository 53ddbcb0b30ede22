//! These models represent the objects passed around by the agent runtime
//!
//! - messages, the nodes of an agent's causal history
//! - client requests and server responses, exchanged with the transport
//!
//! Messages are content addressed: the id is derived from the text, so two replies with the
//! same content collapse into one history node that may answer several requests.
pub mod message;
pub mod request;
pub mod role;
