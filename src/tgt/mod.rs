//! Ticket-granting tickets: the SSO session shared across requestors.

pub mod store;
pub mod types;

pub use store::TgtStore;
pub use types::{
    AttributeMap, AttributeValue, AuthnProfileEntry, Owner, TicketAttributes, TicketGrantingTicket,
    TicketId,
};
