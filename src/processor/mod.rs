pub mod chat;
pub mod grouping;
