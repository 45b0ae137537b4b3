pub mod callbacks;
pub mod doctor;
pub mod mail;
pub mod polecat;
pub mod prime;
pub mod queue;
pub mod refinery;
pub mod schema;
pub mod sling;
